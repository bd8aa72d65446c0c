//! Office Open XML documents: Word (`.docx`) and Excel (`.xlsx`).

use std::io::{Cursor, Read};

use calamine::{Data, Reader, Xlsx, open_workbook_from_rs};
use quick_xml::Reader as XmlReader;
use quick_xml::events::{BytesStart, Event};
use tracing::{debug, info};
use zip::ZipArchive;

use super::document::{DocumentExtractor, EmbeddedImage, ExtractedDocument, rows_to_table};
use super::extension;
use crate::error::ExtractError;

pub const DOCX: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

const DOCUMENT_PART: &str = "word/document.xml";
const MEDIA_PREFIX: &str = "word/media/";

fn corrupt(media_type: &str, reason: impl ToString) -> ExtractError {
    ExtractError::Corrupt {
        media_type: media_type.to_string(),
        reason: reason.to_string(),
    }
}

/// Word documents: headings become `#`..`###`, list paragraphs `- `, and
/// tables pipe rows. Pictures under `word/media/` come back as embedded
/// images.
#[derive(Debug, Default, Clone)]
pub struct DocxExtractor;

impl DocumentExtractor for DocxExtractor {
    fn extract(&self, bytes: &[u8], _media_type: &str) -> Result<ExtractedDocument, ExtractError> {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(|e| corrupt(DOCX, e))?;

        let mut xml = String::new();
        archive
            .by_name(DOCUMENT_PART)
            .map_err(|e| corrupt(DOCX, format!("{DOCUMENT_PART}: {e}")))?
            .read_to_string(&mut xml)
            .map_err(|e| corrupt(DOCX, e))?;
        let text = docx_body_text(&xml)?;

        let mut embedded_images = Vec::new();
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index).map_err(|e| corrupt(DOCX, e))?;
            let name = entry.name().to_string();
            if !name.starts_with(MEDIA_PREFIX) {
                continue;
            }
            let Some(media_type) = image_media_type(&name) else {
                debug!(part = %name, "Skipping non-raster media part");
                continue;
            };
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data).map_err(|e| corrupt(DOCX, e))?;
            embedded_images.push(EmbeddedImage {
                media_type: media_type.to_string(),
                bytes: data,
                page: None,
            });
        }

        info!(
            chars = text.chars().count(),
            images = embedded_images.len(),
            "DOCX parsed"
        );
        Ok(ExtractedDocument {
            text,
            page_count: None,
            embedded_images,
        })
    }
}

fn image_media_type(name: &str) -> Option<&'static str> {
    match extension(name)?.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

#[derive(Default)]
struct Paragraph {
    style: Option<String>,
    numbered: bool,
    text: String,
}

impl Paragraph {
    fn render(&self) -> Option<String> {
        let text = self.text.trim();
        if text.is_empty() {
            return None;
        }
        let style = self.style.as_deref().unwrap_or_default();
        let rendered = match heading_level(style) {
            Some(level) => format!("\n{} {}\n", "#".repeat(level), text),
            None if self.numbered || style.contains("List") || style.contains("Bullet") => {
                format!("- {text}")
            }
            None => text.to_string(),
        };
        Some(rendered)
    }
}

/// `Heading1`..`Heading3` (style ids) or `Title`.
fn heading_level(style: &str) -> Option<usize> {
    if style == "Title" {
        return Some(1);
    }
    let level = style
        .strip_prefix("Heading")
        .map(|rest| rest.trim_start())?
        .parse::<usize>()
        .ok()?;
    (1..=3).contains(&level).then_some(level)
}

#[derive(Default)]
struct TableState {
    rows: Vec<Vec<String>>,
    row: Vec<String>,
    cell: Vec<String>,
}

fn val_attribute(e: &BytesStart<'_>) -> Result<Option<String>, ExtractError> {
    let attr = e
        .try_get_attribute("w:val")
        .map_err(|err| corrupt(DOCX, err))?;
    attr.map(|a| {
        a.unescape_value()
            .map(|v| v.into_owned())
            .map_err(|err| corrupt(DOCX, err))
    })
    .transpose()
}

/// Walk `word/document.xml` in body order.
fn docx_body_text(xml: &str) -> Result<String, ExtractError> {
    let mut reader = XmlReader::from_str(xml);
    let mut parts: Vec<String> = Vec::new();
    let mut tables: Vec<TableState> = Vec::new();
    let mut paragraph: Option<Paragraph> = None;
    let mut in_text = false;

    loop {
        let event = reader.read_event().map_err(|e| corrupt(DOCX, e))?;
        match event {
            Event::Start(e) => match e.name().as_ref() {
                b"w:p" => paragraph = Some(Paragraph::default()),
                b"w:t" => in_text = true,
                b"w:tbl" => tables.push(TableState::default()),
                b"w:numPr" => {
                    if let Some(p) = paragraph.as_mut() {
                        p.numbered = true;
                    }
                }
                _ => {}
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"w:pStyle" => {
                    let style = val_attribute(&e)?;
                    if let Some(p) = paragraph.as_mut() {
                        p.style = style;
                    }
                }
                b"w:tab" => {
                    if let Some(p) = paragraph.as_mut() {
                        p.text.push('\t');
                    }
                }
                b"w:br" => {
                    if let Some(p) = paragraph.as_mut() {
                        p.text.push('\n');
                    }
                }
                _ => {}
            },
            Event::Text(t) if in_text => {
                let text = t.unescape().map_err(|e| corrupt(DOCX, e))?;
                if let Some(p) = paragraph.as_mut() {
                    p.text.push_str(&text);
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"w:t" => in_text = false,
                b"w:p" => {
                    let Some(p) = paragraph.take() else {
                        continue;
                    };
                    match tables.last_mut() {
                        Some(table) => {
                            let text = p.text.trim();
                            if !text.is_empty() {
                                table.cell.push(text.to_string());
                            }
                        }
                        None => parts.extend(p.render()),
                    }
                }
                b"w:tc" => {
                    if let Some(table) = tables.last_mut() {
                        let cell = std::mem::take(&mut table.cell).join(" ");
                        table.row.push(cell);
                    }
                }
                b"w:tr" => {
                    if let Some(table) = tables.last_mut() {
                        let row = std::mem::take(&mut table.row);
                        if !row.is_empty() {
                            table.rows.push(row);
                        }
                    }
                }
                b"w:tbl" => {
                    if let Some(table) = tables.pop() {
                        let rendered = rows_to_table(&table.rows);
                        match tables.last_mut() {
                            // Nested tables collapse into the enclosing cell
                            Some(outer) => outer.cell.push(rendered.replace('\n', " ")),
                            None if !rendered.is_empty() => parts.push(rendered),
                            None => {}
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(parts.join("\n").trim().to_string())
}

/// Excel workbooks: one `## Sheet: <name>` section per non-empty sheet,
/// rows as pipe tables with a separator after the first data row.
#[derive(Debug, Default, Clone)]
pub struct XlsxExtractor;

impl DocumentExtractor for XlsxExtractor {
    fn extract(&self, bytes: &[u8], _media_type: &str) -> Result<ExtractedDocument, ExtractError> {
        let mut workbook: Xlsx<_> =
            open_workbook_from_rs(Cursor::new(bytes)).map_err(|e| corrupt(XLSX, e))?;

        let names = workbook.sheet_names();
        let mut sections = Vec::new();
        for name in &names {
            let range = match workbook.worksheet_range(name) {
                Ok(range) => range,
                Err(e) => {
                    debug!(sheet = %name, error = %e, "Skipping unreadable sheet");
                    continue;
                }
            };
            let rows: Vec<Vec<String>> = range
                .rows()
                .map(|row| row.iter().map(cell_text).collect::<Vec<_>>())
                .filter(|cells| cells.iter().any(|c| !c.trim().is_empty()))
                .collect();
            if rows.is_empty() {
                continue;
            }
            sections.push(format!("## Sheet: {name}\n{}", rows_to_table(&rows)));
        }

        let text = sections.join("\n\n");
        info!(sheets = names.len(), chars = text.chars().count(), "XLSX parsed");
        Ok(ExtractedDocument {
            text,
            page_count: None,
            embedded_images: Vec::new(),
        })
    }
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        other => other.to_string().trim().to_string(),
    }
}
