//! Document text extraction.

use std::sync::LazyLock;

use regex::Regex;

use super::office::{DOCX, DocxExtractor, XLSX, XlsxExtractor};
use super::pdf::PdfExtractor;
use crate::error::ExtractError;

/// A raster image found inside a document.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedImage {
    pub media_type: String,
    pub bytes: Vec<u8>,
    pub page: Option<u32>,
}

/// Structured text plus any embedded images.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedDocument {
    /// Markdown-flavoured text: `#` headings, `- ` list items, `a | b` table rows.
    pub text: String,
    pub page_count: Option<u32>,
    pub embedded_images: Vec<EmbeddedImage>,
}

/// Turns document bytes into structured text.
///
/// Implementations are synchronous and CPU-bound; callers run them on the
/// blocking pool.
pub trait DocumentExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8], media_type: &str) -> Result<ExtractedDocument, ExtractError>;
}

/// Routes PDF and Office formats to their parsers and everything else to
/// `StructuredTextExtractor`.
#[derive(Debug, Default, Clone)]
pub struct DefaultDocumentExtractor;

impl DocumentExtractor for DefaultDocumentExtractor {
    fn extract(&self, bytes: &[u8], media_type: &str) -> Result<ExtractedDocument, ExtractError> {
        match media_type {
            "application/pdf" => PdfExtractor.extract(bytes, media_type),
            DOCX => DocxExtractor.extract(bytes, media_type),
            XLSX => XlsxExtractor.extract(bytes, media_type),
            _ => StructuredTextExtractor.extract(bytes, media_type),
        }
    }
}

/// Built-in extractor for text formats: plain text, markdown, CSV, and HTML.
///
/// Binary formats (PDF, DOCX, XLSX) return `ExtractError::Unsupported`.
#[derive(Debug, Default, Clone)]
pub struct StructuredTextExtractor;

impl DocumentExtractor for StructuredTextExtractor {
    fn extract(&self, bytes: &[u8], media_type: &str) -> Result<ExtractedDocument, ExtractError> {
        let decode = || {
            String::from_utf8(bytes.to_vec()).map_err(|e| ExtractError::Corrupt {
                media_type: media_type.to_string(),
                reason: e.to_string(),
            })
        };

        let text = match media_type {
            "text/plain" | "text/markdown" => decode()?,
            "text/csv" => csv_to_table(&decode()?),
            "text/html" => html_to_text(&decode()?),
            other => return Err(ExtractError::Unsupported(other.to_string())),
        };

        Ok(ExtractedDocument {
            text: text.trim().to_string(),
            page_count: None,
            embedded_images: Vec::new(),
        })
    }
}

/// Render rows as a pipe table with a `---` separator after the first row.
pub fn rows_to_table(rows: &[Vec<String>]) -> String {
    let Some(first) = rows.first() else {
        return String::new();
    };
    let mut out = vec![first.join(" | ")];
    if rows.len() > 1 {
        out.push(vec!["---"; first.len()].join(" | "));
        out.extend(rows[1..].iter().map(|r| r.join(" | ")));
    }
    out.join("\n")
}

fn csv_to_table(text: &str) -> String {
    let rows: Vec<Vec<String>> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(split_csv_line)
        .filter(|cells| cells.iter().any(|c| !c.is_empty()))
        .collect();
    rows_to_table(&rows)
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => cells.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(c),
        }
    }
    cells.push(current.trim().to_string());
    cells
}

static SCRIPT_STYLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").unwrap());
static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<h([1-6])[^>]*>(.*?)</h[1-6]>").unwrap());
static LIST_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<li[^>]*>(.*?)</li>").unwrap());
static TABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<table[^>]*>(.*?)</table>").unwrap());
static ROW: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<tr[^>]*>(.*?)</tr>").unwrap());
static CELL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<t[dh][^>]*>(.*?)</t[dh]>").unwrap());
static BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>|</p>|</div>|</ul>|</ol>").unwrap());
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]+>").unwrap());
static BLANK_LINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n[ \t]*(\n[ \t]*)+").unwrap());

fn html_to_text(html: &str) -> String {
    let text = SCRIPT_STYLE.replace_all(html, "");

    let text = TABLE.replace_all(&text, |caps: &regex::Captures| {
        let rows: Vec<Vec<String>> = ROW
            .captures_iter(&caps[1])
            .map(|row| {
                CELL.captures_iter(&row[1])
                    .map(|cell| inline_text(&cell[1]))
                    .collect()
            })
            .filter(|cells: &Vec<String>| !cells.is_empty())
            .collect();
        format!("\n{}\n", rows_to_table(&rows))
    });

    let text = HEADING.replace_all(&text, |caps: &regex::Captures| {
        let level: usize = caps[1].parse().unwrap_or(3);
        format!("\n{} {}\n", "#".repeat(level.min(3)), inline_text(&caps[2]))
    });

    let text = LIST_ITEM.replace_all(&text, |caps: &regex::Captures| {
        format!("\n- {}", inline_text(&caps[1]))
    });

    let text = BREAK.replace_all(&text, "\n");
    let text = TAG.replace_all(&text, "");
    let text = decode_entities(&text);
    BLANK_LINES.replace_all(&text, "\n\n").trim().to_string()
}

fn inline_text(fragment: &str) -> String {
    let stripped = TAG.replace_all(fragment, "");
    decode_entities(&stripped)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(body: &str, mime: &str) -> String {
        StructuredTextExtractor
            .extract(body.as_bytes(), mime)
            .unwrap()
            .text
    }

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(extract("  hello\nworld \n", "text/plain"), "hello\nworld");
    }

    #[test]
    fn csv_becomes_pipe_table() {
        let out = extract("Item,Qty\nTile,\"1,200\"\n\nGrout,4\n", "text/csv");
        assert_eq!(out, "Item | Qty\n--- | ---\nTile | 1,200\nGrout | 4");
    }

    #[test]
    fn html_keeps_structure() {
        let html = r#"<html><head><style>p{}</style></head><body>
            <h1>Scope</h1><p>Kitchen &amp; bath</p>
            <h4>Deep</h4>
            <ul><li>Oak <b>floor</b></li><li>Quartz top</li></ul>
            <table><tr><th>Area</th><th>Finish</th></tr><tr><td>Kitchen</td><td>Tile</td></tr></table>
            </body></html>"#;
        let out = extract(html, "text/html");
        assert!(out.contains("# Scope"));
        assert!(out.contains("Kitchen & bath"));
        assert!(out.contains("### Deep"));
        assert!(out.contains("- Oak floor"));
        assert!(out.contains("- Quartz top"));
        assert!(out.contains("Area | Finish\n--- | ---\nKitchen | Tile"));
        assert!(!out.contains("p{}"));
        assert!(!out.contains('<'));
    }

    #[test]
    fn binary_formats_are_unsupported() {
        let err = StructuredTextExtractor
            .extract(b"%PDF-1.7", "application/pdf")
            .unwrap_err();
        assert!(matches!(err, ExtractError::Unsupported(_)));
    }

    #[test]
    fn default_extractor_routes_by_media_type() {
        let text = DefaultDocumentExtractor
            .extract(b"a,b\n1,2", "text/csv")
            .unwrap();
        assert_eq!(text.text, "a | b\n--- | ---\n1 | 2");

        // Reaches the real parsers, which reject these bytes as malformed
        for mime in ["application/pdf", DOCX, XLSX] {
            let err = DefaultDocumentExtractor.extract(b"junk", mime).unwrap_err();
            assert!(matches!(err, ExtractError::Corrupt { .. }), "{mime}: {err}");
        }
        assert!(matches!(
            DefaultDocumentExtractor.extract(b"x", "application/zip"),
            Err(ExtractError::Unsupported(_))
        ));
    }

    #[test]
    fn invalid_utf8_is_corrupt() {
        let err = StructuredTextExtractor
            .extract(&[0xff, 0xfe, 0x00], "text/plain")
            .unwrap_err();
        assert!(matches!(err, ExtractError::Corrupt { .. }));
    }

    #[test]
    fn single_row_table_has_no_separator() {
        assert_eq!(rows_to_table(&[vec!["a".into(), "b".into()]]), "a | b");
        assert_eq!(rows_to_table(&[]), "");
    }
}
