//! PDF text and embedded image extraction.

use lopdf::Document;
use tracing::{debug, info};

use super::document::{DocumentExtractor, EmbeddedImage, ExtractedDocument};
use crate::error::ExtractError;

const PDF: &str = "application/pdf";

/// Per-page text plus JPEG images stored as `DCTDecode` streams.
///
/// Other image encodings are raw pixel data that would need re-rasterizing,
/// so they are skipped.
#[derive(Debug, Default, Clone)]
pub struct PdfExtractor;

impl DocumentExtractor for PdfExtractor {
    fn extract(&self, bytes: &[u8], media_type: &str) -> Result<ExtractedDocument, ExtractError> {
        if bytes.is_empty() {
            return Err(ExtractError::Empty(media_type.to_string()));
        }
        let doc = Document::load_mem(bytes).map_err(|e| corrupt(e.to_string()))?;
        let pages = doc.get_pages();

        let mut texts = Vec::with_capacity(pages.len());
        let mut embedded_images = Vec::new();
        for (&number, &page_id) in &pages {
            match doc.extract_text(&[number]) {
                Ok(text) => texts.push(text.trim().to_string()),
                Err(e) => {
                    debug!(page = number, error = %e, "No extractable text on page");
                    texts.push(String::new());
                }
            }

            let images = match doc.get_page_images(page_id) {
                Ok(images) => images,
                Err(e) => {
                    debug!(page = number, error = %e, "Failed to list page images");
                    continue;
                }
            };
            for image in images {
                let is_jpeg = image
                    .filters
                    .as_ref()
                    .is_some_and(|filters| filters.iter().any(|f| f == "DCTDecode"));
                if !is_jpeg {
                    debug!(page = number, filters = ?image.filters, "Skipping non-JPEG image");
                    continue;
                }
                embedded_images.push(EmbeddedImage {
                    media_type: "image/jpeg".to_string(),
                    bytes: image.content.to_vec(),
                    page: Some(number),
                });
            }
        }

        let text = texts
            .into_iter()
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        info!(
            pages = pages.len(),
            images = embedded_images.len(),
            chars = text.chars().count(),
            "PDF extracted"
        );

        Ok(ExtractedDocument {
            text,
            page_count: Some(pages.len() as u32),
            embedded_images,
        })
    }
}

fn corrupt(reason: String) -> ExtractError {
    ExtractError::Corrupt {
        media_type: PDF.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::content::{Content, Operation};
    use lopdf::{Object, Stream, dictionary};

    const JPEG_STUB: &[u8] = &[0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10, b'J', b'F', b'I', b'F'];

    /// One-page PDF with a line of text and, optionally, a JPEG XObject.
    fn build_pdf(line: &str, with_image: bool) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
            "Encoding" => "WinAnsiEncoding",
        });

        let mut operations = vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 12.into()]),
            Operation::new("Td", vec![72.into(), 720.into()]),
            Operation::new("Tj", vec![Object::string_literal(line)]),
            Operation::new("ET", vec![]),
        ];
        let mut resources = dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        };
        if with_image {
            let image_id = doc.add_object(Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Image",
                    "Width" => 1,
                    "Height" => 1,
                    "ColorSpace" => "DeviceRGB",
                    "BitsPerComponent" => 8,
                    "Filter" => "DCTDecode",
                },
                JPEG_STUB.to_vec(),
            ));
            resources.set("XObject", dictionary! { "Im1" => image_id });
            operations.push(Operation::new("Do", vec!["Im1".into()]));
        }

        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let resources_id = doc.add_object(resources);
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut out = Vec::new();
        doc.save_to(&mut out).unwrap();
        out
    }

    #[test]
    fn extracts_page_text() {
        let pdf = build_pdf("Swap oak floor for tile", false);
        let doc = PdfExtractor.extract(&pdf, PDF).unwrap();
        assert_eq!(doc.page_count, Some(1));
        assert!(doc.text.contains("Swap oak floor for tile"), "got {:?}", doc.text);
        assert!(doc.embedded_images.is_empty());
    }

    #[test]
    fn jpeg_xobjects_are_embedded_images() {
        let pdf = build_pdf("Plan A", true);
        let doc = PdfExtractor.extract(&pdf, PDF).unwrap();
        assert_eq!(doc.embedded_images.len(), 1);
        let image = &doc.embedded_images[0];
        assert_eq!(image.media_type, "image/jpeg");
        assert_eq!(image.page, Some(1));
        assert_eq!(image.bytes, JPEG_STUB);
    }

    #[test]
    fn garbage_is_corrupt() {
        let err = PdfExtractor.extract(b"%PDF-1.7 not really", PDF).unwrap_err();
        assert!(matches!(err, ExtractError::Corrupt { .. }));
        assert!(matches!(
            PdfExtractor.extract(b"", PDF),
            Err(ExtractError::Empty(_))
        ));
    }
}
