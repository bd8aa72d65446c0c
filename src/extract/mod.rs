//! Byte-level content handling: MIME classification, document text
//! extraction, and image normalization.
//!
//! Parsers plug in behind the `DocumentExtractor` and `ImageNormalizer`
//! traits: lopdf for PDF, zip and quick-xml for Word, calamine for Excel,
//! and the `image` crate for re-encoding photos.

pub mod document;
pub mod image;
pub mod office;
pub mod pdf;

pub use document::{
    DefaultDocumentExtractor, DocumentExtractor, EmbeddedImage, ExtractedDocument,
    StructuredTextExtractor,
};
pub use image::{ImageNormalizer, ImageProfile, JpegNormalizer, NormalizedImage, PassthroughNormalizer};
pub use office::{DocxExtractor, XlsxExtractor};
pub use pdf::PdfExtractor;

/// Marker appended to text cut at the length ceiling.
pub const TRUNCATION_MARKER: &str = "\n\n[... truncated, document too long ...]";

/// Coarse content class used to route attachments to a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaClass {
    Image,
    Document,
    Other,
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif", "heic", "heif"];
const DOCUMENT_EXTENSIONS: &[&str] = &[
    "pdf", "docx", "xlsx", "txt", "md", "markdown", "csv", "html", "htm",
];
const DOCUMENT_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "text/plain",
    "text/markdown",
    "text/csv",
    "text/html",
];

/// Classify an attachment by MIME type, falling back to its extension when
/// the declared type is missing or generic.
pub fn classify_media_type(media_type: &str, filename: &str) -> MediaClass {
    let mime = media_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if mime.starts_with("image/") {
        return MediaClass::Image;
    }
    if DOCUMENT_MIME_TYPES.contains(&mime.as_str()) {
        return MediaClass::Document;
    }

    match extension(filename).as_deref() {
        Some(ext) if IMAGE_EXTENSIONS.contains(&ext) => MediaClass::Image,
        Some(ext) if DOCUMENT_EXTENSIONS.contains(&ext) => MediaClass::Document,
        _ => MediaClass::Other,
    }
}

/// Canonical MIME type for a document, from its declared type or extension.
pub fn document_media_type(media_type: &str, filename: &str) -> String {
    let mime = media_type.split(';').next().unwrap_or_default().trim();
    if DOCUMENT_MIME_TYPES.contains(&mime) {
        return mime.to_string();
    }
    let canonical = match extension(filename).as_deref() {
        Some("pdf") => "application/pdf",
        Some("docx") => DOCUMENT_MIME_TYPES[1],
        Some("xlsx") => DOCUMENT_MIME_TYPES[2],
        Some("md") | Some("markdown") => "text/markdown",
        Some("csv") => "text/csv",
        Some("html") | Some("htm") => "text/html",
        Some("txt") => "text/plain",
        _ => mime,
    };
    canonical.to_string()
}

pub(crate) fn extension(filename: &str) -> Option<String> {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
}

/// Cut `text` to `max_chars` characters, appending `TRUNCATION_MARKER` when cut.
pub fn truncate_with_marker(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => {
            tracing::warn!(limit = max_chars, "Document text truncated");
            format!("{}{}", &text[..byte_idx], TRUNCATION_MARKER)
        }
        None => text.to_string(),
    }
}

/// First `max_chars` characters of `text`, cut silently.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_mime() {
        assert_eq!(classify_media_type("image/jpeg", "a.bin"), MediaClass::Image);
        assert_eq!(
            classify_media_type("application/pdf", "plan"),
            MediaClass::Document
        );
        assert_eq!(
            classify_media_type("text/plain; charset=utf-8", "notes"),
            MediaClass::Document
        );
    }

    #[test]
    fn falls_back_to_extension() {
        assert_eq!(
            classify_media_type("application/octet-stream", "IMG_0042.HEIC"),
            MediaClass::Image
        );
        assert_eq!(
            classify_media_type("application/octet-stream", "scope.docx"),
            MediaClass::Document
        );
        assert_eq!(
            classify_media_type("application/zip", "archive.zip"),
            MediaClass::Other
        );
        assert_eq!(classify_media_type("", "noext"), MediaClass::Other);
    }

    #[test]
    fn canonical_document_type() {
        assert_eq!(
            document_media_type("application/octet-stream", "plans.PDF"),
            "application/pdf"
        );
        assert_eq!(document_media_type("text/csv", "x"), "text/csv");
    }

    #[test]
    fn truncation_appends_marker_only_when_cut() {
        assert_eq!(truncate_with_marker("short", 10), "short");
        assert_eq!(truncate_with_marker("exactly10!", 10), "exactly10!");
        let cut = truncate_with_marker("abcdefghijkl", 5);
        assert_eq!(cut, format!("abcde{TRUNCATION_MARKER}"));
    }

    #[test]
    fn truncation_is_char_safe() {
        let cut = truncate_with_marker("ééééé", 2);
        assert!(cut.starts_with("éé"));
        assert!(cut.ends_with("too long ...]"));
    }
}
