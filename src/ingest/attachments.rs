//! Attachment content retrieval.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use super::model::Attachment;
use crate::error::ExtractError;

/// Attachment bytes ready for analysis.
#[derive(Debug, Clone)]
pub struct FetchedAttachment {
    pub filename: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
}

/// Resolves an attachment reference to its bytes.
#[async_trait]
pub trait AttachmentFetcher: Send + Sync {
    async fn fetch(&self, attachment: &Attachment) -> Result<FetchedAttachment, ExtractError>;
}

/// Reads base64 content carried in the payload itself.
///
/// Attachments that only have a `storage_ref` need an object-store fetcher.
#[derive(Debug, Default, Clone)]
pub struct InlineAttachmentFetcher;

#[async_trait]
impl AttachmentFetcher for InlineAttachmentFetcher {
    async fn fetch(&self, attachment: &Attachment) -> Result<FetchedAttachment, ExtractError> {
        let data = attachment
            .data
            .as_deref()
            .ok_or_else(|| ExtractError::Empty(attachment.filename.clone()))?;
        let bytes = BASE64
            .decode(data.trim())
            .map_err(|e| ExtractError::Corrupt {
                media_type: attachment.media_type.clone(),
                reason: format!("{}: invalid base64: {e}", attachment.filename),
            })?;
        if bytes.is_empty() {
            return Err(ExtractError::Empty(attachment.filename.clone()));
        }
        Ok(FetchedAttachment {
            filename: attachment.filename.clone(),
            media_type: attachment.media_type.clone(),
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(data: Option<&str>) -> Attachment {
        Attachment {
            filename: "a.txt".into(),
            media_type: "text/plain".into(),
            size_bytes: 0,
            data: data.map(str::to_string),
            storage_ref: None,
        }
    }

    #[tokio::test]
    async fn decodes_inline_data() {
        let fetched = InlineAttachmentFetcher
            .fetch(&attachment(Some("aGVsbG8=")))
            .await
            .unwrap();
        assert_eq!(fetched.bytes, b"hello");
    }

    #[tokio::test]
    async fn missing_data_is_empty() {
        let err = InlineAttachmentFetcher
            .fetch(&attachment(None))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Empty(_)));
    }

    #[tokio::test]
    async fn bad_base64_is_corrupt() {
        let err = InlineAttachmentFetcher
            .fetch(&attachment(Some("***")))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractError::Corrupt { .. }));
    }
}
