//! Document analysis: extract structured text, detect changes in it, and run
//! material embedded images through the image phase.

use std::sync::Arc;

use tracing::{info, warn};

use super::image::{ImageInput, ImagePhase};
use super::prompts::TEXT_DETECTION_VERSION;
use super::text::TextPhase;
use super::types::{AnalysisMetadata, PhaseReport, SourceType};
use crate::error::ExtractError;
use crate::extract::{DocumentExtractor, ExtractedDocument, truncate_with_marker};
use crate::project::ProjectContext;

/// A document attachment awaiting analysis.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub name: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Clone)]
pub struct DocumentPhase {
    extractor: Arc<dyn DocumentExtractor>,
    text: TextPhase,
    images: ImagePhase,
    min_embedded_image_bytes: usize,
    max_document_chars: usize,
}

impl DocumentPhase {
    pub fn new(
        extractor: Arc<dyn DocumentExtractor>,
        text: TextPhase,
        images: ImagePhase,
        min_embedded_image_bytes: usize,
        max_document_chars: usize,
    ) -> Self {
        Self {
            extractor,
            text,
            images,
            min_embedded_image_bytes,
            max_document_chars,
        }
    }

    pub async fn run(
        &self,
        documents: Vec<DocumentInput>,
        subject: Option<&str>,
        ctx: &ProjectContext,
    ) -> PhaseReport {
        let mut report = PhaseReport::empty();
        for doc in documents {
            report.extend(self.analyze_one(doc, subject, ctx).await);
        }
        report
    }

    async fn analyze_one(
        &self,
        doc: DocumentInput,
        subject: Option<&str>,
        ctx: &ProjectContext,
    ) -> PhaseReport {
        let name = doc.name.clone();
        let extracted = match self.extract(doc).await {
            Ok(extracted) => extracted,
            Err(e) => {
                warn!(document = %name, error = %e, "Document extraction failed");
                let mut report = PhaseReport::empty();
                report.calls.push(AnalysisMetadata {
                    skipped: matches!(e, ExtractError::Unsupported(_)),
                    ..AnalysisMetadata::new(TEXT_DETECTION_VERSION, "").with_error(e.to_string())
                });
                return report;
            }
        };

        let text = truncate_with_marker(&extracted.text, self.max_document_chars);
        let mut report = self
            .text
            .run(&text, subject, ctx, SourceType::Document, Some(&name))
            .await;

        let images: Vec<ImageInput> = extracted
            .embedded_images
            .into_iter()
            .enumerate()
            .filter(|(_, img)| img.bytes.len() >= self.min_embedded_image_bytes)
            .map(|(i, img)| ImageInput {
                name: match img.page {
                    Some(page) => format!("{name}#page{page}-image{}", i + 1),
                    None => format!("{name}#image{}", i + 1),
                },
                media_type: img.media_type,
                bytes: img.bytes,
            })
            .collect();

        if !images.is_empty() {
            info!(document = %name, images = images.len(), "Analyzing embedded images");
            report.extend(
                self.images
                    .run(images, ctx, SourceType::PdfEmbeddedImage)
                    .await,
            );
        }
        report
    }

    async fn extract(&self, doc: DocumentInput) -> Result<ExtractedDocument, ExtractError> {
        let extractor = Arc::clone(&self.extractor);
        let media_type = doc.media_type.clone();
        tokio::task::spawn_blocking(move || extractor.extract(&doc.bytes, &doc.media_type))
            .await
            .map_err(|e| ExtractError::Corrupt {
                media_type,
                reason: format!("extractor panicked: {e}"),
            })?
    }
}
