//! Analysis phases: text, image, and document.
//!
//! Each phase turns typed input plus project context into a `PhaseReport`
//! and never fails: capability errors, timeouts, and malformed model output
//! all degrade to zero findings with an `error` recorded in the call metadata.

pub mod document;
pub mod embedding;
pub mod image;
pub mod parse;
pub mod prompts;
pub mod text;
pub mod types;

pub use document::{DocumentInput, DocumentPhase};
pub use embedding::{DisabledEmbedder, Embedder, OpenAiEmbedder, cosine_similarity};
pub use image::{
    ImageChangeExtractor, ImageClassifier, ImageInput, ImagePhase, LlmImageChangeExtractor,
    LlmImageClassifier, extract_changes,
};
pub use text::{LlmTextClassifier, TextClassifier, TextPhase};
pub use types::{
    AnalysisMetadata, ChangeEventProposal, Finding, ImageClassification, ImageType, PhaseReport,
    SourceType, Urgency,
};

use std::future::Future;
use std::time::Duration;

use crate::error::AnalysisError;

/// Await a capability call, giving up after `timeout`.
pub(crate) async fn with_deadline<T, F>(
    capability: &'static str,
    timeout: Duration,
    call: F,
) -> Result<T, AnalysisError>
where
    F: Future<Output = Result<T, AnalysisError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(AnalysisError::Timeout {
            capability,
            timeout,
        }),
    }
}
