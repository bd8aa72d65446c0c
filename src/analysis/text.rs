//! Text change detection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use super::parse::{ParsedChanges, parse_changes};
use super::prompts::{
    TEXT_DETECTION_VERSION, text_detection_system_prompt, text_detection_user_prompt,
};
use super::types::{AnalysisMetadata, ChangeEventProposal, Finding, PhaseReport, SourceType};
use super::with_deadline;
use crate::error::AnalysisError;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::project::ProjectContext;

const DETECTION_MAX_TOKENS: u32 = 2048;
const DETECTION_TEMPERATURE: f32 = 0.0;

/// Detects change events in free text.
///
/// Malformed model output is not an error: it yields no proposals and an
/// `error` entry in the metadata. `Err` is reserved for failed calls.
#[async_trait]
pub trait TextClassifier: Send + Sync {
    fn model_name(&self) -> &str;

    async fn detect(
        &self,
        text: &str,
        subject: Option<&str>,
        ctx: &ProjectContext,
    ) -> Result<(Vec<ChangeEventProposal>, AnalysisMetadata), AnalysisError>;
}

/// `TextClassifier` backed by a chat model.
pub struct LlmTextClassifier {
    llm: Arc<dyn LlmProvider>,
}

impl LlmTextClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl TextClassifier for LlmTextClassifier {
    fn model_name(&self) -> &str {
        self.llm.model_name()
    }

    async fn detect(
        &self,
        text: &str,
        subject: Option<&str>,
        ctx: &ProjectContext,
    ) -> Result<(Vec<ChangeEventProposal>, AnalysisMetadata), AnalysisError> {
        let request = CompletionRequest::new(vec![
            ChatMessage::system(text_detection_system_prompt(ctx)),
            ChatMessage::user(text_detection_user_prompt(text, subject)),
        ])
        .with_max_tokens(DETECTION_MAX_TOKENS)
        .with_temperature(DETECTION_TEMPERATURE);

        let started = Instant::now();
        let response = self
            .llm
            .complete(request)
            .await
            .map_err(|source| AnalysisError::Capability {
                capability: "text_classifier",
                source,
            })?;

        let mut metadata = AnalysisMetadata::new(TEXT_DETECTION_VERSION, self.llm.model_name());
        metadata.tokens_used = response.total_tokens();
        metadata.processing_time_ms = started.elapsed().as_millis() as u64;

        match parse_changes(&response.content) {
            ParsedChanges::Changes(proposals) => {
                info!(
                    changes = proposals.len(),
                    tokens = metadata.tokens_used,
                    ms = metadata.processing_time_ms,
                    "Text detector finished"
                );
                Ok((proposals, metadata))
            }
            ParsedChanges::Malformed { .. } => {
                Ok((Vec::new(), metadata.with_error("JSON parse failed")))
            }
        }
    }
}

/// Text analysis phase: runs the classifier under a deadline and never fails.
#[derive(Clone)]
pub struct TextPhase {
    classifier: Arc<dyn TextClassifier>,
    call_timeout: Duration,
}

impl TextPhase {
    pub fn new(classifier: Arc<dyn TextClassifier>, call_timeout: Duration) -> Self {
        Self {
            classifier,
            call_timeout,
        }
    }

    /// Analyze `text`, tagging findings with `source_type`.
    ///
    /// Blank text makes no call and returns an empty report.
    pub async fn run(
        &self,
        text: &str,
        subject: Option<&str>,
        ctx: &ProjectContext,
        source_type: SourceType,
        attachment: Option<&str>,
    ) -> PhaseReport {
        if text.trim().is_empty() {
            return PhaseReport::empty();
        }

        let call = self.classifier.detect(text, subject, ctx);
        match with_deadline("text_classifier", self.call_timeout, call).await {
            Ok((proposals, metadata)) => PhaseReport {
                findings: proposals
                    .into_iter()
                    .filter(|p| p.is_change_event)
                    .map(|proposal| Finding {
                        proposal,
                        metadata: metadata.clone(),
                        source_type,
                        attachment: attachment.map(str::to_string),
                    })
                    .collect(),
                calls: vec![metadata],
            },
            Err(e) => {
                warn!(error = %e, source = source_type.as_str(), "Text detection failed");
                PhaseReport {
                    findings: Vec::new(),
                    calls: vec![
                        AnalysisMetadata::failed(
                            TEXT_DETECTION_VERSION,
                            self.classifier.model_name(),
                            &e,
                        ),
                    ],
                }
            }
        }
    }
}
