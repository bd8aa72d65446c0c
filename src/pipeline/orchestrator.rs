//! Turns one ingest event into persisted change events.
//!
//! Load, fan out to the three analysis phases, flatten in text, image,
//! document order, dedupe, then persist each survivor on its own. Events
//! go to the bus only after the write that backs them has committed.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::dedup::dedupe;
use super::resolver::{Decision, DuplicateResolver};
use crate::analysis::document::{DocumentInput, DocumentPhase};
use crate::analysis::image::{ImageInput, ImagePhase, LlmImageChangeExtractor, LlmImageClassifier};
use crate::analysis::text::{LlmTextClassifier, TextPhase};
use crate::analysis::embedding::Embedder;
use crate::analysis::types::{Finding, PhaseReport, SourceType};
use crate::changes::model::{
    ActorType, ChangeEvent, ChangeEventBundle, ChangeEventStatus, NewChangeEvent,
};
use crate::config::PipelineConfig;
use crate::error::{DatabaseError, PipelineError};
use crate::extract::{
    DefaultDocumentExtractor, JpegNormalizer, MediaClass, classify_media_type,
    document_media_type, excerpt,
};
use crate::ingest::attachments::{AttachmentFetcher, InlineAttachmentFetcher};
use crate::ingest::model::IngestEvent;
use crate::llm::provider::LlmProvider;
use crate::notify::{EventBus, PipelineEvent};
use crate::project::ProjectContext;
use crate::store::Database;

/// The operation the worker drives.
#[async_trait]
pub trait IngestProcessor: Send + Sync {
    /// Process one ingest event, returning the change events it created.
    ///
    /// `Err` means the attempt failed as a whole and may be retried.
    async fn process_ingest_event(&self, id: Uuid) -> Result<Vec<ChangeEvent>, PipelineError>;
}

/// The three analysis phases.
#[derive(Clone)]
pub struct AnalysisPhases {
    pub text: TextPhase,
    pub images: ImagePhase,
    pub documents: DocumentPhase,
}

impl AnalysisPhases {
    /// Model-backed phases with the built-in byte-level handlers.
    pub fn from_llm(llm: Arc<dyn LlmProvider>, config: &PipelineConfig) -> Self {
        let text = TextPhase::new(
            Arc::new(LlmTextClassifier::new(Arc::clone(&llm))),
            config.call_timeout,
        );
        let images = ImagePhase::new(
            Arc::new(JpegNormalizer),
            Arc::new(LlmImageClassifier::new(Arc::clone(&llm))),
            Arc::new(LlmImageChangeExtractor::new(llm)),
            config.call_timeout,
        );
        let documents = DocumentPhase::new(
            Arc::new(DefaultDocumentExtractor),
            text.clone(),
            images.clone(),
            config.min_embedded_image_bytes,
            config.max_document_chars,
        );
        Self {
            text,
            images,
            documents,
        }
    }
}

pub struct Orchestrator {
    db: Arc<dyn Database>,
    phases: AnalysisPhases,
    fetcher: Arc<dyn AttachmentFetcher>,
    resolver: DuplicateResolver,
    bus: EventBus,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(
        db: Arc<dyn Database>,
        phases: AnalysisPhases,
        embedder: Arc<dyn Embedder>,
        bus: EventBus,
        config: PipelineConfig,
    ) -> Self {
        Self {
            resolver: DuplicateResolver::new(Arc::clone(&db), embedder),
            db,
            phases,
            fetcher: Arc::new(InlineAttachmentFetcher),
            bus,
            config,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn AttachmentFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    async fn load_context(&self, event: &IngestEvent) -> Result<ProjectContext, PipelineError> {
        let Some(project_id) = event.project_id else {
            return Ok(ProjectContext::default());
        };
        match self.db.get_project(project_id).await {
            Ok(Some(project)) => Ok(project.context()),
            Ok(None) => {
                warn!(ingest_event_id = %event.id, project_id = %project_id, "Assigned project is missing, using empty context");
                Ok(ProjectContext::default())
            }
            Err(e) => Err(PipelineError::ProjectLoad {
                id: project_id,
                reason: e.to_string(),
            }),
        }
    }

    /// Fetch attachments and split them into images and documents.
    async fn partition_attachments(
        &self,
        event: &IngestEvent,
    ) -> (Vec<ImageInput>, Vec<DocumentInput>) {
        let mut images = Vec::new();
        let mut documents = Vec::new();

        for attachment in &event.raw_payload.attachments {
            let class = classify_media_type(&attachment.media_type, &attachment.filename);
            if class == MediaClass::Other {
                debug!(filename = %attachment.filename, media_type = %attachment.media_type, "Ignoring attachment");
                continue;
            }
            let fetched = match self.fetcher.fetch(attachment).await {
                Ok(fetched) => fetched,
                Err(e) => {
                    warn!(ingest_event_id = %event.id, filename = %attachment.filename, error = %e, "Attachment unavailable");
                    continue;
                }
            };
            match class {
                MediaClass::Image => images.push(ImageInput {
                    name: fetched.filename,
                    media_type: fetched.media_type,
                    bytes: fetched.bytes,
                }),
                MediaClass::Document => documents.push(DocumentInput {
                    media_type: document_media_type(&fetched.media_type, &fetched.filename),
                    name: fetched.filename,
                    bytes: fetched.bytes,
                }),
                MediaClass::Other => {}
            }
        }
        (images, documents)
    }

    /// Persist one finding. `Ok(None)` means it merged into an existing event.
    async fn persist_finding(
        &self,
        event: &IngestEvent,
        finding: Finding,
    ) -> Result<Option<ChangeEvent>, DatabaseError> {
        let proposal = &finding.proposal;
        // An earlier attempt that timed out mid-batch may already have written this one
        if let Some(existing_id) = self
            .db
            .find_sourced_change_event(event.id, &proposal.description)
            .await?
        {
            debug!(
                ingest_event_id = %event.id,
                change_event_id = %existing_id,
                "Finding already persisted by an earlier attempt"
            );
            return Ok(None);
        }
        let status = ChangeEventStatus::for_confidence(
            proposal.confidence,
            self.config.confidence_threshold,
        );

        let mut metadata = json!({
            "confidence": proposal.confidence,
            "prompt_version": finding.metadata.prompt_version,
            "channel": event.channel.as_str(),
            "urgency": proposal.urgency.as_str(),
            "source_type": finding.source_type.as_str(),
        });
        if let Some(attachment) = &finding.attachment {
            metadata["attachment"] = json!(attachment);
        }

        let mut embedding = None;
        let mut flagged = None;
        if let Some(project_id) = event.project_id {
            let resolution = self
                .resolver
                .resolve(project_id, &proposal.description, None)
                .await?;
            match resolution.decision {
                Decision::Merge {
                    existing_id,
                    similarity,
                } => {
                    let linked = self
                        .db
                        .attach_source(existing_id, event.id, proposal.confidence)
                        .await?;
                    info!(
                        ingest_event_id = %event.id,
                        change_event_id = %existing_id,
                        similarity,
                        "Merged into existing change event"
                    );
                    if linked {
                        self.bus.publish(PipelineEvent::SourceMerged {
                            change_event_id: existing_id,
                            ingest_event_id: event.id,
                            similarity,
                        });
                    }
                    return Ok(None);
                }
                Decision::Flag {
                    existing_id,
                    similarity,
                } => {
                    metadata["possible_duplicate_of"] = json!(existing_id);
                    metadata["similarity"] = json!(similarity);
                    flagged = Some((existing_id, similarity));
                }
                Decision::Create => {}
            }
            if !resolution.embedding.is_empty() {
                embedding = Some(resolution.embedding);
            }
        }

        let raw_text = Some(excerpt(&event.raw_payload.body, self.config.raw_text_limit))
            .filter(|t| !t.trim().is_empty());
        let bundle = ChangeEventBundle {
            event: NewChangeEvent {
                project_id: event.project_id,
                status,
                description: proposal.description.clone(),
                area: proposal.area.clone(),
                material_from: proposal.material_from.clone(),
                material_to: proposal.material_to.clone(),
                requester_name: proposal
                    .requester_name
                    .clone()
                    .or_else(|| event.sender_name.clone()),
                urgency: proposal.urgency,
                confidence_score: proposal.confidence,
                raw_text,
                source_type: finding.source_type,
                prompt_version: Some(finding.metadata.prompt_version.clone())
                    .filter(|v| !v.is_empty()),
                model_used: Some(finding.metadata.model_used.clone()).filter(|m| !m.is_empty()),
                tokens_used: finding.metadata.tokens_used,
                processing_time_ms: finding.metadata.processing_time_ms,
                embedding,
            },
            ingest_event_id: event.id,
            relevance_score: proposal.confidence,
            actor_type: ActorType::Ai,
            actor_id: None,
            metadata,
        };

        let created = self.db.create_change_event_bundle(&bundle).await?;
        info!(
            ingest_event_id = %event.id,
            change_event_id = %created.id,
            status = %created.status,
            confidence = created.confidence_score,
            source = created.source_type.as_str(),
            "Change event created"
        );
        self.bus.publish(PipelineEvent::ChangeEventCreated {
            change_event: created.clone(),
            ingest_event_id: event.id,
        });
        if let Some((existing_id, similarity)) = flagged {
            self.bus.publish(PipelineEvent::PossibleDuplicate {
                change_event_id: created.id,
                existing_id,
                similarity,
            });
        }
        Ok(Some(created))
    }
}

fn log_phase(ingest_event_id: Uuid, phase: &'static str, report: &PhaseReport) {
    for err in report.errors() {
        warn!(ingest_event_id = %ingest_event_id, phase, error = %err, "Phase call failed");
    }
    debug!(
        ingest_event_id = %ingest_event_id,
        phase,
        calls = report.calls.len(),
        findings = report.findings.len(),
        "Phase finished"
    );
}

#[async_trait]
impl IngestProcessor for Orchestrator {
    async fn process_ingest_event(&self, id: Uuid) -> Result<Vec<ChangeEvent>, PipelineError> {
        let event = self
            .db
            .get_ingest_event(id)
            .await?
            .ok_or(PipelineError::IngestEventNotFound(id))?;
        let ctx = self.load_context(&event).await?;
        let (images, documents) = self.partition_attachments(&event).await;
        let subject = event.raw_payload.subject.as_deref();

        info!(
            ingest_event_id = %id,
            project_id = ?event.project_id,
            images = images.len(),
            documents = documents.len(),
            "Processing ingest event"
        );

        let (text, image, document) = tokio::join!(
            self.phases
                .text
                .run(&event.raw_payload.body, subject, &ctx, SourceType::Text, None),
            self.phases.images.run(images, &ctx, SourceType::Image),
            self.phases.documents.run(documents, subject, &ctx),
        );
        log_phase(id, "text", &text);
        log_phase(id, "image", &image);
        log_phase(id, "document", &document);

        let mut combined = PhaseReport::empty();
        for report in [text, image, document] {
            combined.extend(report);
        }
        // Nothing answered: retry the whole event rather than record "no changes"
        if combined.analysis_unavailable() {
            return Err(PipelineError::AnalysisUnavailable {
                failed: combined.calls.len(),
                last_error: combined.errors().last().unwrap_or_default().to_string(),
            });
        }

        let findings = combined.findings;
        let found = findings.len();
        let survivors = dedupe(findings, self.config.dedup_threshold);
        if survivors.len() < found {
            debug!(ingest_event_id = %id, dropped = found - survivors.len(), "Deduplicated findings");
        }

        let mut created = Vec::with_capacity(survivors.len());
        for finding in survivors {
            let description = finding.proposal.description.clone();
            match self.persist_finding(&event, finding).await {
                Ok(Some(change_event)) => created.push(change_event),
                Ok(None) => {}
                Err(e) => error!(
                    ingest_event_id = %id,
                    description = %description,
                    error = %e,
                    "Failed to persist change event"
                ),
            }
        }

        info!(ingest_event_id = %id, created = created.len(), "Ingest event analyzed");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::embedding::DisabledEmbedder;
    use crate::analysis::image::{ImageChangeExtractor, ImageClassifier};
    use crate::analysis::text::TextClassifier;
    use crate::analysis::types::{
        AnalysisMetadata, ChangeEventProposal, ImageClassification, ImageType,
    };
    use crate::error::{AnalysisError, LlmError};
    use crate::extract::{NormalizedImage, PassthroughNormalizer, StructuredTextExtractor};
    use crate::ingest::model::{Attachment, Channel, NewIngestEvent};
    use crate::project::Project;
    use crate::store::LibSqlBackend;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use std::time::Duration;

    /// Returns the same proposals for every call.
    struct ScriptedText(Vec<ChangeEventProposal>);

    #[async_trait]
    impl TextClassifier for ScriptedText {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn detect(
            &self,
            _text: &str,
            _subject: Option<&str>,
            _ctx: &ProjectContext,
        ) -> Result<(Vec<ChangeEventProposal>, AnalysisMetadata), AnalysisError> {
            Ok((self.0.clone(), AnalysisMetadata::new("text_detection:v1", "scripted")))
        }
    }

    struct DownText;

    #[async_trait]
    impl TextClassifier for DownText {
        fn model_name(&self) -> &str {
            "down"
        }

        async fn detect(
            &self,
            _text: &str,
            _subject: Option<&str>,
            _ctx: &ProjectContext,
        ) -> Result<(Vec<ChangeEventProposal>, AnalysisMetadata), AnalysisError> {
            Err(AnalysisError::Capability {
                capability: "text_classifier",
                source: LlmError::RequestFailed {
                    provider: "mock".into(),
                    reason: "connection reset".into(),
                },
            })
        }
    }

    struct PlanClassifier;

    #[async_trait]
    impl ImageClassifier for PlanClassifier {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn classify(
            &self,
            _image: &NormalizedImage,
        ) -> Result<(ImageClassification, AnalysisMetadata), AnalysisError> {
            Ok((
                ImageClassification {
                    image_type: ImageType::AnnotatedPlan,
                    confidence: 0.9,
                    description: "markup".into(),
                },
                AnalysisMetadata::new("image_classification:v1", "scripted"),
            ))
        }
    }

    struct PlanExtractor;

    #[async_trait]
    impl ImageChangeExtractor for PlanExtractor {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn extract(
            &self,
            _image: &NormalizedImage,
            _image_type: ImageType,
            _ctx: &ProjectContext,
        ) -> Result<(Vec<ChangeEventProposal>, AnalysisMetadata), AnalysisError> {
            Ok((
                vec![ChangeEventProposal::new("Relocate bathroom wall per markup", 0.85)],
                AnalysisMetadata::new("visual_change:v1", "scripted"),
            ))
        }
    }

    fn phases(text: Arc<dyn TextClassifier>) -> AnalysisPhases {
        let timeout = Duration::from_secs(5);
        let text = TextPhase::new(text, timeout);
        let images = ImagePhase::new(
            Arc::new(PassthroughNormalizer),
            Arc::new(PlanClassifier),
            Arc::new(PlanExtractor),
            timeout,
        );
        let documents = DocumentPhase::new(
            Arc::new(StructuredTextExtractor),
            text.clone(),
            images.clone(),
            10 * 1024,
            10_000,
        );
        AnalysisPhases {
            text,
            images,
            documents,
        }
    }

    async fn orchestrator(
        text: Arc<dyn TextClassifier>,
    ) -> (Orchestrator, Arc<dyn Database>, Project) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let project = Project::new(Uuid::new_v4(), "Maple St");
        db.insert_project(&project).await.unwrap();
        let orch = Orchestrator::new(
            db.clone(),
            phases(text),
            Arc::new(DisabledEmbedder),
            EventBus::new(),
            PipelineConfig::default(),
        );
        (orch, db, project)
    }

    fn floor_change(confidence: f64) -> ChangeEventProposal {
        ChangeEventProposal::new("Switch kitchen floor from oak to porcelain tile", confidence)
            .with_area("Kitchen")
            .with_materials("oak", "porcelain tile")
    }

    fn png_attachment(name: &str) -> Attachment {
        let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
        bytes.resize(2048, 0);
        Attachment {
            filename: name.into(),
            media_type: "image/png".into(),
            size_bytes: bytes.len() as u64,
            data: Some(BASE64.encode(&bytes)),
            storage_ref: None,
        }
    }

    #[tokio::test]
    async fn confident_text_change_is_proposed() {
        let (orch, db, project) = orchestrator(Arc::new(ScriptedText(vec![floor_change(0.95)]))).await;
        let (event, _) = db
            .insert_ingest_event(
                &NewIngestEvent::new(
                    Channel::Gmail,
                    Some("Floor"),
                    "Please switch the kitchen floor from oak to porcelain tile",
                )
                .with_project(project.id),
            )
            .await
            .unwrap();

        let created = orch.process_ingest_event(event.id).await.unwrap();
        assert_eq!(created.len(), 1);
        let ce = &created[0];
        assert_eq!(ce.status, ChangeEventStatus::Proposed);
        assert_eq!(ce.area.as_deref(), Some("Kitchen"));
        assert_eq!(ce.material_from.as_deref(), Some("oak"));
        assert_eq!(ce.material_to.as_deref(), Some("porcelain tile"));
        assert_eq!(ce.project_id, Some(project.id));

        let sources = db.list_sources(ce.id).await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].relevance_score, 0.95);

        let history = db.list_transitions(ce.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from_status, None);
        assert_eq!(history[0].actor_type, ActorType::Ai);
        assert_eq!(history[0].metadata["channel"], "gmail");
        assert_eq!(history[0].metadata["prompt_version"], "text_detection:v1");
    }

    #[tokio::test]
    async fn low_confidence_goes_to_review() {
        let (orch, db, _) = orchestrator(Arc::new(ScriptedText(vec![floor_change(0.5)]))).await;
        let (event, _) = db
            .insert_ingest_event(&NewIngestEvent::new(Channel::Api, None, "switch the floor"))
            .await
            .unwrap();

        let created = orch.process_ingest_event(event.id).await.unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].status, ChangeEventStatus::ManualReview);
        assert_eq!(created[0].project_id, None);
    }

    #[tokio::test]
    async fn failing_phase_does_not_sink_the_others() {
        let (orch, db, project) = orchestrator(Arc::new(DownText)).await;
        let (event, _) = db
            .insert_ingest_event(
                &NewIngestEvent::new(Channel::Gmail, Some("Markup"), "see attached")
                    .with_project(project.id)
                    .with_attachment(png_attachment("plan.png")),
            )
            .await
            .unwrap();

        let created = orch.process_ingest_event(event.id).await.unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].source_type, SourceType::Image);
        assert_eq!(created[0].description, "Relocate bathroom wall per markup");
    }

    #[tokio::test]
    async fn unreachable_model_fails_the_attempt() {
        let (orch, db, project) = orchestrator(Arc::new(DownText)).await;
        let (event, _) = db
            .insert_ingest_event(
                &NewIngestEvent::new(Channel::Gmail, Some("Floor"), "switch the floor to tile")
                    .with_project(project.id),
            )
            .await
            .unwrap();

        let err = orch.process_ingest_event(event.id).await.unwrap_err();
        let PipelineError::AnalysisUnavailable { failed, last_error } = err else {
            panic!("expected AnalysisUnavailable, got {err:?}");
        };
        assert_eq!(failed, 1);
        assert!(last_error.contains("connection reset"));
    }

    #[tokio::test]
    async fn empty_message_is_not_an_outage() {
        let (orch, db, _) = orchestrator(Arc::new(DownText)).await;
        let (event, _) = db
            .insert_ingest_event(&NewIngestEvent::new(Channel::Api, None, "   "))
            .await
            .unwrap();

        assert!(orch.process_ingest_event(event.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_attempt_skips_findings_already_written() {
        let (orch, db, project) = orchestrator(Arc::new(ScriptedText(vec![
            floor_change(0.95),
            ChangeEventProposal::new("Add two outlets in the garage", 0.9),
        ])))
        .await;
        let (event, _) = db
            .insert_ingest_event(
                &NewIngestEvent::new(Channel::Gmail, None, "floor and outlets")
                    .with_project(project.id),
            )
            .await
            .unwrap();

        assert_eq!(orch.process_ingest_event(event.id).await.unwrap().len(), 2);
        assert!(orch.process_ingest_event(event.id).await.unwrap().is_empty());

        let all = db
            .list_change_events(project.id, &Default::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn batch_duplicates_collapse_and_others_are_ignored() {
        let (orch, db, project) = orchestrator(Arc::new(ScriptedText(vec![
            floor_change(0.9),
            floor_change(0.8),
        ])))
        .await;
        let (event, _) = db
            .insert_ingest_event(
                &NewIngestEvent::new(Channel::Gmail, None, "floor")
                    .with_project(project.id)
                    .with_attachment(Attachment {
                        filename: "archive.zip".into(),
                        media_type: "application/zip".into(),
                        size_bytes: 3,
                        data: Some(BASE64.encode(b"zip")),
                        storage_ref: None,
                    }),
            )
            .await
            .unwrap();

        let created = orch.process_ingest_event(event.id).await.unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].confidence_score, 0.9);
    }

    #[tokio::test]
    async fn missing_event_is_an_error() {
        let (orch, _, _) = orchestrator(Arc::new(ScriptedText(Vec::new()))).await;
        assert!(matches!(
            orch.process_ingest_event(Uuid::new_v4()).await,
            Err(PipelineError::IngestEventNotFound(_))
        ));
    }

    #[tokio::test]
    async fn events_are_published_after_commit() {
        let (orch, db, project) = orchestrator(Arc::new(ScriptedText(vec![floor_change(0.95)]))).await;
        let mut rx = orch.bus.subscribe();
        let (event, _) = db
            .insert_ingest_event(&NewIngestEvent::new(Channel::Gmail, None, "x").with_project(project.id))
            .await
            .unwrap();

        orch.process_ingest_event(event.id).await.unwrap();
        let PipelineEvent::ChangeEventCreated { change_event, .. } = rx.recv().await.unwrap() else {
            panic!("expected ChangeEventCreated");
        };
        assert!(db.get_change_event(change_event.id).await.unwrap().is_some());
    }
}
