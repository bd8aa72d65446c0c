//! One ingest event, start to finish: claim, attempts under a wall-clock
//! ceiling with backoff between them, then completion or the fallback
//! review item.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::retry::RetryPolicy;
use crate::analysis::types::{SourceType, Urgency};
use crate::changes::model::{ActorType, ChangeEventBundle, ChangeEventStatus, NewChangeEvent};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::extract::excerpt;
use crate::ingest::model::IngestEvent;
use crate::notify::{EventBus, PipelineEvent};
use crate::pipeline::IngestProcessor;
use crate::store::{ClaimOutcome, Database};

/// Stored error messages are cut to this many characters.
const ERROR_EXCERPT_CHARS: usize = 500;

/// What happened to a delivered job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { change_events: usize, attempts: u32 },
    /// Retries ran out; `fallback_id` is the synthesized review item.
    Failed { fallback_id: Uuid, attempts: u32 },
    /// Not claimable: already finished, held elsewhere, or gone.
    Skipped,
}

pub struct JobRunner {
    db: Arc<dyn Database>,
    processor: Arc<dyn IngestProcessor>,
    bus: EventBus,
    policy: RetryPolicy,
    job_timeout: Duration,
    raw_text_limit: usize,
}

impl JobRunner {
    pub fn new(
        db: Arc<dyn Database>,
        processor: Arc<dyn IngestProcessor>,
        bus: EventBus,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            db,
            processor,
            bus,
            policy: RetryPolicy::from_config(config),
            job_timeout: config.job_timeout,
            raw_text_limit: config.raw_text_limit,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Handle one delivery of `id`. Safe to call more than once per event.
    pub async fn run(&self, id: Uuid) -> Result<JobOutcome, PipelineError> {
        let event = match self.db.claim_ingest_event(id).await? {
            ClaimOutcome::Claimed(event) => event,
            ClaimOutcome::Finished(status) => {
                debug!(ingest_event_id = %id, status = %status, "Re-delivered finished event, skipping");
                return Ok(JobOutcome::Skipped);
            }
            ClaimOutcome::Busy => {
                debug!(ingest_event_id = %id, "Event is already being processed");
                return Ok(JobOutcome::Skipped);
            }
            ClaimOutcome::NotFound => {
                warn!(ingest_event_id = %id, "Queued ingest event does not exist");
                return Ok(JobOutcome::Skipped);
            }
        };

        let mut attempt = 0;
        let last_error = loop {
            attempt += 1;
            // Dropping the future on timeout cancels every in-flight phase call
            let result = tokio::time::timeout(
                self.job_timeout,
                self.processor.process_ingest_event(id),
            )
            .await
            .unwrap_or(Err(PipelineError::Timeout(self.job_timeout)));

            match result {
                Ok(change_events) => {
                    self.db.mark_ingest_completed(id).await?;
                    info!(
                        ingest_event_id = %id,
                        attempt,
                        change_events = change_events.len(),
                        "Ingest event processed"
                    );
                    return Ok(JobOutcome::Completed {
                        change_events: change_events.len(),
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    warn!(ingest_event_id = %id, attempt, error = %e, "Processing attempt failed");
                    if !self.policy.should_retry(attempt) {
                        break e.to_string();
                    }
                    let delay = self.policy.delay_for(attempt);
                    debug!(ingest_event_id = %id, delay_ms = delay.as_millis() as u64, "Backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        };

        self.give_up(&event, &last_error, attempt).await
    }

    /// Mark the event failed and leave a review item so the message is not lost.
    async fn give_up(
        &self,
        event: &IngestEvent,
        last_error: &str,
        attempts: u32,
    ) -> Result<JobOutcome, PipelineError> {
        let error_excerpt = excerpt(last_error, ERROR_EXCERPT_CHARS);
        let bundle = self.fallback_bundle(event, &error_excerpt, attempts);
        let fallback = self
            .db
            .fail_ingest_with_fallback(event.id, &error_excerpt, &bundle)
            .await?;

        error!(
            ingest_event_id = %event.id,
            change_event_id = %fallback.id,
            attempts,
            error = %error_excerpt,
            "Processing failed permanently, created review item"
        );
        self.bus.publish(PipelineEvent::IngestFailed {
            ingest_event_id: event.id,
            change_event: fallback.clone(),
            error: error_excerpt,
        });
        Ok(JobOutcome::Failed {
            fallback_id: fallback.id,
            attempts,
        })
    }

    fn fallback_bundle(
        &self,
        event: &IngestEvent,
        error_excerpt: &str,
        attempts: u32,
    ) -> ChangeEventBundle {
        let payload = serde_json::to_string(&event.raw_payload)
            .unwrap_or_else(|_| event.raw_payload.body.clone());
        ChangeEventBundle {
            event: NewChangeEvent {
                project_id: event.project_id,
                status: ChangeEventStatus::ManualReview,
                description: format!(
                    "[Auto] Processing failed for: {}",
                    event.raw_payload.subject_or_default()
                ),
                area: None,
                material_from: None,
                material_to: None,
                requester_name: event.sender_name.clone(),
                urgency: Urgency::Normal,
                confidence_score: 0.0,
                raw_text: Some(excerpt(&payload, self.raw_text_limit)),
                source_type: SourceType::ProcessingFailure,
                prompt_version: None,
                model_used: None,
                tokens_used: 0,
                processing_time_ms: 0,
                embedding: None,
            },
            ingest_event_id: event.id,
            relevance_score: 0.0,
            actor_type: ActorType::System,
            actor_id: None,
            metadata: json!({
                "reason": "processing_failed",
                "error": error_excerpt,
                "attempts": attempts,
                "channel": event.channel.as_str(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::model::ChangeEvent;
    use crate::ingest::model::{Channel, NewIngestEvent, ProcessingStatus};
    use crate::analysis::embedding::DisabledEmbedder;
    use crate::error::LlmError;
    use crate::llm::{CompletionRequest, CompletionResponse, LlmProvider};
    use crate::pipeline::{AnalysisPhases, Orchestrator};
    use crate::store::LibSqlBackend;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then succeeds with no change events.
    struct FlakyProcessor {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl IngestProcessor for FlakyProcessor {
        async fn process_ingest_event(&self, id: Uuid) -> Result<Vec<ChangeEvent>, PipelineError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(PipelineError::IngestEventNotFound(id));
            }
            Ok(Vec::new())
        }
    }

    struct HangingProcessor;

    #[async_trait]
    impl IngestProcessor for HangingProcessor {
        async fn process_ingest_event(&self, _id: Uuid) -> Result<Vec<ChangeEvent>, PipelineError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
        }
    }

    async fn setup(processor: Arc<dyn IngestProcessor>) -> (Arc<dyn Database>, JobRunner, Uuid) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let (event, _) = db
            .insert_ingest_event(&NewIngestEvent::new(
                Channel::Gmail,
                Some("Tile question"),
                "Can we use slate instead?",
            ))
            .await
            .unwrap();
        let config = PipelineConfig {
            job_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let runner = JobRunner::new(db.clone(), processor, EventBus::new(), &config)
            .with_policy(fast_policy());
        (db, runner, event.id)
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let processor = Arc::new(FlakyProcessor {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let (db, runner, id) = setup(processor.clone()).await;

        let outcome = runner.run(id).await.unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Completed {
                change_events: 0,
                attempts: 3
            }
        );
        let event = db.get_ingest_event(id).await.unwrap().unwrap();
        assert_eq!(event.processing_status, ProcessingStatus::Completed);
        assert!(event.processed_at.is_some());
    }

    #[tokio::test]
    async fn exhausted_retries_leave_one_review_item() {
        let processor = Arc::new(FlakyProcessor {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let (db, runner, id) = setup(processor.clone()).await;
        let mut rx = runner.bus.subscribe();

        let JobOutcome::Failed {
            fallback_id,
            attempts,
        } = runner.run(id).await.unwrap()
        else {
            panic!("expected failure");
        };
        assert_eq!(attempts, 3);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 3);

        let event = db.get_ingest_event(id).await.unwrap().unwrap();
        assert_eq!(event.processing_status, ProcessingStatus::Failed);
        assert!(event.error_message.unwrap().contains("not found"));

        let fallback = db.get_change_event(fallback_id).await.unwrap().unwrap();
        assert_eq!(fallback.status, ChangeEventStatus::ManualReview);
        assert_eq!(fallback.description, "[Auto] Processing failed for: Tile question");
        assert_eq!(fallback.source_type, SourceType::ProcessingFailure);
        assert_eq!(fallback.confidence_score, 0.0);
        assert!(fallback.raw_text.unwrap().contains("slate"));

        let sources = db.list_sources(fallback_id).await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].ingest_event_id, id);

        assert!(matches!(
            rx.recv().await.unwrap(),
            PipelineEvent::IngestFailed { .. }
        ));

        // A re-delivery of the failed event is acknowledged and dropped
        assert_eq!(runner.run(id).await.unwrap(), JobOutcome::Skipped);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn wall_clock_ceiling_counts_as_failure() {
        let (db, runner, id) = setup(Arc::new(HangingProcessor)).await;
        let runner = runner.with_policy(RetryPolicy {
            max_attempts: 1,
            ..fast_policy()
        });

        assert!(matches!(
            runner.run(id).await.unwrap(),
            JobOutcome::Failed { attempts: 1, .. }
        ));
        let event = db.get_ingest_event(id).await.unwrap().unwrap();
        assert!(event.error_message.unwrap().contains("exceeded"));
    }

    /// Provider that is always over its rate limit.
    struct RateLimitedLlm;

    #[async_trait]
    impl LlmProvider for RateLimitedLlm {
        fn model_name(&self) -> &str {
            "rate-limited"
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            Err(LlmError::RateLimited {
                provider: "mock".into(),
                retry_after: None,
            })
        }
    }

    #[tokio::test]
    async fn provider_outage_is_retried_then_falls_back() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let config = PipelineConfig::default();
        let orchestrator = Orchestrator::new(
            db.clone(),
            AnalysisPhases::from_llm(Arc::new(RateLimitedLlm), &config),
            Arc::new(DisabledEmbedder),
            EventBus::new(),
            config.clone(),
        );
        let runner = JobRunner::new(db.clone(), Arc::new(orchestrator), EventBus::new(), &config)
            .with_policy(fast_policy());
        let (event, _) = db
            .insert_ingest_event(&NewIngestEvent::new(
                Channel::Gmail,
                Some("Flooring"),
                "Switch the kitchen floor to porcelain tile",
            ))
            .await
            .unwrap();

        let outcome = runner.run(event.id).await.unwrap();
        let JobOutcome::Failed { fallback_id, attempts } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(attempts, 3);

        let stored = db.get_ingest_event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.processing_status, ProcessingStatus::Failed);
        assert!(stored.error_message.unwrap().contains("Analysis unavailable"));
        let fallback = db.get_change_event(fallback_id).await.unwrap().unwrap();
        assert_eq!(fallback.status, ChangeEventStatus::ManualReview);
    }

    #[tokio::test]
    async fn unknown_event_is_skipped() {
        let (_db, runner, _id) = setup(Arc::new(HangingProcessor)).await;
        assert_eq!(runner.run(Uuid::new_v4()).await.unwrap(), JobOutcome::Skipped);
    }
}
