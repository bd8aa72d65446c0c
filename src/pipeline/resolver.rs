//! Cross-time duplicate resolution over stored embeddings.
//!
//! A candidate is compared only with events already stored in the same
//! project. Matches are not chained: if A resembles B and B resembles C,
//! A and C are still judged on their own similarity.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::analysis::embedding::{Embedder, cosine_similarity};
use crate::error::DatabaseError;
use crate::store::Database;

/// At or above: the candidate is the same change as the stored one.
pub const MERGE_THRESHOLD: f64 = 0.92;
/// At or above (and below merge): worth a human look.
pub const FLAG_THRESHOLD: f64 = 0.80;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Attach the new source to `existing_id`; create nothing.
    Merge { existing_id: Uuid, similarity: f64 },
    /// Create the event, noting the likely duplicate.
    Flag { existing_id: Uuid, similarity: f64 },
    Create,
}

/// A decision plus the candidate's embedding, stored with the event if one
/// is created.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub decision: Decision,
    pub embedding: Vec<f32>,
}

/// Pick the best `(id, similarity)` pair and classify it.
pub fn decide(scores: impl IntoIterator<Item = (Uuid, f64)>) -> Decision {
    let best = scores
        .into_iter()
        .filter(|(_, s)| *s >= FLAG_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1));

    match best {
        Some((existing_id, similarity)) if similarity >= MERGE_THRESHOLD => Decision::Merge {
            existing_id,
            similarity,
        },
        Some((existing_id, similarity)) => Decision::Flag {
            existing_id,
            similarity,
        },
        None => Decision::Create,
    }
}

#[derive(Clone)]
pub struct DuplicateResolver {
    db: Arc<dyn Database>,
    embedder: Arc<dyn Embedder>,
}

impl DuplicateResolver {
    pub fn new(db: Arc<dyn Database>, embedder: Arc<dyn Embedder>) -> Self {
        Self { db, embedder }
    }

    /// Embedding for `text`; failures are logged and read as no signal.
    pub async fn embed(&self, text: &str) -> Vec<f32> {
        match self.embedder.embed(text).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(error = %e, "Embedding failed, skipping duplicate check");
                Vec::new()
            }
        }
    }

    pub async fn resolve(
        &self,
        project_id: Uuid,
        description: &str,
        exclude: Option<Uuid>,
    ) -> Result<Resolution, DatabaseError> {
        let embedding = self.embed(description).await;
        if embedding.is_empty() {
            return Ok(Resolution {
                decision: Decision::Create,
                embedding,
            });
        }

        let stored = self
            .db
            .list_embedded_change_events(project_id, exclude)
            .await?;
        let decision = decide(
            stored
                .iter()
                .map(|(id, other)| (*id, cosine_similarity(&embedding, other))),
        );
        debug!(project_id = %project_id, compared = stored.len(), ?decision, "Duplicate check");
        Ok(Resolution {
            decision,
            embedding,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::types::{SourceType, Urgency};
    use crate::changes::model::{ActorType, ChangeEventBundle, ChangeEventStatus, NewChangeEvent};
    use crate::error::LlmError;
    use crate::ingest::model::{Channel, NewIngestEvent};
    use crate::project::Project;
    use crate::store::LibSqlBackend;
    use async_trait::async_trait;

    #[test]
    fn decision_boundaries() {
        let id = Uuid::new_v4();
        assert_eq!(
            decide([(id, 0.92)]),
            Decision::Merge {
                existing_id: id,
                similarity: 0.92
            }
        );
        assert_eq!(
            decide([(id, 0.80)]),
            Decision::Flag {
                existing_id: id,
                similarity: 0.80
            }
        );
        assert_eq!(decide([(id, 0.79999)]), Decision::Create);
        assert_eq!(decide(Vec::<(Uuid, f64)>::new()), Decision::Create);
    }

    #[test]
    fn best_match_wins() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(
            decide([(a, 0.85), (b, 0.95), (c, 0.3)]),
            Decision::Merge {
                existing_id: b,
                similarity: 0.95
            }
        );
    }

    struct FixedEmbedder(Vec<f32>);

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, LlmError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenEmbedder;

    #[async_trait]
    impl Embedder for BrokenEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, LlmError> {
            Err(LlmError::RequestFailed {
                provider: "openai".into(),
                reason: "503".into(),
            })
        }
    }

    async fn stored_event(db: &dyn Database, project: Uuid, embedding: Vec<f32>) -> Uuid {
        let (ingest, _) = db
            .insert_ingest_event(&NewIngestEvent::new(Channel::Api, None, "x").with_project(project))
            .await
            .unwrap();
        db.create_change_event_bundle(&ChangeEventBundle {
            event: NewChangeEvent {
                project_id: Some(project),
                status: ChangeEventStatus::Proposed,
                description: "Switch floor to tile".into(),
                area: None,
                material_from: None,
                material_to: None,
                requester_name: None,
                urgency: Urgency::Normal,
                confidence_score: 0.9,
                raw_text: None,
                source_type: SourceType::Text,
                prompt_version: None,
                model_used: None,
                tokens_used: 0,
                processing_time_ms: 0,
                embedding: Some(embedding),
            },
            ingest_event_id: ingest.id,
            relevance_score: 0.9,
            actor_type: ActorType::Ai,
            actor_id: None,
            metadata: serde_json::json!({}),
        })
        .await
        .unwrap()
        .id
    }

    #[tokio::test]
    async fn close_embedding_merges() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let project = Project::new(Uuid::new_v4(), "Maple St");
        db.insert_project(&project).await.unwrap();
        let existing = stored_event(db.as_ref(), project.id, vec![1.0, 0.0]).await;

        // cos = 0.95
        let candidate = vec![0.95, (1.0f32 - 0.95 * 0.95).sqrt()];
        let resolver = DuplicateResolver::new(db.clone(), Arc::new(FixedEmbedder(candidate)));
        let resolution = resolver
            .resolve(project.id, "Switch the floor to tile", None)
            .await
            .unwrap();
        match resolution.decision {
            Decision::Merge {
                existing_id,
                similarity,
            } => {
                assert_eq!(existing_id, existing);
                assert!((similarity - 0.95).abs() < 1e-4);
            }
            other => panic!("expected merge, got {other:?}"),
        }

        // Excluding the only candidate leaves nothing to match
        let resolution = resolver
            .resolve(project.id, "Switch the floor to tile", Some(existing))
            .await
            .unwrap();
        assert_eq!(resolution.decision, Decision::Create);
    }

    #[tokio::test]
    async fn embedder_failure_means_create() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let project = Project::new(Uuid::new_v4(), "Maple St");
        db.insert_project(&project).await.unwrap();
        stored_event(db.as_ref(), project.id, vec![1.0, 0.0]).await;

        let resolver = DuplicateResolver::new(db, Arc::new(BrokenEmbedder));
        let resolution = resolver.resolve(project.id, "anything", None).await.unwrap();
        assert_eq!(resolution.decision, Decision::Create);
        assert!(resolution.embedding.is_empty());
    }
}
