//! Human-in-the-loop approval of change events.
//!
//! Every status move goes through `Database::apply_status_change`, which
//! re-checks the expected status inside the write. Two racing confirms of
//! the same event therefore produce one success and one conflict.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::model::{
    ActorType, ChangeEvent, ChangeEventBundle, ChangeEventEdit, ChangeEventQuery,
    ChangeEventStatus, NewChangeEvent, NewTransition, StateTransition,
};
use super::tokens::{ActionTokenService, TokenAction};
use crate::analysis::types::{SourceType, Urgency};
use crate::error::WorkflowError;
use crate::ingest::model::{Channel, NewIngestEvent};
use crate::notify::{EventBus, PipelineEvent};
use crate::project::Project;
use crate::store::{Database, StatusChange, TransitionOutcome};

/// A change event entered by hand.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManualChangeDraft {
    pub description: String,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub material_from: Option<String>,
    #[serde(default)]
    pub material_to: Option<String>,
    #[serde(default)]
    pub requester_name: Option<String>,
    #[serde(default)]
    pub urgency: Urgency,
}

#[derive(Clone)]
pub struct Workflow {
    db: Arc<dyn Database>,
    tokens: ActionTokenService,
    bus: EventBus,
}

impl Workflow {
    pub fn new(db: Arc<dyn Database>, tokens: ActionTokenService, bus: EventBus) -> Self {
        Self { db, tokens, bus }
    }

    pub fn tokens(&self) -> &ActionTokenService {
        &self.tokens
    }

    /// `proposed | manual_review -> confirmed`, authorized by a confirm token.
    pub async fn confirm(&self, id: Uuid, token: &str) -> Result<ChangeEvent, WorkflowError> {
        self.transition_with_token(
            id,
            token,
            TokenAction::Confirm,
            ChangeEventStatus::Confirmed,
            ActorType::Contractor,
            None,
        )
        .await
    }

    /// `proposed | manual_review -> rejected`, with an optional reason.
    pub async fn reject(
        &self,
        id: Uuid,
        token: &str,
        reason: Option<String>,
    ) -> Result<ChangeEvent, WorkflowError> {
        let reason = reason.map(|r| r.trim().to_string()).filter(|r| !r.is_empty());
        self.transition_with_token(
            id,
            token,
            TokenAction::Reject,
            ChangeEventStatus::Rejected,
            ActorType::Contractor,
            reason,
        )
        .await
    }

    /// `confirmed -> signed`, triggered by the client.
    pub async fn sign(&self, id: Uuid, token: &str) -> Result<ChangeEvent, WorkflowError> {
        self.transition_with_token(
            id,
            token,
            TokenAction::Sign,
            ChangeEventStatus::Signed,
            ActorType::Client,
            None,
        )
        .await
    }

    async fn transition_with_token(
        &self,
        id: Uuid,
        token: &str,
        action: TokenAction,
        to: ChangeEventStatus,
        actor: ActorType,
        reason: Option<String>,
    ) -> Result<ChangeEvent, WorkflowError> {
        let record = self.tokens.verify(token, id, action).await?;
        let current = self.require(id).await?;
        if !current.status.can_transition_to(to) {
            return Err(WorkflowError::InvalidTransition {
                id,
                from: current.status.to_string(),
                to: to.to_string(),
            });
        }

        let mut transition = NewTransition::new(Some(current.status), to, actor)
            .with_metadata(json!({ "via": "action_token", "reason": reason }));
        transition.actor_id = record.client_email.clone();

        let change = StatusChange {
            change_event_id: id,
            from: current.status,
            to,
            transition,
            token_hash: Some(record.token_hash),
            rejection_reason: reason,
        };
        match self.db.apply_status_change(&change).await? {
            TransitionOutcome::Applied(updated) => {
                info!(change_event_id = %id, from = %current.status, to = %to, "Change event status updated");
                self.bus.publish(PipelineEvent::StatusChanged {
                    change_event_id: id,
                    from: current.status,
                    to,
                });
                Ok(updated)
            }
            TransitionOutcome::StatusMismatch { current: now } => {
                warn!(change_event_id = %id, expected = %current.status, found = %now, "Concurrent status change");
                Err(WorkflowError::Conflict {
                    id,
                    current: now.to_string(),
                    expected: current.status.to_string(),
                })
            }
            TransitionOutcome::TokenAlreadyUsed => Err(WorkflowError::TokenAlreadyUsed),
            TransitionOutcome::NotFound => Err(WorkflowError::NotFound {
                entity: "change_event",
                id,
            }),
        }
    }

    /// Edit an open change event on behalf of its contractor.
    pub async fn edit(
        &self,
        id: Uuid,
        contractor_id: Uuid,
        edit: ChangeEventEdit,
    ) -> Result<ChangeEvent, WorkflowError> {
        let current = self.require(id).await?;
        self.authorize(current.project_id, contractor_id).await?;

        if edit.description.as_deref().is_some_and(|d| d.trim().is_empty()) {
            return Err(WorkflowError::Invalid("description cannot be empty".into()));
        }
        if !current.status.is_open() {
            return Err(WorkflowError::Conflict {
                id,
                current: current.status.to_string(),
                expected: "proposed or manual_review".into(),
            });
        }
        if edit.is_empty() {
            return Ok(current);
        }

        let transition = NewTransition::new(Some(current.status), current.status, ActorType::Contractor)
            .with_actor_id(contractor_id.to_string())
            .with_metadata(json!({ "edited_fields": edit.touched_fields() }));

        match self
            .db
            .edit_change_event(id, current.status, &edit, &transition)
            .await?
        {
            TransitionOutcome::Applied(updated) => {
                info!(change_event_id = %id, fields = ?edit.touched_fields(), "Change event edited");
                Ok(updated)
            }
            TransitionOutcome::StatusMismatch { current: now } => Err(WorkflowError::Conflict {
                id,
                current: now.to_string(),
                expected: current.status.to_string(),
            }),
            TransitionOutcome::TokenAlreadyUsed | TransitionOutcome::NotFound => {
                Err(WorkflowError::NotFound {
                    entity: "change_event",
                    id,
                })
            }
        }
    }

    /// Record a change the contractor noticed themselves.
    pub async fn create_manual(
        &self,
        project_id: Uuid,
        contractor_id: Uuid,
        draft: ManualChangeDraft,
    ) -> Result<ChangeEvent, WorkflowError> {
        self.authorize(Some(project_id), contractor_id).await?;
        let description = draft.description.trim().to_string();
        if description.is_empty() {
            return Err(WorkflowError::Invalid("description is required".into()));
        }

        let ingest_id = Uuid::new_v4();
        let ingest = NewIngestEvent::new(Channel::Manual, None, description.clone())
            .with_project(project_id);
        let bundle = ChangeEventBundle {
            event: NewChangeEvent {
                project_id: Some(project_id),
                status: ChangeEventStatus::Proposed,
                description: description.clone(),
                area: draft.area,
                material_from: draft.material_from,
                material_to: draft.material_to,
                requester_name: draft.requester_name,
                urgency: draft.urgency,
                confidence_score: 1.0,
                raw_text: Some(description),
                source_type: SourceType::Manual,
                prompt_version: None,
                model_used: None,
                tokens_used: 0,
                processing_time_ms: 0,
                embedding: None,
            },
            ingest_event_id: ingest_id,
            relevance_score: 1.0,
            actor_type: ActorType::Contractor,
            actor_id: Some(contractor_id.to_string()),
            metadata: json!({ "source": "manual", "channel": Channel::Manual.as_str() }),
        };

        let created = self
            .db
            .create_manual_change_event(ingest_id, &ingest, &bundle)
            .await?;
        info!(change_event_id = %created.id, project_id = %project_id, "Manual change event created");
        self.bus.publish(PipelineEvent::ChangeEventCreated {
            change_event: created.clone(),
            ingest_event_id: ingest_id,
        });
        Ok(created)
    }

    /// Change events of a project, for its contractor.
    pub async fn list_for_project(
        &self,
        project_id: Uuid,
        contractor_id: Uuid,
        query: &ChangeEventQuery,
    ) -> Result<Vec<ChangeEvent>, WorkflowError> {
        self.authorize(Some(project_id), contractor_id).await?;
        Ok(self.db.list_change_events(project_id, query).await?)
    }

    /// Ordered audit log of a change event.
    pub async fn history(&self, id: Uuid) -> Result<Vec<StateTransition>, WorkflowError> {
        self.require(id).await?;
        Ok(self.db.list_transitions(id).await?)
    }

    async fn require(&self, id: Uuid) -> Result<ChangeEvent, WorkflowError> {
        self.db
            .get_change_event(id)
            .await?
            .ok_or(WorkflowError::NotFound {
                entity: "change_event",
                id,
            })
    }

    async fn authorize(
        &self,
        project_id: Option<Uuid>,
        contractor_id: Uuid,
    ) -> Result<Project, WorkflowError> {
        let Some(project_id) = project_id else {
            return Err(WorkflowError::Forbidden(
                "change event is not assigned to a project".into(),
            ));
        };
        let project = self
            .db
            .get_project(project_id)
            .await?
            .ok_or(WorkflowError::NotFound {
                entity: "project",
                id: project_id,
            })?;
        if project.contractor_id != contractor_id {
            warn!(project_id = %project_id, contractor_id = %contractor_id, "Ownership check failed");
            return Err(WorkflowError::Forbidden(
                "project belongs to another contractor".into(),
            ));
        }
        Ok(project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use std::time::Duration;

    struct Fixture {
        db: Arc<dyn Database>,
        workflow: Workflow,
        contractor: Uuid,
        project: Project,
        event: ChangeEvent,
    }

    async fn fixture(status: ChangeEventStatus) -> Fixture {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let contractor = Uuid::new_v4();
        let project = Project::new(contractor, "Maple St");
        db.insert_project(&project).await.unwrap();
        let (ingest, _) = db
            .insert_ingest_event(
                &NewIngestEvent::new(Channel::Gmail, Some("Floor"), "oak to tile")
                    .with_project(project.id),
            )
            .await
            .unwrap();
        let event = db
            .create_change_event_bundle(&ChangeEventBundle {
                event: NewChangeEvent {
                    project_id: Some(project.id),
                    status,
                    description: "Switch kitchen floor from oak to porcelain tile".into(),
                    area: Some("Kitchen".into()),
                    material_from: Some("oak".into()),
                    material_to: Some("porcelain tile".into()),
                    requester_name: None,
                    urgency: Urgency::Normal,
                    confidence_score: 0.95,
                    raw_text: None,
                    source_type: SourceType::Text,
                    prompt_version: None,
                    model_used: None,
                    tokens_used: 0,
                    processing_time_ms: 0,
                    embedding: None,
                },
                ingest_event_id: ingest.id,
                relevance_score: 0.95,
                actor_type: ActorType::Ai,
                actor_id: None,
                metadata: json!({}),
            })
            .await
            .unwrap();
        let tokens = ActionTokenService::new(db.clone(), Duration::from_secs(3600));
        let workflow = Workflow::new(db.clone(), tokens, EventBus::new());
        Fixture {
            db,
            workflow,
            contractor,
            project,
            event,
        }
    }

    #[tokio::test]
    async fn confirm_once_then_token_is_spent() {
        let f = fixture(ChangeEventStatus::Proposed).await;
        let token = f
            .workflow
            .tokens()
            .issue(f.event.id, TokenAction::Confirm, Some("c@example.com"))
            .await
            .unwrap();

        let confirmed = f.workflow.confirm(f.event.id, &token).await.unwrap();
        assert_eq!(confirmed.status, ChangeEventStatus::Confirmed);
        assert!(confirmed.confirmed_at.is_some());

        let err = f.workflow.confirm(f.event.id, &token).await.unwrap_err();
        assert!(matches!(err, WorkflowError::TokenAlreadyUsed));

        let history = f.workflow.history(f.event.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].from_status.as_deref(), Some("proposed"));
        assert_eq!(history[1].to_status, "confirmed");
        assert_eq!(history[1].actor_type, ActorType::Contractor);
    }

    #[tokio::test]
    async fn rejected_event_cannot_be_confirmed() {
        let f = fixture(ChangeEventStatus::ManualReview).await;
        let tokens = f.workflow.tokens();
        let reject = tokens.issue(f.event.id, TokenAction::Reject, None).await.unwrap();
        let confirm = tokens.issue(f.event.id, TokenAction::Confirm, None).await.unwrap();

        let rejected = f
            .workflow
            .reject(f.event.id, &reject, Some("  client changed mind ".into()))
            .await
            .unwrap();
        assert_eq!(rejected.status, ChangeEventStatus::Rejected);
        assert_eq!(rejected.rejection_reason.as_deref(), Some("client changed mind"));

        let err = f.workflow.confirm(f.event.id, &confirm).await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidTransition { .. }));
        // The failed attempt leaves the confirm token unspent
        assert!(tokens.verify(&confirm, f.event.id, TokenAction::Confirm).await.is_ok());
    }

    #[tokio::test]
    async fn sign_requires_confirmation() {
        let f = fixture(ChangeEventStatus::Proposed).await;
        let tokens = f.workflow.tokens();
        let sign = tokens.issue(f.event.id, TokenAction::Sign, Some("client@example.com")).await.unwrap();
        assert!(matches!(
            f.workflow.sign(f.event.id, &sign).await.unwrap_err(),
            WorkflowError::InvalidTransition { .. }
        ));

        let confirm = tokens.issue(f.event.id, TokenAction::Confirm, None).await.unwrap();
        f.workflow.confirm(f.event.id, &confirm).await.unwrap();
        let signed = f.workflow.sign(f.event.id, &sign).await.unwrap();
        assert_eq!(signed.status, ChangeEventStatus::Signed);

        let last = f.workflow.history(f.event.id).await.unwrap().pop().unwrap();
        assert_eq!(last.actor_type, ActorType::Client);
        assert_eq!(last.actor_id.as_deref(), Some("client@example.com"));
    }

    #[tokio::test]
    async fn edit_records_fields_and_checks_ownership() {
        let f = fixture(ChangeEventStatus::Proposed).await;
        let edit = ChangeEventEdit {
            material_to: Some("slate".into()),
            ..Default::default()
        };

        let err = f
            .workflow
            .edit(f.event.id, Uuid::new_v4(), edit.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Forbidden(_)));
        assert_eq!(f.db.list_transitions(f.event.id).await.unwrap().len(), 1);

        let edited = f.workflow.edit(f.event.id, f.contractor, edit).await.unwrap();
        assert_eq!(edited.material_to.as_deref(), Some("slate"));
        assert_eq!(edited.status, ChangeEventStatus::Proposed);

        let last = f.workflow.history(f.event.id).await.unwrap().pop().unwrap();
        assert_eq!(last.from_status.as_deref(), Some("proposed"));
        assert_eq!(last.to_status, "proposed");
        assert_eq!(last.metadata["edited_fields"], json!(["material_to"]));
    }

    #[tokio::test]
    async fn closed_events_are_not_editable() {
        let f = fixture(ChangeEventStatus::Proposed).await;
        let token = f
            .workflow
            .tokens()
            .issue(f.event.id, TokenAction::Reject, None)
            .await
            .unwrap();
        f.workflow.reject(f.event.id, &token, None).await.unwrap();

        let err = f
            .workflow
            .edit(
                f.event.id,
                f.contractor,
                ChangeEventEdit {
                    area: Some("Garage".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Conflict { .. }));
    }

    #[tokio::test]
    async fn manual_creation_is_proposed_with_full_confidence() {
        let f = fixture(ChangeEventStatus::Proposed).await;
        let mut rx = f.workflow.bus.subscribe();
        let created = f
            .workflow
            .create_manual(
                f.project.id,
                f.contractor,
                ManualChangeDraft {
                    description: "Add two outlets in the garage".into(),
                    area: Some("Garage".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(created.status, ChangeEventStatus::Proposed);
        assert_eq!(created.confidence_score, 1.0);
        assert_eq!(created.source_type, SourceType::Manual);
        assert!(matches!(
            rx.recv().await.unwrap(),
            PipelineEvent::ChangeEventCreated { .. }
        ));

        let err = f
            .workflow
            .create_manual(f.project.id, Uuid::new_v4(), ManualChangeDraft::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Forbidden(_)));

        let err = f
            .workflow
            .create_manual(f.project.id, f.contractor, ManualChangeDraft::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Invalid(_)));
    }

    #[tokio::test]
    async fn listing_is_contractor_scoped() {
        let f = fixture(ChangeEventStatus::Proposed).await;
        let listed = f
            .workflow
            .list_for_project(f.project.id, f.contractor, &ChangeEventQuery::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert!(matches!(
            f.workflow
                .list_for_project(f.project.id, Uuid::new_v4(), &ChangeEventQuery::default())
                .await
                .unwrap_err(),
            WorkflowError::Forbidden(_)
        ));
    }

    #[tokio::test]
    async fn missing_event_is_not_found() {
        let f = fixture(ChangeEventStatus::Proposed).await;
        assert!(matches!(
            f.workflow.history(Uuid::new_v4()).await.unwrap_err(),
            WorkflowError::NotFound { .. }
        ));
    }
}
