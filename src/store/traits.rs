//! Unified `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use uuid::Uuid;

use crate::changes::model::{
    ChangeEvent, ChangeEventBundle, ChangeEventEdit, ChangeEventQuery, ChangeEventSource,
    ChangeEventStatus, NewTransition, StateTransition,
};
use crate::changes::tokens::ActionToken;
use crate::error::DatabaseError;
use crate::ingest::model::{IngestEvent, NewIngestEvent, ProcessingStatus};
use crate::project::Project;

/// Result of trying to take ownership of an ingest event.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// Moved `pending -> processing`; the caller now owns it.
    Claimed(IngestEvent),
    /// Another attempt holds it.
    Busy,
    /// Already `completed` or `failed`; re-delivery is acknowledged and dropped.
    Finished(ProcessingStatus),
    NotFound,
}

/// Result of a conditional change-event write.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Applied(ChangeEvent),
    /// The row was not in the expected status; nothing was written.
    StatusMismatch { current: ChangeEventStatus },
    /// The token was consumed concurrently; nothing was written.
    TokenAlreadyUsed,
    NotFound,
}

/// A status change applied atomically with its audit record and,
/// optionally, consumption of the action token that authorized it.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub change_event_id: Uuid,
    pub from: ChangeEventStatus,
    pub to: ChangeEventStatus,
    pub transition: NewTransition,
    pub token_hash: Option<String>,
    pub rejection_reason: Option<String>,
}

/// Backend-agnostic database trait covering projects, ingest events,
/// change events, the transition log, and action tokens.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Projects ────────────────────────────────────────────────────

    async fn insert_project(&self, project: &Project) -> Result<(), DatabaseError>;

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, DatabaseError>;

    /// Active projects, optionally restricted to one contractor.
    async fn list_active_projects(
        &self,
        contractor_id: Option<Uuid>,
    ) -> Result<Vec<Project>, DatabaseError>;

    // ── Ingest events ───────────────────────────────────────────────

    /// Insert a pending ingest event with its creation transition.
    ///
    /// When `external_message_id` matches an existing row, that row is
    /// returned instead and the flag is `false`.
    async fn insert_ingest_event(
        &self,
        event: &NewIngestEvent,
    ) -> Result<(IngestEvent, bool), DatabaseError>;

    async fn get_ingest_event(&self, id: Uuid) -> Result<Option<IngestEvent>, DatabaseError>;

    /// Conditionally move `pending -> processing`.
    async fn claim_ingest_event(&self, id: Uuid) -> Result<ClaimOutcome, DatabaseError>;

    /// `processing -> completed`, stamping `processed_at`.
    async fn mark_ingest_completed(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// In one transaction: `processing -> failed` with the error excerpt,
    /// plus the fallback change event bundle. Returns the fallback event.
    async fn fail_ingest_with_fallback(
        &self,
        id: Uuid,
        error_excerpt: &str,
        fallback: &ChangeEventBundle,
    ) -> Result<ChangeEvent, DatabaseError>;

    /// Put events abandoned in `processing` back to `pending`. Returns the count.
    async fn reset_stale_processing(&self) -> Result<usize, DatabaseError>;

    /// Ids in the given status, oldest first.
    async fn list_ingest_ids_by_status(
        &self,
        status: ProcessingStatus,
    ) -> Result<Vec<Uuid>, DatabaseError>;

    // ── Change events ───────────────────────────────────────────────

    /// Insert change event, source link, and creation transition atomically.
    async fn create_change_event_bundle(
        &self,
        bundle: &ChangeEventBundle,
    ) -> Result<ChangeEvent, DatabaseError>;

    /// Insert a `completed` manual ingest event with id `ingest_id`, then
    /// the bundle, all in one transaction.
    async fn create_manual_change_event(
        &self,
        ingest_id: Uuid,
        ingest: &NewIngestEvent,
        bundle: &ChangeEventBundle,
    ) -> Result<ChangeEvent, DatabaseError>;

    /// Link another ingest event to an existing change event.
    /// Returns `false` when the link already existed.
    async fn attach_source(
        &self,
        change_event_id: Uuid,
        ingest_event_id: Uuid,
        relevance_score: f64,
    ) -> Result<bool, DatabaseError>;

    async fn get_change_event(&self, id: Uuid) -> Result<Option<ChangeEvent>, DatabaseError>;

    /// Change events of a project, newest first.
    async fn list_change_events(
        &self,
        project_id: Uuid,
        query: &ChangeEventQuery,
    ) -> Result<Vec<ChangeEvent>, DatabaseError>;

    /// `(id, embedding)` of every event in the project that has one.
    async fn list_embedded_change_events(
        &self,
        project_id: Uuid,
        exclude: Option<Uuid>,
    ) -> Result<Vec<(Uuid, Vec<f32>)>, DatabaseError>;

    async fn list_sources(
        &self,
        change_event_id: Uuid,
    ) -> Result<Vec<ChangeEventSource>, DatabaseError>;

    /// A change event already sourced from `ingest_event_id` with exactly
    /// this description, if one exists.
    async fn find_sourced_change_event(
        &self,
        ingest_event_id: Uuid,
        description: &str,
    ) -> Result<Option<Uuid>, DatabaseError>;

    /// Apply field edits if the event is still in `expected`, recording
    /// `transition` in the same transaction.
    async fn edit_change_event(
        &self,
        id: Uuid,
        expected: ChangeEventStatus,
        edit: &ChangeEventEdit,
        transition: &NewTransition,
    ) -> Result<TransitionOutcome, DatabaseError>;

    /// Optimistic status change: token consumption (if any), conditional
    /// update, and transition insert commit together or not at all.
    async fn apply_status_change(
        &self,
        change: &StatusChange,
    ) -> Result<TransitionOutcome, DatabaseError>;

    // ── Transition log ──────────────────────────────────────────────

    /// Full history of an entity, oldest first.
    async fn list_transitions(&self, entity_id: Uuid)
    -> Result<Vec<StateTransition>, DatabaseError>;

    // ── Action tokens ───────────────────────────────────────────────

    async fn insert_action_token(&self, token: &ActionToken) -> Result<(), DatabaseError>;

    async fn get_action_token(&self, token_hash: &str)
    -> Result<Option<ActionToken>, DatabaseError>;

    /// Set `used_at` if unset. Returns `false` if it was already used.
    async fn consume_action_token(&self, token_hash: &str) -> Result<bool, DatabaseError>;
}
