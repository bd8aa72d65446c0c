//! libSQL backend: async `Database` trait implementation.
//!
//! One connection serves every operation. It sits behind an async mutex so
//! a transaction never interleaves with writes from another task.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Transaction, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analysis::types::{SourceType, Urgency};
use crate::changes::model::{
    ActorType, ChangeEvent, ChangeEventBundle, ChangeEventEdit, ChangeEventQuery,
    ChangeEventSource, ChangeEventStatus, EntityType, NewTransition, StateTransition,
};
use crate::changes::tokens::{ActionToken, TokenAction};
use crate::error::DatabaseError;
use crate::ingest::model::{Channel, IngestEvent, NewIngestEvent, ProcessingStatus};
use crate::project::{Project, ProjectStatus};
use crate::store::migrations;
use crate::store::traits::{ClaimOutcome, Database, StatusChange, TransitionOutcome};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: LibSqlDatabase,
    conn: Mutex<Connection>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db,
            conn: Mutex::new(conn),
        })
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed precision keeps text ordering chronological.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str, column: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s)
        .map_err(|e| DatabaseError::Serialization(format!("{column}: invalid uuid {s:?}: {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_uuid(id: Option<Uuid>) -> libsql::Value {
    opt_text_owned(id.map(|u| u.to_string()))
}

fn query_err(op: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

/// Commit when `keep` accepts the outcome, otherwise roll back.
async fn finish<T>(
    tx: Transaction,
    result: Result<T, DatabaseError>,
    keep: impl Fn(&T) -> bool,
    op: &'static str,
) -> Result<T, DatabaseError> {
    match result {
        Ok(value) if keep(&value) => {
            tx.commit().await.map_err(query_err(op))?;
            Ok(value)
        }
        other => {
            if let Err(e) = tx.rollback().await {
                warn!(op, error = %e, "Rollback failed");
            }
            other
        }
    }
}

fn ingest_transition(from: Option<ProcessingStatus>, to: ProcessingStatus) -> NewTransition {
    NewTransition {
        from_status: from.map(|s| s.as_str().to_string()),
        to_status: to.as_str().to_string(),
        actor_type: ActorType::System,
        actor_id: None,
        metadata: serde_json::json!({}),
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

const PROJECT_COLUMNS: &str = "id, contractor_id, name, project_type, scope_summary, key_materials, client_name, client_email, status, created_at";

const INGEST_COLUMNS: &str = "id, project_id, channel, raw_payload, sender_email, sender_name, external_message_id, processing_status, error_message, received_at, processed_at";

const CHANGE_EVENT_COLUMNS: &str = "id, project_id, status, description, area, material_from, material_to, requester_name, urgency, confidence_score, raw_text, source_type, prompt_version, model_used, tokens_used, processing_time_ms, embedding, rejection_reason, created_at, updated_at, confirmed_at, rejected_at, signed_at";

const TRANSITION_COLUMNS: &str = "id, entity_type, entity_id, from_status, to_status, actor_type, actor_id, metadata, created_at";

const TOKEN_COLUMNS: &str = "token_hash, change_event_id, action, client_email, expires_at, used_at, created_at";

fn row_to_project(row: &libsql::Row) -> Result<Project, DatabaseError> {
    let get = |i| row.get::<String>(i).map_err(query_err("project row"));
    Ok(Project {
        id: parse_uuid(&get(0)?, "projects.id")?,
        contractor_id: parse_uuid(&get(1)?, "projects.contractor_id")?,
        name: get(2)?,
        project_type: row.get::<String>(3).ok(),
        scope_summary: row.get::<String>(4).ok(),
        key_materials: row.get::<String>(5).ok(),
        client_name: row.get::<String>(6).ok(),
        client_email: row.get::<String>(7).ok(),
        status: ProjectStatus::parse(&get(8)?),
        created_at: parse_datetime(&get(9)?),
    })
}

fn row_to_ingest_event(row: &libsql::Row) -> Result<IngestEvent, DatabaseError> {
    let get = |i| row.get::<String>(i).map_err(query_err("ingest event row"));
    let channel_str = get(2)?;
    let channel = Channel::parse(&channel_str).ok_or_else(|| {
        DatabaseError::Serialization(format!("ingest_events.channel: unknown {channel_str:?}"))
    })?;
    let raw_payload = serde_json::from_str(&get(3)?)
        .map_err(|e| DatabaseError::Serialization(format!("ingest_events.raw_payload: {e}")))?;
    let project_id = match row.get::<String>(1).ok() {
        Some(s) => Some(parse_uuid(&s, "ingest_events.project_id")?),
        None => None,
    };

    Ok(IngestEvent {
        id: parse_uuid(&get(0)?, "ingest_events.id")?,
        project_id,
        channel,
        raw_payload,
        sender_email: row.get::<String>(4).ok(),
        sender_name: row.get::<String>(5).ok(),
        external_message_id: row.get::<String>(6).ok(),
        processing_status: ProcessingStatus::parse(&get(7)?),
        error_message: row.get::<String>(8).ok(),
        received_at: parse_datetime(&get(9)?),
        processed_at: parse_optional_datetime(&row.get::<String>(10).ok()),
    })
}

fn row_to_change_event(row: &libsql::Row) -> Result<ChangeEvent, DatabaseError> {
    let get = |i| row.get::<String>(i).map_err(query_err("change event row"));
    let status_str = get(2)?;
    let status = ChangeEventStatus::parse(&status_str).ok_or_else(|| {
        DatabaseError::Serialization(format!("change_events.status: unknown {status_str:?}"))
    })?;
    let project_id = match row.get::<String>(1).ok() {
        Some(s) => Some(parse_uuid(&s, "change_events.project_id")?),
        None => None,
    };
    let embedding = row
        .get::<String>(16)
        .ok()
        .and_then(|s| serde_json::from_str::<Vec<f32>>(&s).ok());

    Ok(ChangeEvent {
        id: parse_uuid(&get(0)?, "change_events.id")?,
        project_id,
        status,
        description: get(3)?,
        area: row.get::<String>(4).ok(),
        material_from: row.get::<String>(5).ok(),
        material_to: row.get::<String>(6).ok(),
        requester_name: row.get::<String>(7).ok(),
        urgency: Urgency::parse(&get(8)?),
        confidence_score: row.get::<f64>(9).map_err(query_err("change event row"))?,
        raw_text: row.get::<String>(10).ok(),
        source_type: SourceType::parse(&get(11)?),
        prompt_version: row.get::<String>(12).ok(),
        model_used: row.get::<String>(13).ok(),
        tokens_used: row.get::<i64>(14).unwrap_or(0).max(0) as u32,
        processing_time_ms: row.get::<i64>(15).unwrap_or(0).max(0) as u64,
        embedding,
        rejection_reason: row.get::<String>(17).ok(),
        created_at: parse_datetime(&get(18)?),
        updated_at: parse_datetime(&get(19)?),
        confirmed_at: parse_optional_datetime(&row.get::<String>(20).ok()),
        rejected_at: parse_optional_datetime(&row.get::<String>(21).ok()),
        signed_at: parse_optional_datetime(&row.get::<String>(22).ok()),
    })
}

fn row_to_transition(row: &libsql::Row) -> Result<StateTransition, DatabaseError> {
    let get = |i| row.get::<String>(i).map_err(query_err("transition row"));
    let metadata = serde_json::from_str(&get(7)?)
        .map_err(|e| DatabaseError::Serialization(format!("state_transitions.metadata: {e}")))?;
    Ok(StateTransition {
        id: parse_uuid(&get(0)?, "state_transitions.id")?,
        entity_type: EntityType::parse(&get(1)?),
        entity_id: parse_uuid(&get(2)?, "state_transitions.entity_id")?,
        from_status: row.get::<String>(3).ok(),
        to_status: get(4)?,
        actor_type: ActorType::parse(&get(5)?),
        actor_id: row.get::<String>(6).ok(),
        metadata,
        created_at: parse_datetime(&get(8)?),
    })
}

fn row_to_token(row: &libsql::Row) -> Result<ActionToken, DatabaseError> {
    let get = |i| row.get::<String>(i).map_err(query_err("action token row"));
    let action_str = get(2)?;
    let action = TokenAction::parse(&action_str).ok_or_else(|| {
        DatabaseError::Serialization(format!("action_tokens.action: unknown {action_str:?}"))
    })?;
    Ok(ActionToken {
        token_hash: get(0)?,
        change_event_id: parse_uuid(&get(1)?, "action_tokens.change_event_id")?,
        action,
        client_email: row.get::<String>(3).ok(),
        expires_at: parse_datetime(&get(4)?),
        used_at: parse_optional_datetime(&row.get::<String>(5).ok()),
        created_at: parse_datetime(&get(6)?),
    })
}

// ── Connection-level operations shared by transactional methods ────

async fn insert_transition(
    conn: &Connection,
    entity_type: EntityType,
    entity_id: Uuid,
    transition: &NewTransition,
) -> Result<(), DatabaseError> {
    let metadata = serde_json::to_string(&transition.metadata)
        .map_err(|e| DatabaseError::Serialization(format!("transition metadata: {e}")))?;
    conn.execute(
        &format!("INSERT INTO state_transitions ({TRANSITION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
        params![
            Uuid::new_v4().to_string(),
            entity_type.as_str(),
            entity_id.to_string(),
            opt_text(transition.from_status.as_deref()),
            transition.to_status.as_str(),
            transition.actor_type.as_str(),
            opt_text(transition.actor_id.as_deref()),
            metadata,
            timestamp(Utc::now()),
        ],
    )
    .await
    .map_err(query_err("insert_transition"))?;
    Ok(())
}

async fn insert_ingest_row(
    conn: &Connection,
    id: Uuid,
    event: &NewIngestEvent,
    status: ProcessingStatus,
) -> Result<(), DatabaseError> {
    let payload = serde_json::to_string(&event.raw_payload)
        .map_err(|e| DatabaseError::Serialization(format!("raw_payload: {e}")))?;
    let now = timestamp(Utc::now());
    let processed_at = status.is_terminal().then(|| now.clone());
    conn.execute(
        &format!("INSERT INTO ingest_events ({INGEST_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9, ?10)"),
        params![
            id.to_string(),
            opt_uuid(event.project_id),
            event.channel.as_str(),
            payload,
            opt_text(event.sender_email.as_deref()),
            opt_text(event.sender_name.as_deref()),
            opt_text(event.external_message_id.as_deref()),
            status.as_str(),
            now,
            opt_text_owned(processed_at),
        ],
    )
    .await
    .map_err(query_err("insert_ingest_row"))?;
    Ok(())
}

async fn fetch_ingest_event(
    conn: &Connection,
    id: Uuid,
) -> Result<Option<IngestEvent>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {INGEST_COLUMNS} FROM ingest_events WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(query_err("get_ingest_event"))?;
    match rows.next().await.map_err(query_err("get_ingest_event"))? {
        Some(row) => Ok(Some(row_to_ingest_event(&row)?)),
        None => Ok(None),
    }
}

async fn fetch_change_event(
    conn: &Connection,
    id: Uuid,
) -> Result<Option<ChangeEvent>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {CHANGE_EVENT_COLUMNS} FROM change_events WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(query_err("get_change_event"))?;
    match rows.next().await.map_err(query_err("get_change_event"))? {
        Some(row) => Ok(Some(row_to_change_event(&row)?)),
        None => Ok(None),
    }
}

async fn require_change_event(conn: &Connection, id: Uuid) -> Result<ChangeEvent, DatabaseError> {
    fetch_change_event(conn, id)
        .await?
        .ok_or_else(|| DatabaseError::NotFound {
            entity: "change_event".into(),
            id: id.to_string(),
        })
}

/// Change event row, its source link, and its creation transition.
async fn insert_bundle(conn: &Connection, bundle: &ChangeEventBundle) -> Result<Uuid, DatabaseError> {
    let id = Uuid::new_v4();
    let event = &bundle.event;
    let now = timestamp(Utc::now());
    let embedding = match event.embedding.as_deref() {
        Some(v) if !v.is_empty() => Some(
            serde_json::to_string(v)
                .map_err(|e| DatabaseError::Serialization(format!("embedding: {e}")))?,
        ),
        _ => None,
    };

    conn.execute(
        "INSERT INTO change_events (id, project_id, status, description, area, material_from, material_to, requester_name, urgency, confidence_score, raw_text, source_type, prompt_version, model_used, tokens_used, processing_time_ms, embedding, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?18)",
        params![
            id.to_string(),
            opt_uuid(event.project_id),
            event.status.as_str(),
            event.description.as_str(),
            opt_text(event.area.as_deref()),
            opt_text(event.material_from.as_deref()),
            opt_text(event.material_to.as_deref()),
            opt_text(event.requester_name.as_deref()),
            event.urgency.as_str(),
            event.confidence_score,
            opt_text(event.raw_text.as_deref()),
            event.source_type.as_str(),
            opt_text(event.prompt_version.as_deref()),
            opt_text(event.model_used.as_deref()),
            event.tokens_used as i64,
            event.processing_time_ms as i64,
            opt_text_owned(embedding),
            now.clone(),
        ],
    )
    .await
    .map_err(query_err("insert_change_event"))?;

    conn.execute(
        "INSERT INTO change_event_sources (change_event_id, ingest_event_id, relevance_score, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            id.to_string(),
            bundle.ingest_event_id.to_string(),
            bundle.relevance_score,
            now,
        ],
    )
    .await
    .map_err(query_err("insert_change_event_source"))?;

    let mut transition = NewTransition::new(None, event.status, bundle.actor_type)
        .with_metadata(bundle.metadata.clone());
    transition.actor_id = bundle.actor_id.clone();
    insert_transition(conn, EntityType::ChangeEvent, id, &transition).await?;

    Ok(id)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        migrations::run_migrations(&conn).await
    }

    // ── Projects ────────────────────────────────────────────────────

    async fn insert_project(&self, project: &Project) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!("INSERT INTO projects ({PROJECT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
            params![
                project.id.to_string(),
                project.contractor_id.to_string(),
                project.name.as_str(),
                opt_text(project.project_type.as_deref()),
                opt_text(project.scope_summary.as_deref()),
                opt_text(project.key_materials.as_deref()),
                opt_text(project.client_name.as_deref()),
                opt_text(project.client_email.as_deref()),
                project.status.as_str(),
                timestamp(project.created_at),
            ],
        )
        .await
        .map_err(query_err("insert_project"))?;
        debug!(project_id = %project.id, "Project inserted");
        Ok(())
    }

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_project"))?;
        match rows.next().await.map_err(query_err("get_project"))? {
            Some(row) => Ok(Some(row_to_project(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_active_projects(
        &self,
        contractor_id: Option<Uuid>,
    ) -> Result<Vec<Project>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {PROJECT_COLUMNS} FROM projects WHERE status = 'active' AND (?1 IS NULL OR contractor_id = ?1) ORDER BY created_at, rowid"
                ),
                params![opt_uuid(contractor_id)],
            )
            .await
            .map_err(query_err("list_active_projects"))?;

        let mut projects = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_active_projects"))? {
            projects.push(row_to_project(&row)?);
        }
        Ok(projects)
    }

    // ── Ingest events ───────────────────────────────────────────────

    async fn insert_ingest_event(
        &self,
        event: &NewIngestEvent,
    ) -> Result<(IngestEvent, bool), DatabaseError> {
        let conn = self.conn.lock().await;

        if let Some(external_id) = event.external_message_id.as_deref() {
            let mut rows = conn
                .query(
                    &format!("SELECT {INGEST_COLUMNS} FROM ingest_events WHERE external_message_id = ?1"),
                    params![external_id],
                )
                .await
                .map_err(query_err("insert_ingest_event"))?;
            if let Some(row) = rows.next().await.map_err(query_err("insert_ingest_event"))? {
                let existing = row_to_ingest_event(&row)?;
                debug!(ingest_event_id = %existing.id, external_id, "Re-delivered message ignored");
                return Ok((existing, false));
            }
        }

        let id = Uuid::new_v4();
        let tx = conn.transaction().await.map_err(query_err("insert_ingest_event"))?;
        let result: Result<IngestEvent, DatabaseError> = async {
            insert_ingest_row(&tx, id, event, ProcessingStatus::Pending).await?;
            insert_transition(
                &tx,
                EntityType::IngestEvent,
                id,
                &ingest_transition(None, ProcessingStatus::Pending),
            )
            .await?;
            fetch_ingest_event(&tx, id).await?.ok_or_else(|| DatabaseError::NotFound {
                entity: "ingest_event".into(),
                id: id.to_string(),
            })
        }
        .await;
        let stored = finish(tx, result, |_| true, "insert_ingest_event").await?;
        debug!(ingest_event_id = %id, channel = %event.channel, "Ingest event inserted");
        Ok((stored, true))
    }

    async fn get_ingest_event(&self, id: Uuid) -> Result<Option<IngestEvent>, DatabaseError> {
        let conn = self.conn.lock().await;
        fetch_ingest_event(&conn, id).await
    }

    async fn claim_ingest_event(&self, id: Uuid) -> Result<ClaimOutcome, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = conn.transaction().await.map_err(query_err("claim_ingest_event"))?;
        let result: Result<ClaimOutcome, DatabaseError> = async {
            let updated = tx
                .execute(
                    "UPDATE ingest_events SET processing_status = 'processing' WHERE id = ?1 AND processing_status = 'pending'",
                    params![id.to_string()],
                )
                .await
                .map_err(query_err("claim_ingest_event"))?;
            if updated == 0 {
                return Ok(match fetch_ingest_event(&tx, id).await? {
                    None => ClaimOutcome::NotFound,
                    Some(e) if e.processing_status.is_terminal() => {
                        ClaimOutcome::Finished(e.processing_status)
                    }
                    Some(_) => ClaimOutcome::Busy,
                });
            }
            insert_transition(
                &tx,
                EntityType::IngestEvent,
                id,
                &ingest_transition(Some(ProcessingStatus::Pending), ProcessingStatus::Processing),
            )
            .await?;
            match fetch_ingest_event(&tx, id).await? {
                Some(e) => Ok(ClaimOutcome::Claimed(e)),
                None => Ok(ClaimOutcome::NotFound),
            }
        }
        .await;
        finish(
            tx,
            result,
            |o| matches!(o, ClaimOutcome::Claimed(_)),
            "claim_ingest_event",
        )
        .await
    }

    async fn mark_ingest_completed(&self, id: Uuid) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = conn.transaction().await.map_err(query_err("mark_ingest_completed"))?;
        let result: Result<(), DatabaseError> = async {
            let updated = tx
                .execute(
                    "UPDATE ingest_events SET processing_status = 'completed', processed_at = ?1, error_message = NULL WHERE id = ?2 AND processing_status = 'processing'",
                    params![timestamp(Utc::now()), id.to_string()],
                )
                .await
                .map_err(query_err("mark_ingest_completed"))?;
            if updated == 0 {
                return Err(DatabaseError::Constraint(format!(
                    "ingest event {id} is not processing"
                )));
            }
            insert_transition(
                &tx,
                EntityType::IngestEvent,
                id,
                &ingest_transition(Some(ProcessingStatus::Processing), ProcessingStatus::Completed),
            )
            .await
        }
        .await;
        finish(tx, result, |_| true, "mark_ingest_completed").await
    }

    async fn fail_ingest_with_fallback(
        &self,
        id: Uuid,
        error_excerpt: &str,
        fallback: &ChangeEventBundle,
    ) -> Result<ChangeEvent, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = conn.transaction().await.map_err(query_err("fail_ingest_with_fallback"))?;
        let result: Result<ChangeEvent, DatabaseError> = async {
            let updated = tx
                .execute(
                    "UPDATE ingest_events SET processing_status = 'failed', processed_at = ?1, error_message = ?2 WHERE id = ?3 AND processing_status = 'processing'",
                    params![timestamp(Utc::now()), error_excerpt, id.to_string()],
                )
                .await
                .map_err(query_err("fail_ingest_with_fallback"))?;
            if updated == 0 {
                return Err(DatabaseError::Constraint(format!(
                    "ingest event {id} is not processing"
                )));
            }
            let transition =
                ingest_transition(Some(ProcessingStatus::Processing), ProcessingStatus::Failed)
                    .with_metadata(serde_json::json!({ "error": error_excerpt }));
            insert_transition(&tx, EntityType::IngestEvent, id, &transition).await?;

            let change_event_id = insert_bundle(&tx, fallback).await?;
            require_change_event(&tx, change_event_id).await
        }
        .await;
        finish(tx, result, |_| true, "fail_ingest_with_fallback").await
    }

    async fn reset_stale_processing(&self) -> Result<usize, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = conn.transaction().await.map_err(query_err("reset_stale_processing"))?;
        let result: Result<usize, DatabaseError> = async {
            let mut rows = tx
                .query(
                    "SELECT id FROM ingest_events WHERE processing_status = 'processing'",
                    (),
                )
                .await
                .map_err(query_err("reset_stale_processing"))?;
            let mut ids = Vec::new();
            while let Some(row) = rows.next().await.map_err(query_err("reset_stale_processing"))? {
                let id: String = row.get(0).map_err(query_err("reset_stale_processing"))?;
                ids.push(parse_uuid(&id, "ingest_events.id")?);
            }
            drop(rows);

            for id in &ids {
                tx.execute(
                    "UPDATE ingest_events SET processing_status = 'pending' WHERE id = ?1",
                    params![id.to_string()],
                )
                .await
                .map_err(query_err("reset_stale_processing"))?;
                let transition = ingest_transition(
                    Some(ProcessingStatus::Processing),
                    ProcessingStatus::Pending,
                )
                .with_metadata(serde_json::json!({ "reason": "recovered_after_restart" }));
                insert_transition(&tx, EntityType::IngestEvent, *id, &transition).await?;
            }
            Ok(ids.len())
        }
        .await;
        finish(tx, result, |_| true, "reset_stale_processing").await
    }

    async fn list_ingest_ids_by_status(
        &self,
        status: ProcessingStatus,
    ) -> Result<Vec<Uuid>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT id FROM ingest_events WHERE processing_status = ?1 ORDER BY received_at, rowid",
                params![status.as_str()],
            )
            .await
            .map_err(query_err("list_ingest_ids_by_status"))?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_ingest_ids_by_status"))? {
            let id: String = row.get(0).map_err(query_err("list_ingest_ids_by_status"))?;
            ids.push(parse_uuid(&id, "ingest_events.id")?);
        }
        Ok(ids)
    }

    // ── Change events ───────────────────────────────────────────────

    async fn create_change_event_bundle(
        &self,
        bundle: &ChangeEventBundle,
    ) -> Result<ChangeEvent, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = conn.transaction().await.map_err(query_err("create_change_event_bundle"))?;
        let result: Result<ChangeEvent, DatabaseError> = async {
            let id = insert_bundle(&tx, bundle).await?;
            require_change_event(&tx, id).await
        }
        .await;
        let event = finish(tx, result, |_| true, "create_change_event_bundle").await?;
        debug!(
            change_event_id = %event.id,
            ingest_event_id = %bundle.ingest_event_id,
            status = %event.status,
            "Change event persisted"
        );
        Ok(event)
    }

    async fn create_manual_change_event(
        &self,
        ingest_id: Uuid,
        ingest: &NewIngestEvent,
        bundle: &ChangeEventBundle,
    ) -> Result<ChangeEvent, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = conn.transaction().await.map_err(query_err("create_manual_change_event"))?;
        let result: Result<ChangeEvent, DatabaseError> = async {
            insert_ingest_row(&tx, ingest_id, ingest, ProcessingStatus::Completed).await?;
            let mut transition = ingest_transition(None, ProcessingStatus::Completed);
            transition.actor_type = bundle.actor_type;
            transition.actor_id = bundle.actor_id.clone();
            insert_transition(&tx, EntityType::IngestEvent, ingest_id, &transition).await?;

            let id = insert_bundle(&tx, bundle).await?;
            require_change_event(&tx, id).await
        }
        .await;
        finish(tx, result, |_| true, "create_manual_change_event").await
    }

    async fn attach_source(
        &self,
        change_event_id: Uuid,
        ingest_event_id: Uuid,
        relevance_score: f64,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn.lock().await;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO change_event_sources (change_event_id, ingest_event_id, relevance_score, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    change_event_id.to_string(),
                    ingest_event_id.to_string(),
                    relevance_score,
                    timestamp(Utc::now()),
                ],
            )
            .await
            .map_err(query_err("attach_source"))?;
        Ok(inserted > 0)
    }

    async fn find_sourced_change_event(
        &self,
        ingest_event_id: Uuid,
        description: &str,
    ) -> Result<Option<Uuid>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT ce.id FROM change_events ce JOIN change_event_sources s ON s.change_event_id = ce.id WHERE s.ingest_event_id = ?1 AND ce.description = ?2 LIMIT 1",
                params![ingest_event_id.to_string(), description],
            )
            .await
            .map_err(query_err("find_sourced_change_event"))?;
        match rows.next().await.map_err(query_err("find_sourced_change_event"))? {
            Some(row) => {
                let id: String = row.get(0).map_err(query_err("find_sourced_change_event"))?;
                Ok(Some(parse_uuid(&id, "change_events.id")?))
            }
            None => Ok(None),
        }
    }

    async fn get_change_event(&self, id: Uuid) -> Result<Option<ChangeEvent>, DatabaseError> {
        let conn = self.conn.lock().await;
        fetch_change_event(&conn, id).await
    }

    async fn list_change_events(
        &self,
        project_id: Uuid,
        query: &ChangeEventQuery,
    ) -> Result<Vec<ChangeEvent>, DatabaseError> {
        let conn = self.conn.lock().await;
        // SQLite treats a negative LIMIT as unbounded.
        let limit = if query.limit == 0 { -1 } else { query.limit as i64 };
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CHANGE_EVENT_COLUMNS} FROM change_events WHERE project_id = ?1 AND (?2 IS NULL OR status = ?2) ORDER BY created_at DESC, rowid DESC LIMIT ?3 OFFSET ?4"
                ),
                params![
                    project_id.to_string(),
                    opt_text(query.status.map(|s| s.as_str())),
                    limit,
                    query.offset as i64,
                ],
            )
            .await
            .map_err(query_err("list_change_events"))?;

        let mut events = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_change_events"))? {
            events.push(row_to_change_event(&row)?);
        }
        Ok(events)
    }

    async fn list_embedded_change_events(
        &self,
        project_id: Uuid,
        exclude: Option<Uuid>,
    ) -> Result<Vec<(Uuid, Vec<f32>)>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT id, embedding FROM change_events WHERE project_id = ?1 AND embedding IS NOT NULL AND (?2 IS NULL OR id != ?2)",
                params![project_id.to_string(), opt_uuid(exclude)],
            )
            .await
            .map_err(query_err("list_embedded_change_events"))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_embedded_change_events"))? {
            let id: String = row.get(0).map_err(query_err("list_embedded_change_events"))?;
            let raw: String = row.get(1).map_err(query_err("list_embedded_change_events"))?;
            match serde_json::from_str::<Vec<f32>>(&raw) {
                Ok(v) if !v.is_empty() => out.push((parse_uuid(&id, "change_events.id")?, v)),
                Ok(_) => {}
                Err(e) => warn!(change_event_id = %id, error = %e, "Unreadable embedding skipped"),
            }
        }
        Ok(out)
    }

    async fn list_sources(
        &self,
        change_event_id: Uuid,
    ) -> Result<Vec<ChangeEventSource>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT change_event_id, ingest_event_id, relevance_score, created_at FROM change_event_sources WHERE change_event_id = ?1 ORDER BY created_at, rowid",
                params![change_event_id.to_string()],
            )
            .await
            .map_err(query_err("list_sources"))?;

        let mut sources = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_sources"))? {
            let ce: String = row.get(0).map_err(query_err("list_sources"))?;
            let ie: String = row.get(1).map_err(query_err("list_sources"))?;
            let created: String = row.get(3).map_err(query_err("list_sources"))?;
            sources.push(ChangeEventSource {
                change_event_id: parse_uuid(&ce, "change_event_sources.change_event_id")?,
                ingest_event_id: parse_uuid(&ie, "change_event_sources.ingest_event_id")?,
                relevance_score: row.get::<f64>(2).map_err(query_err("list_sources"))?,
                created_at: parse_datetime(&created),
            });
        }
        Ok(sources)
    }

    async fn edit_change_event(
        &self,
        id: Uuid,
        expected: ChangeEventStatus,
        edit: &ChangeEventEdit,
        transition: &NewTransition,
    ) -> Result<TransitionOutcome, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = conn.transaction().await.map_err(query_err("edit_change_event"))?;
        let result: Result<TransitionOutcome, DatabaseError> = async {
            let updated = tx
                .execute(
                    "UPDATE change_events SET description = COALESCE(?1, description), area = COALESCE(?2, area), material_from = COALESCE(?3, material_from), material_to = COALESCE(?4, material_to), urgency = COALESCE(?5, urgency), updated_at = ?6 WHERE id = ?7 AND status = ?8",
                    params![
                        opt_text(edit.description.as_deref()),
                        opt_text(edit.area.as_deref()),
                        opt_text(edit.material_from.as_deref()),
                        opt_text(edit.material_to.as_deref()),
                        opt_text(edit.urgency.map(|u| u.as_str())),
                        timestamp(Utc::now()),
                        id.to_string(),
                        expected.as_str(),
                    ],
                )
                .await
                .map_err(query_err("edit_change_event"))?;
            if updated == 0 {
                return Ok(match fetch_change_event(&tx, id).await? {
                    Some(e) => TransitionOutcome::StatusMismatch { current: e.status },
                    None => TransitionOutcome::NotFound,
                });
            }
            insert_transition(&tx, EntityType::ChangeEvent, id, transition).await?;
            Ok(TransitionOutcome::Applied(require_change_event(&tx, id).await?))
        }
        .await;
        finish(
            tx,
            result,
            |o| matches!(o, TransitionOutcome::Applied(_)),
            "edit_change_event",
        )
        .await
    }

    async fn apply_status_change(
        &self,
        change: &StatusChange,
    ) -> Result<TransitionOutcome, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = conn.transaction().await.map_err(query_err("apply_status_change"))?;
        let id = change.change_event_id;
        let result: Result<TransitionOutcome, DatabaseError> = async {
            let now = timestamp(Utc::now());

            if let Some(hash) = change.token_hash.as_deref() {
                let consumed = tx
                    .execute(
                        "UPDATE action_tokens SET used_at = ?1 WHERE token_hash = ?2 AND used_at IS NULL",
                        params![now.clone(), hash],
                    )
                    .await
                    .map_err(query_err("apply_status_change"))?;
                if consumed == 0 {
                    return Ok(TransitionOutcome::TokenAlreadyUsed);
                }
            }

            let stamp = match change.to {
                ChangeEventStatus::Confirmed => ", confirmed_at = ?2",
                ChangeEventStatus::Rejected => ", rejected_at = ?2",
                ChangeEventStatus::Signed => ", signed_at = ?2",
                _ => "",
            };
            let updated = tx
                .execute(
                    &format!(
                        "UPDATE change_events SET status = ?1, updated_at = ?2, rejection_reason = COALESCE(?3, rejection_reason){stamp} WHERE id = ?4 AND status = ?5"
                    ),
                    params![
                        change.to.as_str(),
                        now,
                        opt_text(change.rejection_reason.as_deref()),
                        id.to_string(),
                        change.from.as_str(),
                    ],
                )
                .await
                .map_err(query_err("apply_status_change"))?;
            if updated == 0 {
                return Ok(match fetch_change_event(&tx, id).await? {
                    Some(e) => TransitionOutcome::StatusMismatch { current: e.status },
                    None => TransitionOutcome::NotFound,
                });
            }

            insert_transition(&tx, EntityType::ChangeEvent, id, &change.transition).await?;
            Ok(TransitionOutcome::Applied(require_change_event(&tx, id).await?))
        }
        .await;
        finish(
            tx,
            result,
            |o| matches!(o, TransitionOutcome::Applied(_)),
            "apply_status_change",
        )
        .await
    }

    // ── Transition log ──────────────────────────────────────────────

    async fn list_transitions(
        &self,
        entity_id: Uuid,
    ) -> Result<Vec<StateTransition>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {TRANSITION_COLUMNS} FROM state_transitions WHERE entity_id = ?1 ORDER BY created_at, rowid"
                ),
                params![entity_id.to_string()],
            )
            .await
            .map_err(query_err("list_transitions"))?;

        let mut transitions = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_transitions"))? {
            transitions.push(row_to_transition(&row)?);
        }
        Ok(transitions)
    }

    // ── Action tokens ───────────────────────────────────────────────

    async fn insert_action_token(&self, token: &ActionToken) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(
            &format!("INSERT INTO action_tokens ({TOKEN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                token.token_hash.as_str(),
                token.change_event_id.to_string(),
                token.action.as_str(),
                opt_text(token.client_email.as_deref()),
                timestamp(token.expires_at),
                opt_text_owned(token.used_at.map(timestamp)),
                timestamp(token.created_at),
            ],
        )
        .await
        .map_err(query_err("insert_action_token"))?;
        Ok(())
    }

    async fn get_action_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<ActionToken>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("SELECT {TOKEN_COLUMNS} FROM action_tokens WHERE token_hash = ?1"),
                params![token_hash],
            )
            .await
            .map_err(query_err("get_action_token"))?;
        match rows.next().await.map_err(query_err("get_action_token"))? {
            Some(row) => Ok(Some(row_to_token(&row)?)),
            None => Ok(None),
        }
    }

    async fn consume_action_token(&self, token_hash: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn.lock().await;
        let updated = conn
            .execute(
                "UPDATE action_tokens SET used_at = ?1 WHERE token_hash = ?2 AND used_at IS NULL",
                params![timestamp(Utc::now()), token_hash],
            )
            .await
            .map_err(query_err("consume_action_token"))?;
        Ok(updated > 0)
    }
}
