//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                contractor_id TEXT NOT NULL,
                name TEXT NOT NULL,
                project_type TEXT,
                scope_summary TEXT,
                key_materials TEXT,
                client_name TEXT,
                client_email TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_projects_contractor ON projects(contractor_id);
            CREATE INDEX IF NOT EXISTS idx_projects_status ON projects(status);

            CREATE TABLE IF NOT EXISTS ingest_events (
                id TEXT PRIMARY KEY,
                project_id TEXT REFERENCES projects(id),
                channel TEXT NOT NULL,
                raw_payload TEXT NOT NULL,
                sender_email TEXT,
                sender_name TEXT,
                external_message_id TEXT,
                processing_status TEXT NOT NULL DEFAULT 'pending',
                error_message TEXT,
                received_at TEXT NOT NULL,
                processed_at TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_ingest_events_external_id
                ON ingest_events(external_message_id) WHERE external_message_id IS NOT NULL;
            CREATE INDEX IF NOT EXISTS idx_ingest_events_status ON ingest_events(processing_status);

            CREATE TABLE IF NOT EXISTS change_events (
                id TEXT PRIMARY KEY,
                project_id TEXT REFERENCES projects(id),
                status TEXT NOT NULL,
                description TEXT NOT NULL,
                area TEXT,
                material_from TEXT,
                material_to TEXT,
                requester_name TEXT,
                urgency TEXT NOT NULL DEFAULT 'normal',
                confidence_score REAL NOT NULL,
                raw_text TEXT,
                source_type TEXT NOT NULL DEFAULT 'text',
                prompt_version TEXT,
                model_used TEXT,
                tokens_used INTEGER NOT NULL DEFAULT 0,
                processing_time_ms INTEGER NOT NULL DEFAULT 0,
                embedding TEXT,
                rejection_reason TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                confirmed_at TEXT,
                rejected_at TEXT,
                signed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_change_events_project ON change_events(project_id);
            CREATE INDEX IF NOT EXISTS idx_change_events_status ON change_events(status);

            CREATE TABLE IF NOT EXISTS change_event_sources (
                change_event_id TEXT NOT NULL REFERENCES change_events(id),
                ingest_event_id TEXT NOT NULL REFERENCES ingest_events(id),
                relevance_score REAL NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (change_event_id, ingest_event_id)
            );
            CREATE INDEX IF NOT EXISTS idx_change_event_sources_ingest
                ON change_event_sources(ingest_event_id);

            CREATE TABLE IF NOT EXISTS state_transitions (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                from_status TEXT,
                to_status TEXT NOT NULL,
                actor_type TEXT NOT NULL,
                actor_id TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_state_transitions_entity
                ON state_transitions(entity_id);
        "#,
    },
    Migration {
        version: 2,
        name: "action_tokens",
        sql: r#"
            CREATE TABLE IF NOT EXISTS action_tokens (
                token_hash TEXT PRIMARY KEY,
                change_event_id TEXT NOT NULL REFERENCES change_events(id),
                action TEXT NOT NULL,
                client_email TEXT,
                expires_at TEXT NOT NULL,
                used_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_action_tokens_change_event
                ON action_tokens(change_event_id);
        "#,
    },
];

/// Apply every migration newer than the recorded version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
