//! Error types for Site Trace.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Extraction error: {0}")]
    Extract(#[from] ExtractError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Byte-level document/image extraction errors.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("Unsupported media type: {0}")]
    Unsupported(String),

    #[error("Corrupt {media_type} input: {reason}")]
    Corrupt { media_type: String, reason: String },

    #[error("Attachment {0} has no retrievable content")]
    Empty(String),
}

/// Failure of a single analysis capability call.
///
/// These never leave a phase: they are folded into `AnalysisMetadata::error`.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("{capability} call failed: {source}")]
    Capability {
        capability: &'static str,
        #[source]
        source: LlmError,
    },

    #[error("{capability} call exceeded {timeout:?}")]
    Timeout {
        capability: &'static str,
        timeout: Duration,
    },

    #[error("Extraction failed: {0}")]
    Extract(#[from] ExtractError),
}

impl AnalysisError {
    /// Provider failures and deadlines, as opposed to bad input.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Capability { .. } | Self::Timeout { .. })
    }
}

/// Ingestion errors.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Project {0} not found")]
    UnknownProject(Uuid),

    #[error("Processing queue closed")]
    QueueClosed,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Catastrophic pipeline errors that reach the retry layer.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Ingest event {0} not found")]
    IngestEventNotFound(Uuid),

    #[error("Project {id} could not be loaded: {reason}")]
    ProjectLoad { id: Uuid, reason: String },

    #[error("Processing attempt exceeded {0:?}")]
    Timeout(Duration),

    #[error("Analysis unavailable: all {failed} capability calls failed, last: {last_error}")]
    AnalysisUnavailable { failed: usize, last_error: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Approval workflow errors: conflicts and authorization failures.
///
/// Never retried. Each maps to a distinct HTTP status in the API layer.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Not permitted: {0}")]
    Forbidden(String),

    #[error("Invalid action token")]
    InvalidToken,

    #[error("Action token has expired")]
    TokenExpired,

    #[error("Action token has already been used")]
    TokenAlreadyUsed,

    #[error("Change event {id} is {current}, expected {expected}")]
    Conflict {
        id: Uuid,
        current: String,
        expected: String,
    },

    #[error("Change event {id} cannot move from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Notification delivery errors. Logged by the dispatcher, never propagated
/// into the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Delivery via {channel} failed: {reason}")]
    Delivery { channel: String, reason: String },

    #[error("Could not issue action link: {0}")]
    ActionLink(#[from] WorkflowError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
