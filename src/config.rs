//! Configuration types.
//!
//! Every knob has a default and can be overridden from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Tuning for the ingestion-to-change-event pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Proposals at or above this confidence enter as `proposed`, the rest as `manual_review`.
    pub confidence_threshold: f64,
    /// Jaccard similarity at which two proposals in one batch are considered the same.
    pub dedup_threshold: f64,
    /// Deadline for each external classification call.
    pub call_timeout: Duration,
    /// Wall-clock ceiling for one processing attempt.
    pub job_timeout: Duration,
    /// Attempts before an ingest event is marked `failed`.
    pub max_attempts: u32,
    /// First retry delay; doubled per attempt.
    pub retry_base_delay: Duration,
    /// Upper bound on any single retry delay.
    pub retry_max_delay: Duration,
    /// Embedded PDF images smaller than this are treated as icons/logos.
    pub min_embedded_image_bytes: usize,
    /// Extracted document text beyond this is cut with a marker.
    pub max_document_chars: usize,
    /// Source text stored on a change event is cut to this many chars.
    pub raw_text_limit: usize,
    /// Lifetime of an emailed action token.
    pub action_token_ttl: Duration,
    /// Ingest events processed at once by the worker.
    pub worker_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.70,
            dedup_threshold: 0.92,
            call_timeout: Duration::from_secs(30),
            job_timeout: Duration::from_secs(90),
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(30),
            retry_max_delay: Duration::from_secs(30 * 60),
            min_embedded_image_bytes: 10 * 1024,
            max_document_chars: 10_000,
            raw_text_limit: 2000,
            action_token_ttl: Duration::from_secs(48 * 3600),
            worker_concurrency: 4,
        }
    }
}

impl PipelineConfig {
    /// Load from `SITE_TRACE_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            confidence_threshold: unit_interval(
                "SITE_TRACE_CONFIDENCE_THRESHOLD",
                d.confidence_threshold,
            )?,
            dedup_threshold: unit_interval("SITE_TRACE_DEDUP_THRESHOLD", d.dedup_threshold)?,
            call_timeout: Duration::from_secs(env_or(
                "SITE_TRACE_CALL_TIMEOUT_SECS",
                d.call_timeout.as_secs(),
            )?),
            job_timeout: Duration::from_secs(env_or(
                "SITE_TRACE_JOB_TIMEOUT_SECS",
                d.job_timeout.as_secs(),
            )?),
            max_attempts: env_or("SITE_TRACE_MAX_ATTEMPTS", d.max_attempts)?.max(1),
            retry_base_delay: Duration::from_millis(env_or(
                "SITE_TRACE_RETRY_BASE_MS",
                d.retry_base_delay.as_millis() as u64,
            )?),
            retry_max_delay: Duration::from_millis(env_or(
                "SITE_TRACE_RETRY_MAX_MS",
                d.retry_max_delay.as_millis() as u64,
            )?),
            min_embedded_image_bytes: env_or(
                "SITE_TRACE_MIN_EMBEDDED_IMAGE_BYTES",
                d.min_embedded_image_bytes,
            )?,
            max_document_chars: env_or("SITE_TRACE_MAX_DOCUMENT_CHARS", d.max_document_chars)?,
            raw_text_limit: env_or("SITE_TRACE_RAW_TEXT_LIMIT", d.raw_text_limit)?,
            action_token_ttl: Duration::from_secs(
                env_or("SITE_TRACE_ACTION_TOKEN_HOURS", 48u64)? * 3600,
            ),
            worker_concurrency: env_or("SITE_TRACE_WORKER_CONCURRENCY", d.worker_concurrency)?
                .max(1),
        })
    }
}

/// Model and API credentials.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub anthropic_api_key: SecretString,
    pub model: String,
    /// Absent key disables embeddings; the resolver then always creates.
    pub openai_api_key: Option<SecretString>,
}

impl LlmSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let anthropic_api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".into()))?;
        Ok(Self {
            anthropic_api_key: SecretString::from(anthropic_api_key),
            model: std::env::var("SITE_TRACE_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string()),
            openai_api_key: std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
        })
    }
}

/// HTTP server and storage location.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub db_path: PathBuf,
    /// Base URL that action links in notifications point at.
    pub public_url: String,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = env_or("SITE_TRACE_PORT", 8080u16)?;
        Ok(Self {
            port,
            db_path: std::env::var("SITE_TRACE_DB_PATH")
                .unwrap_or_else(|_| "./data/site-trace.db".to_string())
                .into(),
            public_url: std::env::var("SITE_TRACE_PUBLIC_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| format!("http://localhost:{port}")),
        })
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn unit_interval(key: &str, default: f64) -> Result<f64, ConfigError> {
    let value = env_or(key, default)?;
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{value} is outside [0, 1]"),
        });
    }
    Ok(value)
}
