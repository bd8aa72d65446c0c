//! Single-use action tokens for email-driven approval links.
//!
//! The plain token only ever leaves the process inside a link; the store
//! keeps its SHA-256 digest.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::store::Database;

/// What a token authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenAction {
    Confirm,
    Reject,
    Sign,
}

impl TokenAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirm => "confirm",
            Self::Reject => "reject",
            Self::Sign => "sign",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "confirm" => Some(Self::Confirm),
            "reject" => Some(Self::Reject),
            "sign" => Some(Self::Sign),
            _ => None,
        }
    }
}

/// Stored token record.
#[derive(Debug, Clone)]
pub struct ActionToken {
    pub token_hash: String,
    pub change_event_id: Uuid,
    pub action: TokenAction,
    pub client_email: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Hex SHA-256 of a plain token.
pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.trim().as_bytes()))
}

fn generate_token() -> String {
    let bytes: [u8; 32] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Clone)]
pub struct ActionTokenService {
    db: Arc<dyn Database>,
    ttl: chrono::Duration,
}

impl ActionTokenService {
    pub fn new(db: Arc<dyn Database>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(48));
        Self { db, ttl }
    }

    /// Mint a token and return its plain form.
    pub async fn issue(
        &self,
        change_event_id: Uuid,
        action: TokenAction,
        client_email: Option<&str>,
    ) -> Result<String, WorkflowError> {
        let token = generate_token();
        let now = Utc::now();
        let record = ActionToken {
            token_hash: hash_token(&token),
            change_event_id,
            action,
            client_email: client_email.map(str::to_string),
            expires_at: now + self.ttl,
            used_at: None,
            created_at: now,
        };
        self.db.insert_action_token(&record).await?;
        info!(change_event_id = %change_event_id, action = action.as_str(), "Action token issued");
        Ok(token)
    }

    /// Check a token without consuming it.
    pub async fn verify(
        &self,
        token: &str,
        change_event_id: Uuid,
        action: TokenAction,
    ) -> Result<ActionToken, WorkflowError> {
        let record = self
            .db
            .get_action_token(&hash_token(token))
            .await?
            .ok_or(WorkflowError::InvalidToken)?;

        if record.change_event_id != change_event_id || record.action != action {
            warn!(change_event_id = %change_event_id, action = action.as_str(), "Token presented for the wrong target");
            return Err(WorkflowError::Forbidden(
                "token does not authorize this action".into(),
            ));
        }
        if record.used_at.is_some() {
            return Err(WorkflowError::TokenAlreadyUsed);
        }
        if record.expires_at <= Utc::now() {
            return Err(WorkflowError::TokenExpired);
        }
        Ok(record)
    }

    /// Verify and consume. Only one caller can ever win for a given token.
    pub async fn redeem(
        &self,
        token: &str,
        change_event_id: Uuid,
        action: TokenAction,
    ) -> Result<ActionToken, WorkflowError> {
        let mut record = self.verify(token, change_event_id, action).await?;
        if !self.db.consume_action_token(&record.token_hash).await? {
            return Err(WorkflowError::TokenAlreadyUsed);
        }
        record.used_at = Some(Utc::now());
        Ok(record)
    }
}
