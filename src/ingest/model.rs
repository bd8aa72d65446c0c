//! Ingest event model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where an inbound message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Gmail,
    Outlook,
    Whatsapp,
    Manual,
    Api,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gmail => "gmail",
            Self::Outlook => "outlook",
            Self::Whatsapp => "whatsapp",
            Self::Manual => "manual",
            Self::Api => "api",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gmail" => Some(Self::Gmail),
            "outlook" => Some(Self::Outlook),
            "whatsapp" => Some(Self::Whatsapp),
            "manual" => Some(Self::Manual),
            "api" => Some(Self::Api),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing lifecycle of an ingest event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn can_transition_to(&self, target: ProcessingStatus) -> bool {
        use ProcessingStatus::*;

        matches!(
            (self, target),
            (Pending, Processing) |
            (Processing, Completed) | (Processing, Failed) |
            // Crash recovery puts abandoned work back in the queue
            (Processing, Pending)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An attachment reference inside a raw payload.
///
/// Content is either carried inline as base64 or stored elsewhere and
/// referenced by `storage_ref`; an `AttachmentFetcher` resolves both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub media_type: String,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_ref: Option<String>,
}

/// The message as received.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPayload {
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl RawPayload {
    pub fn subject_or_default(&self) -> &str {
        self.subject
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or("No subject")
    }
}

/// A persisted inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestEvent {
    pub id: Uuid,
    pub project_id: Option<Uuid>,
    pub channel: Channel,
    pub raw_payload: RawPayload,
    pub sender_email: Option<String>,
    pub sender_name: Option<String>,
    pub external_message_id: Option<String>,
    pub processing_status: ProcessingStatus,
    pub error_message: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Input for creating an ingest event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIngestEvent {
    #[serde(default)]
    pub project_id: Option<Uuid>,
    pub channel: Channel,
    pub raw_payload: RawPayload,
    #[serde(default)]
    pub sender_email: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub external_message_id: Option<String>,
}

impl NewIngestEvent {
    pub fn new(channel: Channel, subject: Option<&str>, body: impl Into<String>) -> Self {
        Self {
            project_id: None,
            channel,
            raw_payload: RawPayload {
                subject: subject.map(str::to_string),
                body: body.into(),
                attachments: Vec::new(),
            },
            sender_email: None,
            sender_name: None,
            external_message_id: None,
        }
    }

    pub fn with_project(mut self, project_id: Uuid) -> Self {
        self.project_id = Some(project_id);
        self
    }

    pub fn with_sender(mut self, email: impl Into<String>) -> Self {
        self.sender_email = Some(email.into());
        self
    }

    pub fn with_external_id(mut self, id: impl Into<String>) -> Self {
        self.external_message_id = Some(id.into());
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.raw_payload.attachments.push(attachment);
        self
    }
}
