//! Change event, source link, and audit log types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::types::{SourceType, Urgency};

/// Approval status of a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeEventStatus {
    /// Entered automatically at or above the confidence threshold.
    Proposed,
    /// Entered below the threshold, or synthesized after a processing failure.
    ManualReview,
    Confirmed,
    Rejected,
    Signed,
}

impl ChangeEventStatus {
    /// Check if this status allows moving to another one.
    pub fn can_transition_to(&self, target: ChangeEventStatus) -> bool {
        use ChangeEventStatus::*;

        matches!(
            (self, target),
            (Proposed, Confirmed) | (Proposed, Rejected) |
            (ManualReview, Confirmed) | (ManualReview, Rejected) |
            (Confirmed, Signed)
        )
    }

    /// Still open for contractor action (confirm, reject, edit).
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Proposed | Self::ManualReview)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::ManualReview => "manual_review",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
            Self::Signed => "signed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "proposed" => Some(Self::Proposed),
            "manual_review" => Some(Self::ManualReview),
            "confirmed" => Some(Self::Confirmed),
            "rejected" => Some(Self::Rejected),
            "signed" => Some(Self::Signed),
            _ => None,
        }
    }

    /// Initial status for a proposal of the given confidence.
    pub fn for_confidence(confidence: f64, threshold: f64) -> Self {
        if confidence >= threshold {
            Self::Proposed
        } else {
            Self::ManualReview
        }
    }
}

impl std::fmt::Display for ChangeEventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who caused a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    System,
    Contractor,
    Client,
    Ai,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Contractor => "contractor",
            Self::Client => "client",
            Self::Ai => "ai",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "contractor" => Self::Contractor,
            "client" => Self::Client,
            "ai" => Self::Ai,
            _ => Self::System,
        }
    }
}

/// Status-bearing entities tracked in the transition log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    ChangeEvent,
    IngestEvent,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChangeEvent => "change_event",
            Self::IngestEvent => "ingest_event",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "ingest_event" => Self::IngestEvent,
            _ => Self::ChangeEvent,
        }
    }
}

/// A detected change to project scope or materials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: Uuid,
    /// `None` when the originating message was never routed to a project.
    pub project_id: Option<Uuid>,
    pub status: ChangeEventStatus,
    pub description: String,
    pub area: Option<String>,
    pub material_from: Option<String>,
    pub material_to: Option<String>,
    pub requester_name: Option<String>,
    pub urgency: Urgency,
    pub confidence_score: f64,
    pub raw_text: Option<String>,
    pub source_type: SourceType,
    pub prompt_version: Option<String>,
    pub model_used: Option<String>,
    pub tokens_used: u32,
    pub processing_time_ms: u64,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub signed_at: Option<DateTime<Utc>>,
}

/// Fields of a change event about to be created.
#[derive(Debug, Clone)]
pub struct NewChangeEvent {
    pub project_id: Option<Uuid>,
    pub status: ChangeEventStatus,
    pub description: String,
    pub area: Option<String>,
    pub material_from: Option<String>,
    pub material_to: Option<String>,
    pub requester_name: Option<String>,
    pub urgency: Urgency,
    pub confidence_score: f64,
    pub raw_text: Option<String>,
    pub source_type: SourceType,
    pub prompt_version: Option<String>,
    pub model_used: Option<String>,
    pub tokens_used: u32,
    pub processing_time_ms: u64,
    pub embedding: Option<Vec<f32>>,
}

/// Everything written in one transaction when a change event is born:
/// the row itself, its link back to the ingest event, and the
/// `None -> status` transition.
#[derive(Debug, Clone)]
pub struct ChangeEventBundle {
    pub event: NewChangeEvent,
    pub ingest_event_id: Uuid,
    pub relevance_score: f64,
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub metadata: serde_json::Value,
}

/// Join row between a change event and an ingest event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEventSource {
    pub change_event_id: Uuid,
    pub ingest_event_id: Uuid,
    pub relevance_score: f64,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub from_status: Option<String>,
    pub to_status: String,
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A transition to be recorded; the store fills in id and timestamp.
#[derive(Debug, Clone)]
pub struct NewTransition {
    pub from_status: Option<String>,
    pub to_status: String,
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub metadata: serde_json::Value,
}

impl NewTransition {
    pub fn new(
        from: Option<ChangeEventStatus>,
        to: ChangeEventStatus,
        actor_type: ActorType,
    ) -> Self {
        Self {
            from_status: from.map(|s| s.as_str().to_string()),
            to_status: to.as_str().to_string(),
            actor_type,
            actor_id: None,
            metadata: serde_json::json!({}),
        }
    }

    pub fn with_actor_id(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Editable fields of an open change event. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeEventEdit {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub material_from: Option<String>,
    #[serde(default)]
    pub material_to: Option<String>,
    #[serde(default)]
    pub urgency: Option<Urgency>,
}

impl ChangeEventEdit {
    /// Names of the fields this edit touches, in a stable order.
    pub fn touched_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.description.is_some() {
            fields.push("description");
        }
        if self.area.is_some() {
            fields.push("area");
        }
        if self.material_from.is_some() {
            fields.push("material_from");
        }
        if self.material_to.is_some() {
            fields.push("material_to");
        }
        if self.urgency.is_some() {
            fields.push("urgency");
        }
        fields
    }

    pub fn is_empty(&self) -> bool {
        self.touched_fields().is_empty()
    }
}

/// Filter and page for listing change events.
#[derive(Debug, Clone, Default)]
pub struct ChangeEventQuery {
    pub status: Option<ChangeEventStatus>,
    pub offset: usize,
    pub limit: usize,
}
