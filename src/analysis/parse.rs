//! Decoding classifier output into typed results.
//!
//! Model output is never trusted: each response decodes into a tagged
//! `ParsedChanges`, and callers branch on it instead of probing fields.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use super::types::{ChangeEventProposal, ImageClassification, ImageType, Urgency};
use crate::llm::json::{excerpt, extract_json_object};

/// Characters of raw output kept when a response cannot be decoded.
const EXCERPT_CHARS: usize = 200;

/// Outcome of decoding a change-detection response.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedChanges {
    /// Decoded; only entries with `is_change_event = true` are kept.
    Changes(Vec<ChangeEventProposal>),
    /// Not a `{"changes": [...]}` object.
    Malformed { excerpt: String },
}

#[derive(Deserialize)]
struct ChangesEnvelope {
    changes: Vec<Value>,
}

#[derive(Deserialize)]
struct RawChange {
    is_change_event: bool,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    description: String,
    #[serde(default)]
    area: Option<String>,
    #[serde(default)]
    material_from: Option<String>,
    #[serde(default)]
    material_to: Option<String>,
    #[serde(default)]
    requester_name: Option<String>,
    #[serde(default)]
    urgency: Urgency,
}

fn default_confidence() -> f64 {
    0.5
}

/// Decode a change-detection response.
///
/// A well-formed envelope with an individually malformed entry drops that
/// entry and keeps the rest.
pub fn parse_changes(raw: &str) -> ParsedChanges {
    let json_str = extract_json_object(raw);
    let envelope: ChangesEnvelope = match serde_json::from_str(&json_str) {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, raw = %excerpt(raw, EXCERPT_CHARS), "Unparseable change response");
            return ParsedChanges::Malformed {
                excerpt: excerpt(raw, EXCERPT_CHARS),
            };
        }
    };

    let mut proposals = Vec::new();
    for entry in envelope.changes {
        let change: RawChange = match serde_json::from_value(entry) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Dropping malformed change entry");
                continue;
            }
        };
        if !change.is_change_event {
            continue;
        }
        proposals.push(ChangeEventProposal {
            is_change_event: true,
            confidence: if change.confidence.is_finite() {
                change.confidence.clamp(0.0, 1.0)
            } else {
                default_confidence()
            },
            description: change.description.trim().to_string(),
            area: non_empty(change.area),
            material_from: non_empty(change.material_from),
            material_to: non_empty(change.material_to),
            requester_name: non_empty(change.requester_name),
            urgency: change.urgency,
        });
    }
    ParsedChanges::Changes(proposals)
}

#[derive(Deserialize)]
struct RawClassification {
    #[serde(rename = "type")]
    image_type: ImageType,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    description: String,
}

/// Decode an image-classification response. Anything unreadable is `other`.
pub fn parse_classification(raw: &str) -> Result<ImageClassification, String> {
    let json_str = extract_json_object(raw);
    let parsed: RawClassification = serde_json::from_str(&json_str).map_err(|e| {
        warn!(error = %e, raw = %excerpt(raw, EXCERPT_CHARS), "Unparseable classification");
        excerpt(raw, EXCERPT_CHARS)
    })?;
    Ok(ImageClassification {
        image_type: parsed.image_type,
        confidence: parsed.confidence.clamp(0.0, 1.0),
        description: parsed.description,
    })
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}
