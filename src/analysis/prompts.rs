//! Versioned classifier prompts.
//!
//! The version string travels with every call's metadata, so a prompt edit
//! must bump its version.

use super::types::ImageType;
use crate::project::ProjectContext;

pub const TEXT_DETECTION_VERSION: &str = "text_detection:v1";
pub const IMAGE_CLASSIFICATION_VERSION: &str = "image_classification:v1";
pub const VISUAL_CHANGE_VERSION: &str = "visual_change:v1";

const CHANGE_SCHEMA: &str = r#"Respond with JSON only, in this exact shape:
{"changes": [{"is_change_event": true, "confidence": 0.0-1.0, "description": "one sentence",
  "area": "room or zone or null", "material_from": "original material or null",
  "material_to": "new material or null", "requester_name": "who asked or null",
  "urgency": "normal" | "urgent"}]}
Return {"changes": []} when nothing changes the agreed scope."#;

pub fn text_detection_system_prompt(ctx: &ProjectContext) -> String {
    format!(
        r#"You review messages sent to a construction contractor and detect change events:
requests that alter the agreed scope, materials, layout, finishes, schedule, or cost.

Project: {name}
Type: {project_type}
Original scope: {scope}
Key materials: {materials}

Rules:
- Report only explicit or clearly implied changes. Questions and pleasantries are not changes.
- One entry per distinct change. Do not repeat a change in different words.
- Compare requested materials against the key materials to fill material_from.
- Use "urgent" only when the sender signals time pressure.

{schema}"#,
        name = ctx.name_or_default(),
        project_type = ctx.type_or_default(),
        scope = ctx.scope_or_default(),
        materials = ctx.materials_or_default(),
        schema = CHANGE_SCHEMA,
    )
}

pub fn text_detection_user_prompt(text: &str, subject: Option<&str>) -> String {
    match subject.map(str::trim).filter(|s| !s.is_empty()) {
        Some(subject) => format!("Subject: {subject}\n\n{text}"),
        None => text.to_string(),
    }
}

pub fn image_classification_system_prompt() -> String {
    r#"You classify images sent on construction projects. Choose exactly one type:
- annotated_plan: a floor plan, elevation, or drawing with markup, sketches, or notes
- reference_image: an inspiration photo, product shot, or catalog page showing a desired finish
- field_photo: a photo taken on site of existing conditions or work in progress
- document: a photographed or scanned page that is mostly text (invoice, letter, spec sheet)
- other: anything else (logos, signatures, screenshots, unrelated pictures)

Respond with JSON only: {"type": "<type>", "confidence": 0.0-1.0, "description": "one sentence"}"#
        .to_string()
}

pub const IMAGE_CLASSIFICATION_INSTRUCTION: &str = "Classify this construction image.";

pub fn visual_change_system_prompt(image_type: ImageType, ctx: &ProjectContext) -> String {
    let focus = match image_type {
        ImageType::AnnotatedPlan => {
            "Read every markup, arrow, cloud, and handwritten note. Each marked alteration \
             to walls, fixtures, dimensions, or finishes is a candidate change."
        }
        ImageType::ReferenceImage => {
            "The sender is showing a finish or product they want. Describe the requested \
             material or style and where it would apply."
        }
        ImageType::FieldPhoto => {
            "Look for site conditions that force a change (damage, rot, mismatched \
             dimensions, hidden services) or visible work that departs from scope."
        }
        ImageType::Document | ImageType::Other => "Report any visible change request.",
    };

    format!(
        r#"You extract construction change events from a {image_type} image.
{focus}

Project: {name}
Type: {project_type}
Original scope: {scope}
Key materials: {materials}

{schema}"#,
        name = ctx.name_or_default(),
        project_type = ctx.type_or_default(),
        scope = ctx.scope_or_default(),
        materials = ctx.materials_or_default(),
        schema = CHANGE_SCHEMA,
    )
}

pub const VISUAL_CHANGE_INSTRUCTION: &str = "Analyze this image for construction changes.";
