//! Shared output types of the analysis phases.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::AnalysisError;

/// How soon a requested change needs attention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    #[default]
    Normal,
    Urgent,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Urgent => "urgent",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("urgent") {
            Self::Urgent
        } else {
            Self::Normal
        }
    }
}

// Models occasionally answer "high" or "asap"; anything but "urgent" is normal.
impl<'de> Deserialize<'de> for Urgency {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(Urgency::parse).unwrap_or_default())
    }
}

/// One candidate change produced by an analysis phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEventProposal {
    pub is_change_event: bool,
    pub confidence: f64,
    pub description: String,
    pub area: Option<String>,
    pub material_from: Option<String>,
    pub material_to: Option<String>,
    pub requester_name: Option<String>,
    pub urgency: Urgency,
}

impl ChangeEventProposal {
    pub fn new(description: impl Into<String>, confidence: f64) -> Self {
        Self {
            is_change_event: true,
            confidence: confidence.clamp(0.0, 1.0),
            description: description.into(),
            area: None,
            material_from: None,
            material_to: None,
            requester_name: None,
            urgency: Urgency::Normal,
        }
    }

    pub fn with_area(mut self, area: impl Into<String>) -> Self {
        self.area = Some(area.into());
        self
    }

    pub fn with_materials(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.material_from = Some(from.into());
        self.material_to = Some(to.into());
        self
    }
}

/// Provenance of one capability call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisMetadata {
    pub prompt_version: String,
    pub model_used: String,
    pub tokens_used: u32,
    pub processing_time_ms: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_type: Option<ImageType>,
    /// The capability itself could not be reached (provider error or deadline).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unavailable: bool,
}

impl AnalysisMetadata {
    pub fn new(prompt_version: impl Into<String>, model_used: impl Into<String>) -> Self {
        Self {
            prompt_version: prompt_version.into(),
            model_used: model_used.into(),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Record a failed capability call.
    pub fn failed(
        prompt_version: impl Into<String>,
        model_used: impl Into<String>,
        error: &AnalysisError,
    ) -> Self {
        Self {
            unavailable: error.is_unavailable(),
            ..Self::new(prompt_version, model_used).with_error(error.to_string())
        }
    }
}

/// Which analysis path produced a finding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    #[default]
    Text,
    Image,
    Document,
    PdfEmbeddedImage,
    /// Entered by hand through the API.
    Manual,
    /// Synthesized after processing failed for good.
    ProcessingFailure,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Document => "document",
            Self::PdfEmbeddedImage => "pdf_embedded_image",
            Self::Manual => "manual",
            Self::ProcessingFailure => "processing_failure",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "image" => Self::Image,
            "document" => Self::Document,
            "pdf_embedded_image" => Self::PdfEmbeddedImage,
            "manual" => Self::Manual,
            "processing_failure" => Self::ProcessingFailure,
            _ => Self::Text,
        }
    }
}

/// A proposal with the metadata of the call that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub proposal: ChangeEventProposal,
    pub metadata: AnalysisMetadata,
    pub source_type: SourceType,
    /// Attachment filename for image and document findings.
    pub attachment: Option<String>,
}

/// What one phase produced: its findings plus a record of every call it made,
/// including skipped and failed ones.
#[derive(Debug, Clone, Default)]
pub struct PhaseReport {
    pub findings: Vec<Finding>,
    pub calls: Vec<AnalysisMetadata>,
}

impl PhaseReport {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, other: PhaseReport) {
        self.findings.extend(other.findings);
        self.calls.extend(other.calls);
    }

    pub fn errors(&self) -> impl Iterator<Item = &str> {
        self.calls.iter().filter_map(|c| c.error.as_deref())
    }

    /// True when no call succeeded and at least one failed because the
    /// capability was unreachable. A report with no calls is never unavailable.
    pub fn analysis_unavailable(&self) -> bool {
        self.calls.iter().all(|c| c.error.is_some()) && self.calls.iter().any(|c| c.unavailable)
    }
}

/// Visual category of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageType {
    AnnotatedPlan,
    ReferenceImage,
    FieldPhoto,
    Document,
    Other,
}

impl ImageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AnnotatedPlan => "annotated_plan",
            Self::ReferenceImage => "reference_image",
            Self::FieldPhoto => "field_photo",
            Self::Document => "document",
            Self::Other => "other",
        }
    }

    /// Unknown labels collapse to `Other`.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "annotated_plan" => Self::AnnotatedPlan,
            "reference_image" => Self::ReferenceImage,
            "field_photo" => Self::FieldPhoto,
            "document" => Self::Document,
            _ => Self::Other,
        }
    }

    /// Images of these types never reach the change extractor.
    pub fn skips_extraction(&self) -> bool {
        matches!(self, Self::Other | Self::Document)
    }
}

impl<'de> Deserialize<'de> for ImageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().map(ImageType::parse).unwrap_or(ImageType::Other))
    }
}

impl std::fmt::Display for ImageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageClassification {
    pub image_type: ImageType,
    pub confidence: f64,
    pub description: String,
}

impl ImageClassification {
    pub fn other(description: impl Into<String>) -> Self {
        Self {
            image_type: ImageType::Other,
            confidence: 0.0,
            description: description.into(),
        }
    }
}
