//! Assigning inbound messages to projects.
//!
//! Cascade, first match wins:
//! 1. Sender address equals a project's client email
//! 2. A significant word of a multi-word project name appears in the subject
//! 3. The contractor has exactly one active project
//! 4. Model-assisted choice (only when a provider is configured)

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::llm::json::extract_json_object;
use crate::llm::provider::{ChatMessage, CompletionRequest, LlmProvider};
use crate::project::Project;

/// Minimum confidence for accepting a model-assisted match.
const MODEL_ROUTE_MIN_CONFIDENCE: f64 = 0.7;
const BODY_PREVIEW_CHARS: usize = 500;

/// How a project was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMatch {
    ClientEmail,
    SubjectKeyword,
    OnlyActiveProject,
    Model,
}

#[derive(Clone, Default)]
pub struct ProjectRouter {
    llm: Option<Arc<dyn LlmProvider>>,
}

impl ProjectRouter {
    /// Deterministic router with no model fallback.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_llm(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm: Some(llm) }
    }

    /// Pick a project among `projects` (the active candidates).
    pub async fn route(
        &self,
        projects: &[Project],
        sender_email: Option<&str>,
        subject: Option<&str>,
        body: &str,
    ) -> Option<(Uuid, RouteMatch)> {
        if let Some(found) = route_deterministic(projects, sender_email, subject) {
            info!(project_id = %found.0, by = ?found.1, "Message routed");
            return Some(found);
        }
        let llm = self.llm.as_ref()?;
        if projects.is_empty() {
            return None;
        }
        let id = route_with_model(llm.as_ref(), projects, sender_email, subject, body).await?;
        info!(project_id = %id, "Message routed by model");
        Some((id, RouteMatch::Model))
    }
}

/// Steps 1 to 3 of the cascade.
pub fn route_deterministic(
    projects: &[Project],
    sender_email: Option<&str>,
    subject: Option<&str>,
) -> Option<(Uuid, RouteMatch)> {
    if let Some(sender) = sender_email.map(str::trim).filter(|s| !s.is_empty())
        && let Some(p) = projects.iter().find(|p| {
            p.client_email
                .as_deref()
                .is_some_and(|e| e.trim().eq_ignore_ascii_case(sender))
        })
    {
        return Some((p.id, RouteMatch::ClientEmail));
    }

    if let Some(subject) = subject.map(str::to_lowercase) {
        for p in projects {
            let name = p.name.to_lowercase();
            let words: Vec<&str> = name.split_whitespace().collect();
            if words.len() >= 2
                && words
                    .iter()
                    .any(|w| w.chars().count() > 3 && subject.contains(w))
            {
                return Some((p.id, RouteMatch::SubjectKeyword));
            }
        }
    }

    match projects {
        [only] => Some((only.id, RouteMatch::OnlyActiveProject)),
        _ => None,
    }
}

#[derive(Deserialize)]
struct ModelRoute {
    project_id: Option<String>,
    #[serde(default)]
    confidence: f64,
}

async fn route_with_model(
    llm: &dyn LlmProvider,
    projects: &[Project],
    sender_email: Option<&str>,
    subject: Option<&str>,
    body: &str,
) -> Option<Uuid> {
    let listing = projects
        .iter()
        .map(|p| {
            format!(
                "- {}: {} (client: {}, email: {}, type: {})",
                p.id,
                p.name,
                p.client_name.as_deref().unwrap_or("N/A"),
                p.client_email.as_deref().unwrap_or("N/A"),
                p.project_type.as_deref().unwrap_or("N/A"),
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let preview: String = body.chars().take(BODY_PREVIEW_CHARS).collect();
    let prompt = format!(
        "Which construction project is this message about?\n\nProjects:\n{listing}\n\n\
         From: {}\nSubject: {}\n\n{preview}\n\n\
         Respond with JSON only: {{\"project_id\": \"<id or null>\", \"confidence\": 0.0-1.0, \"reason\": \"...\"}}",
        sender_email.unwrap_or("unknown"),
        subject.unwrap_or(""),
    );

    let request = CompletionRequest::new(vec![ChatMessage::user(prompt)]).with_max_tokens(256);
    let response = match llm.complete(request).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "Model routing call failed");
            return None;
        }
    };
    let parsed: ModelRoute = serde_json::from_str(&extract_json_object(&response.content))
        .map_err(|e| warn!(error = %e, "Model routing response unparseable"))
        .ok()?;
    if parsed.confidence < MODEL_ROUTE_MIN_CONFIDENCE {
        return None;
    }
    let id = Uuid::parse_str(parsed.project_id?.trim()).ok()?;
    // Only accept ids we actually offered.
    projects.iter().any(|p| p.id == id).then_some(id)
}
