//! Projects and the context handed to classifiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a construction project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Active,
    Completed,
    Archived,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "archived" => Self::Archived,
            _ => Self::Active,
        }
    }
}

/// A contractor's construction project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub contractor_id: Uuid,
    pub name: String,
    pub project_type: Option<String>,
    pub scope_summary: Option<String>,
    pub key_materials: Option<String>,
    pub client_name: Option<String>,
    pub client_email: Option<String>,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(contractor_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            contractor_id,
            name: name.into(),
            project_type: None,
            scope_summary: None,
            key_materials: None,
            client_name: None,
            client_email: None,
            status: ProjectStatus::Active,
            created_at: Utc::now(),
        }
    }

    pub fn with_client_email(mut self, email: impl Into<String>) -> Self {
        self.client_email = Some(email.into());
        self
    }

    pub fn with_scope(
        mut self,
        project_type: impl Into<String>,
        scope_summary: impl Into<String>,
        key_materials: impl Into<String>,
    ) -> Self {
        self.project_type = Some(project_type.into());
        self.scope_summary = Some(scope_summary.into());
        self.key_materials = Some(key_materials.into());
        self
    }

    pub fn context(&self) -> ProjectContext {
        ProjectContext {
            project_name: Some(self.name.clone()),
            project_type: self.project_type.clone(),
            scope_summary: self.scope_summary.clone(),
            key_materials: self.key_materials.clone(),
        }
    }
}

/// The slice of a project that classifiers see.
///
/// An unassigned ingest event gets `ProjectContext::default()`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectContext {
    pub project_name: Option<String>,
    pub project_type: Option<String>,
    pub scope_summary: Option<String>,
    pub key_materials: Option<String>,
}

impl ProjectContext {
    pub fn name_or_default(&self) -> &str {
        non_blank(&self.project_name).unwrap_or("Unknown")
    }

    pub fn type_or_default(&self) -> &str {
        non_blank(&self.project_type).unwrap_or("Unknown")
    }

    pub fn scope_or_default(&self) -> &str {
        non_blank(&self.scope_summary).unwrap_or("Not provided")
    }

    pub fn materials_or_default(&self) -> &str {
        non_blank(&self.key_materials).unwrap_or("Not specified")
    }
}

fn non_blank(s: &Option<String>) -> Option<&str> {
    s.as_deref().map(str::trim).filter(|s| !s.is_empty())
}
