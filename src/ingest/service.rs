//! Accepting inbound messages: route, persist, queue.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use super::model::{IngestEvent, NewIngestEvent};
use super::routing::{ProjectRouter, RouteMatch};
use crate::error::IngestError;
use crate::store::Database;
use crate::worker::ProcessingQueue;

/// Result of a submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub event: IngestEvent,
    /// `false` when the message was a re-delivery of a stored event.
    pub created: bool,
    pub routed_by: Option<RouteMatch>,
}

#[derive(Clone)]
pub struct IngestService {
    db: Arc<dyn Database>,
    queue: ProcessingQueue,
    router: ProjectRouter,
}

impl IngestService {
    pub fn new(db: Arc<dyn Database>, queue: ProcessingQueue, router: ProjectRouter) -> Self {
        Self { db, queue, router }
    }

    /// Store `new` as a pending ingest event and queue it for processing.
    ///
    /// Without an explicit project the message is routed among the active
    /// projects of `contractor_id` (all contractors when `None`). A message
    /// whose `external_message_id` was seen before returns the stored event
    /// and is not queued again.
    pub async fn submit(
        &self,
        mut new: NewIngestEvent,
        contractor_id: Option<Uuid>,
    ) -> Result<Submission, IngestError> {
        let mut routed_by = None;
        match new.project_id {
            Some(project_id) => {
                if self.db.get_project(project_id).await?.is_none() {
                    return Err(IngestError::UnknownProject(project_id));
                }
            }
            None => {
                let projects = self.db.list_active_projects(contractor_id).await?;
                if let Some((project_id, how)) = self
                    .router
                    .route(
                        &projects,
                        new.sender_email.as_deref(),
                        new.raw_payload.subject.as_deref(),
                        &new.raw_payload.body,
                    )
                    .await
                {
                    new.project_id = Some(project_id);
                    routed_by = Some(how);
                } else {
                    debug!(channel = %new.channel, "No project matched, storing unassigned");
                }
            }
        }

        let (event, created) = self.db.insert_ingest_event(&new).await?;
        if !created {
            info!(
                ingest_event_id = %event.id,
                external_id = ?event.external_message_id,
                "Duplicate delivery, returning stored event"
            );
            return Ok(Submission {
                event,
                created,
                routed_by,
            });
        }

        info!(
            ingest_event_id = %event.id,
            channel = %event.channel,
            project_id = ?event.project_id,
            attachments = event.raw_payload.attachments.len(),
            "Ingest event stored"
        );
        self.queue.enqueue(event.id).await?;
        Ok(Submission {
            event,
            created,
            routed_by,
        })
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<IngestEvent>, IngestError> {
        Ok(self.db.get_ingest_event(id).await?)
    }
}
