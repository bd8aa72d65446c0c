//! Post-commit outbound events and notification dispatch.
//!
//! Publishers send only after their transaction commits. Delivery runs on
//! its own task, so a slow or failing sink never touches persisted state.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::changes::model::{ChangeEvent, ChangeEventStatus};
use crate::changes::tokens::{ActionTokenService, TokenAction};
use crate::error::{NotifyError, WorkflowError};

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Something that happened to persisted state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    ChangeEventCreated {
        change_event: ChangeEvent,
        ingest_event_id: Uuid,
    },
    /// A new source was attached to an existing change event instead of
    /// creating a duplicate.
    SourceMerged {
        change_event_id: Uuid,
        ingest_event_id: Uuid,
        similarity: f64,
    },
    /// A newly created change event closely resembles an existing one.
    PossibleDuplicate {
        change_event_id: Uuid,
        existing_id: Uuid,
        similarity: f64,
    },
    /// Processing gave up; `change_event` is the synthesized review item.
    IngestFailed {
        ingest_event_id: Uuid,
        change_event: ChangeEvent,
        error: String,
    },
    StatusChanged {
        change_event_id: Uuid,
        from: ChangeEventStatus,
        to: ChangeEventStatus,
    },
}

/// Fan-out bus for pipeline events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: PipelineEvent) {
        // Ok if nobody is listening
        let _ = self.tx.send(event);
    }
}

/// Single-use links a recipient can act on without signing in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionLinks {
    pub confirm: String,
    pub reject: String,
}

/// A delivery channel for contractor and client notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    /// Tell the contractor a change event needs their attention.
    async fn notify(&self, change_event: &ChangeEvent, links: &ActionLinks)
    -> Result<(), NotifyError>;

    /// Ask the client to sign off on a confirmed change event.
    async fn request_signature(
        &self,
        change_event_id: Uuid,
        sign_link: &str,
    ) -> Result<(), NotifyError>;
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(
        &self,
        change_event: &ChangeEvent,
        links: &ActionLinks,
    ) -> Result<(), NotifyError> {
        info!(
            change_event_id = %change_event.id,
            status = %change_event.status,
            confidence = change_event.confidence_score,
            description = %change_event.description,
            confirm_link = %links.confirm,
            reject_link = %links.reject,
            "Change event awaiting contractor review"
        );
        Ok(())
    }

    async fn request_signature(
        &self,
        change_event_id: Uuid,
        sign_link: &str,
    ) -> Result<(), NotifyError> {
        info!(change_event_id = %change_event_id, sign_link, "Change event awaiting client signature");
        Ok(())
    }
}

/// Turns bus events into notifications carrying freshly issued action links.
pub struct Dispatcher {
    tokens: ActionTokenService,
    sink: Arc<dyn NotificationSink>,
    public_url: String,
}

impl Dispatcher {
    pub fn new(
        tokens: ActionTokenService,
        sink: Arc<dyn NotificationSink>,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            tokens,
            sink,
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn link(&self, change_event_id: Uuid, action: TokenAction) -> Result<String, WorkflowError> {
        let token = self.tokens.issue(change_event_id, action, None).await?;
        Ok(format!(
            "{}/api/change-events/{}/{}?token={}",
            self.public_url,
            change_event_id,
            action.as_str(),
            token
        ))
    }

    async fn handle(&self, event: &PipelineEvent) -> Result<(), NotifyError> {
        match event {
            PipelineEvent::ChangeEventCreated { change_event, .. }
            | PipelineEvent::IngestFailed { change_event, .. } => {
                if !change_event.status.is_open() {
                    return Ok(());
                }
                let links = ActionLinks {
                    confirm: self.link(change_event.id, TokenAction::Confirm).await?,
                    reject: self.link(change_event.id, TokenAction::Reject).await?,
                };
                self.sink.notify(change_event, &links).await
            }
            PipelineEvent::StatusChanged {
                change_event_id,
                to: ChangeEventStatus::Confirmed,
                ..
            } => {
                let sign = self.link(*change_event_id, TokenAction::Sign).await?;
                self.sink.request_signature(*change_event_id, &sign).await
            }
            _ => Ok(()),
        }
    }
}

/// Forward bus events through `dispatcher` until the bus closes.
///
/// Open change events get confirm and reject links; confirmed ones get a
/// sign link for the client.
pub fn spawn_dispatcher(bus: &EventBus, dispatcher: Dispatcher) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, sink = dispatcher.sink.name(), "Notification dispatcher lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, dispatcher exiting");
                    break;
                }
            };

            if let Err(e) = dispatcher.handle(&event).await {
                error!(
                    sink = dispatcher.sink.name(),
                    error = %e,
                    "Notification delivery failed"
                );
            }
        }
    })
}
