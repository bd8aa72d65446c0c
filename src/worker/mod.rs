//! Background processing of ingest events.
//!
//! - `retry`: backoff schedule between attempts
//! - `runner`: claim, attempt under a ceiling, complete or fall back
//!
//! Delivery is at-least-once: the queue may carry the same id twice and
//! the runner's claim step drops the extra copy.

pub mod retry;
pub mod runner;

pub use retry::RetryPolicy;
pub use runner::{JobOutcome, JobRunner};

use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, IngestError};
use crate::ingest::model::ProcessingStatus;
use crate::store::Database;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Sending half of the processing queue.
#[derive(Clone)]
pub struct ProcessingQueue {
    tx: mpsc::Sender<Uuid>,
}

impl ProcessingQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Uuid>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub async fn enqueue(&self, ingest_event_id: Uuid) -> Result<(), IngestError> {
        self.tx
            .send(ingest_event_id)
            .await
            .map_err(|_| IngestError::QueueClosed)?;
        debug!(ingest_event_id = %ingest_event_id, "Ingest event queued");
        Ok(())
    }
}

/// Consume the queue, running at most `concurrency` jobs at once.
/// Exits when every `ProcessingQueue` handle is dropped.
pub fn spawn_worker(
    runner: Arc<JobRunner>,
    mut rx: mpsc::Receiver<Uuid>,
    concurrency: usize,
) -> JoinHandle<()> {
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    tokio::spawn(async move {
        info!(concurrency, "Worker started");
        while let Some(id) = rx.recv().await {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let runner = Arc::clone(&runner);
            tokio::spawn(async move {
                let _permit = permit;
                match runner.run(id).await {
                    Ok(outcome) => debug!(ingest_event_id = %id, ?outcome, "Job finished"),
                    Err(e) => error!(ingest_event_id = %id, error = %e, "Job aborted"),
                }
            });
        }
        info!("Processing queue closed, worker exiting");
    })
}

/// Startup recovery: put abandoned `processing` events back to `pending`
/// and queue every pending event. Spawn the worker first so a backlog
/// larger than the queue can drain.
pub async fn recover_pending(
    db: &dyn Database,
    queue: &ProcessingQueue,
) -> Result<usize, DatabaseError> {
    let reset = db.reset_stale_processing().await?;
    if reset > 0 {
        warn!(count = reset, "Reset ingest events abandoned mid-processing");
    }

    let pending = db.list_ingest_ids_by_status(ProcessingStatus::Pending).await?;
    let mut queued = 0;
    for id in pending {
        if queue.enqueue(id).await.is_err() {
            warn!("Processing queue closed during recovery");
            break;
        }
        queued += 1;
    }
    if queued > 0 {
        info!(count = queued, "Re-queued pending ingest events");
    }
    Ok(queued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::model::ChangeEvent;
    use crate::config::PipelineConfig;
    use crate::error::PipelineError;
    use crate::ingest::model::{Channel, NewIngestEvent};
    use crate::notify::EventBus;
    use crate::pipeline::IngestProcessor;
    use crate::store::{ClaimOutcome, LibSqlBackend};
    use async_trait::async_trait;
    use std::time::Duration;

    struct NoopProcessor;

    #[async_trait]
    impl IngestProcessor for NoopProcessor {
        async fn process_ingest_event(&self, _id: Uuid) -> Result<Vec<ChangeEvent>, PipelineError> {
            Ok(Vec::new())
        }
    }

    async fn pending_event(db: &dyn Database) -> Uuid {
        db.insert_ingest_event(&NewIngestEvent::new(Channel::Api, None, "hello"))
            .await
            .unwrap()
            .0
            .id
    }

    #[tokio::test]
    async fn worker_drains_queue() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let runner = Arc::new(JobRunner::new(
            db.clone(),
            Arc::new(NoopProcessor),
            EventBus::new(),
            &PipelineConfig::default(),
        ));
        let (queue, rx) = ProcessingQueue::new(8);
        let handle = spawn_worker(runner, rx, 2);

        let a = pending_event(db.as_ref()).await;
        let b = pending_event(db.as_ref()).await;
        queue.enqueue(a).await.unwrap();
        queue.enqueue(b).await.unwrap();
        // Duplicate delivery is harmless
        queue.enqueue(a).await.unwrap();
        drop(queue);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        for id in [a, b] {
            let event = db.get_ingest_event(id).await.unwrap().unwrap();
            assert_eq!(event.processing_status, ProcessingStatus::Completed);
        }
    }

    #[tokio::test]
    async fn recovery_requeues_abandoned_and_pending() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let abandoned = pending_event(&db).await;
        let waiting = pending_event(&db).await;
        assert!(matches!(
            db.claim_ingest_event(abandoned).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));

        let (queue, mut rx) = ProcessingQueue::new(8);
        assert_eq!(recover_pending(&db, &queue).await.unwrap(), 2);

        let mut queued = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        queued.sort();
        let mut expected = vec![abandoned, waiting];
        expected.sort();
        assert_eq!(queued, expected);
    }

    #[tokio::test]
    async fn closed_queue_reports_error() {
        let (queue, rx) = ProcessingQueue::new(1);
        drop(rx);
        assert!(matches!(
            queue.enqueue(Uuid::new_v4()).await,
            Err(IngestError::QueueClosed)
        ));
    }
}
