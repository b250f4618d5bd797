//! The ack-then-process queue and its worker pool.
//!
//! The ingress acknowledges the network request within a fixed budget and
//! hands the event to this bounded queue; pipeline workers drain it. A full
//! queue is a defined failure mode (the ingress answers with a retryable
//! response), never a silent drop or an unbounded backlog.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use warden_pipeline::Pipeline;
use warden_types::{InboundEvent, TenantRegistration};

/// One unit of queued work: a resolved event awaiting its pipeline run.
#[derive(Debug)]
pub struct QueuedEvent {
    pub event: InboundEvent,
    pub tenant: TenantRegistration,
    /// Trace id assigned at the ingress, correlating the acknowledgment
    /// with the eventual pipeline outcome in the logs.
    pub trace_id: uuid::Uuid,
}

/// Error returned when the queue refuses new work.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// The queue is at capacity; the caller should answer retryable.
    #[error("event queue saturated at capacity {capacity}")]
    Saturated { capacity: usize },

    /// The workers have shut down; only seen during graceful shutdown.
    #[error("event queue closed")]
    Closed,
}

/// Sending half of the event queue.
#[derive(Clone)]
pub struct EventQueue {
    tx: mpsc::Sender<QueuedEvent>,
    capacity: usize,
}

impl EventQueue {
    /// Creates the queue, returning the sender and the receiving half to
    /// hand to [`spawn_workers`].
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<QueuedEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, capacity }, rx)
    }

    /// Queue capacity, for the saturation audit record.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Enqueues without waiting. The ingress must stay within its ack
    /// budget, so a full queue is reported immediately instead of applying
    /// backpressure to the network caller.
    pub fn try_enqueue(&self, item: QueuedEvent) -> Result<(), EnqueueError> {
        self.tx.try_send(item).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Saturated {
                capacity: self.capacity,
            },
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }
}

/// Spawns `workers` tasks draining the queue through the pipeline.
///
/// Workers share the receiver behind an async mutex; each recv is one lock
/// acquisition. They exit when the queue closes (all senders dropped),
/// which is how graceful shutdown drains in-flight work.
pub fn spawn_workers(
    workers: usize,
    rx: mpsc::Receiver<QueuedEvent>,
    pipeline: Arc<Pipeline>,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    (0..workers.max(1))
        .map(|worker_id| {
            let rx = rx.clone();
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                loop {
                    let item = { rx.lock().await.recv().await };
                    let Some(QueuedEvent {
                        event,
                        tenant,
                        trace_id,
                    }) = item
                    else {
                        tracing::debug!(worker_id, "event queue closed, worker exiting");
                        break;
                    };

                    let tenant_id = event.tenant_id.clone();
                    let outcome = pipeline.run(event, tenant).await;
                    tracing::debug!(
                        worker_id,
                        trace_id = %trace_id,
                        tenant_id = %tenant_id,
                        outcome = ?outcome,
                        "pipeline run finished"
                    );
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use warden_audit::NullAuditSink;
    use warden_pipeline::{Stage, StageError, StageFlow};
    use warden_types::{EventKind, TenantStatus};

    fn queued(n: u32) -> QueuedEvent {
        QueuedEvent {
            event: InboundEvent {
                tenant_id: "t1".into(),
                subject_id: "-100".into(),
                actor_id: "u1".into(),
                kind: EventKind::Message,
                payload: json!({"n": n}),
                received_at: 0,
                dedup_key: n.to_string(),
            },
            tenant: TenantRegistration {
                tenant_id: "t1".into(),
                secret_hash: "ab".repeat(32),
                status: TenantStatus::Active,
                created_at: "2026-01-01 00:00:00".into(),
            },
            trace_id: uuid::Uuid::new_v4(),
        }
    }

    /// Stage double counting how many events reach the pipeline.
    struct CountingStage(Arc<AtomicU32>);

    #[async_trait::async_trait]
    impl Stage for CountingStage {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn handle(
            &self,
            _ctx: &mut warden_pipeline::PipelineContext,
        ) -> Result<StageFlow, StageError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(StageFlow::Continue)
        }
    }

    #[tokio::test]
    async fn full_queue_reports_saturation() {
        let (queue, _rx) = EventQueue::new(2);

        queue.try_enqueue(queued(1)).expect("first fits");
        queue.try_enqueue(queued(2)).expect("second fits");

        let err = queue.try_enqueue(queued(3)).expect_err("third must refuse");
        assert!(matches!(err, EnqueueError::Saturated { capacity: 2 }));
    }

    #[tokio::test]
    async fn workers_drain_the_queue_and_exit_on_close() {
        let processed = Arc::new(AtomicU32::new(0));
        let pipeline = Arc::new(Pipeline::new(
            vec![Arc::new(CountingStage(processed.clone()))],
            Arc::new(NullAuditSink),
        ));

        let (queue, rx) = EventQueue::new(16);
        let handles = spawn_workers(3, rx, pipeline);

        for n in 0..10 {
            queue.try_enqueue(queued(n)).expect("enqueue");
        }

        // Dropping the last sender closes the queue; workers drain and exit.
        drop(queue);
        for handle in handles {
            handle.await.expect("worker should exit cleanly");
        }

        assert_eq!(processed.load(Ordering::SeqCst), 10);
    }
}
