//! Durable work queue with per-workflow FIFO serialization
//!
//! One item per enqueued run. The claim operation is the serialization
//! lock: a worker may only claim the oldest ready item of a workflow that
//! has no in-flight item anywhere in the fleet. Items that stop
//! heartbeating become ready again after a visibility timeout.

mod memory;
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

pub use memory::InMemoryWorkQueue;
pub use postgres::PgWorkQueue;

/// Queue operation failures
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Item not found or not in the expected state
    #[error("queue item not found: {0}")]
    ItemNotFound(Uuid),

    /// Backing store failure
    #[error("queue store error: {0}")]
    Store(String),
}

/// A claimed unit of work: execute one run
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub run_id: Uuid,
    /// Trigger-supplied input for the run
    pub input: Value,
}

/// Queue depth counters for backlog observability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub ready: u64,
    pub in_flight: u64,
}

/// Durable, ordered work queue
///
/// Implementations must guarantee:
/// - FIFO claim order per workflow;
/// - at most one in-flight item per workflow across all workers;
/// - abandoned items (no heartbeat within the visibility timeout) become
///   ready again without losing their position relative to later items.
#[async_trait]
pub trait WorkQueue: Send + Sync + 'static {
    /// Append an item for a run
    async fn enqueue(
        &self,
        workflow_id: Uuid,
        run_id: Uuid,
        input: Value,
    ) -> Result<Uuid, QueueError>;

    /// Claim up to `max_items` ready items for this worker
    async fn claim(&self, worker_id: &str, max_items: usize) -> Result<Vec<WorkItem>, QueueError>;

    /// Record liveness for a claimed item
    ///
    /// Returns false when cancellation was requested for the item's run;
    /// the worker then cancels the in-flight execution.
    async fn heartbeat(&self, item_id: Uuid, worker_id: &str) -> Result<bool, QueueError>;

    /// Acknowledge a finished item (success or failure: the run record
    /// carries the outcome)
    async fn ack(&self, item_id: Uuid) -> Result<(), QueueError>;

    /// Return a claimed item to the ready state (worker shutdown)
    async fn release(&self, item_id: Uuid) -> Result<(), QueueError>;

    /// Make abandoned items ready again; returns the ids requeued
    async fn requeue_abandoned(
        &self,
        visibility_timeout: Duration,
    ) -> Result<Vec<Uuid>, QueueError>;

    /// Drop ready items for a workflow (deletion, pause); returns run ids
    async fn drop_ready(&self, workflow_id: Uuid) -> Result<Vec<Uuid>, QueueError>;

    /// Current backlog counters
    async fn depth(&self) -> Result<QueueDepth, QueueError>;
}
