//! In-memory implementation of the work queue
//!
//! Primarily for tests: same claim semantics as the Postgres
//! implementation, including per-workflow serialization and visibility
//! timeouts.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use super::{QueueDepth, QueueError, WorkItem, WorkQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemStatus {
    Ready,
    Claimed,
    Done,
}

struct MemItem {
    id: Uuid,
    workflow_id: Uuid,
    run_id: Uuid,
    input: Value,
    sequence: u64,
    status: ItemStatus,
    claimed_by: Option<String>,
    heartbeat_at: Option<Instant>,
    cancel_requested: bool,
}

#[derive(Default)]
struct Inner {
    items: Vec<MemItem>,
    next_sequence: u64,
}

/// In-memory work queue with the production claim semantics
#[derive(Default)]
pub struct InMemoryWorkQueue {
    inner: Mutex<Inner>,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag an item's run as cancelled; surfaced through `heartbeat`
    pub fn request_cancel(&self, run_id: Uuid) {
        let mut inner = self.inner.lock();
        for item in inner.items.iter_mut() {
            if item.run_id == run_id {
                item.cancel_requested = true;
            }
        }
    }

    /// Number of items ever enqueued (tests)
    pub fn total_enqueued(&self) -> usize {
        self.inner.lock().items.len()
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(
        &self,
        workflow_id: Uuid,
        run_id: Uuid,
        input: Value,
    ) -> Result<Uuid, QueueError> {
        let mut inner = self.inner.lock();
        let id = Uuid::now_v7();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.items.push(MemItem {
            id,
            workflow_id,
            run_id,
            input,
            sequence,
            status: ItemStatus::Ready,
            claimed_by: None,
            heartbeat_at: None,
            cancel_requested: false,
        });
        Ok(id)
    }

    async fn claim(&self, worker_id: &str, max_items: usize) -> Result<Vec<WorkItem>, QueueError> {
        let mut inner = self.inner.lock();

        // Workflows that already have an in-flight item anywhere
        let mut busy: HashMap<Uuid, ()> = HashMap::new();
        for item in &inner.items {
            if item.status == ItemStatus::Claimed {
                busy.insert(item.workflow_id, ());
            }
        }

        // Oldest ready item per idle workflow, in global FIFO order
        let mut candidate_ids: Vec<Uuid> = Vec::new();
        let mut seen: HashMap<Uuid, ()> = HashMap::new();
        let mut by_sequence: Vec<(u64, Uuid, Uuid)> = inner
            .items
            .iter()
            .filter(|i| i.status == ItemStatus::Ready)
            .map(|i| (i.sequence, i.workflow_id, i.id))
            .collect();
        by_sequence.sort_unstable();

        for (_, workflow_id, id) in by_sequence {
            if candidate_ids.len() >= max_items {
                break;
            }
            if busy.contains_key(&workflow_id) || seen.contains_key(&workflow_id) {
                continue;
            }
            seen.insert(workflow_id, ());
            candidate_ids.push(id);
        }

        let now = Instant::now();
        let mut claimed = Vec::with_capacity(candidate_ids.len());
        for item in inner.items.iter_mut() {
            if candidate_ids.contains(&item.id) {
                item.status = ItemStatus::Claimed;
                item.claimed_by = Some(worker_id.to_string());
                item.heartbeat_at = Some(now);
                claimed.push(WorkItem {
                    id: item.id,
                    workflow_id: item.workflow_id,
                    run_id: item.run_id,
                    input: item.input.clone(),
                });
            }
        }
        Ok(claimed)
    }

    async fn heartbeat(&self, item_id: Uuid, worker_id: &str) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock();
        let item = inner
            .items
            .iter_mut()
            .find(|i| i.id == item_id && i.status == ItemStatus::Claimed)
            .ok_or(QueueError::ItemNotFound(item_id))?;
        if item.claimed_by.as_deref() != Some(worker_id) {
            return Err(QueueError::ItemNotFound(item_id));
        }
        item.heartbeat_at = Some(Instant::now());
        Ok(!item.cancel_requested)
    }

    async fn ack(&self, item_id: Uuid) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        let item = inner
            .items
            .iter_mut()
            .find(|i| i.id == item_id)
            .ok_or(QueueError::ItemNotFound(item_id))?;
        item.status = ItemStatus::Done;
        item.claimed_by = None;
        Ok(())
    }

    async fn release(&self, item_id: Uuid) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        let item = inner
            .items
            .iter_mut()
            .find(|i| i.id == item_id && i.status == ItemStatus::Claimed)
            .ok_or(QueueError::ItemNotFound(item_id))?;
        item.status = ItemStatus::Ready;
        item.claimed_by = None;
        item.heartbeat_at = None;
        Ok(())
    }

    async fn requeue_abandoned(
        &self,
        visibility_timeout: Duration,
    ) -> Result<Vec<Uuid>, QueueError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let mut requeued = Vec::new();
        for item in inner.items.iter_mut() {
            if item.status == ItemStatus::Claimed {
                let stale = item
                    .heartbeat_at
                    .map(|at| now.duration_since(at) > visibility_timeout)
                    .unwrap_or(true);
                if stale {
                    item.status = ItemStatus::Ready;
                    item.claimed_by = None;
                    item.heartbeat_at = None;
                    requeued.push(item.id);
                }
            }
        }
        Ok(requeued)
    }

    async fn drop_ready(&self, workflow_id: Uuid) -> Result<Vec<Uuid>, QueueError> {
        let mut inner = self.inner.lock();
        let mut dropped = Vec::new();
        inner.items.retain(|item| {
            if item.workflow_id == workflow_id && item.status == ItemStatus::Ready {
                dropped.push(item.run_id);
                false
            } else {
                true
            }
        });
        Ok(dropped)
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let inner = self.inner.lock();
        let mut depth = QueueDepth::default();
        for item in &inner.items {
            match item.status {
                ItemStatus::Ready => depth.ready += 1,
                ItemStatus::Claimed => depth.in_flight += 1,
                ItemStatus::Done => {}
            }
        }
        Ok(depth)
    }
}
