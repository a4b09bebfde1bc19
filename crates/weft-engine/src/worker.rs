//! Worker pool: claims queue items and drives run execution
//!
//! One pool per worker process, executing up to `concurrency` runs at a
//! time. Background loops handle heartbeats, abandoned-item reclamation,
//! and backlog reporting. Shutdown stops claiming first, then drains
//! in-flight runs up to the grace window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use weft_core::model::RunStatus;

use crate::queue::{QueueError, WorkItem, WorkQueue};

/// Default per-worker run concurrency (`WORKFLOW_CONCURRENCY`)
pub const DEFAULT_CONCURRENCY: usize = 50;

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identity in logs and queue claims
    pub worker_name: String,

    /// Maximum concurrent run executions
    pub concurrency: usize,

    /// Minimum poll interval (when work is available)
    pub poll_min_interval: Duration,

    /// Maximum poll interval (when idle)
    pub poll_max_interval: Duration,

    /// Backoff multiplier when a poll finds nothing
    pub poll_backoff: f64,

    /// Item heartbeat interval
    pub heartbeat_interval: Duration,

    /// Claimed items without a heartbeat for this long are requeued
    pub visibility_timeout: Duration,

    /// How often to scan for abandoned items
    pub reclaim_interval: Duration,

    /// Graceful shutdown drain window
    pub shutdown_grace: Duration,

    /// How often to report backlog counters
    pub stats_interval: Duration,

    /// Warn once the ready backlog exceeds this
    pub backlog_warn_threshold: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_name: format!("worker-{}", Uuid::now_v7()),
            concurrency: DEFAULT_CONCURRENCY,
            poll_min_interval: Duration::from_millis(100),
            poll_max_interval: Duration::from_secs(5),
            poll_backoff: 1.5,
            heartbeat_interval: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(60),
            reclaim_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
            stats_interval: Duration::from_secs(30),
            backlog_warn_threshold: 100,
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Executes one claimed item end to end
///
/// The production implementation loads the workflow and credentials,
/// invokes the engine, and persists the run. Tests substitute lighter
/// processors.
#[async_trait]
pub trait RunProcessor: Send + Sync + 'static {
    async fn process(
        &self,
        item: WorkItem,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunStatus>;
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Claims and executes queue items with bounded concurrency
pub struct WorkerPool {
    queue: Arc<dyn WorkQueue>,
    processor: Arc<dyn RunProcessor>,
    config: WorkerConfig,
    slots: Arc<Semaphore>,
    active: Arc<DashMap<Uuid, CancellationToken>>,
    counters: Arc<Counters>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        processor: Arc<dyn RunProcessor>,
        config: WorkerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            slots: Arc::new(Semaphore::new(config.concurrency)),
            queue,
            processor,
            config,
            active: Arc::new(DashMap::new()),
            counters: Arc::new(Counters::default()),
            shutdown_tx,
            shutdown_rx,
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn worker_name(&self) -> &str {
        &self.config.worker_name
    }

    /// Currently executing runs
    pub fn active_count(&self) -> usize {
        self.config.concurrency - self.slots.available_permits()
    }

    /// Start the claim, heartbeat, reclaim and stats loops
    #[instrument(skip(self), fields(worker = %self.config.worker_name))]
    pub fn start(&self) {
        info!(
            concurrency = self.config.concurrency,
            "worker pool starting"
        );
        let mut handles = self.handles.lock();
        handles.push(self.spawn_claim_loop());
        handles.push(self.spawn_heartbeat_loop());
        handles.push(self.spawn_reclaim_loop());
        handles.push(self.spawn_stats_loop());
    }

    /// Graceful shutdown: stop claiming, drain, cancel stragglers
    #[instrument(skip(self), fields(worker = %self.config.worker_name))]
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        info!("worker pool draining");
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        loop {
            if self.slots.available_permits() == self.config.concurrency {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.active_count(),
                    "shutdown grace exceeded, cancelling in-flight runs"
                );
                for entry in self.active.iter() {
                    entry.value().cancel();
                }
                // Give cancelled runs a moment to persist their state
                tokio::time::sleep(Duration::from_secs(2)).await;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }

        info!(
            completed = self.counters.completed.load(Ordering::Relaxed),
            failed = self.counters.failed.load(Ordering::Relaxed),
            "worker pool stopped"
        );
        Ok(())
    }

    fn spawn_claim_loop(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let processor = Arc::clone(&self.processor);
        let slots = Arc::clone(&self.slots);
        let active = Arc::clone(&self.active);
        let counters = Arc::clone(&self.counters);
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut interval = config.poll_min_interval;

            loop {
                if *shutdown_rx.borrow() {
                    debug!("claim loop: shutdown requested");
                    return;
                }

                let available = slots.available_permits();
                let claimed = if available == 0 {
                    Vec::new()
                } else {
                    match queue.claim(&config.worker_name, available).await {
                        Ok(items) => items,
                        Err(e) => {
                            error!("claim failed: {e}");
                            Vec::new()
                        }
                    }
                };

                if claimed.is_empty() {
                    interval = Duration::from_secs_f64(
                        (interval.as_secs_f64() * config.poll_backoff)
                            .min(config.poll_max_interval.as_secs_f64()),
                    );
                } else {
                    interval = config.poll_min_interval;
                }

                for item in claimed {
                    let permit = match Arc::clone(&slots).try_acquire_owned() {
                        Ok(p) => p,
                        Err(_) => {
                            // Claimed more than we can hold; give it back
                            let _ = queue.release(item.id).await;
                            continue;
                        }
                    };

                    let cancel = CancellationToken::new();
                    active.insert(item.id, cancel.clone());

                    let queue = Arc::clone(&queue);
                    let processor = Arc::clone(&processor);
                    let active = Arc::clone(&active);
                    let counters = Arc::clone(&counters);

                    tokio::spawn(async move {
                        let item_id = item.id;
                        let run_id = item.run_id;

                        // A panicking run takes down only itself; the worker
                        // keeps claiming.
                        let outcome = std::panic::AssertUnwindSafe(
                            processor.process(item, cancel),
                        )
                        .catch_unwind()
                        .await;

                        match outcome {
                            Ok(Ok(status)) => {
                                if status == RunStatus::Success {
                                    counters.completed.fetch_add(1, Ordering::Relaxed);
                                } else {
                                    counters.failed.fetch_add(1, Ordering::Relaxed);
                                }
                                if let Err(e) = queue.ack(item_id).await {
                                    error!(%run_id, "failed to ack item: {e}");
                                }
                            }
                            Ok(Err(e)) => {
                                // Infrastructure failure before the run could
                                // be persisted; release for another attempt.
                                counters.failed.fetch_add(1, Ordering::Relaxed);
                                error!(%run_id, "run processing failed: {e:#}");
                                if let Err(e) = queue.release(item_id).await {
                                    error!(%run_id, "failed to release item: {e}");
                                }
                            }
                            Err(panic) => {
                                counters.failed.fetch_add(1, Ordering::Relaxed);
                                let msg = panic
                                    .downcast_ref::<&str>()
                                    .map(|s| s.to_string())
                                    .or_else(|| panic.downcast_ref::<String>().cloned())
                                    .unwrap_or_else(|| "unknown panic".to_string());
                                error!(%run_id, %msg, "run panicked");
                                if let Err(e) = queue.ack(item_id).await {
                                    error!(%run_id, "failed to ack panicked item: {e}");
                                }
                            }
                        }

                        active.remove(&item_id);
                        drop(permit);
                    });
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => {
                        debug!("claim loop: shutdown requested");
                        return;
                    }
                }
            }
        })
    }

    fn spawn_heartbeat_loop(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let active = Arc::clone(&self.active);
        let worker_name = self.config.worker_name.clone();
        let interval = self.config.heartbeat_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let items: Vec<(Uuid, CancellationToken)> = active
                            .iter()
                            .map(|e| (*e.key(), e.value().clone()))
                            .collect();
                        for (item_id, token) in items {
                            match queue.heartbeat(item_id, &worker_name).await {
                                Ok(true) => {}
                                Ok(false) => {
                                    info!(%item_id, "cancellation requested, stopping run");
                                    token.cancel();
                                }
                                Err(e) => {
                                    // Item was taken away (requeued after a
                                    // stall); stop working on it.
                                    warn!(%item_id, "heartbeat rejected: {e}");
                                    token.cancel();
                                }
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("heartbeat loop: shutdown requested");
                        return;
                    }
                }
            }
        })
    }

    fn spawn_reclaim_loop(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let interval = self.config.reclaim_interval;
        let visibility_timeout = self.config.visibility_timeout;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match queue.requeue_abandoned(visibility_timeout).await {
                            Ok(requeued) if !requeued.is_empty() => {
                                info!(count = requeued.len(), "requeued abandoned items");
                            }
                            Ok(_) => {}
                            Err(e) => error!("abandoned item scan failed: {e}"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("reclaim loop: shutdown requested");
                        return;
                    }
                }
            }
        })
    }

    fn spawn_stats_loop(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let slots = Arc::clone(&self.slots);
        let counters = Arc::clone(&self.counters);
        let concurrency = self.config.concurrency;
        let interval = self.config.stats_interval;
        let warn_threshold = self.config.backlog_warn_threshold;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match queue.depth().await {
                            Ok(depth) => {
                                let active = concurrency - slots.available_permits();
                                info!(
                                    active,
                                    waiting = depth.ready,
                                    completed = counters.completed.load(Ordering::Relaxed),
                                    failed = counters.failed.load(Ordering::Relaxed),
                                    "worker backlog"
                                );
                                if depth.ready > warn_threshold {
                                    warn!(
                                        waiting = depth.ready,
                                        threshold = warn_threshold,
                                        "queue backlog exceeds threshold"
                                    );
                                }
                            }
                            Err(e) => error!("backlog check failed: {e}"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("stats loop: shutdown requested");
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryWorkQueue;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Processor that records execution order and sleeps per item
    struct RecordingProcessor {
        order: Mutex<Vec<Uuid>>,
        delay: Duration,
    }

    #[async_trait]
    impl RunProcessor for RecordingProcessor {
        async fn process(
            &self,
            item: WorkItem,
            _cancel: CancellationToken,
        ) -> anyhow::Result<RunStatus> {
            self.order.lock().push(item.run_id);
            tokio::time::sleep(self.delay).await;
            Ok(RunStatus::Success)
        }
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig::default()
            .with_worker_name("test-worker")
            .with_shutdown_grace(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_runs_for_one_workflow_execute_in_fifo_order_without_overlap() {
        let queue = Arc::new(InMemoryWorkQueue::new());
        let processor = Arc::new(RecordingProcessor {
            order: Mutex::new(Vec::new()),
            delay: Duration::from_millis(50),
        });

        let wf = Uuid::now_v7();
        let runs: Vec<Uuid> = (0..3).map(|_| Uuid::now_v7()).collect();
        for run_id in &runs {
            queue.enqueue(wf, *run_id, json!({})).await.unwrap();
        }

        let pool = WorkerPool::new(
            Arc::clone(&queue) as Arc<dyn WorkQueue>,
            Arc::clone(&processor) as Arc<dyn RunProcessor>,
            fast_config(),
        );

        let started = std::time::Instant::now();
        pool.start();

        // Three serialized 50ms runs need at least 150ms
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if processor.order.lock().len() == 3
                    && queue.depth().await.unwrap()
                        == (crate::queue::QueueDepth { ready: 0, in_flight: 0 })
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("runs should drain");

        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(*processor.order.lock(), runs);

        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_workflows_execute_concurrently() {
        let queue = Arc::new(InMemoryWorkQueue::new());
        let processor = Arc::new(RecordingProcessor {
            order: Mutex::new(Vec::new()),
            delay: Duration::from_millis(100),
        });

        for _ in 0..4 {
            queue
                .enqueue(Uuid::now_v7(), Uuid::now_v7(), json!({}))
                .await
                .unwrap();
        }

        let pool = WorkerPool::new(
            Arc::clone(&queue) as Arc<dyn WorkQueue>,
            Arc::clone(&processor) as Arc<dyn RunProcessor>,
            fast_config(),
        );

        let started = std::time::Instant::now();
        pool.start();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if processor.order.lock().len() == 4 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("runs should start");

        // Four independent workflows at 100ms each, well under 400ms serial
        assert!(started.elapsed() < Duration::from_millis(350));
        pool.shutdown().await.unwrap();
    }

    struct PanickingProcessor;

    #[async_trait]
    impl RunProcessor for PanickingProcessor {
        async fn process(
            &self,
            _item: WorkItem,
            _cancel: CancellationToken,
        ) -> anyhow::Result<RunStatus> {
            panic!("module blew up");
        }
    }

    #[tokio::test]
    async fn test_panicking_run_does_not_kill_the_worker() {
        let queue = Arc::new(InMemoryWorkQueue::new());
        queue
            .enqueue(Uuid::now_v7(), Uuid::now_v7(), json!({}))
            .await
            .unwrap();

        let pool = WorkerPool::new(
            Arc::clone(&queue) as Arc<dyn WorkQueue>,
            Arc::new(PanickingProcessor),
            fast_config(),
        );
        pool.start();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let depth = queue.depth().await.unwrap();
                if depth.ready == 0 && depth.in_flight == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("panicked item should be consumed");

        // The pool is still alive and can shut down cleanly
        assert_eq!(pool.active_count(), 0);
        pool.shutdown().await.unwrap();
    }
}
