//! # Weft engine
//!
//! The workflow execution substrate: step interpreter, module registry,
//! resilience primitives, durable work queue, worker pool, scheduler, and
//! the credential vault service.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Scheduler                            │
//! │      (cron table, webhook delivery, manual triggers)        │
//! └──────────────────────────┬──────────────────────────────────┘
//!                            │ enqueue(run)
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkQueue                            │
//! │   (Postgres: queue_items, FIFO per workflow, heartbeats)    │
//! └──────────────────────────┬──────────────────────────────────┘
//!                            │ claim
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                WorkerPool -> RunPipeline -> Engine          │
//! │  (vault injects credentials, guards wrap each module call)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod engine;
pub mod modules;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod resilience;
pub mod scheduler;
pub mod vault;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::Engine;
    pub use crate::pipeline::{DbStateBackend, RunPipeline};
    pub use crate::queue::{InMemoryWorkQueue, PgWorkQueue, QueueDepth, WorkItem, WorkQueue};
    pub use crate::registry::{ModuleContext, ModuleRegistry, PreloadReport, StateBackend};
    pub use crate::resilience::{
        CallGuards, CircuitBreaker, CircuitBreakerConfig, GuardConfig, RateLimiter,
        RateLimiterConfig, RetryPolicy,
    };
    pub use crate::scheduler::{ScheduleError, Scheduler};
    pub use crate::vault::{OAuthProviderConfig, Vault};
    pub use crate::worker::{RunProcessor, WorkerConfig, WorkerPool};
}

pub use engine::Engine;
pub use pipeline::{DbStateBackend, RunPipeline};
pub use queue::{InMemoryWorkQueue, PgWorkQueue, QueueError, WorkItem, WorkQueue};
pub use registry::{ModuleContext, ModuleRegistry, PreloadReport, StateBackend};
pub use resilience::{CallGuards, CircuitBreakerConfig, GuardConfig, RateLimiterConfig, RetryPolicy};
pub use scheduler::{ScheduleError, Scheduler};
pub use vault::{OAuthProviderConfig, Vault};
pub use worker::{RunProcessor, WorkerConfig, WorkerPool};
