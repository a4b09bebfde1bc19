//! Resilience primitives applied around every outbound module call
//!
//! Three small state machines compose in a fixed order:
//! rate-limit -> breaker -> timeout -> call. None of them wrap pure
//! in-memory work, and all of their state is per process: a multi-worker
//! deployment can exceed provider quotas unless a coordinated limiter is
//! put in front (accepted trade-off of horizontal scaling).

mod breaker;
mod guard;
mod limiter;
mod retry;

pub use breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use guard::{CallGuards, GuardConfig};
pub use limiter::{RateLimiter, RateLimiterConfig, ReservoirConfig};
pub use retry::RetryPolicy;
