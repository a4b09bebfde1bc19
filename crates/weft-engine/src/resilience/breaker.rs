//! Per-function circuit breaker
//!
//! Failure percentage over a rolling window, with a single half-open probe
//! after the reset timeout. State is per process.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use weft_core::{ErrorKind, ModuleError};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold exceeded - all calls rejected
    Open,

    /// Testing if the upstream recovered - one probe allowed
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failure percentage over the window that opens the circuit
    pub error_threshold_percentage: u8,

    /// Minimum calls in the window before the percentage is considered
    pub volume_threshold: u32,

    /// Time to wait before allowing a half-open probe
    pub reset_timeout: Duration,

    /// Rolling window over which outcomes are counted
    pub window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold_percentage: 50,
            volume_threshold: 3,
            reset_timeout: Duration::from_secs(60),
            window: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error_threshold_percentage(mut self, pct: u8) -> Self {
        self.error_threshold_percentage = pct.min(100);
        self
    }

    pub fn with_volume_threshold(mut self, calls: u32) -> Self {
        self.volume_threshold = calls.max(1);
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

struct BreakerInner {
    state: BreakerState,
    /// (when, failed) outcomes inside the rolling window
    outcomes: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Per-function failure-rate guard
///
/// ```text
/// Closed --(failure % over window)--> Open --(reset timeout)--> HalfOpen
///    ^                                                             |
///    +----------------- probe success ----------------------------+
///            probe failure reopens
/// ```
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                outcomes: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Admit or reject a call
    ///
    /// While open, calls fail fast with a `BreakerOpen` error and the
    /// wrapped function is never invoked. After the reset timeout one
    /// caller wins the half-open probe; the rest keep failing fast until
    /// the probe reports.
    pub fn try_acquire(&self) -> Result<(), ModuleError> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(self.open_error())
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(self.open_error())
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                let now = Instant::now();
                inner.outcomes.push_back((now, false));
                self.evict(&mut inner, now);
            }
            BreakerState::HalfOpen => {
                // Probe succeeded: close and start a fresh window
                inner.state = BreakerState::Closed;
                inner.probe_in_flight = false;
                inner.opened_at = None;
                inner.outcomes.clear();
            }
            BreakerState::Open => {}
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => {
                let now = Instant::now();
                inner.outcomes.push_back((now, true));
                self.evict(&mut inner, now);

                let total = inner.outcomes.len() as u32;
                if total >= self.config.volume_threshold {
                    let failures = inner.outcomes.iter().filter(|(_, f)| *f).count() as u32;
                    let pct = failures * 100 / total;
                    if pct >= self.config.error_threshold_percentage as u32 {
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(now);
                        inner.outcomes.clear();
                        tracing::warn!(
                            breaker = %self.name,
                            failures,
                            total,
                            "circuit breaker opened"
                        );
                    }
                }
            }
            BreakerState::HalfOpen => {
                // Probe failed: reopen and restart the reset timer
                inner.state = BreakerState::Open;
                inner.probe_in_flight = false;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Open => {}
        }
    }

    fn evict(&self, inner: &mut BreakerInner, now: Instant) {
        let window = self.config.window;
        while let Some((at, _)) = inner.outcomes.front() {
            if now.duration_since(*at) > window {
                inner.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn open_error(&self) -> ModuleError {
        ModuleError::new(
            ErrorKind::BreakerOpen,
            format!("circuit breaker '{}' is open", self.name),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test.module",
            CircuitBreakerConfig::default().with_reset_timeout(Duration::from_millis(reset_ms)),
        )
    }

    fn trip(b: &CircuitBreaker, failures: usize) {
        for _ in 0..failures {
            if b.try_acquire().is_ok() {
                b.record_failure();
            }
        }
    }

    #[test]
    fn test_starts_closed_and_allows() {
        let b = breaker(60_000);
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.try_acquire().is_ok());
    }

    #[test]
    fn test_opens_after_volume_and_percentage() {
        let b = breaker(60_000);
        // Two failures are below the volume threshold of 3
        trip(&b, 2);
        assert_eq!(b.state(), BreakerState::Closed);

        trip(&b, 1);
        assert_eq!(b.state(), BreakerState::Open);

        let err = b.try_acquire().unwrap_err();
        assert_eq!(err.kind, ErrorKind::BreakerOpen);
    }

    #[test]
    fn test_mixed_outcomes_below_threshold_stay_closed() {
        let b = breaker(60_000);
        // 1 failure out of 4 calls = 25%, under the 50% default
        b.try_acquire().unwrap();
        b.record_failure();
        for _ in 0..3 {
            b.try_acquire().unwrap();
            b.record_success();
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_probe_success_closes() {
        let b = breaker(10);
        trip(&b, 3);
        assert_eq!(b.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(20));

        // First caller wins the probe
        assert!(b.try_acquire().is_ok());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        // Concurrent callers still fail fast while the probe is in flight
        assert!(b.try_acquire().is_err());

        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.try_acquire().is_ok());
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let b = breaker(10);
        trip(&b, 3);
        std::thread::sleep(Duration::from_millis(20));

        assert!(b.try_acquire().is_ok());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(b.try_acquire().is_err());
    }

    #[test]
    fn test_consecutive_500s_open_without_invoking() {
        // Ten consecutive failures, then the next call is rejected up front
        let b = breaker(60_000);
        let mut invoked = 0;
        for _ in 0..10 {
            if b.try_acquire().is_ok() {
                invoked += 1;
                b.record_failure();
            }
        }
        assert_eq!(b.state(), BreakerState::Open);
        // Only the calls before the circuit opened actually ran
        assert_eq!(invoked, 3);

        let err = b.try_acquire().unwrap_err();
        assert_eq!(err.kind, ErrorKind::BreakerOpen);
    }
}
