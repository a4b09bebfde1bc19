//! Composition of the resilience primitives around a module call
//!
//! Fixed order: rate-limit -> breaker -> timeout -> call. A timeout counts
//! as a failure toward the breaker; a breaker rejection never reaches the
//! limiter's pacing state.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use weft_core::{ErrorKind, ModuleError};

use super::{CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig};

/// Defaults applied to scopes and functions without explicit overrides
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub limiter: RateLimiterConfig,
    pub breaker: CircuitBreakerConfig,
    /// Per-call timeout
    pub call_timeout: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            limiter: RateLimiterConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Registry of per-scope limiters and per-function breakers
///
/// Limiters are keyed by scope (the module path minus its final segment,
/// so `social.twitter.reply` and `social.twitter.post` share a limiter);
/// breakers are keyed by the full function name.
pub struct CallGuards {
    config: GuardConfig,
    limiters: DashMap<String, Arc<RateLimiter>>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CallGuards {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            limiters: DashMap::new(),
            breakers: DashMap::new(),
        }
    }

    /// Limiter scope for a dotted module name
    pub fn scope_of(module: &str) -> &str {
        match module.rfind('.') {
            Some(idx) => &module[..idx],
            None => module,
        }
    }

    fn limiter_for(&self, scope: &str) -> Arc<RateLimiter> {
        self.limiters
            .entry(scope.to_string())
            .or_insert_with(|| {
                Arc::new(RateLimiter::new(scope, self.config.limiter.clone()))
            })
            .clone()
    }

    fn breaker_for(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.breaker.clone())))
            .clone()
    }

    /// Install a non-default limiter for a scope (provider quotas)
    pub fn configure_limiter(&self, scope: &str, config: RateLimiterConfig) {
        self.limiters
            .insert(scope.to_string(), Arc::new(RateLimiter::new(scope, config)));
    }

    /// Install a non-default breaker for a function
    pub fn configure_breaker(&self, name: &str, config: CircuitBreakerConfig) {
        self.breakers
            .insert(name.to_string(), Arc::new(CircuitBreaker::new(name, config)));
    }

    /// Breaker state for observability endpoints
    pub fn breaker_state(&self, name: &str) -> Option<super::BreakerState> {
        self.breakers.get(name).map(|b| b.state())
    }

    /// Run a module call under the composed guards
    pub async fn invoke<F, Fut>(&self, module: &str, call: F) -> Result<serde_json::Value, ModuleError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, ModuleError>>,
    {
        let limiter = self.limiter_for(Self::scope_of(module));
        let _permit = limiter.acquire().await?;

        let breaker = self.breaker_for(module);
        breaker.try_acquire()?;

        match tokio::time::timeout(self.config.call_timeout, call()).await {
            Ok(Ok(value)) => {
                breaker.record_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                if counts_toward_breaker(&err) {
                    breaker.record_failure();
                } else {
                    breaker.record_success();
                }
                Err(err)
            }
            Err(_) => {
                breaker.record_failure();
                Err(ModuleError::timeout(format!(
                    "module '{module}' exceeded its {}s timeout",
                    self.config.call_timeout.as_secs()
                )))
            }
        }
    }
}

/// Caller-side faults do not poison the upstream's breaker
fn counts_toward_breaker(err: &ModuleError) -> bool {
    !matches!(
        err.kind,
        ErrorKind::Validation | ErrorKind::CredentialMissing | ErrorKind::Cancelled
    )
}
