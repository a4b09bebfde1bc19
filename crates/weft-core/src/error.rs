//! Error taxonomy for module invocations and runs
//!
//! Every failure that crosses the module boundary is classified into an
//! [`ErrorKind`]. The kind alone decides retryability; the step retry loop
//! never inspects messages.

use serde::{Deserialize, Serialize};

/// Classification of a module or run failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Malformed workflow, unknown module, bad input shape. Permanent.
    Validation,

    /// Required credential not found, or expired and non-refreshable. Permanent.
    CredentialMissing,

    /// Network error, HTTP 5xx, connection reset. Retried per step policy.
    TransientUpstream,

    /// HTTP 4xx (except 408/429) or provider-declared permanent error.
    PermanentUpstream,

    /// HTTP 429 or limiter saturation. Retried with backoff.
    RateLimited,

    /// Circuit breaker rejected the call without invoking the module.
    BreakerOpen,

    /// The call exceeded its timeout.
    Timeout,

    /// The run was cancelled while the call was in flight.
    Cancelled,

    /// Engine bug or serialization failure. Logged at error; not retried.
    Internal,
}

impl ErrorKind {
    /// Whether the step retry policy may retry a failure of this kind
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientUpstream | Self::RateLimited | Self::BreakerOpen | Self::Timeout
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::CredentialMissing => "credential-missing",
            Self::TransientUpstream => "transient-upstream",
            Self::PermanentUpstream => "permanent-upstream",
            Self::RateLimited => "rate-limited",
            Self::BreakerOpen => "breaker-open",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// Error returned by a module invocation
///
/// Captured into the owning step's [`StepResult`](crate::model::StepResult);
/// never propagated past the engine.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error, utoipa::ToSchema)]
#[error("{kind}: {message}")]
pub struct ModuleError {
    pub kind: ErrorKind,
    pub message: String,

    /// Upstream provider name, when the failure came from an integration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Upstream HTTP status, when applicable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,

    /// Seconds to wait before retrying, from an upstream Retry-After header
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ModuleError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            provider: None,
            status: None,
            retry_after_secs: None,
        }
    }

    /// Validation failure (unknown module, bad input shape)
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Missing or unusable credential
    pub fn credential_missing(platform: &str) -> Self {
        Self::new(
            ErrorKind::CredentialMissing,
            format!("no credential available for platform '{platform}'"),
        )
    }

    /// Transient upstream failure
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientUpstream, message)
    }

    /// Internal engine failure
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Timeout while invoking a module
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Classify a failure from an upstream HTTP status code
    ///
    /// 5xx and 408 are transient, 429 is rate-limited, remaining 4xx are
    /// permanent.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            429 => ErrorKind::RateLimited,
            408 => ErrorKind::TransientUpstream,
            s if s >= 500 => ErrorKind::TransientUpstream,
            s if s >= 400 => ErrorKind::PermanentUpstream,
            _ => ErrorKind::Internal,
        };
        Self {
            kind,
            message: message.into(),
            provider: None,
            status: Some(status),
            retry_after_secs: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }
}

/// Sanitized, user-visible failure persisted on a `Run`
///
/// Carries no credential material and no backtraces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RunError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(limit_ms: u64) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("run exceeded its timeout of {limit_ms} ms"),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "run was cancelled")
    }
}

impl From<&ModuleError> for RunError {
    fn from(err: &ModuleError) -> Self {
        Self {
            kind: err.kind,
            message: err.message.clone(),
        }
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::TransientUpstream.retryable());
        assert!(ErrorKind::RateLimited.retryable());
        assert!(ErrorKind::BreakerOpen.retryable());
        assert!(ErrorKind::Timeout.retryable());

        assert!(!ErrorKind::Validation.retryable());
        assert!(!ErrorKind::CredentialMissing.retryable());
        assert!(!ErrorKind::PermanentUpstream.retryable());
        assert!(!ErrorKind::Cancelled.retryable());
        assert!(!ErrorKind::Internal.retryable());
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(
            ModuleError::from_status(503, "upstream down").kind,
            ErrorKind::TransientUpstream
        );
        assert_eq!(
            ModuleError::from_status(429, "slow down").kind,
            ErrorKind::RateLimited
        );
        assert_eq!(
            ModuleError::from_status(408, "request timeout").kind,
            ErrorKind::TransientUpstream
        );
        assert_eq!(
            ModuleError::from_status(404, "not found").kind,
            ErrorKind::PermanentUpstream
        );
        assert_eq!(
            ModuleError::from_status(401, "unauthorized").kind,
            ErrorKind::PermanentUpstream
        );
    }

    #[test]
    fn test_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&ErrorKind::BreakerOpen).unwrap();
        assert_eq!(json, "\"breaker-open\"");
        let json = serde_json::to_string(&ErrorKind::CredentialMissing).unwrap();
        assert_eq!(json, "\"credential-missing\"");
    }

    #[test]
    fn test_run_error_from_module_error() {
        let me = ModuleError::from_status(500, "boom").with_provider("twilio");
        let re = RunError::from(&me);
        assert_eq!(re.kind, ErrorKind::TransientUpstream);
        assert_eq!(re.message, "boom");
    }
}
