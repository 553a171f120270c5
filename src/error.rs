//! Error taxonomy for report generation
//!
//! Transient backend failures and parse degradation are recovered inside the
//! orchestrator and never reach callers. Only invalid input, exhaustion, and
//! storage failures are surfaced.

use thiserror::Error;

/// Why a generation run gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustReason {
    /// Every configured (provider, model) pair was tried and failed.
    AllProvidersFailed,
    /// The cumulative time budget ran out before the chain was exhausted.
    BudgetExceeded,
}

impl ExhaustReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExhaustReason::AllProvidersFailed => "all_providers_failed",
            ExhaustReason::BudgetExceeded => "budget_exceeded",
        }
    }
}

/// Errors surfaced by the report service.
#[derive(Debug, Error)]
pub enum ReportError {
    /// Malformed request parameters, rejected before any cache or network work.
    #[error("invalid scenario: {0}")]
    InvalidScenario(String),

    /// Every configured backend failed or the time budget ran out.
    #[error("report generation failed: {reason}")]
    GenerationFailed { reason: ExhaustReason },

    /// Cache storage failure outside the fail-open completion path.
    #[error("cache storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl std::fmt::Display for ExhaustReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single backend attempt failure, classified for fallback decisions.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The per-attempt timeout elapsed before a response arrived.
    #[error("attempt timed out after {0} ms")]
    Timeout(u64),

    /// HTTP 429 from the provider.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// HTTP 5xx from the provider.
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },

    /// Connection-level failure (DNS, TLS, refused, reset).
    #[error("connection failed: {0}")]
    Connect(String),

    /// Anything else: 4xx other than 429, missing choices, bad credentials.
    #[error("backend error: {0}")]
    Other(String),
}

impl BackendError {
    /// Transient failures cause fallthrough to the next pair; non-transient
    /// ones do too (the chain is the recovery mechanism), but they are logged
    /// differently and recorded with their own error kind.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Timeout(_)
                | BackendError::RateLimited(_)
                | BackendError::Server { .. }
                | BackendError::Connect(_)
        )
    }

    /// Stable label persisted in the performance log.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Timeout(_) => "timeout",
            BackendError::RateLimited(_) => "rate_limited",
            BackendError::Server { .. } => "server_error",
            BackendError::Connect(_) => "connect",
            BackendError::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(BackendError::Timeout(5000).is_transient());
        assert!(BackendError::RateLimited("429".into()).is_transient());
        assert!(BackendError::Server {
            status: 503,
            body: "unavailable".into()
        }
        .is_transient());
        assert!(!BackendError::Other("invalid api key".into()).is_transient());
    }

    #[test]
    fn error_kind_labels_are_stable() {
        assert_eq!(BackendError::Timeout(1).kind(), "timeout");
        assert_eq!(BackendError::Connect("refused".into()).kind(), "connect");
    }

    #[test]
    fn exhaust_reason_display() {
        assert_eq!(
            ExhaustReason::AllProvidersFailed.to_string(),
            "all_providers_failed"
        );
        assert_eq!(ExhaustReason::BudgetExceeded.to_string(), "budget_exceeded");
    }
}
