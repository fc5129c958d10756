//! Error types for the frame buffer orchestrator and processor client.
//!
//! A single `thiserror`-derived enum, a behavioral `category()`
//! classification, and a retry strategy derived from that category rather
//! than from the concrete variant.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Policy error: {0}")]
    Policy(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl OrchestratorError {
    /// Categorize the error for retry/breaker/DLQ decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Redis(e) => {
                let s = e.to_string().to_lowercase();
                if s.contains("connection")
                    || s.contains("disconnected")
                    || s.contains("broken pipe")
                    || s.contains("reset by peer")
                    || s.contains("refused")
                    || s.contains("eof")
                    || s.contains("timeout")
                    || s.contains("timed out")
                {
                    ErrorCategory::Transient
                } else if s.contains("busy") || s.contains("loading") {
                    ErrorCategory::Transient
                } else {
                    ErrorCategory::Permanent
                }
            }
            Self::Serialization(_) => ErrorCategory::Permanent,
            Self::Config(_) => ErrorCategory::Permanent,
            Self::Protocol(_) => ErrorCategory::Permanent,
            Self::Registry(s) => {
                let lower = s.to_lowercase();
                if lower.contains("conflict") || lower.contains("unknown") {
                    ErrorCategory::Policy
                } else {
                    ErrorCategory::Transient
                }
            }
            Self::Policy(_) => ErrorCategory::Policy,
            Self::Internal(_) => ErrorCategory::Transient,
            Self::Http(s) => {
                let lower = s.to_lowercase();
                if lower.contains("409") || lower.contains("404") || lower.contains("401") {
                    ErrorCategory::Policy
                } else {
                    ErrorCategory::Transient
                }
            }
        }
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Redis(e) if {
            let s = e.to_string().to_lowercase();
            s.contains("connection") || s.contains("refused") || s.contains("disconnected")
        })
    }

    pub fn is_nogroup_error(&self) -> bool {
        match self {
            Self::Redis(e) => e.to_string().contains("NOGROUP"),
            Self::Registry(s) | Self::Internal(s) => s.contains("NOGROUP"),
            _ => false,
        }
    }
}

/// Behavioral classification driving retry/backoff/DLQ decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Temporary failure, safe to retry with backoff.
    Transient,
    /// Will never succeed on retry; route to DLQ / fail fast.
    Permanent,
    /// A local policy decision (no candidate, breaker open, paused) rather
    /// than a failure of the I/O layer; handled by the caller, not retried
    /// generically.
    Policy,
}

impl ErrorCategory {
    pub fn retry_strategy(&self) -> RetryStrategy {
        match self {
            Self::Transient => RetryStrategy::ExponentialBackoff {
                base_delay_ms: 1000,
                max_delay_ms: 30_000,
                max_retries: 3,
            },
            Self::Permanent => RetryStrategy::NoRetry,
            Self::Policy => RetryStrategy::NoRetry,
        }
    }

    pub fn should_retry(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    NoRetry,
    ExponentialBackoff {
        base_delay_ms: u64,
        max_delay_ms: u64,
        max_retries: u32,
    },
}

impl RetryStrategy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::NoRetry => None,
            Self::ExponentialBackoff {
                base_delay_ms,
                max_delay_ms,
                max_retries,
            } => {
                if attempt >= *max_retries {
                    return None;
                }
                let exp_delay = base_delay_ms.saturating_mul(2u64.pow(attempt));
                let capped = exp_delay.min(*max_delay_ms);
                Some(Duration::from_millis(Self::apply_jitter(capped)))
            }
        }
    }

    fn apply_jitter(delay_ms: u64) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        use std::time::SystemTime;

        let mut hasher = DefaultHasher::new();
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
            .hash(&mut hasher);
        let hash = hasher.finish();

        let jitter_range = delay_ms / 4;
        if jitter_range == 0 {
            return delay_ms;
        }
        let offset = (hash % (jitter_range * 2 + 1)) as i64 - jitter_range as i64;
        if offset < 0 {
            delay_ms.saturating_sub((-offset) as u64)
        } else {
            delay_ms.saturating_add(offset as u64)
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        match self {
            Self::NoRetry => false,
            Self::ExponentialBackoff { max_retries, .. } => attempt < *max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        match self {
            Self::NoRetry => 0,
            Self::ExponentialBackoff { max_retries, .. } => *max_retries,
        }
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::Policy("no candidate".to_string());
        assert_eq!(err.to_string(), "Policy error: no candidate");
    }

    #[test]
    fn test_category_permanent_for_serialization_and_protocol() {
        let err = OrchestratorError::Serialization(
            serde_json::from_str::<serde_json::Value>("{bad").unwrap_err(),
        );
        assert_eq!(err.category(), ErrorCategory::Permanent);

        let err = OrchestratorError::Protocol("decode_error".to_string());
        assert_eq!(err.category(), ErrorCategory::Permanent);
    }

    #[test]
    fn test_category_policy() {
        let err = OrchestratorError::Policy("breaker open".to_string());
        assert_eq!(err.category(), ErrorCategory::Policy);
        assert!(!err.category().should_retry());
    }

    #[test]
    fn test_retry_strategy_backoff_caps_and_retries() {
        let strategy = ErrorCategory::Transient.retry_strategy();
        assert!(strategy.should_retry(0));
        assert!(!strategy.should_retry(3));
        assert_eq!(strategy.max_retries(), 3);
        assert!(strategy.delay_for_attempt(0).is_some());
        assert!(strategy.delay_for_attempt(3).is_none());
    }

    #[test]
    fn test_permanent_never_retries() {
        let strategy = ErrorCategory::Permanent.retry_strategy();
        assert!(!strategy.should_retry(0));
        assert_eq!(strategy.delay_for_attempt(0), None);
    }
}
