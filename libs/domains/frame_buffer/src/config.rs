//! Typed configuration, one struct per component, all implementing the
//! workspace's `core_config::FromEnv` convention: read-env-or-default,
//! never panic, return `ConfigError` so the binary can exit non-zero
//! cleanly before any task is spawned.

use core_config::{ConfigError, FromEnv, env_or_default};

fn parse_env<T: std::str::FromStr>(key: &str, default: &str) -> Result<T, ConfigError> {
    env_or_default(key, default)
        .parse()
        .map_err(|_| ConfigError::ParseError {
            key: key.to_string(),
            details: format!("expected a value parseable from '{}'", env_or_default(key, default)),
        })
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub ingress_stream: String,
    pub dlq_stream: String,
    pub consumer_group: String,
    pub batch_size: usize,
    pub block_ms: u64,
    pub drain_timeout_s: u64,
}

impl FromEnv for OrchestratorConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            ingress_stream: env_or_default("INGRESS_STREAM", "frames:metadata"),
            dlq_stream: env_or_default("DLQ_STREAM", "frames:dlq"),
            consumer_group: env_or_default("CONSUMER_GROUP", "frame-buffer-group"),
            batch_size: parse_env("BATCH_SIZE", "10")?,
            block_ms: parse_env("BLOCK_MS", "1000")?,
            drain_timeout_s: parse_env("DRAIN_TIMEOUT_S", "30")?,
        })
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            ingress_stream: "frames:metadata".to_string(),
            dlq_stream: "frames:dlq".to_string(),
            consumer_group: "frame-buffer-group".to_string(),
            batch_size: 10,
            block_ms: 1000,
            drain_timeout_s: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub liveness_check_interval_s: u64,
    pub liveness_timeout_s: u64,
}

impl FromEnv for RegistryConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            liveness_check_interval_s: parse_env("LIVENESS_CHECK_INTERVAL_S", "10")?,
            liveness_timeout_s: parse_env("LIVENESS_TIMEOUT_S", "60")?,
        })
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            liveness_check_interval_s: 10,
            liveness_timeout_s: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackpressureConfig {
    pub check_interval_s: u64,
    pub low: f64,
    pub high: f64,
    pub critical: f64,
    pub alert_cooldown_s: u64,
}

impl FromEnv for BackpressureConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            check_interval_s: parse_env("BACKPRESSURE_CHECK_INTERVAL_S", "5")?,
            low: parse_env("BACKPRESSURE_LOW", "0.6")?,
            high: parse_env("BACKPRESSURE_HIGH", "0.8")?,
            critical: parse_env("BACKPRESSURE_CRITICAL", "0.95")?,
            alert_cooldown_s: 300,
        })
    }
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            check_interval_s: 5,
            low: 0.6,
            high: 0.8,
            critical: 0.95,
            alert_cooldown_s: 300,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerManagerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_s: u64,
    pub success_threshold: u32,
    pub half_open_max_calls: u32,
}

impl FromEnv for CircuitBreakerManagerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            failure_threshold: parse_env("CB_FAILURE_THRESHOLD", "5")?,
            recovery_timeout_s: parse_env("CB_RECOVERY_TIMEOUT_S", "60")?,
            success_threshold: parse_env("CB_SUCCESS_THRESHOLD", "3")?,
            half_open_max_calls: parse_env("CB_HALF_OPEN_MAX_CALLS", "3")?,
        })
    }
}

impl Default for CircuitBreakerManagerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_s: 60,
            success_threshold: 3,
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PriorityQueueConfig {
    pub starvation_threshold: u32,
    pub max_age_seconds: u64,
}

impl Default for PriorityQueueConfig {
    fn default() -> Self {
        Self {
            starvation_threshold: 100,
            max_age_seconds: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorClientConfig {
    pub orchestrator_url: String,
    pub heartbeat_interval_s: u64,
    pub drain_timeout_s: u64,
    pub max_retries: u32,
    /// Minimum time a delivered-but-unacked entry must sit idle before the
    /// reclaim loop claims it for redelivery-count bookkeeping.
    pub reclaim_idle_ms: u64,
    pub reclaim_interval_s: u64,
}

impl FromEnv for ProcessorClientConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            orchestrator_url: core_config::env_required("ORCHESTRATOR_URL")?,
            heartbeat_interval_s: parse_env("HEARTBEAT_INTERVAL_S", "30")?,
            drain_timeout_s: parse_env("DRAIN_TIMEOUT_S", "30")?,
            max_retries: parse_env("PROCESSOR_MAX_RETRIES", "3")?,
            reclaim_idle_ms: parse_env("PROCESSOR_RECLAIM_IDLE_MS", "30000")?,
            reclaim_interval_s: parse_env("PROCESSOR_RECLAIM_INTERVAL_S", "15")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orchestrator_config_defaults() {
        temp_env::with_vars_unset(
            ["INGRESS_STREAM", "DLQ_STREAM", "CONSUMER_GROUP", "BATCH_SIZE", "BLOCK_MS", "DRAIN_TIMEOUT_S"],
            || {
                let cfg = OrchestratorConfig::from_env().unwrap();
                assert_eq!(cfg.ingress_stream, "frames:metadata");
                assert_eq!(cfg.consumer_group, "frame-buffer-group");
                assert_eq!(cfg.batch_size, 10);
            },
        );
    }

    #[test]
    fn bad_numeric_env_is_parse_error() {
        temp_env::with_var("BATCH_SIZE", Some("not-a-number"), || {
            let err = OrchestratorConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::ParseError { .. }));
        });
    }

    #[test]
    fn backpressure_thresholds_from_env() {
        temp_env::with_var("BACKPRESSURE_HIGH", Some("0.75"), || {
            let cfg = BackpressureConfig::from_env().unwrap();
            assert_eq!(cfg.high, 0.75);
        });
    }

    #[test]
    fn processor_client_requires_orchestrator_url() {
        temp_env::with_var_unset("ORCHESTRATOR_URL", || {
            let err = ProcessorClientConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::MissingEnvVar(_)));
        });
    }
}
