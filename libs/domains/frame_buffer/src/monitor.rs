//! Background tasks that keep the registry and backpressure controller
//! current: a liveness sweeper (§4.2) and a periodic egress-utilization
//! sampler (§4.5). Neither owns application state; they poll the
//! `ProcessorRegistry` and `StreamStore` and feed observations into the
//! `BackpressureController`, the same split the router itself uses
//! between reading and deciding.

use crate::backpressure::BackpressureController;
use crate::breaker::CircuitBreakerManager;
use crate::config::{BackpressureConfig, RegistryConfig};
use crate::metrics;
use crate::registry::ProcessorRegistry;
use crate::stream_store::StreamStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Runs until `shutdown` flips true. Marks processors whose liveness has
/// expired as unhealthy so the registry stops offering them as routing
/// candidates; the record itself is retained for diagnostics.
pub async fn run_liveness_sweep(
    registry: Arc<ProcessorRegistry>,
    config: RegistryConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs(config.liveness_check_interval_s);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                registry.sweep_liveness();
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Runs until `shutdown` flips true. Every `check_interval_s`, samples
/// `length/capacity` across every registered processor's egress stream,
/// feeds the maximum into the backpressure controller, and publishes the
/// resulting level, consumption rate, per-processor throttle, and
/// per-processor breaker state as metrics.
pub async fn run_backpressure_monitor(
    registry: Arc<ProcessorRegistry>,
    store: Arc<dyn StreamStore>,
    backpressure: Arc<BackpressureController>,
    breakers: Arc<CircuitBreakerManager>,
    config: BackpressureConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs(config.check_interval_s);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                sample_once(&registry, &store, &backpressure, &breakers).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn sample_once(
    registry: &ProcessorRegistry,
    store: &Arc<dyn StreamStore>,
    backpressure: &BackpressureController,
    breakers: &CircuitBreakerManager,
) {
    let processors = registry.all();
    let mut max_utilization: f64 = 0.0;

    for (registration, _health) in &processors {
        let length = match store.length(&registration.queue).await {
            Ok(len) => len,
            Err(e) => {
                warn!(processor_id = %registration.id, error = %e, "failed to read egress queue length");
                continue;
            }
        };
        let utilization = length as f64 / registration.capacity.max(1) as f64;
        metrics::set_processor_queue_utilization(&registration.id, utilization);
        max_utilization = max_utilization.max(utilization);
    }

    let outcome = backpressure.sample(max_utilization);
    metrics::set_backpressure_level(outcome.level as u8 as f64);
    metrics::set_consumption_rate(outcome.consumption_rate);
    metrics::set_active_processors(registry.active_count() as f64);

    for (registration, _health) in &processors {
        let throttle = backpressure.throttle_for(outcome.level, registration.priority_weight);
        metrics::set_processor_throttle(&registration.id, throttle);
        metrics::set_breaker_state(&registration.id, breakers.state_of(&registration.id) as u8 as f64);
    }

    debug!(max_utilization, level = ?outcome.level, rate = outcome.consumption_rate, "backpressure sample");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerManager;
    use crate::config::CircuitBreakerManagerConfig;
    use crate::model::{HealthStatus, ProcessorRegistration};
    use crate::stream_store::{Fields, PendingEntry, PendingSummaryDetail, TrimSpec};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FakeStore {
        lengths: HashMap<String, u64>,
    }

    #[async_trait]
    impl StreamStore for FakeStore {
        async fn append(&self, _stream: &str, _fields: &[(String, String)]) -> crate::error::OrchestratorResult<String> {
            Ok("1-0".to_string())
        }
        async fn read_group(
            &self,
            _stream: &str,
            _group: &str,
            _consumer: &str,
            _count: usize,
            _block_ms: Option<u64>,
        ) -> crate::error::OrchestratorResult<Vec<(String, Fields)>> {
            Ok(Vec::new())
        }
        async fn read_pending(
            &self,
            _stream: &str,
            _group: &str,
            _consumer: &str,
            _count: usize,
        ) -> crate::error::OrchestratorResult<Vec<(String, Fields)>> {
            Ok(Vec::new())
        }
        async fn ack(&self, _stream: &str, _group: &str, _ids: &[String]) -> crate::error::OrchestratorResult<u64> {
            Ok(0)
        }
        async fn create_group(&self, _stream: &str, _group: &str, _start_id: &str) -> crate::error::OrchestratorResult<()> {
            Ok(())
        }
        async fn pending(&self, _stream: &str, _group: &str) -> crate::error::OrchestratorResult<PendingSummaryDetail> {
            Ok(PendingSummaryDetail { count: 0, oldest_id: None })
        }
        async fn pending_details(
            &self,
            _stream: &str,
            _group: &str,
            _count: usize,
        ) -> crate::error::OrchestratorResult<Vec<PendingEntry>> {
            Ok(Vec::new())
        }
        async fn length(&self, stream: &str) -> crate::error::OrchestratorResult<u64> {
            Ok(*self.lengths.get(stream).unwrap_or(&0))
        }
        async fn trim(&self, _stream: &str, _spec: TrimSpec) -> crate::error::OrchestratorResult<()> {
            Ok(())
        }
        async fn scan_keys(&self, _pattern: &str) -> crate::error::OrchestratorResult<Vec<String>> {
            Ok(Vec::new())
        }
        async fn claim_abandoned(
            &self,
            _stream: &str,
            _group: &str,
            _consumer: &str,
            _min_idle_ms: u64,
            _count: usize,
        ) -> crate::error::OrchestratorResult<Vec<(String, Fields)>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn sample_once_feeds_max_utilization_into_controller() {
        let breakers = Arc::new(CircuitBreakerManager::new(CircuitBreakerManagerConfig::default()));
        let registry = Arc::new(ProcessorRegistry::new(RegistryConfig::default(), breakers.clone()));
        registry.register(ProcessorRegistration::new("p1", vec!["det".to_string()], 100));
        registry.heartbeat("p1", HealthStatus::Healthy, 0.1);

        let store: Arc<dyn StreamStore> = Arc::new(FakeStore {
            lengths: HashMap::from([("frames:ready:p1".to_string(), 96)]),
        });
        let backpressure = Arc::new(BackpressureController::new(&BackpressureConfig::default()));

        sample_once(&registry, &store, &backpressure, &breakers).await;

        assert_eq!(backpressure.current_level(), crate::model::PressureLevel::Critical);
        assert_eq!(backpressure.consumption_rate(), 0.0);
    }
}
