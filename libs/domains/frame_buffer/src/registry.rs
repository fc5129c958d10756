//! Processor Registry (C2): the authoritative, in-process map of
//! processor_id -> {registration, health}. Mutated under its own lock;
//! readers get snapshot semantics. Registry, breaker manager, and
//! backpressure controller are `Arc`-shared singletons with interior
//! `RwLock`/atomics rather than a framework-level actor.

use crate::breaker::CircuitBreakerManager;
use crate::config::RegistryConfig;
use crate::model::{HealthStatus, ProcessorHealth, ProcessorRegistration};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

pub enum RegisterOutcome {
    Created,
    Conflict,
}

pub enum HeartbeatOutcome {
    Ok,
    Unknown,
}

struct Entry {
    registration: ProcessorRegistration,
    health: ProcessorHealth,
    last_heartbeat: chrono::DateTime<Utc>,
}

pub struct ProcessorRegistry {
    config: RegistryConfig,
    entries: RwLock<HashMap<String, Entry>>,
    breakers: Arc<CircuitBreakerManager>,
}

impl ProcessorRegistry {
    pub fn new(config: RegistryConfig, breakers: Arc<CircuitBreakerManager>) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            breakers,
        }
    }

    fn liveness_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.liveness_timeout_s as i64)
    }

    pub fn register(&self, mut registration: ProcessorRegistration) -> RegisterOutcome {
        let now = Utc::now();
        let mut entries = self.entries.write().unwrap();

        if let Some(existing) = entries.get(&registration.id)
            && existing.last_heartbeat + self.liveness_window() >= now
            && existing.health.status.is_routable()
        {
            return RegisterOutcome::Conflict;
        }

        let epoch = entries
            .get(&registration.id)
            .map(|e| e.registration.epoch + 1)
            .unwrap_or(0);
        registration.epoch = epoch;

        info!(processor_id = %registration.id, epoch, "processor registered");
        entries.insert(
            registration.id.clone(),
            Entry {
                registration,
                health: ProcessorHealth::new(),
                last_heartbeat: now,
            },
        );
        RegisterOutcome::Created
    }

    pub fn heartbeat(
        &self,
        id: &str,
        status: HealthStatus,
        capacity_used: f64,
    ) -> HeartbeatOutcome {
        self.heartbeat_with_counters(id, status, capacity_used, None, None)
    }

    /// Full heartbeat update including the optional self-reported counters
    /// (`frames_processed`, `errors_last_minute`) a processor client sends
    /// alongside its status; `None` leaves the stored counter unchanged.
    pub fn heartbeat_with_counters(
        &self,
        id: &str,
        status: HealthStatus,
        capacity_used: f64,
        frames_processed: Option<u64>,
        errors_last_minute: Option<u32>,
    ) -> HeartbeatOutcome {
        let mut entries = self.entries.write().unwrap();
        match entries.get_mut(id) {
            Some(entry) => {
                entry.health.status = status;
                entry.health.capacity_used = capacity_used.clamp(0.0, 1.0);
                if let Some(processed) = frames_processed {
                    entry.health.frames_processed = processed;
                }
                if let Some(errors) = errors_last_minute {
                    entry.health.errors_last_minute = errors;
                }
                entry.health.last_health_check = Utc::now();
                entry.last_heartbeat = Utc::now();
                HeartbeatOutcome::Ok
            }
            None => HeartbeatOutcome::Unknown,
        }
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.entries.write().unwrap().remove(id).is_some()
    }

    pub fn update(
        &self,
        id: &str,
        capabilities: Option<Vec<String>>,
        capacity: Option<u32>,
    ) -> bool {
        let mut entries = self.entries.write().unwrap();
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };
        if let Some(caps) = capabilities {
            entry.registration.capabilities = caps;
        }
        if let Some(cap) = capacity {
            entry.registration.capacity = cap;
        }
        true
    }

    /// Processors exposing `capability`, excluding breaker-open and
    /// liveness-expired entries.
    pub fn candidates(&self, capability: &str) -> Vec<(ProcessorRegistration, ProcessorHealth)> {
        let now = Utc::now();
        let window = self.liveness_window();
        let entries = self.entries.read().unwrap();
        entries
            .values()
            .filter(|e| e.registration.has_capability(capability))
            .filter(|e| e.health.status.is_routable())
            .filter(|e| e.health.is_live(now, window))
            .filter(|e| self.breakers.is_available(&e.registration.id))
            .map(|e| (e.registration.clone(), e.health.clone()))
            .collect()
    }

    pub fn all(&self) -> Vec<(ProcessorRegistration, ProcessorHealth)> {
        self.entries
            .read()
            .unwrap()
            .values()
            .map(|e| (e.registration.clone(), e.health.clone()))
            .collect()
    }

    pub fn by_id(&self, id: &str) -> Option<(ProcessorRegistration, ProcessorHealth)> {
        self.entries
            .read()
            .unwrap()
            .get(id)
            .map(|e| (e.registration.clone(), e.health.clone()))
    }

    pub fn active_count(&self) -> usize {
        let now = Utc::now();
        let window = self.liveness_window();
        self.entries
            .read()
            .unwrap()
            .values()
            .filter(|e| e.health.status.is_routable() && e.health.is_live(now, window))
            .count()
    }

    /// Sweeps for processors whose liveness has expired and soft-evicts
    /// them: marked unhealthy (no longer a candidate) but the record is
    /// retained for diagnostics rather than removed.
    pub fn sweep_liveness(&self) {
        let now = Utc::now();
        let window = self.liveness_window();
        let mut entries = self.entries.write().unwrap();
        for entry in entries.values_mut() {
            if entry.health.status.is_routable() && !entry.health.is_live(now, window) {
                warn!(processor_id = %entry.registration.id, "processor liveness expired, marking unhealthy");
                entry.health.status = HealthStatus::Unhealthy;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerManagerConfig;

    fn registry() -> ProcessorRegistry {
        let breakers = Arc::new(CircuitBreakerManager::new(CircuitBreakerManagerConfig::default()));
        ProcessorRegistry::new(RegistryConfig::default(), breakers)
    }

    #[test]
    fn register_then_candidates() {
        let reg = registry();
        let p = ProcessorRegistration::new("p1", vec!["det".to_string()], 10);
        assert!(matches!(reg.register(p), RegisterOutcome::Created));

        let candidates = reg.candidates("det");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0.id, "p1");
    }

    #[test]
    fn register_conflict_when_live_entry_exists() {
        let reg = registry();
        let p = ProcessorRegistration::new("p1", vec!["det".to_string()], 10);
        reg.register(p.clone());
        assert!(matches!(reg.register(p), RegisterOutcome::Conflict));
    }

    #[test]
    fn heartbeat_with_counters_updates_health_snapshot() {
        let reg = registry();
        reg.register(ProcessorRegistration::new("p1", vec!["det".to_string()], 10));
        reg.heartbeat_with_counters("p1", HealthStatus::Degraded, 0.4, Some(120), Some(3));
        let (_, health) = reg.by_id("p1").unwrap();
        assert_eq!(health.frames_processed, 120);
        assert_eq!(health.errors_last_minute, 3);
        assert_eq!(health.capacity_used, 0.4);
    }

    #[test]
    fn heartbeat_unknown_id() {
        let reg = registry();
        assert!(matches!(
            reg.heartbeat("ghost", HealthStatus::Healthy, 0.1),
            HeartbeatOutcome::Unknown
        ));
    }

    #[test]
    fn register_heartbeat_unregister_round_trip() {
        let reg = registry();
        let p = ProcessorRegistration::new("p1", vec!["det".to_string()], 10);
        reg.register(p);
        assert!(matches!(
            reg.heartbeat("p1", HealthStatus::Healthy, 0.5),
            HeartbeatOutcome::Ok
        ));
        assert!(reg.unregister("p1"));
        assert!(reg.by_id("p1").is_none());
    }

    #[test]
    fn unhealthy_processor_excluded_from_candidates() {
        let reg = registry();
        reg.register(ProcessorRegistration::new("p1", vec!["det".to_string()], 10));
        reg.heartbeat("p1", HealthStatus::Unhealthy, 0.1);
        assert!(reg.candidates("det").is_empty());
    }

    #[test]
    fn breaker_open_excludes_from_candidates() {
        let breakers = Arc::new(CircuitBreakerManager::new(CircuitBreakerManagerConfig {
            failure_threshold: 1,
            recovery_timeout_s: 3600,
            success_threshold: 1,
            half_open_max_calls: 1,
        }));
        let reg = ProcessorRegistry::new(RegistryConfig::default(), breakers.clone());
        reg.register(ProcessorRegistration::new("p1", vec!["det".to_string()], 10));
        breakers.record_failure("p1");
        assert!(reg.candidates("det").is_empty());
    }

    #[test]
    fn explicit_unregister_then_register_starts_fresh_epoch() {
        let reg = registry();
        reg.register(ProcessorRegistration::new("p1", vec!["det".to_string()], 10));
        reg.unregister("p1");
        reg.register(ProcessorRegistration::new("p1", vec!["det".to_string()], 10));
        let (registration, _) = reg.by_id("p1").unwrap();
        assert_eq!(registration.epoch, 0);
    }

    #[test]
    fn epoch_increments_when_re_registering_a_soft_evicted_id() {
        let breakers = Arc::new(CircuitBreakerManager::new(CircuitBreakerManagerConfig::default()));
        let reg = ProcessorRegistry::new(
            RegistryConfig {
                liveness_check_interval_s: 10,
                liveness_timeout_s: 0,
            },
            breakers,
        );
        reg.register(ProcessorRegistration::new("p1", vec!["det".to_string()], 10));
        std::thread::sleep(std::time::Duration::from_millis(5));
        // Liveness window is 0s, so the prior registration is already stale
        // (soft-evicted) and re-registering bumps the epoch rather than
        // conflicting.
        reg.register(ProcessorRegistration::new("p1", vec!["det".to_string()], 10));
        let (registration, _) = reg.by_id("p1").unwrap();
        assert_eq!(registration.epoch, 1);
    }
}
