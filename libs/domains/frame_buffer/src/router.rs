//! Router / Orchestrator (C6): the heart of the system. Consumes the
//! ingress stream via a consumer group, selects a target processor per
//! frame honoring breakers and backpressure, and appends to that
//! processor's egress stream — acking the ingress entry only once the
//! egress append has durably returned.

use crate::backpressure::BackpressureController;
use crate::breaker::CircuitBreakerManager;
use crate::config::OrchestratorConfig;
use crate::error::{ErrorCategory, OrchestratorError, OrchestratorResult};
use crate::metrics;
use crate::model::{FrameRef, OrchestratorState, ProcessorRegistration};
use crate::priority_queue::PriorityQueue;
use crate::registry::ProcessorRegistry;
use crate::stream_store::StreamStore;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const RETRY_BOUND: Duration = Duration::from_secs(5);
const RETRY_POLL_INTERVAL: Duration = Duration::from_millis(200);
const MAX_EGRESS_RETRIES: u32 = 3;

struct RetryEntry {
    ingress_id: String,
    deadline: Instant,
}

pub struct Router {
    store: Arc<dyn StreamStore>,
    registry: Arc<ProcessorRegistry>,
    breakers: Arc<CircuitBreakerManager>,
    backpressure: Arc<BackpressureController>,
    queue: Arc<PriorityQueue>,
    config: OrchestratorConfig,
    consumer_id: String,

    is_paused: AtomicBool,
    total_frames_routed: AtomicU64,
    frames_dropped: AtomicU64,
    retry_state: Mutex<HashMap<String, RetryEntry>>,
}

impl Router {
    pub fn new(
        store: Arc<dyn StreamStore>,
        registry: Arc<ProcessorRegistry>,
        breakers: Arc<CircuitBreakerManager>,
        backpressure: Arc<BackpressureController>,
        queue: Arc<PriorityQueue>,
        config: OrchestratorConfig,
        consumer_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            breakers,
            backpressure,
            queue,
            config,
            consumer_id: consumer_id.into(),
            is_paused: AtomicBool::new(false),
            total_frames_routed: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            retry_state: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        let level = self.backpressure.current_level();
        OrchestratorState {
            is_paused: self.is_paused.load(Ordering::SeqCst),
            consumption_rate: self.backpressure.consumption_rate(),
            current_pressure_level: level,
            active_processors: self.registry.active_count(),
            total_frames_routed: self.total_frames_routed.load(Ordering::SeqCst),
            frames_dropped: self.frames_dropped.load(Ordering::SeqCst),
        }
    }

    /// Selection algorithm (§4.6): candidates by capability, filtered by
    /// breaker availability and health, scored, ties broken by least
    /// capacity_used then lexicographic id.
    fn select_processor(&self, frame: &FrameRef) -> Option<ProcessorRegistration> {
        let capability = frame.required_capability();
        let candidates = self.registry.candidates(capability);

        let mut scored: Vec<(f64, ProcessorRegistration)> = candidates
            .into_iter()
            .filter(|(_, health)| health.capacity_used < 1.0)
            .map(|(reg, health)| {
                // recent_error_penalty grows with the processor's own reported
                // errors_last_minute, independent of whether the breaker has
                // opened yet; a noisy-but-still-closed processor is still
                // nudged behind a quieter one.
                let recent_error_penalty = (health.errors_last_minute as f64 * 0.05).min(0.5);
                let score = (1.0 - health.capacity_used) * reg.priority_weight - recent_error_penalty;
                (score, reg)
            })
            .collect();

        scored.sort_by(|(score_a, reg_a), (score_b, reg_b)| {
            score_b
                .partial_cmp(score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| reg_a.id.cmp(&reg_b.id))
        });

        scored.into_iter().next().map(|(_, reg)| reg)
    }

    async fn append_egress_with_retry(
        &self,
        processor: &ProcessorRegistration,
        frame: &FrameRef,
    ) -> OrchestratorResult<String> {
        let mut fields = frame.to_fields()?;
        fields.push(("routed_at".into(), Utc::now().to_rfc3339()));
        fields.push(("route_reason".into(), "selected".into()));

        let mut attempt = 0u32;
        loop {
            match self.store.append(&processor.queue, &fields).await {
                Ok(id) => return Ok(id),
                Err(e) => {
                    let category = e.category();
                    if category != ErrorCategory::Transient || attempt >= MAX_EGRESS_RETRIES {
                        return Err(e);
                    }
                    let delay = category
                        .retry_strategy()
                        .delay_for_attempt(attempt)
                        .unwrap_or(Duration::from_millis(500));
                    warn!(processor_id = %processor.id, attempt, "egress append failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn write_dlq(&self, fields: &[(String, String)], reason: &str, attempts: u32) {
        let mut dlq_fields: Vec<(String, String)> = fields.to_vec();
        dlq_fields.push(("reason".into(), reason.to_string()));
        dlq_fields.push(("failed_at".into(), Utc::now().to_rfc3339()));
        dlq_fields.push(("attempts".into(), attempts.to_string()));
        if let Err(e) = self.store.append(&self.config.dlq_stream, &dlq_fields).await {
            error!(error = %e, reason, "failed to write DLQ entry");
        }
    }

    /// Routes a single decoded frame. Returns `true` if the ingress entry
    /// should be acked now.
    async fn route_frame(&self, frame: &FrameRef, ingress_id: &str) -> bool {
        let Some(processor) = self.select_processor(frame) else {
            return self.handle_no_candidate(frame, ingress_id).await;
        };

        let started_at = Instant::now();
        let outcome = self.append_egress_with_retry(&processor, frame).await;
        metrics::record_route_duration(started_at.elapsed().as_secs_f64());

        match outcome {
            Ok(_egress_id) => {
                self.breakers.record_success(&processor.id);
                self.total_frames_routed.fetch_add(1, Ordering::SeqCst);
                metrics::record_route_outcome(metrics::RouteOutcome::Routed, &processor.id);
                true
            }
            Err(e) => {
                warn!(processor_id = %processor.id, frame_id = %frame.frame_id, error = %e, "egress append exhausted retries");
                self.breakers.record_failure(&processor.id);
                // Do not ack: visibility timeout will redeliver the ingress entry.
                false
            }
        }
    }

    async fn handle_no_candidate(&self, frame: &FrameRef, ingress_id: &str) -> bool {
        if frame.priority >= 8 {
            self.retry_state.lock().unwrap().insert(
                frame.frame_id.clone(),
                RetryEntry {
                    ingress_id: ingress_id.to_string(),
                    deadline: Instant::now() + RETRY_BOUND,
                },
            );
            self.queue.enqueue(frame.clone());
            debug!(frame_id = %frame.frame_id, "no candidate, enqueued for bounded retry");
            // Ack deferred to the retry sweep's outcome, not here.
            false
        } else {
            self.frames_dropped.fetch_add(1, Ordering::SeqCst);
            metrics::record_route_outcome(metrics::RouteOutcome::DroppedNoCandidate, "none");
            info!(frame_id = %frame.frame_id, "dropped: no_candidate");
            true
        }
    }

    /// Background sweep over the priority-queue retry buffer: re-attempts
    /// selection for each entry, DLQ's and acks it once the bounded wait
    /// has elapsed with still no candidate.
    async fn retry_sweep_once(&self) {
        let Some(outcome) = self.queue.try_dequeue() else {
            return;
        };
        if outcome.starvation.is_some() {
            metrics::record_starvation_event();
        }
        let frame = outcome.frame;

        let ingress_id = self
            .retry_state
            .lock()
            .unwrap()
            .get(&frame.frame_id)
            .map(|e| (e.ingress_id.clone(), e.deadline));
        let Some((ingress_id, deadline)) = ingress_id else {
            return;
        };

        if let Some(processor) = self.select_processor(&frame) {
            match self.append_egress_with_retry(&processor, &frame).await {
                Ok(_) => {
                    self.breakers.record_success(&processor.id);
                    self.total_frames_routed.fetch_add(1, Ordering::SeqCst);
                    metrics::record_route_outcome(metrics::RouteOutcome::Routed, &processor.id);
                    self.ack_ingress(&ingress_id).await;
                    self.retry_state.lock().unwrap().remove(&frame.frame_id);
                    return;
                }
                Err(e) => {
                    warn!(frame_id = %frame.frame_id, error = %e, "retry append failed");
                    self.breakers.record_failure(&processor.id);
                }
            }
        }

        if Instant::now() >= deadline {
            if let Ok(fields) = frame.to_fields() {
                self.write_dlq(&fields, "undeliverable", 1).await;
            }
            metrics::record_route_outcome(metrics::RouteOutcome::Dlq, "none");
            self.ack_ingress(&ingress_id).await;
            self.retry_state.lock().unwrap().remove(&frame.frame_id);
        } else {
            self.queue.enqueue(frame);
        }
    }

    /// Long-lived task: ensures the consumer group, claims any pending
    /// backlog, then loops reading batches and routing them, honoring the
    /// backpressure-gated consumption rate and global pause.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self
            .store
            .create_group(&self.config.ingress_stream, &self.config.consumer_group, "0")
            .await
        {
            error!(error = %e, "failed to create ingress consumer group");
        }

        let base_interval = Duration::from_millis(self.config.block_ms);
        let mut last_retry_sweep = Instant::now();

        loop {
            if *shutdown.borrow() {
                info!("router shutting down");
                break;
            }

            let rate = self.backpressure.consumption_rate();
            if rate <= 0.0 {
                self.is_paused.store(true, Ordering::SeqCst);
                tokio::select! {
                    _ = tokio::time::sleep(base_interval) => {}
                    _ = shutdown.changed() => continue,
                }
                continue;
            }
            self.is_paused.store(false, Ordering::SeqCst);

            match self
                .store
                .read_group(
                    &self.config.ingress_stream,
                    &self.config.consumer_group,
                    &self.consumer_id,
                    self.config.batch_size,
                    Some(self.config.block_ms),
                )
                .await
            {
                Ok(entries) => {
                    for (id, fields) in entries {
                        self.process_ingress_entry(&id, fields).await;
                    }
                }
                Err(e) if e.is_nogroup_error() => {
                    warn!("ingress group missing, recreating");
                    let _ = self
                        .store
                        .create_group(&self.config.ingress_stream, &self.config.consumer_group, "0")
                        .await;
                }
                Err(e) => {
                    error!(error = %e, "ingress read failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }

            if last_retry_sweep.elapsed() >= RETRY_POLL_INTERVAL {
                self.retry_sweep_once().await;
                metrics::set_priority_queue_depth(self.queue.len() as f64);
                last_retry_sweep = Instant::now();
            }

            if rate < 1.0 {
                let sleep_for = base_interval.mul_f64(1.0 - rate);
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    async fn process_ingress_entry(&self, id: &str, fields: HashMap<String, String>) {
        let frame = match FrameRef::from_fields(&fields) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(ingress_id = %id, error = %e, "decode_error, routing to DLQ");
                let raw_fields: Vec<(String, String)> = fields.into_iter().collect();
                self.write_dlq(&raw_fields, "decode_error", 1).await;
                metrics::record_route_outcome(metrics::RouteOutcome::Dlq, "none");
                self.ack_ingress(id).await;
                return;
            }
        };

        if self.route_frame(&frame, id).await {
            self.ack_ingress(id).await;
        }
    }

    async fn ack_ingress(&self, id: &str) {
        if let Err(e) = self
            .store
            .ack(&self.config.ingress_stream, &self.config.consumer_group, &[id.to_string()])
            .await
        {
            error!(ingress_id = %id, error = %e, "failed to ack ingress entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerManagerConfig, PriorityQueueConfig, RegistryConfig};
    use crate::model::HealthStatus;
    use crate::stream_store::{Fields, PendingEntry, PendingSummaryDetail, TrimSpec};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct FakeStore {
        appended: StdMutex<Vec<(String, Vec<(String, String)>)>>,
    }

    impl FakeStore {
        fn new() -> Self {
            Self {
                appended: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StreamStore for FakeStore {
        async fn append(&self, stream: &str, fields: &[(String, String)]) -> OrchestratorResult<String> {
            self.appended
                .lock()
                .unwrap()
                .push((stream.to_string(), fields.to_vec()));
            Ok(format!("{}-0", self.appended.lock().unwrap().len()))
        }

        async fn read_group(
            &self,
            _stream: &str,
            _group: &str,
            _consumer: &str,
            _count: usize,
            _block_ms: Option<u64>,
        ) -> OrchestratorResult<Vec<(String, Fields)>> {
            Ok(Vec::new())
        }

        async fn read_pending(
            &self,
            _stream: &str,
            _group: &str,
            _consumer: &str,
            _count: usize,
        ) -> OrchestratorResult<Vec<(String, Fields)>> {
            Ok(Vec::new())
        }

        async fn ack(&self, _stream: &str, _group: &str, _ids: &[String]) -> OrchestratorResult<u64> {
            Ok(0)
        }

        async fn create_group(&self, _stream: &str, _group: &str, _start_id: &str) -> OrchestratorResult<()> {
            Ok(())
        }

        async fn pending(&self, _stream: &str, _group: &str) -> OrchestratorResult<PendingSummaryDetail> {
            Ok(PendingSummaryDetail {
                count: 0,
                oldest_id: None,
            })
        }

        async fn pending_details(
            &self,
            _stream: &str,
            _group: &str,
            _count: usize,
        ) -> OrchestratorResult<Vec<PendingEntry>> {
            Ok(Vec::new())
        }

        async fn length(&self, _stream: &str) -> OrchestratorResult<u64> {
            Ok(0)
        }

        async fn trim(&self, _stream: &str, _spec: TrimSpec) -> OrchestratorResult<()> {
            Ok(())
        }

        async fn scan_keys(&self, _pattern: &str) -> OrchestratorResult<Vec<String>> {
            Ok(Vec::new())
        }

        async fn claim_abandoned(
            &self,
            _stream: &str,
            _group: &str,
            _consumer: &str,
            _min_idle_ms: u64,
            _count: usize,
        ) -> OrchestratorResult<Vec<(String, Fields)>> {
            Ok(Vec::new())
        }
    }

    fn make_router(store: Arc<dyn StreamStore>) -> Router {
        let breakers = Arc::new(CircuitBreakerManager::new(CircuitBreakerManagerConfig::default()));
        let registry = Arc::new(ProcessorRegistry::new(RegistryConfig::default(), breakers.clone()));
        let backpressure = Arc::new(crate::backpressure::BackpressureController::new(
            &crate::config::BackpressureConfig::default(),
        ));
        let queue = Arc::new(PriorityQueue::new(PriorityQueueConfig::default()));
        Router::new(
            store,
            registry,
            breakers,
            backpressure,
            queue,
            OrchestratorConfig::default(),
            "router-1",
        )
    }

    fn sample_frame(priority: u8, capability: &str) -> FrameRef {
        FrameRef {
            frame_id: "f1".to_string(),
            camera_id: "cam".to_string(),
            timestamp: Utc::now(),
            width: 1,
            height: 1,
            format: "jpeg".to_string(),
            size_bytes: 0,
            priority,
            trace_context: HashMap::new(),
            metadata: HashMap::from([("capability".to_string(), capability.to_string())]),
        }
    }

    #[tokio::test]
    async fn routes_to_available_candidate() {
        let store: Arc<dyn StreamStore> = Arc::new(FakeStore::new());
        let router = make_router(store);
        router
            .registry
            .register(ProcessorRegistration::new("p1", vec!["det".to_string()], 10));
        router.registry.heartbeat("p1", HealthStatus::Healthy, 0.1);

        let frame = sample_frame(5, "det");
        let acked = router.route_frame(&frame, "ingress-1").await;
        assert!(acked);
        assert_eq!(router.state().total_frames_routed, 1);
    }

    #[tokio::test]
    async fn low_priority_no_candidate_drops_and_acks() {
        let store: Arc<dyn StreamStore> = Arc::new(FakeStore::new());
        let router = make_router(store);

        let frame = sample_frame(2, "det");
        let acked = router.route_frame(&frame, "ingress-1").await;
        assert!(acked);
        assert_eq!(router.state().frames_dropped, 1);
    }

    #[tokio::test]
    async fn high_priority_no_candidate_enqueues_for_retry() {
        let store: Arc<dyn StreamStore> = Arc::new(FakeStore::new());
        let router = make_router(store);

        let frame = sample_frame(9, "det");
        let acked = router.route_frame(&frame, "ingress-1").await;
        assert!(!acked);
        assert_eq!(router.queue.len(), 1);
    }

    #[tokio::test]
    async fn selection_picks_lowest_capacity_used() {
        let store: Arc<dyn StreamStore> = Arc::new(FakeStore::new());
        let router = make_router(store);
        router
            .registry
            .register(ProcessorRegistration::new("p1", vec!["det".to_string()], 10));
        router.registry.heartbeat("p1", HealthStatus::Healthy, 0.8);
        router
            .registry
            .register(ProcessorRegistration::new("p2", vec!["det".to_string()], 10));
        router.registry.heartbeat("p2", HealthStatus::Healthy, 0.1);

        let frame = sample_frame(5, "det");
        let selected = router.select_processor(&frame).unwrap();
        assert_eq!(selected.id, "p2");
    }

    #[tokio::test]
    async fn selection_penalizes_recent_errors() {
        let store: Arc<dyn StreamStore> = Arc::new(FakeStore::new());
        let router = make_router(store);
        router
            .registry
            .register(ProcessorRegistration::new("noisy", vec!["det".to_string()], 10));
        router
            .registry
            .heartbeat_with_counters("noisy", HealthStatus::Healthy, 0.1, None, Some(20));
        router
            .registry
            .register(ProcessorRegistration::new("quiet", vec!["det".to_string()], 10));
        router
            .registry
            .heartbeat_with_counters("quiet", HealthStatus::Healthy, 0.1, None, Some(0));

        let frame = sample_frame(5, "det");
        let selected = router.select_processor(&frame).unwrap();
        assert_eq!(selected.id, "quiet");
    }
}
