//! Processor Client (C7): library consumed by processor implementations.
//! Registers with the orchestrator's HTTP surface, consumes its egress
//! stream via a consumer group, dispatches to user code over a bounded
//! worker pool, and heartbeats on an interval.

use crate::config::ProcessorClientConfig;
use crate::error::{ErrorCategory, OrchestratorError, OrchestratorResult};
use crate::metrics;
use crate::model::{HealthStatus, ProcessorRegistration};
use crate::stream_store::StreamStore;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

/// Outcome of a single `process_frame` invocation.
pub type ProcessResult = Result<HashMap<String, String>, String>;

/// User-supplied processing function. MUST be idempotent on `frame_id`,
/// since delivery is at-least-once.
pub type ProcessFrameFn =
    dyn Fn(HashMap<String, String>) -> futures::future::BoxFuture<'static, ProcessResult> + Send + Sync;

/// Redeliveries of the same entry beyond this are routed to the DLQ
/// instead of retried again.
const CLAIM_COUNT_DLQ_THRESHOLD: u64 = 5;
const ACTIVE_BLOCK_MS: u64 = 100;
const IDLE_BLOCK_MS: u64 = 5000;

struct Counters {
    active: AtomicU32,
    frames_processed: AtomicU64,
    errors_last_minute: AtomicU32,
}

pub struct ProcessorClient {
    id: String,
    capabilities: Vec<String>,
    capacity: u32,
    result_stream: Option<String>,
    config: ProcessorClientConfig,
    http: reqwest::Client,
    store: Arc<dyn StreamStore>,
    handler: Arc<ProcessFrameFn>,
    counters: Counters,
    semaphore: Arc<Semaphore>,
}

impl ProcessorClient {
    pub fn new(
        id: impl Into<String>,
        capabilities: Vec<String>,
        capacity: u32,
        result_stream: Option<String>,
        config: ProcessorClientConfig,
        store: Arc<dyn StreamStore>,
        handler: Arc<ProcessFrameFn>,
    ) -> Self {
        let id = id.into();
        Self {
            id,
            capabilities,
            capacity,
            result_stream,
            config,
            http: reqwest::Client::new(),
            store,
            handler,
            counters: Counters {
                active: AtomicU32::new(0),
                frames_processed: AtomicU64::new(0),
                errors_last_minute: AtomicU32::new(0),
            },
            semaphore: Arc::new(Semaphore::new(capacity.max(1) as usize)),
        }
    }

    fn queue_name(&self) -> String {
        format!("frames:ready:{}", self.id)
    }

    fn group_name(&self) -> String {
        format!("{}-group", self.id)
    }

    fn consumer_name(&self) -> String {
        format!("{}-1", self.id)
    }

    fn registration(&self) -> ProcessorRegistration {
        let mut reg = ProcessorRegistration::new(self.id.clone(), self.capabilities.clone(), self.capacity);
        reg.result_stream = self.result_stream.clone();
        reg
    }

    /// Step 1: POST the registration, retrying with exponential backoff up
    /// to `max_retries` (a 409 live-conflict is not retried).
    pub async fn register(&self) -> OrchestratorResult<()> {
        let body = serde_json::to_value(self.registration())?;
        let url = format!("{}/processors/register", self.config.orchestrator_url);

        let mut attempt = 0u32;
        loop {
            match self.http.post(&url).json(&body).send().await {
                Ok(resp) if resp.status() == reqwest::StatusCode::CREATED => {
                    info!(processor_id = %self.id, "registered with orchestrator");
                    return Ok(());
                }
                Ok(resp) if resp.status() == reqwest::StatusCode::CONFLICT => {
                    return Err(OrchestratorError::Http(format!(
                        "409 conflict registering '{}': a live registration already exists",
                        self.id
                    )));
                }
                Ok(resp) => {
                    let status = resp.status();
                    if attempt >= self.config.max_retries {
                        return Err(OrchestratorError::Http(format!("registration failed: {status}")));
                    }
                    warn!(processor_id = %self.id, %status, attempt, "registration failed, retrying");
                }
                Err(e) => {
                    if attempt >= self.config.max_retries {
                        return Err(OrchestratorError::Http(e.to_string()));
                    }
                    warn!(processor_id = %self.id, error = %e, attempt, "registration request failed, retrying");
                }
            }

            let delay = ErrorCategory::Transient
                .retry_strategy()
                .delay_for_attempt(attempt)
                .unwrap_or(Duration::from_secs(1));
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn unregister(&self) {
        let url = format!("{}/processors/{}", self.config.orchestrator_url, self.id);
        if let Err(e) = self.http.delete(&url).send().await {
            warn!(processor_id = %self.id, error = %e, "unregister request failed");
        }
    }

    async fn send_heartbeat(&self) {
        let active = self.counters.active.load(Ordering::SeqCst);
        let capacity_used = active as f64 / self.capacity.max(1) as f64;
        let body = serde_json::json!({
            "id": self.id,
            "status": HealthStatus::Healthy,
            "capacity_used": capacity_used,
            "frames_processed": self.counters.frames_processed.load(Ordering::SeqCst),
            "errors_last_minute": self.counters.errors_last_minute.load(Ordering::SeqCst),
        });
        let url = format!("{}/processors/heartbeat", self.config.orchestrator_url);
        match self.http.post(&url).json(&body).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                warn!(processor_id = %self.id, "heartbeat reports unknown id, re-registering");
                if let Err(e) = self.register().await {
                    error!(processor_id = %self.id, error = %e, "re-registration after 404 heartbeat failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(processor_id = %self.id, error = %e, "heartbeat request failed"),
        }
    }

    /// Periodically reclaims entries that have sat pending longer than
    /// `reclaim_idle_ms` — either this consumer's own crashed-mid-batch
    /// backlog or another consumer's abandoned work — carrying forward the
    /// real `delivery_count` from `XPENDING` so the claim-count DLQ
    /// threshold in [`Self::dispatch_one`] is enforced against actual
    /// redelivery history rather than a fixed `1`.
    async fn reclaim_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let queue = self.queue_name();
        let group = self.group_name();
        let consumer = self.consumer_name();
        let interval = Duration::from_secs(self.config.reclaim_interval_s.max(1));

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let available = (self.capacity as i64 - self.counters.active.load(Ordering::SeqCst) as i64).max(0) as usize;
            if available == 0 {
                continue;
            }

            let delivery_counts: HashMap<String, u64> = match self
                .store
                .pending_details(&queue, &group, available)
                .await
            {
                Ok(entries) => entries
                    .into_iter()
                    .filter(|e| e.idle_ms as u64 >= self.config.reclaim_idle_ms)
                    .map(|e| (e.id, e.delivery_count))
                    .collect(),
                Err(e) => {
                    warn!(processor_id = %self.id, error = %e, "failed to list pending entries for reclaim");
                    continue;
                }
            };
            if delivery_counts.is_empty() {
                continue;
            }

            match self
                .store
                .claim_abandoned(&queue, &group, &consumer, self.config.reclaim_idle_ms, available)
                .await
            {
                Ok(entries) => {
                    for (id, fields) in entries {
                        let Some(&delivery_count) = delivery_counts.get(&id) else {
                            continue;
                        };
                        let permit = self.semaphore.clone().acquire_owned().await.unwrap();
                        let this = self.clone();
                        let group = group.clone();
                        tokio::spawn(async move {
                            this.dispatch_one(group, id, fields, delivery_count + 1).await;
                            drop(permit);
                        });
                    }
                }
                Err(e) => warn!(processor_id = %self.id, error = %e, "reclaim (XAUTOCLAIM) failed"),
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.heartbeat_interval_s);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.send_heartbeat().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn publish_result(&self, frame_id: &str, result: HashMap<String, String>) {
        let Some(stream) = &self.result_stream else {
            return;
        };
        let mut fields: Vec<(String, String)> = result.into_iter().collect();
        fields.push(("frame_id".into(), frame_id.to_string()));
        fields.push(("processor_id".into(), self.id.clone()));
        fields.push(("processed_at".into(), Utc::now().to_rfc3339()));
        if let Err(e) = self.store.append(stream, &fields).await {
            error!(processor_id = %self.id, frame_id, error = %e, "failed to publish result");
        }
    }

    /// Dispatches one delivered entry: invokes user code, optionally
    /// publishes a result, then acks. On failure the entry is left
    /// unacked so visibility timeout redelivers it; once its delivery
    /// count exceeds the claim-count threshold it is routed to the DLQ
    /// instead of retried indefinitely.
    async fn dispatch_one(
        self: Arc<Self>,
        ingress_group: String,
        id: String,
        fields: HashMap<String, String>,
        delivery_count: u64,
    ) {
        self.counters.active.fetch_add(1, Ordering::SeqCst);
        let frame_id = fields.get("frame_id").cloned().unwrap_or_else(|| id.clone());

        let handler = self.handler.clone();
        let outcome = (handler)(fields.clone()).await;

        match outcome {
            Ok(result) => {
                self.publish_result(&frame_id, result).await;
                if let Err(e) = self.store.ack(&self.queue_name(), &ingress_group, &[id.clone()]).await {
                    error!(processor_id = %self.id, frame_id, error = %e, "ack failed");
                }
                self.counters.frames_processed.fetch_add(1, Ordering::SeqCst);
                metrics::record_client_frame_processed(&self.id);
            }
            Err(reason) => {
                self.counters.errors_last_minute.fetch_add(1, Ordering::SeqCst);
                metrics::record_client_frame_failed(&self.id);
                warn!(processor_id = %self.id, frame_id, reason, "process_frame failed");

                if delivery_count > CLAIM_COUNT_DLQ_THRESHOLD {
                    let mut dlq_fields: Vec<(String, String)> = fields.into_iter().collect();
                    dlq_fields.push(("reason".into(), "max_redeliveries".into()));
                    dlq_fields.push(("failed_at".into(), Utc::now().to_rfc3339()));
                    dlq_fields.push(("attempts".into(), delivery_count.to_string()));
                    if let Err(e) = self.store.append("frames:dlq", &dlq_fields).await {
                        error!(processor_id = %self.id, frame_id, error = %e, "failed to write DLQ entry");
                    } else if let Err(e) =
                        self.store.ack(&self.queue_name(), &ingress_group, &[id.clone()]).await
                    {
                        error!(processor_id = %self.id, frame_id, error = %e, "ack after DLQ routing failed");
                    }
                }
                // Otherwise left unacked; redelivered after the visibility timeout.
            }
        }

        self.counters.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Steps 2-4: idempotent group creation, then a consume loop that
    /// dispatches to a bounded worker pool sized to `capacity`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let queue = self.queue_name();
        let group = self.group_name();
        let consumer = self.consumer_name();

        if let Err(e) = self.store.create_group(&queue, &group, "0").await {
            error!(processor_id = %self.id, error = %e, "failed to create egress consumer group");
        }

        let heartbeat_handle = tokio::spawn(self.clone().heartbeat_loop(shutdown.clone()));
        let reclaim_handle = tokio::spawn(self.clone().reclaim_loop(shutdown.clone()));

        loop {
            if *shutdown.borrow() {
                break;
            }

            let active = self.counters.active.load(Ordering::SeqCst);
            let block_ms = if active > 0 { ACTIVE_BLOCK_MS } else { IDLE_BLOCK_MS };
            let available = (self.capacity as i64 - active as i64).max(0) as usize;
            if available == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ACTIVE_BLOCK_MS)) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            match self
                .store
                .read_group(&queue, &group, &consumer, available, Some(block_ms))
                .await
            {
                Ok(entries) => {
                    for (id, fields) in entries {
                        let permit = self.semaphore.clone().acquire_owned().await.unwrap();
                        let this = self.clone();
                        let group = group.clone();
                        tokio::spawn(async move {
                            this.dispatch_one(group, id, fields, 1).await;
                            drop(permit);
                        });
                    }
                }
                Err(e) => {
                    error!(processor_id = %self.id, error = %e, "egress read failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!(processor_id = %self.id, "draining before shutdown");
        let drain_deadline = tokio::time::Instant::now() + Duration::from_secs(self.config.drain_timeout_s);
        while self.counters.active.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < drain_deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        heartbeat_handle.abort();
        reclaim_handle.abort();
        self.unregister().await;
        info!(processor_id = %self.id, "shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_store::{Fields, PendingEntry, PendingSummaryDetail, TrimSpec};
    use async_trait::async_trait;
    use futures::FutureExt;
    use std::sync::Mutex;

    struct FakeStore {
        acked: Mutex<Vec<String>>,
        appended: Mutex<Vec<(String, Vec<(String, String)>)>>,
    }

    impl FakeStore {
        fn new() -> Self {
            Self {
                acked: Mutex::new(Vec::new()),
                appended: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StreamStore for FakeStore {
        async fn append(&self, stream: &str, fields: &[(String, String)]) -> OrchestratorResult<String> {
            self.appended.lock().unwrap().push((stream.to_string(), fields.to_vec()));
            Ok("1-0".to_string())
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

        async fn ack(&self, _stream: &str, _group: &str, ids: &[String]) -> OrchestratorResult<u64> {
            self.acked.lock().unwrap().extend(ids.iter().cloned());
            Ok(ids.len() as u64)
        }

        async fn create_group(&self, _stream: &str, _group: &str, _start_id: &str) -> OrchestratorResult<()> {
            Ok(())
        }

        async fn pending(&self, _stream: &str, _group: &str) -> OrchestratorResult<PendingSummaryDetail> {
            Ok(PendingSummaryDetail { count: 0, oldest_id: None })
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

    fn client_config() -> ProcessorClientConfig {
        ProcessorClientConfig {
            orchestrator_url: "http://localhost:0".to_string(),
            heartbeat_interval_s: 30,
            drain_timeout_s: 1,
            max_retries: 3,
            reclaim_idle_ms: 30_000,
            reclaim_interval_s: 15,
        }
    }

    #[tokio::test]
    async fn successful_process_acks_and_publishes_result() {
        let store: Arc<dyn StreamStore> = Arc::new(FakeStore::new());
        let handler: Arc<ProcessFrameFn> = Arc::new(|_fields| {
            async move { Ok(HashMap::from([("label".to_string(), "face".to_string())])) }.boxed()
        });
        let client = Arc::new(ProcessorClient::new(
            "p1",
            vec!["det".to_string()],
            4,
            Some("results:p1".to_string()),
            client_config(),
            store.clone(),
            handler,
        ));

        let fields = HashMap::from([("frame_id".to_string(), "f1".to_string())]);
        client.clone().dispatch_one("p1-group".to_string(), "1-0".to_string(), fields, 1).await;

        assert_eq!(client.counters.frames_processed.load(Ordering::SeqCst), 1);
        assert_eq!(client.counters.active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_process_below_threshold_is_not_dlqd() {
        let store: Arc<dyn StreamStore> = Arc::new(FakeStore::new());
        let handler: Arc<ProcessFrameFn> =
            Arc::new(|_fields| async move { Err("boom".to_string()) }.boxed());
        let client = Arc::new(ProcessorClient::new(
            "p1",
            vec!["det".to_string()],
            4,
            None,
            client_config(),
            store,
            handler,
        ));

        let fields = HashMap::from([("frame_id".to_string(), "f1".to_string())]);
        client.clone().dispatch_one("p1-group".to_string(), "1-0".to_string(), fields, 1).await;

        assert_eq!(client.counters.errors_last_minute.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_process_beyond_threshold_routes_to_dlq() {
        let store = Arc::new(FakeStore::new());
        let handler: Arc<ProcessFrameFn> =
            Arc::new(|_fields| async move { Err("boom".to_string()) }.boxed());
        let client = Arc::new(ProcessorClient::new(
            "p1",
            vec!["det".to_string()],
            4,
            None,
            client_config(),
            store.clone(),
            handler,
        ));

        let fields = HashMap::from([("frame_id".to_string(), "f1".to_string())]);
        client
            .clone()
            .dispatch_one("p1-group".to_string(), "1-0".to_string(), fields, CLAIM_COUNT_DLQ_THRESHOLD + 1)
            .await;

        let appended = store.appended.lock().unwrap();
        assert!(appended.iter().any(|(stream, _)| stream == "frames:dlq"));
    }
}
