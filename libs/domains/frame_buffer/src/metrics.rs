//! Prometheus metrics: a `pub mod names` of string constants, thin
//! recording functions wrapping the `metrics` crate's macros, and a
//! process-wide `OnceLock<PrometheusHandle>` singleton so `/metrics`
//! renders the same way across every binary in this workspace.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub mod names {
    pub const FRAMES_ROUTED: &str = "frame_buffer_frames_routed_total";
    pub const FRAMES_DROPPED: &str = "frame_buffer_frames_dropped_total";
    pub const FRAMES_DLQ: &str = "frame_buffer_frames_dlq_total";
    pub const ROUTE_DURATION: &str = "frame_buffer_route_duration_seconds";
    pub const BREAKER_STATE: &str = "frame_buffer_breaker_state";
    pub const BACKPRESSURE_LEVEL: &str = "frame_buffer_backpressure_level";
    pub const CONSUMPTION_RATE: &str = "frame_buffer_consumption_rate";
    pub const PRIORITY_QUEUE_DEPTH: &str = "frame_buffer_priority_queue_depth";
    pub const STARVATION_EVENTS: &str = "frame_buffer_starvation_events_total";
    pub const ACTIVE_PROCESSORS: &str = "frame_buffer_active_processors";
    pub const CLIENT_FRAMES_PROCESSED: &str = "frame_buffer_client_frames_processed_total";
    pub const CLIENT_FRAMES_FAILED: &str = "frame_buffer_client_frames_failed_total";
    pub const PROCESSOR_QUEUE_UTILIZATION: &str = "frame_buffer_processor_queue_utilization";
    pub const PROCESSOR_THROTTLE: &str = "frame_buffer_processor_throttle";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Routed,
    DroppedNoCandidate,
    Dlq,
}

impl RouteOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Routed => "routed",
            Self::DroppedNoCandidate => "dropped_no_candidate",
            Self::Dlq => "dlq",
        }
    }
}

pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

pub fn get_metrics_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

pub fn record_route_outcome(outcome: RouteOutcome, processor_id: &str) {
    match outcome {
        RouteOutcome::Routed => {
            metrics::counter!(names::FRAMES_ROUTED, "processor_id" => processor_id.to_string())
                .increment(1);
        }
        RouteOutcome::DroppedNoCandidate => {
            metrics::counter!(names::FRAMES_DROPPED, "reason" => "no_candidate").increment(1);
        }
        RouteOutcome::Dlq => {
            metrics::counter!(names::FRAMES_DLQ, "processor_id" => processor_id.to_string())
                .increment(1);
        }
    }
    let _ = outcome.as_str();
}

pub fn record_route_duration(seconds: f64) {
    metrics::histogram!(names::ROUTE_DURATION).record(seconds);
}

pub fn set_breaker_state(processor_id: &str, state_value: f64) {
    metrics::gauge!(names::BREAKER_STATE, "processor_id" => processor_id.to_string()).set(state_value);
}

pub fn set_backpressure_level(level_value: f64) {
    metrics::gauge!(names::BACKPRESSURE_LEVEL).set(level_value);
}

pub fn set_consumption_rate(rate: f64) {
    metrics::gauge!(names::CONSUMPTION_RATE).set(rate);
}

pub fn set_priority_queue_depth(depth: f64) {
    metrics::gauge!(names::PRIORITY_QUEUE_DEPTH).set(depth);
}

pub fn record_starvation_event() {
    metrics::counter!(names::STARVATION_EVENTS).increment(1);
}

pub fn set_active_processors(count: f64) {
    metrics::gauge!(names::ACTIVE_PROCESSORS).set(count);
}

pub fn record_client_frame_processed(processor_id: &str) {
    metrics::counter!(names::CLIENT_FRAMES_PROCESSED, "processor_id" => processor_id.to_string())
        .increment(1);
}

pub fn record_client_frame_failed(processor_id: &str) {
    metrics::counter!(names::CLIENT_FRAMES_FAILED, "processor_id" => processor_id.to_string())
        .increment(1);
}

pub fn set_processor_queue_utilization(processor_id: &str, utilization: f64) {
    metrics::gauge!(names::PROCESSOR_QUEUE_UTILIZATION, "processor_id" => processor_id.to_string())
        .set(utilization);
}

pub fn set_processor_throttle(processor_id: &str, throttle: f64) {
    metrics::gauge!(names::PROCESSOR_THROTTLE, "processor_id" => processor_id.to_string())
        .set(throttle);
}
