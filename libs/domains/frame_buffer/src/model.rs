//! Data model shared by every component: the frame envelope, processor
//! registration/health records, queue stats, pressure levels and the
//! orchestrator's own observable state.

use crate::error::{OrchestratorError, OrchestratorResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The unit of routing. Does not carry pixel data, only metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrameRef {
    pub frame_id: String,
    pub camera_id: String,
    pub timestamp: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub size_bytes: u64,
    /// 0..=10, default 0.
    pub priority: u8,
    #[serde(default)]
    pub trace_context: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl FrameRef {
    /// Capability required to route this frame: `metadata.capability`, or a
    /// fixed default when the producer didn't declare one.
    pub fn required_capability(&self) -> &str {
        self.metadata
            .get("capability")
            .map(|s| s.as_str())
            .unwrap_or("default")
    }

    /// Flatten into the Redis stream field-map shape described in the
    /// external interfaces (one scalar string per field; `trace_context`
    /// and `metadata` are JSON-encoded).
    pub fn to_fields(&self) -> OrchestratorResult<Vec<(String, String)>> {
        Ok(vec![
            ("frame_id".into(), self.frame_id.clone()),
            ("camera_id".into(), self.camera_id.clone()),
            ("timestamp".into(), self.timestamp.to_rfc3339()),
            ("width".into(), self.width.to_string()),
            ("height".into(), self.height.to_string()),
            ("format".into(), self.format.clone()),
            ("size_bytes".into(), self.size_bytes.to_string()),
            ("priority".into(), self.priority.to_string()),
            (
                "trace_context".into(),
                serde_json::to_string(&self.trace_context)?,
            ),
            ("metadata".into(), serde_json::to_string(&self.metadata)?),
        ])
    }

    /// Parse back from a Redis field map. Any decode failure is a Protocol
    /// error per the router's failure table (routed to DLQ with
    /// `decode_error`, never retried).
    pub fn from_fields(fields: &HashMap<String, String>) -> OrchestratorResult<Self> {
        let get = |key: &str| {
            fields
                .get(key)
                .ok_or_else(|| OrchestratorError::Protocol(format!("missing field '{key}'")))
        };

        let timestamp = parse_timestamp(get("timestamp")?)?;

        Ok(FrameRef {
            frame_id: get("frame_id")?.clone(),
            camera_id: get("camera_id")?.clone(),
            timestamp,
            width: get("width")?
                .parse()
                .map_err(|_| OrchestratorError::Protocol("invalid width".into()))?,
            height: get("height")?
                .parse()
                .map_err(|_| OrchestratorError::Protocol("invalid height".into()))?,
            format: get("format")?.clone(),
            size_bytes: get("size_bytes")?
                .parse()
                .map_err(|_| OrchestratorError::Protocol("invalid size_bytes".into()))?,
            priority: fields
                .get("priority")
                .map(|s| s.parse().unwrap_or(0))
                .unwrap_or(0),
            trace_context: fields
                .get("trace_context")
                .map(|s| serde_json::from_str(s))
                .transpose()?
                .unwrap_or_default(),
            metadata: fields
                .get("metadata")
                .map(|s| serde_json::from_str(s))
                .transpose()?
                .unwrap_or_default(),
        })
    }
}

/// Accepts either epoch-millis or RFC3339/ISO-8601.
fn parse_timestamp(raw: &str) -> OrchestratorResult<DateTime<Utc>> {
    if let Ok(ms) = raw.parse::<i64>() {
        return DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| OrchestratorError::Protocol("timestamp out of range".into()));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| OrchestratorError::Protocol(format!("invalid timestamp: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_routable(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

/// A processor's declared identity and capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorRegistration {
    pub id: String,
    pub capabilities: Vec<String>,
    pub capacity: u32,
    pub queue: String,
    pub endpoint: Option<String>,
    pub result_stream: Option<String>,
    #[serde(default = "default_priority_weight")]
    pub priority_weight: f64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Monotonic registration generation; bumped on every successful
    /// `register`, used to distinguish a fresh registration from a stale
    /// heartbeat arriving for a soft-evicted id.
    #[serde(default)]
    pub epoch: u64,
}

fn default_priority_weight() -> f64 {
    1.0
}

impl ProcessorRegistration {
    pub fn new(id: impl Into<String>, capabilities: Vec<String>, capacity: u32) -> Self {
        let id = id.into();
        let queue = format!("frames:ready:{id}");
        Self {
            id,
            capabilities,
            capacity,
            queue,
            endpoint: None,
            result_stream: None,
            priority_weight: 1.0,
            metadata: HashMap::new(),
            epoch: 0,
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Liveness/health snapshot tracked by the registry alongside each
/// registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorHealth {
    pub status: HealthStatus,
    pub capacity_used: f64,
    pub frames_processed: u64,
    pub errors_last_minute: u32,
    pub last_health_check: DateTime<Utc>,
}

impl ProcessorHealth {
    pub fn new() -> Self {
        Self {
            status: HealthStatus::Healthy,
            capacity_used: 0.0,
            frames_processed: 0,
            errors_last_minute: 0,
            last_health_check: Utc::now(),
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>, liveness_window: chrono::Duration) -> bool {
        now - self.last_health_check <= liveness_window
    }
}

impl Default for ProcessorHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueStats {
    pub length: u64,
    pub pending: u64,
    pub consumers: u64,
    pub oldest_message_age_seconds: f64,
}

/// Discrete pressure bucket, ordered low-to-high by urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Normal = 0,
    Low = 1,
    High = 2,
    Critical = 3,
}

impl PressureLevel {
    pub fn consumption_rate(&self) -> f64 {
        match self {
            Self::Normal => 1.0,
            Self::Low => 0.8,
            Self::High => 0.5,
            Self::Critical => 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorState {
    pub is_paused: bool,
    pub consumption_rate: f64,
    pub current_pressure_level: PressureLevel,
    pub active_processors: usize,
    pub total_frames_routed: u64,
    pub frames_dropped: u64,
}
