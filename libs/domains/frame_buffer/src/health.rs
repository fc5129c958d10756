//! HTTP surface: processor registry CRUD, orchestrator status, liveness/
//! readiness probes, Prometheus exposition, and DLQ admin endpoints.
//! Small per-concern handlers merged under one `with_state`.

use crate::breaker::CircuitBreakerManager;
use crate::metrics;
use crate::model::{HealthStatus, OrchestratorState, ProcessorRegistration};
use crate::registry::{HeartbeatOutcome, ProcessorRegistry, RegisterOutcome};
use crate::router::Router;
use crate::stream_store::StreamStore;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Clone)]
pub struct HealthState {
    pub store: Arc<dyn StreamStore>,
    pub registry: Arc<ProcessorRegistry>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub router: Arc<Router>,
    pub app_name: String,
    pub app_version: String,
    pub ingress_stream: String,
    pub dlq_stream: String,
}

async fn health_handler(State(state): State<HealthState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "name": state.app_name,
        "version": state.app_version,
    }))
}

async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.store.length(&state.ingress_stream).await {
        Ok(len) => Ok(Json(json!({ "status": "ready", "ingress_length": len }))),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready", "error": e.to_string() })),
        )),
    }
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::get_metrics_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "metrics not initialized".to_string(),
        )
            .into_response(),
    }
}

async fn stream_info_handler(
    State(state): State<HealthState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.store.length(&state.ingress_stream).await {
        Ok(length) => {
            let pending = state
                .store
                .pending(&state.ingress_stream, "frame-buffer-group")
                .await
                .unwrap_or(crate::stream_store::PendingSummaryDetail {
                    count: 0,
                    oldest_id: None,
                });
            Ok(Json(json!({
                "stream": state.ingress_stream,
                "length": length,
                "pending": pending.count,
                "oldest_pending_id": pending.oldest_id,
            })))
        }
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

async fn orchestrator_status_handler(State(state): State<HealthState>) -> Json<OrchestratorState> {
    Json(state.router.state())
}

async fn register_handler(
    State(state): State<HealthState>,
    Json(registration): Json<ProcessorRegistration>,
) -> (StatusCode, Json<Value>) {
    match state.registry.register(registration.clone()) {
        RegisterOutcome::Created => (
            StatusCode::CREATED,
            Json(json!({ "id": registration.id, "epoch": registration.epoch })),
        ),
        RegisterOutcome::Conflict => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "a live registration already exists", "id": registration.id })),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    id: String,
    status: HealthStatus,
    capacity_used: f64,
    #[serde(default)]
    frames_processed: Option<u64>,
    #[serde(default)]
    errors_last_minute: Option<u32>,
}

async fn heartbeat_handler(
    State(state): State<HealthState>,
    Json(req): Json<HeartbeatRequest>,
) -> (StatusCode, Json<Value>) {
    match state.registry.heartbeat_with_counters(
        &req.id,
        req.status,
        req.capacity_used,
        req.frames_processed,
        req.errors_last_minute,
    ) {
        HeartbeatOutcome::Ok => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        HeartbeatOutcome::Unknown => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown processor id", "id": req.id })),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct ProcessorPatch {
    capabilities: Option<Vec<String>>,
    capacity: Option<u32>,
}

async fn update_processor_handler(
    State(state): State<HealthState>,
    Path(id): Path<String>,
    Json(patch): Json<ProcessorPatch>,
) -> StatusCode {
    if state.registry.update(&id, patch.capabilities, patch.capacity) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn delete_processor_handler(State(state): State<HealthState>, Path(id): Path<String>) -> StatusCode {
    if state.registry.unregister(&id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn list_processors_handler(State(state): State<HealthState>) -> Json<Value> {
    let processors: Vec<Value> = state
        .registry
        .all()
        .into_iter()
        .map(|(reg, health)| {
            json!({
                "id": reg.id,
                "capabilities": reg.capabilities,
                "capacity": reg.capacity,
                "status": health.status,
                "capacity_used": health.capacity_used,
                "breaker_state": format!("{:?}", state.breakers.state_of(&reg.id)),
            })
        })
        .collect();
    Json(json!({ "processors": processors }))
}

#[derive(Debug, Deserialize)]
struct DlqListParams {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    10
}

async fn dlq_stats_handler(
    State(state): State<HealthState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.store.length(&state.dlq_stream).await {
        Ok(length) => Ok(Json(json!({ "stream": state.dlq_stream, "length": length }))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

async fn dlq_list_handler(
    State(state): State<HealthState>,
    Query(params): Query<DlqListParams>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let group = format!("{}-admin-view", state.dlq_stream);
    if let Err(e) = state.store.create_group(&state.dlq_stream, &group, "0").await {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ));
    }
    match state
        .store
        .pending_details(&state.dlq_stream, &group, params.limit.min(100))
        .await
    {
        Ok(entries) => Ok(Json(json!({
            "count": entries.len(),
            "entries": entries.into_iter().map(|e| json!({
                "id": e.id,
                "consumer": e.consumer,
                "idle_ms": e.idle_ms,
                "delivery_count": e.delivery_count,
            })).collect::<Vec<_>>(),
        }))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

async fn dlq_reprocess_handler(
    State(state): State<HealthState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let group = format!("{}-admin-view", state.dlq_stream);
    match state.store.claim_abandoned(&state.dlq_stream, &group, "admin", 0, 1).await {
        Ok(entries) => {
            let Some((_, fields)) = entries.into_iter().find(|(entry_id, _)| entry_id == &id) else {
                return Err((
                    StatusCode::NOT_FOUND,
                    Json(json!({ "error": "message not found in DLQ", "id": id })),
                ));
            };
            let flat: Vec<(String, String)> = fields.into_iter().collect();
            match state.store.append(&state.ingress_stream, &flat).await {
                Ok(new_id) => {
                    let _ = state.store.ack(&state.dlq_stream, &group, &[id.clone()]).await;
                    Ok(Json(json!({ "success": true, "message_id": id, "new_stream_id": new_id })))
                }
                Err(e) => Err((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": e.to_string() })),
                )),
            }
        }
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

pub fn full_router(state: HealthState) -> axum::Router {
    axum::Router::new()
        .route("/processors/register", post(register_handler))
        .route("/processors/heartbeat", post(heartbeat_handler))
        .route("/processors/{id}", put(update_processor_handler))
        .route("/processors/{id}", delete(delete_processor_handler))
        .route("/processors", get(list_processors_handler))
        .route("/orchestrator/status", get(orchestrator_status_handler))
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/stream/info", get(stream_info_handler))
        .route("/metrics", get(metrics_handler))
        .route("/admin/dlq/stats", get(dlq_stats_handler))
        .route("/admin/dlq/messages", get(dlq_list_handler))
        .route("/admin/dlq/reprocess/{id}", post(dlq_reprocess_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limit_is_ten() {
        assert_eq!(default_limit(), 10);
    }
}
