//! Frame Buffer Orchestrator Service
//!
//! Consumes frame metadata off a Redis stream, selects a healthy
//! processor per frame honoring circuit breakers and backpressure, and
//! routes it to that processor's egress stream for durable,
//! at-least-once delivery.
//!
//! ## Architecture
//!
//! ```text
//! Redis Stream (frames:metadata)
//!   ↓ (Consumer Group: frame-buffer-group)
//! Router
//!   ↓ (selects a processor via ProcessorRegistry + CircuitBreakerManager)
//! Redis Stream (frames:ready:<processor_id>)
//! ```

use axum::Router as AxumRouter;
use core_config::{Environment, FromEnv};
use database::redis::{connect_from_config_with_retry, RedisConfig};
use domain_frame_buffer::config::{
    BackpressureConfig, CircuitBreakerManagerConfig, OrchestratorConfig, PriorityQueueConfig,
    RegistryConfig,
};
use domain_frame_buffer::{
    backpressure::BackpressureController, breaker::CircuitBreakerManager, health,
    metrics,
    monitor::{run_backpressure_monitor, run_liveness_sweep},
    priority_queue::PriorityQueue, registry::ProcessorRegistry, HealthState,
    RedisStreamStore, Router, StreamStore,
};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

const APP_NAME: &str = env!("CARGO_PKG_NAME");
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

async fn start_health_server(health_state: HealthState, port: u16) -> Result<()> {
    let app: AxumRouter = health::full_router(health_state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health and admin server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the frame buffer orchestrator.
///
/// 1. Sets up structured logging and Prometheus metrics.
/// 2. Connects to Redis for the stream store.
/// 3. Wires up the registry, breaker manager, backpressure controller,
///    priority queue, and router.
/// 4. Starts the health/admin HTTP server and the router's consume loop,
///    both honoring a shared shutdown signal.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    metrics::init_metrics();

    info!(name = APP_NAME, version = APP_VERSION, "Starting frame buffer orchestrator");
    info!("Environment: {:?}", environment);

    let health_port: u16 = std::env::var("FRAME_BUFFER_HEALTH_PORT")
        .or_else(|_| std::env::var("HEALTH_PORT"))
        .unwrap_or_else(|_| "8083".to_string())
        .parse()
        .unwrap_or(8083);

    let orchestrator_config =
        OrchestratorConfig::from_env().wrap_err("Failed to load orchestrator configuration")?;
    let registry_config =
        RegistryConfig::from_env().wrap_err("Failed to load registry configuration")?;
    let backpressure_config =
        BackpressureConfig::from_env().wrap_err("Failed to load backpressure configuration")?;
    let breaker_config = CircuitBreakerManagerConfig::from_env()
        .wrap_err("Failed to load circuit breaker configuration")?;
    let queue_config = PriorityQueueConfig::default();

    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;

    info!("Connecting to Redis...");
    let redis = connect_from_config_with_retry(redis_config, None)
        .await
        .wrap_err("Failed to connect to Redis")?;
    info!("Connected to Redis successfully");

    let store: Arc<dyn StreamStore> = Arc::new(RedisStreamStore::new(Arc::new(redis)));
    let breakers = Arc::new(CircuitBreakerManager::new(breaker_config));
    let registry = Arc::new(ProcessorRegistry::new(registry_config.clone(), breakers.clone()));
    let backpressure = Arc::new(BackpressureController::new(&backpressure_config));
    let queue = Arc::new(PriorityQueue::new(queue_config));

    let consumer_id = format!("frame-buffer-orchestrator-{}", std::process::id());
    info!(
        ingress_stream = %orchestrator_config.ingress_stream,
        consumer_group = %orchestrator_config.consumer_group,
        %consumer_id,
        "Router configuration loaded"
    );

    let router = Arc::new(Router::new(
        store.clone(),
        registry.clone(),
        breakers.clone(),
        backpressure.clone(),
        queue.clone(),
        orchestrator_config.clone(),
        consumer_id,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    let health_state = HealthState {
        store: store.clone(),
        registry: registry.clone(),
        breakers: breakers.clone(),
        router: router.clone(),
        app_name: APP_NAME.to_string(),
        app_version: APP_VERSION.to_string(),
        ingress_stream: orchestrator_config.ingress_stream.clone(),
        dlq_stream: orchestrator_config.dlq_stream.clone(),
    };

    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    tokio::spawn(run_liveness_sweep(
        registry.clone(),
        registry_config,
        shutdown_rx.clone(),
    ));
    tokio::spawn(run_backpressure_monitor(
        registry,
        store,
        backpressure,
        breakers,
        backpressure_config,
        shutdown_rx.clone(),
    ));

    info!("Starting frame router...");
    router.run(shutdown_rx).await;

    info!("Frame buffer orchestrator stopped");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
