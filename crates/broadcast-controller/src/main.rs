//! Broadcast Controller
//!
//! # Servers
//!
//! - WebSocket gateway for speakers and listeners (default: 0.0.0.0:8080)
//! - HTTP server for health and metrics endpoints (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect to Redis and wrap it with retry, timeout and circuit breaking
//! 4. Build the JWKS client and token verifier
//! 5. Start health server, then the gateway
//! 6. Spawn the idle sweep and periodic status tasks
//! 7. Wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use broadcast_controller::auth::{JwksClient, JwtAuthorizer};
use broadcast_controller::config::Config;
use broadcast_controller::gateway::{gateway_router, ChannelNotifier, GatewayDispatcher, GatewayState};
use broadcast_controller::lifecycle::LifecycleController;
use broadcast_controller::observability::{health_router, init_metrics_recorder, HealthState};
use broadcast_controller::resilience::{
    CircuitBreakerRegistry, IDENTITY_PROVIDER_CIRCUIT, STATE_STORE_CIRCUIT,
};
use broadcast_controller::store::{RedisStore, ResilientStore, StateStore};
use broadcast_controller::tasks::{start_status_updates, start_timeout_sweep};
use common::clock::{Clock, SystemClock};
use common::secret::ExposeSecret;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time allowed for in-flight work after the servers stop accepting.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "broadcast_controller=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Broadcast Controller");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        gateway_bind_address = %config.gateway_bind_address,
        health_bind_address = %config.health_bind_address,
        max_listeners_per_session = config.max_listeners_per_session,
        idle_timeout_seconds = config.idle_timeout_seconds,
        supported_languages = config.supported_languages.len(),
        "Configuration loaded successfully"
    );
    let config = Arc::new(config);

    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let breakers = CircuitBreakerRegistry::new(config.circuit_breaker.clone());

    info!("Connecting to Redis...");
    let redis = RedisStore::connect(config.redis_url.expose_secret())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to connect to Redis");
            e
        })?;
    let store: Arc<dyn StateStore> = Arc::new(ResilientStore::new(
        redis,
        config.retry.clone(),
        breakers.get_or_create(STATE_STORE_CIRCUIT),
        config.store_timeout(),
    ));
    info!("Redis connection established");

    let jwks_client = Arc::new(JwksClient::new(
        config.jwks_url.clone(),
        Duration::from_secs(config.jwks_cache_ttl_seconds),
        Duration::from_secs(config.jwks_min_refresh_interval_seconds),
        breakers.get_or_create(IDENTITY_PROVIDER_CIRCUIT),
    ));
    let verifier = Arc::new(JwtAuthorizer::from_config(
        &config,
        jwks_client,
        Arc::clone(&clock),
    ));

    let notifier = ChannelNotifier::new();
    let lifecycle = Arc::new(LifecycleController::new(
        Arc::clone(&config),
        Arc::clone(&clock),
        Arc::clone(&store),
        verifier,
        notifier.clone(),
    ));
    let dispatcher = Arc::new(GatewayDispatcher::new(Arc::clone(&lifecycle)));

    let shutdown_token = CancellationToken::new();
    let health_state = Arc::new(HealthState::with_store_probe(Arc::clone(&store)));

    // Health server (liveness, readiness, /metrics)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;
    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;
    let health_shutdown = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // WebSocket gateway
    let gateway_addr: SocketAddr = config.gateway_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.gateway_bind_address, "Invalid gateway bind address");
        format!("Invalid gateway bind address: {e}")
    })?;
    let gateway_app = gateway_router(GatewayState {
        dispatcher,
        notifier,
    })
    .layer(TraceLayer::new_for_http());

    let gateway_listener = tokio::net::TcpListener::bind(gateway_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %gateway_addr, "Failed to bind gateway");
            format!("Failed to bind gateway to {gateway_addr}: {e}")
        })?;
    let gateway_shutdown = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %gateway_addr, "Gateway starting");
        let server = axum::serve(
            gateway_listener,
            gateway_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            gateway_shutdown.cancelled().await;
            info!("Gateway shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Gateway failed");
        }
    });

    // Background tasks
    tokio::spawn(start_timeout_sweep(
        Arc::clone(&lifecycle),
        Duration::from_secs(config.sweep_interval_seconds),
        shutdown_token.child_token(),
    ));
    tokio::spawn(start_status_updates(
        Arc::clone(&lifecycle),
        Duration::from_secs(config.status_interval_seconds),
        config.status_batch_size,
        shutdown_token.child_token(),
    ));

    health_state.set_ready();
    info!("Broadcast Controller running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");
    health_state.set_not_ready();
    shutdown_token.cancel();
    tokio::time::sleep(SHUTDOWN_GRACE).await;

    info!("Broadcast Controller shutdown complete");
    Ok(())
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
