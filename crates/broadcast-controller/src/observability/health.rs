//! Health endpoints for the Broadcast Controller.
//!
//! - `GET /health` - Liveness probe (is the process running?)
//! - `GET /ready` - Readiness probe (startup finished and the store answers)
//!
//! `/metrics` is merged onto the same listener in `main.rs`.

use crate::store::StateStore;
use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Upper bound on the store probe made by `/ready`.
const READINESS_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Liveness and readiness for Kubernetes probes.
pub struct HealthState {
    live: AtomicBool,
    ready: AtomicBool,
    store: Option<Arc<dyn StateStore>>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthState")
            .field("live", &self.is_live())
            .field("ready", &self.is_ready())
            .field("store_probe", &self.store.is_some())
            .finish()
    }
}

impl HealthState {
    /// Create a new health state (live=true, ready=false) with no store probe.
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            store: None,
        }
    }

    /// Also require the store to answer a ping for `/ready` to pass.
    #[must_use]
    pub fn with_store_probe(store: Arc<dyn StateStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new()
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Mark the service as not ready (e.g., during shutdown).
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn store_reachable(&self) -> bool {
        let Some(store) = &self.store else {
            return true;
        };
        match tokio::time::timeout(READINESS_PROBE_TIMEOUT, store.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(target: "bc.health", error = %e, "Readiness store probe failed");
                false
            }
            Err(_) => {
                warn!(target: "bc.health", "Readiness store probe timed out");
                false
            }
        }
    }
}

/// Create the health router with liveness and readiness endpoints.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_ready() && state.store_reachable().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
