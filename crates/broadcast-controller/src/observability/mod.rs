//! Observability for the Broadcast Controller.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields.
//! Identity tokens and Redis credentials are never logged.
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `bc_connects_total` | Counter | `role`, `outcome` | Connect attempts |
//! | `bc_disconnects_total` | Counter | `role`, `reason` | Completed disconnects |
//! | `bc_heartbeats_total` | Counter | `outcome` | Heartbeat responses |
//! | `bc_rate_limit_decisions_total` | Counter | `operation`, `decision` | Limiter decisions |
//! | `bc_store_operation_duration_seconds` | Histogram | `operation` | Store latency incl. retries |
//! | `bc_circuit_transitions_total` | Counter | `circuit`, `to` | Breaker state changes |
//! | `bc_fanout_deliveries_total` | Counter | `result` | Listener notifications |
//! | `bc_timeout_sweep_removed_total` | Counter | none | Idle connections reaped |
//! | `bc_jwks_refreshes_total` | Counter | `status` | Signing key fetches |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
