//! Broadcast Controller Library
//!
//! Control plane for one-to-many live audio broadcasts. A speaker opens a
//! session; listeners join it by id and pick a target language. The
//! controller is responsible for:
//!
//! - Speaker/listener connection lifecycle (connect, heartbeat, refresh,
//!   disconnect, idle timeout)
//! - Shared session state in Redis with conditional writes, so any number
//!   of stateless instances can serve the same session
//! - Broadcast controls (pause, mute, volume) fanned out to listeners
//! - Per-client sliding-window rate limits
//! - Identity token verification for speakers (JWKS)
//!
//! # Architecture
//!
//! ```text
//! WebSocket ──► GatewayDispatcher ──► LifecycleController ──► SessionRepository ─┐
//!                      │                      │               ConnectionRepository ─┤
//!                      ▼                      ▼                                     ▼
//!             BroadcastCoordinator    ConnectionNotifier              ResilientStore<RedisStore>
//! ```
//!
//! # Modules
//!
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error taxonomy and client-facing codes
//! - [`store`] - State store abstraction, Redis and in-memory backends
//! - [`lifecycle`] - Connection and session state machine
//! - [`gateway`] - Event dispatch and the WebSocket front end
//! - [`tasks`] - Idle sweep and periodic status background tasks

pub mod audio;
pub mod auth;
pub mod broadcast;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod lifecycle;
pub mod messages;
pub mod observability;
pub mod rate_limit;
pub mod repositories;
pub mod resilience;
pub mod session_id;
pub mod store;
pub mod tasks;
