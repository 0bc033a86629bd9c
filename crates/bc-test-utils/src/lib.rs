//! # BC Test Utilities
//!
//! Shared test utilities for the Broadcast Controller.
//!
//! This crate provides:
//! - Deterministic Ed25519 keys and JWKS documents
//! - A builder for signed speaker identity tokens
//! - A mocked JWKS endpoint (`wiremock`)
//! - A recording [`ConnectionNotifier`](broadcast_controller::gateway::ConnectionNotifier)
//! - An in-process harness (in-memory store, manual clock)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bc_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let h = TestHarness::new();
//!     let speaker = h.speaker("spk-1", "alice");
//!     let session_id = h.create_session(&speaker, "en").await;
//!     h.join(&h.listener("lst-1"), &session_id, "es").await;
//!     assert_eq!(h.notifier.kinds_for("spk-1"), vec!["sessionStatus"]);
//! }
//! ```

pub mod crypto_fixtures;
pub mod harness;
pub mod jwks_mock;
pub mod recording_notifier;
pub mod token_builders;

pub use crypto_fixtures::*;
pub use harness::*;
pub use jwks_mock::*;
pub use recording_notifier::*;
pub use token_builders::*;
