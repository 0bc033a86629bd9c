//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types used across the broadcast controller.
//! `SecretString` and `SecretBox<T>` render as `[REDACTED]` in `Debug`
//! output and zeroize on drop, so structs that derive `Debug` stay safe
//! to log.
//!
//! Config values that may embed credentials (the state store URL) are held
//! as `SecretString`.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct ConnectParams {
//!     role: String,
//!     token: Option<SecretString>,
//! }
//!
//! let params = ConnectParams {
//!     role: "speaker".to_string(),
//!     token: Some(SecretString::from("eyJhbGciOi...")),
//! };
//!
//! assert!(!format!("{params:?}").contains("eyJhbGciOi"));
//! assert_eq!(
//!     params.token.as_ref().map(|t| t.expose_secret().len()),
//!     Some(13)
//! );
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
