//! Common utilities and types shared across the broadcast controller crates.

#![warn(clippy::pedantic)]

/// Module for wall-clock abstraction (epoch milliseconds)
pub mod clock;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for JWT header utilities (size limits, key id extraction, iat checks)
pub mod jwt;
