//! Background tasks.
//!
//! - `timeout_sweep` - disconnects idle connections
//! - `status_updates` - periodic `sessionStatus` to speakers

pub mod status_updates;
pub mod timeout_sweep;

pub use status_updates::{run_status_updates, start_status_updates};
pub use timeout_sweep::{run_timeout_sweep, start_timeout_sweep};
