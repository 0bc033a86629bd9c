//! Periodic `sessionStatus` push to every active session's speaker.
//!
//! Each tick covers at most `batch_size` sessions and remembers where it
//! stopped, so a large active set is covered over several ticks.

use crate::lifecycle::{LifecycleController, StatusPass};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Run one pass starting after `cursor`.
pub async fn run_status_updates(
    lifecycle: &LifecycleController,
    cursor: Option<&str>,
    batch_size: usize,
) -> StatusPass {
    match lifecycle.publish_status_updates(cursor, batch_size).await {
        Ok(pass) => {
            debug!(
                target: "bc.task.status",
                sent = pass.sent,
                "Status pass complete"
            );
            pass
        }
        Err(e) => {
            error!(
                target: "bc.task.status",
                error = %e,
                "Status pass failed"
            );
            StatusPass::default()
        }
    }
}

/// Start the status loop. Returns when `cancel_token` is cancelled.
#[instrument(skip_all, name = "bc.task.status")]
pub async fn start_status_updates(
    lifecycle: Arc<LifecycleController>,
    interval: Duration,
    batch_size: usize,
    cancel_token: CancellationToken,
) {
    info!(
        target: "bc.task.status",
        interval_seconds = interval.as_secs(),
        batch_size = batch_size,
        "Starting status update task"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cursor: Option<String> = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                cursor = run_status_updates(&lifecycle, cursor.as_deref(), batch_size).await.cursor;
            }
            () = cancel_token.cancelled() => {
                info!(
                    target: "bc.task.status",
                    "Status update task received shutdown signal, exiting"
                );
                break;
            }
        }
    }
}
