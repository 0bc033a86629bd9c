//! Idle connection sweep.
//!
//! Every interval, disconnects connections whose `lastActivityAt` is older
//! than the idle timeout. Work per tick is bounded by the sweep batch
//! settings; leftovers are picked up on the next tick.

use crate::lifecycle::LifecycleController;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

/// Run one sweep. Returns the number of connections removed.
pub async fn run_timeout_sweep(lifecycle: &LifecycleController) -> usize {
    match lifecycle.sweep_idle().await {
        Ok(removed) => removed,
        Err(e) => {
            error!(
                target: "bc.task.timeout_sweep",
                error = %e,
                "Idle sweep failed"
            );
            0
        }
    }
}

/// Start the sweep loop. Returns when `cancel_token` is cancelled.
#[instrument(skip_all, name = "bc.task.timeout_sweep")]
pub async fn start_timeout_sweep(
    lifecycle: Arc<LifecycleController>,
    interval: Duration,
    cancel_token: CancellationToken,
) {
    info!(
        target: "bc.task.timeout_sweep",
        interval_seconds = interval.as_secs(),
        "Starting timeout sweep task"
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_timeout_sweep(&lifecycle).await;
            }
            () = cancel_token.cancelled() => {
                info!(
                    target: "bc.task.timeout_sweep",
                    "Timeout sweep received shutdown signal, exiting"
                );
                break;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::auth::{AuthorizationError, IdentityVerifier, VerifiedIdentity};
    use crate::config::test_config;
    use crate::gateway::notifier::ChannelNotifier;
    use crate::lifecycle::ConnectRequest;
    use crate::repositories::Role;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use common::clock::ManualClock;

    struct NoVerifier;

    #[async_trait]
    impl IdentityVerifier for NoVerifier {
        async fn verify(&self, _token: &str) -> Result<VerifiedIdentity, AuthorizationError> {
            Ok(VerifiedIdentity {
                user_id: "speaker-1".to_string(),
                email: None,
                name: None,
            })
        }
    }

    fn lifecycle(clock: &ManualClock) -> (Arc<LifecycleController>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let controller = LifecycleController::new(
            Arc::new(test_config()),
            Arc::new(clock.clone()),
            store.clone(),
            Arc::new(NoVerifier),
            ChannelNotifier::new(),
        );
        (Arc::new(controller), store)
    }

    #[tokio::test]
    async fn test_run_removes_idle_speaker() {
        let clock = ManualClock::new(1_700_000_000_000);
        let (lifecycle, _store) = lifecycle(&clock);
        lifecycle
            .connect(ConnectRequest {
                connection_id: "s1".to_string(),
                role: Some(Role::Speaker),
                source_language: Some("en".to_string()),
                quality_tier: Some("standard".to_string()),
                token: Some("t".to_string()),
                ..ConnectRequest::default()
            })
            .await
            .unwrap();

        assert_eq!(run_timeout_sweep(&lifecycle).await, 0);
        clock.advance_ms(lifecycle.config().idle_timeout_ms() + 1);
        assert_eq!(run_timeout_sweep(&lifecycle).await, 1);
    }

    #[tokio::test]
    async fn test_run_survives_store_outage() {
        let clock = ManualClock::new(1_700_000_000_000);
        let (lifecycle, store) = lifecycle(&clock);
        store.set_unavailable(true);

        assert_eq!(run_timeout_sweep(&lifecycle).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_stops_on_cancel() {
        let clock = ManualClock::new(1_700_000_000_000);
        let (lifecycle, _store) = lifecycle(&clock);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(start_timeout_sweep(
            lifecycle,
            Duration::from_secs(60),
            cancel.clone(),
        ));

        tokio::time::advance(Duration::from_secs(180)).await;
        cancel.cancel();

        handle.await.unwrap();
    }
}
