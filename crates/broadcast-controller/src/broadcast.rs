//! Broadcast state coordination and listener fan-out.
//!
//! A control change is one conditional write against the session (gated on
//! `isActive`), followed by a parallel best-effort send to every listener.
//! A failed send never aborts the others and never rolls the change back.

use crate::errors::BroadcastError;
use crate::gateway::notifier::{ConnectionNotifier, DeliveryError};
use crate::messages::{ServerMessage, SpeakerStatePayload};
use crate::observability::metrics;
use crate::repositories::{BroadcastPatch, ConnectionRepository, Session, SessionRepository, SessionWrite};
use common::clock::Clock;
use futures::future::join_all;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// A speaker-issued change to the broadcast state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlChange {
    Pause,
    Resume,
    Mute,
    Unmute,
    SetVolume(f64),
    Replace(SpeakerStatePayload),
}

impl ControlChange {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ControlChange::Pause => "pause",
            ControlChange::Resume => "resume",
            ControlChange::Mute => "mute",
            ControlChange::Unmute => "unmute",
            ControlChange::SetVolume(_) => "volume",
            ControlChange::Replace(_) => "state",
        }
    }

    /// Reject out-of-range input before anything is written.
    pub fn validate(&self) -> Result<(), BroadcastError> {
        let volume = match self {
            ControlChange::SetVolume(v) => Some(*v),
            ControlChange::Replace(state) => state.volume,
            _ => None,
        };
        match volume {
            Some(v) if !(0.0..=1.0).contains(&v) => Err(BroadcastError::InvalidParameter(
                "volumeLevel must be between 0.0 and 1.0".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn patch(&self) -> BroadcastPatch {
        match *self {
            ControlChange::Pause => BroadcastPatch {
                is_paused: Some(true),
                ..BroadcastPatch::default()
            },
            ControlChange::Resume => BroadcastPatch {
                is_paused: Some(false),
                ..BroadcastPatch::default()
            },
            ControlChange::Mute => BroadcastPatch {
                is_muted: Some(true),
                ..BroadcastPatch::default()
            },
            ControlChange::Unmute => BroadcastPatch {
                is_muted: Some(false),
                ..BroadcastPatch::default()
            },
            ControlChange::SetVolume(v) => BroadcastPatch {
                volume: Some(v),
                ..BroadcastPatch::default()
            },
            ControlChange::Replace(state) => BroadcastPatch {
                is_active: None,
                is_paused: state.is_paused,
                is_muted: state.is_muted,
                volume: state.volume,
            },
        }
    }

    /// Event announcing the change, built from the state after the write.
    fn event(&self, session: &Session, now_ms: i64) -> ServerMessage {
        let session_id = session.session_id.clone();
        let broadcast_state = session.broadcast_state;
        match self {
            ControlChange::Pause => ServerMessage::BroadcastPaused {
                session_id,
                broadcast_state,
                timestamp: now_ms,
            },
            ControlChange::Resume => ServerMessage::BroadcastResumed {
                session_id,
                broadcast_state,
                timestamp: now_ms,
            },
            ControlChange::Mute => ServerMessage::BroadcastMuted {
                session_id,
                broadcast_state,
                timestamp: now_ms,
            },
            ControlChange::Unmute => ServerMessage::BroadcastUnmuted {
                session_id,
                broadcast_state,
                timestamp: now_ms,
            },
            ControlChange::SetVolume(_) => ServerMessage::VolumeChanged {
                session_id,
                volume_level: broadcast_state.volume,
                timestamp: now_ms,
            },
            ControlChange::Replace(_) => ServerMessage::SpeakerStateChanged {
                session_id,
                state: broadcast_state,
                timestamp: now_ms,
            },
        }
    }
}

/// Outcome of sending one frame to many connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub failed: usize,
    /// Recipients whose connection no longer exists.
    pub gone: Vec<String>,
}

/// Send `message` to every recipient concurrently.
pub async fn fan_out(
    notifier: &dyn ConnectionNotifier,
    recipients: &[String],
    message: &ServerMessage,
) -> FanoutReport {
    let start = Instant::now();
    let results = join_all(recipients.iter().map(|id| async move {
        (id, notifier.send(id, message).await)
    }))
    .await;

    let mut report = FanoutReport::default();
    for (id, result) in results {
        match result {
            Ok(()) => report.delivered += 1,
            Err(DeliveryError::Gone) => {
                report.failed += 1;
                report.gone.push(id.clone());
            }
            Err(e) => {
                report.failed += 1;
                debug!(
                    target: "bc.broadcast",
                    connection_id = %id,
                    frame = message.kind(),
                    error = %e,
                    "Fan-out delivery failed"
                );
            }
        }
    }
    metrics::record_fanout(report.delivered, report.failed, start.elapsed());
    report
}

/// Result of a successful control change.
#[derive(Debug, Clone)]
pub struct ControlOutcome {
    pub session: Session,
    /// Frame acknowledged to the speaker and sent to each listener.
    pub event: ServerMessage,
    pub fanout: FanoutReport,
}

pub struct BroadcastCoordinator {
    sessions: Arc<SessionRepository>,
    connections: Arc<ConnectionRepository>,
    notifier: Arc<dyn ConnectionNotifier>,
    clock: Arc<dyn Clock>,
}

impl BroadcastCoordinator {
    pub fn new(
        sessions: Arc<SessionRepository>,
        connections: Arc<ConnectionRepository>,
        notifier: Arc<dyn ConnectionNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sessions,
            connections,
            notifier,
            clock,
        }
    }

    /// Apply `change` to an active session and notify its listeners.
    ///
    /// # Errors
    ///
    /// - `InvalidParameter` for an out-of-range volume (nothing is written)
    /// - `SessionNotFound` / `SessionInactive`
    /// - `Store` if the write fails
    #[instrument(skip_all, fields(session_id = %session_id, control = change.as_str()))]
    pub async fn apply_control(
        &self,
        session_id: &str,
        change: ControlChange,
    ) -> Result<ControlOutcome, BroadcastError> {
        change.validate()?;

        let now_ms = self.clock.now_ms();
        let session = match self
            .sessions
            .apply_broadcast_patch(session_id, change.patch(), now_ms)
            .await?
        {
            SessionWrite::Applied(session) => session,
            SessionWrite::Rejected => {
                return Err(BroadcastError::SessionInactive(session_id.to_string()))
            }
            SessionWrite::Missing => {
                return Err(BroadcastError::SessionNotFound(session_id.to_string()))
            }
        };
        metrics::record_broadcast_control(change.as_str());

        let event = change.event(&session, now_ms);
        let fanout = match self.connections.listeners(session_id).await {
            Ok(listeners) => {
                let ids: Vec<String> = listeners.into_iter().map(|c| c.connection_id).collect();
                fan_out(self.notifier.as_ref(), &ids, &event).await
            }
            Err(e) => {
                // The change is committed; listeners catch up on the next status frame.
                warn!(
                    target: "bc.broadcast",
                    error = %e,
                    "Could not enumerate listeners for fan-out"
                );
                FanoutReport::default()
            }
        };

        info!(
            target: "bc.broadcast",
            delivered = fanout.delivered,
            failed = fanout.failed,
            "Broadcast control applied"
        );
        Ok(ControlOutcome {
            session,
            event,
            fanout,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::gateway::notifier::ChannelNotifier;
    use crate::repositories::{BroadcastState, Connection, Role};
    use crate::repositories::sessions::session_expiry;
    use crate::store::{MemoryStore, StateStore};
    use common::clock::ManualClock;

    const T0_MS: i64 = 1_700_000_000_000;
    const SESSION: &str = "calm-otter-001";

    struct Fixture {
        coordinator: BroadcastCoordinator,
        sessions: Arc<SessionRepository>,
        connections: Arc<ConnectionRepository>,
        notifier: Arc<ChannelNotifier>,
        clock: ManualClock,
    }

    async fn fixture() -> Fixture {
        let clock = ManualClock::new(T0_MS);
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let sessions = Arc::new(SessionRepository::new(Arc::clone(&store)));
        let connections = Arc::new(ConnectionRepository::new(Arc::clone(&store), 3 * 3600));
        let notifier = ChannelNotifier::new();
        sessions
            .create(&Session {
                session_id: SESSION.to_string(),
                speaker_id: "speaker-1".to_string(),
                source_language: "en".to_string(),
                quality_tier: "standard".to_string(),
                is_active: true,
                listener_count: 0,
                broadcast_state: BroadcastState::initial(T0_MS),
                speaker_connection_id: "s1".to_string(),
                created_at: T0_MS,
                expires_at: session_expiry(T0_MS, 3600),
            })
            .await
            .unwrap();
        let coordinator = BroadcastCoordinator::new(
            Arc::clone(&sessions),
            Arc::clone(&connections),
            notifier.clone(),
            Arc::new(clock.clone()),
        );
        Fixture {
            coordinator,
            sessions,
            connections,
            notifier,
            clock,
        }
    }

    async fn add_listener(f: &Fixture, id: &str) {
        f.connections
            .insert(&Connection {
                connection_id: id.to_string(),
                session_id: SESSION.to_string(),
                role: Role::Listener,
                target_language: Some("es".to_string()),
                user_id: None,
                client_ip: None,
                connected_at: T0_MS,
                last_activity_at: T0_MS,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pause_then_mute_reaches_every_listener() {
        let f = fixture().await;
        add_listener(&f, "l1").await;
        add_listener(&f, "l2").await;
        let mut rx1 = f.notifier.register("l1").await;
        let mut rx2 = f.notifier.register("l2").await;

        f.coordinator.apply_control(SESSION, ControlChange::Pause).await.unwrap();
        f.clock.advance_ms(10);
        let outcome = f.coordinator.apply_control(SESSION, ControlChange::Mute).await.unwrap();

        assert_eq!(outcome.fanout.delivered, 2);
        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(rx.recv().await.unwrap().kind(), "broadcastPaused");
            assert_eq!(rx.recv().await.unwrap().kind(), "broadcastMuted");
        }
        let state = f.sessions.get(SESSION).await.unwrap().unwrap().broadcast_state;
        assert!(state.is_paused);
        assert!(state.is_muted);
        assert_eq!(state.last_state_change, T0_MS + 10);
    }

    #[tokio::test]
    async fn test_out_of_range_volume_is_rejected_before_write() {
        let f = fixture().await;

        for v in [-0.01, 1.01, f64::NAN] {
            let err = f
                .coordinator
                .apply_control(SESSION, ControlChange::SetVolume(v))
                .await
                .unwrap_err();
            assert_eq!(err.error_code(), "INVALID_PARAMETER");
        }
        let state = f.sessions.get(SESSION).await.unwrap().unwrap().broadcast_state;
        assert!((state.volume - 1.0).abs() < f64::EPSILON);
        assert_eq!(state.last_state_change, T0_MS);
    }

    #[tokio::test]
    async fn test_volume_in_range_is_stored_exactly() {
        let f = fixture().await;

        for v in [0.0, 0.33, 1.0] {
            let outcome = f
                .coordinator
                .apply_control(SESSION, ControlChange::SetVolume(v))
                .await
                .unwrap();
            assert_eq!(outcome.session.broadcast_state.volume, v);
            assert!(matches!(outcome.event, ServerMessage::VolumeChanged { volume_level, .. } if volume_level == v));
        }
    }

    #[tokio::test]
    async fn test_gone_listener_does_not_block_others() {
        let f = fixture().await;
        add_listener(&f, "l1").await;
        add_listener(&f, "l2").await;
        let mut rx1 = f.notifier.register("l1").await;
        drop(f.notifier.register("l2").await);

        let outcome = f.coordinator.apply_control(SESSION, ControlChange::Pause).await.unwrap();

        assert_eq!(outcome.fanout.delivered, 1);
        assert_eq!(outcome.fanout.gone, vec!["l2".to_string()]);
        assert_eq!(rx1.recv().await.unwrap().kind(), "broadcastPaused");
        assert!(f.sessions.get(SESSION).await.unwrap().unwrap().broadcast_state.is_paused);
    }

    #[tokio::test]
    async fn test_inactive_and_missing_sessions() {
        let f = fixture().await;
        f.sessions.end(SESSION, "s1", T0_MS).await.unwrap();

        let err = f.coordinator.apply_control(SESSION, ControlChange::Pause).await.unwrap_err();
        assert_eq!(err.error_code(), "SESSION_INACTIVE");

        let err = f
            .coordinator
            .apply_control("nope-none-000", ControlChange::Pause)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "SESSION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_state_replace_touches_only_given_fields() {
        let f = fixture().await;
        f.coordinator.apply_control(SESSION, ControlChange::Mute).await.unwrap();

        let outcome = f
            .coordinator
            .apply_control(
                SESSION,
                ControlChange::Replace(SpeakerStatePayload {
                    is_paused: Some(true),
                    is_muted: None,
                    volume: Some(0.5),
                }),
            )
            .await
            .unwrap();

        let state = outcome.session.broadcast_state;
        assert!(state.is_paused);
        assert!(state.is_muted);
        assert_eq!(state.volume, 0.5);
        assert_eq!(outcome.event.kind(), "speakerStateChanged");
    }
}
