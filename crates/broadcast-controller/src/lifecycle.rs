//! Connection lifecycle: connect, heartbeat, refresh, disconnect, idle sweep.
//!
//! ```text
//! Connecting ──► Active ──► (RefreshPending) ──► Active(new conn) ──► Disconnected
//!     │            │
//!     ▼            ▼
//!  Rejected     TimedOut ──► Disconnected
//! ```
//!
//! The controller holds no per-connection state of its own. Every shared
//! mutation (listener count, speaker pointer, active flag) is a single
//! conditional store call, so concurrent invocations for the same session
//! or connection stay consistent without in-process locking.
//!
//! # Refresh
//!
//! A refresh creates a brand-new connection row; the old row lives on until
//! its own disconnect or idle timeout. For listeners the count is bumped
//! without the cap and is briefly one too high until the old connection
//! leaves. For speakers the session's `speakerConnectionId` moves to the
//! new connection, so the old connection leaving does not end the session.

use crate::audio::{AudioChunk, AudioSink, AudioVerdict, NullAudioSink};
use crate::auth::{AuthorizationError, IdentityVerifier, VerifiedIdentity};
use crate::broadcast::fan_out;
use crate::config::Config;
use crate::errors::BroadcastError;
use crate::gateway::notifier::{ConnectionNotifier, DeliveryError};
use crate::messages::{ServerMessage, SessionStatusReport, UpdateReason};
use crate::observability::metrics;
use crate::rate_limit::{Operation, RateLimiter};
use crate::repositories::sessions::session_expiry;
use crate::repositories::{
    language_distribution, BroadcastState, Connection, ConnectionRepository, ListenerCountChange,
    Role, Session, SessionRepository, SessionWrite,
};
use crate::resilience::degradation::with_fallback;
use crate::session_id::{self, MAX_SESSION_ID_ATTEMPTS};
use crate::store::StateStore;
use bytes::Bytes;
use common::clock::Clock;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Rate limit identifier for clients without a known address.
const UNKNOWN_CLIENT: &str = "unknown";

/// Produces candidate session ids.
pub type SessionIdSource = Arc<dyn Fn() -> String + Send + Sync>;

fn random_session_ids() -> SessionIdSource {
    Arc::new(|| session_id::generate(&mut rand::thread_rng()))
}

/// Parameters of a connect.
#[derive(Clone, Default)]
pub struct ConnectRequest {
    pub connection_id: String,
    pub role: Option<Role>,
    pub session_id: Option<String>,
    pub target_language: Option<String>,
    pub source_language: Option<String>,
    pub quality_tier: Option<String>,
    /// Bearer token; speakers only.
    pub token: Option<String>,
    pub client_ip: Option<String>,
}

impl fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("connection_id", &self.connection_id)
            .field("role", &self.role)
            .field("session_id", &self.session_id)
            .field("target_language", &self.target_language)
            .field("source_language", &self.source_language)
            .field("quality_tier", &self.quality_tier)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("client_ip", &self.client_ip)
            .finish()
    }
}

/// Parameters of a refresh, issued on the new connection.
#[derive(Clone)]
pub struct RefreshRequest {
    pub connection_id: String,
    pub session_id: String,
    pub role: Role,
    pub target_language: Option<String>,
    pub token: Option<String>,
    pub client_ip: Option<String>,
    pub previous_connection_id: Option<String>,
}

impl fmt::Debug for RefreshRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshRequest")
            .field("connection_id", &self.connection_id)
            .field("session_id", &self.session_id)
            .field("role", &self.role)
            .field("target_language", &self.target_language)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("previous_connection_id", &self.previous_connection_id)
            .finish()
    }
}

/// A connection that has been admitted into a session.
#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    pub session: Session,
    pub connection: Connection,
    /// Whether this connect created the session.
    pub created: bool,
}

impl ConnectOutcome {
    /// Frame confirming the connect to the client.
    pub fn response(&self, now_ms: i64) -> ServerMessage {
        if self.created {
            ServerMessage::SessionCreated {
                session_id: self.session.session_id.clone(),
                connection_id: self.connection.connection_id.clone(),
                source_language: self.session.source_language.clone(),
                quality_tier: self.session.quality_tier.clone(),
                broadcast_state: self.session.broadcast_state,
                timestamp: now_ms,
            }
        } else {
            ServerMessage::SessionJoined {
                session_id: self.session.session_id.clone(),
                connection_id: self.connection.connection_id.clone(),
                role: self.connection.role,
                target_language: self.connection.target_language.clone(),
                source_language: self.session.source_language.clone(),
                listener_count: self.session.listener_count,
                broadcast_state: self.session.broadcast_state,
                timestamp: now_ms,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client closed its channel.
    Client,
    /// Idle past the timeout.
    Timeout,
    /// A delivery found the channel already gone.
    Gone,
    /// Removed because the speaker ended the session.
    SessionEnded,
}

impl DisconnectReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::Client => "client",
            DisconnectReason::Timeout => "timeout",
            DisconnectReason::Gone => "gone",
            DisconnectReason::SessionEnded => "session_ended",
        }
    }
}

/// Result of pushing a status frame to a session's speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusDelivery {
    Sent,
    NotDelivered,
    /// Session missing or inactive.
    SessionClosed,
}

/// One pass of the periodic status publisher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusPass {
    pub sent: usize,
    /// Resume point for the next pass; `None` when the pass reached the end.
    pub cursor: Option<String>,
}

pub struct LifecycleController {
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    sessions: Arc<SessionRepository>,
    connections: Arc<ConnectionRepository>,
    rate_limiter: Arc<RateLimiter>,
    verifier: Arc<dyn IdentityVerifier>,
    notifier: Arc<dyn ConnectionNotifier>,
    audio: Arc<dyn AudioSink>,
    session_ids: SessionIdSource,
}

impl LifecycleController {
    pub fn new(
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
        store: Arc<dyn StateStore>,
        verifier: Arc<dyn IdentityVerifier>,
        notifier: Arc<dyn ConnectionNotifier>,
    ) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.rate_limits.clone(),
        ));
        let connections = Arc::new(ConnectionRepository::new(
            Arc::clone(&store),
            config.connection_ttl_seconds(),
        ));
        Self {
            sessions: Arc::new(SessionRepository::new(store)),
            connections,
            rate_limiter,
            verifier,
            notifier,
            audio: Arc::new(NullAudioSink),
            session_ids: random_session_ids(),
            config,
            clock,
        }
    }

    #[must_use]
    pub fn with_audio_sink(mut self, sink: Arc<dyn AudioSink>) -> Self {
        self.audio = sink;
        self
    }

    #[must_use]
    pub fn with_session_ids(mut self, source: SessionIdSource) -> Self {
        self.session_ids = source;
        self
    }

    pub fn sessions(&self) -> Arc<SessionRepository> {
        Arc::clone(&self.sessions)
    }

    pub fn connections(&self) -> Arc<ConnectionRepository> {
        Arc::clone(&self.connections)
    }

    pub fn notifier(&self) -> Arc<dyn ConnectionNotifier> {
        Arc::clone(&self.notifier)
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Count a new channel against the per-address connection limit.
    pub async fn admit(&self, client_ip: Option<&str>) -> Result<(), BroadcastError> {
        self.rate_limiter
            .check_and_consume(Operation::ConnectionAttempt, client_ip.unwrap_or(UNKNOWN_CLIENT))
            .await
    }

    /// Admit a connection into a session.
    ///
    /// A speaker without a session id creates one; a speaker with a session
    /// id re-attaches to a session it owns; a listener joins an active
    /// session.
    ///
    /// # Errors
    ///
    /// - `InvalidParameter`: missing role or session id, unsupported language or tier
    /// - `Unauthorized`: bad token, or speaker identity does not own the session
    /// - `SessionNotFound` / `SessionInactive`
    /// - `CapacityExceeded`: the session is at its listener cap
    /// - `RateLimitExceeded`, `ServiceUnavailable`, `Store`
    #[instrument(skip_all, fields(connection_id = %req.connection_id, role = ?req.role))]
    pub async fn connect(&self, req: ConnectRequest) -> Result<ConnectOutcome, BroadcastError> {
        let Some(role) = req.role else {
            return Err(BroadcastError::InvalidParameter(
                "role must be speaker or listener".to_string(),
            ));
        };

        let result = async {
            self.ensure_unbound(&req.connection_id).await?;
            match (role, req.session_id.as_deref()) {
                (Role::Speaker, None) => self.create_session(&req).await,
                (Role::Speaker, Some(session_id)) => self
                    .attach_speaker(
                        &req.connection_id,
                        session_id,
                        req.token.as_deref(),
                        req.client_ip.as_deref(),
                    )
                    .await
                    .map(|(session, connection)| ConnectOutcome {
                        session,
                        connection,
                        created: false,
                    }),
                (Role::Listener, Some(session_id)) => self.join_as_listener(&req, session_id).await,
                (Role::Listener, None) => Err(BroadcastError::InvalidParameter(
                    "sessionId is required".to_string(),
                )),
            }
        }
        .await;

        match &result {
            Ok(outcome) => {
                metrics::record_connect(role.as_str(), "success");
                info!(
                    target: "bc.lifecycle",
                    session_id = %outcome.session.session_id,
                    created = outcome.created,
                    "Connection admitted"
                );
            }
            Err(e) => {
                metrics::record_connect(role.as_str(), e.category().as_str());
                log_rejection("connect", e);
            }
        }
        result
    }

    async fn create_session(&self, req: &ConnectRequest) -> Result<ConnectOutcome, BroadcastError> {
        let source_language = req.source_language.as_deref().unwrap_or_default();
        if !self.config.is_supported_language(source_language) {
            return Err(BroadcastError::InvalidParameter(
                "sourceLanguage is not supported".to_string(),
            ));
        }
        let quality_tier = req.quality_tier.as_deref().unwrap_or_default();
        if !self.config.is_quality_tier(quality_tier) {
            return Err(BroadcastError::InvalidParameter(
                "qualityTier is not supported".to_string(),
            ));
        }

        let identity = self.authenticate(req.token.as_deref()).await?;
        self.rate_limiter
            .check_and_consume(Operation::SessionCreate, &identity.user_id)
            .await?;

        let now_ms = self.clock.now_ms();
        for attempt in 1..=MAX_SESSION_ID_ATTEMPTS {
            let session = Session {
                session_id: (self.session_ids)(),
                speaker_id: identity.user_id.clone(),
                source_language: source_language.to_string(),
                quality_tier: quality_tier.to_string(),
                is_active: true,
                listener_count: 0,
                broadcast_state: BroadcastState::initial(now_ms),
                speaker_connection_id: req.connection_id.clone(),
                created_at: now_ms,
                expires_at: session_expiry(now_ms, self.config.session_ttl_seconds_i64()),
            };
            if !self.sessions.create(&session).await? {
                debug!(
                    target: "bc.lifecycle",
                    session_id = %session.session_id,
                    attempt = attempt,
                    "Session id collision, regenerating"
                );
                continue;
            }

            let connection = Connection {
                connection_id: req.connection_id.clone(),
                session_id: session.session_id.clone(),
                role: Role::Speaker,
                target_language: None,
                user_id: Some(identity.user_id.clone()),
                client_ip: req.client_ip.clone(),
                connected_at: now_ms,
                last_activity_at: now_ms,
            };
            let failure = match self.connections.insert(&connection).await {
                Ok(true) => {
                    return Ok(ConnectOutcome {
                        session,
                        connection,
                        created: true,
                    })
                }
                Ok(false) => already_joined(),
                Err(e) => e.into(),
            };
            // A session whose speaker row is missing could never end.
            if let Err(end_err) = self
                .sessions
                .end(&session.session_id, &req.connection_id, now_ms)
                .await
            {
                warn!(
                    target: "bc.lifecycle",
                    session_id = %session.session_id,
                    error = %end_err,
                    "Failed to deactivate session after connection insert failure"
                );
            }
            return Err(failure);
        }

        error!(
            target: "bc.lifecycle",
            attempts = MAX_SESSION_ID_ATTEMPTS,
            "Could not find a free session id"
        );
        Err(BroadcastError::Internal(
            "session id generation exhausted".to_string(),
        ))
    }

    /// Attach a speaker connection to a session it owns and point the
    /// session at it. Shared by speaker re-join and speaker refresh.
    async fn attach_speaker(
        &self,
        connection_id: &str,
        session_id: &str,
        token: Option<&str>,
        client_ip: Option<&str>,
    ) -> Result<(Session, Connection), BroadcastError> {
        let identity = self.authenticate(token).await?;
        let session = self.active_session(session_id).await?;
        if session.speaker_id != identity.user_id {
            warn!(
                target: "bc.lifecycle",
                session_id = %session_id,
                "Speaker identity does not own session"
            );
            return Err(AuthorizationError::IdentityMismatch.into());
        }

        let now_ms = self.clock.now_ms();
        let connection = Connection {
            connection_id: connection_id.to_string(),
            session_id: session_id.to_string(),
            role: Role::Speaker,
            target_language: None,
            user_id: Some(identity.user_id),
            client_ip: client_ip.map(ToString::to_string),
            connected_at: now_ms,
            last_activity_at: now_ms,
        };
        // Row first: the speaker pointer must never name a connection without one.
        if !self.connections.insert(&connection).await? {
            return Err(already_joined());
        }

        let swapped = self
            .sessions
            .set_speaker_connection(session_id, connection_id)
            .await;
        let failure = match swapped {
            Ok(SessionWrite::Applied(session)) => return Ok((session, connection)),
            Ok(SessionWrite::Rejected) => BroadcastError::SessionInactive(session_id.to_string()),
            Ok(SessionWrite::Missing) => BroadcastError::SessionNotFound(session_id.to_string()),
            Err(e) => e.into(),
        };
        self.discard_row(connection_id).await;
        Err(failure)
    }

    async fn join_as_listener(
        &self,
        req: &ConnectRequest,
        session_id: &str,
    ) -> Result<ConnectOutcome, BroadcastError> {
        let language = self.target_language(req.target_language.as_deref())?;
        self.rate_limiter
            .check_and_consume(
                Operation::ListenerJoin,
                req.client_ip.as_deref().unwrap_or(UNKNOWN_CLIENT),
            )
            .await?;

        let (session, connection) = self
            .attach_listener(
                &req.connection_id,
                session_id,
                language,
                req.client_ip.as_deref(),
                true,
            )
            .await?;
        self.push_status(session_id, UpdateReason::ListenerJoined)
            .await;
        Ok(ConnectOutcome {
            session,
            connection,
            created: false,
        })
    }

    /// Count a listener in and insert its row, undoing the count if the
    /// insert fails.
    async fn attach_listener(
        &self,
        connection_id: &str,
        session_id: &str,
        language: &str,
        client_ip: Option<&str>,
        capped: bool,
    ) -> Result<(Session, Connection), BroadcastError> {
        let session = self.active_session(session_id).await?;
        let change = if capped {
            self.sessions
                .add_listener(session_id, self.config.max_listeners_per_session)
                .await?
        } else {
            self.sessions.add_listener_uncapped(session_id).await?
        };
        let listener_count = match change {
            ListenerCountChange::Applied(count) => count,
            ListenerCountChange::AtLimit(_) => {
                return Err(BroadcastError::CapacityExceeded {
                    session_id: session_id.to_string(),
                    max_listeners: self.config.max_listeners_per_session,
                })
            }
            ListenerCountChange::Inactive => {
                return Err(BroadcastError::SessionInactive(session_id.to_string()))
            }
            ListenerCountChange::Missing => {
                return Err(BroadcastError::SessionNotFound(session_id.to_string()))
            }
        };

        let now_ms = self.clock.now_ms();
        let connection = Connection {
            connection_id: connection_id.to_string(),
            session_id: session_id.to_string(),
            role: Role::Listener,
            target_language: Some(language.to_string()),
            user_id: None,
            client_ip: client_ip.map(ToString::to_string),
            connected_at: now_ms,
            last_activity_at: now_ms,
        };
        match self.connections.insert(&connection).await {
            Ok(true) => {}
            Ok(false) => {
                self.release_listener_slot(session_id).await;
                return Err(already_joined());
            }
            Err(e) => {
                self.release_listener_slot(session_id).await;
                return Err(e.into());
            }
        }

        Ok((
            Session {
                listener_count,
                ..session
            },
            connection,
        ))
    }

    /// Refresh `lastActivityAt` and tell the client how close it is to the
    /// platform's hard duration cap.
    ///
    /// The acknowledgment is always the first frame, even when the
    /// connection row cannot be read.
    #[instrument(skip_all, fields(connection_id = %connection_id))]
    pub async fn heartbeat(&self, connection_id: &str) -> Result<Vec<ServerMessage>, BroadcastError> {
        self.rate_limiter
            .check_and_consume(Operation::Heartbeat, connection_id)
            .await?;

        let now_ms = self.clock.now_ms();
        let mut frames = vec![ServerMessage::HeartbeatAck { timestamp: now_ms }];

        let touched = with_fallback(
            "state-store",
            self.connections.touch(connection_id, now_ms),
            None,
        )
        .await;
        let degraded = touched.is_fallback();
        let Some(connection) = touched.into_inner() else {
            metrics::record_heartbeat(if degraded { "degraded" } else { "unknown_connection" });
            return Ok(frames);
        };

        let age_minutes = connection.age_minutes(now_ms);
        let mut outcome = "ack";
        if age_minutes >= self.config.refresh_threshold_minutes {
            frames.push(ServerMessage::ConnectionRefreshRequired {
                session_id: connection.session_id.clone(),
                role: connection.role,
                connection_age_minutes: age_minutes,
                timestamp: now_ms,
            });
            outcome = "refresh_required";
        }
        if age_minutes >= self.config.warning_threshold_minutes {
            frames.push(ServerMessage::ConnectionWarning {
                remaining_minutes: (self.config.max_connection_duration_minutes - age_minutes)
                    .max(0),
                timestamp: now_ms,
            });
            outcome = "warning";
        }
        if outcome != "ack" {
            info!(
                target: "bc.lifecycle",
                session_id = %connection.session_id,
                age_minutes = age_minutes,
                "Connection approaching duration cap"
            );
        }
        metrics::record_heartbeat(outcome);
        Ok(frames)
    }

    /// Move a connection onto a new channel.
    ///
    /// # Errors
    ///
    /// As for [`connect`](Self::connect), minus the listener cap.
    #[instrument(
        skip_all,
        fields(
            connection_id = %req.connection_id,
            session_id = %req.session_id,
            role = %req.role,
            previous_connection_id = ?req.previous_connection_id
        )
    )]
    pub async fn refresh(&self, req: RefreshRequest) -> Result<ServerMessage, BroadcastError> {
        let result = async {
            self.ensure_unbound(&req.connection_id).await?;
            match req.role {
                Role::Speaker => {
                    self.attach_speaker(
                        &req.connection_id,
                        &req.session_id,
                        req.token.as_deref(),
                        req.client_ip.as_deref(),
                    )
                    .await
                }
                Role::Listener => {
                    let language = self.target_language(req.target_language.as_deref())?;
                    self.attach_listener(
                        &req.connection_id,
                        &req.session_id,
                        language,
                        req.client_ip.as_deref(),
                        false,
                    )
                    .await
                }
            }
        }
        .await;

        match result {
            Ok((session, connection)) => {
                metrics::record_refresh(req.role.as_str(), "success");
                info!(target: "bc.lifecycle", "Connection refreshed");
                Ok(ServerMessage::ConnectionRefreshComplete {
                    session_id: session.session_id,
                    connection_id: connection.connection_id,
                    role: connection.role,
                    broadcast_state: session.broadcast_state,
                    timestamp: self.clock.now_ms(),
                })
            }
            Err(e) => {
                metrics::record_refresh(req.role.as_str(), e.category().as_str());
                log_rejection("refresh", &e);
                Err(e)
            }
        }
    }

    /// Remove a connection. Safe to call any number of times; only the call
    /// that actually deletes the row performs the follow-up.
    #[instrument(skip_all, fields(connection_id = %connection_id, reason = reason.as_str()))]
    pub async fn disconnect(
        &self,
        connection_id: &str,
        reason: DisconnectReason,
    ) -> Result<(), BroadcastError> {
        let Some(connection) = self.connections.remove(connection_id).await? else {
            debug!(target: "bc.lifecycle", "Connection already removed");
            return Ok(());
        };
        self.after_removal(connection, reason).await;
        Ok(())
    }

    async fn after_removal(&self, connection: Connection, reason: DisconnectReason) {
        metrics::record_disconnect(connection.role.as_str(), reason.as_str());
        match connection.role {
            Role::Listener => {
                match self.sessions.remove_listener(&connection.session_id).await {
                    Ok(ListenerCountChange::Applied(count)) => {
                        debug!(
                            target: "bc.lifecycle",
                            session_id = %connection.session_id,
                            listener_count = count,
                            "Listener left"
                        );
                        self.push_status(&connection.session_id, UpdateReason::ListenerLeft)
                            .await;
                    }
                    Ok(other) => {
                        debug!(
                            target: "bc.lifecycle",
                            session_id = %connection.session_id,
                            outcome = ?other,
                            "Listener count unchanged"
                        );
                    }
                    Err(e) => {
                        warn!(
                            target: "bc.lifecycle",
                            session_id = %connection.session_id,
                            error = %e,
                            "Failed to decrement listener count"
                        );
                    }
                }
            }
            Role::Speaker => self.end_session(&connection, reason).await,
        }
    }

    /// End the session if `speaker` is still its current speaker connection,
    /// then tell every listener and remove their rows.
    async fn end_session(&self, speaker: &Connection, reason: DisconnectReason) {
        let now_ms = self.clock.now_ms();
        let ended = match self
            .sessions
            .end(&speaker.session_id, &speaker.connection_id, now_ms)
            .await
        {
            Ok(SessionWrite::Applied(session)) => session,
            Ok(SessionWrite::Rejected) => {
                debug!(
                    target: "bc.lifecycle",
                    session_id = %speaker.session_id,
                    "Speaker connection superseded, session continues"
                );
                return;
            }
            Ok(SessionWrite::Missing) => return,
            Err(e) => {
                warn!(
                    target: "bc.lifecycle",
                    session_id = %speaker.session_id,
                    error = %e,
                    "Failed to end session"
                );
                return;
            }
        };

        let listeners = match self.connections.listeners(&ended.session_id).await {
            Ok(listeners) => listeners,
            Err(e) => {
                warn!(
                    target: "bc.lifecycle",
                    session_id = %ended.session_id,
                    error = %e,
                    "Failed to enumerate listeners of ended session"
                );
                Vec::new()
            }
        };
        let ids: Vec<String> = listeners.into_iter().map(|c| c.connection_id).collect();
        let frame = ServerMessage::SessionEnded {
            session_id: ended.session_id.clone(),
            reason: match reason {
                DisconnectReason::Timeout => "speakerTimeout",
                _ => "speakerDisconnected",
            }
            .to_string(),
            timestamp: now_ms,
        };
        let report = fan_out(self.notifier.as_ref(), &ids, &frame).await;

        for id in &ids {
            match self.connections.remove(id).await {
                Ok(Some(_)) => {
                    metrics::record_disconnect(
                        Role::Listener.as_str(),
                        DisconnectReason::SessionEnded.as_str(),
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        target: "bc.lifecycle",
                        connection_id = %id,
                        error = %e,
                        "Failed to remove listener of ended session"
                    );
                }
            }
        }

        info!(
            target: "bc.lifecycle",
            session_id = %ended.session_id,
            listeners = ids.len(),
            notified = report.delivered,
            "Session ended"
        );
    }

    /// Disconnect every connection idle past the timeout, in bounded batches.
    ///
    /// Returns the number of connections removed.
    #[instrument(skip_all)]
    pub async fn sweep_idle(&self) -> Result<usize, BroadcastError> {
        let now_ms = self.clock.now_ms();
        let cutoff_ms = now_ms.saturating_sub(self.config.idle_timeout_ms());
        let batch_size = self.config.sweep_batch_size;
        let mut removed = 0;

        for _ in 0..self.config.sweep_max_batches {
            let batch = self.connections.idle_since(cutoff_ms, batch_size).await?;
            let exhausted = batch.len() < batch_size;
            if batch.is_empty() {
                break;
            }
            for (connection_id, _) in batch {
                match self.expire_connection(&connection_id, cutoff_ms, now_ms).await {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(
                            target: "bc.lifecycle",
                            connection_id = %connection_id,
                            error = %e,
                            "Failed to expire idle connection"
                        );
                    }
                }
            }
            if exhausted {
                break;
            }
        }

        if removed > 0 {
            info!(target: "bc.lifecycle", removed = removed, "Idle connections removed");
        }
        metrics::record_sweep_removals(removed);
        Ok(removed)
    }

    async fn expire_connection(
        &self,
        connection_id: &str,
        cutoff_ms: i64,
        now_ms: i64,
    ) -> Result<bool, BroadcastError> {
        let Some(connection) = self.connections.get(connection_id).await? else {
            // Row expired on its own; drop the stale index entry.
            self.connections.forget_activity(connection_id).await?;
            return Ok(false);
        };
        if connection.last_activity_at > cutoff_ms {
            // Score lagged behind the row; fix it so the entry leaves the idle range.
            self.connections.rescore_activity(&connection).await?;
            return Ok(false);
        }

        let frame = ServerMessage::ConnectionTimeout {
            idle_seconds: now_ms.saturating_sub(connection.last_activity_at) / 1000,
            timestamp: now_ms,
        };
        if let Err(e) = self.notifier.send(connection_id, &frame).await {
            debug!(
                target: "bc.lifecycle",
                connection_id = %connection_id,
                error = %e,
                "Timeout notice not delivered"
            );
        }

        let Some(removed) = self.connections.remove(connection_id).await? else {
            return Ok(false);
        };
        self.after_removal(removed, DisconnectReason::Timeout).await;
        Ok(true)
    }

    /// Switch a listener to another target language.
    #[instrument(skip_all, fields(connection_id = %connection_id))]
    pub async fn change_language(
        &self,
        connection_id: &str,
        language: &str,
    ) -> Result<ServerMessage, BroadcastError> {
        let language = self.target_language(Some(language))?;
        let Some(connection) = self
            .connections
            .set_target_language(connection_id, language)
            .await?
        else {
            return match self.connections.get(connection_id).await? {
                Some(_) => Err(BroadcastError::Forbidden(
                    "only listeners have a target language".to_string(),
                )),
                None => Err(BroadcastError::ConnectionNotFound(connection_id.to_string())),
            };
        };

        self.push_status(&connection.session_id, UpdateReason::LanguageChanged)
            .await;
        Ok(ServerMessage::LanguageChanged {
            target_language: language.to_string(),
            timestamp: self.clock.now_ms(),
        })
    }

    /// Status of the session `connection_id` belongs to.
    pub async fn status_for_connection(
        &self,
        connection_id: &str,
    ) -> Result<SessionStatusReport, BroadcastError> {
        let connection = self.require_connection(connection_id).await?;
        self.status(&connection.session_id, UpdateReason::Requested)
            .await
    }

    /// Status of a session, active or not.
    pub async fn status(
        &self,
        session_id: &str,
        reason: UpdateReason,
    ) -> Result<SessionStatusReport, BroadcastError> {
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| BroadcastError::SessionNotFound(session_id.to_string()))?;
        self.report_for(&session, reason).await
    }

    async fn report_for(
        &self,
        session: &Session,
        reason: UpdateReason,
    ) -> Result<SessionStatusReport, BroadcastError> {
        let listeners = self.connections.listeners(&session.session_id).await?;
        let now_ms = self.clock.now_ms();
        Ok(SessionStatusReport {
            session_id: session.session_id.clone(),
            is_active: session.is_active,
            listener_count: session.listener_count,
            language_distribution: language_distribution(&listeners),
            session_duration: now_ms.saturating_sub(session.created_at).max(0) / 1000,
            broadcast_state: session.broadcast_state,
            update_reason: reason,
            timestamp: now_ms,
        })
    }

    /// Send a status frame to the session's current speaker connection.
    ///
    /// A speaker channel found gone is treated as a speaker disconnect.
    pub async fn deliver_status(
        &self,
        session_id: &str,
        reason: UpdateReason,
    ) -> Result<StatusDelivery, BroadcastError> {
        let Some(session) = self.sessions.get(session_id).await? else {
            return Ok(StatusDelivery::SessionClosed);
        };
        if !session.is_active {
            return Ok(StatusDelivery::SessionClosed);
        }

        let report = self.report_for(&session, reason).await?;
        let speaker = session.speaker_connection_id.as_str();
        match self
            .notifier
            .send(speaker, &ServerMessage::SessionStatus(report))
            .await
        {
            Ok(()) => {
                metrics::record_status_update(reason.as_str());
                Ok(StatusDelivery::Sent)
            }
            Err(DeliveryError::Gone) => {
                if let Some(connection) = self.connections.remove(speaker).await? {
                    metrics::record_disconnect(
                        Role::Speaker.as_str(),
                        DisconnectReason::Gone.as_str(),
                    );
                    self.end_session(&connection, DisconnectReason::Gone).await;
                }
                Ok(StatusDelivery::NotDelivered)
            }
            Err(e) => {
                debug!(
                    target: "bc.lifecycle",
                    session_id = %session_id,
                    error = %e,
                    "Status update not delivered"
                );
                Ok(StatusDelivery::NotDelivered)
            }
        }
    }

    /// Best-effort [`deliver_status`](Self::deliver_status).
    pub async fn push_status(&self, session_id: &str, reason: UpdateReason) {
        if let Err(e) = self.deliver_status(session_id, reason).await {
            debug!(
                target: "bc.lifecycle",
                session_id = %session_id,
                reason = reason.as_str(),
                error = %e,
                "Status update skipped"
            );
        }
    }

    /// Push a periodic status frame to up to `limit` active sessions,
    /// starting after `cursor`.
    pub async fn publish_status_updates(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<StatusPass, BroadcastError> {
        let ids = self.sessions.active_session_ids().await?;
        metrics::set_sessions_active(ids.len());

        let remaining: Vec<String> = ids
            .into_iter()
            .filter(|id| cursor.map_or(true, |c| id.as_str() > c))
            .collect();
        let reached_end = remaining.len() <= limit;

        let mut pass = StatusPass::default();
        for session_id in remaining.into_iter().take(limit) {
            match self.deliver_status(&session_id, UpdateReason::Periodic).await {
                Ok(StatusDelivery::Sent) => pass.sent += 1,
                Ok(StatusDelivery::SessionClosed) => {
                    self.sessions.forget_active(&session_id).await?;
                }
                Ok(StatusDelivery::NotDelivered) => {}
                Err(e) => {
                    debug!(
                        target: "bc.lifecycle",
                        session_id = %session_id,
                        error = %e,
                        "Periodic status skipped"
                    );
                }
            }
            pass.cursor = Some(session_id);
        }
        if reached_end {
            pass.cursor = None;
        }
        Ok(pass)
    }

    /// Gate one audio chunk from a speaker and hand it to the sink.
    #[instrument(skip_all, fields(connection_id = %connection_id, bytes = payload.len()))]
    pub async fn accept_audio(
        &self,
        connection_id: &str,
        payload: Bytes,
    ) -> Result<AudioVerdict, BroadcastError> {
        let connection = self.require_speaker(connection_id).await?;
        self.rate_limiter
            .check_and_consume(Operation::AudioChunk, connection_id)
            .await?;
        let session = self.active_session(&connection.session_id).await?;

        let verdict = if session.broadcast_state.is_paused {
            AudioVerdict::Paused
        } else if session.broadcast_state.is_muted {
            AudioVerdict::Muted
        } else {
            self.audio
                .forward(AudioChunk {
                    session_id: session.session_id,
                    connection_id: connection_id.to_string(),
                    source_language: session.source_language,
                    payload,
                })
                .await?;
            AudioVerdict::Forwarded
        };
        metrics::record_audio_chunk(verdict.as_str());
        Ok(verdict)
    }

    pub async fn require_connection(&self, connection_id: &str) -> Result<Connection, BroadcastError> {
        self.connections
            .get(connection_id)
            .await?
            .ok_or_else(|| BroadcastError::ConnectionNotFound(connection_id.to_string()))
    }

    /// The connection, if it is a speaker's.
    pub async fn require_speaker(&self, connection_id: &str) -> Result<Connection, BroadcastError> {
        let connection = self.require_connection(connection_id).await?;
        if connection.role != Role::Speaker {
            return Err(BroadcastError::Forbidden(
                "action requires the speaker role".to_string(),
            ));
        }
        Ok(connection)
    }

    async fn authenticate(&self, token: Option<&str>) -> Result<VerifiedIdentity, BroadcastError> {
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return Err(AuthorizationError::MissingToken.into());
        };
        self.verifier.verify(token).await.map_err(|e| {
            warn!(
                target: "bc.lifecycle",
                reason = e.reason(),
                "Speaker token rejected"
            );
            e.into()
        })
    }

    async fn active_session(&self, session_id: &str) -> Result<Session, BroadcastError> {
        if !session_id::is_well_formed(session_id) {
            return Err(BroadcastError::SessionNotFound(session_id.to_string()));
        }
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| BroadcastError::SessionNotFound(session_id.to_string()))?;
        if !session.is_active {
            return Err(BroadcastError::SessionInactive(session_id.to_string()));
        }
        Ok(session)
    }

    fn target_language<'a>(&self, language: Option<&'a str>) -> Result<&'a str, BroadcastError> {
        match language {
            Some(l) if self.config.is_supported_language(l) => Ok(l),
            Some(_) => Err(BroadcastError::InvalidParameter(
                "targetLanguage is not supported".to_string(),
            )),
            None => Err(BroadcastError::InvalidParameter(
                "targetLanguage is required".to_string(),
            )),
        }
    }

    /// Reject a channel that is already bound to a session, before any write.
    async fn ensure_unbound(&self, connection_id: &str) -> Result<(), BroadcastError> {
        if self.connections.get(connection_id).await?.is_some() {
            return Err(already_joined());
        }
        Ok(())
    }

    async fn release_listener_slot(&self, session_id: &str) {
        if let Err(e) = self.sessions.remove_listener(session_id).await {
            warn!(
                target: "bc.lifecycle",
                session_id = %session_id,
                error = %e,
                "Failed to release listener slot"
            );
        }
    }

    async fn discard_row(&self, connection_id: &str) {
        if let Err(e) = self.connections.remove(connection_id).await {
            warn!(
                target: "bc.lifecycle",
                connection_id = %connection_id,
                error = %e,
                "Failed to discard connection row"
            );
        }
    }
}

fn already_joined() -> BroadcastError {
    BroadcastError::InvalidParameter("connection already joined a session".to_string())
}

fn log_rejection(operation: &'static str, err: &BroadcastError) {
    match err.category() {
        crate::errors::ErrorCategory::Internal => {
            error!(target: "bc.lifecycle", operation = operation, error = %err, "Request failed");
        }
        crate::errors::ErrorCategory::Retryable => {
            warn!(target: "bc.lifecycle", operation = operation, error = %err, "Request failed");
        }
        _ => {
            debug!(target: "bc.lifecycle", operation = operation, error = %err, "Request rejected");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::gateway::notifier::ChannelNotifier;
    use crate::rate_limit::RateLimitRule;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use common::clock::ManualClock;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    const T0_MS: i64 = 1_700_000_000_000;

    /// Accepts `valid:<user>`; `down` simulates an identity provider outage.
    struct StaticVerifier;

    #[async_trait]
    impl IdentityVerifier for StaticVerifier {
        async fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthorizationError> {
            if token == "down" {
                return Err(AuthorizationError::ProviderUnavailable);
            }
            token
                .strip_prefix("valid:")
                .map(|user| VerifiedIdentity {
                    user_id: user.to_string(),
                    email: None,
                    name: None,
                })
                .ok_or(AuthorizationError::BadSignature)
        }
    }

    struct Fixture {
        controller: LifecycleController,
        store: Arc<MemoryStore>,
        notifier: Arc<ChannelNotifier>,
        clock: ManualClock,
    }

    fn fixture_with(adjust: impl FnOnce(&mut Config)) -> Fixture {
        let mut config = test_config();
        config.rate_limits.listener_join = RateLimitRule::new(1000, 60);
        config.rate_limits.heartbeat = RateLimitRule::new(1000, 60);
        adjust(&mut config);

        let clock = ManualClock::new(T0_MS);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let notifier = ChannelNotifier::new();
        let controller = LifecycleController::new(
            Arc::new(config),
            Arc::new(clock.clone()),
            store.clone(),
            Arc::new(StaticVerifier),
            notifier.clone(),
        );
        Fixture {
            controller,
            store,
            notifier,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn speaker_request(connection_id: &str) -> ConnectRequest {
        ConnectRequest {
            connection_id: connection_id.to_string(),
            role: Some(Role::Speaker),
            source_language: Some("en".to_string()),
            quality_tier: Some("standard".to_string()),
            token: Some("valid:speaker-1".to_string()),
            ..ConnectRequest::default()
        }
    }

    fn listener_request(connection_id: &str, session_id: &str, language: &str) -> ConnectRequest {
        ConnectRequest {
            connection_id: connection_id.to_string(),
            role: Some(Role::Listener),
            session_id: Some(session_id.to_string()),
            target_language: Some(language.to_string()),
            client_ip: Some("10.0.0.9".to_string()),
            ..ConnectRequest::default()
        }
    }

    /// Create a session with a registered speaker channel.
    async fn start_session(f: &Fixture) -> (String, mpsc::Receiver<ServerMessage>) {
        let rx = f.notifier.register("s1").await;
        let outcome = f.controller.connect(speaker_request("s1")).await.unwrap();
        (outcome.session.session_id, rx)
    }

    async fn join(f: &Fixture, id: &str, session_id: &str, language: &str) -> mpsc::Receiver<ServerMessage> {
        let rx = f.notifier.register(id).await;
        f.controller
            .connect(listener_request(id, session_id, language))
            .await
            .unwrap();
        rx
    }

    async fn listener_count(f: &Fixture, session_id: &str) -> i64 {
        f.controller
            .sessions()
            .get(session_id)
            .await
            .unwrap()
            .unwrap()
            .listener_count
    }

    #[tokio::test]
    async fn test_speaker_creates_session() {
        let f = fixture();

        let outcome = f.controller.connect(speaker_request("s1")).await.unwrap();

        assert!(outcome.created);
        assert!(session_id::is_well_formed(&outcome.session.session_id));
        let stored = f
            .controller
            .sessions()
            .get(&outcome.session.session_id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.is_active);
        assert_eq!(stored.listener_count, 0);
        assert_eq!(stored.speaker_id, "speaker-1");
        assert_eq!(stored.speaker_connection_id, "s1");
        assert!(!stored.broadcast_state.is_paused);
        assert!(!stored.broadcast_state.is_muted);
        assert_eq!(stored.broadcast_state.volume, 1.0);
        assert_eq!(outcome.response(T0_MS).kind(), "sessionCreated");
    }

    #[tokio::test]
    async fn test_session_id_collision_regenerates() {
        let candidates = Arc::new(Mutex::new(vec![
            "calm-otter-002".to_string(),
            "calm-otter-001".to_string(),
            "calm-otter-001".to_string(),
        ]));
        let source: SessionIdSource = {
            let candidates = Arc::clone(&candidates);
            Arc::new(move || candidates.lock().unwrap().pop().unwrap_or_default())
        };
        let f = fixture();
        let controller = f.controller.with_session_ids(source);

        let first = controller.connect(speaker_request("s1")).await.unwrap();
        let second = controller.connect(speaker_request("s2")).await.unwrap();

        assert_eq!(first.session.session_id, "calm-otter-001");
        assert_eq!(second.session.session_id, "calm-otter-002");
    }

    #[tokio::test]
    async fn test_session_id_exhaustion_is_internal_error() {
        let f = fixture();
        let controller = f
            .controller
            .with_session_ids(Arc::new(|| "calm-otter-001".to_string()));
        controller.connect(speaker_request("s1")).await.unwrap();

        let err = controller.connect(speaker_request("s2")).await.unwrap_err();

        assert_eq!(err.error_code(), "INTERNAL_ERROR");
    }

    #[tokio::test]
    async fn test_speaker_token_failures() {
        let f = fixture();

        let mut req = speaker_request("s1");
        req.token = None;
        let err = f.controller.connect(req).await.unwrap_err();
        assert_eq!(err.error_code(), "UNAUTHORIZED");

        let mut req = speaker_request("s1");
        req.token = Some("forged".to_string());
        let err = f.controller.connect(req).await.unwrap_err();
        assert_eq!(err.error_code(), "UNAUTHORIZED");

        let mut req = speaker_request("s1");
        req.token = Some("down".to_string());
        let err = f.controller.connect(req).await.unwrap_err();
        assert_eq!(err.error_code(), "SERVICE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_invalid_create_parameters() {
        let f = fixture();

        let mut req = speaker_request("s1");
        req.source_language = Some("tlh".to_string());
        assert_eq!(
            f.controller.connect(req).await.unwrap_err().error_code(),
            "INVALID_PARAMETER"
        );

        let mut req = speaker_request("s1");
        req.quality_tier = Some("ultra".to_string());
        assert_eq!(
            f.controller.connect(req).await.unwrap_err().error_code(),
            "INVALID_PARAMETER"
        );

        let mut req = speaker_request("s1");
        req.role = None;
        assert_eq!(
            f.controller.connect(req).await.unwrap_err().error_code(),
            "INVALID_PARAMETER"
        );
    }

    #[tokio::test]
    async fn test_speaker_rejoin_requires_owner() {
        let f = fixture();
        let (session_id, _rx) = start_session(&f).await;

        let mut intruder = speaker_request("s2");
        intruder.session_id = Some(session_id.clone());
        intruder.token = Some("valid:someone-else".to_string());
        let err = f.controller.connect(intruder).await.unwrap_err();
        assert_eq!(err.error_code(), "FORBIDDEN");
        assert!(f.controller.connections().get("s2").await.unwrap().is_none());

        let mut owner = speaker_request("s2");
        owner.session_id = Some(session_id.clone());
        let outcome = f.controller.connect(owner).await.unwrap();
        assert!(!outcome.created);
        assert_eq!(outcome.session.speaker_connection_id, "s2");
    }

    #[tokio::test]
    async fn test_repeated_create_on_bound_channel_is_rejected_before_writes() {
        let f = fixture();
        let (session_id, _rx) = start_session(&f).await;

        let err = f.controller.connect(speaker_request("s1")).await.unwrap_err();

        assert_eq!(err.error_code(), "INVALID_PARAMETER");
        assert_eq!(
            f.controller.sessions().active_session_ids().await.unwrap(),
            vec![session_id.clone()]
        );
        let session = f.controller.sessions().get(&session_id).await.unwrap().unwrap();
        assert!(session.is_active);
        assert_eq!(session.speaker_connection_id, "s1");
        let creates = f
            .controller
            .rate_limiter
            .status(Operation::SessionCreate, "speaker-1")
            .await
            .unwrap();
        assert_eq!(creates.count, 1);
    }

    #[tokio::test]
    async fn test_repeated_join_on_bound_channel_is_rejected_before_writes() {
        let f = fixture();
        let (session_id, _rx) = start_session(&f).await;
        let _l1 = join(&f, "l1", &session_id, "es").await;

        let err = f
            .controller
            .connect(listener_request("l1", &session_id, "fr"))
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "INVALID_PARAMETER");
        assert_eq!(listener_count(&f, &session_id).await, 1);
        let row = f.controller.connections().get("l1").await.unwrap().unwrap();
        assert_eq!(row.target_language.as_deref(), Some("es"));
    }

    #[tokio::test]
    async fn test_failed_listener_insert_keeps_count_and_rows_in_step() {
        let f = fixture();
        let (session_id, _rx) = start_session(&f).await;
        let _l1 = join(&f, "l1", &session_id, "es").await;
        f.store.fail_next_index_add(1);

        let err = f
            .controller
            .connect(listener_request("l2", &session_id, "es"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "SERVICE_UNAVAILABLE");
        assert!(f.controller.connections().get("l2").await.unwrap().is_none());
        assert_eq!(listener_count(&f, &session_id).await, 1);

        f.controller
            .disconnect("l2", DisconnectReason::Client)
            .await
            .unwrap();

        assert_eq!(listener_count(&f, &session_id).await, 1);
        let listeners = f.controller.connections().listeners(&session_id).await.unwrap();
        assert_eq!(listeners.len(), 1);
    }

    #[tokio::test]
    async fn test_listeners_join_and_status_reports_languages() {
        let f = fixture();
        let (session_id, mut speaker_rx) = start_session(&f).await;

        let _es = join(&f, "l1", &session_id, "es").await;
        let _fr = join(&f, "l2", &session_id, "fr").await;

        assert_eq!(listener_count(&f, &session_id).await, 2);
        let report = f.controller.status_for_connection("s1").await.unwrap();
        assert_eq!(report.listener_count, 2);
        assert_eq!(report.language_distribution.get("es"), Some(&1));
        assert_eq!(report.language_distribution.get("fr"), Some(&1));
        assert_eq!(report.update_reason, UpdateReason::Requested);

        let Some(ServerMessage::SessionStatus(pushed)) = speaker_rx.recv().await else {
            unreachable!("speaker should receive a status push");
        };
        assert_eq!(pushed.update_reason, UpdateReason::ListenerJoined);
    }

    #[tokio::test]
    async fn test_listener_needs_valid_session_and_language() {
        let f = fixture();
        let (session_id, _rx) = start_session(&f).await;

        let err = f
            .controller
            .connect(listener_request("l1", &session_id, "xx"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_PARAMETER");

        let err = f
            .controller
            .connect(listener_request("l1", "none-such-404", "es"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "SESSION_NOT_FOUND");

        let err = f
            .controller
            .connect(listener_request("l1", "session:x", "es"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "SESSION_NOT_FOUND");

        f.controller
            .disconnect("s1", DisconnectReason::Client)
            .await
            .unwrap();
        let err = f
            .controller
            .connect(listener_request("l1", &session_id, "es"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "SESSION_INACTIVE");
    }

    #[tokio::test]
    async fn test_capacity_rejects_without_changing_count() {
        let f = fixture_with(|c| c.max_listeners_per_session = 2);
        let (session_id, _rx) = start_session(&f).await;
        let _l1 = join(&f, "l1", &session_id, "es").await;
        let _l2 = join(&f, "l2", &session_id, "es").await;

        let err = f
            .controller
            .connect(listener_request("l3", &session_id, "es"))
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "CAPACITY_EXCEEDED");
        assert!(err.retry_after_seconds().is_none());
        assert_eq!(listener_count(&f, &session_id).await, 2);
        assert!(f.controller.connections().get("l3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_joins_respect_cap() {
        let f = fixture_with(|c| c.max_listeners_per_session = 5);
        let (session_id, _rx) = start_session(&f).await;

        let attempts = (0..12).map(|i| {
            f.controller
                .connect(listener_request(&format!("l{i}"), &session_id, "es"))
        });
        let results = futures::future::join_all(attempts).await;

        let admitted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(admitted, 5);
        assert_eq!(listener_count(&f, &session_id).await, 5);
        assert_eq!(
            f.controller.connections().listeners(&session_id).await.unwrap().len(),
            5
        );
    }

    #[tokio::test]
    async fn test_listener_join_rate_limited_per_address() {
        let f = fixture_with(|c| c.rate_limits.listener_join = RateLimitRule::new(2, 60));
        let (session_id, _rx) = start_session(&f).await;
        let _l1 = join(&f, "l1", &session_id, "es").await;
        let _l2 = join(&f, "l2", &session_id, "es").await;

        let err = f
            .controller
            .connect(listener_request("l3", &session_id, "es"))
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "RATE_LIMIT_EXCEEDED");
        assert!(err.retry_after_seconds().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_listener_connect_survives_identity_outage() {
        let f = fixture();
        let (session_id, _rx) = start_session(&f).await;

        let mut req = listener_request("l1", &session_id, "es");
        req.token = Some("down".to_string());

        assert!(f.controller.connect(req).await.is_ok());
    }

    #[tokio::test]
    async fn test_heartbeat_thresholds() {
        let f = fixture();
        let (_session_id, _rx) = start_session(&f).await;

        f.clock.advance_minutes(99);
        let frames = f.controller.heartbeat("s1").await.unwrap();
        let kinds: Vec<_> = frames.iter().map(ServerMessage::kind).collect();
        assert_eq!(kinds, vec!["heartbeatAck"]);

        f.clock.advance_minutes(1);
        let frames = f.controller.heartbeat("s1").await.unwrap();
        let kinds: Vec<_> = frames.iter().map(ServerMessage::kind).collect();
        assert_eq!(kinds, vec!["heartbeatAck", "connectionRefreshRequired"]);

        f.clock.advance_minutes(7);
        let frames = f.controller.heartbeat("s1").await.unwrap();
        let kinds: Vec<_> = frames.iter().map(ServerMessage::kind).collect();
        assert_eq!(
            kinds,
            vec!["heartbeatAck", "connectionRefreshRequired", "connectionWarning"]
        );
        assert!(matches!(
            frames.last(),
            Some(ServerMessage::ConnectionWarning { remaining_minutes: 13, .. })
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_acks_when_store_unavailable() {
        let f = fixture();
        let (_session_id, _rx) = start_session(&f).await;
        f.store.set_unavailable(true);

        let frames = f.controller.heartbeat("s1").await.unwrap();

        assert_eq!(frames.len(), 1);
        assert!(matches!(frames.first(), Some(ServerMessage::HeartbeatAck { .. })));
    }

    #[tokio::test]
    async fn test_heartbeat_updates_activity() {
        let f = fixture();
        let (_session_id, _rx) = start_session(&f).await;
        f.clock.advance_minutes(3);

        f.controller.heartbeat("s1").await.unwrap();

        let conn = f.controller.connections().get("s1").await.unwrap().unwrap();
        assert_eq!(conn.last_activity_at, T0_MS + 3 * 60_000);
    }

    #[tokio::test]
    async fn test_listener_refresh_overcounts_until_old_leaves() {
        let f = fixture_with(|c| c.max_listeners_per_session = 1);
        let (session_id, _rx) = start_session(&f).await;
        let _old = join(&f, "l1-old", &session_id, "es").await;

        let frame = f
            .controller
            .refresh(RefreshRequest {
                connection_id: "l1-new".to_string(),
                session_id: session_id.clone(),
                role: Role::Listener,
                target_language: Some("es".to_string()),
                token: None,
                client_ip: None,
                previous_connection_id: Some("l1-old".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(frame.kind(), "connectionRefreshComplete");
        assert_eq!(listener_count(&f, &session_id).await, 2);

        f.controller
            .disconnect("l1-old", DisconnectReason::Client)
            .await
            .unwrap();
        f.controller
            .disconnect("l1-old", DisconnectReason::Client)
            .await
            .unwrap();
        assert_eq!(listener_count(&f, &session_id).await, 1);
    }

    #[tokio::test]
    async fn test_speaker_refresh_keeps_session_alive() {
        let f = fixture();
        let (session_id, _rx) = start_session(&f).await;
        let _new_rx = f.notifier.register("s1-new").await;
        let mut listener_rx = join(&f, "l1", &session_id, "es").await;

        f.controller
            .refresh(RefreshRequest {
                connection_id: "s1-new".to_string(),
                session_id: session_id.clone(),
                role: Role::Speaker,
                target_language: None,
                token: Some("valid:speaker-1".to_string()),
                client_ip: None,
                previous_connection_id: Some("s1".to_string()),
            })
            .await
            .unwrap();
        f.controller
            .disconnect("s1", DisconnectReason::Client)
            .await
            .unwrap();

        let session = f.controller.sessions().get(&session_id).await.unwrap().unwrap();
        assert!(session.is_active);
        assert_eq!(session.speaker_connection_id, "s1-new");

        f.controller
            .disconnect("s1-new", DisconnectReason::Client)
            .await
            .unwrap();
        let session = f.controller.sessions().get(&session_id).await.unwrap().unwrap();
        assert!(!session.is_active);
        assert!(!session.broadcast_state.is_active);
        assert_eq!(listener_rx.recv().await.unwrap().kind(), "sessionEnded");
        assert!(f.controller.connections().get("l1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_speaker_refresh_rejects_other_identity() {
        let f = fixture();
        let (session_id, _rx) = start_session(&f).await;

        let err = f
            .controller
            .refresh(RefreshRequest {
                connection_id: "s2".to_string(),
                session_id: session_id.clone(),
                role: Role::Speaker,
                target_language: None,
                token: Some("valid:mallory".to_string()),
                client_ip: None,
                previous_connection_id: None,
            })
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "FORBIDDEN");
        let session = f.controller.sessions().get(&session_id).await.unwrap().unwrap();
        assert_eq!(session.speaker_connection_id, "s1");
    }

    #[tokio::test]
    async fn test_speaker_disconnect_ends_session_for_all_listeners() {
        let f = fixture();
        let (session_id, _rx) = start_session(&f).await;
        let mut l1 = join(&f, "l1", &session_id, "es").await;
        let mut l2 = join(&f, "l2", &session_id, "fr").await;

        f.controller
            .disconnect("s1", DisconnectReason::Client)
            .await
            .unwrap();

        for rx in [&mut l1, &mut l2] {
            let frame = rx.recv().await.unwrap();
            assert!(matches!(frame, ServerMessage::SessionEnded { ref reason, .. } if reason == "speakerDisconnected"));
        }
        let report = f
            .controller
            .status(&session_id, UpdateReason::Requested)
            .await
            .unwrap();
        assert!(!report.is_active);
        assert!(report.language_distribution.is_empty());
    }

    #[tokio::test]
    async fn test_listener_count_never_negative() {
        let f = fixture();
        let (session_id, _rx) = start_session(&f).await;
        let _l1 = join(&f, "l1", &session_id, "es").await;

        for _ in 0..3 {
            f.controller
                .disconnect("l1", DisconnectReason::Client)
                .await
                .unwrap();
        }
        f.controller
            .disconnect("never-existed", DisconnectReason::Client)
            .await
            .unwrap();

        assert_eq!(listener_count(&f, &session_id).await, 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_idle_connections() {
        let f = fixture();
        let (session_id, _speaker_rx) = start_session(&f).await;
        let mut idle_rx = join(&f, "l-idle", &session_id, "es").await;
        let _busy = join(&f, "l-busy", &session_id, "es").await;

        f.clock.advance_ms(200_000);
        f.controller.heartbeat("s1").await.unwrap();
        f.controller.heartbeat("l-busy").await.unwrap();
        f.clock.advance_ms(200_000);

        let removed = f.controller.sweep_idle().await.unwrap();

        assert_eq!(removed, 1);
        assert!(matches!(
            idle_rx.recv().await,
            Some(ServerMessage::ConnectionTimeout { idle_seconds: 400, .. })
        ));
        assert!(f.controller.connections().get("l-idle").await.unwrap().is_none());
        assert_eq!(listener_count(&f, &session_id).await, 1);
    }

    #[tokio::test]
    async fn test_sweep_runs_in_bounded_batches() {
        let f = fixture_with(|c| {
            c.sweep_batch_size = 2;
            c.sweep_max_batches = 2;
        });
        let (session_id, _rx) = start_session(&f).await;
        for i in 0..6 {
            let _ = join(&f, &format!("l{i}"), &session_id, "es").await;
        }
        f.clock.advance_ms(f.controller.config().idle_timeout_ms() + 1);

        let first = f.controller.sweep_idle().await.unwrap();
        let second = f.controller.sweep_idle().await.unwrap();

        assert_eq!(first, 4);
        // Remaining two listeners and the speaker (which ends the session).
        assert_eq!(second, 3);
    }

    #[tokio::test]
    async fn test_sweep_rescores_fresh_rows_with_stale_scores() {
        use crate::store::keys;

        let f = fixture_with(|c| {
            c.sweep_batch_size = 1;
            c.sweep_max_batches = 1;
        });
        let (session_id, _rx) = start_session(&f).await;
        let _fresh = join(&f, "l-fresh", &session_id, "es").await;
        f.clock.advance_ms(1);
        let _idle = join(&f, "l-idle", &session_id, "es").await;

        f.clock.advance_ms(200_000);
        f.controller.heartbeat("s1").await.unwrap();
        f.controller.heartbeat("l-fresh").await.unwrap();
        // Row updated but the score write was lost.
        f.store
            .score_set(keys::ACTIVITY_INDEX, &keys::connection("l-fresh"), T0_MS)
            .await
            .unwrap();
        f.clock.advance_ms(f.controller.config().idle_timeout_ms() - 200_000 + 2);

        assert_eq!(f.controller.sweep_idle().await.unwrap(), 0);
        assert_eq!(f.controller.sweep_idle().await.unwrap(), 1);
        assert!(f.controller.connections().get("l-idle").await.unwrap().is_none());
        assert!(f.controller.connections().get("l-fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_change_language() {
        let f = fixture();
        let (session_id, _rx) = start_session(&f).await;
        let _l1 = join(&f, "l1", &session_id, "es").await;

        let frame = f.controller.change_language("l1", "de").await.unwrap();
        assert!(matches!(frame, ServerMessage::LanguageChanged { ref target_language, .. } if target_language == "de"));

        let report = f.controller.status(&session_id, UpdateReason::Requested).await.unwrap();
        assert_eq!(report.language_distribution.get("de"), Some(&1));
        assert_eq!(report.language_distribution.get("es"), None);

        assert_eq!(
            f.controller.change_language("s1", "de").await.unwrap_err().error_code(),
            "FORBIDDEN"
        );
        assert_eq!(
            f.controller.change_language("l1", "xx").await.unwrap_err().error_code(),
            "INVALID_PARAMETER"
        );
        assert_eq!(
            f.controller.change_language("gone", "de").await.unwrap_err().error_code(),
            "CONNECTION_NOT_FOUND"
        );
    }

    #[tokio::test]
    async fn test_audio_gate() {
        let f = fixture();
        let (session_id, _rx) = start_session(&f).await;
        let _l1 = join(&f, "l1", &session_id, "es").await;
        let chunk = Bytes::from_static(b"\x00\x01");

        assert_eq!(
            f.controller.accept_audio("s1", chunk.clone()).await.unwrap(),
            AudioVerdict::Forwarded
        );
        assert_eq!(
            f.controller
                .accept_audio("l1", chunk.clone())
                .await
                .unwrap_err()
                .error_code(),
            "FORBIDDEN"
        );

        f.controller
            .sessions()
            .apply_broadcast_patch(
                &session_id,
                crate::repositories::BroadcastPatch {
                    is_muted: Some(true),
                    ..Default::default()
                },
                T0_MS,
            )
            .await
            .unwrap();
        assert_eq!(
            f.controller.accept_audio("s1", chunk).await.unwrap(),
            AudioVerdict::Muted
        );
    }

    #[tokio::test]
    async fn test_status_publisher_pages_through_sessions() {
        let f = fixture();
        let mut receivers = Vec::new();
        for i in 0..3 {
            let id = format!("s{i}");
            receivers.push(f.notifier.register(&id).await);
            f.controller.connect(speaker_request(&id)).await.unwrap();
        }

        let first = f.controller.publish_status_updates(None, 2).await.unwrap();
        assert_eq!(first.sent, 2);
        assert!(first.cursor.is_some());

        let second = f
            .controller
            .publish_status_updates(first.cursor.as_deref(), 2)
            .await
            .unwrap();
        assert_eq!(second.sent, 1);
        assert_eq!(second.cursor, None);
    }

    #[tokio::test]
    async fn test_status_push_to_vanished_speaker_ends_session() {
        let f = fixture();
        let speaker_rx = f.notifier.register("s1").await;
        let session_id = f
            .controller
            .connect(speaker_request("s1"))
            .await
            .unwrap()
            .session
            .session_id;
        drop(speaker_rx);

        let delivery = f
            .controller
            .deliver_status(&session_id, UpdateReason::Periodic)
            .await
            .unwrap();

        assert_eq!(delivery, StatusDelivery::NotDelivered);
        let session = f.controller.sessions().get(&session_id).await.unwrap().unwrap();
        assert!(!session.is_active);
    }
}
