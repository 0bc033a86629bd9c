//! Single entry point for inbound gateway events.
//!
//! The dispatcher is stateless: each event carries the connection id and
//! whatever the front end knows about the channel (claimed role, bearer
//! token, client address). Replies are returned to the caller; fan-out
//! goes through the notifier.

use crate::broadcast::{BroadcastCoordinator, ControlChange};
use crate::errors::{BroadcastError, ErrorCategory};
use crate::lifecycle::{ConnectRequest, DisconnectReason, LifecycleController, RefreshRequest};
use crate::messages::{ClientRequest, ServerMessage};
use crate::observability::metrics;
use crate::repositories::Role;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// What the front end knows about a channel.
#[derive(Clone, Default)]
pub struct ConnectionContext {
    pub connection_id: String,
    pub client_ip: Option<String>,
    /// Bearer token presented when the channel opened.
    pub token: Option<String>,
    /// Role claimed when the channel opened.
    pub role: Option<Role>,
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("connection_id", &self.connection_id)
            .field("client_ip", &self.client_ip)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("role", &self.role)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// A channel opened. With a session id (and, for listeners, a target
    /// language) the connect happens immediately.
    Connect {
        context: ConnectionContext,
        session_id: Option<String>,
        target_language: Option<String>,
    },
    Message {
        context: ConnectionContext,
        request: ClientRequest,
    },
    Audio {
        context: ConnectionContext,
        payload: Bytes,
    },
    /// The channel closed.
    Disconnect { connection_id: String },
}

impl GatewayEvent {
    fn action(&self) -> &'static str {
        match self {
            GatewayEvent::Connect { .. } => "connect",
            GatewayEvent::Message { request, .. } => request.action(),
            GatewayEvent::Audio { .. } => "audio",
            GatewayEvent::Disconnect { .. } => "disconnect",
        }
    }
}

pub struct GatewayDispatcher {
    lifecycle: Arc<LifecycleController>,
    broadcast: BroadcastCoordinator,
}

impl GatewayDispatcher {
    pub fn new(lifecycle: Arc<LifecycleController>) -> Self {
        let broadcast = BroadcastCoordinator::new(
            lifecycle.sessions(),
            lifecycle.connections(),
            lifecycle.notifier(),
            lifecycle.clock(),
        );
        Self {
            lifecycle,
            broadcast,
        }
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleController> {
        &self.lifecycle
    }

    /// Handle one event and return the frames for the originating channel.
    pub async fn dispatch(&self, event: GatewayEvent) -> Vec<ServerMessage> {
        let start = Instant::now();
        let action = event.action();

        let result = match event {
            GatewayEvent::Connect {
                context,
                session_id,
                target_language,
            } => self.on_connect(context, session_id, target_language).await,
            GatewayEvent::Message { context, request } => self.on_message(context, request).await,
            GatewayEvent::Audio { context, payload } => self
                .lifecycle
                .accept_audio(&context.connection_id, payload)
                .await
                .map(|_| Vec::new()),
            GatewayEvent::Disconnect { connection_id } => self
                .lifecycle
                .disconnect(&connection_id, DisconnectReason::Client)
                .await
                .map(|()| Vec::new()),
        };

        metrics::record_message_latency(action, start.elapsed());
        match result {
            Ok(frames) => frames,
            Err(e) => {
                log_failure(action, &e);
                vec![ServerMessage::from_error(&e)]
            }
        }
    }

    async fn on_connect(
        &self,
        context: ConnectionContext,
        session_id: Option<String>,
        target_language: Option<String>,
    ) -> Result<Vec<ServerMessage>, BroadcastError> {
        self.lifecycle.admit(context.client_ip.as_deref()).await?;

        let ready = match context.role {
            Some(Role::Speaker) => session_id.is_some(),
            Some(Role::Listener) => session_id.is_some() && target_language.is_some(),
            None => false,
        };
        if !ready {
            // Waits for createSession / joinSession.
            return Ok(Vec::new());
        }

        let outcome = self
            .lifecycle
            .connect(ConnectRequest {
                connection_id: context.connection_id,
                role: context.role,
                session_id,
                target_language,
                token: context.token,
                client_ip: context.client_ip,
                ..ConnectRequest::default()
            })
            .await?;
        Ok(vec![outcome.response(self.lifecycle.clock().now_ms())])
    }

    async fn on_message(
        &self,
        context: ConnectionContext,
        request: ClientRequest,
    ) -> Result<Vec<ServerMessage>, BroadcastError> {
        let connection_id = context.connection_id.as_str();
        match request {
            ClientRequest::CreateSession {
                source_language,
                quality_tier,
            } => {
                if context.role == Some(Role::Listener) {
                    return Err(BroadcastError::Forbidden(
                        "listeners cannot create sessions".to_string(),
                    ));
                }
                let outcome = self
                    .lifecycle
                    .connect(ConnectRequest {
                        connection_id: context.connection_id,
                        role: Some(Role::Speaker),
                        source_language: Some(source_language),
                        quality_tier: Some(quality_tier),
                        token: context.token,
                        client_ip: context.client_ip,
                        ..ConnectRequest::default()
                    })
                    .await?;
                Ok(vec![outcome.response(self.lifecycle.clock().now_ms())])
            }
            ClientRequest::JoinSession {
                session_id,
                target_language,
            } => {
                let outcome = self
                    .lifecycle
                    .connect(ConnectRequest {
                        connection_id: context.connection_id,
                        role: Some(context.role.unwrap_or(Role::Listener)),
                        session_id: Some(session_id),
                        target_language,
                        token: context.token,
                        client_ip: context.client_ip,
                        ..ConnectRequest::default()
                    })
                    .await?;
                Ok(vec![outcome.response(self.lifecycle.clock().now_ms())])
            }
            ClientRequest::Heartbeat => self.lifecycle.heartbeat(connection_id).await,
            ClientRequest::RefreshConnection {
                session_id,
                role,
                target_language,
                previous_connection_id,
            } => {
                let frame = self
                    .lifecycle
                    .refresh(RefreshRequest {
                        connection_id: context.connection_id,
                        session_id,
                        role,
                        target_language,
                        token: context.token,
                        client_ip: context.client_ip,
                        previous_connection_id,
                    })
                    .await?;
                Ok(vec![frame])
            }
            ClientRequest::PauseBroadcast => self.control(connection_id, ControlChange::Pause).await,
            ClientRequest::ResumeBroadcast => {
                self.control(connection_id, ControlChange::Resume).await
            }
            ClientRequest::MuteBroadcast => self.control(connection_id, ControlChange::Mute).await,
            ClientRequest::UnmuteBroadcast => {
                self.control(connection_id, ControlChange::Unmute).await
            }
            ClientRequest::SetVolume { volume_level } => {
                self.control(connection_id, ControlChange::SetVolume(volume_level))
                    .await
            }
            ClientRequest::SpeakerStateChange { state } => {
                self.control(connection_id, ControlChange::Replace(state))
                    .await
            }
            ClientRequest::GetSessionStatus => {
                let report = self.lifecycle.status_for_connection(connection_id).await?;
                Ok(vec![ServerMessage::SessionStatus(report)])
            }
            ClientRequest::ChangeLanguage { target_language } => {
                let frame = self
                    .lifecycle
                    .change_language(connection_id, &target_language)
                    .await?;
                Ok(vec![frame])
            }
        }
    }

    async fn control(
        &self,
        connection_id: &str,
        change: ControlChange,
    ) -> Result<Vec<ServerMessage>, BroadcastError> {
        change.validate()?;
        let speaker = self.lifecycle.require_speaker(connection_id).await?;
        let outcome = self
            .broadcast
            .apply_control(&speaker.session_id, change)
            .await?;

        for gone in &outcome.fanout.gone {
            debug!(
                target: "bc.gateway",
                connection_id = %gone,
                "Listener channel gone during fan-out, cleaning up"
            );
            if let Err(e) = self
                .lifecycle
                .disconnect(gone, DisconnectReason::Gone)
                .await
            {
                warn!(
                    target: "bc.gateway",
                    connection_id = %gone,
                    error = %e,
                    "Cleanup of gone listener failed"
                );
            }
        }
        Ok(vec![outcome.event])
    }
}

fn log_failure(action: &'static str, err: &BroadcastError) {
    match err.category() {
        ErrorCategory::Internal => {
            error!(target: "bc.gateway", action = action, error = %err, "Event failed");
        }
        ErrorCategory::Retryable => {
            warn!(target: "bc.gateway", action = action, error = %err, "Event failed");
        }
        _ => {
            debug!(target: "bc.gateway", action = action, error = %err, "Event rejected");
        }
    }
}
