//! Client/server message contract.
//!
//! Inbound frames are JSON objects tagged by `action`; outbound frames are
//! tagged by `type`. Field names are camelCase on the wire.

use crate::errors::BroadcastError;
use crate::repositories::{BroadcastState, Role};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Multi-field broadcast state replace. Absent fields are left unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakerStatePayload {
    pub is_paused: Option<bool>,
    pub is_muted: Option<bool>,
    pub volume: Option<f64>,
}

/// A request frame sent by a client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientRequest {
    CreateSession {
        source_language: String,
        quality_tier: String,
    },
    JoinSession {
        session_id: String,
        target_language: Option<String>,
    },
    Heartbeat,
    RefreshConnection {
        session_id: String,
        role: Role,
        target_language: Option<String>,
        /// Connection being replaced; informational only.
        previous_connection_id: Option<String>,
    },
    PauseBroadcast,
    ResumeBroadcast,
    MuteBroadcast,
    UnmuteBroadcast,
    SetVolume {
        volume_level: f64,
    },
    SpeakerStateChange {
        state: SpeakerStatePayload,
    },
    GetSessionStatus,
    ChangeLanguage {
        target_language: String,
    },
}

impl ClientRequest {
    /// Action name used for logging and latency labels.
    pub const fn action(&self) -> &'static str {
        match self {
            ClientRequest::CreateSession { .. } => "createSession",
            ClientRequest::JoinSession { .. } => "joinSession",
            ClientRequest::Heartbeat => "heartbeat",
            ClientRequest::RefreshConnection { .. } => "refreshConnection",
            ClientRequest::PauseBroadcast => "pauseBroadcast",
            ClientRequest::ResumeBroadcast => "resumeBroadcast",
            ClientRequest::MuteBroadcast => "muteBroadcast",
            ClientRequest::UnmuteBroadcast => "unmuteBroadcast",
            ClientRequest::SetVolume { .. } => "setVolume",
            ClientRequest::SpeakerStateChange { .. } => "speakerStateChange",
            ClientRequest::GetSessionStatus => "getSessionStatus",
            ClientRequest::ChangeLanguage { .. } => "changeLanguage",
        }
    }
}

/// Why a `sessionStatus` frame was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateReason {
    Requested,
    ListenerJoined,
    ListenerLeft,
    LanguageChanged,
    Periodic,
}

impl UpdateReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            UpdateReason::Requested => "requested",
            UpdateReason::ListenerJoined => "listenerJoined",
            UpdateReason::ListenerLeft => "listenerLeft",
            UpdateReason::LanguageChanged => "languageChanged",
            UpdateReason::Periodic => "periodic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusReport {
    pub session_id: String,
    pub is_active: bool,
    pub listener_count: i64,
    pub language_distribution: BTreeMap<String, i64>,
    /// Seconds since the session was created.
    pub session_duration: i64,
    pub broadcast_state: BroadcastState,
    pub update_reason: UpdateReason,
    pub timestamp: i64,
}

/// A frame sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    SessionCreated {
        session_id: String,
        connection_id: String,
        source_language: String,
        quality_tier: String,
        broadcast_state: BroadcastState,
        timestamp: i64,
    },
    SessionJoined {
        session_id: String,
        connection_id: String,
        role: Role,
        #[serde(skip_serializing_if = "Option::is_none")]
        target_language: Option<String>,
        source_language: String,
        listener_count: i64,
        broadcast_state: BroadcastState,
        timestamp: i64,
    },
    HeartbeatAck {
        timestamp: i64,
    },
    ConnectionRefreshRequired {
        session_id: String,
        role: Role,
        connection_age_minutes: i64,
        timestamp: i64,
    },
    ConnectionWarning {
        remaining_minutes: i64,
        timestamp: i64,
    },
    ConnectionRefreshComplete {
        session_id: String,
        connection_id: String,
        role: Role,
        broadcast_state: BroadcastState,
        timestamp: i64,
    },
    ConnectionTimeout {
        idle_seconds: i64,
        timestamp: i64,
    },
    BroadcastPaused {
        session_id: String,
        broadcast_state: BroadcastState,
        timestamp: i64,
    },
    BroadcastResumed {
        session_id: String,
        broadcast_state: BroadcastState,
        timestamp: i64,
    },
    BroadcastMuted {
        session_id: String,
        broadcast_state: BroadcastState,
        timestamp: i64,
    },
    BroadcastUnmuted {
        session_id: String,
        broadcast_state: BroadcastState,
        timestamp: i64,
    },
    VolumeChanged {
        session_id: String,
        volume_level: f64,
        timestamp: i64,
    },
    SpeakerStateChanged {
        session_id: String,
        state: BroadcastState,
        timestamp: i64,
    },
    SessionStatus(SessionStatusReport),
    LanguageChanged {
        target_language: String,
        timestamp: i64,
    },
    SessionEnded {
        session_id: String,
        reason: String,
        timestamp: i64,
    },
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_seconds: Option<u64>,
    },
}

impl ServerMessage {
    /// Wire `type` of the frame.
    pub const fn kind(&self) -> &'static str {
        match self {
            ServerMessage::SessionCreated { .. } => "sessionCreated",
            ServerMessage::SessionJoined { .. } => "sessionJoined",
            ServerMessage::HeartbeatAck { .. } => "heartbeatAck",
            ServerMessage::ConnectionRefreshRequired { .. } => "connectionRefreshRequired",
            ServerMessage::ConnectionWarning { .. } => "connectionWarning",
            ServerMessage::ConnectionRefreshComplete { .. } => "connectionRefreshComplete",
            ServerMessage::ConnectionTimeout { .. } => "connectionTimeout",
            ServerMessage::BroadcastPaused { .. } => "broadcastPaused",
            ServerMessage::BroadcastResumed { .. } => "broadcastResumed",
            ServerMessage::BroadcastMuted { .. } => "broadcastMuted",
            ServerMessage::BroadcastUnmuted { .. } => "broadcastUnmuted",
            ServerMessage::VolumeChanged { .. } => "volumeChanged",
            ServerMessage::SpeakerStateChanged { .. } => "speakerStateChanged",
            ServerMessage::SessionStatus(_) => "sessionStatus",
            ServerMessage::LanguageChanged { .. } => "languageChanged",
            ServerMessage::SessionEnded { .. } => "sessionEnded",
            ServerMessage::Error { .. } => "error",
        }
    }

    /// Client-safe error frame.
    pub fn from_error(err: &BroadcastError) -> Self {
        ServerMessage::Error {
            code: err.error_code().to_string(),
            message: err.client_message(),
            retry_after_seconds: err.retry_after_seconds(),
        }
    }
}
