//! Hand-off point to the audio pipeline.
//!
//! The controller only gates chunks (active session, unpaused, unmuted,
//! within rate); what happens downstream is the sink's business.

use crate::errors::BroadcastError;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

/// One validated chunk, forwarded unmodified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub session_id: String,
    pub connection_id: String,
    pub source_language: String,
    pub payload: Bytes,
}

/// Gate decision for an inbound chunk from a speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioVerdict {
    Forwarded,
    /// Dropped because the broadcast is paused.
    Paused,
    /// Dropped because the broadcast is muted.
    Muted,
}

impl AudioVerdict {
    pub const fn as_str(self) -> &'static str {
        match self {
            AudioVerdict::Forwarded => "forwarded",
            AudioVerdict::Paused => "paused",
            AudioVerdict::Muted => "muted",
        }
    }
}

#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn forward(&self, chunk: AudioChunk) -> Result<(), BroadcastError>;
}

/// Sink that discards every chunk.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAudioSink;

#[async_trait]
impl AudioSink for NullAudioSink {
    async fn forward(&self, chunk: AudioChunk) -> Result<(), BroadcastError> {
        debug!(
            target: "bc.lifecycle",
            session_id = %chunk.session_id,
            bytes = chunk.payload.len(),
            "No audio pipeline configured, dropping chunk"
        );
        Ok(())
    }
}
