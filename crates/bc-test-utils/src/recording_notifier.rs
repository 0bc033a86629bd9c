//! [`ConnectionNotifier`] that records every frame instead of sending it.

use async_trait::async_trait;
use broadcast_controller::gateway::{ConnectionNotifier, DeliveryError};
use broadcast_controller::messages::ServerMessage;
use std::collections::HashSet;
use std::sync::Mutex;

/// Records `(connection_id, frame)` pairs. Connections marked gone fail
/// with [`DeliveryError::Gone`] and record nothing.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, ServerMessage)>>,
    gone: Mutex<HashSet<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make future sends to `connection_id` fail as if the channel closed.
    pub fn mark_gone(&self, connection_id: &str) {
        self.gone.lock().unwrap().insert(connection_id.to_string());
    }

    /// Frames sent to `connection_id`, oldest first.
    pub fn frames_for(&self, connection_id: &str) -> Vec<ServerMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == connection_id)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    /// Frame kinds sent to `connection_id`, oldest first.
    pub fn kinds_for(&self, connection_id: &str) -> Vec<&'static str> {
        self.frames_for(connection_id)
            .iter()
            .map(ServerMessage::kind)
            .collect()
    }

    pub fn total(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl ConnectionNotifier for RecordingNotifier {
    async fn send(&self, connection_id: &str, message: &ServerMessage) -> Result<(), DeliveryError> {
        if self.gone.lock().unwrap().contains(connection_id) {
            return Err(DeliveryError::Gone);
        }
        self.sent
            .lock()
            .unwrap()
            .push((connection_id.to_string(), message.clone()));
        Ok(())
    }
}
