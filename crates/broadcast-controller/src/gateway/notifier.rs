//! Outbound delivery to individual connections.

use crate::messages::ServerMessage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// Per-socket outbound buffer.
pub const CONNECTION_CHANNEL_BUFFER: usize = 64;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The connection no longer exists; the caller should clean it up.
    #[error("connection gone")]
    Gone,

    #[error("delivery failed: {0}")]
    Failed(String),
}

/// Sends frames to connections by id.
#[async_trait]
pub trait ConnectionNotifier: Send + Sync {
    async fn send(&self, connection_id: &str, message: &ServerMessage) -> Result<(), DeliveryError>;
}

/// Registry of local sockets, one bounded channel per connection.
///
/// Only sockets terminated by this process are known here. A closed
/// channel reports `Gone`. An id that was never registered here reports
/// `Failed`, since it may belong to another gateway instance and must not
/// trigger cleanup. A full buffer reports `Failed` and the frame is dropped.
#[derive(Debug, Default)]
pub struct ChannelNotifier {
    senders: RwLock<HashMap<String, mpsc::Sender<ServerMessage>>>,
}

impl ChannelNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a connection and return the receiving end of its channel.
    pub async fn register(&self, connection_id: &str) -> mpsc::Receiver<ServerMessage> {
        let (tx, rx) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);
        let count = {
            let mut senders = self.senders.write().await;
            senders.insert(connection_id.to_string(), tx);
            senders.len()
        };
        crate::observability::metrics::set_gateway_connections(count);
        rx
    }

    pub async fn unregister(&self, connection_id: &str) {
        let count = {
            let mut senders = self.senders.write().await;
            senders.remove(connection_id);
            senders.len()
        };
        crate::observability::metrics::set_gateway_connections(count);
    }

    pub async fn connection_count(&self) -> usize {
        self.senders.read().await.len()
    }
}

#[async_trait]
impl ConnectionNotifier for ChannelNotifier {
    async fn send(&self, connection_id: &str, message: &ServerMessage) -> Result<(), DeliveryError> {
        let sender = self.senders.read().await.get(connection_id).cloned();
        let Some(sender) = sender else {
            return Err(DeliveryError::Failed(
                "connection not registered on this gateway".to_string(),
            ));
        };
        sender.try_send(message.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Gone,
            mpsc::error::TrySendError::Full(_) => {
                debug!(
                    target: "bc.gateway",
                    connection_id = %connection_id,
                    "Outbound buffer full, dropping frame"
                );
                DeliveryError::Failed("outbound buffer full".to_string())
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn ack(ts: i64) -> ServerMessage {
        ServerMessage::HeartbeatAck { timestamp: ts }
    }

    #[tokio::test]
    async fn test_registered_connection_receives() {
        let notifier = ChannelNotifier::new();
        let mut rx = notifier.register("c1").await;

        notifier.send("c1", &ack(1)).await.unwrap();

        assert_eq!(rx.recv().await, Some(ack(1)));
        assert_eq!(notifier.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_closed_connection_is_gone_unknown_is_not() {
        let notifier = ChannelNotifier::new();
        assert!(matches!(
            notifier.send("nobody", &ack(1)).await,
            Err(DeliveryError::Failed(_))
        ));

        let rx = notifier.register("c1").await;
        drop(rx);
        assert_eq!(notifier.send("c1", &ack(1)).await, Err(DeliveryError::Gone));

        notifier.unregister("c1").await;
        assert_eq!(notifier.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_full_buffer_fails_without_blocking() {
        let notifier = ChannelNotifier::new();
        let _rx = notifier.register("c1").await;
        for i in 0..CONNECTION_CHANNEL_BUFFER {
            notifier.send("c1", &ack(i as i64)).await.unwrap();
        }

        assert!(matches!(
            notifier.send("c1", &ack(-1)).await,
            Err(DeliveryError::Failed(_))
        ));
    }
}
