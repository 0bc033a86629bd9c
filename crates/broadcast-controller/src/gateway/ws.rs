//! WebSocket front end.
//!
//! `GET /ws?role=speaker|listener&sessionId=..&targetLanguage=..&token=..`
//!
//! Each socket gets a fresh connection id and one writer task that drains
//! both the direct replies and the notifier channel for that id. Text
//! frames are JSON control messages; binary frames are audio.

use super::dispatcher::{ConnectionContext, GatewayDispatcher, GatewayEvent};
use super::notifier::{ChannelNotifier, CONNECTION_CHANNEL_BUFFER};
use crate::errors::BroadcastError;
use crate::messages::{ClientRequest, ServerMessage};
use crate::repositories::Role;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct GatewayState {
    pub dispatcher: Arc<GatewayDispatcher>,
    pub notifier: Arc<ChannelNotifier>,
}

/// Query parameters accepted on upgrade.
#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub role: Option<Role>,
    pub session_id: Option<String>,
    pub target_language: Option<String>,
    pub token: Option<String>,
}

pub fn gateway_router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<GatewayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params, peer))
}

/// Frames after which the server closes the channel.
fn is_terminal(frame: &ServerMessage) -> bool {
    matches!(
        frame,
        ServerMessage::SessionEnded { .. } | ServerMessage::ConnectionTimeout { .. }
    )
}

async fn write_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &ServerMessage,
) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(text) => sink.send(Message::Text(text)).await,
        Err(e) => {
            warn!(target: "bc.gateway", frame = frame.kind(), error = %e, "Failed to encode frame");
            Ok(())
        }
    }
}

async fn handle_socket(socket: WebSocket, state: GatewayState, params: ConnectParams, peer: SocketAddr) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    let context = ConnectionContext {
        connection_id: connection_id.clone(),
        client_ip: Some(peer.ip().to_string()),
        token: params.token,
        role: params.role,
    };
    info!(target: "bc.gateway", connection_id = %connection_id, role = ?context.role, "Channel opened");

    let (mut sink, mut stream) = socket.split();
    let mut pushed = state.notifier.register(&connection_id).await;
    let (reply_tx, mut replies) = mpsc::channel::<ServerMessage>(CONNECTION_CHANNEL_BUFFER);
    let closed = CancellationToken::new();

    let writer = {
        let closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    Some(frame) = replies.recv() => frame,
                    Some(frame) = pushed.recv() => frame,
                    else => break,
                };
                if write_frame(&mut sink, &frame).await.is_err() {
                    break;
                }
                if is_terminal(&frame) {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
            closed.cancel();
        })
    };

    let opened = state
        .dispatcher
        .dispatch(GatewayEvent::Connect {
            context: context.clone(),
            session_id: params.session_id,
            target_language: params.target_language,
        })
        .await;
    let rejected = opened
        .iter()
        .any(|f| matches!(f, ServerMessage::Error { .. }));
    for frame in opened {
        let _ = reply_tx.send(frame).await;
    }

    if !rejected {
        loop {
            let inbound = tokio::select! {
                () = closed.cancelled() => break,
                next = stream.next() => next,
            };
            let event = match inbound {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientRequest>(&text) {
                    Ok(request) => GatewayEvent::Message {
                        context: context.clone(),
                        request,
                    },
                    Err(e) => {
                        debug!(target: "bc.gateway", connection_id = %connection_id, error = %e, "Unparseable frame");
                        let err = BroadcastError::InvalidParameter("unrecognized message".to_string());
                        if reply_tx.send(ServerMessage::from_error(&err)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                },
                Some(Ok(Message::Binary(data))) => GatewayEvent::Audio {
                    context: context.clone(),
                    payload: Bytes::from(data),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(target: "bc.gateway", connection_id = %connection_id, error = %e, "Channel read failed");
                    break;
                }
            };

            for frame in state.dispatcher.dispatch(event).await {
                if reply_tx.send(frame).await.is_err() {
                    break;
                }
            }
        }
    }

    state
        .dispatcher
        .dispatch(GatewayEvent::Disconnect {
            connection_id: connection_id.clone(),
        })
        .await;
    state.notifier.unregister(&connection_id).await;
    drop(reply_tx);
    // Let the writer flush a rejection before the socket drops.
    if rejected {
        let _ = writer.await;
    } else {
        writer.abort();
    }
    info!(target: "bc.gateway", connection_id = %connection_id, "Channel closed");
}
