//! Demo coordinator - connection surface
//!
//! Drives one WebSocket connection: registers the client with the
//! coordinator, pumps outbound frames, dispatches inbound frames over the
//! closed message set, and reports the disconnect when the socket closes.

use std::net::IpAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::coordinator::Coordinator;
use crate::protocol::{ClientMessage, ServerMessage};

/// Resolve the client's network identity as seen through the reverse
/// proxy: first X-Forwarded-For hop, falling back to the peer address.
pub fn source_address(forwarded_for: Option<&str>, peer: IpAddr) -> IpAddr {
    forwarded_for
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .and_then(|s| s.parse().ok())
        .unwrap_or(peer)
}

/// Serve one upgraded WebSocket connection until it closes
pub async fn handle_socket<S>(
    coord: Arc<Coordinator>,
    ws: WebSocketStream<S>,
    source_addr: IpAddr,
    user_agent: Option<String>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_write, mut ws_read) = ws.split();
    let (client_id, mut outbound_rx) = coord.register_client(source_addr, user_agent).await;

    loop {
        tokio::select! {
            msg = ws_read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        dispatch_frame(&coord, client_id, &text).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_write.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("client {} closed connection", client_id);
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("websocket error for {}: {}", client_id, e);
                        break;
                    }
                    None => break,
                    _ => {}
                }
            }
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                match serde_json::to_string(&frame) {
                    Ok(json) => {
                        if let Err(e) = ws_write.send(Message::Text(json)).await {
                            debug!("send to {} failed: {}", client_id, e);
                            break;
                        }
                    }
                    Err(e) => warn!("frame encode failed: {}", e),
                }
            }
        }
    }

    coord.handle_disconnect(client_id).await;
    let _ = ws_write.close().await;
}

/// Dispatch one inbound text frame. Unparseable frames and frames without
/// a known `type` come back as protocol errors; the connection stays open.
async fn dispatch_frame(coord: &Arc<Coordinator>, client_id: Uuid, text: &str) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            coord
                .send_to(client_id, ServerMessage::error("Invalid message format"))
                .await;
            return;
        }
    };
    let Some(kind) = value.get("type").and_then(|t| t.as_str()).map(str::to_owned) else {
        coord
            .send_to(client_id, ServerMessage::error("Invalid message format"))
            .await;
        return;
    };

    match kind.as_str() {
        "join_queue" | "leave_queue" | "heartbeat" => {
            match serde_json::from_value::<ClientMessage>(value) {
                Ok(ClientMessage::JoinQueue { invite_token }) => {
                    coord.handle_join(client_id, invite_token).await;
                }
                Ok(ClientMessage::LeaveQueue) => coord.handle_leave(client_id).await,
                Ok(ClientMessage::Heartbeat) => {
                    coord.send_to(client_id, ServerMessage::HeartbeatAck).await;
                }
                Err(_) => {
                    coord
                        .send_to(client_id, ServerMessage::error("Invalid message format"))
                        .await;
                }
            }
        }
        other => {
            coord
                .send_to(
                    client_id,
                    ServerMessage::error(format!("Unknown message type: {}", other)),
                )
                .await;
        }
    }
}
