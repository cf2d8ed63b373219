//! WebSocket front for the connection manager
//!
//! Accepts TCP connections, upgrades them and binds each socket to a user
//! via an initial `identify` envelope:
//!
//! ```json
//! { "type": "identify", "data": { "user_id": "u1", "channels": ["alerts"] } }
//! ```
//!
//! After identification, inbound frames are routed through
//! [`ConnectionManager::handle_inbound`]; outbound traffic flows through a
//! writer task fed by an unbounded channel so sends never block the reader.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::connection::envelope::{Envelope, TYPE_IDENTIFY};
use crate::connection::manager::{ClientHandle, ConnectionManager};
use crate::error::{GuardrailError, Result};

/// Client handle backed by a WebSocket writer task
pub struct WsClientHandle {
    tx: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl ClientHandle for WsClientHandle {
    async fn send(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let raw = envelope.to_json()?;
        self.tx
            .send(Message::Text(raw))
            .map_err(|_| anyhow::anyhow!("writer closed"))
    }

    async fn close(&self, reason: &str) {
        let _ = self.tx.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: reason.to_owned().into(),
        })));
    }
}

/// Accept WebSocket connections until the listener fails.
pub async fn serve(listen_addr: &str, manager: ConnectionManager) -> Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Connection listener on {}", listen_addr);
    serve_on(listener, manager).await
}

/// Accept loop over an already-bound listener.
pub async fn serve_on(listener: TcpListener, manager: ConnectionManager) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_socket(stream, manager).await {
                debug!("Socket from {} ended: {}", peer, e);
            }
        });
    }
}

async fn handle_socket(stream: TcpStream, manager: ConnectionManager) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    // First text frame must identify the user.
    let (user_id, channels) = match identify(&mut source).await {
        Some(id) => id,
        None => {
            let _ = tx.send(Message::Text(
                Envelope::error("expected identify").to_json()?,
            ));
            let _ = tx.send(Message::Close(None));
            writer.abort();
            return Err(GuardrailError::ConnectionClosed(
                "closed before identify".to_string(),
            ));
        }
    };

    let handle = Arc::new(WsClientHandle { tx: tx.clone() });
    let conn_id = match manager.connect(handle, &user_id, &channels).await {
        Some(id) => id,
        None => {
            writer.abort();
            return Ok(());
        }
    };

    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(raw)) => match Envelope::from_json(&raw) {
                Ok(envelope) => {
                    if let Some(unrouted) = manager.handle_inbound(&user_id, envelope).await {
                        debug!("Unrouted envelope from {}: {}", user_id, unrouted.kind);
                    }
                }
                Err(e) => {
                    warn!("Bad envelope from {}: {}", user_id, e);
                    manager
                        .send_to_user(&user_id, &Envelope::error("malformed envelope"))
                        .await;
                }
            },
            Ok(Message::Ping(payload)) => {
                let _ = tx.send(Message::Pong(payload));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Read error for {}: {}", user_id, e);
                break;
            }
        }
    }

    // Conditional on still owning the registration: a reconnect may have
    // superseded this socket while its reader was draining.
    manager.disconnect_if(&user_id, conn_id, "socket closed").await;
    writer.abort();
    Ok(())
}

async fn identify<S>(source: &mut S) -> Option<(String, Vec<String>)>
where
    S: StreamExt<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(raw)) => {
                let envelope = Envelope::from_json(&raw).ok()?;
                if envelope.kind != TYPE_IDENTIFY {
                    return None;
                }
                let user_id = envelope.data.get("user_id")?.as_str()?.to_string();
                let channels = envelope
                    .data
                    .get("channels")
                    .and_then(|v| v.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|c| c.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                return Some((user_id, channels));
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            _ => return None,
        }
    }
    None
}
