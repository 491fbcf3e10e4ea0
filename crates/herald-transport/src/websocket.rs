//! WebSocket transport.
//!
//! [`WebSocketConnection`] adapts an upgraded axum WebSocket to the
//! [`Connection`] trait; [`serve`] runs a connection against its
//! [`ChannelMux`] until the client goes away.

use crate::metrics::{self, ConnectionMetricsGuard};
use crate::mux::ChannelMux;
use crate::traits::{Connection, ConnectionId, TransportError};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use herald_core::Outbound;
use herald_protocol::{Codec, Encoded, Envelope};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default maximum inbound message size.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// A WebSocket connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    socket: WebSocket,
    codec: Codec,
    remote_addr: Option<SocketAddr>,
    is_open: bool,
    max_message_size: usize,
}

impl WebSocketConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(id: ConnectionId, socket: WebSocket, codec: Codec, max_message_size: usize) -> Self {
        Self {
            id,
            socket,
            codec,
            remote_addr: None,
            is_open: true,
            max_message_size,
        }
    }

    /// Record the peer address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    fn decode(&self, data: &[u8], binary: bool) -> Result<Envelope, TransportError> {
        if data.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: data.len(),
                max: self.max_message_size,
            });
        }
        metrics::record_message(data.len(), "inbound");
        Ok(self.codec.decode(data, binary)?)
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => return self.decode(text.as_bytes(), false).map(Some),
                Some(Ok(Message::Binary(data))) => return self.decode(&data, true).map(Some),
                // tungstenite answers pings itself
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    debug!(connection = %self.id, "Received close frame");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(connection = %self.id, "WebSocket stream ended");
                    self.is_open = false;
                    return Ok(None);
                }
            }
        }
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match self.codec.encode(envelope)? {
            Encoded::Text(text) => {
                metrics::record_message(text.len(), "outbound");
                Message::Text(text)
            }
            Encoded::Binary(data) => {
                metrics::record_message(data.len(), "outbound");
                Message::Binary(data.to_vec())
            }
        };
        self.socket
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.is_open, false) {
            return Ok(());
        }
        self.socket
            .send(Message::Close(None))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}

/// Drive `conn` until it disconnects.
///
/// Outbound items are written as the sessions produce them; inbound envelopes
/// are routed through `mux`. A message that fails to decode closes the
/// connection. On exit every session is stopped with reason `closed`.
pub async fn serve<C: Connection>(
    mut conn: C,
    mut mux: ChannelMux,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let _metrics = ConnectionMetricsGuard::connection();
    debug!(connection = %conn.id(), remote = ?conn.remote_addr(), "Connection opened");

    while conn.is_open() {
        tokio::select! {
            biased;

            Some(item) = outbound.recv() => {
                let Some(envelope) = mux.handle_outbound(item) else {
                    continue;
                };
                if let Err(e) = conn.send(&envelope).await {
                    warn!(connection = %conn.id(), error = %e, "Send failed");
                    metrics::record_error("send");
                    break;
                }
            }

            received = conn.recv() => match received {
                Ok(Some(envelope)) => {
                    let start = Instant::now();
                    mux.handle_inbound(envelope);
                    metrics::record_latency(start.elapsed().as_secs_f64());
                }
                Ok(None) => break,
                Err(e @ (TransportError::Protocol(_) | TransportError::MessageTooLarge { .. })) => {
                    warn!(connection = %conn.id(), error = %e, "Closing connection on undecodable message");
                    metrics::record_error("decode");
                    if let Err(e) = conn.close().await {
                        debug!(connection = %conn.id(), error = %e, "Close failed");
                    }
                    break;
                }
                Err(e) => {
                    warn!(connection = %conn.id(), error = %e, "Receive failed");
                    metrics::record_error("receive");
                    break;
                }
            }
        }
    }

    mux.close_all();
    debug!(connection = %conn.id(), "Connection closed");
}
