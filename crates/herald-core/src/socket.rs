//! Per-(connection, topic) state handed to channel callbacks.
//!
//! The [`Socket`] is owned by its session task and passed to every callback as
//! `&mut Socket`; all push/broadcast helpers take it explicitly.

use crate::channel::StopReason;
use crate::pubsub::{Broadcast, PubSub, SubscriberId};
use crate::session::Command;
use herald_protocol::Envelope;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Something a session hands to its transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// An envelope to write to the client verbatim.
    Envelope(Envelope),
    /// The session for `topic` has exited.
    Exit {
        topic: String,
        session: SubscriberId,
        reason: StopReason,
    },
}

/// Routing handle for the transport connection that owns delivery.
///
/// Every session of a connection shares one outbound queue, so each
/// session's emissions stay in order.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    connection_id: Arc<str>,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl TransportHandle {
    /// Create a handle and the queue the transport drains.
    #[must_use]
    pub fn channel(connection_id: &str) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                connection_id: Arc::from(connection_id),
                tx,
            },
            rx,
        )
    }

    /// The owning connection.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Queue an item for the transport. Returns `false` if it is gone.
    pub fn send(&self, outbound: Outbound) -> bool {
        self.tx.send(outbound).is_ok()
    }

    /// Queue an envelope for the transport.
    pub fn send_envelope(&self, envelope: Envelope) -> bool {
        self.send(Outbound::Envelope(envelope))
    }

    /// Whether the transport has stopped draining.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Channel state for one joined topic.
pub struct Socket {
    topic: String,
    channel: String,
    joined: bool,
    reference: Option<String>,
    id: SubscriberId,
    transport: TransportHandle,
    pubsub: Arc<PubSub>,
    assigns: Map<String, Value>,
    commands: mpsc::WeakUnboundedSender<Command>,
    pending: Vec<Envelope>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("topic", &self.topic)
            .field("channel", &self.channel)
            .field("joined", &self.joined)
            .field("reference", &self.reference)
            .field("connection", &self.transport.connection_id())
            .field("pubsub_server", &self.pubsub.name())
            .field("assigns", &self.assigns)
            .finish()
    }
}

impl Socket {
    pub(crate) fn new(
        topic: String,
        channel: String,
        id: SubscriberId,
        transport: TransportHandle,
        pubsub: Arc<PubSub>,
        commands: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        Self {
            topic,
            channel,
            joined: false,
            reference: None,
            id,
            transport,
            pubsub,
            assigns: Map::new(),
            commands,
            pending: Vec::new(),
        }
    }

    /// The topic this socket is joined to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The route pattern that matched the topic.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether the join was accepted.
    #[must_use]
    pub fn is_joined(&self) -> bool {
        self.joined
    }

    /// The ref of the event being handled, if any.
    #[must_use]
    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    /// The session's subscriber identity.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// The transport connection that owns delivery.
    #[must_use]
    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    /// The pubsub server name.
    #[must_use]
    pub fn pubsub_server(&self) -> &str {
        self.pubsub.name()
    }

    pub(crate) fn pubsub(&self) -> &Arc<PubSub> {
        &self.pubsub
    }

    /// All assigns.
    #[must_use]
    pub fn assigns(&self) -> &Map<String, Value> {
        &self.assigns
    }

    /// Read one assign.
    #[must_use]
    pub fn get_assign(&self, key: &str) -> Option<&Value> {
        self.assigns.get(key)
    }

    /// Store an application value on the socket.
    pub fn assign(&mut self, key: impl Into<String>, value: Value) {
        self.assigns.insert(key.into(), value);
    }

    /// Push an event to this client only.
    ///
    /// Pushes made while the join is still pending are held back until the
    /// join reply has been sent, and dropped if the join is refused.
    pub fn push(&mut self, event: impl Into<String>, payload: Value) {
        let envelope = Envelope::push(self.topic.clone(), event, payload);
        if self.joined {
            self.transport.send_envelope(envelope);
        } else {
            self.pending.push(envelope);
        }
    }

    /// Broadcast to every subscriber of this topic, including this socket.
    pub async fn broadcast(&self, event: impl Into<String>, payload: Value) -> usize {
        let message = Broadcast::new(self.topic.clone(), event, payload);
        self.pubsub.broadcast(message).await
    }

    /// Broadcast to every subscriber of this topic except this socket.
    pub async fn broadcast_from(&self, event: impl Into<String>, payload: Value) -> usize {
        let message = Broadcast::new(self.topic.clone(), event, payload);
        self.pubsub.broadcast_from(self.id, message).await
    }

    /// Schedule `message` for this session's `handle_info`.
    ///
    /// Returns `false` if the session is stopping.
    pub fn send_info(&self, message: Value) -> bool {
        match self.commands.upgrade() {
            Some(tx) => tx.send(Command::Info(message)).is_ok(),
            None => false,
        }
    }

    /// Schedule `message` for `handle_info` after `delay`.
    pub fn send_after(&self, message: Value, delay: Duration) {
        let commands = self.commands.clone();
        let topic = self.topic.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::Info(message));
            } else {
                trace!(topic = %topic, "Dropping delayed message for stopped session");
            }
        });
    }

    pub(crate) fn set_reference(&mut self, reference: Option<String>) {
        self.reference = reference;
    }

    /// Mark the join accepted and release pushes held back during it.
    pub(crate) fn mark_joined(&mut self) {
        self.joined = true;
        for envelope in self.pending.drain(..) {
            self.transport.send_envelope(envelope);
        }
    }

    pub(crate) fn discard_pending(&mut self) {
        if !self.pending.is_empty() {
            debug!(topic = %self.topic, count = self.pending.len(), "Discarding pushes from refused join");
            self.pending.clear();
        }
    }
}
