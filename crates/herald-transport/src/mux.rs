//! Per-connection channel multiplexer.
//!
//! One physical connection (a WebSocket or a long-poll session) carries many
//! joined topics. [`ChannelMux`] keeps the connection's sessions keyed by
//! topic, routes inbound envelopes to them, and turns session exits into the
//! `phx_close` / `phx_error` notifications clients expect.
//!
//! A session that was asked to leave stays tracked until its exit arrives, so
//! the client always sees its `phx_close`. Envelopes for that topic received in
//! the meantime (typically an immediate rejoin) are held and replayed after
//! the close.

use crate::metrics;
use herald_core::session::{self, JoinRequest, SessionConfig, SessionHandle};
use herald_core::{ChannelRouter, Outbound, PubSub, StopReason, SubscriberId, TransportHandle};
use herald_protocol::{status, Envelope};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// What to do with a join for a topic no route matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmatchedTopic {
    /// Reply `"error"` with `{"reason": "unmatched topic"}`.
    #[default]
    Reject,
    /// Send nothing.
    Drop,
}

/// Multiplexer settings shared by every connection.
#[derive(Debug, Clone, Default)]
pub struct MuxConfig {
    pub unmatched_topic: UnmatchedTopic,
    pub session: SessionConfig,
}

/// The sessions of one connection.
pub struct ChannelMux {
    transport: TransportHandle,
    router: Arc<ChannelRouter>,
    pubsub: Arc<PubSub>,
    config: MuxConfig,
    sessions: HashMap<String, SessionHandle>,
    leaving: HashMap<SubscriberId, String>,
    held: HashMap<String, Vec<Envelope>>,
}

impl ChannelMux {
    /// Create a multiplexer delivering through `transport`.
    #[must_use]
    pub fn new(
        transport: TransportHandle,
        router: Arc<ChannelRouter>,
        pubsub: Arc<PubSub>,
        config: MuxConfig,
    ) -> Self {
        Self {
            transport,
            router,
            pubsub,
            config,
            sessions: HashMap::new(),
            leaving: HashMap::new(),
            held: HashMap::new(),
        }
    }

    /// The owning connection.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        self.transport.connection_id()
    }

    /// Whether a session is running for `topic`.
    #[must_use]
    pub fn is_joined(&self, topic: &str) -> bool {
        self.sessions.contains_key(topic)
    }

    /// Number of running sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Route one client envelope.
    pub fn handle_inbound(&mut self, envelope: Envelope) {
        if envelope.is_heartbeat() {
            if let Some(reference) = envelope.reference {
                self.transport.send_envelope(Envelope::reply(
                    envelope.topic,
                    reference,
                    status::OK,
                    json!({}),
                ));
            }
            return;
        }

        if self.is_leaving(&envelope.topic) {
            trace!(topic = %envelope.topic, event = %envelope.event, "Holding envelope until leave completes");
            self.held
                .entry(envelope.topic.clone())
                .or_default()
                .push(envelope);
            return;
        }

        if envelope.is_join() {
            self.join(envelope);
            return;
        }

        if envelope.is_leave() {
            self.leave(envelope);
            return;
        }

        match self.sessions.get(&envelope.topic) {
            Some(session) => {
                debug!(
                    connection = %self.connection_id(),
                    topic = %envelope.topic,
                    event = %envelope.event,
                    "Routing event"
                );
                if !session.deliver_inbound(envelope.event, envelope.payload, envelope.reference) {
                    debug!(topic = %envelope.topic, "Session already stopped");
                }
            }
            None => {
                debug!(
                    connection = %self.connection_id(),
                    topic = %envelope.topic,
                    event = %envelope.event,
                    "Dropping event for unjoined topic"
                );
            }
        }
    }

    fn is_leaving(&self, topic: &str) -> bool {
        self.leaving.values().any(|t| t == topic)
    }

    fn leave(&mut self, envelope: Envelope) {
        let Some(session) = self.sessions.remove(&envelope.topic) else {
            debug!(connection = %self.connection_id(), topic = %envelope.topic, "Leave for unjoined topic");
            return;
        };
        debug!(connection = %self.connection_id(), topic = %envelope.topic, "Leaving");
        session.deliver_inbound(envelope.event, envelope.payload, envelope.reference);
        self.leaving.insert(session.id(), envelope.topic);
    }

    fn join(&mut self, envelope: Envelope) {
        let Envelope {
            topic,
            payload,
            reference,
            ..
        } = envelope;

        let Some(route) = self.router.route(&topic) else {
            metrics::record_join("unmatched");
            match self.config.unmatched_topic {
                UnmatchedTopic::Reject => {
                    warn!(connection = %self.connection_id(), topic = %topic, "Join for unmatched topic");
                    if let Some(reference) = reference {
                        self.transport.send_envelope(Envelope::reply(
                            topic,
                            reference,
                            status::ERROR,
                            json!({ "reason": "unmatched topic" }),
                        ));
                    }
                }
                UnmatchedTopic::Drop => {
                    debug!(connection = %self.connection_id(), topic = %topic, "Ignoring join for unmatched topic");
                }
            }
            return;
        };

        if let Some(previous) = self.sessions.remove(&topic) {
            debug!(connection = %self.connection_id(), topic = %topic, "Replacing joined session");
            previous.shutdown(StopReason::Shutdown);
        }

        metrics::record_join("routed");
        let handle = session::spawn(
            route.pattern(),
            route.factory().create(),
            JoinRequest {
                topic: topic.clone(),
                payload,
                reference,
            },
            self.transport.clone(),
            Arc::clone(&self.pubsub),
            self.config.session.clone(),
        );
        self.sessions.insert(topic, handle);
    }

    /// Process one item from the transport queue.
    ///
    /// Returns the envelope to write to the client, if any. Exits of sessions
    /// that were already replaced are ignored.
    ///
    /// When a leaving session's exit arrives, envelopes held for its topic are
    /// routed again; their output follows the returned notification.
    pub fn handle_outbound(&mut self, outbound: Outbound) -> Option<Envelope> {
        match outbound {
            Outbound::Envelope(envelope) => Some(envelope),
            Outbound::Exit {
                topic,
                session,
                reason,
            } => {
                if self.leaving.remove(&session).is_none() {
                    if self.sessions.get(&topic).map(SessionHandle::id) != Some(session) {
                        trace!(topic = %topic, session = %session, "Ignoring exit of replaced session");
                        return None;
                    }
                    self.sessions.remove(&topic);
                }

                let notification = match reason {
                    StopReason::Closed | StopReason::Declined => None,
                    reason if reason.is_abnormal() => {
                        metrics::record_channel_fault();
                        Some(Envelope::error(topic.clone()))
                    }
                    _ => Some(Envelope::close(topic.clone())),
                };

                if !self.is_leaving(&topic) {
                    for envelope in self.held.remove(&topic).unwrap_or_default() {
                        self.handle_inbound(envelope);
                    }
                }
                notification
            }
        }
    }

    /// Stop every session with reason `closed`.
    pub fn close_all(&mut self) {
        self.held.clear();
        self.leaving.clear();
        for (topic, session) in self.sessions.drain() {
            trace!(topic = %topic, "Closing session");
            session.shutdown(StopReason::Closed);
        }
    }
}

impl Drop for ChannelMux {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use herald_core::{Channel, ChannelError, Join, Reply, Socket};
    use herald_protocol::events;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct Echo;

    #[async_trait]
    impl Channel for Echo {
        async fn join(&mut self, _: &str, _: Value, _: &mut Socket) -> Result<Join, ChannelError> {
            Ok(Join::ok())
        }

        async fn handle_in(
            &mut self,
            event: &str,
            payload: Value,
            _: &mut Socket,
        ) -> Result<Reply, ChannelError> {
            match event {
                "crash" => Err(ChannelError::new("crash")),
                _ => Ok(Reply::ok(payload)),
            }
        }
    }

    fn mux(unmatched_topic: UnmatchedTopic) -> (ChannelMux, mpsc::UnboundedReceiver<Outbound>) {
        let (transport, rx) = TransportHandle::channel("conn-test");
        let router = ChannelRouter::new().channel("rooms:*", || Echo).unwrap();
        let config = MuxConfig {
            unmatched_topic,
            ..MuxConfig::default()
        };
        let mux = ChannelMux::new(
            transport,
            Arc::new(router),
            Arc::new(PubSub::new("test")),
            config,
        );
        (mux, rx)
    }

    /// Drain the queue through the mux until an envelope comes out.
    async fn next_envelope(
        mux: &mut ChannelMux,
        rx: &mut mpsc::UnboundedReceiver<Outbound>,
    ) -> Envelope {
        loop {
            let outbound = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("timed out")
                .expect("closed");
            if let Some(envelope) = mux.handle_outbound(outbound) {
                return envelope;
            }
        }
    }

    fn join(topic: &str, reference: &str) -> Envelope {
        Envelope::new(topic, events::JOIN, json!({}), Some(reference.into()))
    }

    #[tokio::test]
    async fn test_unmatched_topic_rejected() {
        let (mut mux, mut rx) = mux(UnmatchedTopic::Reject);
        mux.handle_inbound(join("users:1", "1"));

        let reply = next_envelope(&mut mux, &mut rx).await;
        assert_eq!(reply.reply_status(), Some("error"));
        assert_eq!(reply.payload["response"]["reason"], "unmatched topic");
        assert!(!mux.is_joined("users:1"));
    }

    #[tokio::test]
    async fn test_unmatched_topic_dropped() {
        let (mut mux, mut rx) = mux(UnmatchedTopic::Drop);
        mux.handle_inbound(join("users:1", "1"));
        mux.handle_inbound(Envelope::new(
            "phoenix",
            events::HEARTBEAT,
            json!({}),
            Some("2".into()),
        ));

        // The heartbeat reply is the first thing out.
        let reply = next_envelope(&mut mux, &mut rx).await;
        assert_eq!(reply.topic, "phoenix");
        assert_eq!(reply.reference.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_event_for_unjoined_topic_is_dropped() {
        let (mut mux, mut rx) = mux(UnmatchedTopic::Reject);
        mux.handle_inbound(Envelope::new("rooms:1", "echo", json!({}), Some("1".into())));
        mux.handle_inbound(join("rooms:1", "2"));

        let reply = next_envelope(&mut mux, &mut rx).await;
        assert_eq!(reply.reference.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_leave_emits_close() {
        let (mut mux, mut rx) = mux(UnmatchedTopic::Reject);
        mux.handle_inbound(join("rooms:1", "1"));
        next_envelope(&mut mux, &mut rx).await;

        mux.handle_inbound(Envelope::new("rooms:1", events::LEAVE, json!({}), Some("2".into())));
        assert_eq!(next_envelope(&mut mux, &mut rx).await.reply_status(), Some("ok"));
        let close = next_envelope(&mut mux, &mut rx).await;
        assert_eq!(close.event, events::CLOSE);
        assert!(!mux.is_joined("rooms:1"));
    }

    #[tokio::test]
    async fn test_leave_then_immediate_rejoin_closes_first() {
        let (mut mux, mut rx) = mux(UnmatchedTopic::Reject);
        mux.handle_inbound(join("rooms:1", "1"));
        next_envelope(&mut mux, &mut rx).await;

        mux.handle_inbound(Envelope::new("rooms:1", events::LEAVE, json!({}), Some("2".into())));
        mux.handle_inbound(join("rooms:1", "3"));
        mux.handle_inbound(Envelope::new("rooms:1", "echo", json!({"n": 4}), Some("4".into())));
        assert!(!mux.is_joined("rooms:1"));

        let mut seen = Vec::new();
        for _ in 0..4 {
            let envelope = next_envelope(&mut mux, &mut rx).await;
            seen.push((envelope.event, envelope.reference));
        }
        assert_eq!(
            seen,
            vec![
                (events::REPLY.to_string(), Some("2".to_string())),
                (events::CLOSE.to_string(), None),
                (events::REPLY.to_string(), Some("3".to_string())),
                (events::REPLY.to_string(), Some("4".to_string())),
            ]
        );
        assert!(mux.is_joined("rooms:1"));
    }

    #[tokio::test]
    async fn test_leave_for_unjoined_topic_is_ignored() {
        let (mut mux, mut rx) = mux(UnmatchedTopic::Reject);
        mux.handle_inbound(Envelope::new("rooms:1", events::LEAVE, json!({}), Some("1".into())));
        mux.handle_inbound(join("rooms:1", "2"));

        let reply = next_envelope(&mut mux, &mut rx).await;
        assert_eq!(reply.reference.as_deref(), Some("2"));
        assert_eq!(reply.reply_status(), Some("ok"));
    }

    #[tokio::test]
    async fn test_fault_emits_error_and_spares_other_topics() {
        let (mut mux, mut rx) = mux(UnmatchedTopic::Reject);
        mux.handle_inbound(join("rooms:1", "1"));
        next_envelope(&mut mux, &mut rx).await;
        mux.handle_inbound(join("rooms:2", "2"));
        next_envelope(&mut mux, &mut rx).await;

        mux.handle_inbound(Envelope::new("rooms:1", "crash", json!({}), Some("3".into())));
        let error = next_envelope(&mut mux, &mut rx).await;
        assert_eq!(error.event, events::ERROR);
        assert_eq!(error.topic, "rooms:1");
        assert_eq!(error.payload, json!({}));

        mux.handle_inbound(Envelope::new("rooms:2", "echo", json!({"n": 2}), Some("4".into())));
        let reply = next_envelope(&mut mux, &mut rx).await;
        assert_eq!(reply.topic, "rooms:2");
        assert_eq!(reply.payload["response"]["n"], 2);
        assert_eq!(mux.session_count(), 1);
    }

    #[tokio::test]
    async fn test_rejoin_replaces_session_silently() {
        let (mut mux, mut rx) = mux(UnmatchedTopic::Reject);
        mux.handle_inbound(join("rooms:1", "1"));
        next_envelope(&mut mux, &mut rx).await;

        mux.handle_inbound(join("rooms:1", "2"));
        let reply = next_envelope(&mut mux, &mut rx).await;
        assert_eq!(reply.reference.as_deref(), Some("2"));
        assert!(mux.is_joined("rooms:1"));

        mux.handle_inbound(Envelope::new("rooms:1", "echo", json!({}), Some("3".into())));
        let reply = next_envelope(&mut mux, &mut rx).await;
        assert_eq!(reply.reference.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_close_all_emits_nothing() {
        let (mut mux, mut rx) = mux(UnmatchedTopic::Reject);
        mux.handle_inbound(join("rooms:1", "1"));
        next_envelope(&mut mux, &mut rx).await;

        mux.close_all();
        let outbound = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(
            outbound,
            Outbound::Exit {
                reason: StopReason::Closed,
                ..
            }
        ));
        assert!(mux.handle_outbound(outbound).is_none());
    }
}
