//! Channel sessions.
//!
//! A session is one tokio task per (connection, topic) pair. It owns the
//! channel instance and its [`Socket`], and is the only code that ever touches
//! them: inbound events, broadcasts and internal messages are all delivered
//! through its queues and handled one at a time.
//!
//! ```text
//!              ┌──────────── joining ────────────┐
//!   spawn ───▶ │ Channel::join                   │── refused / fault ──▶ exit
//!              └─────────────────────────────────┘
//!                         │ accepted: subscribe, reply "ok"
//!                         ▼
//!              ┌──────────── joined ─────────────┐
//!              │ handle_in / handle_out /        │── stop / leave / fault ──▶ terminate ──▶ exit
//!              │ handle_info                     │
//!              └─────────────────────────────────┘
//! ```
//!
//! Every exit is reported to the transport as [`Outbound::Exit`].

use crate::channel::{Channel, ChannelError, Join, Reply, StopReason};
use crate::pubsub::{Broadcast, PubSub, SubscriberId};
use crate::socket::{Outbound, Socket, TransportHandle};
use futures_util::FutureExt;
use herald_protocol::{events, status, Envelope};
use serde_json::{json, Value};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Lifecycle faults. Each one terminates the session abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A callback returned an error.
    #[error("{callback} failed: {reason}")]
    Callback {
        callback: &'static str,
        reason: String,
    },

    /// A callback panicked.
    #[error("{callback} panicked: {reason}")]
    Panic {
        callback: &'static str,
        reason: String,
    },

    /// A callback without a client ref tried to reply.
    #[error("{callback} returned a reply; replies are only allowed from handle_in")]
    ReplyOutsideHandleIn { callback: &'static str },
}

/// Session behavior switches.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Answer an ignored join with an `"ignore"` reply instead of silence.
    pub reply_on_decline: bool,
}

/// A client's request to join a topic.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub topic: String,
    pub payload: Value,
    pub reference: Option<String>,
}

pub(crate) enum Command {
    Inbound {
        event: String,
        payload: Value,
        reference: Option<String>,
    },
    Info(Value),
    Shutdown(StopReason),
}

/// The transport's routing reference to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SubscriberId,
    topic: String,
    tx: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    /// The session identity.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// The joined topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Deliver a client event. Returns `false` if the session has exited.
    pub fn deliver_inbound(
        &self,
        event: impl Into<String>,
        payload: Value,
        reference: Option<String>,
    ) -> bool {
        self.tx
            .send(Command::Inbound {
                event: event.into(),
                payload,
                reference,
            })
            .is_ok()
    }

    /// Deliver an internal message to `handle_info`.
    pub fn deliver_system(&self, message: Value) -> bool {
        self.tx.send(Command::Info(message)).is_ok()
    }

    /// Ask the session to stop with `reason`.
    pub fn shutdown(&self, reason: StopReason) -> bool {
        self.tx.send(Command::Shutdown(reason)).is_ok()
    }

    /// Whether the session task is still accepting commands.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Start a session task for `request`.
///
/// `channel_name` is the route pattern that resolved the topic.
pub fn spawn(
    channel_name: impl Into<String>,
    channel: Box<dyn Channel>,
    request: JoinRequest,
    transport: TransportHandle,
    pubsub: Arc<PubSub>,
    config: SessionConfig,
) -> SessionHandle {
    let id = SubscriberId::next();
    let (tx, rx) = mpsc::unbounded_channel();
    let socket = Socket::new(
        request.topic.clone(),
        channel_name.into(),
        id,
        transport,
        pubsub,
        tx.downgrade(),
    );

    let handle = SessionHandle {
        id,
        topic: request.topic.clone(),
        tx,
    };

    let session = Session {
        channel,
        socket,
        config,
    };
    tokio::spawn(session.run(request, rx));

    handle
}

enum JoinOutcome {
    Accepted {
        reference: Option<String>,
        response: Value,
    },
    Refused(StopReason),
}

struct Session {
    channel: Box<dyn Channel>,
    socket: Socket,
    config: SessionConfig,
}

impl Session {
    async fn run(mut self, request: JoinRequest, mut commands: mpsc::UnboundedReceiver<Command>) {
        let (mailbox, mut inbox) = mpsc::unbounded_channel();

        let reason = match self.join(request).await {
            JoinOutcome::Accepted {
                reference,
                response,
            } => {
                let pubsub = Arc::clone(self.socket.pubsub());
                let subscription = pubsub
                    .subscribe(self.socket.topic(), self.socket.id(), mailbox)
                    .await;

                self.reply(reference, status::OK, response);
                self.socket.mark_joined();
                debug!(
                    topic = %self.socket.topic(),
                    connection = %self.socket.transport().connection_id(),
                    "Joined"
                );

                let reason = self.event_loop(&mut commands, &mut inbox).await;
                self.terminate(&reason).await;
                drop(subscription);
                reason
            }
            JoinOutcome::Refused(reason) => reason,
        };

        commands.close();

        if reason.is_abnormal() {
            warn!(
                topic = %self.socket.topic(),
                connection = %self.socket.transport().connection_id(),
                reason = %reason,
                "Channel exited abnormally"
            );
        } else {
            debug!(topic = %self.socket.topic(), reason = %reason, "Channel exited");
        }

        self.socket.transport().send(Outbound::Exit {
            topic: self.socket.topic().to_string(),
            session: self.socket.id(),
            reason,
        });
    }

    async fn join(&mut self, request: JoinRequest) -> JoinOutcome {
        let JoinRequest {
            topic,
            payload,
            reference,
        } = request;

        self.socket.set_reference(reference.clone());
        let result = guarded("join", self.channel.join(&topic, payload, &mut self.socket)).await;
        self.socket.set_reference(None);

        match result {
            Ok(Join::Ok(response)) => JoinOutcome::Accepted {
                reference,
                response,
            },
            Ok(Join::Error(response)) => {
                self.socket.discard_pending();
                self.reply(reference, status::ERROR, response);
                JoinOutcome::Refused(StopReason::Declined)
            }
            Ok(Join::Ignore) => {
                self.socket.discard_pending();
                if self.config.reply_on_decline {
                    self.reply(reference, status::IGNORE, json!({}));
                }
                JoinOutcome::Refused(StopReason::Declined)
            }
            Err(e) => {
                self.socket.discard_pending();
                JoinOutcome::Refused(self.fault(e))
            }
        }
    }

    async fn event_loop(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        inbox: &mut mpsc::UnboundedReceiver<Arc<Broadcast>>,
    ) -> StopReason {
        loop {
            let step = tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Inbound { event, payload, reference }) => {
                        self.handle_inbound(event, payload, reference).await
                    }
                    Some(Command::Info(message)) => self.handle_info(message).await,
                    Some(Command::Shutdown(reason)) => Some(reason),
                    None => Some(StopReason::Closed),
                },

                Some(message) = inbox.recv() => self.handle_broadcast(&message).await,
            };

            if let Some(reason) = step {
                return reason;
            }
        }
    }

    async fn handle_inbound(
        &mut self,
        event: String,
        payload: Value,
        reference: Option<String>,
    ) -> Option<StopReason> {
        if event == events::LEAVE {
            if reference.is_some() {
                self.reply(reference, status::OK, json!({}));
            }
            return Some(StopReason::Leave);
        }

        self.socket.set_reference(reference.clone());
        let result = guarded(
            "handle_in",
            self.channel.handle_in(&event, payload, &mut self.socket),
        )
        .await;
        self.socket.set_reference(None);

        match result {
            Err(e) => Some(self.fault(e)),
            Ok(Reply::NoReply) => None,
            Ok(Reply::Reply { status, response }) => {
                self.reply(reference, status, response);
                None
            }
            Ok(Reply::Stop { reason }) => Some(reason),
            Ok(Reply::StopReply {
                reason,
                status,
                response,
            }) => {
                self.reply(reference, status, response);
                Some(reason)
            }
        }
    }

    async fn handle_broadcast(&mut self, message: &Broadcast) -> Option<StopReason> {
        let result = guarded(
            "handle_out",
            self.channel
                .handle_out(&message.event, message.payload.clone(), &mut self.socket),
        )
        .await;
        self.without_reply("handle_out", result)
    }

    async fn handle_info(&mut self, message: Value) -> Option<StopReason> {
        let result = guarded(
            "handle_info",
            self.channel.handle_info(message, &mut self.socket),
        )
        .await;
        self.without_reply("handle_info", result)
    }

    fn without_reply(
        &self,
        callback: &'static str,
        result: Result<Reply, SessionError>,
    ) -> Option<StopReason> {
        match result {
            Err(e) => Some(self.fault(e)),
            Ok(Reply::NoReply) => None,
            Ok(Reply::Stop { reason }) => Some(reason),
            Ok(Reply::Reply { .. } | Reply::StopReply { .. }) => {
                Some(self.fault(SessionError::ReplyOutsideHandleIn { callback }))
            }
        }
    }

    async fn terminate(&mut self, reason: &StopReason) {
        let channel = &mut self.channel;
        let socket = &mut self.socket;
        let hook = async move {
            channel.terminate(reason, socket).await;
            Ok::<(), ChannelError>(())
        };
        if let Err(e) = guarded("terminate", hook).await {
            warn!(topic = %self.socket.topic(), error = %e, "Cleanup hook failed");
        }
    }

    fn reply(&self, reference: Option<String>, status: impl Into<String>, response: Value) {
        match reference {
            Some(reference) => {
                let envelope = Envelope::reply(self.socket.topic(), reference, status, response);
                self.socket.transport().send_envelope(envelope);
            }
            None => {
                warn!(topic = %self.socket.topic(), "Dropping reply to an event without ref");
            }
        }
    }

    fn fault(&self, error: SessionError) -> StopReason {
        warn!(
            topic = %self.socket.topic(),
            connection = %self.socket.transport().connection_id(),
            error = %error,
            "Channel fault"
        );
        StopReason::Error(error.to_string())
    }
}

/// Run a callback, turning errors and panics into [`SessionError`]s.
async fn guarded<T, F>(callback: &'static str, future: F) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, ChannelError>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(SessionError::Callback {
            callback,
            reason: e.to_string(),
        }),
        Err(panic) => Err(SessionError::Panic {
            callback,
            reason: panic_message(panic.as_ref()),
        }),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
