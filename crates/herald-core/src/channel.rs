//! The channel callback interface.
//!
//! Application code implements [`Channel`] once per kind of topic and
//! registers a factory for it in the [`ChannelRouter`](crate::ChannelRouter).
//! Every join creates a fresh instance, owned by its own session task, so
//! `&mut self` is never shared.

use crate::socket::Socket;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// A fault raised by a channel callback.
///
/// Returning one terminates the session abnormally; the client sees
/// `phx_error`.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ChannelError(String);

impl ChannelError {
    /// Create an error with a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

/// Outcome of a join attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Join {
    /// Accept; reply `"ok"` with the given response.
    Ok(Value),
    /// Refuse; reply `"error"` with the given response.
    Error(Value),
    /// Decline without an error reply.
    Ignore,
}

impl Join {
    /// Accept with an empty response.
    #[must_use]
    pub fn ok() -> Self {
        Join::Ok(json!({}))
    }

    /// Refuse with `{"reason": reason}`.
    #[must_use]
    pub fn error(reason: impl Into<String>) -> Self {
        Join::Error(json!({ "reason": reason.into() }))
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The channel chose to stop.
    Normal,
    /// The client left the topic.
    Leave,
    /// The session was replaced or the server is shutting down.
    Shutdown,
    /// The owning transport went away.
    Closed,
    /// The join was refused or ignored.
    Declined,
    /// A fault: callback error, panic, or protocol misuse.
    Error(String),
}

impl StopReason {
    /// Whether this exit must be reported to the client as `phx_error`.
    #[must_use]
    pub fn is_abnormal(&self) -> bool {
        matches!(self, StopReason::Error(_))
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Normal => write!(f, "normal"),
            StopReason::Leave => write!(f, "leave"),
            StopReason::Shutdown => write!(f, "shutdown"),
            StopReason::Closed => write!(f, "closed"),
            StopReason::Declined => write!(f, "declined"),
            StopReason::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Result of `handle_in`, `handle_out` and `handle_info`.
///
/// `Reply` and `StopReply` are only legal from `handle_in`, where there is a
/// client ref to answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    NoReply,
    Reply { status: String, response: Value },
    Stop { reason: StopReason },
    StopReply {
        reason: StopReason,
        status: String,
        response: Value,
    },
}

impl Reply {
    /// Reply `"ok"` with a response.
    #[must_use]
    pub fn ok(response: Value) -> Self {
        Reply::Reply {
            status: herald_protocol::status::OK.to_string(),
            response,
        }
    }

    /// Reply `"error"` with a response.
    #[must_use]
    pub fn error(response: Value) -> Self {
        Reply::Reply {
            status: herald_protocol::status::ERROR.to_string(),
            response,
        }
    }

    /// Stop without replying.
    #[must_use]
    pub fn stop(reason: StopReason) -> Self {
        Reply::Stop { reason }
    }

    /// Whether this result carries a reply.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        matches!(self, Reply::Reply { .. } | Reply::StopReply { .. })
    }
}

/// Callbacks for one joined topic.
#[async_trait]
pub trait Channel: Send + 'static {
    /// Authorize a join. Runs before the session subscribes to the topic.
    async fn join(
        &mut self,
        topic: &str,
        payload: Value,
        socket: &mut Socket,
    ) -> Result<Join, ChannelError>;

    /// Handle an event sent by the client.
    async fn handle_in(
        &mut self,
        event: &str,
        payload: Value,
        socket: &mut Socket,
    ) -> Result<Reply, ChannelError>;

    /// Intercept a broadcast before it is pushed to this client.
    ///
    /// The default forwards it unchanged.
    async fn handle_out(
        &mut self,
        event: &str,
        payload: Value,
        socket: &mut Socket,
    ) -> Result<Reply, ChannelError> {
        socket.push(event, payload);
        Ok(Reply::NoReply)
    }

    /// Handle an internal message, e.g. one scheduled with
    /// [`Socket::send_info`].
    async fn handle_info(
        &mut self,
        message: Value,
        socket: &mut Socket,
    ) -> Result<Reply, ChannelError> {
        debug!(topic = %socket.topic(), message = %message, "Unhandled info message");
        Ok(Reply::NoReply)
    }

    /// Cleanup hook, run once when a joined session stops.
    async fn terminate(&mut self, _reason: &StopReason, _socket: &mut Socket) {}
}

/// Creates a fresh [`Channel`] for every join.
pub trait ChannelFactory: Send + Sync {
    fn create(&self) -> Box<dyn Channel>;
}

impl<F, C> ChannelFactory for F
where
    F: Fn() -> C + Send + Sync,
    C: Channel,
{
    fn create(&self) -> Box<dyn Channel> {
        Box::new(self())
    }
}
