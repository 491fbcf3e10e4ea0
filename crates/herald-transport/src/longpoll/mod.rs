//! Long-poll transport.
//!
//! Clients without a usable WebSocket keep a session alive by polling:
//!
//! ```text
//! GET  (no token)        ──▶ {status: 204, token, sig}      new session
//! GET  ?token&sig        ──▶ {status: 200, messages: [..]}  buffered envelopes
//!                        ──▶ {status: 204}                  nothing within poll_timeout
//!                        ──▶ {status: 410, token, sig}      expired / unknown / forged; replaced
//! POST ?token&sig  <env> ──▶ {status: 200}                  routed; output goes to the buffer
//! ```
//!
//! Every successful poll or publish slides the session window forward. A POST
//! or DELETE with an unusable token gets a bare `{status: 410}`.

mod session;
mod token;

pub use token::{TokenSigner, TOKEN_BYTES};

use crate::mux::{ChannelMux, MuxConfig};
use crate::origin::CheckOrigin;
use dashmap::DashMap;
use herald_core::{ChannelRouter, PubSub, TransportHandle};
use herald_protocol::{Envelope, ProtocolError};
use serde::{Deserialize, Serialize};
use session::{PollSession, PollSessionHandle, Timing};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Extra time a handler waits beyond `poll_timeout` for the session to answer.
const POLL_GRACE: Duration = Duration::from_secs(5);

/// Upper bound for `window` and `poll_timeout`.
pub const MAX_TIMING: Duration = Duration::from_secs(24 * 60 * 60);

/// Long-poll errors.
#[derive(Debug, Error)]
pub enum LongPollError {
    /// The secret key base cannot key the signer.
    #[error("Invalid secret key base")]
    InvalidSecret,

    /// The request origin is not allowed.
    #[error("Origin not allowed")]
    Forbidden,

    /// The token is unknown, expired, forged or missing its signature.
    #[error("Session gone")]
    Gone,

    /// The request body is not an envelope.
    #[error("Malformed envelope: {0}")]
    BadEnvelope(#[from] ProtocolError),
}

impl LongPollError {
    /// The status reported in the response body.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            LongPollError::InvalidSecret => 500,
            LongPollError::Forbidden => 403,
            LongPollError::Gone => 410,
            LongPollError::BadEnvelope(_) => 400,
        }
    }
}

/// Long-poll settings.
#[derive(Debug, Clone)]
pub struct LongPollConfig {
    /// Inactivity budget before a session expires.
    pub window: Duration,
    /// How long an empty poll waits for content.
    pub poll_timeout: Duration,
    /// Per-session multiplexer settings.
    pub mux: MuxConfig,
}

impl Default for LongPollConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            poll_timeout: Duration::from_secs(10),
            mux: MuxConfig::default(),
        }
    }
}

/// `token` / `sig` query parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollParams {
    pub token: Option<String>,
    pub sig: Option<String>,
}

/// Response body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollReply {
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Envelope>>,
}

impl PollReply {
    /// A bare status.
    #[must_use]
    pub fn status(status: u16) -> Self {
        Self {
            status,
            token: None,
            sig: None,
            messages: None,
        }
    }

    fn with_session(status: u16, (token, sig): (String, String)) -> Self {
        Self {
            token: Some(token),
            sig: Some(sig),
            ..Self::status(status)
        }
    }

    fn messages(messages: Vec<Envelope>) -> Self {
        Self {
            messages: Some(messages),
            ..Self::status(200)
        }
    }
}

impl From<LongPollError> for PollReply {
    fn from(e: LongPollError) -> Self {
        Self::status(e.status())
    }
}

/// The long-poll endpoint state, shared by all requests.
#[derive(Debug)]
pub struct LongPoll {
    sessions: Arc<DashMap<String, PollSessionHandle>>,
    signer: TokenSigner,
    router: Arc<ChannelRouter>,
    pubsub: Arc<PubSub>,
    check_origin: CheckOrigin,
    config: LongPollConfig,
}

impl LongPoll {
    /// Create the endpoint state.
    ///
    /// `window` and `poll_timeout` are capped at [`MAX_TIMING`].
    #[must_use]
    pub fn new(
        signer: TokenSigner,
        router: Arc<ChannelRouter>,
        pubsub: Arc<PubSub>,
        check_origin: CheckOrigin,
        mut config: LongPollConfig,
    ) -> Self {
        config.window = config.window.min(MAX_TIMING);
        config.poll_timeout = config.poll_timeout.min(MAX_TIMING);
        Self {
            sessions: Arc::new(DashMap::new()),
            signer,
            router,
            pubsub,
            check_origin,
            config,
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Handle a GET: open a session, or drain / wait on an existing one.
    ///
    /// An unusable token is answered with `410` and the token of a fresh
    /// session, so the client can continue without another round trip.
    ///
    /// # Errors
    ///
    /// Returns [`LongPollError::Forbidden`] for a refused origin.
    pub async fn poll(
        &self,
        origin: Option<&str>,
        params: &PollParams,
    ) -> Result<PollReply, LongPollError> {
        self.check_origin(origin)?;

        if params.token.is_none() {
            return Ok(PollReply::with_session(204, self.open()));
        }

        let Some(rx) = self.session(params).ok().and_then(|s| s.poll()) else {
            return Ok(self.replace());
        };
        match timeout(self.config.poll_timeout + POLL_GRACE, rx).await {
            Ok(Ok(messages)) if messages.is_empty() => Ok(PollReply::status(204)),
            Ok(Ok(messages)) => {
                debug!(count = messages.len(), "Delivering buffered envelopes");
                Ok(PollReply::messages(messages))
            }
            Ok(Err(_)) => Ok(self.replace()),
            Err(_) => Ok(PollReply::status(204)),
        }
    }

    /// Handle a POST carrying one envelope.
    ///
    /// # Errors
    ///
    /// Returns [`LongPollError::Forbidden`] for a refused origin,
    /// [`LongPollError::Gone`] for an unusable token and
    /// [`LongPollError::BadEnvelope`] if the body does not decode.
    pub async fn publish(
        &self,
        origin: Option<&str>,
        params: &PollParams,
        body: &[u8],
    ) -> Result<PollReply, LongPollError> {
        self.check_origin(origin)?;
        let session = self.session(params)?;

        let envelope = herald_protocol::decode(body).map_err(|e| {
            warn!(error = %e, "Rejecting malformed long-poll envelope");
            e
        })?;
        crate::metrics::record_message(body.len(), "inbound");

        let ack = session.publish(envelope).ok_or(LongPollError::Gone)?;
        ack.await.map_err(|_| LongPollError::Gone)?;
        Ok(PollReply::status(200))
    }

    /// Handle a DELETE: end the session now.
    ///
    /// # Errors
    ///
    /// Returns [`LongPollError::Forbidden`] for a refused origin and
    /// [`LongPollError::Gone`] for an unusable token.
    pub fn close(
        &self,
        origin: Option<&str>,
        params: &PollParams,
    ) -> Result<PollReply, LongPollError> {
        self.check_origin(origin)?;
        if self.session(params)?.close() {
            Ok(PollReply::status(200))
        } else {
            Err(LongPollError::Gone)
        }
    }

    fn check_origin(&self, origin: Option<&str>) -> Result<(), LongPollError> {
        if self.check_origin.is_allowed(origin) {
            Ok(())
        } else {
            Err(LongPollError::Forbidden)
        }
    }

    /// Start a session and return its `(token, sig)`.
    fn open(&self) -> (String, String) {
        let (token, sig) = self.signer.generate();
        let (transport, outbound) = TransportHandle::channel(&format!("lp_{token}"));
        let mux = ChannelMux::new(
            transport,
            Arc::clone(&self.router),
            Arc::clone(&self.pubsub),
            self.config.mux.clone(),
        );
        let timing = Timing {
            window: self.config.window,
            poll_timeout: self.config.poll_timeout,
        };
        PollSession::start(token.clone(), mux, outbound, timing, Arc::clone(&self.sessions));
        (token, sig)
    }

    fn replace(&self) -> PollReply {
        debug!("Replacing unusable long-poll token");
        PollReply::with_session(LongPollError::Gone.status(), self.open())
    }

    /// Resolve a verified token to its session handle.
    fn session(&self, params: &PollParams) -> Result<PollSessionHandle, LongPollError> {
        let (Some(token), Some(sig)) = (params.token.as_deref(), params.sig.as_deref()) else {
            return Err(LongPollError::Gone);
        };
        if !self.signer.verify(token, sig) {
            warn!("Rejecting long-poll token with bad signature");
            return Err(LongPollError::Gone);
        }
        self.sessions
            .get(token)
            .map(|entry| entry.value().clone())
            .ok_or(LongPollError::Gone)
    }
}
