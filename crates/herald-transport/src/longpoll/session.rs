//! The task behind one long-poll session.
//!
//! Each session owns its [`ChannelMux`], the buffer of envelopes waiting for
//! the next poll, and at most one parked poll. HTTP handlers only talk to it
//! through [`PollSessionHandle`], so a waiting request holds no shared lock.

use crate::metrics::ConnectionMetricsGuard;
use crate::mux::ChannelMux;
use dashmap::DashMap;
use herald_core::Outbound;
use herald_protocol::Envelope;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace};

/// Session timing.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Timing {
    /// Inactivity budget before the session expires.
    pub window: Duration,
    /// How long a poll is parked before answering empty.
    pub poll_timeout: Duration,
}

pub(crate) enum Command {
    /// Drain the buffer, or park until something arrives.
    Poll(oneshot::Sender<Vec<Envelope>>),
    /// Route one client envelope; acked once routed.
    Publish(Envelope, oneshot::Sender<()>),
    /// End the session now.
    Close,
}

/// Handle kept in the session table.
#[derive(Debug, Clone)]
pub(crate) struct PollSessionHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl PollSessionHandle {
    /// Returns `None` if the session is gone.
    pub fn poll(&self) -> Option<oneshot::Receiver<Vec<Envelope>>> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(Command::Poll(tx)).ok()?;
        Some(rx)
    }

    /// Returns `None` if the session is gone.
    pub fn publish(&self, envelope: Envelope) -> Option<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(Command::Publish(envelope, tx)).ok()?;
        Some(rx)
    }

    pub fn close(&self) -> bool {
        self.tx.send(Command::Close).is_ok()
    }
}

pub(crate) struct PollSession {
    token: String,
    mux: ChannelMux,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    commands: mpsc::UnboundedReceiver<Command>,
    buffer: VecDeque<Envelope>,
    waiter: Option<oneshot::Sender<Vec<Envelope>>>,
    timing: Timing,
    deadline: Instant,
    poll_deadline: Instant,
    sessions: Arc<DashMap<String, PollSessionHandle>>,
}

impl PollSession {
    /// Register a session under `token` and start its task.
    pub fn start(
        token: String,
        mux: ChannelMux,
        outbound: mpsc::UnboundedReceiver<Outbound>,
        timing: Timing,
        sessions: Arc<DashMap<String, PollSessionHandle>>,
    ) {
        let (tx, commands) = mpsc::unbounded_channel();
        sessions.insert(token.clone(), PollSessionHandle { tx });

        let now = Instant::now();
        let session = Self {
            token,
            mux,
            outbound,
            commands,
            buffer: VecDeque::new(),
            waiter: None,
            timing,
            deadline: now + timing.window,
            poll_deadline: now,
            sessions,
        };
        tokio::spawn(session.run());
    }

    async fn run(mut self) {
        let _metrics = ConnectionMetricsGuard::longpoll_session();
        info!(session = %self.token, "Long-poll session opened");

        loop {
            let parked = self.waiter.is_some();
            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    if self.is_expired() {
                        break;
                    }
                    if !self.serve(command) {
                        debug!(session = %self.token, "Long-poll session closed by client");
                        break;
                    }
                }

                Some(item) = self.outbound.recv() => {
                    if let Some(envelope) = self.mux.handle_outbound(item) {
                        self.buffer.push_back(envelope);
                        if self.waiter.is_some() {
                            self.answer();
                        }
                    }
                }

                () = sleep_until(self.poll_deadline), if parked => {
                    self.answer();
                }

                () = sleep_until(self.deadline), if !parked => {
                    break;
                }
            }
        }

        info!(session = %self.token, buffered = self.buffer.len(), "Long-poll session ended");
        self.sessions.remove(&self.token);
        self.mux.close_all();
    }

    /// A parked poll keeps the session alive; otherwise the window decides.
    fn is_expired(&self) -> bool {
        self.waiter.is_none() && Instant::now() >= self.deadline
    }

    fn touch(&mut self) {
        self.deadline = Instant::now() + self.timing.window;
    }

    /// Returns `false` when the session should end.
    fn serve(&mut self, command: Command) -> bool {
        match command {
            Command::Poll(waiter) => {
                self.touch();
                if let Some(previous) = self.waiter.replace(waiter) {
                    trace!(session = %self.token, "Superseding parked poll");
                    let _ = previous.send(Vec::new());
                }
                if self.buffer.is_empty() {
                    self.poll_deadline = Instant::now() + self.timing.poll_timeout;
                } else {
                    self.answer();
                }
                true
            }
            Command::Publish(envelope, ack) => {
                self.touch();
                self.mux.handle_inbound(envelope);
                let _ = ack.send(());
                true
            }
            Command::Close => false,
        }
    }

    /// Hand the whole buffer to the parked poll.
    ///
    /// If the poll went away in the meantime the batch stays buffered.
    fn answer(&mut self) {
        let Some(waiter) = self.waiter.take() else {
            return;
        };
        let batch: Vec<Envelope> = self.buffer.drain(..).collect();
        let count = batch.len();
        if let Err(batch) = waiter.send(batch) {
            self.buffer.extend(batch);
            trace!(session = %self.token, "Parked poll gone, keeping buffer");
        } else {
            trace!(session = %self.token, count, "Answered poll");
        }
        self.touch();
    }
}
