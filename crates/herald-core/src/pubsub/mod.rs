//! Topic-scoped publish/subscribe.
//!
//! [`PubSub`] always delivers through its [`LocalRegistry`]; cross-node
//! replication is delegated to an optional [`Adapter`]. Local delivery never
//! waits on the adapter's health: remote fan-out is best-effort and
//! at-most-once.
//!
//! ```text
//! broadcast ──▶ LocalRegistry ──▶ local subscriber mailboxes
//!     │
//!     └──────▶ Adapter ──▶ other nodes' LocalRegistry
//! ```

mod cluster;
mod registry;

pub use cluster::{ClusterAdapter, MemoryCluster};
pub use registry::LocalRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Sending half of a subscriber's broadcast inbox.
pub type Mailbox = mpsc::UnboundedSender<Arc<Broadcast>>;

/// Receiving half of a subscriber's broadcast inbox.
pub type Inbox = mpsc::UnboundedReceiver<Arc<Broadcast>>;

static NEXT_SUBSCRIBER: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique identity of a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Allocate a fresh identity.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_SUBSCRIBER.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

/// A message fanned out to every subscriber of a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broadcast {
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

impl Broadcast {
    /// Create a new broadcast.
    #[must_use]
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }
}

/// Adapter errors. Never surfaced to broadcasters.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// One or more remote nodes could not be reached.
    #[error("Unreachable nodes: {0:?}")]
    Unreachable(Vec<String>),

    /// Backend-specific failure.
    #[error("Adapter error: {0}")]
    Backend(String),
}

/// Cross-node replication strategy.
///
/// Every method must accept any topic string and any message.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Adapter name for logging.
    fn name(&self) -> &'static str;

    /// Record interest of a local subscriber in `topic`.
    async fn subscribe(&self, topic: &str, subscriber: SubscriberId) -> Result<(), AdapterError>;

    /// Drop interest of a local subscriber in `topic`.
    async fn unsubscribe(&self, topic: &str, subscriber: SubscriberId)
        -> Result<(), AdapterError>;

    /// Replicate a broadcast to other nodes.
    async fn broadcast(&self, topic: &str, message: &Broadcast) -> Result<(), AdapterError>;

    /// Replicate a broadcast to other nodes, excluding `sender`.
    async fn broadcast_from(
        &self,
        sender: SubscriberId,
        topic: &str,
        message: &Broadcast,
    ) -> Result<(), AdapterError>;
}

/// The pub/sub dispatcher of one node.
pub struct PubSub {
    name: String,
    local: Arc<LocalRegistry>,
    adapter: Option<Arc<dyn Adapter>>,
}

impl PubSub {
    /// Create a node-local dispatcher.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_registry(name, Arc::new(LocalRegistry::new()), None)
    }

    /// Create a dispatcher that replicates through `adapter`.
    #[must_use]
    pub fn with_adapter(name: impl Into<String>, adapter: Arc<dyn Adapter>) -> Self {
        Self::with_registry(name, Arc::new(LocalRegistry::new()), Some(adapter))
    }

    pub(crate) fn with_registry(
        name: impl Into<String>,
        local: Arc<LocalRegistry>,
        adapter: Option<Arc<dyn Adapter>>,
    ) -> Self {
        let name = name.into();
        info!(
            pubsub = %name,
            adapter = adapter.as_ref().map(|a| a.name()).unwrap_or("local"),
            "Creating pubsub"
        );
        Self {
            name,
            local,
            adapter,
        }
    }

    /// The pubsub server name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The local registry.
    #[must_use]
    pub fn local(&self) -> &Arc<LocalRegistry> {
        &self.local
    }

    /// Subscribe `subscriber` to `topic`, delivering into `mailbox`.
    ///
    /// Idempotent. The registration lives as long as the returned guard.
    pub async fn subscribe(
        &self,
        topic: &str,
        subscriber: SubscriberId,
        mailbox: Mailbox,
    ) -> Subscription {
        self.local.subscribe(topic, subscriber, mailbox);
        if let Some(adapter) = &self.adapter {
            if let Err(e) = adapter.subscribe(topic, subscriber).await {
                warn!(pubsub = %self.name, topic = %topic, error = %e, "Adapter subscribe failed");
            }
        }
        Subscription {
            topic: topic.to_string(),
            subscriber,
            local: Arc::clone(&self.local),
            adapter: self.adapter.clone(),
        }
    }

    /// Remove one registration. Idempotent.
    pub async fn unsubscribe(&self, topic: &str, subscriber: SubscriberId) {
        self.local.unsubscribe(topic, subscriber);
        if let Some(adapter) = &self.adapter {
            if let Err(e) = adapter.unsubscribe(topic, subscriber).await {
                warn!(pubsub = %self.name, topic = %topic, error = %e, "Adapter unsubscribe failed");
            }
        }
    }

    /// Deliver to every subscriber of the message's topic.
    ///
    /// Returns the number of local recipients.
    pub async fn broadcast(&self, message: Broadcast) -> usize {
        let message = Arc::new(message);
        let delivered = self.local.dispatch(&message.topic, &message, None);
        if let Some(adapter) = &self.adapter {
            if let Err(e) = adapter.broadcast(&message.topic, &message).await {
                debug!(pubsub = %self.name, topic = %message.topic, error = %e, "Remote broadcast incomplete");
            }
        }
        delivered
    }

    /// Deliver to every subscriber of the message's topic except `sender`.
    ///
    /// Returns the number of local recipients.
    pub async fn broadcast_from(&self, sender: SubscriberId, message: Broadcast) -> usize {
        let message = Arc::new(message);
        let delivered = self.local.dispatch(&message.topic, &message, Some(sender));
        if let Some(adapter) = &self.adapter {
            if let Err(e) = adapter.broadcast_from(sender, &message.topic, &message).await {
                debug!(pubsub = %self.name, topic = %message.topic, error = %e, "Remote broadcast incomplete");
            }
        }
        delivered
    }

    /// Number of local subscribers of `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.local.subscriber_count(topic)
    }

    /// Topics with local subscribers.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.local.topics()
    }

    /// Pub/sub statistics.
    #[must_use]
    pub fn stats(&self) -> PubSubStats {
        PubSubStats {
            topic_count: self.local.topics().len(),
            subscription_count: self.local.subscription_count(),
        }
    }
}

impl fmt::Debug for PubSub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSub")
            .field("name", &self.name)
            .field("adapter", &self.adapter.as_ref().map(|a| a.name()))
            .finish()
    }
}

/// Pub/sub statistics.
#[derive(Debug, Clone)]
pub struct PubSubStats {
    /// Number of topics with local subscribers.
    pub topic_count: usize,
    /// Total number of local registrations.
    pub subscription_count: usize,
}

/// A live registration. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    topic: String,
    subscriber: SubscriberId,
    local: Arc<LocalRegistry>,
    adapter: Option<Arc<dyn Adapter>>,
}

impl Subscription {
    /// The subscribed topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The subscriber identity.
    #[must_use]
    pub fn subscriber(&self) -> SubscriberId {
        self.subscriber
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("subscriber", &self.subscriber)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.local.unsubscribe(&self.topic, self.subscriber);

        let Some(adapter) = self.adapter.take() else {
            return;
        };
        // The adapter call is async; hand it to the runtime if there is one.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let topic = std::mem::take(&mut self.topic);
            let subscriber = self.subscriber;
            handle.spawn(async move {
                if let Err(e) = adapter.unsubscribe(&topic, subscriber).await {
                    warn!(topic = %topic, error = %e, "Adapter unsubscribe failed");
                }
            });
        }
    }
}
