//! Local topic registry.
//!
//! Maps each topic to the mailboxes of the subscribers on this node. Reads
//! (dispatch) run concurrently; writes are serialized per shard by `DashMap`.

use super::{Broadcast, Mailbox, SubscriberId};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Per-node mapping from topic to subscriber mailboxes.
#[derive(Debug, Default)]
pub struct LocalRegistry {
    topics: DashMap<String, HashMap<SubscriberId, Mailbox>>,
}

impl LocalRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` for `topic`.
    ///
    /// Returns `false` if `id` was already registered; the existing mailbox is
    /// kept.
    pub fn subscribe(&self, topic: &str, id: SubscriberId, mailbox: Mailbox) -> bool {
        let mut entry = self.topics.entry(topic.to_string()).or_default();
        if entry.contains_key(&id) {
            return false;
        }
        entry.insert(id, mailbox);
        debug!(topic = %topic, subscriber = %id, subscribers = entry.len(), "Subscribed");
        true
    }

    /// Remove the registration of `id` for `topic`.
    ///
    /// Returns `true` if a registration was removed.
    pub fn unsubscribe(&self, topic: &str, id: SubscriberId) -> bool {
        let Some(mut entry) = self.topics.get_mut(topic) else {
            return false;
        };
        let removed = entry.remove(&id).is_some();
        let empty = entry.is_empty();
        drop(entry); // Release the shard lock

        if empty {
            self.topics.remove_if(topic, |_, subscribers| subscribers.is_empty());
            debug!(topic = %topic, "Removed empty topic");
        }
        if removed {
            debug!(topic = %topic, subscriber = %id, "Unsubscribed");
        }
        removed
    }

    /// Deliver `message` to every subscriber of `topic` except `exclude`.
    ///
    /// All sends happen under the entry's read lock, so one call observes a
    /// single consistent subscriber set. Subscribers whose mailbox is closed
    /// are pruned afterwards.
    pub fn dispatch(
        &self,
        topic: &str,
        message: &Arc<Broadcast>,
        exclude: Option<SubscriberId>,
    ) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();

        if let Some(entry) = self.topics.get(topic) {
            for (id, mailbox) in entry.iter() {
                if Some(*id) == exclude {
                    continue;
                }
                if mailbox.send(Arc::clone(message)).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(*id);
                }
            }
        }

        for id in dead {
            debug!(topic = %topic, subscriber = %id, "Pruning dead subscriber");
            self.unsubscribe(topic, id);
        }

        trace!(topic = %topic, recipients = delivered, "Dispatched broadcast");
        delivered
    }

    /// Check whether `id` is registered for `topic`.
    #[must_use]
    pub fn is_subscribed(&self, topic: &str, id: SubscriberId) -> bool {
        self.topics
            .get(topic)
            .map(|e| e.contains_key(&id))
            .unwrap_or(false)
    }

    /// Number of subscribers of `topic`.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|e| e.len()).unwrap_or(0)
    }

    /// All topics with at least one subscriber.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.topics.iter().map(|e| e.key().clone()).collect()
    }

    /// Total number of registrations.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.topics.iter().map(|e| e.len()).sum()
    }
}
