//! In-process multi-node adapter.
//!
//! [`MemoryCluster`] wires several [`PubSub`] nodes living in one process so
//! that a broadcast on one node reaches subscribers on the others. Nodes can
//! be marked unreachable to exercise best-effort delivery.

use super::{Adapter, AdapterError, Broadcast, LocalRegistry, PubSub, SubscriberId};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

#[derive(Debug, Default)]
struct Hub {
    nodes: DashMap<String, Weak<LocalRegistry>>,
    unreachable: DashSet<String>,
}

/// A set of in-process nodes sharing broadcasts.
#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
    hub: Arc<Hub>,
}

impl MemoryCluster {
    /// Create an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new node named `node` and return its dispatcher.
    pub fn join(&self, node: impl Into<String>) -> Arc<PubSub> {
        let node = node.into();
        let registry = Arc::new(LocalRegistry::new());
        self.hub
            .nodes
            .insert(node.clone(), Arc::downgrade(&registry));

        let adapter = Arc::new(ClusterAdapter {
            node: node.clone(),
            hub: Arc::clone(&self.hub),
        });
        debug!(node = %node, "Node joined cluster");
        Arc::new(PubSub::with_registry(node, registry, Some(adapter)))
    }

    /// Mark a node as reachable or not.
    pub fn set_reachable(&self, node: &str, reachable: bool) {
        if reachable {
            self.hub.unreachable.remove(node);
        } else {
            self.hub.unreachable.insert(node.to_string());
        }
    }

    /// Names of all nodes.
    #[must_use]
    pub fn nodes(&self) -> Vec<String> {
        self.hub.nodes.iter().map(|e| e.key().clone()).collect()
    }
}

/// The [`Adapter`] given to each node of a [`MemoryCluster`].
#[derive(Debug)]
pub struct ClusterAdapter {
    node: String,
    hub: Arc<Hub>,
}

impl ClusterAdapter {
    fn fan_out(
        &self,
        topic: &str,
        message: &Broadcast,
        exclude: Option<SubscriberId>,
    ) -> Result<(), AdapterError> {
        let message = Arc::new(message.clone());
        let mut unreachable = Vec::new();

        for entry in self.hub.nodes.iter() {
            let node = entry.key();
            if *node == self.node {
                continue;
            }
            if self.hub.unreachable.contains(node) {
                unreachable.push(node.clone());
                continue;
            }
            match entry.value().upgrade() {
                Some(registry) => {
                    let count = registry.dispatch(topic, &message, exclude);
                    trace!(from = %self.node, to = %node, topic = %topic, recipients = count, "Replicated");
                }
                None => unreachable.push(node.clone()),
            }
        }

        if unreachable.is_empty() {
            Ok(())
        } else {
            Err(AdapterError::Unreachable(unreachable))
        }
    }
}

#[async_trait]
impl Adapter for ClusterAdapter {
    fn name(&self) -> &'static str {
        "memory_cluster"
    }

    async fn subscribe(&self, topic: &str, subscriber: SubscriberId) -> Result<(), AdapterError> {
        trace!(node = %self.node, topic = %topic, subscriber = %subscriber, "Cluster subscribe");
        Ok(())
    }

    async fn unsubscribe(
        &self,
        topic: &str,
        subscriber: SubscriberId,
    ) -> Result<(), AdapterError> {
        trace!(node = %self.node, topic = %topic, subscriber = %subscriber, "Cluster unsubscribe");
        Ok(())
    }

    async fn broadcast(&self, topic: &str, message: &Broadcast) -> Result<(), AdapterError> {
        self.fan_out(topic, message, None)
    }

    async fn broadcast_from(
        &self,
        sender: SubscriberId,
        topic: &str,
        message: &Broadcast,
    ) -> Result<(), AdapterError> {
        self.fan_out(topic, message, Some(sender))
    }
}
