//! Topic-pattern to channel table.
//!
//! The router is built once at startup and shared read-only by every
//! transport. Patterns are either exact topics (`"lobby"`) or prefix
//! wildcards (`"rooms:*"`); exact matches win, then the longest prefix.

use crate::channel::ChannelFactory;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Maximum topic length.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Invalid route pattern.
    #[error("Invalid pattern {pattern:?}: {reason}")]
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },

    /// Pattern registered twice.
    #[error("Duplicate pattern: {0}")]
    DuplicatePattern(String),
}

/// Validate a topic name.
///
/// # Errors
///
/// Returns an error for empty, overlong or non-printable topics.
pub fn validate_topic(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("Topic cannot be empty");
    }
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err("Topic too long");
    }
    if !topic.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Topic contains invalid characters");
    }
    Ok(())
}

/// A resolved route.
#[derive(Clone)]
pub struct Route {
    pattern: Arc<str>,
    factory: Arc<dyn ChannelFactory>,
}

impl Route {
    /// The pattern that matched.
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The channel factory.
    #[must_use]
    pub fn factory(&self) -> &Arc<dyn ChannelFactory> {
        &self.factory
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

/// Maps topics to channel factories.
#[derive(Clone, Default)]
pub struct ChannelRouter {
    exact: HashMap<String, Route>,
    /// (prefix, route), longest prefix first.
    prefixes: Vec<(String, Route)>,
}

impl ChannelRouter {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` for `pattern`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern is malformed or already registered.
    pub fn channel<F>(mut self, pattern: &str, factory: F) -> Result<Self, RouterError>
    where
        F: ChannelFactory + 'static,
    {
        let invalid = |reason| RouterError::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        };

        let route = Route {
            pattern: Arc::from(pattern),
            factory: Arc::new(factory),
        };

        match pattern.strip_suffix('*') {
            Some(prefix) => {
                if prefix.contains('*') {
                    return Err(invalid("only a trailing '*' is supported"));
                }
                if !prefix.is_empty() {
                    validate_topic(prefix).map_err(invalid)?;
                }
                if self.prefixes.iter().any(|(p, _)| p == prefix) {
                    return Err(RouterError::DuplicatePattern(pattern.to_string()));
                }
                self.prefixes.push((prefix.to_string(), route));
                self.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
            }
            None => {
                validate_topic(pattern).map_err(invalid)?;
                if self.exact.contains_key(pattern) {
                    return Err(RouterError::DuplicatePattern(pattern.to_string()));
                }
                self.exact.insert(pattern.to_string(), route);
            }
        }

        debug!(pattern = %pattern, "Registered channel route");
        Ok(self)
    }

    /// Find the route for `topic`.
    #[must_use]
    pub fn route(&self, topic: &str) -> Option<&Route> {
        if validate_topic(topic).is_err() {
            return None;
        }
        self.exact.get(topic).or_else(|| {
            self.prefixes
                .iter()
                .find(|(prefix, _)| topic.starts_with(prefix.as_str()))
                .map(|(_, route)| route)
        })
    }

    /// All registered patterns.
    #[must_use]
    pub fn patterns(&self) -> Vec<String> {
        self.exact
            .keys()
            .cloned()
            .chain(self.prefixes.iter().map(|(p, _)| format!("{p}*")))
            .collect()
    }

    /// Number of registered routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.exact.len() + self.prefixes.len()
    }

    /// Whether no routes are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ChannelRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRouter")
            .field("patterns", &self.patterns())
            .finish()
    }
}
