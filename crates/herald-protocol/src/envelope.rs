//! The message envelope exchanged by every transport.
//!
//! An envelope is the four-field unit `{topic, event, payload, ref}`. Clients
//! send envelopes carrying a `ref` and receive exactly one `phx_reply` echoing
//! it; server pushes carry a `null` ref.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

/// Reserved event names.
pub mod events {
    /// Client → server: join a topic.
    pub const JOIN: &str = "phx_join";
    /// Client → server: leave a topic.
    pub const LEAVE: &str = "phx_leave";
    /// Server → client: reply correlated to a client `ref`.
    pub const REPLY: &str = "phx_reply";
    /// Server → client: the channel ended cleanly.
    pub const CLOSE: &str = "phx_close";
    /// Server → client: the channel ended abnormally.
    pub const ERROR: &str = "phx_error";
    /// Client → server keepalive, sent on [`super::HEARTBEAT_TOPIC`].
    pub const HEARTBEAT: &str = "heartbeat";
}

/// Topic used for connection-level heartbeats.
pub const HEARTBEAT_TOPIC: &str = "phoenix";

/// Well-known reply statuses.
pub mod status {
    pub const OK: &str = "ok";
    pub const ERROR: &str = "error";
    pub const IGNORE: &str = "ignore";
}

/// A wire-level message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Target topic, e.g. `"rooms:lobby"`.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Structured payload.
    pub payload: Value,
    /// Correlation reference. The key is mandatory on the wire; the value may
    /// be `null`.
    #[serde(rename = "ref", deserialize_with = "required_nullable")]
    pub reference: Option<String>,
}

/// Deserialize an `Option` whose key must be present.
///
/// Supplying `deserialize_with` turns off serde's implicit "missing means
/// `None`" for `Option` fields.
fn required_nullable<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
        reference: Option<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            reference,
        }
    }

    /// Create a server push (no ref).
    #[must_use]
    pub fn push(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self::new(topic, event, payload, None)
    }

    /// Create a `phx_reply` for the given client ref.
    #[must_use]
    pub fn reply(
        topic: impl Into<String>,
        reference: impl Into<String>,
        status: impl Into<String>,
        response: Value,
    ) -> Self {
        Self::new(
            topic,
            events::REPLY,
            json!({ "status": status.into(), "response": response }),
            Some(reference.into()),
        )
    }

    /// Create a `phx_close` notification.
    #[must_use]
    pub fn close(topic: impl Into<String>) -> Self {
        Self::push(topic, events::CLOSE, Value::Object(Map::new()))
    }

    /// Create a `phx_error` notification. The payload is always empty.
    #[must_use]
    pub fn error(topic: impl Into<String>) -> Self {
        Self::push(topic, events::ERROR, Value::Object(Map::new()))
    }

    /// Whether this is a join request.
    #[must_use]
    pub fn is_join(&self) -> bool {
        self.event == events::JOIN
    }

    /// Whether this is a leave request.
    #[must_use]
    pub fn is_leave(&self) -> bool {
        self.event == events::LEAVE
    }

    /// Whether this is a connection heartbeat.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.topic == HEARTBEAT_TOPIC && self.event == events::HEARTBEAT
    }

    /// The reply status, when this envelope is a `phx_reply`.
    #[must_use]
    pub fn reply_status(&self) -> Option<&str> {
        if self.event != events::REPLY {
            return None;
        }
        self.payload.get("status").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_shape() {
        let reply = Envelope::reply("rooms:lobby", "7", status::OK, json!({"id": 1}));
        assert_eq!(reply.event, events::REPLY);
        assert_eq!(reply.reference.as_deref(), Some("7"));
        assert_eq!(reply.reply_status(), Some("ok"));
        assert_eq!(reply.payload["response"]["id"], 1);
    }

    #[test]
    fn test_error_payload_is_empty() {
        let err = Envelope::error("rooms:lobby");
        assert_eq!(err.payload, json!({}));
        assert!(err.reference.is_none());
    }

    #[test]
    fn test_ref_key_required() {
        let missing = r#"{"topic":"t","event":"e","payload":{}}"#;
        assert!(serde_json::from_str::<Envelope>(missing).is_err());

        let null_ref = r#"{"topic":"t","event":"e","payload":{},"ref":null}"#;
        let env: Envelope = serde_json::from_str(null_ref).unwrap();
        assert!(env.reference.is_none());
    }

    #[test]
    fn test_payload_required() {
        let missing = r#"{"topic":"t","event":"e","ref":"1"}"#;
        assert!(serde_json::from_str::<Envelope>(missing).is_err());
    }

    #[test]
    fn test_ref_serialized_as_ref() {
        let env = Envelope::push("t", "e", json!({}));
        let text = serde_json::to_string(&env).unwrap();
        assert!(text.contains(r#""ref":null"#));
    }

    #[test]
    fn test_heartbeat_detection() {
        let hb = Envelope::new(HEARTBEAT_TOPIC, events::HEARTBEAT, json!({}), Some("1".into()));
        assert!(hb.is_heartbeat());
        assert!(!Envelope::new("rooms:1", events::HEARTBEAT, json!({}), None).is_heartbeat());
    }
}
