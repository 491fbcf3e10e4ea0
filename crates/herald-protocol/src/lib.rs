//! # herald-protocol
//!
//! Wire protocol definitions for the Herald channel engine.
//!
//! Both transports (persistent socket and long-poll) exchange the same
//! [`Envelope`]: `{topic, event, payload, ref}`.
//!
//! ## Reserved events
//!
//! - `phx_join` / `phx_leave` - Channel membership
//! - `phx_reply` - Reply correlated to a client `ref`
//! - `phx_close` / `phx_error` - Channel ended cleanly / abnormally
//!
//! ## Example
//!
//! ```rust
//! use herald_protocol::{codec, Envelope};
//! use serde_json::json;
//!
//! let envelope = Envelope::push("rooms:lobby", "new_msg", json!({"body": "hi"}));
//!
//! let encoded = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(encoded.as_bytes()).unwrap();
//! assert_eq!(envelope, decoded);
//! ```

pub mod codec;
pub mod envelope;
pub mod version;

pub use codec::{decode, encode, Codec, Encoded, ProtocolError};
pub use envelope::{events, status, Envelope, HEARTBEAT_TOPIC};
pub use version::{Version, PROTOCOL_VERSION};
