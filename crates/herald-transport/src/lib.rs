//! # herald-transport
//!
//! Transports for Herald channels.
//!
//! Both transports present the same event protocol to channel code:
//!
//! - **WebSocket** - One persistent connection multiplexing many topics
//! - **Long-poll** - Token-identified sessions that buffer between polls
//!
//! ## Connection loop
//!
//! ```rust,ignore
//! use herald_transport::{websocket, ChannelMux, MuxConfig};
//!
//! let (transport, outbound) = herald_core::TransportHandle::channel(conn.id().as_str());
//! let mux = ChannelMux::new(transport, router, pubsub, MuxConfig::default());
//! websocket::serve(conn, mux, outbound).await;
//! ```

pub mod longpoll;
pub mod metrics;
pub mod mux;
pub mod origin;
pub mod traits;
pub mod websocket;

pub use longpoll::{LongPoll, LongPollConfig, LongPollError, PollParams, PollReply, TokenSigner};
pub use mux::{ChannelMux, MuxConfig, UnmatchedTopic};
pub use origin::CheckOrigin;
pub use traits::{Connection, ConnectionId, TransportError};
pub use websocket::WebSocketConnection;
