//! # herald-core
//!
//! Channel sessions, topic routing and pub/sub dispatch for the Herald
//! messaging engine.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Channel** - The callback interface application code implements
//! - **Session** - One task per (connection, topic) running a channel
//! - **Socket** - Per-session state handed to every callback
//! - **PubSub** - Topic registry and broadcast dispatcher with pluggable adapters
//! - **ChannelRouter** - Topic-pattern to channel table
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│   Session   │────▶│   Channel   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │ broadcast
//!        │                   ▼
//!        │            ┌─────────────┐     ┌─────────────┐
//!        └────────────│   PubSub    │────▶│   Adapter   │
//!         handle_out  └─────────────┘     └─────────────┘
//! ```

pub mod channel;
pub mod pubsub;
pub mod router;
pub mod session;
pub mod socket;

pub use channel::{Channel, ChannelError, ChannelFactory, Join, Reply, StopReason};
pub use pubsub::{Adapter, AdapterError, Broadcast, MemoryCluster, PubSub, SubscriberId};
pub use router::{ChannelRouter, Route, RouterError};
pub use session::{JoinRequest, SessionConfig, SessionError, SessionHandle};
pub use socket::{Outbound, Socket, TransportHandle};
