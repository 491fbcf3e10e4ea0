//! # herald-server
//!
//! The `herald` binary's building blocks: configuration, the demo room
//! channel and the axum application serving both transports.

pub mod channels;
pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{build_app, run_server, AppState};
