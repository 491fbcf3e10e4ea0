//! # Herald Server
//!
//! Channel server speaking the Herald protocol.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! herald
//!
//! # Run with custom config
//! herald --config /path/to/herald.toml
//!
//! # Run with environment variables
//! HERALD_PORT=8080 HERALD_HOST=0.0.0.0 herald
//! ```

use anyhow::{bail, Result};
use herald_server::{channels, config::Config, handlers};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let mut args = std::env::args().skip(1);
    let config = match (args.next().as_deref(), args.next()) {
        (None, _) => Config::load()?,
        (Some("--config"), Some(path)) => Config::from_file(path)?,
        (Some(arg), _) => bail!("unexpected argument {arg:?}, usage: herald [--config <path>]"),
    };

    tracing::info!("Starting Herald server on {}:{}", config.host, config.port);

    let router = channels::router()?;
    handlers::run_server(config, router).await?;

    Ok(())
}
