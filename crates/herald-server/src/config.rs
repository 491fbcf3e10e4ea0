//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (HERALD_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use herald_core::SessionConfig;
use herald_transport::{CheckOrigin, LongPollConfig, MuxConfig, UnmatchedTopic};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Long-poll timing.
    #[serde(default)]
    pub longpoll: LongPollSettings,

    /// Origin checks and token signing.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Channel behavior.
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Enable WebSocket transport.
    #[serde(default = "default_true")]
    pub websocket: bool,

    /// Enable long-poll transport.
    #[serde(default = "default_true")]
    pub longpoll: bool,

    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Path for long-poll endpoint.
    #[serde(default = "default_longpoll_path")]
    pub longpoll_path: String,
}

/// Long-poll timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongPollSettings {
    /// Session inactivity window in milliseconds.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// How long an empty poll waits, in milliseconds.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

/// Security configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Check the `Origin` header against `allowed_origins`.
    #[serde(default)]
    pub check_origin: bool,

    /// Accepted origins, e.g. `https://example.com` or `//example.com`.
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Key for long-poll token signatures. Generated at startup when empty.
    #[serde(default = "default_secret_key_base")]
    pub secret_key_base: String,
}

/// Channel behavior.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Joins for topics without a route: `reject` or `drop`.
    #[serde(default)]
    pub unmatched_topic: UnmatchedTopic,

    /// Reply `"ignore"` to declined joins.
    #[serde(default)]
    pub reply_on_decline: bool,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("HERALD_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("HERALD_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(4000)
}

fn default_secret_key_base() -> String {
    std::env::var("HERALD_SECRET_KEY_BASE").unwrap_or_default()
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/socket/websocket".to_string()
}

fn default_longpoll_path() -> String {
    "/socket/longpoll".to_string()
}

fn default_window_ms() -> u64 {
    10_000
}

fn default_poll_timeout_ms() -> u64 {
    10_000
}

fn default_max_message_size() -> usize {
    herald_transport::websocket::DEFAULT_MAX_MESSAGE_SIZE
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            longpoll: LongPollSettings::default(),
            security: SecurityConfig::default(),
            channels: ChannelsConfig::default(),
            limits: LimitsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket: true,
            longpoll: true,
            websocket_path: default_ws_path(),
            longpoll_path: default_longpoll_path(),
        }
    }
}

impl Default for LongPollSettings {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            check_origin: false,
            allowed_origins: Vec::new(),
            secret_key_base: default_secret_key_base(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "herald.toml",
            "/etc/herald/herald.toml",
            "~/.config/herald/herald.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// The origin policy.
    #[must_use]
    pub fn check_origin(&self) -> CheckOrigin {
        if self.security.check_origin {
            CheckOrigin::allow(self.security.allowed_origins.iter().cloned())
        } else {
            CheckOrigin::Disabled
        }
    }

    /// Multiplexer settings for every connection.
    #[must_use]
    pub fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            unmatched_topic: self.channels.unmatched_topic,
            session: SessionConfig {
                reply_on_decline: self.channels.reply_on_decline,
            },
        }
    }

    /// Long-poll settings.
    #[must_use]
    pub fn longpoll_config(&self) -> LongPollConfig {
        LongPollConfig {
            window: Duration::from_millis(self.longpoll.window_ms),
            poll_timeout: Duration::from_millis(self.longpoll.poll_timeout_ms),
            mux: self.mux_config(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.transport.websocket);
        assert!(config.transport.longpoll);
        assert_eq!(config.transport.websocket_path, "/socket/websocket");
        assert_eq!(config.transport.longpoll_path, "/socket/longpoll");
        assert_eq!(config.channels.unmatched_topic, UnmatchedTopic::Reject);
        assert!(matches!(config.check_origin(), CheckOrigin::Disabled));
    }

    #[test]
    fn test_config_bind_addr() {
        let mut config = Config::default();
        config.host = "127.0.0.1".into();
        config.port = 4000;
        assert_eq!(config.bind_addr().unwrap().port(), 4000);

        config.host = "not a host".into();
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [longpoll]
            window_ms = 5000

            [security]
            check_origin = true
            allowed_origins = ["https://example.com"]
            secret_key_base = "s3cret"

            [channels]
            unmatched_topic = "drop"
            reply_on_decline = true
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.longpoll.window_ms, 5000);
        assert_eq!(config.longpoll.poll_timeout_ms, 10_000);
        assert_eq!(config.security.secret_key_base, "s3cret");

        let mux = config.mux_config();
        assert_eq!(mux.unmatched_topic, UnmatchedTopic::Drop);
        assert!(mux.session.reply_on_decline);
        assert!(config.check_origin().is_allowed(Some("https://example.com")));
        assert!(!config.check_origin().is_allowed(Some("https://evil.test")));
        assert_eq!(config.longpoll_config().window, Duration::from_millis(5000));
    }
}
