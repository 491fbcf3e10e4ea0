//! `Origin` header checks shared by both transports.

use axum::http::Uri;
use tracing::warn;

/// One allow-list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AllowedOrigin {
    /// `None` for `//host` entries.
    scheme: Option<String>,
    host: String,
    /// `None` when any port is accepted.
    port: Option<u16>,
    /// `*.host` entries match subdomains only.
    subdomains: bool,
}

impl AllowedOrigin {
    fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim().trim_end_matches('/');
        let subdomains = entry.contains("*.");
        let entry = entry.replacen("*.", "", 1);
        let (scheme_relative, uri) = match entry.strip_prefix("//") {
            Some(rest) => (true, format!("http://{rest}").parse::<Uri>().ok()?),
            None => (false, entry.parse::<Uri>().ok()?),
        };

        let host = uri.host()?.to_ascii_lowercase();
        if scheme_relative {
            return Some(Self {
                scheme: None,
                host,
                port: uri.port_u16(),
                subdomains,
            });
        }

        let scheme = uri.scheme_str()?.to_ascii_lowercase();
        let port = uri.port_u16().or_else(|| default_port(&scheme));
        Some(Self {
            scheme: Some(scheme),
            host,
            port,
            subdomains,
        })
    }

    fn matches(&self, scheme: &str, host: &str, port: Option<u16>) -> bool {
        if let Some(expected) = &self.scheme {
            if expected != scheme {
                return false;
            }
        }
        if let Some(expected) = self.port {
            if Some(expected) != port {
                return false;
            }
        }
        if self.subdomains {
            host.strip_suffix(self.host.as_str())
                .is_some_and(|sub| sub.len() > 1 && sub.ends_with('.'))
        } else {
            self.host == host
        }
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        _ => None,
    }
}

/// Origin policy for incoming connections.
#[derive(Debug, Clone, Default)]
pub enum CheckOrigin {
    /// Accept any origin, including none.
    #[default]
    Disabled,
    /// Accept only listed origins.
    AllowList(Vec<String>),
}

impl CheckOrigin {
    /// Build an allow-list policy.
    #[must_use]
    pub fn allow<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CheckOrigin::AllowList(origins.into_iter().map(Into::into).collect())
    }

    /// Check the value of an `Origin` header.
    #[must_use]
    pub fn is_allowed(&self, origin: Option<&str>) -> bool {
        let allowed = match self {
            CheckOrigin::Disabled => return true,
            CheckOrigin::AllowList(allowed) => allowed,
        };

        let Some(origin) = origin else {
            warn!("Refusing connection without Origin header");
            return false;
        };

        let Ok(uri) = origin.trim_end_matches('/').parse::<Uri>() else {
            warn!(origin = %origin, "Refusing malformed origin");
            return false;
        };
        let (Some(scheme), Some(host)) = (uri.scheme_str(), uri.host()) else {
            warn!(origin = %origin, "Refusing malformed origin");
            return false;
        };
        let scheme = scheme.to_ascii_lowercase();
        let host = host.to_ascii_lowercase();
        let port = uri.port_u16().or_else(|| default_port(&scheme));

        let ok = allowed
            .iter()
            .filter_map(|entry| AllowedOrigin::parse(entry))
            .any(|entry| entry.matches(&scheme, &host, port));
        if !ok {
            warn!(origin = %origin, "Origin not allowed");
        }
        ok
    }
}
