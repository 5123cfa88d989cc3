//! Proxy configuration and parsing
//!
//! Proxy strings come from the control surface in `ip:port` or
//! `ip:port:user:pass` form. Parsing is a total function: any malformed
//! input means "no proxy", it never fails loudly.

mod forwarder;

pub use forwarder::LocalProxyForwarder;

/// A parsed upstream proxy.
///
/// `server` is always `http://host:port` regardless of any scheme token in
/// the input: Chrome is pointed at an HTTP-style forward proxy either way.
/// Immutable once built; each session keeper owns its own clone.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProxyConfig {
    /// Full server URL, `http://host:port`
    pub server: String,
    /// Proxy host
    pub host: String,
    /// Proxy port (always > 0)
    pub port: u16,
    /// Username, if the proxy requires authentication
    pub username: Option<String>,
    /// Password; may be absent even when a username is present
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Whether this proxy needs credentials (and therefore a local
    /// forwarder, since Chrome takes no inline proxy auth).
    pub fn requires_auth(&self) -> bool {
        self.username.is_some()
    }
}

/// Parse a proxy string in `ip:port`, `ip:port:user` or `ip:port:user:pass`
/// form. Passwords containing `:` are preserved verbatim: everything after
/// the third colon is the password.
///
/// Empty/whitespace input means "no proxy" and yields `None`, as does any
/// malformed host or port.
pub fn parse_proxy(proxy_str: &str) -> Option<ProxyConfig> {
    let trimmed = proxy_str.trim();
    if trimmed.is_empty() {
        return None;
    }

    let parts: Vec<&str> = trimmed.split(':').collect();
    if parts.len() < 2 {
        return None;
    }

    let host = parts[0].trim();
    if host.is_empty() {
        return None;
    }

    // u16 already rules out negatives; zero is rejected explicitly
    let port: u16 = parts[1].trim().parse().ok()?;
    if port == 0 {
        return None;
    }

    let username = parts.get(2).map(|u| u.trim().to_string());
    let password = if parts.len() >= 4 {
        Some(parts[3..].join(":"))
    } else {
        None
    };

    Some(ProxyConfig {
        server: format!("http://{}:{}", host, port),
        host: host.to_string(),
        port,
        username,
        password,
    })
}
