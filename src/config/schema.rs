//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Root configuration for the relay proxy.
///
/// Built once at startup and shared read-only by every session.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Origin server every request is forwarded to.
    pub target: Url,

    /// Forward proxy the outbound leg is tunneled through.
    #[serde(default)]
    pub upstream_proxy: Option<Url>,

    /// Which authority the forwarded `Host` header carries.
    #[serde(default)]
    pub host_header: HostHeaderPolicy,

    /// Listener configuration (bind address, TLS).
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Backend TLS trust mode.
    #[serde(default)]
    pub tls: BackendTlsConfig,

    /// Outbound connection pool limits.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Timeout configuration.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Client-side WebSocket upgrade settings.
    #[serde(default)]
    pub websocket: WebSocketSettings,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl ProxyConfig {
    /// Configuration for `target` with every other section at its default.
    pub fn new(target: Url) -> Self {
        Self {
            target,
            upstream_proxy: None,
            host_header: HostHeaderPolicy::default(),
            listener: ListenerConfig::default(),
            tls: BackendTlsConfig::default(),
            pool: PoolConfig::default(),
            timeouts: TimeoutConfig::default(),
            websocket: WebSocketSettings::default(),
            observability: ObservabilityConfig::default(),
        }
    }

    /// The target with an `http`/`https` scheme, for plain requests.
    pub fn http_target(&self) -> Url {
        self.target_with_scheme("http", "https")
    }

    /// The target with a `ws`/`wss` scheme, for WebSocket dials.
    pub fn websocket_target(&self) -> Url {
        self.target_with_scheme("ws", "wss")
    }

    fn target_with_scheme(&self, plain: &str, secure: &str) -> Url {
        let scheme = match self.target.scheme() {
            "https" | "wss" => secure,
            _ => plain,
        };
        let mut url = self.target.clone();
        // Both schemes are special, so the swap cannot fail.
        let _ = url.set_scheme(scheme);
        url
    }

    /// Whether debug dumps and non-2xx logging are on.
    pub fn debug(&self) -> bool {
        self.observability.debug
    }
}

/// Authority placed in the `Host` header of forwarded HTTP requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostHeaderPolicy {
    /// The target's host and port.
    #[default]
    Target,
    /// The upstream proxy's host and port. Kept for backends that were
    /// deployed against an early revision; needs `upstream_proxy`.
    UpstreamProxy,
}

impl std::str::FromStr for HostHeaderPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "target" => Ok(Self::Target),
            "upstream-proxy" => Ok(Self::UpstreamProxy),
            other => Err(format!("unknown host header policy `{other}`")),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Trust decisions for TLS connections to the backend.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendTlsConfig {
    /// Accept any backend certificate. Only for interception and debugging.
    pub insecure_skip_verify: bool,
}

/// Outbound pool limits. Zero disables a cap.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum connections open to backends at once.
    pub max_connections: usize,

    /// Maximum idle connections kept for reuse.
    pub max_idle: usize,

    /// Maximum connections open to a single host.
    pub max_per_host: usize,

    /// Reuse connections between requests.
    pub keep_alive: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_idle: 100,
            max_per_host: 100,
            keep_alive: true,
        }
    }
}

impl PoolConfig {
    /// Concurrency cap for the single target host, if any.
    pub fn connection_cap(&self) -> Option<usize> {
        [self.max_connections, self.max_per_host]
            .into_iter()
            .filter(|cap| *cap > 0)
            .min()
    }

    /// Idle connections retained for the target host.
    pub fn idle_cap(&self) -> usize {
        if !self.keep_alive {
            0
        } else if self.max_idle == 0 {
            usize::MAX
        } else {
            self.max_idle
        }
    }
}

/// Timeout configuration for the dial and handshake phases.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// TCP connection establishment timeout in seconds.
    pub dial_secs: u64,

    /// TCP keep-alive probe interval in seconds.
    pub keep_alive_secs: u64,

    /// TLS handshake timeout in seconds.
    pub tls_handshake_secs: u64,

    /// Idle pooled connection lifetime in seconds.
    pub idle_secs: u64,

    /// WebSocket opening handshake timeout in seconds.
    pub websocket_handshake_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            dial_secs: 30,
            keep_alive_secs: 30,
            tls_handshake_secs: 10,
            idle_secs: 90,
            websocket_handshake_secs: 45,
        }
    }
}

impl TimeoutConfig {
    pub fn dial(&self) -> Duration {
        Duration::from_secs(self.dial_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn tls_handshake(&self) -> Duration {
        Duration::from_secs(self.tls_handshake_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn websocket_handshake(&self) -> Duration {
        Duration::from_secs(self.websocket_handshake_secs)
    }
}

/// Buffer sizes for the client-side WebSocket upgrade.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebSocketSettings {
    /// Read buffer size in bytes.
    pub read_buffer_size: usize,

    /// Write buffer size in bytes.
    pub write_buffer_size: usize,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            read_buffer_size: 1024,
            write_buffer_size: 1024,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Dump outbound requests and log non-2xx responses.
    pub debug: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Prometheus endpoint bind address; disabled when unset.
    pub metrics_address: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            debug: false,
            log_level: "info".to_string(),
            metrics_address: None,
        }
    }
}
