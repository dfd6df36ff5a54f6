//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check target and upstream proxy URLs are usable
//! - Validate value ranges (timeouts > 0, bind address parses)
//! - Reject policies that need settings which are absent
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before any listener is bound

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{HostHeaderPolicy, ProxyConfig};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("target `{url}` must use http, https, ws or wss")]
    TargetScheme { url: String },

    #[error("{field} `{url}` has no host")]
    MissingHost { field: &'static str, url: String },

    #[error("upstream proxy `{url}` must use http")]
    UpstreamScheme { url: String },

    #[error("bind address `{0}` is not a socket address")]
    BindAddress(String),

    #[error("timeout `{0}` must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("host header policy `upstream-proxy` requires an upstream proxy")]
    HostPolicyWithoutProxy,
}

/// Check a parsed configuration, collecting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if !matches!(config.target.scheme(), "http" | "https" | "ws" | "wss") {
        errors.push(ValidationError::TargetScheme {
            url: config.target.to_string(),
        });
    }
    if config.target.host_str().is_none() {
        errors.push(ValidationError::MissingHost {
            field: "target",
            url: config.target.to_string(),
        });
    }

    if let Some(proxy) = &config.upstream_proxy {
        if proxy.scheme() != "http" {
            errors.push(ValidationError::UpstreamScheme {
                url: proxy.to_string(),
            });
        }
        if proxy.host_str().is_none() {
            errors.push(ValidationError::MissingHost {
                field: "upstream proxy",
                url: proxy.to_string(),
            });
        }
    } else if config.host_header == HostHeaderPolicy::UpstreamProxy {
        errors.push(ValidationError::HostPolicyWithoutProxy);
    }

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(config.listener.bind_address.clone()));
    }

    let timeouts = &config.timeouts;
    for (name, secs) in [
        ("dial", timeouts.dial_secs),
        ("tls_handshake", timeouts.tls_handshake_secs),
        ("websocket_handshake", timeouts.websocket_handshake_secs),
    ] {
        if secs == 0 {
            errors.push(ValidationError::ZeroTimeout(name));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
