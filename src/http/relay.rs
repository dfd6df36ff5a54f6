//! HTTP relay: one forwarded round trip per inbound request.
//!
//! Applies the [`ForwardingPolicy`], sends through the [`OutboundTransport`]
//! and hands the backend response back with only hop-by-hop headers removed.
//! Transport failures become a fixed gateway error; nothing is retried.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    http::Request,
    response::{IntoResponse, Response},
};

use crate::config::ProxyConfig;
use crate::http::policy::{strip_hop_by_hop, ForwardingPolicy, TargetPolicy};
use crate::net::transport::{OutboundTransport, TransportError};
use crate::observability::metrics;

/// Forwards plain HTTP requests to the target.
#[derive(Clone)]
pub struct HttpRelay {
    policy: Arc<dyn ForwardingPolicy>,
    transport: OutboundTransport,
    debug: bool,
}

impl HttpRelay {
    pub fn new(policy: Arc<dyn ForwardingPolicy>, transport: OutboundTransport, debug: bool) -> Self {
        Self {
            policy,
            transport,
            debug,
        }
    }

    /// Relay with the default [`TargetPolicy`].
    pub fn from_config(config: &ProxyConfig) -> Result<Self, TransportError> {
        Ok(Self::new(
            Arc::new(TargetPolicy::from_config(config)),
            OutboundTransport::from_config(config)?,
            config.debug(),
        ))
    }

    /// Forward `request` and return the backend's response.
    pub async fn forward(&self, request: Request<Body>) -> Response {
        let start_time = Instant::now();
        let method = request.method().clone();

        let mut forwarded = self.policy.forward(request);
        let url = forwarded.url.clone();

        if self.debug {
            match forwarded.capture().await {
                Ok(dump) => tracing::debug!(url = %url, "Outbound request {:?}", dump),
                Err(e) => {
                    let err = TransportError::InboundBody(e);
                    tracing::warn!(url = %url, error = %err, "Failed to capture outbound request");
                    metrics::record_request(method.as_str(), err.status().as_u16(), start_time);
                    return (err.status(), "Failed to read request body").into_response();
                }
            }
        }

        match self.transport.send(forwarded).await {
            Ok(mut response) => {
                let status = response.status();
                self.policy.inspect_response(status, &url);
                strip_hop_by_hop(response.headers_mut());
                metrics::record_request(method.as_str(), status.as_u16(), start_time);
                response
            }
            Err(e) => {
                tracing::error!(
                    target_url = %url,
                    phase = e.phase(),
                    error = %e,
                    "Upstream request failed"
                );
                metrics::record_upstream_error(e.phase());
                metrics::record_request(method.as_str(), e.status().as_u16(), start_time);
                (e.status(), "Upstream request failed").into_response()
            }
        }
    }
}
