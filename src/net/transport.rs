//! Outbound transport for plain HTTP requests.
//!
//! # Responsibilities
//! - Own the pooled client shared by every request
//! - Tunnel through the upstream proxy when one is configured
//! - Apply the backend TLS trust mode
//! - Enforce connection caps and dial/keep-alive/idle timeouts
//! - Stream response bodies back without buffering
//!
//! # Design Decisions
//! - One client per process; it holds no request-specific state
//! - Redirects are relayed to the caller, never followed
//! - The connection cap is a semaphore whose permit lives as long as the
//!   response body, so a streaming response keeps its slot until done

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Response, StatusCode},
};
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::config::ProxyConfig;
use crate::http::policy::{ForwardedRequest, OutboundBody};

/// Error type for outbound requests.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to build outbound client: {0}")]
    Build(#[source] reqwest::Error),

    #[error("dial to {url} failed: {source}")]
    Dial {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} timed out")]
    Timeout {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to read inbound request body: {0}")]
    InboundBody(#[source] axum::Error),

    #[error("outbound connection pool is closed")]
    PoolClosed,
}

impl TransportError {
    fn from_reqwest(url: &url::Url, source: reqwest::Error) -> Self {
        let url = url.to_string();
        if source.is_timeout() {
            Self::Timeout { url, source }
        } else if source.is_connect() {
            Self::Dial { url, source }
        } else {
            Self::Request { url, source }
        }
    }

    /// Status returned to the client in place of a backend response.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InboundBody(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    /// Phase of the round trip that failed, for logs.
    pub fn phase(&self) -> &'static str {
        match self {
            Self::Build(_) => "build",
            Self::Dial { .. } => "dial",
            Self::Timeout { .. } => "timeout",
            Self::Request { .. } => "request",
            Self::InboundBody(_) => "inbound-body",
            Self::PoolClosed => "pool",
        }
    }
}

/// Pooled, concurrency-safe client for forwarded requests.
#[derive(Debug, Clone)]
pub struct OutboundTransport {
    client: reqwest::Client,
    limiter: Option<Arc<Semaphore>>,
}

impl OutboundTransport {
    /// Build the transport from the pool, timeout, TLS and proxy settings.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, TransportError> {
        let timeouts = &config.timeouts;

        // The connect timeout spans TCP, any CONNECT tunnel and the TLS handshake.
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .http1_only()
            .danger_accept_invalid_certs(config.tls.insecure_skip_verify)
            .connect_timeout(timeouts.dial() + timeouts.tls_handshake())
            .tcp_keepalive(timeouts.keep_alive())
            .pool_idle_timeout(timeouts.idle())
            .pool_max_idle_per_host(config.pool.idle_cap());

        builder = match &config.upstream_proxy {
            Some(proxy) => {
                builder.proxy(reqwest::Proxy::all(proxy.clone()).map_err(TransportError::Build)?)
            }
            None => builder.no_proxy(),
        };

        let client = builder.build().map_err(TransportError::Build)?;
        let limiter = config
            .pool
            .connection_cap()
            .map(|cap| Arc::new(Semaphore::new(cap)));

        tracing::debug!(
            upstream_proxy = config.upstream_proxy.as_ref().map(|u| u.as_str()),
            connection_cap = ?config.pool.connection_cap(),
            idle_cap = config.pool.idle_cap(),
            "Outbound transport ready"
        );

        Ok(Self { client, limiter })
    }

    /// Connection slots currently free, if connections are capped.
    pub fn available_slots(&self) -> Option<usize> {
        self.limiter.as_ref().map(|l| l.available_permits())
    }

    /// Issue one round trip. No retries are attempted.
    pub async fn send(&self, request: ForwardedRequest) -> Result<Response<Body>, TransportError> {
        // Waits while the cap is reached.
        let permit = match &self.limiter {
            Some(limiter) => Some(
                limiter
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| TransportError::PoolClosed)?,
            ),
            None => None,
        };

        let ForwardedRequest {
            method,
            url,
            headers,
            body,
        } = request;

        let builder = self.client.request(method, url.clone()).headers(headers);
        let builder = match body {
            OutboundBody::Empty => builder,
            OutboundBody::Buffered(bytes) => builder.body(bytes),
            OutboundBody::Streaming(body) => {
                builder.body(reqwest::Body::wrap_stream(body.into_data_stream()))
            }
        };

        let mut response = builder
            .send()
            .await
            .map_err(|source| TransportError::from_reqwest(&url, source))?;

        let status = response.status();
        let headers = std::mem::take(response.headers_mut());
        let stream = response.bytes_stream().map(move |chunk| {
            let _slot = &permit;
            chunk
        });

        let mut relayed = Response::new(Body::from_stream(stream));
        *relayed.status_mut() = status;
        *relayed.headers_mut() = headers;
        Ok(relayed)
    }
}
