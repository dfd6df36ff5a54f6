//! Forwarding policy: how an inbound request becomes an outbound one.
//!
//! # Responsibilities
//! - Point the request at the target's scheme and authority
//! - Set the `Host` header per [`HostHeaderPolicy`]
//! - Pin an empty `User-Agent` when the client sent none
//! - Strip hop-by-hop headers in both directions
//! - Observe backend responses (non-2xx logging in debug mode)
//!
//! Method, path, query and body are left untouched.

use std::fmt::Write as _;

use axum::{
    body::{Body, Bytes, HttpBody},
    http::{
        header::{self, HeaderMap, HeaderName, HeaderValue},
        Method, Request, StatusCode,
    },
};
use futures_util::{stream, StreamExt};
use url::Url;

use crate::config::{HostHeaderPolicy, ProxyConfig};
use crate::net::tunnel::UpstreamProxy;

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
];

/// Largest request body copied into a debug dump.
pub const MAX_CAPTURED_BODY: usize = 1024 * 1024;

/// Body of a forwarded request.
#[derive(Debug)]
pub enum OutboundBody {
    /// The inbound request carried no body.
    Empty,
    /// Fully read, e.g. after a debug dump of a small body.
    Buffered(Bytes),
    /// Streamed from the client as it arrives.
    Streaming(Body),
}

/// An inbound request rewritten for the target. Lives for one round trip.
#[derive(Debug)]
pub struct ForwardedRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: OutboundBody,
}

impl ForwardedRequest {
    /// Serialize the request as it will go on the wire, headers and body.
    ///
    /// A streaming body is read into memory first and the same bytes are
    /// sent afterwards. Past [`MAX_CAPTURED_BODY`] the dump is truncated and
    /// the rest of the body keeps streaming.
    pub async fn capture(&mut self) -> Result<String, axum::Error> {
        let mut preview = None;
        match std::mem::replace(&mut self.body, OutboundBody::Empty) {
            OutboundBody::Streaming(body) => {
                let mut chunks = body.into_data_stream();
                let mut head: Vec<Bytes> = Vec::new();
                let mut read = 0;
                let mut finished = false;
                while read <= MAX_CAPTURED_BODY {
                    match chunks.next().await {
                        Some(chunk) => {
                            let chunk = chunk?;
                            read += chunk.len();
                            head.push(chunk);
                        }
                        None => {
                            finished = true;
                            break;
                        }
                    }
                }

                if finished {
                    self.body = OutboundBody::Buffered(Bytes::from(head.concat()));
                } else {
                    let captured: Vec<u8> = head
                        .iter()
                        .flat_map(|chunk| chunk.iter().copied())
                        .take(MAX_CAPTURED_BODY)
                        .collect();
                    preview = Some(captured);
                    let replay = stream::iter(head.into_iter().map(Ok::<_, axum::Error>));
                    self.body = OutboundBody::Streaming(Body::from_stream(replay.chain(chunks)));
                }
            }
            other => self.body = other,
        }

        let mut dump = String::new();
        let target = match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        };
        let _ = write!(dump, "{} {} HTTP/1.1\r\n", self.method, target);
        for (name, value) in &self.headers {
            let _ = write!(dump, "{}: {}\r\n", name, String::from_utf8_lossy(value.as_bytes()));
        }
        dump.push_str("\r\n");
        match (&self.body, preview) {
            (_, Some(captured)) => {
                dump.push_str(&String::from_utf8_lossy(&captured));
                let _ = write!(dump, "\n[body truncated after {MAX_CAPTURED_BODY} bytes]");
            }
            (OutboundBody::Buffered(bytes), None) => dump.push_str(&String::from_utf8_lossy(bytes)),
            _ => {}
        }
        Ok(dump)
    }
}

/// Rewriting rules applied to every plain HTTP request.
///
/// Implementations are injected into the relay at construction.
pub trait ForwardingPolicy: Send + Sync {
    /// Derive the outbound request.
    fn forward(&self, request: Request<Body>) -> ForwardedRequest;

    /// Observe the backend's answer. Must not alter it.
    fn inspect_response(&self, _status: StatusCode, _url: &Url) {}
}

/// Default policy: everything goes to the single configured target.
#[derive(Debug, Clone)]
pub struct TargetPolicy {
    target: Url,
    host: HeaderValue,
    debug: bool,
}

impl TargetPolicy {
    pub fn from_config(config: &ProxyConfig) -> Self {
        let target = config.http_target();
        let proxy = config.upstream_proxy.as_ref().and_then(UpstreamProxy::from_url);
        let authority = match (config.host_header, proxy) {
            (HostHeaderPolicy::UpstreamProxy, Some(proxy)) => proxy.authority(),
            _ => authority(&target),
        };
        let host = HeaderValue::from_str(&authority).unwrap_or_else(|_| HeaderValue::from_static(""));

        Self {
            target,
            host,
            debug: config.debug(),
        }
    }
}

impl ForwardingPolicy for TargetPolicy {
    fn forward(&self, request: Request<Body>) -> ForwardedRequest {
        let (parts, body) = request.into_parts();

        let mut url = self.target.clone();
        url.set_path(parts.uri.path());
        url.set_query(parts.uri.query());

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.insert(header::HOST, self.host.clone());
        if !headers.contains_key(header::USER_AGENT) {
            headers.insert(header::USER_AGENT, HeaderValue::from_static(""));
        }

        let body = if body.is_end_stream() {
            OutboundBody::Empty
        } else {
            OutboundBody::Streaming(body)
        };

        ForwardedRequest {
            method: parts.method,
            url,
            headers,
            body,
        }
    }

    fn inspect_response(&self, status: StatusCode, url: &Url) {
        if self.debug && !status.is_success() {
            tracing::info!(status = status.as_u16(), url = %url, "Backend returned non-success status");
        }
    }
}

/// `host[:port]` of a URL, with the port only when it is explicit.
fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

/// Remove connection-scoped headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
    headers.remove(header::UPGRADE);
}
