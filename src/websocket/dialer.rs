//! Backend WebSocket dialer.
//!
//! Opens the TCP connection (directly or through the upstream proxy's
//! CONNECT tunnel), then runs TLS and the opening handshake over a single
//! HTTP/1.1 connection. The dial and handshake phases have separate
//! deadlines.

use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    http::{header, response::Parts, HeaderMap, Method, Request, StatusCode},
    response::{IntoResponse, Response},
};
use hyper::{body::Incoming, upgrade::Upgraded};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    tungstenite::{
        handshake::{client::generate_key, derive_accept_key},
        protocol::Role,
    },
    MaybeTlsStream, WebSocketStream,
};
use url::{Host, Position, Url};

use crate::config::ProxyConfig;
use crate::http::is_websocket_upgrade;
use crate::http::policy::strip_hop_by_hop;
use crate::net::tls::backend_connector;
use crate::net::tunnel::{TunnelError, UpstreamProxy};

/// Largest rejection body kept for replay.
const MAX_REJECTION_BODY: usize = 1024 * 1024;

/// An open WebSocket connection to the backend.
pub type BackendStream = WebSocketStream<TokioIo<Upgraded>>;

/// Error type for a backend dial.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("invalid backend URL `{0}`")]
    InvalidUrl(Url),

    #[error("connecting to backend timed out after {0:?}")]
    Timeout(Duration),

    #[error("connecting to backend failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("backend handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("backend TLS handshake failed: {0}")]
    Tls(#[source] native_tls::Error),

    #[error("backend handshake failed: {0}")]
    Handshake(#[from] hyper::Error),

    #[error("backend answered the upgrade without {0}")]
    InvalidUpgrade(&'static str),

    #[error("reading the backend rejection failed: {0}")]
    RejectionBody(#[source] axum::Error),

    #[error("backend rejected the upgrade with {}", .0.status)]
    Rejected(BackendRejection),
}

impl DialError {
    /// Phase label for logs and metrics.
    pub fn phase(&self) -> &'static str {
        match self {
            Self::InvalidUrl(_) | Self::Timeout(_) | Self::Connect(_) => "dial",
            Self::Tunnel(_) => "tunnel",
            Self::HandshakeTimeout(_)
            | Self::Tls(_)
            | Self::Handshake(_)
            | Self::InvalidUpgrade(_)
            | Self::RejectionBody(_) => "handshake",
            Self::Rejected(_) => "rejected",
        }
    }
}

/// A non-101 answer to the opening handshake, kept to be replayed.
#[derive(Debug)]
pub struct BackendRejection {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BackendRejection {
    /// Read the whole response, up to [`MAX_REJECTION_BODY`].
    async fn read(response: hyper::Response<Incoming>) -> Result<Self, DialError> {
        let (parts, body) = response.into_parts();
        let body = axum::body::to_bytes(Body::new(body), MAX_REJECTION_BODY)
            .await
            .map_err(DialError::RejectionBody)?;
        Ok(Self {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

impl IntoResponse for BackendRejection {
    fn into_response(self) -> Response {
        let mut headers = self.headers;
        strip_hop_by_hop(&mut headers);
        // Framing is recomputed from the buffered body.
        headers.remove(header::CONTENT_LENGTH);
        (self.status, headers, self.body).into_response()
    }
}

/// Dials backend WebSocket connections.
#[derive(Clone)]
pub struct BackendDialer {
    proxy: Option<UpstreamProxy>,
    tls: native_tls::TlsConnector,
    dial_timeout: Duration,
    handshake_timeout: Duration,
}

impl BackendDialer {
    pub fn from_config(config: &ProxyConfig) -> Result<Self, native_tls::Error> {
        Ok(Self {
            proxy: config.upstream_proxy.as_ref().and_then(UpstreamProxy::from_url),
            tls: backend_connector(&config.tls)?,
            dial_timeout: config.timeouts.dial(),
            handshake_timeout: config.timeouts.websocket_handshake(),
        })
    }

    /// Connect to `url` and complete the opening handshake with `headers`
    /// added to the request. Returns the socket and the head of the
    /// backend's 101 response.
    pub async fn dial(&self, url: &Url, headers: HeaderMap) -> Result<(BackendStream, Parts), DialError> {
        let invalid = || DialError::InvalidUrl(url.clone());
        let host = url.host().ok_or_else(invalid)?;
        let port = url.port_or_known_default().ok_or_else(invalid)?;
        let requested = requested_protocols(&headers);
        let (request, accept) = handshake_request(url, headers).ok_or_else(invalid)?;

        let connect = async {
            match &self.proxy {
                // The CONNECT authority keeps IPv6 brackets.
                Some(proxy) => proxy.connect(&host.to_string(), port).await.map_err(DialError::from),
                None => match &host {
                    Host::Domain(domain) => TcpStream::connect((*domain, port)).await,
                    Host::Ipv4(ip) => TcpStream::connect((*ip, port)).await,
                    Host::Ipv6(ip) => TcpStream::connect((*ip, port)).await,
                }
                .map_err(DialError::Connect),
            }
        };
        let stream = tokio::time::timeout(self.dial_timeout, connect)
            .await
            .map_err(|_| DialError::Timeout(self.dial_timeout))??;
        let _ = stream.set_nodelay(true);

        let handshake = async {
            let stream = self.secure(stream, &host, url.scheme()).await?;
            let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
            tokio::spawn(async move {
                if let Err(e) = connection.with_upgrades().await {
                    tracing::debug!(error = %e, "Backend handshake connection ended");
                }
            });

            let mut response = sender.send_request(request).await?;
            if response.status() != StatusCode::SWITCHING_PROTOCOLS {
                return Err(DialError::Rejected(BackendRejection::read(response).await?));
            }
            verify_upgrade(response.headers(), &accept, &requested)?;

            let upgraded = hyper::upgrade::on(&mut response).await?;
            let socket = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Client, None).await;
            Ok::<_, DialError>((socket, response.into_parts().0))
        };
        let (socket, response) = tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| DialError::HandshakeTimeout(self.handshake_timeout))??;

        tracing::debug!(url = %url, status = response.status.as_u16(), "Backend WebSocket connected");
        Ok((socket, response))
    }

    async fn secure(
        &self,
        stream: TcpStream,
        host: &Host<&str>,
        scheme: &str,
    ) -> Result<MaybeTlsStream<TcpStream>, DialError> {
        if !matches!(scheme, "wss" | "https") {
            return Ok(MaybeTlsStream::Plain(stream));
        }
        let domain = match host {
            Host::Domain(domain) => domain.to_string(),
            Host::Ipv4(ip) => ip.to_string(),
            Host::Ipv6(ip) => ip.to_string(),
        };
        let connector = tokio_native_tls::TlsConnector::from(self.tls.clone());
        let stream = connector.connect(&domain, stream).await.map_err(DialError::Tls)?;
        Ok(MaybeTlsStream::NativeTls(stream))
    }
}

/// The opening handshake request and the `Sec-WebSocket-Accept` value a
/// conforming backend answers with.
fn handshake_request(url: &Url, headers: HeaderMap) -> Option<(Request<Body>, String)> {
    let key = generate_key();
    let accept = derive_accept_key(key.as_bytes());

    let mut request = Request::builder()
        .method(Method::GET)
        .uri(&url[Position::BeforePath..Position::AfterQuery])
        .header(header::HOST, &url[Position::BeforeHost..Position::AfterPort])
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_VERSION, "13")
        .header(header::SEC_WEBSOCKET_KEY, key)
        .body(Body::empty())
        .ok()?;
    for (name, value) in &headers {
        if *name == header::HOST {
            request.headers_mut().insert(name, value.clone());
        } else {
            request.headers_mut().append(name, value.clone());
        }
    }
    Some((request, accept))
}

fn requested_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|protocol| protocol.trim().to_owned())
        .filter(|protocol| !protocol.is_empty())
        .collect()
}

/// Check a 101 answer against the key and the subprotocols offered.
fn verify_upgrade(headers: &HeaderMap, accept: &str, requested: &[String]) -> Result<(), DialError> {
    if !is_websocket_upgrade(headers) {
        return Err(DialError::InvalidUpgrade("`Upgrade: websocket`"));
    }
    if headers.get(header::SEC_WEBSOCKET_ACCEPT).map(|v| v.as_bytes()) != Some(accept.as_bytes()) {
        return Err(DialError::InvalidUpgrade("a matching `Sec-WebSocket-Accept`"));
    }
    let selected = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok());
    match selected {
        Some(protocol) if !requested.iter().any(|offered| offered == protocol) => {
            Err(DialError::InvalidUpgrade("one of the requested subprotocols"))
        }
        None if !requested.is_empty() => Err(DialError::InvalidUpgrade("a subprotocol")),
        _ => Ok(()),
    }
}
