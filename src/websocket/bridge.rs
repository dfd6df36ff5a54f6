//! WebSocket handshake bridge.
//!
//! # Responsibilities
//! - Map the inbound upgrade request onto a backend URL and header set
//! - Dial the backend before accepting the client
//! - Replay a backend rejection verbatim, or answer 503 when no response exists
//! - Upgrade the client with the backend's subprotocol and cookies
//! - Hand both connections to a [`RelaySession`]
//!
//! # Design Decisions
//! - The client is only upgraded once the backend has accepted, so a
//!   rejected session never exchanges frames
//! - URL and header customization go through [`HandshakeStrategy`]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ws::WebSocketUpgrade, FromRequestParts},
    http::{
        header::{self, HeaderMap, HeaderName, HeaderValue},
        Request, StatusCode, Uri,
    },
    response::{IntoResponse, Response},
};
use url::Url;

use crate::config::{ProxyConfig, WebSocketSettings};
use crate::observability::metrics;
use crate::websocket::dialer::{BackendDialer, DialError};
use crate::websocket::frame::{backend_channel, client_channel};
use crate::websocket::relay::RelaySession;
use crate::websocket::session::{SessionState, SessionTracker};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Customization points for the backend handshake.
pub trait HandshakeStrategy: Send + Sync {
    /// Backend URL for an inbound request URI.
    ///
    /// The default keeps the target's scheme and authority and takes path
    /// and query from the request.
    fn backend_url(&self, target: &Url, uri: &Uri) -> Url {
        let mut url = target.clone();
        url.set_path(uri.path());
        url.set_query(uri.query());
        url.set_fragment(None);
        url
    }

    /// Inspect or extend the outbound handshake headers before dialing.
    fn augment_headers(&self, _headers: &mut HeaderMap) {}
}

/// The default strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct RebaseOnTarget;

impl HandshakeStrategy for RebaseOnTarget {}

/// Turns an inbound upgrade request into a relay session.
#[derive(Clone)]
pub struct HandshakeBridge {
    target: Url,
    strategy: Arc<dyn HandshakeStrategy>,
    dialer: BackendDialer,
    settings: WebSocketSettings,
}

impl HandshakeBridge {
    pub fn new(
        target: Url,
        strategy: Arc<dyn HandshakeStrategy>,
        dialer: BackendDialer,
        settings: WebSocketSettings,
    ) -> Self {
        Self {
            target,
            strategy,
            dialer,
            settings,
        }
    }

    /// Bridge with the default [`RebaseOnTarget`] strategy.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, native_tls::Error> {
        Ok(Self::new(
            config.websocket_target(),
            Arc::new(RebaseOnTarget),
            BackendDialer::from_config(config)?,
            config.websocket.clone(),
        ))
    }

    /// Replace the handshake strategy.
    pub fn with_strategy(mut self, strategy: Arc<dyn HandshakeStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Handle one upgrade request from `peer`.
    pub async fn handle(&self, request: Request<Body>, peer: SocketAddr, inbound_tls: bool) -> Response {
        let (mut parts, _body) = request.into_parts();

        let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => upgrade,
            Err(rejection) => {
                tracing::debug!(uri = %parts.uri, error = %rejection, "Not a valid WebSocket upgrade");
                return rejection.into_response();
            }
        };

        let mut tracker = SessionTracker::start();
        let session_id = tracker.id();
        let url = self.strategy.backend_url(&self.target, &parts.uri);
        let mut headers = outbound_headers(&parts.headers, peer, inbound_tls);
        self.strategy.augment_headers(&mut headers);

        let (backend, handshake) = match self.dialer.dial(&url, headers).await {
            Ok(connected) => connected,
            Err(DialError::Rejected(rejection)) => {
                tracing::info!(
                    session_id = %session_id,
                    target_url = %url,
                    status = rejection.status.as_u16(),
                    "Backend rejected WebSocket upgrade"
                );
                tracker.advance(SessionState::Closed);
                return rejection.into_response();
            }
            Err(e) => {
                tracing::error!(
                    session_id = %session_id,
                    target_url = %url,
                    phase = e.phase(),
                    error = %e,
                    "Backend WebSocket dial failed"
                );
                metrics::record_upstream_error(e.phase());
                tracker.advance(SessionState::Closed);
                return (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable").into_response();
            }
        };
        tracker.advance(SessionState::Handshaking);

        let mut upgrade = upgrade
            .read_buffer_size(self.settings.read_buffer_size)
            .write_buffer_size(self.settings.write_buffer_size);
        if let Some(protocol) = handshake
            .headers
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok())
        {
            upgrade = upgrade.protocols([protocol.to_owned()]);
        }

        // A failed client upgrade drops the closure and with it the backend.
        let mut response = upgrade
            .on_failed_upgrade(move |error| {
                tracing::warn!(session_id = %session_id, error = %error, "Client WebSocket upgrade failed");
            })
            .on_upgrade(move |socket| async move {
                let session = RelaySession::new(tracker, client_channel(socket), backend_channel(backend));
                session.run().await;
            });

        for cookie in handshake.headers.get_all(header::SET_COOKIE) {
            response.headers_mut().append(header::SET_COOKIE, cookie.clone());
        }
        tracing::debug!(session_id = %session_id, target_url = %url, "WebSocket upgrade accepted");
        response
    }
}

/// Handshake headers for the backend, derived from the inbound request.
pub fn outbound_headers(inbound: &HeaderMap, peer: SocketAddr, inbound_tls: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();

    if let Some(origin) = inbound.get(header::ORIGIN) {
        headers.insert(header::ORIGIN, origin.clone());
    }
    for name in [header::SEC_WEBSOCKET_PROTOCOL, header::COOKIE] {
        for value in inbound.get_all(&name) {
            headers.append(name.clone(), value.clone());
        }
    }
    if let Some(host) = inbound.get(header::HOST) {
        headers.insert(header::HOST, host.clone());
    }

    let mut chain: Vec<String> = inbound
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_owned)
        .collect();
    chain.push(peer.ip().to_string());
    if let Ok(value) = HeaderValue::from_str(&chain.join(", ")) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    let proto = if inbound_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    headers
}
