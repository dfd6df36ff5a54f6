//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the single catch-all handler
//! - Tell WebSocket upgrades apart from plain requests
//! - Dispatch upgrades to the handshake bridge, the rest to the HTTP relay
//! - Bind to a plain or TLS listener with graceful shutdown

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, Request},
    response::Response,
    routing::any,
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::ProxyConfig;
use crate::http::policy::ForwardingPolicy;
use crate::http::relay::HttpRelay;
use crate::net::transport::{OutboundTransport, TransportError};
use crate::websocket::bridge::{HandshakeBridge, HandshakeStrategy};

/// How long in-flight connections get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Error type for server construction and serving.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to build outbound transport: {0}")]
    Transport(#[from] TransportError),

    #[error("failed to build backend TLS connector: {0}")]
    BackendTls(#[from] native_tls::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<HttpRelay>,
    pub bridge: Arc<HandshakeBridge>,
    /// Whether clients reach this listener over TLS.
    pub inbound_tls: bool,
}

/// HTTP server for the relay proxy.
pub struct HttpServer {
    config: ProxyConfig,
    relay: HttpRelay,
    bridge: HandshakeBridge,
}

impl HttpServer {
    /// Create a server with the default forwarding and handshake strategies.
    pub fn new(config: ProxyConfig) -> Result<Self, ServerError> {
        if !matches!(config.target.path(), "" | "/") {
            tracing::warn!(
                target_url = %config.target,
                "Target path is ignored; request paths are forwarded as received"
            );
        }

        let relay = HttpRelay::from_config(&config)?;
        let bridge = HandshakeBridge::from_config(&config)?;
        Ok(Self {
            config,
            relay,
            bridge,
        })
    }

    /// Replace the forwarding policy and handshake strategy.
    pub fn with_strategies(
        mut self,
        policy: Arc<dyn ForwardingPolicy>,
        handshake: Arc<dyn HandshakeStrategy>,
    ) -> Result<Self, ServerError> {
        let transport = OutboundTransport::from_config(&self.config)?;
        self.relay = HttpRelay::new(policy, transport, self.config.debug());
        self.bridge = self.bridge.with_strategy(handshake);
        Ok(self)
    }

    /// Build the Axum router with all middleware layers.
    pub fn router(&self, inbound_tls: bool) -> Router {
        let state = AppState {
            relay: Arc::new(self.relay.clone()),
            bridge: Arc::new(self.bridge.clone()),
            inbound_tls,
        };

        Router::new()
            .route("/", any(proxy_handler))
            .route("/{*path}", any(proxy_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Serve plain HTTP on `listener` until Ctrl+C.
    pub async fn run(self, listener: TcpListener) -> Result<(), ServerError> {
        self.run_until(listener, shutdown_signal()).await
    }

    /// Serve plain HTTP on `listener` until `shutdown` completes.
    pub async fn run_until<F>(self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, target_url = %self.config.target, "HTTP server starting");

        let app = self.router(false).into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Serve HTTPS on `addr` until Ctrl+C.
    pub async fn run_tls(self, addr: SocketAddr, tls: RustlsConfig) -> Result<(), ServerError> {
        tracing::info!(address = %addr, target_url = %self.config.target, "HTTPS server starting");

        let handle = axum_server::Handle::new();
        let shutdown = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.graceful_shutdown(Some(SHUTDOWN_GRACE));
        });

        let app = self.router(true).into_make_service_with_connect_info::<SocketAddr>();
        axum_server::bind_rustls(addr, tls).handle(handle).serve(app).await?;

        tracing::info!("HTTPS server stopped");
        Ok(())
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }
}

/// Whether the request asks for a WebSocket upgrade.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let has_token = |name: header::HeaderName, token: &str| {
        headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|part| part.trim().eq_ignore_ascii_case(token))
    };
    has_token(header::UPGRADE, "websocket") && has_token(header::CONNECTION, "upgrade")
}

/// Catch-all handler: every path and method goes to the single target.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    if is_websocket_upgrade(request.headers()) {
        state.bridge.handle(request, peer, state.inbound_tls).await
    } else {
        state.relay.forward(request).await
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
