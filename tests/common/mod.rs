//! Shared utilities for integration testing.
//!
//! Every helper binds an ephemeral local port and returns the address, so
//! tests run in parallel without port clashes.

#![allow(dead_code)]

use std::future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{self, WebSocket, WebSocketUpgrade},
        Request,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::{
    handshake::server::{ErrorResponse, Request as WsRequest, Response as WsResponse},
    protocol::{frame::coding::CloseCode, CloseFrame},
    Message,
};
use url::Url;

use relay_proxy::{HttpServer, ProxyConfig};

/// Upper bound for any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(5);

/// Config pointing at `target` with every other section at its default.
pub fn config_for(target: &str) -> ProxyConfig {
    ProxyConfig::new(Url::parse(target).unwrap())
}

/// Start the proxy on an ephemeral port. It runs until the test ends.
pub async fn start_proxy(config: ProxyConfig) -> SocketAddr {
    start_server(HttpServer::new(config).unwrap()).await
}

/// Start an already built server on an ephemeral port.
pub async fn start_server(server: HttpServer) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.run_until(listener, future::pending()).await;
    });
    addr
}

/// A port nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// HTTP client that talks to the proxy directly and never follows redirects.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

/// Backend that reflects what it received in `x-echo-*` headers and echoes
/// the body. `/status/{code}` answers with that status, `/redirect` with 302.
pub async fn start_echo_backend() -> SocketAddr {
    async fn echo(request: Request) -> Response {
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();

        if let Some(code) = parts.uri.path().strip_prefix("/status/") {
            let status = code.parse().ok().and_then(|c| StatusCode::from_u16(c).ok());
            return status.unwrap_or(StatusCode::BAD_REQUEST).into_response();
        }
        if parts.uri.path() == "/redirect" {
            return (StatusCode::FOUND, [(header::LOCATION, "/elsewhere")]).into_response();
        }

        let mut headers = HeaderMap::new();
        let text = |value: &str| HeaderValue::from_str(value).unwrap_or(HeaderValue::from_static("?"));
        headers.insert("x-echo-method", text(parts.method.as_str()));
        headers.insert("x-echo-uri", text(&parts.uri.to_string()));
        if let Some(host) = parts.headers.get(header::HOST) {
            headers.insert("x-echo-host", host.clone());
        }
        match parts.headers.get(header::USER_AGENT) {
            Some(agent) => {
                headers.insert("x-echo-user-agent", agent.clone());
            }
            None => {
                headers.insert("x-echo-user-agent-absent", HeaderValue::from_static("true"));
            }
        }
        (headers, body).into_response()
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/", any(echo)).route("/{*path}", any(echo));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// What a WebSocket backend does after the handshake.
#[derive(Debug, Clone, Copy)]
pub enum WsBehavior {
    /// Answer text `ping` with binary `01 02`, echo everything else.
    PingBinary,
    /// Close with 1000 `bye` after the first message.
    CloseAfterFirst,
}

/// Observations from a WebSocket backend, in order.
#[derive(Debug)]
pub enum WsEvent {
    Handshake { uri: String, headers: HeaderMap },
    Received(Message),
    Closed(Option<CloseFrame>),
    Failed(String),
}

/// WebSocket backend that accepts one subprotocol, sets a cookie and
/// reports every event on the returned channel.
pub async fn start_ws_backend(behavior: WsBehavior) -> (SocketAddr, mpsc::UnboundedReceiver<WsEvent>) {
    start_ws_backend_on("127.0.0.1:0", behavior).await
}

/// [`start_ws_backend`] on a chosen local address.
pub async fn start_ws_backend_on(
    bind: &str,
    behavior: WsBehavior,
) -> (SocketAddr, mpsc::UnboundedReceiver<WsEvent>) {
    let listener = TcpListener::bind(bind).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (events, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let events = events.clone();
            tokio::spawn(serve_ws(stream, behavior, events));
        }
    });
    (addr, rx)
}

async fn serve_ws(stream: TcpStream, behavior: WsBehavior, events: mpsc::UnboundedSender<WsEvent>) {
    let handshake_events = events.clone();
    let callback = move |request: &WsRequest, mut response: WsResponse| {
        let _ = handshake_events.send(WsEvent::Handshake {
            uri: request.uri().to_string(),
            headers: request.headers().clone(),
        });
        let first_protocol = request
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|p| p.trim().to_string());
        if let Some(protocol) = first_protocol {
            response
                .headers_mut()
                .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_str(&protocol).unwrap());
        }
        response
            .headers_mut()
            .append(header::SET_COOKIE, HeaderValue::from_static("session=abc"));
        Ok::<_, ErrorResponse>(response)
    };

    let mut socket = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(socket) => socket,
        Err(e) => {
            let _ = events.send(WsEvent::Failed(e.to_string()));
            return;
        }
    };

    while let Some(message) = socket.next().await {
        match message {
            Ok(Message::Close(frame)) => {
                let _ = events.send(WsEvent::Closed(frame));
                return;
            }
            Ok(message @ (Message::Text(_) | Message::Binary(_))) => {
                let reply = match (&message, behavior) {
                    (Message::Text(text), WsBehavior::PingBinary) if text.as_str() == "ping" => {
                        Message::Binary(Bytes::from_static(&[0x01, 0x02]))
                    }
                    (_, WsBehavior::PingBinary) => message.clone(),
                    (_, WsBehavior::CloseAfterFirst) => Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "bye".into(),
                    })),
                };
                let _ = events.send(WsEvent::Received(message));
                if socket.send(reply).await.is_err() {
                    return;
                }
            }
            Ok(_) => {}
            Err(e) => {
                let _ = events.send(WsEvent::Failed(e.to_string()));
                return;
            }
        }
    }
    let _ = events.send(WsEvent::Closed(None));
}

/// Backend that answers every request with `401 Unauthorized` and body
/// `denied`. The body goes out in a later segment than the head.
pub async fn start_rejecting_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = read_head(&mut socket).await;
                let head = "HTTP/1.1 401 Unauthorized\r\n\
                    Content-Type: text/plain\r\n\
                    WWW-Authenticate: Bearer\r\n\
                    Content-Length: 6\r\n\
                    Connection: close\r\n\r\n";
                if socket.write_all(head.as_bytes()).await.is_err() || socket.flush().await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
                let _ = socket.write_all(b"denied").await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// Backend that answers one request with a chunked body: `first` right
/// away, then `second` once the returned sender fires.
pub async fn start_chunked_backend() -> (SocketAddr, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (release, released) = oneshot::channel();
    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let _ = read_head(&mut socket).await;
        let head = "HTTP/1.1 200 OK\r\n\
            Content-Type: text/plain\r\n\
            Transfer-Encoding: chunked\r\n\r\n\
            5\r\nfirst\r\n";
        if socket.write_all(head.as_bytes()).await.is_err() || socket.flush().await.is_err() {
            return;
        }
        let _ = released.await;
        let _ = socket.write_all(b"6\r\nsecond\r\n0\r\n\r\n").await;
        let _ = socket.shutdown().await;
    });
    (addr, release)
}

/// HTTPS and WSS backend with a freshly generated self-signed certificate.
/// `/` answers `secure`; `/ws` upgrades and echoes data messages.
pub async fn start_tls_backend() -> SocketAddr {
    async fn echo(mut socket: WebSocket) {
        while let Some(Ok(message)) = socket.recv().await {
            if matches!(message, ws::Message::Text(_) | ws::Message::Binary(_))
                && socket.send(message).await.is_err()
            {
                break;
            }
        }
    }

    let certified =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
    let tls = RustlsConfig::from_pem(
        certified.cert.pem().into_bytes(),
        certified.key_pair.serialize_pem().into_bytes(),
    )
    .await
    .unwrap();

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new()
        .route("/", any(|| async { "secure" }))
        .route("/ws", any(|upgrade: WebSocketUpgrade| async move { upgrade.on_upgrade(echo) }));
    tokio::spawn(async move {
        let _ = axum_server::from_tcp_rustls(listener, tls)
            .serve(app.into_make_service())
            .await;
    });
    addr
}

/// Forward proxy handling CONNECT and absolute-form requests. Records the
/// request line of every connection it serves.
#[derive(Clone)]
pub struct MockForwardProxy {
    pub addr: SocketAddr,
    request_lines: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
}

impl MockForwardProxy {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = Self {
            addr: listener.local_addr().unwrap(),
            request_lines: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(AtomicUsize::new(0)),
        };

        let handle = proxy.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                handle.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(handle.clone().serve(socket));
            }
        });
        proxy
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn request_lines(&self) -> Vec<String> {
        self.request_lines.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    async fn serve(self, mut client: TcpStream) {
        let Some(head) = read_head(&mut client).await else {
            return;
        };
        let text = String::from_utf8_lossy(&head).into_owned();
        let request_line = text.lines().next().unwrap_or_default().to_string();
        self.request_lines.lock().unwrap().push(request_line.clone());

        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default();
        let target = parts.next().unwrap_or_default();

        if method == "CONNECT" {
            let Ok(mut upstream) = TcpStream::connect(target).await else {
                let _ = client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
                return;
            };
            let _ = client.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await;
            let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
        } else {
            let Some(authority) = Url::parse(target).ok().and_then(|u| {
                Some(format!("{}:{}", u.host_str()?, u.port_or_known_default()?))
            }) else {
                return;
            };
            let Ok(mut upstream) = TcpStream::connect(authority).await else {
                let _ = client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
                return;
            };
            if upstream.write_all(&head).await.is_ok() {
                let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
            }
        }
    }
}

/// Read a request or response head, through the blank line.
async fn read_head(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.ok()? == 0 {
            return None;
        }
        head.push(byte[0]);
    }
    Some(head)
}
