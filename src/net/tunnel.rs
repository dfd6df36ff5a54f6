//! HTTP CONNECT tunnels through the upstream forward proxy.
//!
//! The HTTP leg gets tunneling from the pooled client; WebSocket dials open
//! their own connection and use this module instead.

use base64::{engine::general_purpose, Engine as _};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

/// Largest CONNECT response head accepted from the proxy.
const MAX_RESPONSE_HEAD: usize = 8192;

/// Error type for tunnel establishment.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("upstream proxy I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("upstream proxy refused CONNECT: {0}")]
    Refused(String),

    #[error("upstream proxy sent a malformed CONNECT response")]
    Malformed,
}

/// A forward proxy reachable over plain HTTP.
#[derive(Debug, Clone)]
pub struct UpstreamProxy {
    host: String,
    port: u16,
    authorization: Option<String>,
}

impl UpstreamProxy {
    /// Describe the proxy at `url`. Userinfo becomes basic credentials.
    pub fn from_url(url: &Url) -> Option<Self> {
        let host = url.host_str()?.to_string();
        let port = url.port_or_known_default()?;
        let authorization = (!url.username().is_empty()).then(|| {
            let credentials = format!("{}:{}", url.username(), url.password().unwrap_or_default());
            format!("Basic {}", general_purpose::STANDARD.encode(credentials))
        });
        Some(Self {
            host,
            port,
            authorization,
        })
    }

    /// `host:port` of the proxy itself.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Open a TCP stream to `host:port` through the proxy.
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, TunnelError> {
        let mut stream = TcpStream::connect((self.host.as_str(), self.port)).await?;

        let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
        if let Some(auth) = &self.authorization {
            request.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;

        let head = read_response_head(&mut stream).await?;
        let status_line = head.lines().next().unwrap_or_default();
        match status_line.split_whitespace().nth(1) {
            Some("200") => {
                tracing::debug!(proxy = %self.authority(), host, port, "CONNECT tunnel established");
                Ok(stream)
            }
            Some(_) => Err(TunnelError::Refused(status_line.to_string())),
            None => Err(TunnelError::Malformed),
        }
    }
}

/// Read up to and including the blank line, one byte at a time so no
/// tunneled bytes are consumed.
async fn read_response_head(stream: &mut TcpStream) -> Result<String, TunnelError> {
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(TunnelError::Malformed);
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(TunnelError::Malformed);
        }
        head.push(byte[0]);
    }
    String::from_utf8(head).map_err(|_| TunnelError::Malformed)
}
