//! Message adaptation between the two WebSocket legs.
//!
//! The client leg is an axum [`WebSocket`], the backend leg a
//! `tokio-tungstenite` stream. Both are mapped onto [`Frame`] so the relay
//! loops are written once. Ping and pong are answered by each leg's
//! library and never cross the proxy.

use axum::extract::ws::{self, WebSocket};
use bytes::Bytes;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{
    self,
    protocol::{frame::coding::CloseCode, CloseFrame},
};
use tokio_tungstenite::WebSocketStream;

/// Close code for a normal shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code sent when the opposite leg failed without a close frame.
pub const GOING_AWAY: u16 = 1001;
/// Reported (never sent) when a connection dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Longest close reason that fits a control frame.
const MAX_REASON_LEN: usize = 123;

/// Error type for a steady-state read or write on either leg.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("client connection: {0}")]
    Client(#[from] axum::Error),

    #[error("backend connection: {0}")]
    Backend(#[from] tungstenite::Error),

    #[error("connection dropped without a close frame")]
    Dropped,
}

/// Code and reason carried by a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    /// A close reason, truncated to fit a control frame.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        let mut reason = reason.into();
        if reason.len() > MAX_REASON_LEN {
            let mut end = MAX_REASON_LEN;
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            reason.truncate(end);
        }
        Self { code, reason }
    }
}

/// A complete WebSocket message. Payloads are opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Close(Option<CloseReason>),
}

impl Frame {
    fn from_client(message: ws::Message) -> Option<Self> {
        match message {
            ws::Message::Text(text) => Some(Self::Text(text.as_str().to_owned())),
            ws::Message::Binary(data) => Some(Self::Binary(data)),
            ws::Message::Close(frame) => Some(Self::Close(
                frame.map(|f| CloseReason::new(f.code, f.reason.as_str())),
            )),
            ws::Message::Ping(_) | ws::Message::Pong(_) => None,
        }
    }

    fn into_client(self) -> ws::Message {
        match self {
            Self::Text(text) => ws::Message::Text(text.into()),
            Self::Binary(data) => ws::Message::Binary(data),
            Self::Close(close) => ws::Message::Close(close.map(|c| ws::CloseFrame {
                code: c.code,
                reason: c.reason.into(),
            })),
        }
    }

    fn from_backend(message: tungstenite::Message) -> Option<Self> {
        match message {
            tungstenite::Message::Text(text) => Some(Self::Text(text.as_str().to_owned())),
            tungstenite::Message::Binary(data) => Some(Self::Binary(data)),
            tungstenite::Message::Close(frame) => Some(Self::Close(
                frame.map(|f| CloseReason::new(u16::from(f.code), f.reason.as_str())),
            )),
            tungstenite::Message::Ping(_)
            | tungstenite::Message::Pong(_)
            | tungstenite::Message::Frame(_) => None,
        }
    }

    fn into_backend(self) -> tungstenite::Message {
        match self {
            Self::Text(text) => tungstenite::Message::Text(text.into()),
            Self::Binary(data) => tungstenite::Message::Binary(data),
            Self::Close(close) => tungstenite::Message::Close(close.map(|c| CloseFrame {
                code: CloseCode::from(c.code),
                reason: c.reason.into(),
            })),
        }
    }
}

/// View the client connection as a stream and sink of [`Frame`]s.
pub fn client_channel(
    socket: WebSocket,
) -> impl Stream<Item = Result<Frame, RelayError>> + Sink<Frame, Error = RelayError> + Send + Unpin {
    socket
        .with(|frame: Frame| future::ready(Ok::<_, RelayError>(frame.into_client())))
        .filter_map(|message| {
            future::ready(match message {
                Ok(message) => Frame::from_client(message).map(Ok),
                Err(e) => Some(Err(RelayError::Client(e))),
            })
        })
}

/// View the backend connection as a stream and sink of [`Frame`]s.
pub fn backend_channel<S>(
    stream: WebSocketStream<S>,
) -> impl Stream<Item = Result<Frame, RelayError>> + Sink<Frame, Error = RelayError> + Send + Unpin
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    stream
        .with(|frame: Frame| future::ready(Ok::<_, RelayError>(frame.into_backend())))
        .filter_map(|message| {
            future::ready(match message {
                Ok(message) => Frame::from_backend(message).map(Ok),
                Err(e) => Some(Err(RelayError::Backend(e))),
            })
        })
}
