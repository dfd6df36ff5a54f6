//! Duplex message relay between the client and backend connections.
//!
//! # Data Flow
//! ```text
//! client ──read──▶ pump(client → backend) ──write──▶ backend
//! client ◀─write── pump(backend → client) ◀──read─── backend
//! ```
//!
//! # Design Decisions
//! - Each connection is split once; every half is owned by exactly one pump
//! - Messages are relayed whole, in order, with their type preserved
//! - The first pump to finish decides the outcome; the other is dropped at
//!   its current await point, then both connections are closed once

use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};

use crate::observability::metrics;
use crate::websocket::frame::{
    CloseReason, Frame, RelayError, ABNORMAL_CLOSURE, GOING_AWAY, NORMAL_CLOSURE,
};
use crate::websocket::session::{SessionState, SessionTracker};

/// Upper bound on flushing a close during teardown.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Which way a pump moves messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientToBackend => "client->backend",
            Self::BackendToClient => "backend->client",
        }
    }
}

/// How a relay direction ended.
#[derive(Debug)]
pub enum RelayOutcome {
    /// A close frame with a normal or going-away code, or no code at all.
    NormalClosure,
    /// A close frame with any other code.
    AbnormalClosure { code: u16, reason: String },
    /// A read or write failed without a close frame.
    TransportError(RelayError),
}

impl RelayOutcome {
    fn from_close(close: Option<&CloseReason>) -> Self {
        match close {
            None => Self::NormalClosure,
            Some(c) if c.code == NORMAL_CLOSURE || c.code == GOING_AWAY => Self::NormalClosure,
            Some(c) => Self::AbnormalClosure {
                code: c.code,
                reason: c.reason.clone(),
            },
        }
    }

    pub fn is_normal(&self) -> bool {
        matches!(self, Self::NormalClosure)
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::NormalClosure => "normal",
            Self::AbnormalClosure { .. } => "abnormal",
            Self::TransportError(_) => "transport-error",
        }
    }
}

/// Copy messages from `src` to `dst` until `src` ends or a write fails.
///
/// When `src` ends, a close frame is written to `dst`: the peer's own close
/// frame if it sent one, otherwise going-away with the failure as reason.
pub async fn pump<S, D>(src: &mut S, dst: &mut D) -> RelayOutcome
where
    S: Stream<Item = Result<Frame, RelayError>> + Unpin,
    D: Sink<Frame, Error = RelayError> + Unpin,
{
    loop {
        let frame = match src.next().await {
            Some(Ok(Frame::Close(close))) => {
                let outcome = RelayOutcome::from_close(close.as_ref());
                let _ = dst.send(Frame::Close(close)).await;
                return outcome;
            }
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                let close = CloseReason::new(GOING_AWAY, e.to_string());
                let _ = dst.send(Frame::Close(Some(close))).await;
                return RelayOutcome::TransportError(e);
            }
            None => {
                let close = CloseReason::new(GOING_AWAY, RelayError::Dropped.to_string());
                let _ = dst.send(Frame::Close(Some(close))).await;
                return RelayOutcome::TransportError(RelayError::Dropped);
            }
        };

        if let Err(e) = dst.send(frame).await {
            return RelayOutcome::TransportError(e);
        }
    }
}

/// One upgraded exchange: a client connection paired with a backend one.
pub struct RelaySession<C, B> {
    tracker: SessionTracker,
    client: C,
    backend: B,
}

impl<C, B> RelaySession<C, B>
where
    C: Stream<Item = Result<Frame, RelayError>> + Sink<Frame, Error = RelayError>,
    B: Stream<Item = Result<Frame, RelayError>> + Sink<Frame, Error = RelayError>,
{
    pub fn new(tracker: SessionTracker, client: C, backend: B) -> Self {
        Self {
            tracker,
            client,
            backend,
        }
    }

    /// Relay until either direction ends, then close both connections.
    pub async fn run(self) -> (Direction, RelayOutcome) {
        let Self {
            mut tracker,
            client,
            backend,
        } = self;
        let session_id = tracker.id();

        let (mut client_tx, mut client_rx) = client.split();
        let (mut backend_tx, mut backend_rx) = backend.split();

        tracker.advance(SessionState::Streaming);
        tracing::debug!(session_id = %session_id, "WebSocket relay started");

        let (direction, outcome) = tokio::select! {
            outcome = pump(&mut client_rx, &mut backend_tx) => (Direction::ClientToBackend, outcome),
            outcome = pump(&mut backend_rx, &mut client_tx) => (Direction::BackendToClient, outcome),
        };

        tracker.advance(SessionState::Closing);
        let (client_closed, backend_closed) = tokio::join!(
            tokio::time::timeout(CLOSE_GRACE, client_tx.close()),
            tokio::time::timeout(CLOSE_GRACE, backend_tx.close()),
        );
        tracing::trace!(
            session_id = %session_id,
            client_clean = matches!(client_closed, Ok(Ok(()))),
            backend_clean = matches!(backend_closed, Ok(Ok(()))),
            "Connections closed"
        );
        tracker.advance(SessionState::Closed);

        match &outcome {
            RelayOutcome::NormalClosure => {}
            RelayOutcome::AbnormalClosure { code, reason } => tracing::warn!(
                session_id = %session_id,
                direction = direction.as_str(),
                code,
                reason = %reason,
                "WebSocket closed abnormally"
            ),
            RelayOutcome::TransportError(e) => tracing::warn!(
                session_id = %session_id,
                direction = direction.as_str(),
                code = ABNORMAL_CLOSURE,
                error = %e,
                "WebSocket connection failed"
            ),
        }
        metrics::record_session_outcome(outcome.label());

        (direction, outcome)
    }
}
