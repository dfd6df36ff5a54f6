//! Session identity and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique session IDs for tracing
//! - Track session state (Dialing → Handshaking → Streaming → Closing → Closed)
//! - Keep the active-session gauge accurate

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::observability::metrics;

/// Source of session IDs. Only uniqueness matters, so ordering is relaxed.
static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a WebSocket session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Generate a new unique session ID.
    pub fn new() -> Self {
        Self(SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ws-{}", self.0)
    }
}

/// Session state. `Closed` is terminal whichever side ended the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connecting to the backend.
    Dialing,
    /// Backend accepted; upgrading the client connection.
    Handshaking,
    /// Both relay directions running.
    Streaming,
    /// A direction finished; closing both connections.
    Closing,
    /// Both connections closed.
    Closed,
}

impl SessionState {
    /// Whether `next` may follow `self`.
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Dialing, Handshaking)
                | (Dialing, Closed)
                | (Handshaking, Streaming)
                | (Handshaking, Closed)
                | (Streaming, Closing)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Dialing => "dialing",
            Self::Handshaking => "handshaking",
            Self::Streaming => "streaming",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Tracks one session's state and its place in the active-session gauge.
/// Dropping the tracker counts the session as closed.
#[derive(Debug)]
pub struct SessionTracker {
    id: SessionId,
    state: SessionState,
}

impl SessionTracker {
    /// Start tracking a session in the `Dialing` state.
    pub fn start() -> Self {
        let tracker = Self {
            id: SessionId::new(),
            state: SessionState::Dialing,
        };
        metrics::session_opened();
        tracing::trace!(session_id = %tracker.id, state = %tracker.state, "Session started");
        tracker
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`. Out-of-order transitions are ignored.
    pub fn advance(&mut self, next: SessionState) {
        if self.state.can_advance_to(next) {
            tracing::trace!(session_id = %self.id, from = %self.state, to = %next, "Session state");
            self.state = next;
        } else {
            tracing::debug!(session_id = %self.id, from = %self.state, to = %next, "Ignored session transition");
        }
    }
}

impl Drop for SessionTracker {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            tracing::trace!(session_id = %self.id, state = %self.state, "Session dropped before closing");
        }
        metrics::session_closed();
    }
}
