//! WebSocket proxying subsystem.
//!
//! # Data Flow
//! ```text
//! Upgrade request
//!     → bridge.rs (backend URL, handshake headers, accept or reject)
//!     → dialer.rs (TCP or CONNECT tunnel, TLS, opening handshake)
//!     → relay.rs (two pumps, first to finish tears the session down)
//!
//! Session States (session.rs):
//!     Dialing → Handshaking → Streaming → Closing → Closed
//! ```
//!
//! frame.rs maps both WebSocket libraries onto one message type.

pub mod bridge;
pub mod dialer;
pub mod frame;
pub mod relay;
pub mod session;

pub use bridge::{HandshakeBridge, HandshakeStrategy, RebaseOnTarget};
pub use dialer::{BackendDialer, BackendRejection, DialError};
pub use relay::{Direction, RelayOutcome, RelaySession};
pub use session::{SessionId, SessionState, SessionTracker};
