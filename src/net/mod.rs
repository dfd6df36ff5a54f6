//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound HTTP request
//!     → transport.rs (pooled client, caps, timeouts, proxy)
//!
//! Outbound WebSocket dial
//!     → tunnel.rs (CONNECT through the upstream proxy, when set)
//!     → tls.rs (backend trust mode)
//!
//! Inbound listener
//!     → tls.rs (optional certificate and key)
//! ```

pub mod tls;
pub mod transport;
pub mod tunnel;
