//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, upgrade detection)
//!     → relay.rs (one forwarded round trip)
//!         → policy.rs (rewrite scheme, host, Host, User-Agent)
//!         → net::transport (pooled outbound client)
//!     → Send to client
//! ```

pub mod policy;
pub mod relay;
pub mod server;

pub use policy::{ForwardedRequest, ForwardingPolicy, OutboundBody, TargetPolicy};
pub use relay::HttpRelay;
pub use server::{is_websocket_upgrade, HttpServer, ServerError};
