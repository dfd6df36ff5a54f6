//! Dual-protocol reverse proxy.
//!
//! Plain HTTP requests are rewritten for a single target origin and relayed
//! through a pooled client. WebSocket upgrades are bridged to the target and
//! relayed message by message. Both legs can be tunneled through an upstream
//! forward proxy.
//!
//! ```text
//!     Client ──▶ http::server ──┬─▶ http::relay ──▶ net::transport ──┐
//!                               │                                    ├─▶ [upstream proxy] ─▶ Target
//!                               └─▶ websocket::bridge ─▶ dialer ─────┘
//!                                         │
//!                                   websocket::relay (duplex)
//! ```

pub mod config;
pub mod http;
pub mod net;
pub mod observability;
pub mod websocket;

pub use config::schema::ProxyConfig;
pub use http::HttpServer;
