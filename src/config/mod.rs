//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML) + command-line overrides
//!     → loader.rs (parse, deserialize, apply overrides)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → each component copies the sections it needs at construction
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; there is no process-wide mutable state
//! - All sections have defaults so a target URL alone is a complete config
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{build_config, load_config, ConfigError, Overrides};
pub use schema::{
    BackendTlsConfig, HostHeaderPolicy, ListenerConfig, ObservabilityConfig, PoolConfig,
    ProxyConfig, TimeoutConfig, TlsConfig, WebSocketSettings,
};
