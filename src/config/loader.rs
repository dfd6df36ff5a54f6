//! Configuration loading from disk and the command line.

use std::fs;
use std::path::Path;

use thiserror::Error;
use url::Url;

use crate::config::schema::{HostHeaderPolicy, ProxyConfig};
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading. Always fatal: no listener is
/// installed when one is returned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid {field} URL `{value}`: {source}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        #[source]
        source: url::ParseError,
    },

    #[error("no target configured")]
    MissingTarget,

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Values supplied on the command line. Each one replaces the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub target: Option<String>,
    pub upstream_proxy: Option<String>,
    pub bind_address: Option<String>,
    pub host_header: Option<HostHeaderPolicy>,
    pub insecure_skip_verify: bool,
    pub debug: bool,
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let config = read_config(path)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Build the process configuration from an optional file plus overrides.
pub fn build_config(path: Option<&Path>, overrides: Overrides) -> Result<ProxyConfig, ConfigError> {
    let mut config = match (path, &overrides.target) {
        (Some(path), _) => read_config(path)?,
        (None, Some(target)) => ProxyConfig::new(parse_url("target", target)?),
        (None, None) => return Err(ConfigError::MissingTarget),
    };

    if let Some(target) = &overrides.target {
        config.target = parse_url("target", target)?;
    }
    if let Some(proxy) = &overrides.upstream_proxy {
        config.upstream_proxy = Some(parse_url("upstream proxy", proxy)?);
    }
    if let Some(addr) = overrides.bind_address {
        config.listener.bind_address = addr;
    }
    if let Some(policy) = overrides.host_header {
        config.host_header = policy;
    }
    config.tls.insecure_skip_verify |= overrides.insecure_skip_verify;
    config.observability.debug |= overrides.debug;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Parse a TOML file without validating it, so overrides apply first.
fn read_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

fn parse_url(field: &'static str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
        source,
    })
}
