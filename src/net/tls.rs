//! TLS configuration: listener certificates and backend trust mode.

use std::path::Path;

use axum_server::tls_rustls::RustlsConfig;

use crate::config::BackendTlsConfig;

/// Load TLS configuration from certificate and key files.
pub async fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig, std::io::Error> {
    if !cert_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Certificate file not found: {:?}", cert_path),
        ));
    }
    if !key_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Private key file not found: {:?}", key_path),
        ));
    }

    RustlsConfig::from_pem_file(cert_path, key_path).await
}

/// Build the connector used for TLS to the backend.
///
/// With `insecure_skip_verify` every certificate and host name is accepted.
pub fn backend_connector(config: &BackendTlsConfig) -> Result<native_tls::TlsConnector, native_tls::Error> {
    let mut builder = native_tls::TlsConnector::builder();
    if config.insecure_skip_verify {
        tracing::warn!("Backend TLS certificate verification is disabled");
        builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }
    builder.build()
}
