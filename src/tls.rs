//! TLS utilities for loading certificates and configuring mTLS.
//!
//! The server presents its own identity and requires clients to present a
//! certificate signed by the configured client CA; rustls (via tonic's `tls`
//! feature) only negotiates TLS 1.2+ with AEAD ECDHE suites, so no cipher
//! configuration is exposed here.

use std::path::{Path, PathBuf};

use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

/// Error type for TLS configuration issues.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("CA certificate not found: {0}")]
    CaCertNotFound(PathBuf),

    #[error("certificate not found: {0}")]
    CertNotFound(PathBuf),

    #[error("private key not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("failed to read file: {0}")]
    IoError(#[from] std::io::Error),
}

/// Loaded TLS materials ready for use with tonic.
///
/// Contains this endpoint's identity (certificate + private key) and the CA
/// certificate used to verify the peer side.
#[derive(Clone)]
pub struct TlsIdentity {
    /// This endpoint's identity (certificate + private key)
    identity: Identity,
    /// CA certificate for verifying peers
    peer_ca: Certificate,
}

impl TlsIdentity {
    /// Load TLS materials from PEM files.
    ///
    /// # Errors
    ///
    /// Returns an error if any file does not exist or cannot be read.
    pub async fn load(peer_ca: &Path, cert: &Path, key: &Path) -> Result<Self, TlsError> {
        // Validate paths exist before reading
        if !peer_ca.exists() {
            return Err(TlsError::CaCertNotFound(peer_ca.to_path_buf()));
        }
        if !cert.exists() {
            return Err(TlsError::CertNotFound(cert.to_path_buf()));
        }
        if !key.exists() {
            return Err(TlsError::KeyNotFound(key.to_path_buf()));
        }

        let ca_pem = fs::read(peer_ca).await?;
        let cert_pem = fs::read(cert).await?;
        let key_pem = fs::read(key).await?;

        Ok(Self::from_pem(ca_pem, cert_pem, key_pem))
    }

    /// Build TLS materials from in-memory PEM data.
    pub fn from_pem(
        peer_ca_pem: impl AsRef<[u8]>,
        cert_pem: impl AsRef<[u8]>,
        key_pem: impl AsRef<[u8]>,
    ) -> Self {
        Self {
            identity: Identity::from_pem(cert_pem, key_pem),
            peer_ca: Certificate::from_pem(peer_ca_pem),
        }
    }

    /// Create a server TLS config with client certificate verification (mTLS).
    ///
    /// The returned config:
    /// - Presents this endpoint's certificate to clients
    /// - Requires clients to present a valid certificate
    /// - Verifies client certificates against the CA
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity.clone())
            .client_ca_root(self.peer_ca.clone())
    }

    /// Create a client TLS config for connecting to a server.
    ///
    /// The returned config:
    /// - Presents this endpoint's certificate to the server
    /// - Verifies the server's certificate against the CA
    pub fn client_tls_config(&self, domain: &str) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .domain_name(domain)
            .ca_certificate(self.peer_ca.clone())
            .identity(self.identity.clone())
    }
}
