//! TLS material and OpenSSL context construction for secure sockets.

use crate::certificate::Certificate;
use crate::error::{CertificateManagerError, Result};
use openssl::pkey::{PKey, Private};
use openssl::ssl::{SslAcceptor, SslConnector, SslMethod, SslVerifyMode};
use openssl::x509::X509;
use std::fmt;
use std::path::Path;

/// A certificate and its private key presented during the TLS handshake.
#[derive(Clone)]
pub struct TlsIdentity {
    certificate: X509,
    private_key: PKey<Private>,
}

impl TlsIdentity {
    /// Load a PEM private key and certificate from disk.
    pub fn from_files(
        private_key_path: impl AsRef<Path>,
        certificate_path: impl AsRef<Path>,
    ) -> Result<Self> {
        Self::from_certificate(&Certificate::load_from_file(private_key_path, certificate_path)?)
    }

    /// Use an in-memory certificate. It must hold its private key.
    pub fn from_certificate(certificate: &Certificate) -> Result<Self> {
        let private_key = certificate.private_key().cloned().ok_or_else(|| {
            CertificateManagerError::Configuration(format!(
                "Certificate '{}' has no private key and cannot be used as a TLS identity",
                certificate.subject_name()
            ))
        })?;
        Ok(Self {
            certificate: certificate.x509().clone(),
            private_key,
        })
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("certificate", &self.certificate.subject_name())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// How a client socket authenticates the server it connects to.
#[derive(Clone)]
pub enum PeerVerification {
    /// Verify the chain against this root and check the host name or IP address.
    TrustedRoot(X509),
    /// Accept any server certificate. Callers are expected to pin what they see.
    Unverified,
}

impl PeerVerification {
    pub fn from_root_file(root_certificate_path: impl AsRef<Path>) -> Result<Self> {
        let root = Certificate::load_certificate_file(root_certificate_path)?;
        Ok(Self::TrustedRoot(root.x509().clone()))
    }

    pub fn from_root(root: &Certificate) -> Self {
        Self::TrustedRoot(root.x509().clone())
    }

    pub fn verifies_peer(&self) -> bool {
        matches!(self, Self::TrustedRoot(_))
    }
}

impl fmt::Debug for PeerVerification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TrustedRoot(root) => f
                .debug_tuple("TrustedRoot")
                .field(&root.subject_name())
                .finish(),
            Self::Unverified => f.write_str("Unverified"),
        }
    }
}

/// Server context presenting `identity`; with `client_root`, clients must present a
/// certificate chaining to it.
pub(crate) fn build_acceptor(
    identity: &TlsIdentity,
    client_root: Option<&X509>,
) -> Result<SslAcceptor> {
    let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())
        .map_err(|e| CertificateManagerError::configuration("Failed to create TLS acceptor", e))?;
    builder
        .set_certificate(&identity.certificate)
        .map_err(|e| {
            CertificateManagerError::configuration("Failed to set server certificate", e)
        })?;
    builder
        .set_private_key(&identity.private_key)
        .map_err(|e| {
            CertificateManagerError::configuration("Failed to set server private key", e)
        })?;
    builder.check_private_key().map_err(|e| {
        CertificateManagerError::configuration("Server private key does not match certificate", e)
    })?;

    if let Some(root) = client_root {
        builder
            .cert_store_mut()
            .add_cert(root.clone())
            .map_err(|e| CertificateManagerError::configuration("Failed to trust client root", e))?;
        builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
    }

    Ok(builder.build())
}

pub(crate) fn build_connector(
    verification: &PeerVerification,
    identity: Option<&TlsIdentity>,
) -> Result<SslConnector> {
    let mut builder = SslConnector::builder(SslMethod::tls())
        .map_err(|e| CertificateManagerError::configuration("Failed to create TLS connector", e))?;

    match verification {
        PeerVerification::TrustedRoot(root) => {
            builder
                .cert_store_mut()
                .add_cert(root.clone())
                .map_err(|e| CertificateManagerError::configuration("Failed to trust root", e))?;
            builder.set_verify(SslVerifyMode::PEER);
        }
        PeerVerification::Unverified => builder.set_verify(SslVerifyMode::NONE),
    }

    if let Some(identity) = identity {
        builder.set_certificate(&identity.certificate).map_err(|e| {
            CertificateManagerError::configuration("Failed to set client certificate", e)
        })?;
        builder.set_private_key(&identity.private_key).map_err(|e| {
            CertificateManagerError::configuration("Failed to set client private key", e)
        })?;
        builder.check_private_key().map_err(|e| {
            CertificateManagerError::configuration(
                "Client private key does not match certificate",
                e,
            )
        })?;
    }

    Ok(builder.build())
}
