//! Error types shared by the certificate, transport and protocol layers.

use std::fmt::Display;

use thiserror::Error;

/// Errors produced by the certificate manager library.
///
/// Per-connection failures on the server are reported through these variants and
/// never escape the connection handler that produced them.
#[derive(Debug, Error)]
pub enum CertificateManagerError {
    /// Missing or mismatched key/certificate material at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The key pair could not be generated (unsupported size or primitive failure).
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate construction or signing failed.
    #[error("signing failed: {0}")]
    Signing(String),

    /// Connection, handshake or framing failure, or an error reported by the server.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed, unrecognized or out-of-version envelope.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CertificateManagerError {
    pub(crate) fn configuration(context: &str, err: impl Display) -> Self {
        Self::Configuration(format!("{}: {}", context, err))
    }

    pub(crate) fn key_generation(context: &str, err: impl Display) -> Self {
        Self::KeyGeneration(format!("{}: {}", context, err))
    }

    pub(crate) fn signing(context: &str, err: impl Display) -> Self {
        Self::Signing(format!("{}: {}", context, err))
    }

    pub(crate) fn transport(context: &str, err: impl Display) -> Self {
        Self::Transport(format!("{}: {}", context, err))
    }

    pub(crate) fn protocol(context: &str, err: impl Display) -> Self {
        Self::Protocol(format!("{}: {}", context, err))
    }
}

pub type Result<T> = std::result::Result<T, CertificateManagerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_is_prefixed() {
        let err = CertificateManagerError::signing("Failed to set subject", "bad name");
        assert_eq!(err.to_string(), "signing failed: Failed to set subject: bad name");
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: CertificateManagerError = io.into();
        assert!(matches!(err, CertificateManagerError::Io(_)));
    }
}
