//! Factories that stamp out secure sockets with a shared framing and timeout
//! configuration, leaving only the TLS material to be chosen per socket.

use crate::error::{CertificateManagerError, Result};
use crate::secure_socket::{ClientSocket, ServerSocket};
use crate::tls::{PeerVerification, TlsIdentity};
use openssl::x509::X509;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerSocketFactory {
    to_client_packet_bytes_length: usize,
    listening_limit_total: usize,
    accept_timeout: Duration,
    connection_read_timeout: Option<Duration>,
}

impl ServerSocketFactory {
    pub fn new(
        to_client_packet_bytes_length: usize,
        listening_limit_total: usize,
        accept_timeout_seconds: f64,
    ) -> Result<Self> {
        Ok(Self {
            to_client_packet_bytes_length,
            listening_limit_total,
            accept_timeout: seconds_to_duration("accept_timeout_seconds", accept_timeout_seconds)?,
            connection_read_timeout: None,
        })
    }

    /// Drop connections that stay silent in a read for longer than `seconds`.
    pub fn with_connection_read_timeout(mut self, seconds: f64) -> Result<Self> {
        self.connection_read_timeout =
            Some(seconds_to_duration("connection_read_timeout_seconds", seconds)?);
        Ok(self)
    }

    pub fn packet_bytes_length(&self) -> usize {
        self.to_client_packet_bytes_length
    }

    pub fn listening_limit_total(&self) -> usize {
        self.listening_limit_total
    }

    pub fn accept_timeout(&self) -> Duration {
        self.accept_timeout
    }

    /// A server socket presenting `identity`. With `client_root`, connecting
    /// clients must authenticate with a certificate issued by it.
    pub fn create(&self, identity: TlsIdentity, client_root: Option<X509>) -> Result<ServerSocket> {
        ServerSocket::new(
            self.to_client_packet_bytes_length,
            self.listening_limit_total,
            self.accept_timeout,
            self.connection_read_timeout,
            identity,
            client_root,
        )
    }
}

#[derive(Debug, Clone)]
pub struct ClientSocketFactory {
    to_server_packet_bytes_length: usize,
}

impl ClientSocketFactory {
    pub fn new(to_server_packet_bytes_length: usize) -> Self {
        Self {
            to_server_packet_bytes_length,
        }
    }

    pub fn packet_bytes_length(&self) -> usize {
        self.to_server_packet_bytes_length
    }

    /// An unconnected client socket verifying servers per `verification`, presenting
    /// `identity` when the server asks for a client certificate.
    pub fn create(
        &self,
        verification: PeerVerification,
        identity: Option<&TlsIdentity>,
    ) -> Result<ClientSocket> {
        ClientSocket::new(self.to_server_packet_bytes_length, verification, identity)
    }
}

fn seconds_to_duration(field: &str, seconds: f64) -> Result<Duration> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(CertificateManagerError::Configuration(format!(
            "{} must be a positive number of seconds, got {}",
            field, seconds
        )));
    }
    Ok(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_timeout_conversion() {
        let factory = ServerSocketFactory::new(4096, 10, 1.5).unwrap();
        assert_eq!(factory.accept_timeout(), Duration::from_millis(1500));
        assert_eq!(factory.packet_bytes_length(), 4096);
        assert_eq!(factory.listening_limit_total(), 10);
    }

    #[test]
    fn test_invalid_timeouts_rejected() {
        assert!(ServerSocketFactory::new(4096, 10, 0.0).is_err());
        assert!(ServerSocketFactory::new(4096, 10, -1.0).is_err());
        assert!(ServerSocketFactory::new(4096, 10, f64::NAN).is_err());
        let factory = ServerSocketFactory::new(4096, 10, 1.0).unwrap();
        assert!(factory.with_connection_read_timeout(0.0).is_err());
    }

    #[test]
    fn test_client_factory_rejects_zero_packet_length() {
        let factory = ClientSocketFactory::new(0);
        assert!(factory.create(PeerVerification::Unverified, None).is_err());
        assert!(ClientSocketFactory::new(4096)
            .create(PeerVerification::Unverified, None)
            .is_ok());
    }
}
