//! Certificate Manager Client
//!
//! Requests the root certificate and newly issued certificates from a
//! [`CertificateManagerServer`](crate::certificate_manager_server::CertificateManagerServer).
//!
//! # Server Trust
//! The server presents the root certificate as its TLS identity. The client pins the
//! SHA-256 fingerprint of that certificate:
//! - configured with a trusted root ([`CertificateManagerClient::with_trusted_root`]),
//!   the pin is that root and any other server is refused;
//! - otherwise the first certificate seen is pinned and every later connection must
//!   present the same one.
//!
//! The TLS handshake proves the server holds the private key of the certificate it
//! presents, so a matching pin authenticates the server.
//!
//! # Example
//! ```rust,no_run
//! use certificate_manager::certificate_manager_client::CertificateManagerClient;
//! use certificate_manager::host_pointer::HostPointer;
//! use certificate_manager::socket_factory::ClientSocketFactory;
//! # fn example() -> certificate_manager::error::Result<()> {
//! let client = CertificateManagerClient::new(
//!     ClientSocketFactory::new(4096),
//!     HostPointer::new("127.0.0.1", 35123),
//! );
//! let root = client.get_root_certificate("root.pem")?;
//! let issued = client.request_certificate("svc-a")?;
//! assert!(issued.verify_signed_by(&root)?);
//! issued.save_to_file("svc-a.key", "svc-a.pem")?;
//! # Ok(())
//! # }
//! ```

use crate::certificate::Certificate;
use crate::error::{CertificateManagerError, Result};
use crate::host_pointer::HostPointer;
use crate::protocol::{deserialize_response, serialize_request, Request, Response};
use crate::secure_socket::ClientSocket;
use crate::socket_factory::ClientSocketFactory;
use crate::tls::PeerVerification;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub struct CertificateManagerClient {
    client_socket_factory: ClientSocketFactory,
    server_host_pointer: HostPointer,
    pinned_fingerprint: Mutex<Option<Vec<u8>>>,
}

impl CertificateManagerClient {
    /// A client that trusts the first server certificate it sees.
    pub fn new(
        client_socket_factory: ClientSocketFactory,
        server_host_pointer: HostPointer,
    ) -> Self {
        Self {
            client_socket_factory,
            server_host_pointer,
            pinned_fingerprint: Mutex::new(None),
        }
    }

    /// Only talk to a server presenting `root`.
    pub fn with_trusted_root(self, root: &Certificate) -> Result<Self> {
        let fingerprint = root.fingerprint_sha256()?;
        *self.pin()? = Some(fingerprint);
        Ok(self)
    }

    /// Only talk to a server presenting the root certificate stored at
    /// `root_certificate_path`.
    pub fn with_trusted_root_file(self, root_certificate_path: impl AsRef<Path>) -> Result<Self> {
        let root = Certificate::load_certificate_file(root_certificate_path)?;
        self.with_trusted_root(&root)
    }

    /// Fetch the root certificate and write it as PEM to `save_to_file_path`.
    ///
    /// The root must be self-signed and must be the certificate the server
    /// authenticated with.
    pub fn get_root_certificate(&self, save_to_file_path: impl AsRef<Path>) -> Result<Certificate> {
        let (response, server_certificate) = self.exchange(&Request::GetRootCertificate)?;
        let pem = match response {
            Response::RootCertificate { certificate } => certificate,
            other => return Err(unexpected_response(other)),
        };

        let root = Certificate::from_pem(pem.as_bytes(), None)?;
        if !root.is_self_signed()? {
            return Err(CertificateManagerError::Protocol(format!(
                "Root certificate '{}' is not self-signed",
                root.subject_name()
            )));
        }
        if root.fingerprint_sha256()? != server_certificate.fingerprint_sha256()? {
            return Err(CertificateManagerError::Transport(
                "Root certificate differs from the certificate the server authenticated with"
                    .to_string(),
            ));
        }

        root.save_certificate_to_file(&save_to_file_path)?;
        info!(
            subject = root.subject_name(),
            path = %save_to_file_path.as_ref().display(),
            "saved root certificate"
        );
        Ok(root)
    }

    /// Ask the server to issue a certificate for `name`.
    ///
    /// The result holds the newly generated private key, checked against the
    /// certificate, and is signed by the server's root.
    pub fn request_certificate(&self, name: &str) -> Result<Certificate> {
        let (response, server_certificate) = self.exchange(&Request::RequestCertificate {
            name: name.to_string(),
        })?;
        let (certificate, private_key) = match response {
            Response::IssuedCertificate {
                certificate,
                private_key,
            } => (certificate, private_key),
            other => return Err(unexpected_response(other)),
        };

        let issued = Certificate::from_pem(certificate.as_bytes(), Some(private_key.as_bytes()))?;
        if !issued.verify_signed_by(&server_certificate)? {
            return Err(CertificateManagerError::Protocol(format!(
                "Issued certificate '{}' is not signed by the server root",
                issued.subject_name()
            )));
        }
        let serial = issued.serial_number_hex()?;
        debug!(name, serial = %serial, "received certificate");
        Ok(issued)
    }

    /// Fingerprint the client currently trusts, if any.
    pub fn pinned_fingerprint(&self) -> Option<Vec<u8>> {
        self.pin().ok().and_then(|pin| pin.clone())
    }

    pub fn server_host_pointer(&self) -> &HostPointer {
        &self.server_host_pointer
    }

    /// One request over a fresh connection. Returns the response together with the
    /// certificate the server authenticated with.
    fn exchange(&self, request: &Request) -> Result<(Response, Certificate)> {
        let payload = serialize_request(request)?;
        let mut socket = self
            .client_socket_factory
            .create(PeerVerification::Unverified, None)?;
        socket.connect_to_server(
            self.server_host_pointer.host_address(),
            self.server_host_pointer.host_port(),
        )?;

        let reply = self
            .check_server_identity(&socket)
            .and_then(|server_certificate| {
                socket.write(&payload)?;
                Ok((socket.read()?, server_certificate))
            });
        if let Err(e) = socket.close() {
            debug!(error = %e, "close failed");
        }
        let (reply, server_certificate) = reply?;

        match deserialize_response(&reply)? {
            Response::Error { message } => Err(CertificateManagerError::Transport(format!(
                "server reported error: {}",
                message
            ))),
            response => Ok((response, server_certificate)),
        }
    }

    fn check_server_identity(&self, socket: &ClientSocket) -> Result<Certificate> {
        let server_certificate = socket.peer_certificate().ok_or_else(|| {
            CertificateManagerError::Transport("Server presented no certificate".to_string())
        })?;
        let presented = server_certificate.fingerprint_sha256()?;

        let mut pin = self.pin()?;
        match pin.as_ref() {
            Some(expected) if *expected == presented => {}
            Some(expected) => {
                warn!(
                    server = %self.server_host_pointer,
                    expected = %hex::encode(expected),
                    presented = %hex::encode(&presented),
                    "server certificate does not match pinned fingerprint"
                );
                return Err(CertificateManagerError::Transport(format!(
                    "Server {} presented an untrusted certificate",
                    self.server_host_pointer
                )));
            }
            None => {
                info!(
                    server = %self.server_host_pointer,
                    subject = server_certificate.subject_name(),
                    fingerprint = %hex::encode(&presented),
                    "pinned server certificate on first use"
                );
                *pin = Some(presented);
            }
        }
        Ok(server_certificate)
    }

    fn pin(&self) -> Result<std::sync::MutexGuard<'_, Option<Vec<u8>>>> {
        self.pinned_fingerprint.lock().map_err(|_| {
            CertificateManagerError::Transport("Pinned fingerprint lock poisoned".to_string())
        })
    }
}

impl std::fmt::Debug for CertificateManagerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateManagerClient")
            .field("server_host_pointer", &self.server_host_pointer)
            .field("pinned_fingerprint", &self.pinned_fingerprint().map(hex::encode))
            .finish()
    }
}

fn unexpected_response(response: Response) -> CertificateManagerError {
    CertificateManagerError::Protocol(format!("Unexpected response: {:?}", response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trusted_root_sets_pin() {
        let root = Certificate::create_self_signed(2048, "Client Test Root", 1).unwrap();
        let client = CertificateManagerClient::new(
            ClientSocketFactory::new(4096),
            HostPointer::new("127.0.0.1", 1),
        );
        assert!(client.pinned_fingerprint().is_none());

        let client = client.with_trusted_root(&root).unwrap();
        assert_eq!(
            client.pinned_fingerprint().unwrap(),
            root.fingerprint_sha256().unwrap()
        );
    }

    #[test]
    fn test_unreachable_server_is_transport_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = CertificateManagerClient::new(
            ClientSocketFactory::new(4096),
            HostPointer::new("127.0.0.1", port),
        );
        assert!(matches!(
            client.request_certificate("svc-a"),
            Err(CertificateManagerError::Transport(_))
        ));
        assert!(client.pinned_fingerprint().is_none());
    }
}
