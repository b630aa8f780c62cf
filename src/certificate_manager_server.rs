//! Certificate Manager Server
//!
//! Serves the certificate authority over TLS. The root certificate doubles as the
//! server's TLS identity, so clients can pin it on first contact.
//!
//! Each connection is persistent: requests are answered strictly in the order they
//! arrive until the client closes. A request that cannot be decoded, or that fails
//! to produce a certificate, is answered with an `Error` response and the
//! connection is then closed.

use crate::certificate::Certificate;
use crate::certificate_authority::CertificateAuthority;
use crate::error::{CertificateManagerError, Result};
use crate::host_pointer::HostPointer;
use crate::protocol::{deserialize_request, serialize_response, Request, Response};
use crate::secure_socket::{ClientSocket, ServerSocket, ServerSocketState};
use crate::socket_factory::ServerSocketFactory;
use crate::tls::TlsIdentity;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct CertificateManagerServer {
    server_socket_factory: ServerSocketFactory,
    server_host_pointer: HostPointer,
    certificate_authority: Arc<CertificateAuthority>,
    server_socket: Option<ServerSocket>,
}

impl CertificateManagerServer {
    pub fn new(
        server_socket_factory: ServerSocketFactory,
        server_host_pointer: HostPointer,
        certificate_authority: CertificateAuthority,
    ) -> Self {
        Self {
            server_socket_factory,
            server_host_pointer,
            certificate_authority: Arc::new(certificate_authority),
            server_socket: None,
        }
    }

    /// Bind the configured host pointer and start serving requests.
    pub fn start_accepting_clients(&mut self) -> Result<()> {
        if self.server_socket.is_some() {
            return Err(CertificateManagerError::Transport(
                "Certificate manager server is already running".to_string(),
            ));
        }

        let identity =
            TlsIdentity::from_certificate(self.certificate_authority.root_certificate())?;
        let mut server_socket = self.server_socket_factory.create(identity, None)?;

        let certificate_authority = Arc::clone(&self.certificate_authority);
        server_socket.start_accepting_clients(
            self.server_host_pointer.host_address(),
            self.server_host_pointer.host_port(),
            move |client| serve_connection(&certificate_authority, client),
        )?;

        info!(
            address = %self.server_host_pointer,
            root = self.certificate_authority.root_certificate().subject_name(),
            "certificate manager server started"
        );
        self.server_socket = Some(server_socket);
        Ok(())
    }

    /// Stop accepting, then wait for every in-flight connection to finish.
    pub fn stop_accepting_clients(&mut self) -> Result<()> {
        if let Some(mut server_socket) = self.server_socket.take() {
            server_socket.stop_accepting_clients()?;
            server_socket.close()?;
            info!(
                address = %self.server_host_pointer,
                issued_total = self.certificate_authority.issued_total(),
                "certificate manager server stopped"
            );
        }
        Ok(())
    }

    pub fn is_accepting(&self) -> bool {
        self.server_socket
            .as_ref()
            .map(|socket| socket.state() == ServerSocketState::Listening)
            .unwrap_or(false)
    }

    /// Bound listener address while running. Useful when the configured port is 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server_socket.as_ref().and_then(|socket| socket.local_addr())
    }

    pub fn server_host_pointer(&self) -> &HostPointer {
        &self.server_host_pointer
    }

    pub fn certificate_authority(&self) -> &CertificateAuthority {
        &self.certificate_authority
    }
}

impl Drop for CertificateManagerServer {
    fn drop(&mut self) {
        if let Err(e) = self.stop_accepting_clients() {
            warn!(error = %e, "failed to stop certificate manager server");
        }
    }
}

fn serve_connection(certificate_authority: &CertificateAuthority, mut client: ClientSocket) {
    let peer = client.peer_address();
    loop {
        let payload = match client.try_read() {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!(peer = ?peer, "client closed connection");
                break;
            }
            Err(e) => {
                warn!(peer = ?peer, error = %e, "dropping connection");
                break;
            }
        };

        let (response, keep_open) = match handle_request(certificate_authority, &payload) {
            Ok(response) => (response, true),
            Err(e) => {
                warn!(peer = ?peer, error = %e, "request failed");
                (
                    Response::Error {
                        message: e.to_string(),
                    },
                    false,
                )
            }
        };

        let sent = serialize_response(&response).and_then(|bytes| client.write(bytes));
        if let Err(e) = sent {
            warn!(peer = ?peer, error = %e, "failed to send response");
            break;
        }
        if !keep_open {
            break;
        }
    }
    if let Err(e) = client.close() {
        debug!(peer = ?peer, error = %e, "close failed");
    }
}

fn handle_request(
    certificate_authority: &CertificateAuthority,
    payload: &[u8],
) -> Result<Response> {
    match deserialize_request(payload)? {
        Request::GetRootCertificate => {
            debug!("serving root certificate");
            Ok(Response::RootCertificate {
                certificate: pem_string(
                    certificate_authority.root_certificate().certificate_pem()?,
                )?,
            })
        }
        Request::RequestCertificate { name } => {
            let issued = certificate_authority.issue(&name)?;
            info!(name = %name, "issued certificate");
            issued_response(&issued)
        }
    }
}

fn issued_response(issued: &Certificate) -> Result<Response> {
    let private_key = issued.private_key_pem()?.ok_or_else(|| {
        CertificateManagerError::Signing(format!(
            "Issued certificate '{}' has no private key",
            issued.subject_name()
        ))
    })?;
    Ok(Response::IssuedCertificate {
        certificate: pem_string(issued.certificate_pem()?)?,
        private_key: pem_string(private_key)?,
    })
}

fn pem_string(pem: Vec<u8>) -> Result<String> {
    String::from_utf8(pem).map_err(|e| CertificateManagerError::protocol("PEM is not UTF-8", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{deserialize_response, serialize_request};

    fn authority() -> CertificateAuthority {
        let root = Certificate::create_self_signed(2048, "Server Test Root", 30).unwrap();
        CertificateAuthority::new(root, 2048, 7).unwrap()
    }

    #[test]
    fn test_root_response_has_no_private_key() {
        let ca = authority();
        let payload = serialize_request(&Request::GetRootCertificate).unwrap();
        let response = handle_request(&ca, &payload).unwrap();
        match response {
            Response::RootCertificate { certificate } => {
                assert!(certificate.contains("BEGIN CERTIFICATE"));
                assert!(!certificate.contains("PRIVATE KEY"));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_request_certificate_issues_leaf() {
        let ca = authority();
        let payload = serialize_request(&Request::RequestCertificate {
            name: "svc-a".to_string(),
        })
        .unwrap();
        let bytes = serialize_response(&handle_request(&ca, &payload).unwrap()).unwrap();

        match deserialize_response(&bytes).unwrap() {
            Response::IssuedCertificate {
                certificate,
                private_key,
            } => {
                let leaf =
                    Certificate::from_pem(certificate.as_bytes(), Some(private_key.as_bytes()))
                        .unwrap();
                assert_eq!(leaf.subject_name(), "svc-a");
                assert!(leaf.verify_signed_by(ca.root_certificate()).unwrap());
            }
            other => panic!("unexpected response: {:?}", other),
        }
        assert_eq!(ca.issued_total(), 1);
    }

    #[test]
    fn test_malformed_and_failing_requests_are_errors() {
        let ca = authority();
        assert!(matches!(
            handle_request(&ca, b"not json"),
            Err(CertificateManagerError::Protocol(_))
        ));

        let payload = serialize_request(&Request::RequestCertificate {
            name: String::new(),
        })
        .unwrap();
        assert!(matches!(
            handle_request(&ca, &payload),
            Err(CertificateManagerError::Signing(_))
        ));
    }

    #[test]
    fn test_start_and_stop() {
        let factory = ServerSocketFactory::new(4096, 4, 0.2).unwrap();
        let mut server =
            CertificateManagerServer::new(factory, HostPointer::new("127.0.0.1", 0), authority());
        assert!(!server.is_accepting());

        server.start_accepting_clients().unwrap();
        assert!(server.is_accepting());
        assert!(server.local_addr().is_some());
        assert!(server.start_accepting_clients().is_err());

        server.stop_accepting_clients().unwrap();
        assert!(!server.is_accepting());
        assert!(server.local_addr().is_none());
        server.stop_accepting_clients().unwrap();
    }
}
