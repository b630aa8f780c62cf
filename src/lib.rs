//! Certificate Manager - Network Certificate Authority Library
//!
//! A small certificate authority reachable over TLS. The server holds a self-signed
//! root key pair and issues a fresh key pair and signed certificate to any client
//! that asks for one by name. Issued certificates carry both `serverAuth` and
//! `clientAuth` usages, so two parties holding them can open a mutually
//! authenticated TLS connection verified against the shared root.
//!
//! ```text
//! Root CA (self-signed, pathlen=0)
//!   └── Leaf identity (CN + SAN = requested name, CA=false)
//! ```
//!
//! # Layers
//!
//! - [`certificate`]: X.509 creation, signing, PEM files
//! - [`packet_transport`]: length-prefixed message framing
//! - [`secure_socket`]: TLS server/client sockets carrying framed messages
//! - [`socket_factory`]: shared socket settings
//! - [`protocol`]: versioned JSON request/response envelope
//! - [`certificate_authority`]: root key pair and concurrent issuance
//! - [`certificate_manager_server`] / [`certificate_manager_client`]: the service
//!
//! # Example
//!
//! ```no_run
//! use certificate_manager::certificate_authority::CertificateAuthority;
//! use certificate_manager::certificate_manager_client::CertificateManagerClient;
//! use certificate_manager::certificate_manager_server::CertificateManagerServer;
//! use certificate_manager::host_pointer::HostPointer;
//! use certificate_manager::socket_factory::{ClientSocketFactory, ServerSocketFactory};
//!
//! fn main() -> certificate_manager::error::Result<()> {
//!     let ca = CertificateAuthority::load_or_create(
//!         "ca.key",
//!         "ca.pem",
//!         4096,
//!         "Example Root CA",
//!         3650,
//!     )?;
//!     let mut server = CertificateManagerServer::new(
//!         ServerSocketFactory::new(4096, 10, 1.0)?,
//!         HostPointer::new("127.0.0.1", 35123),
//!         ca,
//!     );
//!     server.start_accepting_clients()?;
//!
//!     let client = CertificateManagerClient::new(
//!         ClientSocketFactory::new(4096),
//!         HostPointer::new("127.0.0.1", 35123),
//!     );
//!     let root = client.get_root_certificate("root.pem")?;
//!     let issued = client.request_certificate("svc-a")?;
//!     assert!(issued.verify_signed_by(&root)?);
//!
//!     server.stop_accepting_clients()?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Handling
//!
//! Library APIs return [`error::Result`], whose error enum separates configuration,
//! key generation, signing, transport and protocol failures. The binary wraps these
//! with `anyhow` context.

pub mod certificate;
pub mod certificate_authority;
pub mod certificate_manager_client;
pub mod certificate_manager_server;
pub mod configs;
pub mod error;
pub mod host_pointer;
pub mod packet_transport;
pub mod protocol;
pub mod secure_socket;
pub mod socket_factory;
pub mod tls;
