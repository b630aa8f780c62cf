//! Shared helpers for certificate manager integration tests.
//!
//! Every test gets its own scratch directory and its own server. Servers bind port 0
//! unless a test needs a fixed port.

#![allow(dead_code)]

use certificate_manager::certificate_authority::CertificateAuthority;
use certificate_manager::certificate_manager_client::CertificateManagerClient;
use certificate_manager::certificate_manager_server::CertificateManagerServer;
use certificate_manager::host_pointer::HostPointer;
use certificate_manager::socket_factory::{ClientSocketFactory, ServerSocketFactory};
use std::path::PathBuf;
use tempfile::TempDir;

pub const TEST_KEY_SIZE: u32 = 2048;
pub const PACKET_BYTES_LENGTH: usize = 4096;

/// A running certificate manager server backed by a scratch directory.
pub struct TestServer {
    pub server: CertificateManagerServer,
    pub host_pointer: HostPointer,
    pub dir: TempDir,
}

impl TestServer {
    pub fn start() -> Self {
        Self::start_with("127.0.0.1", 0, 10, 1.0)
    }

    pub fn start_with(
        host_address: &str,
        host_port: u16,
        listening_limit_total: usize,
        accept_timeout_seconds: f64,
    ) -> Self {
        let dir = TempDir::new().expect("create scratch directory");
        let ca = CertificateAuthority::load_or_create(
            dir.path().join("root.key"),
            dir.path().join("root.crt"),
            TEST_KEY_SIZE,
            "Integration Test Root",
            30,
        )
        .expect("create root");
        let factory = ServerSocketFactory::new(
            PACKET_BYTES_LENGTH,
            listening_limit_total,
            accept_timeout_seconds,
        )
        .expect("server socket factory")
        .with_connection_read_timeout(10.0)
        .expect("read timeout");

        let mut server =
            CertificateManagerServer::new(factory, HostPointer::new(host_address, host_port), ca);
        server.start_accepting_clients().expect("start server");
        let bound = server.local_addr().expect("bound address");
        Self {
            server,
            host_pointer: HostPointer::new(bound.ip().to_string(), bound.port()),
            dir,
        }
    }

    pub fn client(&self) -> CertificateManagerClient {
        CertificateManagerClient::new(
            ClientSocketFactory::new(PACKET_BYTES_LENGTH),
            self.host_pointer.clone(),
        )
    }

    pub fn path(&self, file_name: &str) -> PathBuf {
        self.dir.path().join(file_name)
    }

    pub fn stop(&mut self) {
        self.server.stop_accepting_clients().expect("stop server");
    }
}
