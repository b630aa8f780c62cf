//! TLS sockets carrying length-framed messages.
//!
//! # Server Socket Lifecycle
//!
//! ```text
//! Idle ──start_accepting_clients──▶ Listening
//!      ──stop_accepting_clients──▶ Stopping ──close──▶ Closed
//! ```
//!
//! The accept loop runs on its own thread and polls a non-blocking listener. Between
//! polls it checks a stop flag; the poll interval never exceeds the configured accept
//! timeout, so `stop_accepting_clients` returns within that timeout. Every accepted
//! connection performs its TLS handshake and runs the connection handler on a
//! dedicated thread, so a slow client never holds up the accept loop or other
//! clients.
//!
//! `close` waits only for connections that are serving a request. A connection that
//! is idle between requests, or still in its TLS handshake, has the read half of its
//! TCP stream shut down so its handler sees end-of-stream and exits.
//!
//! # Example
//! ```rust,no_run
//! use certificate_manager::secure_socket::{ClientSocket, ServerSocket};
//! use certificate_manager::tls::{PeerVerification, TlsIdentity};
//! use std::time::Duration;
//! # fn example() -> certificate_manager::error::Result<()> {
//! let identity = TlsIdentity::from_files("server.key", "server.pem")?;
//! let mut server = ServerSocket::new(4096, 10, Duration::from_secs(1), None, identity, None)?;
//! server.start_accepting_clients("0.0.0.0", 36451, |mut client: ClientSocket| {
//!     if let Ok(message) = client.read() {
//!         let _ = client.write(&message);
//!     }
//!     let _ = client.close();
//! })?;
//!
//! let mut client = ClientSocket::new(4096, PeerVerification::from_root_file("root.pem")?, None)?;
//! client.connect_to_server("localhost", 36451)?;
//! client.write(b"hello")?;
//! assert_eq!(client.read()?, b"hello");
//! client.close()?;
//! server.close()?;
//! # Ok(())
//! # }
//! ```

use crate::certificate::Certificate;
use crate::error::{CertificateManagerError, Result};
use crate::packet_transport::PacketTransport;
use crate::tls::{build_acceptor, build_connector, PeerVerification, TlsIdentity};
use openssl::ssl::{SslAcceptor, SslConnector, SslStream};
use openssl::x509::X509;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const MAX_ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

type ConnectionHandler = Arc<dyn Fn(ClientSocket) + Send + Sync + 'static>;

/// Lets `ServerSocket::close` interrupt an accepted connection that is waiting for
/// its next request.
struct ConnectionControl {
    stream: TcpStream,
    awaiting_request: AtomicBool,
    closing: Arc<AtomicBool>,
}

impl ConnectionControl {
    /// Mark the connection idle. Returns false once the server is closing.
    fn begin_wait(&self) -> bool {
        self.awaiting_request.store(true, Ordering::SeqCst);
        !self.closing.load(Ordering::SeqCst)
    }

    fn end_wait(&self) {
        self.awaiting_request.store(false, Ordering::SeqCst);
    }

    fn interrupt_if_waiting(&self) {
        if self.awaiting_request.load(Ordering::SeqCst) {
            if let Err(e) = self.stream.shutdown(Shutdown::Read) {
                if e.kind() != ErrorKind::NotConnected {
                    debug!(error = %e, "failed to interrupt idle connection");
                }
            }
        }
    }
}

struct TrackedConnection {
    handle: JoinHandle<()>,
    control: Arc<ConnectionControl>,
}

/// One end of an established TLS connection exchanging logical messages.
///
/// Client code creates one with [`ClientSocket::new`] and connects it; the server
/// hands already-connected instances to its connection handler.
pub struct ClientSocket {
    packet_bytes_length: usize,
    connector: Option<SslConnector>,
    verify_peer: bool,
    transport: Option<PacketTransport<SslStream<TcpStream>>>,
    peer_address: Option<SocketAddr>,
    control: Option<Arc<ConnectionControl>>,
}

impl ClientSocket {
    pub fn new(
        packet_bytes_length: usize,
        verification: PeerVerification,
        identity: Option<&TlsIdentity>,
    ) -> Result<Self> {
        if packet_bytes_length == 0 {
            return Err(CertificateManagerError::Configuration(
                "packet_bytes_length must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            packet_bytes_length,
            connector: Some(build_connector(&verification, identity)?),
            verify_peer: verification.verifies_peer(),
            transport: None,
            peer_address: None,
            control: None,
        })
    }

    fn from_accepted(
        stream: SslStream<TcpStream>,
        packet_bytes_length: usize,
        peer_address: SocketAddr,
        control: Arc<ConnectionControl>,
    ) -> Result<Self> {
        Ok(Self {
            packet_bytes_length,
            connector: None,
            verify_peer: false,
            transport: Some(PacketTransport::new(stream, packet_bytes_length)?),
            peer_address: Some(peer_address),
            control: Some(control),
        })
    }

    /// Open a TCP connection and complete the TLS handshake.
    ///
    /// With a trusted root, `ip_address` must match a subject alternative name of
    /// the server certificate.
    pub fn connect_to_server(&mut self, ip_address: &str, port: u16) -> Result<()> {
        if self.transport.is_some() {
            return Err(CertificateManagerError::Transport(
                "Socket is already connected".to_string(),
            ));
        }
        let connector = self.connector.as_ref().ok_or_else(|| {
            CertificateManagerError::Transport(
                "Accepted sockets cannot initiate connections".to_string(),
            )
        })?;

        let tcp = TcpStream::connect((ip_address, port)).map_err(|e| {
            CertificateManagerError::transport(
                &format!("Failed to connect to {}:{}", ip_address, port),
                e,
            )
        })?;
        let peer_address = tcp.peer_addr().ok();

        let configuration = connector
            .configure()
            .map_err(|e| CertificateManagerError::transport("Failed to configure TLS session", e))?
            .verify_hostname(self.verify_peer);
        let stream = configuration.connect(ip_address, tcp).map_err(|e| {
            CertificateManagerError::transport(
                &format!("TLS handshake with {}:{} failed", ip_address, port),
                e,
            )
        })?;

        debug!(
            server = ip_address,
            port,
            verified = self.verify_peer,
            "connected to server"
        );
        self.transport = Some(PacketTransport::new(stream, self.packet_bytes_length)?);
        self.peer_address = peer_address;
        Ok(())
    }

    /// Read the next logical message.
    pub fn read(&mut self) -> Result<Vec<u8>> {
        self.try_read()?.ok_or_else(|| {
            CertificateManagerError::Transport("Connection closed by peer".to_string())
        })
    }

    /// Read the next logical message, or `None` if the peer closed the connection.
    ///
    /// On an accepted socket this also returns `None` once the server is closing.
    pub fn try_read(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(control) = &self.control {
            if !control.begin_wait() {
                return Ok(None);
            }
        }
        let message = self.connected_transport()?.try_read_message();
        if let Some(control) = &self.control {
            control.end_wait();
        }
        message
    }

    pub fn write(&mut self, message: impl AsRef<[u8]>) -> Result<()> {
        self.connected_transport()?.write_message(message.as_ref())
    }

    /// Send TLS close-notify and release the connection. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if let Some(transport) = self.transport.take() {
            let mut stream = transport.into_inner();
            if let Err(e) = stream.shutdown() {
                debug!(error = %e, "TLS shutdown did not complete cleanly");
            }
            if let Err(e) = stream.get_ref().shutdown(Shutdown::Both) {
                if e.kind() != ErrorKind::NotConnected {
                    debug!(error = %e, "TCP shutdown failed");
                }
            }
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.peer_address
    }

    /// The certificate presented by the peer during the handshake, without a
    /// private key.
    pub fn peer_certificate(&self) -> Option<Certificate> {
        self.transport
            .as_ref()
            .and_then(|transport| transport.get_ref().ssl().peer_certificate())
            .map(Certificate::from_x509)
    }

    fn connected_transport(&mut self) -> Result<&mut PacketTransport<SslStream<TcpStream>>> {
        self.transport.as_mut().ok_or_else(|| {
            CertificateManagerError::Transport("Socket is not connected".to_string())
        })
    }
}

impl std::fmt::Debug for ClientSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSocket")
            .field("packet_bytes_length", &self.packet_bytes_length)
            .field("connected", &self.is_connected())
            .field("peer_address", &self.peer_address)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerSocketState {
    Idle,
    Listening,
    Stopping,
    Closed,
}

/// TLS listener dispatching every accepted connection to its own thread.
pub struct ServerSocket {
    packet_bytes_length: usize,
    listening_limit_total: usize,
    accept_timeout: Duration,
    connection_read_timeout: Option<Duration>,
    acceptor: Arc<SslAcceptor>,
    state: ServerSocketState,
    stop_requested: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    connections: Arc<Mutex<Vec<TrackedConnection>>>,
    active_connections: Arc<AtomicUsize>,
    local_addr: Option<SocketAddr>,
}

impl ServerSocket {
    /// # Arguments
    /// * `packet_bytes_length` - Frame size used on every accepted connection
    /// * `listening_limit_total` - Maximum simultaneously connected clients
    /// * `accept_timeout` - Upper bound on how long the accept loop waits before
    ///   re-checking for a stop request
    /// * `connection_read_timeout` - Optional limit on how long a connection may sit
    ///   idle in a read
    /// * `identity` - Certificate and key presented to clients
    /// * `client_root` - When set, clients must present a certificate issued by it
    pub fn new(
        packet_bytes_length: usize,
        listening_limit_total: usize,
        accept_timeout: Duration,
        connection_read_timeout: Option<Duration>,
        identity: TlsIdentity,
        client_root: Option<X509>,
    ) -> Result<Self> {
        if packet_bytes_length == 0 {
            return Err(CertificateManagerError::Configuration(
                "packet_bytes_length must be greater than zero".to_string(),
            ));
        }
        if listening_limit_total == 0 {
            return Err(CertificateManagerError::Configuration(
                "listening_limit_total must be greater than zero".to_string(),
            ));
        }
        if accept_timeout.is_zero() {
            return Err(CertificateManagerError::Configuration(
                "accept timeout must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            packet_bytes_length,
            listening_limit_total,
            accept_timeout,
            connection_read_timeout,
            acceptor: Arc::new(build_acceptor(&identity, client_root.as_ref())?),
            state: ServerSocketState::Idle,
            stop_requested: Arc::new(AtomicBool::new(false)),
            closing: Arc::new(AtomicBool::new(false)),
            accept_thread: None,
            connections: Arc::new(Mutex::new(Vec::new())),
            active_connections: Arc::new(AtomicUsize::new(0)),
            local_addr: None,
        })
    }

    /// Bind `host_ip_address:host_port` and start the accept loop.
    ///
    /// `on_accepted_client` runs once per connection, on that connection's thread,
    /// after the TLS handshake succeeded. Port 0 binds an ephemeral port; see
    /// [`ServerSocket::local_addr`].
    pub fn start_accepting_clients<F>(
        &mut self,
        host_ip_address: &str,
        host_port: u16,
        on_accepted_client: F,
    ) -> Result<()>
    where
        F: Fn(ClientSocket) + Send + Sync + 'static,
    {
        if self.state != ServerSocketState::Idle {
            return Err(CertificateManagerError::Transport(format!(
                "Server socket cannot start from state {:?}",
                self.state
            )));
        }

        let listener = TcpListener::bind((host_ip_address, host_port)).map_err(|e| {
            CertificateManagerError::transport(
                &format!("Failed to bind {}:{}", host_ip_address, host_port),
                e,
            )
        })?;
        listener.set_nonblocking(true).map_err(|e| {
            CertificateManagerError::transport("Failed to make listener non-blocking", e)
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| CertificateManagerError::transport("Failed to read bound address", e))?;

        let accept_loop = AcceptLoop {
            listener,
            stop_requested: Arc::clone(&self.stop_requested),
            poll_interval: self.accept_timeout.min(MAX_ACCEPT_POLL_INTERVAL),
            acceptor: Arc::clone(&self.acceptor),
            on_accepted_client: Arc::new(on_accepted_client),
            connections: Arc::clone(&self.connections),
            closing: Arc::clone(&self.closing),
            active_connections: Arc::clone(&self.active_connections),
            listening_limit_total: self.listening_limit_total,
            packet_bytes_length: self.packet_bytes_length,
            connection_read_timeout: self.connection_read_timeout,
        };
        let accept_thread = thread::Builder::new()
            .name(format!("accept-{}", local_addr.port()))
            .spawn(move || accept_loop.run())
            .map_err(|e| CertificateManagerError::transport("Failed to spawn accept thread", e))?;

        info!(
            address = %local_addr,
            listening_limit_total = self.listening_limit_total,
            accept_timeout_ms = self.accept_timeout.as_millis() as u64,
            "accepting clients"
        );
        self.accept_thread = Some(accept_thread);
        self.local_addr = Some(local_addr);
        self.state = ServerSocketState::Listening;
        Ok(())
    }

    /// Stop accepting and wait for the accept loop to exit.
    ///
    /// Returns within the accept timeout. Connections already accepted keep running;
    /// use [`ServerSocket::close`] to wait for them.
    pub fn stop_accepting_clients(&mut self) -> Result<()> {
        match self.state {
            ServerSocketState::Idle => {
                self.state = ServerSocketState::Closed;
                return Ok(());
            }
            ServerSocketState::Listening => {}
            ServerSocketState::Stopping | ServerSocketState::Closed => return Ok(()),
        }

        self.state = ServerSocketState::Stopping;
        self.stop_requested.store(true, Ordering::Release);
        if let Some(handle) = self.accept_thread.take() {
            handle.join().map_err(|_| {
                CertificateManagerError::Transport("Accept thread panicked".to_string())
            })?;
        }
        info!(address = ?self.local_addr, "stopped accepting clients");
        Ok(())
    }

    /// Stop accepting if needed, end idle connections, and wait for handlers that
    /// are serving a request to finish.
    pub fn close(&mut self) -> Result<()> {
        self.stop_accepting_clients()?;
        self.closing.store(true, Ordering::SeqCst);
        let connections = match self.connections.lock() {
            Ok(mut connections) => std::mem::take(&mut *connections),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for connection in &connections {
            connection.control.interrupt_if_waiting();
        }
        if !connections.is_empty() {
            debug!(connections = connections.len(), "waiting for connection handlers");
        }
        for connection in connections {
            if connection.handle.join().is_err() {
                warn!("connection handler panicked");
            }
        }
        self.state = ServerSocketState::Closed;
        Ok(())
    }

    pub fn state(&self) -> ServerSocketState {
        self.state
    }

    /// Address the listener is bound to, once accepting has started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }
}

impl Drop for ServerSocket {
    fn drop(&mut self) {
        self.stop_requested.store(true, Ordering::Release);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Counts a live connection until dropped.
struct ConnectionPermit {
    active_connections: Arc<AtomicUsize>,
}

impl ConnectionPermit {
    fn acquire(active_connections: &Arc<AtomicUsize>) -> Self {
        active_connections.fetch_add(1, Ordering::AcqRel);
        Self {
            active_connections: Arc::clone(active_connections),
        }
    }
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.active_connections.fetch_sub(1, Ordering::AcqRel);
    }
}

struct AcceptLoop {
    listener: TcpListener,
    stop_requested: Arc<AtomicBool>,
    poll_interval: Duration,
    acceptor: Arc<SslAcceptor>,
    on_accepted_client: ConnectionHandler,
    connections: Arc<Mutex<Vec<TrackedConnection>>>,
    closing: Arc<AtomicBool>,
    active_connections: Arc<AtomicUsize>,
    listening_limit_total: usize,
    packet_bytes_length: usize,
    connection_read_timeout: Option<Duration>,
}

impl AcceptLoop {
    fn run(self) {
        while !self.stop_requested.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, peer_address)) => self.dispatch(stream, peer_address),
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(self.poll_interval),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    thread::sleep(self.poll_interval);
                }
            }
        }
        debug!("accept loop exited");
    }

    fn dispatch(&self, stream: TcpStream, peer_address: SocketAddr) {
        let active = self.active_connections.load(Ordering::Acquire);
        if active >= self.listening_limit_total {
            warn!(
                peer = %peer_address,
                active,
                limit = self.listening_limit_total,
                "connection limit reached, refusing client"
            );
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
        if let Err(e) = self.prepare_stream(&stream) {
            warn!(peer = %peer_address, error = %e, "failed to configure accepted stream");
            return;
        }
        let control = match stream.try_clone() {
            Ok(shutdown_handle) => Arc::new(ConnectionControl {
                stream: shutdown_handle,
                awaiting_request: AtomicBool::new(true),
                closing: Arc::clone(&self.closing),
            }),
            Err(e) => {
                warn!(peer = %peer_address, error = %e, "failed to clone accepted stream");
                return;
            }
        };

        let permit = ConnectionPermit::acquire(&self.active_connections);
        let acceptor = Arc::clone(&self.acceptor);
        let on_accepted_client = Arc::clone(&self.on_accepted_client);
        let packet_bytes_length = self.packet_bytes_length;
        let connection_control = Arc::clone(&control);

        let spawned = thread::Builder::new()
            .name(format!("connection-{}", peer_address))
            .spawn(move || {
                let _permit = permit;
                if connection_control.closing.load(Ordering::SeqCst) {
                    return;
                }
                let stream = match acceptor.accept(stream) {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(peer = %peer_address, error = %e, "TLS handshake failed");
                        return;
                    }
                };
                let accepted = ClientSocket::from_accepted(
                    stream,
                    packet_bytes_length,
                    peer_address,
                    connection_control,
                );
                match accepted {
                    Ok(client) => {
                        debug!(peer = %peer_address, "client connected");
                        on_accepted_client(client);
                    }
                    Err(e) => warn!(peer = %peer_address, error = %e, "failed to wrap connection"),
                }
            });

        match spawned {
            Ok(handle) => match self.connections.lock() {
                Ok(mut connections) => {
                    connections.retain(|connection| !connection.handle.is_finished());
                    connections.push(TrackedConnection { handle, control });
                }
                Err(_) => error!("connection registry poisoned, handler detached"),
            },
            Err(e) => error!(peer = %peer_address, error = %e, "failed to spawn connection thread"),
        }
    }

    fn prepare_stream(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(self.connection_read_timeout)
    }
}
