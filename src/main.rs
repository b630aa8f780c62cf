//! Certificate Manager
//!
//! Runs a network certificate authority. On first start it creates a self-signed root
//! key pair and stores it at the configured paths; later starts reuse it. Clients
//! connect over TLS to fetch the root certificate or have new identities issued.
//!
//! # Quick Start
//!
//! ```bash
//! cargo build --release
//! RUST_LOG=info ./target/release/certificate-manager settings.toml
//! ```
//!
//! Settings are read from the path given as the first argument, then from
//! `CERTIFICATE_MANAGER_SETTINGS`, then from `./settings.toml`.

use anyhow::{Context, Result};
use certificate_manager::certificate_authority::CertificateAuthority;
use certificate_manager::certificate_manager_server::CertificateManagerServer;
use certificate_manager::configs::AppConfig;
use certificate_manager::host_pointer::HostPointer;
use certificate_manager::socket_factory::ServerSocketFactory;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    if let Ok(docker_ip) = std::env::var("DOCKER_IP") {
        info!(docker_ip = %docker_ip, "found DOCKER_IP");
    }

    let config = AppConfig::load().context("Failed to load settings")?;
    let socket_config = &config.server_socket_factory;
    let certificate_config = &config.certificate;

    let certificate_authority = CertificateAuthority::load_or_create(
        &socket_config.private_key_file_path,
        &socket_config.public_certificate_file_path,
        certificate_config.key_size,
        &certificate_config.name,
        certificate_config.valid_days,
    )
    .context("Failed to prepare CA certificate")?;

    let mut server_socket_factory = ServerSocketFactory::new(
        socket_config.packet_bytes_length,
        socket_config.listening_limit_total,
        socket_config.accept_timeout_seconds,
    )?;
    if socket_config.connection_read_timeout_seconds > 0.0 {
        server_socket_factory = server_socket_factory
            .with_connection_read_timeout(socket_config.connection_read_timeout_seconds)?;
    }

    let mut server = CertificateManagerServer::new(
        server_socket_factory,
        HostPointer::new(socket_config.host_address.clone(), socket_config.host_port),
        certificate_authority,
    );
    server
        .start_accepting_clients()
        .context("Failed to start certificate manager server")?;

    idle(&config).await;

    // Stopping joins the connection threads.
    tokio::task::spawn_blocking(move || server.stop_accepting_clients())
        .await
        .context("Stop task failed")?
        .context("Failed to stop certificate manager server")?;
    info!("certificate manager exited");
    Ok(())
}

/// Sleep until Ctrl-C, optionally reporting elapsed time every `sleep_seconds`.
async fn idle(config: &AppConfig) {
    let started = Instant::now();
    let mut interval = tokio::time::interval(Duration::from_secs_f64(config.process.sleep_seconds));
    // first tick completes immediately
    interval.tick().await;
    let mut print_index: u64 = 0;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if config.process.is_interval_print {
                    info!(
                        index = print_index,
                        elapsed_seconds = started.elapsed().as_secs_f64(),
                        "running"
                    );
                    print_index += 1;
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    error!(error = %err, "failed to listen for shutdown signal");
                }
                info!("shutdown signal received");
                break;
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
