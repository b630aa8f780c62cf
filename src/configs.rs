use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_SETTINGS_PATH: &str = "settings.toml";
pub const SETTINGS_PATH_ENV: &str = "CERTIFICATE_MANAGER_SETTINGS";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server_socket_factory: ServerSocketFactoryConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub certificate: CertificateConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSocketFactoryConfig {
    #[serde(default = "default_packet_bytes_length")]
    pub packet_bytes_length: usize,
    #[serde(default = "default_listening_limit_total")]
    pub listening_limit_total: usize,
    #[serde(default = "default_accept_timeout_seconds")]
    pub accept_timeout_seconds: f64,
    #[serde(default = "default_connection_read_timeout_seconds")]
    /// Seconds a connection may sit without a complete request. `0` disables it.
    pub connection_read_timeout_seconds: f64,
    #[serde(default = "default_host_address")]
    pub host_address: String,
    #[serde(default = "default_host_port")]
    pub host_port: u16,
    #[serde(default = "default_public_certificate_file_path")]
    pub public_certificate_file_path: PathBuf,
    #[serde(default = "default_private_key_file_path")]
    pub private_key_file_path: PathBuf,
}

impl Default for ServerSocketFactoryConfig {
    fn default() -> Self {
        Self {
            packet_bytes_length: default_packet_bytes_length(),
            listening_limit_total: default_listening_limit_total(),
            accept_timeout_seconds: default_accept_timeout_seconds(),
            connection_read_timeout_seconds: default_connection_read_timeout_seconds(),
            host_address: default_host_address(),
            host_port: default_host_port(),
            public_certificate_file_path: default_public_certificate_file_path(),
            private_key_file_path: default_private_key_file_path(),
        }
    }
}

fn default_packet_bytes_length() -> usize {
    4096
}

fn default_listening_limit_total() -> usize {
    10
}

fn default_accept_timeout_seconds() -> f64 {
    1.0
}

fn default_connection_read_timeout_seconds() -> f64 {
    30.0
}

fn default_host_address() -> String {
    "0.0.0.0".to_string()
}

fn default_host_port() -> u16 {
    35123
}

fn default_public_certificate_file_path() -> PathBuf {
    PathBuf::from("ssl/root.crt")
}

fn default_private_key_file_path() -> PathBuf {
    PathBuf::from("ssl/root.key")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessConfig {
    #[serde(default = "default_sleep_seconds")]
    pub sleep_seconds: f64,
    #[serde(default)]
    pub is_interval_print: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            sleep_seconds: default_sleep_seconds(),
            is_interval_print: false,
        }
    }
}

fn default_sleep_seconds() -> f64 {
    10.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct CertificateConfig {
    #[serde(default = "default_key_size")]
    pub key_size: u32,
    #[serde(default = "default_certificate_name")]
    pub name: String,
    #[serde(default = "default_valid_days")]
    pub valid_days: u32,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            key_size: default_key_size(),
            name: default_certificate_name(),
            valid_days: default_valid_days(),
        }
    }
}

fn default_key_size() -> u32 {
    4096
}

fn default_certificate_name() -> String {
    "Certificate Manager Root CA".to_string()
}

fn default_valid_days() -> u32 {
    365 * 10
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .context(format!("Failed to read settings file: {}", path.display()))?;

        Self::from_toml(&config_str)
            .context(format!("Failed to parse settings file: {}", path.display()))
    }

    pub fn from_toml(config_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the first command line argument, then
    /// `CERTIFICATE_MANAGER_SETTINGS`, then `settings.toml`.
    pub fn load() -> Result<Self> {
        Self::from_file(Self::settings_path(
            std::env::args().nth(1),
            std::env::var(SETTINGS_PATH_ENV).ok(),
        ))
    }

    fn settings_path(argument: Option<String>, environment: Option<String>) -> PathBuf {
        argument
            .or(environment)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH))
    }

    fn validate(&self) -> Result<()> {
        if !self.process.sleep_seconds.is_finite() || self.process.sleep_seconds <= 0.0 {
            anyhow::bail!(
                "process.sleep_seconds must be a positive number, got {}",
                self.process.sleep_seconds
            );
        }
        let read_timeout = self.server_socket_factory.connection_read_timeout_seconds;
        if !read_timeout.is_finite() || read_timeout < 0.0 {
            anyhow::bail!(
                "server_socket_factory.connection_read_timeout_seconds must be 0 or a positive \
                 number, got {}",
                read_timeout
            );
        }
        if self.certificate.name.trim().is_empty() {
            anyhow::bail!("certificate.name must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_settings_file() {
        let config = AppConfig::from_toml(
            r#"
            [server_socket_factory]
            packet_bytes_length = 1024
            listening_limit_total = 64
            accept_timeout_seconds = 0.5
            host_address = "127.0.0.1"
            host_port = 36451
            public_certificate_file_path = "/etc/ca/root.crt"
            private_key_file_path = "/etc/ca/root.key"

            [process]
            sleep_seconds = 2.5
            is_interval_print = true

            [certificate]
            key_size = 2048
            name = "Test Root"
            valid_days = 30
            "#,
        )
        .unwrap();

        let server = &config.server_socket_factory;
        assert_eq!(server.packet_bytes_length, 1024);
        assert_eq!(server.listening_limit_total, 64);
        assert_eq!(server.accept_timeout_seconds, 0.5);
        assert_eq!(server.connection_read_timeout_seconds, 30.0);
        assert_eq!(server.host_port, 36451);
        assert_eq!(server.private_key_file_path, PathBuf::from("/etc/ca/root.key"));
        assert!(config.process.is_interval_print);
        assert_eq!(config.certificate.key_size, 2048);
        assert_eq!(config.certificate.name, "Test Root");
    }

    #[test]
    fn test_partial_settings_use_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [certificate]
            name = "Partial Root"
            "#,
        )
        .unwrap();
        assert_eq!(config.certificate.name, "Partial Root");
        assert_eq!(config.certificate.key_size, 4096);
        assert_eq!(config.server_socket_factory.packet_bytes_length, 4096);
        assert_eq!(config.process.sleep_seconds, 10.0);
        assert!(!config.process.is_interval_print);

        assert!(AppConfig::from_toml("").is_ok());
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert!(AppConfig::from_toml("[process]\nsleep_seconds = 0.0").is_err());
        assert!(AppConfig::from_toml("[certificate]\nname = \"  \"").is_err());
        assert!(AppConfig::from_toml("[server_socket_factory]\nhost_port = \"x\"").is_err());
    }

    #[test]
    fn test_read_timeout_can_be_disabled() {
        let config =
            AppConfig::from_toml("[server_socket_factory]\nconnection_read_timeout_seconds = 0")
                .unwrap();
        assert_eq!(config.server_socket_factory.connection_read_timeout_seconds, 0.0);

        let config =
            AppConfig::from_toml("[server_socket_factory]\nconnection_read_timeout_seconds = 5.5")
                .unwrap();
        assert_eq!(config.server_socket_factory.connection_read_timeout_seconds, 5.5);

        assert!(AppConfig::from_toml(
            "[server_socket_factory]\nconnection_read_timeout_seconds = -1.0"
        )
        .is_err());
    }

    #[test]
    fn test_settings_path_precedence() {
        assert_eq!(
            AppConfig::settings_path(Some("a.toml".into()), Some("b.toml".into())),
            PathBuf::from("a.toml")
        );
        assert_eq!(
            AppConfig::settings_path(None, Some("b.toml".into())),
            PathBuf::from("b.toml")
        );
        assert_eq!(
            AppConfig::settings_path(None, None),
            PathBuf::from(DEFAULT_SETTINGS_PATH)
        );
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = AppConfig::from_file("/nonexistent/settings.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read settings file"));
    }
}
