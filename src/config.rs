//! Client configuration.

use crate::client::Mode;
use crate::error::ConfigError;
use crate::tls::TlsConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main client configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Remote endpoint.
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// TLS settings. Present means TLS mode.
    #[serde(default)]
    pub tls: Option<TlsSettings>,

    /// Socket and buffer settings.
    #[serde(default)]
    pub io: IoConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Build the connection mode. Decided here, once, from whether a `[tls]`
    /// section exists.
    pub fn mode(&self) -> Result<Mode<TlsConfig>, ConfigError> {
        match &self.tls {
            Some(settings) => Ok(Mode::Tls(TlsConfig::from_settings(settings)?)),
            None => Ok(Mode::Plaintext),
        }
    }
}

/// Remote endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "EndpointConfig::default_host")]
    pub host: String,

    #[serde(default = "EndpointConfig::default_port")]
    pub port: u16,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
        }
    }
}

impl EndpointConfig {
    fn default_host() -> String {
        "127.0.0.1".to_string()
    }

    fn default_port() -> u16 {
        443
    }
}

/// TLS configuration section.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsSettings {
    /// Name used for SNI and certificate verification instead of the
    /// endpoint host.
    #[serde(default)]
    pub server_name: Option<String>,

    /// PEM bundle of additional trust anchors.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,

    /// Trust the bundled webpki roots.
    #[serde(default = "TlsSettings::default_webpki_roots")]
    pub webpki_roots: bool,

    /// ALPN protocols to offer, in preference order.
    #[serde(default)]
    pub alpn: Vec<String>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            server_name: None,
            ca_file: None,
            webpki_roots: Self::default_webpki_roots(),
            alpn: Vec::new(),
        }
    }
}

impl TlsSettings {
    fn default_webpki_roots() -> bool {
        true
    }
}

/// Socket and buffer settings.
#[derive(Debug, Clone, Deserialize)]
pub struct IoConfig {
    /// Bytes read from the socket per read call.
    #[serde(default = "IoConfig::default_recv_chunk_size")]
    pub recv_chunk_size: usize,

    /// Initial capacity of the send buffer.
    #[serde(default = "IoConfig::default_send_buffer_capacity")]
    pub send_buffer_capacity: usize,

    /// Enable TCP_NODELAY once connected.
    #[serde(default = "IoConfig::default_tcp_nodelay")]
    pub tcp_nodelay: bool,

    /// Upper bound on a single poll wait, in milliseconds.
    #[serde(default = "IoConfig::default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Capacity of the poll event array.
    #[serde(default = "IoConfig::default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            recv_chunk_size: Self::default_recv_chunk_size(),
            send_buffer_capacity: Self::default_send_buffer_capacity(),
            tcp_nodelay: Self::default_tcp_nodelay(),
            poll_timeout_ms: Self::default_poll_timeout_ms(),
            events_capacity: Self::default_events_capacity(),
        }
    }
}

impl IoConfig {
    fn default_recv_chunk_size() -> usize {
        16384
    }

    fn default_send_buffer_capacity() -> usize {
        16384
    }

    fn default_tcp_nodelay() -> bool {
        true
    }

    fn default_poll_timeout_ms() -> u64 {
        100
    }

    fn default_events_capacity() -> usize {
        128
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter, used when RUST_LOG is unset.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Output format: "pretty", "compact", or "json".
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: Self::default_format(),
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }

    fn default_format() -> String {
        "pretty".to_string()
    }
}
