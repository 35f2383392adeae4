use std::io;

/// Errors produced by a TLS session.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("invalid server name: {0}")]
    InvalidServerName(String),
    #[error("tls error: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("session closed")]
    Closed,
}

/// Outcome of a failed connection attempt, reported through
/// `ClientHandler::on_connected`.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The byte-stream connection could not be established or was lost
    /// before the attempt completed.
    #[error("transport: {0}")]
    Transport(#[source] io::Error),
    /// The transport connected but the TLS handshake failed.
    #[error("tls: {0}")]
    Tls(#[source] TlsError),
    /// `disconnect()` was called while the attempt was in progress.
    #[error("connection attempt aborted")]
    Aborted,
    /// `connect()` was called while another attempt or session was active.
    #[error("client already connecting or connected")]
    Busy,
}

impl ConnectError {
    pub const CODE_TRANSPORT: i32 = -1;
    pub const CODE_TLS: i32 = -2;
    pub const CODE_ABORTED: i32 = -3;
    pub const CODE_BUSY: i32 = -4;

    /// Nonzero integer form of the error. Transport failures carrying an OS
    /// errno report it negated.
    pub fn code(&self) -> i32 {
        match self {
            ConnectError::Transport(e) => match e.raw_os_error() {
                Some(errno) if errno > 0 => -errno,
                _ => Self::CODE_TRANSPORT,
            },
            ConnectError::Tls(_) => Self::CODE_TLS,
            ConnectError::Aborted => Self::CODE_ABORTED,
            ConnectError::Busy => Self::CODE_BUSY,
        }
    }

    /// Whether the failure originated in the TLS layer.
    pub fn is_tls(&self) -> bool {
        matches!(self, ConnectError::Tls(_))
    }
}

/// Errors loading or applying configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("tls config: {0}")]
    Tls(String),
}
