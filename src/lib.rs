//! stcp - event-driven TCP client with an optional TLS overlay.
//!
//! A `SecureClient` presents one connect/disconnect/read/write interface and
//! three callbacks whether it runs in plaintext or TLS mode. The transport
//! and TLS layers are independent state machines that report progress as
//! queued events; the client adapts those events into handler callbacks.

pub mod client;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod logging;
pub mod metrics;
pub mod tls;
pub mod transport;

pub use client::{ClientCtx, ClientHandler, ClientState, Mode, SecureClient};
pub use config::Config;
pub use error::{ConfigError, ConnectError, TlsError};
pub use event_loop::EventLoop;
pub use tls::{RustlsSession, TlsConfig};
pub use transport::{TcpTransport, Transport, TransportEvent};
