//! TLS overlay.
//!
//! A `TlsSession` never owns or names the transport beneath it. Every call
//! that needs wire I/O is handed a `WireIo`, which the client implements with
//! a `TransportShim` borrowing its own transport for the duration of the call.

mod session;

pub use session::{RustlsSession, SessionState, TlsConfig};

use crate::error::TlsError;
use crate::transport::Transport;
use smallvec::SmallVec;

/// Raw byte conduit used by a TLS session for its ciphertext.
pub trait WireIo {
    /// Pull buffered inbound ciphertext. Returns 0 when nothing is buffered.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Push outbound ciphertext. Always accepted.
    fn write(&mut self, data: &[u8]);
}

/// Transport-backed `WireIo`: forwards straight to the transport's read and
/// write.
pub struct TransportShim<'a, T: ?Sized>(pub &'a mut T);

impl<T: Transport + ?Sized> WireIo for TransportShim<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        self.0.read(buf)
    }

    fn write(&mut self, data: &[u8]) {
        self.0.write(data)
    }
}

/// Notification raised by a TLS session.
#[derive(Debug)]
pub enum TlsEvent {
    /// The handshake finished.
    Connected(Result<(), TlsError>),
    /// The session ended after the handshake: peer close_notify or a fatal
    /// record error.
    Disconnected,
    /// Newly decrypted bytes can be drained with `read`. Raised at most once
    /// per `on_transport_input` call.
    Input,
}

/// Events produced by one call into a session, in order.
pub type TlsEvents = SmallVec<[TlsEvent; 2]>;

/// Factory for sessions; holds the immutable TLS configuration.
pub trait TlsConnector {
    type Session: TlsSession;

    /// Start a client session for `server_name`. The initial handshake
    /// flight is written to `wire` before returning.
    fn open(&self, server_name: &str, wire: &mut dyn WireIo) -> Result<Self::Session, TlsError>;
}

/// A client-side TLS session riding on a `WireIo`.
pub trait TlsSession {
    /// Whether the handshake is still in progress.
    fn is_handshaking(&self) -> bool;

    /// Pull and decode all ciphertext currently available on `wire`, sending
    /// any handshake responses back through it.
    fn on_transport_input(&mut self, wire: &mut dyn WireIo) -> TlsEvents;

    /// Encrypt `data` and forward the records to `wire`.
    fn write(&mut self, wire: &mut dyn WireIo, data: &[u8]);

    /// Drain decrypted bytes. Returns the number copied, which may be 0.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Send close_notify through `wire`. Does not wait for the peer.
    fn close(&mut self, wire: &mut dyn WireIo);
}
