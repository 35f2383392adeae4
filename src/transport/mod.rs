//! Transport layer abstraction.
//!
//! This module provides a `Transport` trait for the non-blocking byte-stream
//! connection underneath a `SecureClient`. Implementations never call back
//! into the client; they queue `TransportEvent`s which the client drains with
//! `poll_event`.

mod tcp;

pub use tcp::{Readiness, TcpTransport};

use std::io;

/// Transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// No connection has been attempted.
    Idle,
    /// A non-blocking connect is in flight.
    Connecting,
    /// The byte stream is established.
    Connected,
    /// The connection was closed, failed, or torn down.
    Closed,
}

/// Notification raised by a transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// The connect attempt finished.
    Connected(io::Result<()>),
    /// The peer closed the stream or the socket failed. Not raised for a
    /// local `disconnect()`.
    Disconnected,
    /// New bytes are buffered and can be drained with `read`.
    Input,
}

/// Abstraction over a non-blocking byte-stream connection.
pub trait Transport {
    /// Get the current transport state.
    fn state(&self) -> TransportState;

    /// Begin a non-blocking connect. The outcome is reported later as
    /// `TransportEvent::Connected`.
    fn connect(&mut self, host: &str, port: u16);

    /// Tear down the connection. Buffered outbound data may be lost.
    fn disconnect(&mut self);

    /// Queue data to be sent. Always accepted; buffering happens here.
    fn write(&mut self, data: &[u8]);

    /// Drain buffered inbound bytes. Returns the number of bytes copied,
    /// which may be 0.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Take the next queued event, if any.
    fn poll_event(&mut self) -> Option<TransportEvent>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn state(&self) -> TransportState {
        (**self).state()
    }

    fn connect(&mut self, host: &str, port: u16) {
        (**self).connect(host, port)
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }

    fn write(&mut self, data: &[u8]) {
        (**self).write(data)
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        (**self).read(buf)
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        (**self).poll_event()
    }
}
