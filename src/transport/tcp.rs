//! Mio-backed TCP transport.
//!
//! The socket is registered edge-triggered for both read and write
//! readiness. The event loop hands each readiness notification to
//! `on_ready`, which finishes connects, flushes the send buffer, and drains
//! the socket into the receive buffer.

use super::{Transport, TransportEvent, TransportState};
use crate::config::IoConfig;
use bytes::BytesMut;
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use tracing::{debug, trace, warn};

/// Readiness flags for one poll event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub closed: bool,
    pub error: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            closed: event.is_read_closed() || event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

/// Non-blocking TCP client connection.
pub struct TcpTransport {
    registry: Registry,
    token: Token,
    stream: Option<TcpStream>,
    state: TransportState,
    /// Buffer for incoming data.
    recv_buf: BytesMut,
    /// Buffer for outgoing data.
    send_buf: BytesMut,
    /// How much of send_buf has been sent.
    send_pos: usize,
    /// Read target for socket reads.
    scratch: Box<[u8]>,
    nodelay: bool,
    events: VecDeque<TransportEvent>,
}

impl TcpTransport {
    /// Create a transport that registers its socket under `token`.
    pub fn new(registry: &Registry, token: Token) -> io::Result<Self> {
        Self::with_config(registry, token, &IoConfig::default())
    }

    /// Create a transport with explicit buffer and socket settings.
    pub fn with_config(registry: &Registry, token: Token, config: &IoConfig) -> io::Result<Self> {
        Ok(Self {
            registry: registry.try_clone()?,
            token,
            stream: None,
            state: TransportState::Idle,
            recv_buf: BytesMut::with_capacity(config.recv_chunk_size),
            send_buf: BytesMut::with_capacity(config.send_buffer_capacity),
            send_pos: 0,
            scratch: vec![0u8; config.recv_chunk_size.max(1)].into_boxed_slice(),
            nodelay: config.tcp_nodelay,
            events: VecDeque::with_capacity(4),
        })
    }

    /// The poll token this transport registers under.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Peer address of the current connection.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }

    /// Local address of the current connection.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Bytes queued but not yet written to the socket.
    pub fn pending_send(&self) -> usize {
        self.send_buf.len() - self.send_pos
    }

    /// Process a readiness notification for this transport's token.
    pub fn on_ready(&mut self, readiness: Readiness) {
        if self.state == TransportState::Connecting {
            self.finish_connect(readiness);
        }

        if self.state != TransportState::Connected {
            return;
        }

        if readiness.writable {
            self.flush();
        }

        if readiness.readable || readiness.closed || readiness.error {
            self.fill();
        }
    }

    fn open(&mut self, host: &str, port: u16) -> io::Result<()> {
        let addr = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {host}:{port}"),
            )
        })?;

        let mut stream = TcpStream::connect(addr)?;
        self.registry
            .register(&mut stream, self.token, Interest::READABLE | Interest::WRITABLE)?;
        self.stream = Some(stream);

        debug!(%addr, token = self.token.0, "tcp connect started");
        Ok(())
    }

    fn finish_connect(&mut self, readiness: Readiness) {
        let Some(stream) = self.stream.as_ref() else {
            return;
        };

        let result = match stream.take_error() {
            Ok(Some(e)) | Err(e) => Err(e),
            Ok(None) => match stream.peer_addr() {
                Ok(_) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                    if readiness.error || readiness.closed {
                        Err(io::Error::from(io::ErrorKind::ConnectionRefused))
                    } else {
                        // Spurious wakeup, connect still in flight.
                        return;
                    }
                }
                Err(e) => Err(e),
            },
        };

        match result {
            Ok(()) => {
                if self.nodelay {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "failed to set TCP_NODELAY");
                    }
                }
                self.state = TransportState::Connected;
                debug!(token = self.token.0, "tcp connected");
                self.events.push_back(TransportEvent::Connected(Ok(())));
                self.flush();
            }
            Err(e) => {
                debug!(token = self.token.0, error = %e, "tcp connect failed");
                self.close_socket();
                self.state = TransportState::Closed;
                self.events.push_back(TransportEvent::Connected(Err(e)));
            }
        }
    }

    /// Drain the socket until it would block. Edge-triggered readiness means
    /// a partial drain would stall the connection.
    fn fill(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        let mut received = 0;
        let mut closed = false;

        loop {
            match stream.read(&mut self.scratch) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => {
                    self.recv_buf.extend_from_slice(&self.scratch[..n]);
                    received += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(token = self.token.0, error = %e, "tcp recv failed");
                    closed = true;
                    break;
                }
            }
        }

        if received > 0 {
            trace!(token = self.token.0, bytes = received, "tcp input");
            self.events.push_back(TransportEvent::Input);
        }

        if closed {
            self.lost();
        }
    }

    fn flush(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        let mut failed = None;

        while self.send_pos < self.send_buf.len() {
            match stream.write(&self.send_buf[self.send_pos..]) {
                Ok(0) => {
                    failed = Some(io::Error::from(io::ErrorKind::WriteZero));
                    break;
                }
                Ok(n) => self.send_pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }

        // If all data sent, clear the buffer
        if self.send_pos >= self.send_buf.len() {
            self.send_buf.clear();
            self.send_pos = 0;
        }

        if let Some(e) = failed {
            warn!(token = self.token.0, error = %e, "tcp send failed");
            self.lost();
        }
    }

    /// Unsolicited loss of the connection.
    fn lost(&mut self) {
        self.close_socket();
        self.state = TransportState::Closed;
        self.events.push_back(TransportEvent::Disconnected);
    }

    fn close_socket(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = self.registry.deregister(&mut stream);
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn reset_buffers(&mut self) {
        self.recv_buf.clear();
        self.send_buf.clear();
        self.send_pos = 0;
    }
}

impl Transport for TcpTransport {
    fn state(&self) -> TransportState {
        self.state
    }

    fn connect(&mut self, host: &str, port: u16) {
        self.close_socket();
        self.reset_buffers();
        self.events.clear();
        self.state = TransportState::Connecting;

        if let Err(e) = self.open(host, port) {
            debug!(host, port, error = %e, "tcp connect failed to start");
            self.close_socket();
            self.state = TransportState::Closed;
            self.events.push_back(TransportEvent::Connected(Err(e)));
        }
    }

    fn disconnect(&mut self) {
        if self.stream.is_some() {
            debug!(token = self.token.0, "tcp disconnect");
        }
        self.close_socket();
        self.reset_buffers();
        self.events.clear();
        self.state = TransportState::Closed;
    }

    fn write(&mut self, data: &[u8]) {
        match self.state {
            TransportState::Connecting | TransportState::Connected => {
                self.send_buf.extend_from_slice(data);
            }
            TransportState::Idle | TransportState::Closed => {
                debug!(bytes = data.len(), "dropping write on closed transport");
                return;
            }
        }

        if self.state == TransportState::Connected {
            self.flush();
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = std::cmp::min(buf.len(), self.recv_buf.len());
        buf[..n].copy_from_slice(&self.recv_buf[..n]);

        // Remove read bytes
        let _ = self.recv_buf.split_to(n);

        n
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close_socket();
    }
}
