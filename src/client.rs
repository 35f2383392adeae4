//! Secure transport client.
//!
//! `SecureClient` owns one transport and, in TLS mode, one TLS session layered
//! on it. It adapts the events of whichever layers are active into a single
//! set of `ClientHandler` callbacks, so the handler never knows which mode is
//! in use.
//!
//! ```text
//!   Idle ──connect──▶ Connecting ──ok, plaintext──────────▶ Connected ──▶ Closed
//!                        │  └──ok, tls──▶ Handshaking ──ok──▶    │
//!                        │                    │                  │
//!                        └──fail──▶ Closed ◀──fail               └─ on_disconnected
//! ```
//!
//! `on_connected` fires exactly once per `connect()` call. `on_disconnected`
//! fires only for sessions that reached `Connected`.

use crate::error::{ConnectError, TlsError};
use crate::metrics;
use crate::tls::{TlsConfig, TlsConnector, TlsEvent, TlsSession, TransportShim};
use crate::transport::{Transport, TransportEvent};
use bytes::BytesMut;
use std::collections::VecDeque;
use std::io;
use tracing::{debug, warn};

/// Connection mode, fixed when the client is built.
#[derive(Debug, Clone)]
pub enum Mode<C> {
    /// Bytes pass through to the transport unchanged.
    Plaintext,
    /// A TLS session from this connector rides on the transport.
    Tls(C),
}

impl<C> Mode<C> {
    pub fn is_tls(&self) -> bool {
        matches!(self, Mode::Tls(_))
    }
}

/// Client state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Built, never connected.
    Idle,
    /// Transport connect in flight.
    Connecting,
    /// Transport connected, TLS handshake in flight (TLS mode only).
    Handshaking,
    /// Ready for application data.
    Connected,
    /// Attempt failed or session ended. A new `connect()` may follow.
    Closed,
}

/// Operations available to handler callbacks.
///
/// This is a short-lived borrow into the client's internal state, so a
/// callback can read, write, or disconnect without re-entering dispatch.
/// Notifications raised from inside a callback are delivered after it
/// returns.
pub trait ClientCtx {
    /// Drain decoded bytes into `buf`. Returns 0 when nothing is buffered or
    /// the client is not connected.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Queue bytes for sending.
    fn write(&mut self, data: &[u8]);

    /// Tear down the connection or abort the attempt in progress.
    fn disconnect(&mut self);

    /// Current client state.
    fn state(&self) -> ClientState;

    /// Whether the client was built in TLS mode.
    fn is_tls(&self) -> bool;
}

/// User callbacks.
pub trait ClientHandler {
    /// The attempt started by `connect()` finished. Called exactly once per
    /// `connect()` call.
    fn on_connected(&mut self, ctx: &mut dyn ClientCtx, result: Result<(), ConnectError>);

    /// A connected session ended, locally or by the peer.
    fn on_disconnected(&mut self, _ctx: &mut dyn ClientCtx) {}

    /// New decoded bytes are available via `ctx.read`.
    fn on_input(&mut self, ctx: &mut dyn ClientCtx);
}

/// Pending handler notification.
#[derive(Debug)]
enum Notice {
    Connected(Result<(), ConnectError>),
    Disconnected,
    Input,
    /// The TLS session ended. Handled in queue order so input decoded ahead
    /// of the close still reaches the handler.
    SessionEnded,
}

/// Everything except the handler, so callbacks can borrow it mutably.
struct Core<T, C: TlsConnector> {
    transport: T,
    mode: Mode<C>,
    session: Option<C::Session>,
    state: ClientState,
    /// Connect host, used as the TLS server name.
    host: String,
    /// Writes made before the client reached `Connected`.
    deferred: BytesMut,
    notices: VecDeque<Notice>,
}

/// A connection endpoint that is plaintext or TLS depending on its `Mode`.
pub struct SecureClient<T, H, C: TlsConnector = TlsConfig> {
    core: Core<T, C>,
    handler: H,
}

impl<T: Transport, H: ClientHandler> SecureClient<T, H, TlsConfig> {
    /// Build a plaintext client.
    pub fn plaintext(transport: T, handler: H) -> Self {
        Self::new(transport, Mode::Plaintext, handler)
    }
}

impl<T: Transport, H: ClientHandler, C: TlsConnector> SecureClient<T, H, C> {
    /// Build a client. Performs no I/O.
    pub fn new(transport: T, mode: Mode<C>, handler: H) -> Self {
        Self {
            core: Core {
                transport,
                mode,
                session: None,
                state: ClientState::Idle,
                host: String::new(),
                deferred: BytesMut::new(),
                notices: VecDeque::new(),
            },
            handler,
        }
    }

    /// Build a TLS client using `connector` for every session.
    pub fn tls(transport: T, connector: C, handler: H) -> Self {
        Self::new(transport, Mode::Tls(connector), handler)
    }

    /// Begin a connection attempt. The outcome arrives through
    /// `on_connected`.
    pub fn connect(&mut self, host: &str, port: u16) {
        self.core.connect(host, port);
        self.dispatch();
    }

    /// Tear down the connection, or abort the attempt in progress.
    pub fn disconnect(&mut self) {
        self.core.disconnect();
        self.dispatch();
    }

    /// Queue bytes for sending. Always accepted.
    pub fn write(&mut self, data: &[u8]) {
        self.core.write(data);
        self.dispatch();
    }

    /// Drain decoded bytes. Never blocks.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        self.core.read(buf)
    }

    pub fn state(&self) -> ClientState {
        self.core.state
    }

    pub fn mode(&self) -> &Mode<C> {
        &self.core.mode
    }

    pub fn is_tls(&self) -> bool {
        self.core.mode.is_tls()
    }

    pub fn transport(&self) -> &T {
        &self.core.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.core.transport
    }

    /// The active TLS session, present between handshake start and close.
    pub fn session(&self) -> Option<&C::Session> {
        self.core.session.as_ref()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Adapt one transport event and deliver the resulting notifications.
    pub fn on_transport_event(&mut self, event: TransportEvent) {
        self.core.on_transport_event(event);
        self.dispatch();
    }

    /// Drain and handle every event the transport has queued.
    pub fn pump(&mut self) {
        while let Some(event) = self.core.transport.poll_event() {
            self.on_transport_event(event);
        }
    }

    fn dispatch(&mut self) {
        while let Some(notice) = self.core.notices.pop_front() {
            match notice {
                Notice::Connected(result) => self.handler.on_connected(&mut self.core, result),
                Notice::Disconnected => self.handler.on_disconnected(&mut self.core),
                Notice::Input => {
                    // A callback earlier in this batch may have disconnected.
                    if self.core.state == ClientState::Connected {
                        self.handler.on_input(&mut self.core);
                    }
                }
                Notice::SessionEnded => {
                    if self.core.state == ClientState::Connected {
                        self.core.transport.disconnect();
                        self.core.end_session();
                    }
                }
            }
        }
    }
}

impl<T: Transport, C: TlsConnector> Core<T, C> {
    fn connect(&mut self, host: &str, port: u16) {
        match self.state {
            ClientState::Idle | ClientState::Closed => {}
            state => {
                warn!(host, port, ?state, "connect while busy");
                self.notices
                    .push_back(Notice::Connected(Err(ConnectError::Busy)));
                return;
            }
        }

        debug!(host, port, tls = self.mode.is_tls(), "connecting");
        metrics::CONNECT_ATTEMPTS.increment();

        self.session = None;
        self.deferred.clear();
        self.host = host.to_string();
        self.state = ClientState::Connecting;
        self.transport.connect(host, port);
    }

    fn disconnect(&mut self) {
        match self.state {
            ClientState::Connected => {
                if let Some(session) = self.session.as_mut() {
                    session.close(&mut TransportShim(&mut self.transport));
                }
                self.transport.disconnect();
                self.end_session();
            }
            ClientState::Connecting | ClientState::Handshaking => {
                debug!(state = ?self.state, "aborting connection attempt");
                self.transport.disconnect();
                self.fail(ConnectError::Aborted);
            }
            ClientState::Idle | ClientState::Closed => {
                debug!("disconnect while not connected");
            }
        }
    }

    fn write(&mut self, data: &[u8]) {
        match self.state {
            ClientState::Connected => self.send(data),
            ClientState::Connecting | ClientState::Handshaking => {
                self.deferred.extend_from_slice(data);
            }
            ClientState::Idle | ClientState::Closed => {
                warn!(bytes = data.len(), "dropping write while not connected");
            }
        }
    }

    /// Forward application bytes through the active layer.
    fn send(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        match self.session.as_mut() {
            Some(session) => session.write(&mut TransportShim(&mut self.transport), data),
            None => self.transport.write(data),
        }

        metrics::BYTES_WRITTEN.add(data.len() as u64);
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        if self.state != ClientState::Connected {
            return 0;
        }

        let n = match self.session.as_mut() {
            Some(session) => session.read(buf),
            None => self.transport.read(buf),
        };

        metrics::BYTES_READ.add(n as u64);
        n
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match (self.state, event) {
            (ClientState::Connecting, TransportEvent::Connected(Ok(()))) => {
                if let Mode::Tls(connector) = &self.mode {
                    self.state = ClientState::Handshaking;
                    debug!(server_name = %self.host, "starting tls handshake");
                    let mut shim = TransportShim(&mut self.transport);
                    match connector.open(&self.host, &mut shim) {
                        Ok(session) => self.session = Some(session),
                        Err(e) => {
                            self.transport.disconnect();
                            self.fail(ConnectError::Tls(e));
                        }
                    }
                } else {
                    self.established();
                }
            }
            (ClientState::Connecting, TransportEvent::Connected(Err(e))) => {
                self.fail(ConnectError::Transport(e));
            }
            (ClientState::Connecting | ClientState::Handshaking, TransportEvent::Disconnected) => {
                self.fail(ConnectError::Transport(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "connection closed before it was established",
                )));
            }
            (ClientState::Connected, TransportEvent::Disconnected) => {
                debug!("transport closed by peer");
                self.end_session();
            }
            (ClientState::Handshaking | ClientState::Connected, TransportEvent::Input) => {
                match self.session.as_mut() {
                    Some(session) => {
                        let events =
                            session.on_transport_input(&mut TransportShim(&mut self.transport));
                        for event in events {
                            self.on_tls_event(event);
                        }
                    }
                    None => self.notices.push_back(Notice::Input),
                }
            }
            (state, event) => {
                debug!(?state, ?event, "ignoring stale transport event");
            }
        }
    }

    fn on_tls_event(&mut self, event: TlsEvent) {
        match (self.state, event) {
            (ClientState::Handshaking, TlsEvent::Connected(Ok(()))) => self.established(),
            (ClientState::Handshaking, TlsEvent::Connected(Err(e))) => {
                self.transport.disconnect();
                self.fail(ConnectError::Tls(e));
            }
            (ClientState::Handshaking, TlsEvent::Disconnected) => {
                self.transport.disconnect();
                self.fail(ConnectError::Tls(TlsError::Closed));
            }
            (ClientState::Connected, TlsEvent::Input) => self.notices.push_back(Notice::Input),
            (ClientState::Connected, TlsEvent::Disconnected) => {
                debug!("tls session ended");
                self.notices.push_back(Notice::SessionEnded);
            }
            (state, event) => {
                debug!(?state, ?event, "ignoring stale tls event");
            }
        }
    }

    /// Transition to `Connected`, flush deferred writes, notify.
    fn established(&mut self) {
        self.state = ClientState::Connected;
        debug!(tls = self.mode.is_tls(), "connected");
        metrics::CONNECTS.increment();
        metrics::CONNECTED.increment();

        if !self.deferred.is_empty() {
            let deferred = self.deferred.split();
            self.send(&deferred);
        }

        self.notices.push_back(Notice::Connected(Ok(())));
    }

    /// End the current attempt without ever reaching `Connected`.
    fn fail(&mut self, error: ConnectError) {
        debug!(error = %error, "connection attempt failed");
        match &error {
            ConnectError::Tls(_) => metrics::CONNECT_TLS_FAILURES.increment(),
            _ => metrics::CONNECT_TRANSPORT_FAILURES.increment(),
        };

        self.state = ClientState::Closed;
        self.session = None;
        self.deferred.clear();
        self.notices.push_back(Notice::Connected(Err(error)));
    }

    /// End a session that reached `Connected`.
    fn end_session(&mut self) {
        self.state = ClientState::Closed;
        self.session = None;
        metrics::DISCONNECTS.increment();
        metrics::CONNECTED.decrement();
        self.notices.push_back(Notice::Disconnected);
    }
}

impl<T: Transport, C: TlsConnector> ClientCtx for Core<T, C> {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        Core::read(self, buf)
    }

    fn write(&mut self, data: &[u8]) {
        Core::write(self, data)
    }

    fn disconnect(&mut self) {
        Core::disconnect(self)
    }

    fn state(&self) -> ClientState {
        self.state
    }

    fn is_tls(&self) -> bool {
        self.mode.is_tls()
    }
}
