#![allow(dead_code)]

//! Scripted transport and TLS doubles shared by the integration tests.

use stcp::client::{ClientCtx, ClientHandler};
use stcp::error::{ConnectError, TlsError};
use stcp::tls::{TlsConnector, TlsEvent, TlsEvents, TlsSession, WireIo};
use stcp::transport::{Transport, TransportEvent, TransportState};
use std::collections::VecDeque;

/// Handshake flight the mock TLS client writes first.
pub const CLIENT_HELLO: &[u8] = b"HELLO";
/// Server reply that completes the mock handshake.
pub const SERVER_ACCEPT: &[u8] = b"ACCEPT";
/// Server reply that fails the mock handshake.
pub const SERVER_REJECT: &[u8] = b"REJECT";
/// Record marking a peer close_notify.
pub const CLOSE_NOTIFY: &[u8] = b"\x15CLOSE";

const KEY: u8 = 0x5a;

pub fn seal(data: &[u8]) -> Vec<u8> {
    data.iter().map(|b| b ^ KEY).collect()
}

/// Transport whose events are injected by the test.
#[derive(Default)]
pub struct ScriptedTransport {
    pub state: Option<TransportState>,
    pub connects: Vec<(String, u16)>,
    pub disconnects: usize,
    /// Everything written to the wire, in order.
    pub wire_out: Vec<u8>,
    /// Bytes waiting to be read.
    pub wire_in: Vec<u8>,
    pub events: VecDeque<TransportEvent>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `data` readable and queue an input event.
    pub fn deliver(&mut self, data: &[u8]) {
        self.wire_in.extend_from_slice(data);
        self.events.push_back(TransportEvent::Input);
    }

    pub fn queue(&mut self, event: TransportEvent) {
        self.events.push_back(event);
    }
}

impl Transport for ScriptedTransport {
    fn state(&self) -> TransportState {
        self.state.unwrap_or(TransportState::Idle)
    }

    fn connect(&mut self, host: &str, port: u16) {
        self.connects.push((host.to_string(), port));
        self.state = Some(TransportState::Connecting);
    }

    fn disconnect(&mut self) {
        self.disconnects += 1;
        self.state = Some(TransportState::Closed);
        self.wire_in.clear();
        self.events.clear();
    }

    fn write(&mut self, data: &[u8]) {
        self.wire_out.extend_from_slice(data);
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.wire_in.len());
        buf[..n].copy_from_slice(&self.wire_in[..n]);
        self.wire_in.drain(..n);
        n
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }
}

/// Connector for a toy protocol: the client sends `CLIENT_HELLO`, the
/// server answers `SERVER_ACCEPT` or `SERVER_REJECT`, and records are
/// xor-masked.
#[derive(Default)]
pub struct MockTls {
    pub reject_names: Vec<String>,
}

pub struct MockSession {
    pub server_name: String,
    handshaking: bool,
    plaintext: Vec<u8>,
    pub closed: bool,
}

impl TlsConnector for MockTls {
    type Session = MockSession;

    fn open(&self, server_name: &str, wire: &mut dyn WireIo) -> Result<MockSession, TlsError> {
        if self.reject_names.iter().any(|n| n == server_name) {
            return Err(TlsError::InvalidServerName(server_name.to_string()));
        }
        wire.write(CLIENT_HELLO);
        Ok(MockSession {
            server_name: server_name.to_string(),
            handshaking: true,
            plaintext: Vec::new(),
            closed: false,
        })
    }
}

impl TlsSession for MockSession {
    fn is_handshaking(&self) -> bool {
        self.handshaking
    }

    fn on_transport_input(&mut self, wire: &mut dyn WireIo) -> TlsEvents {
        let mut events = TlsEvents::new();
        let mut data = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = wire.read(&mut buf);
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }

        if self.handshaking {
            if data.starts_with(SERVER_ACCEPT) {
                self.handshaking = false;
                events.push(TlsEvent::Connected(Ok(())));
                data.drain(..SERVER_ACCEPT.len());
            } else if data.starts_with(SERVER_REJECT) {
                events.push(TlsEvent::Connected(Err(TlsError::Closed)));
                return events;
            } else {
                return events;
            }
        }

        if let Some(pos) = find(&data, CLOSE_NOTIFY) {
            data.truncate(pos);
            self.push_plaintext(&data, &mut events);
            events.push(TlsEvent::Disconnected);
            return events;
        }

        self.push_plaintext(&data, &mut events);
        events
    }

    fn write(&mut self, wire: &mut dyn WireIo, data: &[u8]) {
        if self.handshaking || self.closed {
            return;
        }
        wire.write(&seal(data));
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.plaintext.len());
        buf[..n].copy_from_slice(&self.plaintext[..n]);
        self.plaintext.drain(..n);
        n
    }

    fn close(&mut self, wire: &mut dyn WireIo) {
        if !self.closed {
            self.closed = true;
            wire.write(CLOSE_NOTIFY);
        }
    }
}

impl MockSession {
    fn push_plaintext(&mut self, data: &[u8], events: &mut TlsEvents) {
        if !data.is_empty() {
            self.plaintext.extend_from_slice(&seal(data));
            events.push(TlsEvent::Input);
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Handler that records every callback.
#[derive(Default)]
pub struct Recorder {
    /// One entry per `on_connected`, as `code()` on failure.
    pub connected: Vec<Result<(), i32>>,
    /// Whether each failure came from the TLS layer.
    pub tls_failures: Vec<bool>,
    pub disconnected: usize,
    pub input_calls: usize,
    pub input: Vec<u8>,
    /// Written from inside `on_connected` on success.
    pub greeting: Option<Vec<u8>>,
    /// Disconnect from inside `on_input`.
    pub hang_up_on_input: bool,
}

impl ClientHandler for Recorder {
    fn on_connected(&mut self, ctx: &mut dyn ClientCtx, result: Result<(), ConnectError>) {
        match result {
            Ok(()) => {
                self.connected.push(Ok(()));
                if let Some(greeting) = &self.greeting {
                    ctx.write(greeting);
                }
            }
            Err(e) => {
                self.tls_failures.push(e.is_tls());
                self.connected.push(Err(e.code()));
            }
        }
    }

    fn on_disconnected(&mut self, _ctx: &mut dyn ClientCtx) {
        self.disconnected += 1;
    }

    fn on_input(&mut self, ctx: &mut dyn ClientCtx) {
        self.input_calls += 1;
        let mut buf = [0u8; 64];
        loop {
            let n = ctx.read(&mut buf);
            if n == 0 {
                break;
            }
            self.input.extend_from_slice(&buf[..n]);
        }
        if self.hang_up_on_input {
            ctx.disconnect();
        }
    }
}
