//! TLS session using rustls.

use super::{TlsConnector, TlsEvent, TlsEvents, TlsSession, WireIo};
use crate::config::TlsSettings;
use crate::error::{ConfigError, TlsError};
use bytes::BytesMut;
use rustls::pki_types::{CertificateDer, ServerName};
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Size of the buffer used to pull ciphertext off the wire.
const WIRE_CHUNK: usize = 16384;

/// TLS configuration for client connections.
///
/// Immutable once built and cheap to clone. Presence of a `TlsConfig` in
/// `Mode::Tls` is what selects TLS for a client.
#[derive(Clone)]
pub struct TlsConfig {
    /// rustls client configuration.
    config: Arc<rustls::ClientConfig>,
    /// Name to verify instead of the connect host.
    server_name: Option<String>,
}

impl TlsConfig {
    /// Create a new TLS configuration with the webpki root certificates.
    pub fn new() -> Self {
        Self::with_alpn(Vec::new())
    }

    /// Create a TLS configuration with ALPN protocols.
    pub fn with_alpn(protocols: Vec<Vec<u8>>) -> Self {
        let root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        config.alpn_protocols = protocols;

        Self::from_client_config(Arc::new(config))
    }

    /// Wrap a pre-built rustls `ClientConfig`.
    pub fn from_client_config(config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            config,
            server_name: None,
        }
    }

    /// Build from the `[tls]` section of the configuration file.
    pub fn from_settings(settings: &TlsSettings) -> Result<Self, ConfigError> {
        let mut root_store = rustls::RootCertStore::empty();

        if settings.webpki_roots {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }

        if let Some(path) = &settings.ca_file {
            for cert in load_certs(path)? {
                root_store.add(cert).map_err(|e| {
                    ConfigError::Tls(format!("bad CA certificate in {}: {e}", path.display()))
                })?;
            }
        }

        if root_store.is_empty() {
            return Err(ConfigError::Tls("no trust anchors configured".into()));
        }

        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        config.alpn_protocols = settings
            .alpn
            .iter()
            .map(|p| p.as_bytes().to_vec())
            .collect();

        let mut tls = Self::from_client_config(Arc::new(config));
        tls.server_name = settings.server_name.clone();
        Ok(tls)
    }

    /// Verify certificates against `name` rather than the connect host.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// The underlying rustls configuration.
    pub fn client_config(&self) -> &Arc<rustls::ClientConfig> {
        &self.config
    }

    /// The server name override, if any.
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("alpn_protocols", &self.config.alpn_protocols)
            .field("server_name", &self.server_name)
            .finish()
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let file = File::open(path).map_err(|e| {
        ConfigError::Tls(format!("failed to open CA file {}: {e}", path.display()))
    })?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Tls(format!("failed to parse certificates: {e}")))?;
    if certs.is_empty() {
        return Err(ConfigError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

impl TlsConnector for TlsConfig {
    type Session = RustlsSession;

    fn open(&self, server_name: &str, wire: &mut dyn WireIo) -> Result<RustlsSession, TlsError> {
        let name = self.server_name.as_deref().unwrap_or(server_name);
        let name = ServerName::try_from(name.to_string())
            .map_err(|_| TlsError::InvalidServerName(name.to_string()))?;

        let conn = rustls::ClientConnection::new(self.config.clone(), name)?;

        let mut session = RustlsSession {
            conn,
            state: SessionState::Handshaking,
            plaintext: BytesMut::with_capacity(WIRE_CHUNK),
            scratch: vec![0u8; WIRE_CHUNK].into_boxed_slice(),
            peer_closed: false,
        };

        // Generate initial handshake data
        session.flush(wire)?;

        Ok(session)
    }
}

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake in progress.
    Handshaking,
    /// Ready for application data.
    Ready,
    /// A fatal TLS error occurred.
    Error,
    /// close_notify sent or received.
    Closed,
}

/// Client TLS session over a `WireIo`.
pub struct RustlsSession {
    /// The TLS connection state.
    conn: rustls::ClientConnection,
    state: SessionState,
    /// Buffer for decrypted application data.
    plaintext: BytesMut,
    /// Ciphertext pulled from the wire, before it is fed to rustls.
    scratch: Box<[u8]>,
    peer_closed: bool,
}

impl RustlsSession {
    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Get the negotiated ALPN protocol, if any.
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.conn.alpn_protocol()
    }

    /// Pull everything the wire has buffered through rustls. Returns whether
    /// new plaintext was produced.
    fn pull(&mut self, wire: &mut dyn WireIo) -> Result<bool, TlsError> {
        let mut produced = false;

        loop {
            let n = wire.read(&mut self.scratch);
            if n == 0 {
                break;
            }

            let mut cursor = io::Cursor::new(&self.scratch[..n]);
            while (cursor.position() as usize) < n && !self.peer_closed {
                // rustls accepts nothing more once close_notify arrived.
                if self.conn.read_tls(&mut cursor)? == 0 {
                    break;
                }

                let io_state = self.conn.process_new_packets()?;

                let pending = io_state.plaintext_bytes_to_read();
                if pending > 0 {
                    let start = self.plaintext.len();
                    self.plaintext.resize(start + pending, 0);
                    let read = self.conn.reader().read(&mut self.plaintext[start..])?;
                    self.plaintext.truncate(start + read);
                    produced |= read > 0;
                }

                if io_state.peer_has_closed() {
                    self.peer_closed = true;
                }
            }

            // Handshake responses go out as soon as they are produced.
            self.flush(wire)?;

            if self.peer_closed {
                Self::discard(wire, &mut self.scratch);
                break;
            }
        }

        Ok(produced)
    }

    /// Move pending TLS output to the wire.
    fn flush(&mut self, wire: &mut dyn WireIo) -> Result<(), TlsError> {
        while self.conn.wants_write() {
            let mut buf = Vec::with_capacity(4096);
            if self.conn.write_tls(&mut buf)? == 0 {
                break;
            }
            wire.write(&buf);
        }
        Ok(())
    }

    /// Discard ciphertext that arrives after the session ended.
    fn discard(wire: &mut dyn WireIo, scratch: &mut [u8]) {
        while wire.read(scratch) > 0 {}
    }
}

impl TlsSession for RustlsSession {
    fn is_handshaking(&self) -> bool {
        self.state == SessionState::Handshaking
    }

    fn on_transport_input(&mut self, wire: &mut dyn WireIo) -> TlsEvents {
        let mut events = TlsEvents::new();

        if matches!(self.state, SessionState::Error | SessionState::Closed) {
            Self::discard(wire, &mut self.scratch);
            return events;
        }

        let was_handshaking = self.is_handshaking();

        match self.pull(wire) {
            Ok(produced) => {
                if was_handshaking && !self.conn.is_handshaking() {
                    self.state = SessionState::Ready;
                    debug!(alpn = ?self.conn.alpn_protocol(), "tls handshake complete");
                    events.push(TlsEvent::Connected(Ok(())));
                }

                if produced && self.state == SessionState::Ready {
                    events.push(TlsEvent::Input);
                }

                if self.peer_closed {
                    match self.state {
                        SessionState::Handshaking => {
                            self.state = SessionState::Closed;
                            events.push(TlsEvent::Connected(Err(TlsError::Closed)));
                        }
                        SessionState::Ready => {
                            debug!("tls peer sent close_notify");
                            self.state = SessionState::Closed;
                            events.push(TlsEvent::Disconnected);
                        }
                        SessionState::Error | SessionState::Closed => {}
                    }
                }
            }
            Err(e) => {
                // rustls queues an alert for fatal errors; send it if we can.
                let _ = self.flush(wire);
                self.state = SessionState::Error;
                if was_handshaking {
                    events.push(TlsEvent::Connected(Err(e)));
                } else {
                    warn!(error = %e, "tls session failed");
                    events.push(TlsEvent::Disconnected);
                }
            }
        }

        events
    }

    fn write(&mut self, wire: &mut dyn WireIo, data: &[u8]) {
        if self.state != SessionState::Ready {
            warn!(
                bytes = data.len(),
                state = ?self.state,
                "dropping write on tls session that is not ready"
            );
            return;
        }

        let mut rest = data;
        while !rest.is_empty() {
            let written = match self.conn.writer().write(rest) {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "tls write failed");
                    self.state = SessionState::Error;
                    return;
                }
            };
            rest = &rest[written..];

            if let Err(e) = self.flush(wire) {
                warn!(error = %e, "tls flush failed");
                self.state = SessionState::Error;
                return;
            }

            if written == 0 {
                warn!(bytes = rest.len(), "tls send buffer full, dropping remainder");
                return;
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = std::cmp::min(buf.len(), self.plaintext.len());
        buf[..n].copy_from_slice(&self.plaintext[..n]);

        // Remove read bytes
        let _ = self.plaintext.split_to(n);

        n
    }

    fn close(&mut self, wire: &mut dyn WireIo) {
        if matches!(self.state, SessionState::Handshaking | SessionState::Ready) {
            self.conn.send_close_notify();
            if let Err(e) = self.flush(wire) {
                debug!(error = %e, "failed to flush close_notify");
            }
        }
        self.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use rustls::ServerConnection;

    /// In-memory wire: `inbound` is what the peer sent us, `outbound` is what
    /// we sent the peer.
    #[derive(Default)]
    struct Pipe {
        inbound: Vec<u8>,
        outbound: Vec<u8>,
    }

    impl WireIo for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> usize {
            let n = buf.len().min(self.inbound.len());
            buf[..n].copy_from_slice(&self.inbound[..n]);
            self.inbound.drain(..n);
            n
        }

        fn write(&mut self, data: &[u8]) {
            self.outbound.extend_from_slice(data);
        }
    }

    fn self_signed() -> (TlsConfig, Arc<rustls::ServerConfig>) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

        let mut roots = rustls::RootCertStore::empty();
        roots.add(cert.der().clone()).unwrap();
        let client = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let server = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert.der().clone()], key)
            .unwrap();

        (
            TlsConfig::from_client_config(Arc::new(client)),
            Arc::new(server),
        )
    }

    /// Feed everything the client wrote into the server and queue the
    /// server's response on the client's inbound side.
    fn exchange(server: &mut ServerConnection, pipe: &mut Pipe) {
        let mut input = &pipe.outbound[..];
        while !input.is_empty() {
            server.read_tls(&mut input).unwrap();
            server.process_new_packets().unwrap();
        }
        pipe.outbound.clear();

        while server.wants_write() {
            server.write_tls(&mut pipe.inbound).unwrap();
        }
    }

    fn handshake() -> (RustlsSession, ServerConnection, Pipe) {
        let (client_config, server_config) = self_signed();
        let mut server = ServerConnection::new(server_config).unwrap();
        let mut pipe = Pipe::default();

        let mut session = client_config.open("localhost", &mut pipe).unwrap();
        assert!(session.is_handshaking());

        exchange(&mut server, &mut pipe);
        let events = session.on_transport_input(&mut pipe);
        assert!(matches!(events.first(), Some(TlsEvent::Connected(Ok(())))));
        assert_eq!(session.state(), SessionState::Ready);

        // Client Finished.
        exchange(&mut server, &mut pipe);
        assert!(!server.is_handshaking());

        (session, server, pipe)
    }

    #[test]
    fn test_tls_config_with_alpn() {
        let protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        let config = TlsConfig::with_alpn(protocols.clone());
        assert_eq!(config.client_config().alpn_protocols, protocols);
        assert!(config.server_name().is_none());
    }

    #[test]
    fn test_open_writes_client_hello() {
        let config = TlsConfig::new();
        let mut pipe = Pipe::default();
        let session = config.open("example.com", &mut pipe).unwrap();

        assert!(session.is_handshaking());
        // TLS ClientHello should start with record type 0x16 (handshake)
        assert_eq!(pipe.outbound[0], 0x16);
        assert_eq!(pipe.outbound[1], 0x03);
    }

    #[test]
    fn test_open_invalid_server_name() {
        let config = TlsConfig::new();
        let mut pipe = Pipe::default();
        let result = config.open("", &mut pipe);
        assert!(matches!(result, Err(TlsError::InvalidServerName(_))));
        assert!(pipe.outbound.is_empty());
    }

    #[test]
    fn test_server_name_override() {
        let config = TlsConfig::new().with_server_name("example.com");
        let mut pipe = Pipe::default();
        // The connect host is not a valid name; the override is used instead.
        assert!(config.open("", &mut pipe).is_ok());
    }

    #[test]
    fn test_write_before_handshake_is_dropped() {
        let config = TlsConfig::new();
        let mut pipe = Pipe::default();
        let mut session = config.open("example.com", &mut pipe).unwrap();
        let hello_len = pipe.outbound.len();

        session.write(&mut pipe, b"secret");
        assert_eq!(pipe.outbound.len(), hello_len);
    }

    #[test]
    fn test_garbage_fails_handshake() {
        let config = TlsConfig::new();
        let mut pipe = Pipe::default();
        let mut session = config.open("example.com", &mut pipe).unwrap();

        pipe.inbound.extend_from_slice(b"this is not valid TLS data at all");
        let events = session.on_transport_input(&mut pipe);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TlsEvent::Connected(Err(_))));
        assert_eq!(session.state(), SessionState::Error);
    }

    #[test]
    fn test_untrusted_certificate_fails_handshake() {
        let (_, server_config) = self_signed();
        let mut server = ServerConnection::new(server_config).unwrap();
        let mut pipe = Pipe::default();

        // Only webpki roots, which do not include the self-signed cert.
        let mut session = TlsConfig::new().open("localhost", &mut pipe).unwrap();
        exchange(&mut server, &mut pipe);

        let events = session.on_transport_input(&mut pipe);
        assert!(matches!(
            events.first(),
            Some(TlsEvent::Connected(Err(TlsError::Rustls(_))))
        ));
    }

    #[test]
    fn test_exchange_is_encrypted() {
        let (mut session, mut server, mut pipe) = handshake();

        session.write(&mut pipe, b"hello secret world");
        assert!(!pipe.outbound.is_empty());
        assert!(!pipe
            .outbound
            .windows(b"hello secret world".len())
            .any(|w| w == b"hello secret world"));

        exchange(&mut server, &mut pipe);
        let mut buf = [0u8; 64];
        let n = server.reader().read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello secret world");

        server.writer().write_all(b"reply").unwrap();
        exchange(&mut server, &mut pipe);

        let events = session.on_transport_input(&mut pipe);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TlsEvent::Input));

        let n = session.read(&mut buf);
        assert_eq!(&buf[..n], b"reply");
        assert_eq!(session.read(&mut buf), 0);
    }

    #[test]
    fn test_peer_close_notify() {
        let (mut session, mut server, mut pipe) = handshake();

        server.send_close_notify();
        exchange(&mut server, &mut pipe);

        let events = session.on_transport_input(&mut pipe);
        assert!(matches!(events.last(), Some(TlsEvent::Disconnected)));
        assert_eq!(session.state(), SessionState::Closed);

        // Further input is discarded.
        pipe.inbound.extend_from_slice(b"trailing");
        assert!(session.on_transport_input(&mut pipe).is_empty());
        assert!(pipe.inbound.is_empty());
    }

    #[test]
    fn test_trailing_bytes_after_close_notify() {
        let (mut session, mut server, mut pipe) = handshake();

        server.send_close_notify();
        exchange(&mut server, &mut pipe);
        // More than rustls takes in a single read_tls call.
        pipe.inbound.extend_from_slice(&[0x17u8; 8000]);

        let events = session.on_transport_input(&mut pipe);
        assert!(matches!(events.last(), Some(TlsEvent::Disconnected)));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(pipe.inbound.is_empty());
    }

    #[test]
    fn test_corrupt_record_after_handshake() {
        let (mut session, mut server, mut pipe) = handshake();

        server.writer().write_all(b"reply").unwrap();
        exchange(&mut server, &mut pipe);
        let last = pipe.inbound.len() - 1;
        pipe.inbound[last] ^= 0xff;

        let events = session.on_transport_input(&mut pipe);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TlsEvent::Disconnected));
        assert_eq!(session.state(), SessionState::Error);

        let mut buf = [0u8; 16];
        assert_eq!(session.read(&mut buf), 0);
    }

    #[test]
    fn test_close_sends_close_notify() {
        let (mut session, mut server, mut pipe) = handshake();

        session.close(&mut pipe);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!pipe.outbound.is_empty());

        let mut input = &pipe.outbound[..];
        while !input.is_empty() {
            server.read_tls(&mut input).unwrap();
        }
        let io_state = server.process_new_packets().unwrap();
        assert!(io_state.peer_has_closed());
    }
}
