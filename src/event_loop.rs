//! Single-threaded mio event loop for `TcpTransport` clients.
//!
//! The loop owns the `Poll`. Each turn it drains events the transport queued
//! outside of a readiness callback (connect failures raised synchronously,
//! for example), waits for readiness, hands readiness to the transport
//! whose token matches, and then drains again so the client sees every
//! resulting event before the turn ends.

use crate::client::{ClientHandler, SecureClient};
use crate::config::IoConfig;
use crate::tls::TlsConnector;
use crate::transport::{Readiness, TcpTransport};
use mio::{Events, Poll, Registry};
use std::io;
use std::time::{Duration, Instant};
use tracing::trace;

pub struct EventLoop {
    poll: Poll,
    events: Events,
    poll_timeout: Duration,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        Self::with_config(&IoConfig::default())
    }

    pub fn with_config(config: &IoConfig) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(config.events_capacity.max(1)),
            poll_timeout: config.poll_timeout(),
        })
    }

    /// Registry for building transports that this loop will drive.
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    /// Run one turn, waiting at most `timeout` for readiness.
    pub fn run_once<H, C>(
        &mut self,
        client: &mut SecureClient<TcpTransport, H, C>,
        timeout: Option<Duration>,
    ) -> io::Result<()>
    where
        H: ClientHandler,
        C: TlsConnector,
    {
        client.pump();

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e);
        }

        let token = client.transport().token();
        for event in self.events.iter() {
            if event.token() != token {
                trace!(token = event.token().0, "event for unknown token");
                continue;
            }
            client.transport_mut().on_ready(Readiness::from(event));
        }

        client.pump();
        Ok(())
    }

    /// Run turns until `done` returns true. Returns `Ok(false)` if `timeout`
    /// elapses first.
    pub fn run_until<H, C, F>(
        &mut self,
        client: &mut SecureClient<TcpTransport, H, C>,
        timeout: Duration,
        mut done: F,
    ) -> io::Result<bool>
    where
        H: ClientHandler,
        C: TlsConnector,
        F: FnMut(&SecureClient<TcpTransport, H, C>) -> bool,
    {
        let deadline = Instant::now() + timeout;

        loop {
            client.pump();
            if done(&*client) {
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }

            let wait = (deadline - now).min(self.poll_timeout);
            self.run_once(client, Some(wait))?;
        }
    }
}
