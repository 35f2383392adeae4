//! stcp binary: connect, send a payload, and copy whatever comes back to
//! stdout.

use clap::Parser;
use mio::Token;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use stcp::config::TlsSettings;
use stcp::{
    ClientCtx, ClientHandler, ClientState, Config, ConnectError, EventLoop, SecureClient,
    TcpTransport,
};

#[derive(Parser)]
#[command(name = "stcp")]
#[command(about = "Event-driven TCP client with an optional TLS overlay")]
struct Args {
    /// Remote host. Defaults to the configured endpoint.
    host: Option<String>,

    /// Remote port. Defaults to the configured endpoint.
    port: Option<u16>,

    /// Path to configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use TLS even if the configuration has no [tls] section
    #[arg(long)]
    tls: bool,

    /// Name for SNI and certificate verification
    #[arg(long)]
    server_name: Option<String>,

    /// PEM file with additional trust anchors
    #[arg(long)]
    ca_file: Option<PathBuf>,

    /// ALPN protocol to offer (repeatable)
    #[arg(long)]
    alpn: Vec<String>,

    /// Payload to send once connected
    #[arg(long)]
    send: Option<String>,

    /// Give up after this many milliseconds
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    /// Fold command line overrides into the loaded configuration.
    fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.endpoint.host = host.clone();
        }
        if let Some(port) = self.port {
            config.endpoint.port = port;
        }

        let wants_tls =
            self.tls || self.server_name.is_some() || self.ca_file.is_some() || !self.alpn.is_empty();
        if wants_tls && config.tls.is_none() {
            config.tls = Some(TlsSettings::default());
        }

        if let Some(tls) = config.tls.as_mut() {
            if self.server_name.is_some() {
                tls.server_name = self.server_name.clone();
            }
            if self.ca_file.is_some() {
                tls.ca_file = self.ca_file.clone();
            }
            if !self.alpn.is_empty() {
                tls.alpn = self.alpn.clone();
            }
        }
    }
}

/// Sends the payload on connect and mirrors input to stdout.
struct Relay {
    payload: Option<Vec<u8>>,
    outcome: Option<Result<(), ConnectError>>,
    closed: bool,
    buf: Vec<u8>,
}

impl ClientHandler for Relay {
    fn on_connected(&mut self, ctx: &mut dyn ClientCtx, result: Result<(), ConnectError>) {
        match &result {
            Ok(()) => {
                tracing::info!(tls = ctx.is_tls(), "connected");
                if let Some(payload) = self.payload.take() {
                    ctx.write(&payload);
                }
            }
            Err(e) => tracing::error!(error = %e, code = e.code(), "connect failed"),
        }
        self.outcome = Some(result);
    }

    fn on_disconnected(&mut self, _ctx: &mut dyn ClientCtx) {
        tracing::info!("disconnected");
        self.closed = true;
    }

    fn on_input(&mut self, ctx: &mut dyn ClientCtx) {
        let mut stdout = std::io::stdout().lock();
        loop {
            let n = ctx.read(&mut self.buf);
            if n == 0 {
                break;
            }
            if let Err(e) = stdout.write_all(&self.buf[..n]) {
                tracing::warn!(error = %e, "stdout write failed");
                ctx.disconnect();
                return;
            }
        }
        let _ = stdout.flush();
    }
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return;
    }

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    args.apply(&mut config);

    if let Err(e) = stcp::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    std::process::exit(run(&config, &args));
}

fn run(config: &Config, args: &Args) -> i32 {
    let mode = match config.mode() {
        Ok(mode) => mode,
        Err(e) => {
            tracing::error!(error = %e, "invalid tls configuration");
            return 1;
        }
    };

    let mut event_loop = match EventLoop::with_config(&config.io) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, "failed to create event loop");
            return 1;
        }
    };

    let transport = match TcpTransport::with_config(event_loop.registry(), Token(0), &config.io) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(error = %e, "failed to create transport");
            return 1;
        }
    };

    let relay = Relay {
        payload: args.send.as_ref().map(|s| s.as_bytes().to_vec()),
        outcome: None,
        closed: false,
        buf: vec![0u8; config.io.recv_chunk_size.max(1)],
    };

    let mut client = SecureClient::new(transport, mode, relay);
    client.connect(&config.endpoint.host, config.endpoint.port);

    let timeout = Duration::from_millis(args.timeout_ms);
    let finished = event_loop.run_until(&mut client, timeout, |c| {
        c.handler().closed || matches!(c.handler().outcome, Some(Err(_)))
    });

    if let Err(e) = finished {
        tracing::error!(error = %e, "event loop failed");
        return 1;
    }

    let code = match &client.handler().outcome {
        Some(Ok(())) => 0,
        Some(Err(_)) => 2,
        None => {
            tracing::error!("timed out waiting for connection");
            3
        }
    };

    if client.state() == ClientState::Connected {
        client.disconnect();
    }

    for (name, value) in stcp::metrics::snapshot() {
        tracing::debug!(name = %name, value, "metric");
    }

    code
}

fn print_default_config() {
    let config = r#"# stcp configuration

[endpoint]
host = "127.0.0.1"
port = 443

# Presence of this section selects TLS mode.
[tls]
# Name for SNI and certificate verification (default: endpoint host)
# server_name = "example.com"

# PEM bundle of additional trust anchors
# ca_file = "/etc/ssl/certs/ca.pem"

# Trust the bundled webpki roots
webpki_roots = true

# ALPN protocols to offer
# alpn = ["h2", "http/1.1"]

[io]
recv_chunk_size = 16384
send_buffer_capacity = 16384
tcp_nodelay = true
poll_timeout_ms = 100
events_capacity = 128

[logging]
# Log level: "error", "warn", "info", "debug", "trace"
level = "info"

# Log format: "pretty", "json", or "compact"
format = "pretty"
"#;
    print!("{}", config);
}
