//! Client metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "stcp_connect_attempts",
    description = "Total connect() calls that started an attempt"
)]
pub static CONNECT_ATTEMPTS: Counter = Counter::new();

#[metric(
    name = "stcp_connects",
    description = "Attempts that reached the connected state"
)]
pub static CONNECTS: Counter = Counter::new();

#[metric(
    name = "stcp_connect_transport_failures",
    description = "Attempts that failed in the transport layer"
)]
pub static CONNECT_TRANSPORT_FAILURES: Counter = Counter::new();

#[metric(
    name = "stcp_connect_tls_failures",
    description = "Attempts that failed during the TLS handshake"
)]
pub static CONNECT_TLS_FAILURES: Counter = Counter::new();

#[metric(
    name = "stcp_disconnects",
    description = "Connected sessions that ended"
)]
pub static DISCONNECTS: Counter = Counter::new();

#[metric(
    name = "stcp_connected",
    description = "Clients currently in the connected state"
)]
pub static CONNECTED: Gauge = Gauge::new();

#[metric(name = "stcp_bytes_written", description = "Application bytes written")]
pub static BYTES_WRITTEN: Counter = Counter::new();

#[metric(name = "stcp_bytes_read", description = "Application bytes read")]
pub static BYTES_READ: Counter = Counter::new();

/// Current counter and gauge values, by name.
pub fn snapshot() -> Vec<(String, i64)> {
    let mut values = Vec::new();

    for metric in metriken::metrics().iter() {
        let name = metric.name();
        if !name.starts_with("stcp_") {
            continue;
        }

        match metric.value() {
            Some(metriken::Value::Counter(v)) => values.push((name.to_string(), v as i64)),
            Some(metriken::Value::Gauge(v)) => values.push((name.to_string(), v)),
            _ => {}
        }
    }

    values.sort();
    values
}
