//! Console reporting.
//!
//! The roles report what happens through [`Reporter`]; the binary plugs in
//! [`ConsoleReporter`], tests plug in recorders. Nothing here affects the
//! protocol.

use std::fmt::Write as _;

use tokio::time::Duration;

use crate::error::StreamError;
use crate::identity::{KeyPair, NodeIdentity};
use crate::probe::ProbeOutcome;

/// Observer for lifecycle events of both roles. Every method defaults to a no-op.
pub trait Reporter: Send + Sync {
    fn connecting(&self) {}
    fn connected(&self, _remote: &str) {}
    fn sending(&self, _size: usize) {}
    fn echoed(&self, _bytes: usize, _elapsed: Duration) {}
    fn done(&self) {}
    fn closed(&self) {}

    fn server_starting(&self, _key_pair: &KeyPair) {}
    fn server_listening(&self, _key_pair: &KeyPair) {}
    fn accepted(&self, _remote: &str) {}
    fn connection_closed(&self, _remote: &str, _error: Option<&StreamError>) {}
    fn shutting_down(&self) {}
}

/// Reporter that swallows everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct SilentReporter;

impl Reporter for SilentReporter {}

/// Prints human-readable progress to stdout.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsoleReporter;

impl ConsoleReporter {
    pub fn bootstrapping(&self) {
        println!("Waiting for node to be fully bootstrapped to collect info...");
    }

    pub fn node_info(&self, identity: &NodeIdentity) {
        println!();
        print!("{}", format_node_info(identity));
        println!();
    }

    pub fn summary(&self, outcome: &ProbeOutcome) {
        println!("{}", format_summary(outcome));
    }
}

impl Reporter for ConsoleReporter {
    fn connecting(&self) {
        println!("Connecting to test server...");
    }

    fn connected(&self, remote: &str) {
        println!("Connected to {remote}");
    }

    fn sending(&self, size: usize) {
        println!("Sending {size} bytes for the server to echo");
    }

    fn echoed(&self, bytes: usize, elapsed: Duration) {
        println!("{}", format_echo(bytes, elapsed));
    }

    fn done(&self) {
        println!("Done! ending connection...");
    }

    fn closed(&self) {
        println!("Connection closed");
    }

    fn server_starting(&self, key_pair: &KeyPair) {
        println!("Creating test server...");
        println!();
        println!("To restart with the same server do:");
        println!("  --server={}", key_pair.seed_hex());
        println!();
    }

    fn server_listening(&self, key_pair: &KeyPair) {
        println!("Server is listening. To test connections run:");
        println!("  --client={}", key_pair.public_key_hex());
        println!();
    }

    fn accepted(&self, remote: &str) {
        println!("Received new connection from {remote}");
    }

    fn connection_closed(&self, remote: &str, error: Option<&StreamError>) {
        println!("{}", format_connection_closed(remote, error));
    }

    fn shutting_down(&self) {
        println!("Shutting down...");
    }
}

/// The "Node info" block printed after bootstrap.
pub fn format_node_info(identity: &NodeIdentity) -> String {
    let host = identity
        .host
        .map(|host| host.to_string())
        .unwrap_or_else(|| "none".to_string());
    let port = identity
        .port
        .map(|port| port.to_string())
        .unwrap_or_else(|| "none".to_string());

    let mut out = String::new();
    let _ = writeln!(out, "Node info:");
    let _ = writeln!(out, "- public key: {}", identity.key_pair.public_key_hex());
    let _ = writeln!(out, "- remote host: {host}");
    let _ = writeln!(out, "- remote port: {port}");
    let _ = writeln!(out, "- firewalled: {}", identity.firewalled);
    let _ = writeln!(out, "- nat type: {}", identity.nat_type());
    out
}

pub fn format_echo(bytes: usize, elapsed: Duration) -> String {
    format!(
        "Server echoed back {bytes} bytes in {}ms",
        elapsed.as_millis()
    )
}

/// One line summing up a probe session.
pub fn format_summary(outcome: &ProbeOutcome) -> String {
    let peak = outcome
        .rounds
        .iter()
        .filter_map(|round| round.throughput())
        .fold(None, |best: Option<f64>, rate| Some(best.map_or(rate, |b| b.max(rate))));
    let status = if outcome.completed {
        "complete"
    } else {
        "incomplete"
    };
    match peak {
        Some(rate) => format!(
            "Probe {status} after {} rounds, peak echo throughput {:.2} MiB/s",
            outcome.rounds.len(),
            rate / (1024.0 * 1024.0)
        ),
        None => format!("Probe {status} after {} rounds", outcome.rounds.len()),
    }
}

pub fn format_connection_closed(remote: &str, error: Option<&StreamError>) -> String {
    match error {
        Some(err) => format!("Connection from {remote} was closed ({err})"),
        None => format!("Connection from {remote} was closed"),
    }
}
