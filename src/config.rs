//! Tunables for the probe, the echo server and the iroh binding.
//!
//! Nothing is read from disk; the binary fills these from its flags and
//! otherwise relies on the defaults below.

use tokio::time::Duration;

/// Size of the first probe payload in bytes.
pub const INITIAL_PAYLOAD_SIZE: usize = 32;

/// Round size at which the probe stops (4 MiB).
pub const PROBE_THRESHOLD: usize = 4 * 1024 * 1024;

/// Idle interval after which the server sends a keep-alive frame.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(5000);

/// ALPN under which echo streams are negotiated.
pub const ECHO_ALPN: &[u8] = b"iroh-dht-doctor/echo/1";

/// Client probe settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeConfig {
    pub initial_size: usize,
    pub threshold: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            initial_size: INITIAL_PAYLOAD_SIZE,
            threshold: PROBE_THRESHOLD,
        }
    }
}

/// Echo server settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub keep_alive: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            keep_alive: KEEP_ALIVE_INTERVAL,
        }
    }
}

/// Settings for binding iroh endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetConfig {
    pub alpn: Vec<u8>,
    /// Use the default relay servers. Disabling them leaves only direct
    /// (hole-punched) paths.
    pub use_relays: bool,
    /// QUIC-level keep-alive for every connection.
    pub keep_alive: Duration,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            alpn: ECHO_ALPN.to_vec(),
            use_relays: true,
            keep_alive: KEEP_ALIVE_INTERVAL,
        }
    }
}
