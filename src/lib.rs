//! # iroh DHT doctor
//!
//! This crate is a small connectivity doctor for nodes on the
//! [`iroh`](https://crates.io/crates/iroh) network. It bootstraps a node,
//! reports the address and NAT behaviour the network observed, and can run an
//! echo server or an echo client to check that two nodes which only know each
//! other's public key can talk, and how fast.
//!
//! The crate is split into a handful of modules:
//!
//! - [`core`]: the [`DhtTransport`] capability interface and the owned
//!   [`Node`] handed to both roles.
//! - [`net`]: the iroh-backed [`IrohTransport`].
//! - [`stream`]: event-driven streams ([`EchoStream`], [`StreamEvent`]).
//! - [`framing`]: length-prefixed frames; an empty frame is a keep-alive.
//! - [`probe`]: the client's doubling echo probe.
//! - [`server`]: the echo server and its iroh protocol handler.
//! - [`identity`]: key pairs, seeds and the observed node identity.
//! - [`report`]: console output.
//!
//! ## Getting started
//!
//! ```no_run
//! use iroh_dht_doctor::{
//!     derive_key_pair, run_probe, ConsoleReporter, IrohTransport, NetConfig, Node, ProbeConfig,
//! };
//!
//! # async fn probe() -> iroh_dht_doctor::Result<()> {
//! // The server was started with `--server=<64 zero hex digits>`.
//! let server_key = derive_key_pair(Some([0u8; 32])).public_key;
//! let node = Node::new(IrohTransport::bind(NetConfig::default()).await?);
//! node.bootstrap().await?;
//! let outcome = run_probe(&node, server_key, &ProbeConfig::default(), &ConsoleReporter).await?;
//! node.destroy().await;
//! assert!(outcome.completed);
//! # Ok(())
//! # }
//! ```
//!
//! The binary in `src/main.rs` exposes the same operations as
//! `dht-doctor [--server[=<seed>] | --client=<public key>]`.

pub mod config;
pub mod core;
pub mod error;
pub mod framing;
pub mod identity;
pub mod net;
pub mod probe;
pub mod report;
pub mod server;
pub mod stream;

pub use config::{NetConfig, ProbeConfig, ServerConfig, ECHO_ALPN};
pub use core::{DhtTransport, Listener, Node};
pub use error::{DoctorError, Result, StreamError};
pub use identity::{
    derive_key_pair, parse_public_key, parse_seed, KeyPair, NatType, NodeIdentity, PublicKey,
};
pub use net::IrohTransport;
pub use probe::{run_probe, EchoProbe, ProbeOutcome, ProbeState, ProbeStep, RoundTrip};
pub use report::{ConsoleReporter, Reporter, SilentReporter};
pub use server::{EchoConnection, EchoProtocolHandler, EchoServer, ServerStats};
pub use stream::{EchoStream, StreamDriver, StreamEvent, StreamWriter};
