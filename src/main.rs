//! `dht-doctor`: bootstrap an iroh node and report what the network sees.
//!
//! # Usage
//!
//! ```bash
//! # Print node info and exit
//! dht-doctor
//!
//! # Run an echo server (optionally reusing a previous identity)
//! dht-doctor --server
//! dht-doctor --server=<64 hex chars>
//!
//! # Probe a running echo server by its public key
//! dht-doctor --client=<64 hex chars>
//! ```
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use once_cell::sync::Lazy;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use iroh_dht_doctor::{
    derive_key_pair, parse_public_key, parse_seed, run_probe, ConsoleReporter, DhtTransport,
    DoctorError, EchoServer, IrohTransport, NetConfig, Node, ProbeConfig, PublicKey, ServerConfig,
};

static LOGGING: Lazy<()> = Lazy::new(|| {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
});

/// Exit status used when a second interrupt arrives during shutdown.
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Parser, Debug)]
#[command(
    name = "dht-doctor",
    version,
    about = "Check iroh connectivity: node info, echo server and echo probe"
)]
struct Cli {
    /// Run an echo server. Pass a hex seed to reuse a previous server identity.
    #[arg(
        short,
        long,
        value_name = "SEED",
        num_args = 0..=1,
        require_equals = true,
        conflicts_with = "client"
    )]
    server: Option<Option<String>>,

    /// Probe the echo server listening under this hex public key.
    #[arg(short, long, value_name = "PUBLIC_KEY")]
    client: Option<String>,

    /// Do not use relay servers; only direct paths are tried.
    #[arg(long)]
    no_relay: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum Mode {
    Info,
    Server { seed: Option<[u8; 32]> },
    Client { remote: PublicKey },
}

impl Cli {
    fn mode(&self) -> Result<Mode, DoctorError> {
        if let Some(client) = &self.client {
            return Ok(Mode::Client {
                remote: parse_public_key(client)?,
            });
        }
        match &self.server {
            None => Ok(Mode::Info),
            Some(None) => Ok(Mode::Server { seed: None }),
            Some(Some(seed)) => Ok(Mode::Server {
                seed: Some(parse_seed(seed)?),
            }),
        }
    }

    fn net_config(&self) -> NetConfig {
        NetConfig {
            use_relays: !self.no_relay,
            ..NetConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    Lazy::force(&LOGGING);
    let cli = Cli::parse();
    let mode = cli.mode()?;

    let transport = IrohTransport::bind(cli.net_config())
        .await
        .context("create node")?;

    Node::scoped(transport, |node| run(node, mode)).await?;
    Ok(())
}

async fn run(node: Arc<Node<IrohTransport>>, mode: Mode) -> iroh_dht_doctor::Result<()> {
    let console = ConsoleReporter;
    console.bootstrapping();
    let identity = node.bootstrap().await?;
    console.node_info(&identity);

    match mode {
        Mode::Info => Ok(()),
        Mode::Client { remote } => {
            let outcome = run_probe(&node, remote, &ProbeConfig::default(), &console).await?;
            console.summary(&outcome);
            Ok(())
        }
        Mode::Server { seed } => serve(&node, seed).await,
    }
}

/// Run the echo server until the first interrupt.
async fn serve<T: DhtTransport>(
    node: &Node<T>,
    seed: Option<[u8; 32]>,
) -> iroh_dht_doctor::Result<()> {
    let key_pair = derive_key_pair(seed);
    let server = EchoServer::start(
        node,
        key_pair,
        ServerConfig::default(),
        Arc::new(ConsoleReporter),
    )
    .await?;
    let stats = server.run_until(interrupted()).await;
    info!(
        accepted = stats.accepted,
        closed_cleanly = stats.closed_cleanly,
        closed_with_error = stats.closed_with_error,
        echoed_bytes = stats.echoed_bytes,
        "echo server stopped"
    );
    Ok(())
}

/// Resolve on the first interrupt. A second one while the node is being torn
/// down ends the process right away.
async fn interrupted() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "cannot listen for interrupts");
        std::future::pending::<()>().await;
    }
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
    });
}
