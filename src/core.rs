//! Transport-agnostic node: the capability interface the doctor needs from a
//! DHT transport, and the owned [`Node`] resource the roles are handed.
//!
//! - **Capability**: [`DhtTransport`] is everything the tool asks of the
//!   network: bootstrap, dial by public key, listen under a key pair, tear down.
//! - **Listener**: [`Listener`] yields inbound [`EchoStream`]s for one key.
//! - **Ownership**: [`Node`] wraps a transport, is passed explicitly to the
//!   server and client roles, and is destroyed exactly once via [`Node::scoped`]
//!   or [`Node::destroy`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::Result;
use crate::identity::{KeyPair, NodeIdentity, PublicKey};
use crate::stream::EchoStream;

// ============================================================================
// Capability Interface
// ============================================================================

/// What the doctor needs from a peer-to-peer transport.
///
/// Implemented over iroh by [`crate::net::IrohTransport`] and over in-memory
/// pipes by the integration tests.
#[async_trait]
pub trait DhtTransport: Send + Sync + 'static {
    /// Wait until the node has joined the network and report how the network
    /// sees it. No deadline is applied.
    async fn ready(&self) -> Result<NodeIdentity>;

    /// Open a stream to the peer listening under `remote`.
    ///
    /// Returns immediately; the connection is established in the background
    /// and a failure is delivered as a stream error event.
    fn connect(&self, remote: PublicKey) -> EchoStream;

    /// Register a listener under `key_pair.public_key` and return once it is
    /// reachable.
    async fn listen(&self, key_pair: &KeyPair) -> Result<Listener>;

    /// Release every network resource the transport holds.
    async fn destroy(&self);
}

// ============================================================================
// Listener
// ============================================================================

/// Inbound streams accepted under one public key.
#[derive(Debug)]
pub struct Listener {
    public_key: PublicKey,
    incoming: mpsc::Receiver<EchoStream>,
}

impl Listener {
    pub fn new(public_key: PublicKey, incoming: mpsc::Receiver<EchoStream>) -> Self {
        Self {
            public_key,
            incoming,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Next inbound stream, or `None` once the transport stopped listening.
    pub async fn accept(&mut self) -> Option<EchoStream> {
        self.incoming.recv().await
    }
}

// ============================================================================
// Node
// ============================================================================

/// The process-wide node, owned explicitly instead of living in a global.
pub struct Node<T: DhtTransport> {
    transport: T,
    destroyed: AtomicBool,
}

impl<T: DhtTransport> Node<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            destroyed: AtomicBool::new(false),
        }
    }

    /// Run `f` with a fresh node and destroy the node afterwards, whatever
    /// `f` returned.
    pub async fn scoped<F, Fut, R>(transport: T, f: F) -> Result<R>
    where
        F: FnOnce(Arc<Node<T>>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let node = Arc::new(Node::new(transport));
        let result = f(node.clone()).await;
        node.destroy().await;
        result
    }

    /// Wait for bootstrap to finish and return the node's identity.
    pub async fn bootstrap(&self) -> Result<NodeIdentity> {
        let identity = self.transport.ready().await?;
        info!(
            public_key = %identity.key_pair.public_key_hex(),
            host = ?identity.host,
            port = ?identity.port,
            firewalled = identity.firewalled,
            "node bootstrapped"
        );
        Ok(identity)
    }

    pub fn connect(&self, remote: PublicKey) -> EchoStream {
        debug!(remote = %hex::encode(remote), "opening stream");
        self.transport.connect(remote)
    }

    pub async fn listen(&self, key_pair: &KeyPair) -> Result<Listener> {
        self.transport.listen(key_pair).await
    }

    /// Tear the node down. Only the first call reaches the transport; it
    /// returns `true` for that call.
    pub async fn destroy(&self) -> bool {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return false;
        }
        debug!("destroying node");
        self.transport.destroy().await;
        true
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}
