use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex, RwLock};

use iroh_dht_doctor::{
    derive_key_pair, DhtTransport, EchoStream, KeyPair, Listener, NodeIdentity, PublicKey,
    Reporter, StreamError,
};

/// Buffer size of the in-memory pipes standing in for network paths.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Listeners reachable by public key, shared by every test node.
#[derive(Default)]
pub struct NetworkRegistry {
    listeners: RwLock<HashMap<PublicKey, mpsc::Sender<EchoStream>>>,
}

impl NetworkRegistry {
    pub async fn register(&self, key: PublicKey, incoming: mpsc::Sender<EchoStream>) {
        let mut listeners = self.listeners.write().await;
        listeners.insert(key, incoming);
    }

    pub async fn unregister(&self, key: &PublicKey) {
        let mut listeners = self.listeners.write().await;
        listeners.remove(key);
    }

    pub async fn get(&self, key: &PublicKey) -> Option<mpsc::Sender<EchoStream>> {
        let listeners = self.listeners.read().await;
        listeners.get(key).cloned()
    }
}

/// In-memory [`DhtTransport`]: streams are framed duplex pipes.
#[derive(Clone)]
pub struct TestTransport {
    registry: Arc<NetworkRegistry>,
    identity: NodeIdentity,
    listening: Arc<Mutex<HashSet<PublicKey>>>,
    destroy_calls: Arc<AtomicUsize>,
}

impl TestTransport {
    pub fn new(registry: Arc<NetworkRegistry>, index: u8) -> Self {
        Self {
            registry,
            identity: make_identity(index),
            listening: Arc::new(Mutex::new(HashSet::new())),
            destroy_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    /// Dial `remote` and get the raw client end of the pipe, bypassing the
    /// framing on our side. Used to feed a listener malformed input.
    pub async fn connect_raw(&self, remote: PublicKey) -> Option<DuplexStream> {
        let incoming = self.registry.get(&remote).await?;
        let (client_io, server_io) = tokio::io::duplex(PIPE_CAPACITY);
        let (server_stream, server_driver) = EchoStream::channel();
        incoming.send(server_stream).await.ok()?;
        let (reader, writer) = tokio::io::split(server_io);
        tokio::spawn(server_driver.run(self.label(), reader, writer));
        Some(client_io)
    }

    fn label(&self) -> String {
        peer_label(&self.identity.public_key())
    }
}

#[async_trait]
impl DhtTransport for TestTransport {
    async fn ready(&self) -> iroh_dht_doctor::Result<NodeIdentity> {
        Ok(self.identity.clone())
    }

    fn connect(&self, remote: PublicKey) -> EchoStream {
        let (stream, driver) = EchoStream::channel();
        let registry = self.registry.clone();
        let local_label = self.label();

        tokio::spawn(async move {
            let unreachable = || StreamError::Connect {
                peer: hex::encode(remote),
                reason: "no listener for public key".into(),
            };
            let Some(incoming) = registry.get(&remote).await else {
                return driver.fail(unreachable()).await;
            };

            let (client_io, server_io) = tokio::io::duplex(PIPE_CAPACITY);
            let (server_stream, server_driver) = EchoStream::channel();
            if incoming.send(server_stream).await.is_err() {
                return driver.fail(unreachable()).await;
            }

            let (server_reader, server_writer) = tokio::io::split(server_io);
            tokio::spawn(server_driver.run(local_label, server_reader, server_writer));

            let (client_reader, client_writer) = tokio::io::split(client_io);
            driver
                .run(peer_label(&remote), client_reader, client_writer)
                .await;
        });

        stream
    }

    async fn listen(&self, key_pair: &KeyPair) -> iroh_dht_doctor::Result<Listener> {
        let (tx, rx) = mpsc::channel(16);
        self.registry.register(key_pair.public_key, tx).await;
        self.listening.lock().await.insert(key_pair.public_key);
        Ok(Listener::new(key_pair.public_key, rx))
    }

    async fn destroy(&self) {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        let keys: Vec<PublicKey> = self.listening.lock().await.drain().collect();
        for key in keys {
            self.registry.unregister(&key).await;
        }
    }
}

pub fn make_identity(index: u8) -> NodeIdentity {
    NodeIdentity {
        key_pair: derive_key_pair(Some([index; 32])),
        host: Some(format!("192.0.2.{index}").parse().expect("valid ip")),
        port: Some(40_000 + u16::from(index)),
        firewalled: false,
    }
}

pub fn peer_label(key: &PublicKey) -> String {
    format!("peer-{}", hex::encode(&key[..4]))
}

/// Everything a [`Reporter`] was told, in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recorded {
    Connecting,
    Connected(String),
    Sending(usize),
    Echoed(usize),
    Done,
    Closed,
    ServerStarting,
    ServerListening,
    Accepted(String),
    ConnectionClosed(String, Option<StreamError>),
    ShuttingDown,
}

/// Reporter that keeps every event and forwards it on a channel.
pub struct RecordingReporter {
    events: StdMutex<Vec<Recorded>>,
    tx: mpsc::UnboundedSender<Recorded>,
}

impl RecordingReporter {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Recorded>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                events: StdMutex::new(Vec::new()),
                tx,
            }),
            rx,
        )
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().expect("reporter lock").clone()
    }

    fn record(&self, event: Recorded) {
        self.events.lock().expect("reporter lock").push(event.clone());
        let _ = self.tx.send(event);
    }
}

impl Reporter for RecordingReporter {
    fn connecting(&self) {
        self.record(Recorded::Connecting);
    }

    fn connected(&self, remote: &str) {
        self.record(Recorded::Connected(remote.to_string()));
    }

    fn sending(&self, size: usize) {
        self.record(Recorded::Sending(size));
    }

    fn echoed(&self, bytes: usize, _elapsed: tokio::time::Duration) {
        self.record(Recorded::Echoed(bytes));
    }

    fn done(&self) {
        self.record(Recorded::Done);
    }

    fn closed(&self) {
        self.record(Recorded::Closed);
    }

    fn server_starting(&self, _key_pair: &KeyPair) {
        self.record(Recorded::ServerStarting);
    }

    fn server_listening(&self, _key_pair: &KeyPair) {
        self.record(Recorded::ServerListening);
    }

    fn accepted(&self, remote: &str) {
        self.record(Recorded::Accepted(remote.to_string()));
    }

    fn connection_closed(&self, remote: &str, error: Option<&StreamError>) {
        self.record(Recorded::ConnectionClosed(remote.to_string(), error.cloned()));
    }

    fn shutting_down(&self) {
        self.record(Recorded::ShuttingDown);
    }
}

/// Wait for the next `ConnectionClosed` report.
pub async fn next_connection_closed(
    rx: &mut mpsc::UnboundedReceiver<Recorded>,
) -> (String, Option<StreamError>) {
    while let Some(event) = rx.recv().await {
        if let Recorded::ConnectionClosed(remote, error) = event {
            return (remote, error);
        }
    }
    panic!("reporter channel closed before a connection closed");
}
