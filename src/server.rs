//! Server role: mirror every byte received on every accepted stream.
//!
//! [`EchoServer`] registers a listener under a key pair and hands each inbound
//! stream to its own task running an [`EchoConnection`]. A failing connection
//! only records its error; the server keeps listening until its shutdown
//! future resolves.
//!
//! [`EchoProtocolHandler`] is the iroh side: the router invokes it for every
//! connection negotiated with the echo ALPN and it turns the first
//! bidirectional stream into an [`EchoStream`] for the listener.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler};
use iroh::Endpoint;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::core::{DhtTransport, Listener, Node};
use crate::error::{Result, StreamError};
use crate::identity::KeyPair;
use crate::net::describe_remote;
use crate::report::Reporter;
use crate::stream::{EchoStream, StreamDriver, StreamEvent};

// ============================================================================
// Per-connection state machine
// ============================================================================

/// Lifecycle of one echoed connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, peer address not yet known.
    Accepted,
    /// Mirroring data.
    Echoing,
    /// Peer finished sending; our side has been ended too.
    Ending,
    /// Terminal.
    Closed,
}

/// What the connection task has to do after an event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EchoAction {
    Nothing,
    /// The peer is known; announce it.
    Announce(String),
    /// Write these bytes back.
    Echo(Bytes),
    /// Mirror the peer's end of stream.
    End,
    /// The stream closed; report and stop.
    Closed,
}

/// Echo session for one inbound stream.
#[derive(Debug)]
pub struct EchoConnection {
    remote: String,
    state: ConnectionState,
    error: Option<StreamError>,
    echoed: u64,
}

impl Default for EchoConnection {
    fn default() -> Self {
        Self {
            remote: "unknown".to_string(),
            state: ConnectionState::Accepted,
            error: None,
            echoed: 0,
        }
    }
}

impl EchoConnection {
    pub fn on_event(&mut self, event: StreamEvent) -> EchoAction {
        match event {
            StreamEvent::Connected { remote } => {
                self.remote = remote.clone();
                self.state = ConnectionState::Echoing;
                EchoAction::Announce(remote)
            }
            // Keep-alives carry nothing to mirror.
            StreamEvent::Data(data) if data.is_empty() => EchoAction::Nothing,
            StreamEvent::Data(data) => {
                self.echoed += data.len() as u64;
                EchoAction::Echo(data)
            }
            StreamEvent::End => {
                self.state = ConnectionState::Ending;
                EchoAction::End
            }
            StreamEvent::Error(err) => {
                self.record_error(err);
                EchoAction::Nothing
            }
            StreamEvent::Closed => {
                self.state = ConnectionState::Closed;
                EchoAction::Closed
            }
        }
    }

    /// Keep the first error seen on this connection. A bare
    /// [`StreamError::Closed`] only says the driver stopped, so the cause it
    /// reports afterwards takes its place.
    pub fn record_error(&mut self, err: StreamError) {
        if matches!(self.error, None | Some(StreamError::Closed)) {
            self.error = Some(err);
        }
    }

    /// A command could not be queued. The driver reports the real cause as an
    /// `Error` event, so only other failures are kept here.
    fn record_send_failure(&mut self, err: StreamError) {
        if err == StreamError::Closed {
            debug!(remote = %self.remote, "stream driver already stopped");
        } else {
            self.record_error(err);
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn error(&self) -> Option<&StreamError> {
        self.error.as_ref()
    }

    pub fn echoed_bytes(&self) -> u64 {
        self.echoed
    }
}

/// Summary of a finished connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub remote: String,
    pub echoed_bytes: u64,
    pub error: Option<StreamError>,
}

/// Mirror `stream` until it closes.
pub async fn echo_stream(
    mut stream: EchoStream,
    config: &ServerConfig,
    reporter: &dyn Reporter,
) -> ConnectionSummary {
    let mut connection = EchoConnection::default();
    if let Err(err) = stream.set_keep_alive(config.keep_alive).await {
        connection.record_send_failure(err);
    }

    loop {
        let event = stream.next_event().await;
        match connection.on_event(event) {
            EchoAction::Nothing => {}
            EchoAction::Announce(remote) => reporter.accepted(&remote),
            EchoAction::Echo(data) => {
                if let Err(err) = stream.write(data).await {
                    connection.record_send_failure(err);
                }
            }
            EchoAction::End => {
                let _ = stream.end().await;
            }
            EchoAction::Closed => break,
        }
    }

    reporter.connection_closed(connection.remote(), connection.error());
    debug!(
        remote = connection.remote(),
        echoed = connection.echoed_bytes(),
        "echo connection finished"
    );
    ConnectionSummary {
        remote: connection.remote,
        echoed_bytes: connection.echoed,
        error: connection.error,
    }
}

// ============================================================================
// Listener loop
// ============================================================================

/// Counters reported when the server stops.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub accepted: usize,
    pub closed_cleanly: usize,
    pub closed_with_error: usize,
    pub echoed_bytes: u64,
}

impl ServerStats {
    fn record(&mut self, summary: &ConnectionSummary) {
        if summary.error.is_some() {
            self.closed_with_error += 1;
        } else {
            self.closed_cleanly += 1;
        }
        self.echoed_bytes += summary.echoed_bytes;
    }
}

/// A listening echo server.
pub struct EchoServer {
    listener: Listener,
    config: ServerConfig,
    reporter: Arc<dyn Reporter>,
}

impl EchoServer {
    /// Register the listener under `key_pair` and wait until it is reachable.
    pub async fn start<T: DhtTransport>(
        node: &Node<T>,
        key_pair: KeyPair,
        config: ServerConfig,
        reporter: Arc<dyn Reporter>,
    ) -> Result<Self> {
        reporter.server_starting(&key_pair);
        let listener = node.listen(&key_pair).await?;
        info!(public_key = %key_pair.public_key_hex(), "echo server listening");
        reporter.server_listening(&key_pair);
        Ok(Self {
            listener,
            config,
            reporter,
        })
    }

    /// Echo inbound streams until `shutdown` resolves or the listener goes
    /// away. Connections still open at that point are dropped and left out of
    /// the close counters.
    pub async fn run_until<F>(mut self, shutdown: F) -> ServerStats
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut stats = ServerStats::default();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    self.reporter.shutting_down();
                    break;
                }
                incoming = self.listener.accept() => {
                    let Some(stream) = incoming else {
                        warn!("listener closed");
                        break;
                    };
                    stats.accepted += 1;
                    let config = self.config.clone();
                    let reporter = self.reporter.clone();
                    connections.spawn(async move {
                        echo_stream(stream, &config, reporter.as_ref()).await
                    });
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    match joined {
                        Ok(summary) => stats.record(&summary),
                        Err(err) => warn!(%err, "echo task failed"),
                    }
                }
            }
        }

        connections.abort_all();
        while let Some(joined) = connections.join_next().await {
            if let Ok(summary) = joined {
                stats.record(&summary);
            }
        }
        stats
    }
}

// ============================================================================
// iroh protocol handler
// ============================================================================

/// Router entry point for inbound echo connections.
#[derive(Clone)]
pub struct EchoProtocolHandler {
    endpoint: Endpoint,
    incoming: mpsc::Sender<EchoStream>,
}

impl EchoProtocolHandler {
    pub fn new(endpoint: Endpoint, incoming: mpsc::Sender<EchoStream>) -> Self {
        Self { endpoint, incoming }
    }
}

impl fmt::Debug for EchoProtocolHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EchoProtocolHandler").finish()
    }
}

impl ProtocolHandler for EchoProtocolHandler {
    fn accept(
        &self,
        connection: Connection,
    ) -> impl Future<Output = std::result::Result<(), AcceptError>> + Send {
        let handler = self.clone();
        async move {
            handle_connection(handler, connection)
                .await
                .map_err(AcceptError::from_err)
        }
    }
}

/// Hand the connection's first bidirectional stream to the listener and pump
/// it until both sides are done.
async fn handle_connection(
    handler: EchoProtocolHandler,
    connection: Connection,
) -> std::result::Result<(), StreamError> {
    let (send, recv) = connection
        .accept_bi()
        .await
        .map_err(|err| StreamError::Io(err.to_string()))?;
    let remote = describe_remote(&handler.endpoint, connection.remote_id());

    let (stream, driver): (EchoStream, StreamDriver) = EchoStream::channel();
    handler
        .incoming
        .send(stream)
        .await
        .map_err(|_| StreamError::Closed)?;
    driver.run(remote, recv, send).await;

    // The client reads our last echo and then closes the connection.
    connection.closed().await;
    Ok(())
}
