//! [`DhtTransport`] implementation on top of iroh.
//!
//! iroh provides everything the doctor treats as external: endpoints are
//! addressed by ed25519 public keys, peers are found through iroh's address
//! lookup services, connections are encrypted QUIC with hole punching and
//! relay fallback.
//!
//! # Protocol
//!
//! Echo connections negotiate the ALPN in [`NetConfig::alpn`]
//! (`iroh-dht-doctor/echo/1` by default) and carry exactly one bidirectional
//! stream of length-prefixed frames (see [`crate::framing`]).

use std::net::{IpAddr, SocketAddrV4, SocketAddrV6};

use async_trait::async_trait;
use iroh::endpoint::{ConnectionType, TransportConfig, VarInt};
use iroh::protocol::Router;
use iroh::net_report::Report;
use iroh::{Endpoint, EndpointId, RelayMode, SecretKey, Watcher};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::NetConfig;
use crate::core::{DhtTransport, Listener};
use crate::error::{DoctorError, Result, StreamError};
use crate::identity::{derive_key_pair, KeyPair, NodeIdentity, PublicKey};
use crate::server::EchoProtocolHandler;
use crate::stream::EchoStream;

/// Inbound streams buffered per listener before the accept loop picks them up.
const LISTEN_BACKLOG: usize = 16;

/// Transport backed by iroh endpoints.
///
/// The node's own endpoint dials out. Every [`DhtTransport::listen`] call
/// binds one more endpoint under the listener's key pair and serves it with a
/// [`Router`].
pub struct IrohTransport {
    /// The endpoint used for bootstrap reports and outbound connections.
    endpoint: Endpoint,
    /// Key pair the node endpoint was bound with.
    key_pair: KeyPair,
    config: NetConfig,
    routers: Mutex<Vec<Router>>,
}

impl IrohTransport {
    /// Bind the node endpoint under a fresh random identity.
    pub async fn bind(config: NetConfig) -> Result<Self> {
        let key_pair = derive_key_pair(None);
        let endpoint = bind_endpoint(&key_pair, &config, Vec::new())
            .await
            .map_err(DoctorError::Bootstrap)?;
        debug!(id = %endpoint.id(), "node endpoint bound");
        Ok(Self {
            endpoint,
            key_pair,
            config,
            routers: Mutex::new(Vec::new()),
        })
    }

}

/// Bind an endpoint whose identity is `key_pair`.
async fn bind_endpoint(
    key_pair: &KeyPair,
    config: &NetConfig,
    alpns: Vec<Vec<u8>>,
) -> std::result::Result<Endpoint, String> {
    let mut transport = TransportConfig::default();
    transport.keep_alive_interval(Some(config.keep_alive));

    let relay_mode = if config.use_relays {
        RelayMode::Default
    } else {
        RelayMode::Disabled
    };

    let endpoint = Endpoint::builder()
        .secret_key(SecretKey::from_bytes(&key_pair.secret_key))
        .alpns(alpns)
        .relay_mode(relay_mode)
        .transport_config(transport)
        .bind()
        .await
        .map_err(|err| err.to_string())?;

    if endpoint.id().as_bytes() != &key_pair.public_key {
        return Err("endpoint id does not match the derived public key".to_string());
    }
    Ok(endpoint)
}

/// Wait until `endpoint` can be reached by others.
///
/// With relays enabled that means a home relay is connected. Without relays
/// there is nothing to wait for beyond the bind itself.
async fn wait_online(endpoint: &Endpoint, config: &NetConfig) {
    if config.use_relays {
        endpoint.online().await;
    }
}

/// Human-readable description of how we reach `id`.
pub(crate) fn describe_remote(endpoint: &Endpoint, id: EndpointId) -> String {
    match endpoint.conn_type(id).map(|mut watcher| watcher.get()) {
        Some(ConnectionType::Direct(addr)) => addr.to_string(),
        Some(ConnectionType::Relay(url)) => format!("{url} (relayed)"),
        Some(ConnectionType::Mixed(addr, url)) => format!("{addr} (mixed, relay {url})"),
        _ => id.to_string(),
    }
}

#[async_trait]
impl DhtTransport for IrohTransport {
    async fn ready(&self) -> Result<NodeIdentity> {
        wait_online(&self.endpoint, &self.config).await;
        let report = self.endpoint.net_report().initialized().await;
        let observation = Observation::from(&report);
        debug!(?observation, "net report");
        Ok(observation.into_identity(self.key_pair.clone()))
    }

    fn connect(&self, remote: PublicKey) -> EchoStream {
        let (stream, driver) = EchoStream::channel();
        let endpoint = self.endpoint.clone();
        let alpn = self.config.alpn.clone();

        tokio::spawn(async move {
            let peer = hex::encode(remote);
            let connect_error = |reason: String| StreamError::Connect {
                peer: peer.clone(),
                reason,
            };

            let id = match EndpointId::from_bytes(&remote) {
                Ok(id) => id,
                Err(err) => return driver.fail(connect_error(err.to_string())).await,
            };
            let connection = match endpoint.connect(id, &alpn).await {
                Ok(connection) => connection,
                Err(err) => return driver.fail(connect_error(err.to_string())).await,
            };
            let (send, recv) = match connection.open_bi().await {
                Ok(pair) => pair,
                Err(err) => return driver.fail(connect_error(err.to_string())).await,
            };

            let remote_desc = describe_remote(&endpoint, id);
            info!(remote = %remote_desc, "connected");
            driver.run(remote_desc, recv, send).await;
            connection.close(VarInt::from_u32(0), b"done");
        });

        stream
    }

    async fn listen(&self, key_pair: &KeyPair) -> Result<Listener> {
        let endpoint = bind_endpoint(key_pair, &self.config, vec![self.config.alpn.clone()])
            .await
            .map_err(DoctorError::Listen)?;
        wait_online(&endpoint, &self.config).await;

        let (tx, rx) = mpsc::channel(LISTEN_BACKLOG);
        let router = Router::builder(endpoint.clone())
            .accept(
                self.config.alpn.as_slice(),
                EchoProtocolHandler::new(endpoint.clone(), tx),
            )
            .spawn();
        self.routers.lock().await.push(router);
        Ok(Listener::new(key_pair.public_key, rx))
    }

    async fn destroy(&self) {
        let routers: Vec<Router> = self.routers.lock().await.drain(..).collect();
        for router in routers {
            if let Err(err) = router.shutdown().await {
                warn!(%err, "router shutdown failed");
            }
        }
        self.endpoint.close().await;
    }
}

// ============================================================================
// Net report classification
// ============================================================================

/// The parts of an iroh net report that describe how the internet sees us.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Observation {
    pub global_v4: Option<SocketAddrV4>,
    pub global_v6: Option<SocketAddrV6>,
    pub udp_v4: bool,
    pub udp_v6: bool,
    pub mapping_varies_v4: Option<bool>,
    pub mapping_varies_v6: Option<bool>,
}

impl From<&Report> for Observation {
    fn from(report: &Report) -> Self {
        Self {
            global_v4: report.global_v4,
            global_v6: report.global_v6,
            udp_v4: report.udp_v4,
            udp_v6: report.udp_v6,
            mapping_varies_v4: report.mapping_varies_by_dest_ipv4,
            mapping_varies_v6: report.mapping_varies_by_dest_ipv6,
        }
    }
}

impl Observation {
    /// Turn the observation into the node's identity.
    ///
    /// The port is only reported when the NAT was seen to keep the same
    /// mapping for different destinations; an unknown or varying mapping
    /// leaves it out, which classifies the NAT as random. A node with no
    /// working UDP path at all is firewalled.
    pub fn into_identity(self, key_pair: KeyPair) -> NodeIdentity {
        let (addr, varies) = match (self.global_v4, self.global_v6) {
            (Some(v4), _) => (
                Some((IpAddr::V4(*v4.ip()), v4.port())),
                self.mapping_varies_v4,
            ),
            (None, Some(v6)) => (
                Some((IpAddr::V6(*v6.ip()), v6.port())),
                self.mapping_varies_v6,
            ),
            (None, None) => (None, None),
        };

        NodeIdentity {
            key_pair,
            host: addr.map(|(ip, _)| ip),
            port: match varies {
                Some(false) => addr.map(|(_, port)| port),
                _ => None,
            },
            firewalled: !(self.udp_v4 || self.udp_v6),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_pair() -> KeyPair {
        derive_key_pair(Some([5u8; 32]))
    }

    #[test]
    fn stable_mapping_reports_host_and_port() {
        let identity = Observation {
            global_v4: Some("203.0.113.10:61000".parse().unwrap()),
            udp_v4: true,
            mapping_varies_v4: Some(false),
            ..Default::default()
        }
        .into_identity(key_pair());

        assert_eq!(identity.host, Some("203.0.113.10".parse().unwrap()));
        assert_eq!(identity.port, Some(61000));
        assert!(!identity.firewalled);
        assert_eq!(identity.nat_type(), crate::NatType::Consistent);
    }

    #[test]
    fn varying_or_unknown_mapping_hides_port() {
        for varies in [Some(true), None] {
            let identity = Observation {
                global_v4: Some("203.0.113.10:61000".parse().unwrap()),
                udp_v4: true,
                mapping_varies_v4: varies,
                ..Default::default()
            }
            .into_identity(key_pair());
            assert_eq!(identity.port, None);
            assert_eq!(identity.nat_type(), crate::NatType::Random);
        }
    }

    #[test]
    fn ipv6_is_used_when_no_ipv4_was_observed() {
        let identity = Observation {
            global_v6: Some("[2001:db8::1]:7000".parse().unwrap()),
            udp_v6: true,
            mapping_varies_v6: Some(false),
            ..Default::default()
        }
        .into_identity(key_pair());
        assert_eq!(identity.host, Some("2001:db8::1".parse().unwrap()));
        assert_eq!(identity.port, Some(7000));
    }

    #[test]
    fn observation_reads_the_net_report() {
        let report = Report {
            global_v4: Some("198.51.100.20:40000".parse().unwrap()),
            udp_v4: true,
            mapping_varies_by_dest_ipv4: Some(false),
            ..Default::default()
        };
        let observation = Observation::from(&report);
        assert_eq!(observation.global_v4, report.global_v4);
        assert_eq!(observation.mapping_varies_v4, Some(false));
        assert_eq!(observation.mapping_varies_v6, None);

        let identity = observation.into_identity(key_pair());
        assert_eq!(identity.port, Some(40000));
        assert!(!identity.firewalled);
    }

    #[test]
    fn no_udp_means_firewalled() {
        let identity = Observation::default().into_identity(key_pair());
        assert!(identity.firewalled);
        assert_eq!(identity.host, None);
    }
}
