//! Node identity: key pairs, seed handling and the externally observed view of a node.
//!
//! Key pairs are plain ed25519 key pairs. The 32-byte secret is the ed25519
//! seed, so the same seed always yields the same public key, which in turn is
//! the address peers dial. This matches how iroh derives an `EndpointId` from
//! its `SecretKey`, so a [`KeyPair`] can be handed to the transport verbatim.

use std::fmt;
use std::net::IpAddr;

use ed25519_dalek::SigningKey;

use crate::error::DoctorError;

/// A 32-byte ed25519 public key identifying a node or a listener.
pub type PublicKey = [u8; 32];

/// Length in bytes of keys and seeds accepted on the command line.
pub const KEY_LEN: usize = 32;

/// An ed25519 key pair whose secret half is the 32-byte seed.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub public_key: PublicKey,
    pub secret_key: [u8; 32],
}

impl KeyPair {
    /// Hex encoding of the secret seed, suitable for `--server=<seed>`.
    pub fn seed_hex(&self) -> String {
        hex::encode(self.secret_key)
    }

    /// Hex encoding of the public key, suitable for `--client=<key>`.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the secret half.
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Derive a key pair, deterministically when a seed is given.
///
/// Without a seed a fresh random seed is drawn from the OS RNG.
///
/// ```
/// use iroh_dht_doctor::derive_key_pair;
///
/// let seed = [7u8; 32];
/// assert_eq!(derive_key_pair(Some(seed)), derive_key_pair(Some(seed)));
/// ```
pub fn derive_key_pair(seed: Option<[u8; 32]>) -> KeyPair {
    let seed = seed.unwrap_or_else(rand::random::<[u8; 32]>);
    let signing = SigningKey::from_bytes(&seed);
    KeyPair {
        public_key: signing.verifying_key().to_bytes(),
        secret_key: seed,
    }
}

/// Decode a hex-encoded 32-byte value, naming `what` in the error.
fn decode_key(input: &str, what: &'static str) -> Result<[u8; 32], DoctorError> {
    let bytes = hex::decode(input.trim()).map_err(|err| DoctorError::InvalidKey {
        what,
        reason: err.to_string(),
    })?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| DoctorError::InvalidKey {
            what,
            reason: format!("expected {KEY_LEN} bytes, got {}", bytes.len()),
        })
}

/// Parse the hex seed given to `--server=<seed>`.
pub fn parse_seed(input: &str) -> Result<[u8; 32], DoctorError> {
    decode_key(input, "server seed")
}

/// Parse the hex public key given to `--client=<key>`.
pub fn parse_public_key(input: &str) -> Result<PublicKey, DoctorError> {
    decode_key(input, "public key")
}

/// How the NAT in front of a node maps its port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NatType {
    /// The same external port is used towards every destination.
    Consistent,
    /// The external port changes per destination (or could not be observed).
    Random,
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NatType::Consistent => f.write_str("consistent"),
            NatType::Random => f.write_str("random"),
        }
    }
}

/// A bootstrapped node: its key pair plus what the network observed about it.
///
/// Created once by [`crate::core::Node::bootstrap`] and never mutated.
#[derive(Clone, Debug)]
pub struct NodeIdentity {
    pub key_pair: KeyPair,
    pub host: Option<IpAddr>,
    pub port: Option<u16>,
    pub firewalled: bool,
}

impl NodeIdentity {
    pub fn public_key(&self) -> PublicKey {
        self.key_pair.public_key
    }

    /// NAT classification derived from whether a stable port was observed.
    pub fn nat_type(&self) -> NatType {
        if self.port.is_some() {
            NatType::Consistent
        } else {
            NatType::Random
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_key_pairs_are_deterministic() {
        let seed = [0u8; 32];
        let first = derive_key_pair(Some(seed));
        let second = derive_key_pair(Some(seed));
        assert_eq!(first, second);
        assert_eq!(first.secret_key, seed);
    }

    #[test]
    fn different_seeds_yield_different_public_keys() {
        let a = derive_key_pair(Some([1u8; 32]));
        let b = derive_key_pair(Some([2u8; 32]));
        assert_ne!(a.public_key, b.public_key);
    }

    #[test]
    fn random_key_pairs_differ() {
        let a = derive_key_pair(None);
        let b = derive_key_pair(None);
        assert_ne!(a.secret_key, b.secret_key);
    }

    #[test]
    fn seed_hex_round_trips_through_parse_seed() {
        let pair = derive_key_pair(None);
        let seed = parse_seed(&pair.seed_hex()).expect("valid seed hex");
        assert_eq!(derive_key_pair(Some(seed)), pair);
        assert_eq!(pair.seed_hex().len(), 64);
    }

    #[test]
    fn parse_public_key_rejects_bad_input() {
        assert!(matches!(
            parse_public_key("zz"),
            Err(DoctorError::InvalidKey { .. })
        ));
        let err = parse_public_key("abcd").unwrap_err();
        assert!(err.to_string().contains("expected 32 bytes, got 2"));
    }

    #[test]
    fn debug_output_hides_secret() {
        let pair = derive_key_pair(Some([9u8; 32]));
        let rendered = format!("{pair:?}");
        assert!(!rendered.contains(&pair.seed_hex()));
        assert!(rendered.contains(&pair.public_key_hex()));
    }

    #[test]
    fn nat_type_follows_observed_port() {
        let mut identity = NodeIdentity {
            key_pair: derive_key_pair(Some([3u8; 32])),
            host: Some("203.0.113.7".parse().unwrap()),
            port: Some(49_737),
            firewalled: false,
        };
        assert_eq!(identity.nat_type(), NatType::Consistent);
        identity.port = None;
        assert_eq!(identity.nat_type(), NatType::Random);
        assert_eq!(identity.nat_type().to_string(), "random");
    }
}
