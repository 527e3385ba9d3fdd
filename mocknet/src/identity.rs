//! Identities and listen addresses for virtual peers.
//!
//! A [PeerId] is the ed25519 verification key derived from a [PrivateKey]. The simulation never
//! signs anything with these keys: they only exist so that every virtual peer carries the same kind
//! of identity it would on a real network.

use ed25519_consensus::SigningKey;
use rand::{rngs::StdRng, CryptoRng, RngCore, SeedableRng};
use std::{
    fmt::{Debug, Display},
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

const PRIVATE_KEY_LENGTH: usize = 32;
const PUBLIC_KEY_LENGTH: usize = 32;

/// First port assigned by [Deterministic].
const BASE_PORT: u16 = 10_000;

/// Ed25519 Private Key.
#[derive(Clone)]
pub struct PrivateKey {
    raw: [u8; PRIVATE_KEY_LENGTH],
    key: SigningKey,
}

impl PrivateKey {
    /// Generate a new private key from the provided randomness.
    pub fn new<R: CryptoRng + RngCore>(rng: &mut R) -> Self {
        Self::from(SigningKey::new(rng))
    }

    /// Derive a private key from a seed.
    ///
    /// This is insecure and should only be used to produce stable identities in tests.
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self::new(&mut rng)
    }

    /// Return the [PeerId] derived from this key.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from(self.key.verification_key().to_bytes())
    }
}

impl From<SigningKey> for PrivateKey {
    fn from(key: SigningKey) -> Self {
        let raw = key.to_bytes();
        Self { raw, key }
    }
}

impl From<[u8; PRIVATE_KEY_LENGTH]> for PrivateKey {
    fn from(raw: [u8; PRIVATE_KEY_LENGTH]) -> Self {
        Self::from(SigningKey::from(raw))
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for PrivateKey {}

// Private keys are never printed in full.
impl Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey({})", self.peer_id())
    }
}

/// Globally unique identifier of a virtual peer.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerId {
    raw: [u8; PUBLIC_KEY_LENGTH],
}

impl PeerId {
    /// Return the raw bytes of the identifier.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.raw
    }
}

impl From<[u8; PUBLIC_KEY_LENGTH]> for PeerId {
    fn from(raw: [u8; PUBLIC_KEY_LENGTH]) -> Self {
        Self { raw }
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.raw
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.raw))
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.raw))
    }
}

/// Source of fresh identities and listen addresses for new peers.
pub trait Provider: Send + 'static {
    /// Generate a new identity and the address it should listen on.
    fn generate(&mut self) -> (PrivateKey, SocketAddr);
}

/// [Provider] that derives keys from a seeded RNG and assigns sequential loopback ports.
///
/// Two providers created with the same seed yield the same sequence of identities.
pub struct Deterministic {
    rng: StdRng,
    next_port: u16,
}

impl Deterministic {
    /// Create a new provider from a seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            next_port: BASE_PORT,
        }
    }
}

impl Provider for Deterministic {
    fn generate(&mut self) -> (PrivateKey, SocketAddr) {
        let key = PrivateKey::new(&mut self.rng);
        let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.next_port);
        self.next_port = self.next_port.wrapping_add(1).max(BASE_PORT);
        (key, address)
    }
}
