use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::fmt;

/// 20-byte validator identity derived from its public key
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Address(pub [u8; 20]);

/// 32-byte digest
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

/// Raw ed25519 signature bytes
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

/// A protocol instance: the sequence being agreed on and the attempt within it.
///
/// Ordering is lexicographic, sequence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct View {
    pub sequence: u64,
    pub round: u64,
}

/// A value the validators agree on.
pub trait Proposal: fmt::Debug + Send + Sync {
    /// Ordinal of the proposal; equals the sequence it is proposed for
    fn number(&self) -> u64;

    /// Stable identity of the proposal
    fn hash(&self) -> Hash;
}

/// Block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub parent_hash: Hash,
    pub payload_hash: Hash,
    pub timestamp: DateTime<Utc>,
}

/// Minimal block used as the default proposal type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub payload: Vec<u8>,
    hash: Hash,
}

impl Address {
    pub const fn zero() -> Self {
        Address([0u8; 20])
    }

    /// Build an address from a 20-byte slice
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; 20] = bytes.try_into().ok()?;
        Some(Address(array))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Hash {
    pub const fn zero() -> Self {
        Hash([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Signature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl View {
    pub const fn new(sequence: u64, round: u64) -> Self {
        Self { sequence, round }
    }
}

impl Block {
    /// Create new block on top of `parent_hash`
    pub fn new(number: u64, parent_hash: Hash, payload: Vec<u8>) -> Self {
        let header = BlockHeader {
            number,
            parent_hash,
            payload_hash: crate::crypto::hash(&payload),
            timestamp: Utc::now(),
        };
        let hash = header.seal_hash();
        Self { header, payload, hash }
    }
}

impl BlockHeader {
    fn seal_hash(&self) -> Hash {
        crate::crypto::hash_parts(&[
            &self.number.to_be_bytes(),
            self.parent_hash.as_bytes(),
            self.payload_hash.as_bytes(),
            &self.timestamp.timestamp_millis().to_be_bytes(),
        ])
    }
}

impl Proposal for Block {
    fn number(&self) -> u64 {
        self.header.number
    }

    fn hash(&self) -> Hash {
        self.hash
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // first four bytes are enough to tell digests apart in logs
        write!(f, "Hash(0x{}..)", hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = &self.0[..self.0.len().min(4)];
        write!(f, "Signature(0x{}.., {} bytes)", hex::encode(prefix), self.0.len())
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(sequence={}, round={})", self.sequence, self.round)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block(number={}, hash={}, payload={} bytes)",
            self.header.number, self.hash, self.payload.len()
        )
    }
}
