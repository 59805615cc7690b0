use crate::error::{CryptoError, IbftResult};
use crate::types::{Address, Hash, Signature};
use crate::validator::Validator;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

/// Ed25519 key pair identifying one validator
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new Ed25519 key pair
    pub fn generate() -> Self {
        Self { signing_key: SigningKey::generate(&mut OsRng) }
    }

    /// Create a deterministic key pair from a 32-byte seed
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { signing_key: SigningKey::from_bytes(&seed) }
    }

    /// Create from existing secret key bytes
    pub fn from_bytes(secret_bytes: &[u8]) -> Result<Self, CryptoError> {
        let seed: [u8; 32] = secret_bytes.try_into().map_err(|_| CryptoError::InvalidPrivateKey)?;
        Ok(Self::from_seed(seed))
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Address of this key pair
    pub fn address(&self) -> Address {
        address_from_public_key(&self.public_key())
    }

    /// Validator entry for this key pair
    pub fn validator(&self) -> Validator {
        Validator::new(self.public_key())
    }

    /// Sign data
    pub fn sign(&self, data: &[u8]) -> Signature {
        Signature(self.signing_key.sign(data).to_bytes().to_vec())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("address", &self.address()).finish_non_exhaustive()
    }
}

/// Derive an address from a public key: the trailing 20 bytes of its SHA-256 digest
pub fn address_from_public_key(public_key: &VerifyingKey) -> Address {
    let digest = hash(public_key.as_bytes());
    let mut address = [0u8; 20];
    address.copy_from_slice(&digest.0[12..]);
    Address(address)
}

/// Parse a public key from raw bytes
pub fn public_key_from_bytes(bytes: &[u8]) -> Result<VerifyingKey, CryptoError> {
    let array: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
    VerifyingKey::from_bytes(&array).map_err(|_| CryptoError::InvalidPublicKey)
}

/// Verify a signature strictly against `public_key`
pub fn verify(public_key: &VerifyingKey, data: &[u8], signature: &Signature) -> Result<(), CryptoError> {
    let signature = ed25519_dalek::Signature::from_slice(signature.as_bytes())
        .map_err(|_| CryptoError::InvalidSignature)?;
    public_key
        .verify_strict(data, &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}

/// Hash data using SHA-256
pub fn hash(data: &[u8]) -> Hash {
    hash_parts(&[data])
}

/// Hash multiple pieces of data together
pub fn hash_parts(parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    Hash(out)
}

/// Create a deterministic hash from serializable data
pub fn hash_object<T: Serialize>(obj: &T) -> IbftResult<Hash> {
    let serialized = bincode::serialize(obj)?;
    Ok(hash(&serialized))
}
