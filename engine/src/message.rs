use crate::certificate::PreparedCertificate;
use ibft_common::{Address, ConsensusError, Hash, IbftResult, Proposal, Signature, Validator, ValidatorSet, View};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Message kinds, in protocol order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MessageCode {
    Preprepare = 0,
    Prepare = 1,
    Commit = 2,
    RoundChange = 3,
}

/// What a prepare or commit vote refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject {
    pub view: View,
    pub digest: Hash,
}

/// Proposal announcement from the round's proposer
#[derive(Debug, Clone)]
pub struct Preprepare {
    pub view: View,
    pub proposal: Option<Arc<dyn Proposal>>,
}

/// Request to move to `view.round`, carrying the sender's prepared certificate if it has one
#[derive(Debug, Clone)]
pub struct RoundChange {
    pub view: View,
    pub prepared: Option<PreparedCertificate>,
}

#[derive(Debug, Clone)]
pub enum Payload {
    Preprepare(Preprepare),
    Prepare(Subject),
    Commit(Subject),
    RoundChange(RoundChange),
}

/// Signed protocol message
#[derive(Debug, Clone)]
pub struct Message {
    pub payload: Payload,
    pub address: Address,
    pub signature: Option<Signature>,
    /// Only set on commits
    pub committed_seal: Option<Signature>,
}

/// Fields covered by the sender signature
#[derive(Serialize)]
struct SignedFields<'a> {
    code: MessageCode,
    view: View,
    digest: Hash,
    address: Address,
    prepared: Option<(View, Hash)>,
    committed_seal: Option<&'a [u8]>,
}

impl Preprepare {
    /// Hash of the proposal, zero when there is none
    pub fn digest(&self) -> Hash {
        self.proposal.as_ref().map(|p| p.hash()).unwrap_or_default()
    }
}

impl Payload {
    pub fn code(&self) -> MessageCode {
        match self {
            Payload::Preprepare(_) => MessageCode::Preprepare,
            Payload::Prepare(_) => MessageCode::Prepare,
            Payload::Commit(_) => MessageCode::Commit,
            Payload::RoundChange(_) => MessageCode::RoundChange,
        }
    }

    pub fn view(&self) -> View {
        match self {
            Payload::Preprepare(p) => p.view,
            Payload::Prepare(s) | Payload::Commit(s) => s.view,
            Payload::RoundChange(r) => r.view,
        }
    }

    fn digest(&self) -> Hash {
        match self {
            Payload::Preprepare(p) => p.digest(),
            Payload::Prepare(s) | Payload::Commit(s) => s.digest,
            Payload::RoundChange(_) => Hash::zero(),
        }
    }
}

impl Message {
    /// Unsigned message from nobody; `sign_with` fills in the sender
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            address: Address::zero(),
            signature: None,
            committed_seal: None,
        }
    }

    pub fn code(&self) -> MessageCode {
        self.payload.code()
    }

    pub fn view(&self) -> View {
        self.payload.view()
    }

    /// Subject of a prepare or commit
    pub fn subject(&self) -> Option<&Subject> {
        match &self.payload {
            Payload::Prepare(s) | Payload::Commit(s) => Some(s),
            _ => None,
        }
    }

    /// Canonical bytes covered by the sender signature
    pub fn signing_bytes(&self) -> IbftResult<Vec<u8>> {
        let prepared = match &self.payload {
            Payload::RoundChange(rc) => rc.prepared.as_ref().map(|c| (c.view, c.proposal.hash())),
            _ => None,
        };
        let fields = SignedFields {
            code: self.code(),
            view: self.view(),
            digest: self.payload.digest(),
            address: self.address,
            prepared,
            committed_seal: self.committed_seal.as_ref().map(|s| s.as_bytes()),
        };
        Ok(bincode::serialize(&fields)?)
    }

    /// Set the sender and sign the message with `signer`
    pub fn sign_with<F>(&mut self, address: Address, signer: F) -> IbftResult<()>
    where
        F: FnOnce(&[u8]) -> IbftResult<Signature>,
    {
        self.address = address;
        self.signature = None;
        let data = self.signing_bytes()?;
        self.signature = Some(signer(&data)?);
        Ok(())
    }

    /// Check the sender belongs to `validators` and signed this message
    pub fn verify<'a>(&self, validators: &'a ValidatorSet) -> Result<&'a Validator, ConsensusError> {
        let (_, validator) = validators
            .get_by_address(&self.address)
            .ok_or(ConsensusError::UnauthorizedAddress(self.address))?;
        let signature = self.signature.as_ref().ok_or(ConsensusError::InvalidSignature)?;
        let data = self
            .signing_bytes()
            .map_err(|e| ConsensusError::InvalidMessage(e.to_string()))?;
        validator
            .verify(&data, signature)
            .map_err(|_| ConsensusError::InvalidSignature)?;
        Ok(validator)
    }
}

/// Bytes a validator signs to vouch that `digest` was committed at `view`
pub fn committed_seal_bytes(view: View, digest: &Hash) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(32 + 8 + 8 + 1);
    bytes.extend_from_slice(digest.as_bytes());
    bytes.extend_from_slice(&view.sequence.to_be_bytes());
    bytes.extend_from_slice(&view.round.to_be_bytes());
    bytes.push(MessageCode::Commit as u8);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use ibft_common::{Block, KeyPair};

    fn validators(keys: &[KeyPair]) -> ValidatorSet {
        ValidatorSet::new(keys.iter().map(|k| k.validator()).collect()).unwrap()
    }

    fn prepare(view: View, digest: Hash) -> Message {
        Message::new(Payload::Prepare(Subject { view, digest }))
    }

    #[test]
    fn test_signed_message_verifies() {
        let keys: Vec<KeyPair> = (1..=4).map(|i| KeyPair::from_seed([i; 32])).collect();
        let set = validators(&keys);

        let mut message = prepare(View::new(1, 0), Hash([3; 32]));
        message.sign_with(keys[0].address(), |d| Ok(keys[0].sign(d))).unwrap();
        assert_eq!(message.verify(&set).unwrap().address(), keys[0].address());
    }

    #[test]
    fn test_tampered_message_fails_verification() {
        let keys: Vec<KeyPair> = (1..=4).map(|i| KeyPair::from_seed([i; 32])).collect();
        let set = validators(&keys);

        let mut message = prepare(View::new(1, 0), Hash([3; 32]));
        message.sign_with(keys[0].address(), |d| Ok(keys[0].sign(d))).unwrap();
        message.payload = Payload::Prepare(Subject { view: View::new(1, 1), digest: Hash([3; 32]) });
        assert_eq!(message.verify(&set).unwrap_err(), ConsensusError::InvalidSignature);

        // signed by one validator, claimed by another
        let mut forged = prepare(View::new(1, 0), Hash([3; 32]));
        forged.sign_with(keys[1].address(), |d| Ok(keys[0].sign(d))).unwrap();
        assert_eq!(forged.verify(&set).unwrap_err(), ConsensusError::InvalidSignature);

        let unsigned = prepare(View::new(1, 0), Hash([3; 32]));
        assert!(matches!(unsigned.verify(&set), Err(ConsensusError::UnauthorizedAddress(_))));
    }

    #[test]
    fn test_outsider_is_rejected() {
        let keys: Vec<KeyPair> = (1..=4).map(|i| KeyPair::from_seed([i; 32])).collect();
        let outsider = KeyPair::from_seed([99; 32]);

        let mut message = prepare(View::new(1, 0), Hash([3; 32]));
        message.sign_with(outsider.address(), |d| Ok(outsider.sign(d))).unwrap();
        assert_eq!(
            message.verify(&validators(&keys)).unwrap_err(),
            ConsensusError::UnauthorizedAddress(outsider.address())
        );
    }

    #[test]
    fn test_preprepare_digest() {
        let block: Arc<dyn Proposal> = Arc::new(Block::new(1, Hash::zero(), vec![1]));
        let preprepare = Preprepare { view: View::new(1, 0), proposal: Some(block.clone()) };
        assert_eq!(preprepare.digest(), block.hash());
        assert!(Preprepare { view: View::new(1, 0), proposal: None }.digest().is_zero());
    }

    #[test]
    fn test_committed_seal_bytes_bind_view() {
        let digest = Hash([1; 32]);
        assert_ne!(
            committed_seal_bytes(View::new(1, 0), &digest),
            committed_seal_bytes(View::new(1, 1), &digest)
        );
    }
}
