use crate::message::{committed_seal_bytes, Message, Payload, Subject};
use ibft_common::{Address, ConsensusError, Hash, Proposal, Signature, ValidatorSet, View};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Proof that a quorum prepared `proposal` at `view`
#[derive(Debug, Clone)]
pub struct PreparedCertificate {
    pub proposal: Arc<dyn Proposal>,
    pub view: View,
    pub prepares: Vec<Message>,
}

/// One validator's committed seal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedSeal {
    pub validator: Address,
    pub signature: Signature,
}

/// Quorum of committed seals finalizing a proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedCertificate {
    pub view: View,
    pub digest: Hash,
    pub seals: Vec<CommittedSeal>,
}

impl PreparedCertificate {
    pub fn subject(&self) -> Subject {
        Subject { view: self.view, digest: self.proposal.hash() }
    }

    /// Whether enough prepares are attached to convince another replica
    pub fn has_quorum(&self, validators: &ValidatorSet) -> bool {
        self.prepares.len() as u64 >= validators.quorum_size()
    }

    /// Check the certificate holds a quorum of distinct, signed prepares for its proposal
    pub fn verify(&self, validators: &ValidatorSet) -> Result<(), ConsensusError> {
        if self.proposal.number() != self.view.sequence {
            return Err(ConsensusError::InvalidPreparedCertificate(format!(
                "proposal {} certified for sequence {}",
                self.proposal.number(),
                self.view.sequence
            )));
        }

        let expected = self.subject();
        let mut signers = HashSet::new();
        for prepare in &self.prepares {
            match &prepare.payload {
                Payload::Prepare(subject) if *subject == expected => {}
                _ => {
                    return Err(ConsensusError::InvalidPreparedCertificate(
                        "certificate contains a foreign message".to_string(),
                    ))
                }
            }
            prepare
                .verify(validators)
                .map_err(|e| ConsensusError::InvalidPreparedCertificate(e.to_string()))?;
            signers.insert(prepare.address);
        }

        let needed = validators.quorum_size() as usize;
        if signers.len() < needed {
            return Err(ConsensusError::InsufficientVotes { got: signers.len(), needed });
        }
        Ok(())
    }
}

impl CommittedCertificate {
    /// Check a quorum of distinct validators sealed `digest` at `view`
    pub fn verify(&self, validators: &ValidatorSet) -> Result<(), ConsensusError> {
        if self.digest.is_zero() {
            return Err(ConsensusError::EmptyProposal);
        }

        let data = committed_seal_bytes(self.view, &self.digest);
        let mut signers = HashSet::new();
        for seal in &self.seals {
            let (_, validator) = validators
                .get_by_address(&seal.validator)
                .ok_or(ConsensusError::UnauthorizedAddress(seal.validator))?;
            validator
                .verify(&data, &seal.signature)
                .map_err(|_| ConsensusError::InvalidCommittedSeal)?;
            signers.insert(seal.validator);
        }

        let needed = validators.quorum_size() as usize;
        if signers.len() < needed {
            return Err(ConsensusError::InsufficientVotes { got: signers.len(), needed });
        }
        Ok(())
    }

    pub fn signers(&self) -> impl Iterator<Item = &Address> {
        self.seals.iter().map(|s| &s.validator)
    }
}
