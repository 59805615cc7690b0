use crate::crypto::{self, address_from_public_key};
use crate::error::{CryptoError, ValidatorSetError};
use crate::types::{Address, Signature};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// How the proposer rotates between rounds and sequences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposerPolicy {
    /// Move to the next validator after every sequence and every round
    #[default]
    RoundRobin,

    /// Keep the last proposer until a round change
    Sticky,
}

/// Validator identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validator {
    address: Address,
    public_key: VerifyingKey,
}

impl Validator {
    pub fn new(public_key: VerifyingKey) -> Self {
        Self { address: address_from_public_key(&public_key), public_key }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn public_key(&self) -> &VerifyingKey {
        &self.public_key
    }

    /// Verify a signature produced by this validator
    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        crypto::verify(&self.public_key, data, signature)
    }
}

/// Largest fault bound a set of `size` validators tolerates
pub fn max_faulty(size: u64) -> u64 {
    size.saturating_sub(1) / 3
}

/// Smallest Q with `2Q > N + F`.
///
/// Any two quorums then overlap in more than F validators, so at least one
/// honest validator sits in both.
pub fn quorum_size(size: u64, f: u64) -> u64 {
    (size + f) / 2 + 1
}

/// Roster of validators for one sequence, ordered by address.
///
/// Immutable once built; a membership change produces a new set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    f: u64,
}

impl ValidatorSet {
    /// Create a set tolerating the largest fault bound its size allows
    pub fn new(validators: Vec<Validator>) -> Result<Self, ValidatorSetError> {
        let f = max_faulty(validators.len() as u64);
        Self::with_fault_bound(validators, f)
    }

    /// Create a set with an explicit fault bound
    pub fn with_fault_bound(mut validators: Vec<Validator>, f: u64) -> Result<Self, ValidatorSetError> {
        validators.sort_by_key(|v| v.address);
        let set = Self { validators, f };
        set.validate()?;
        Ok(set)
    }

    /// Check the set is non-empty, duplicate-free and satisfies `N >= 3F + 1`
    pub fn validate(&self) -> Result<(), ValidatorSetError> {
        if self.validators.is_empty() {
            return Err(ValidatorSetError::Empty);
        }

        let mut seen = HashSet::with_capacity(self.validators.len());
        for validator in &self.validators {
            if !seen.insert(validator.address) {
                return Err(ValidatorSetError::DuplicateValidator(validator.address));
            }
        }

        let required = 3 * self.f + 1;
        if self.size() < required {
            return Err(ValidatorSetError::InsufficientValidators {
                size: self.size(),
                f: self.f,
                required,
            });
        }
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.validators.len() as u64
    }

    /// Tolerated faults
    pub fn f(&self) -> u64 {
        self.f
    }

    pub fn quorum_size(&self) -> u64 {
        quorum_size(self.size(), self.f)
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn get_by_index(&self, index: usize) -> Option<&Validator> {
        self.validators.get(index)
    }

    /// Look up a validator and its position
    pub fn get_by_address(&self, address: &Address) -> Option<(usize, &Validator)> {
        self.validators
            .binary_search_by_key(address, |v| v.address)
            .ok()
            .map(|index| (index, &self.validators[index]))
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.get_by_address(address).is_some()
    }

    /// Proposer for `round`, given who proposed the last finalized proposal
    pub fn calc_proposer(&self, last_proposer: Option<&Address>, round: u64, policy: ProposerPolicy) -> &Validator {
        let offset = last_proposer
            .and_then(|address| self.get_by_address(address))
            .map(|(index, _)| index as u64);

        let seed = match (offset, policy) {
            (None, _) => round,
            (Some(offset), ProposerPolicy::RoundRobin) => offset + round + 1,
            (Some(offset), ProposerPolicy::Sticky) => offset + round,
        };
        let index = (seed % self.size()) as usize;
        &self.validators[index]
    }
}
