use crate::types::{Address, Hash};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Liveness attestation: `address` was online while `sequence` was being agreed on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineValidator {
    /// Sequence the attestation belongs to
    pub sequence: u64,

    /// Attesting validator
    pub address: Address,

    /// Block the validator had seen when attesting
    pub block_hash: Hash,

    /// Opaque proof bytes
    pub proof: Vec<u8>,

    /// When the attestation was recorded locally
    pub recorded_at: DateTime<Utc>,
}

impl OnlineValidator {
    pub fn new(sequence: u64, address: Address, block_hash: Hash, proof: Vec<u8>) -> Self {
        Self {
            sequence,
            address,
            block_hash,
            proof,
            recorded_at: Utc::now(),
        }
    }
}

/// Attestations collected for one sequence, in arrival order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineValidatorList {
    validators: Vec<OnlineValidator>,
}

impl OnlineValidatorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, validator: OnlineValidator) {
        self.validators.push(validator);
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OnlineValidator> {
        self.validators.iter()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.validators.iter().any(|v| v.address == *address)
    }
}

/// Decides which tracked sequences the registry may drop
pub trait PruneStrategy: fmt::Debug + Send + Sync {
    /// `horizon` is the first sequence whose attestations are still wanted by default
    fn is_stale(&self, sequence: u64, horizon: u64) -> bool;
}

/// Keep the `depth` sequences just below the horizon, drop everything older
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetainWindow {
    pub depth: u64,
}

impl RetainWindow {
    pub fn new(depth: u64) -> Self {
        Self { depth }
    }
}

impl PruneStrategy for RetainWindow {
    fn is_stale(&self, sequence: u64, horizon: u64) -> bool {
        sequence.saturating_add(self.depth) < horizon
    }
}

/// Map guarded by the registry lock
pub type OnlineProofMap = HashMap<u64, OnlineValidatorList>;

/// Online proofs per sequence.
///
/// Every operation takes one lock over the whole map, so a snapshot never
/// observes a sequence half-inserted or half-removed. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct OnlineProofRegistry {
    proofs: Arc<Mutex<OnlineProofMap>>,
    current_sequence: Arc<AtomicU64>,
}

impl OnlineProofRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence the engine is currently agreeing on
    pub fn current_sequence(&self) -> u64 {
        self.current_sequence.load(Ordering::Acquire)
    }

    pub fn set_current_sequence(&self, sequence: u64) {
        self.current_sequence.store(sequence, Ordering::Release);
    }

    /// Make sure a (possibly empty) list exists for `sequence`
    pub fn register(&self, sequence: u64) {
        self.proofs.lock().entry(sequence).or_default();
    }

    /// Append one attestation, creating the list for its sequence if needed
    pub fn append(&self, validator: OnlineValidator) {
        trace!(sequence = validator.sequence, address = %validator.address, "appending online proof");
        let mut proofs = self.proofs.lock();
        proofs.entry(validator.sequence).or_default().push(validator);
    }

    /// Append an attestation stamped with the current sequence
    pub fn append_current(&self, address: Address, block_hash: Hash, proof: Vec<u8>) -> u64 {
        let sequence = self.current_sequence();
        self.append(OnlineValidator::new(sequence, address, block_hash, proof));
        sequence
    }

    /// Remove the list for `sequence`; missing entries are ignored
    pub fn prune(&self, sequence: u64) -> Option<OnlineValidatorList> {
        let removed = self.proofs.lock().remove(&sequence);
        if removed.is_some() {
            debug!(sequence, "pruned online proofs");
        }
        removed
    }

    /// Remove every sequence `strategy` considers stale relative to `horizon`
    pub fn prune_stale(&self, strategy: &dyn PruneStrategy, horizon: u64) -> Vec<u64> {
        let mut pruned = {
            let mut proofs = self.proofs.lock();
            let stale: Vec<u64> = proofs
                .keys()
                .copied()
                .filter(|sequence| strategy.is_stale(*sequence, horizon))
                .collect();
            for sequence in &stale {
                proofs.remove(sequence);
            }
            stale
        };
        pruned.sort_unstable();
        if !pruned.is_empty() {
            debug!(horizon, ?pruned, "pruned stale online proofs");
        }
        pruned
    }

    /// Copy of the list for one sequence
    pub fn get(&self, sequence: u64) -> Option<OnlineValidatorList> {
        self.proofs.lock().get(&sequence).cloned()
    }

    /// Consistent copy of the whole registry, ordered by sequence
    pub fn snapshot(&self) -> BTreeMap<u64, OnlineValidatorList> {
        let proofs = self.proofs.lock();
        proofs.iter().map(|(sequence, list)| (*sequence, list.clone())).collect()
    }

    /// Number of tracked sequences
    pub fn len(&self) -> usize {
        self.proofs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.proofs.lock().is_empty()
    }

    /// Hold the registry lock to combine a read with a dependent update.
    ///
    /// Keep the guard away from `.await` points and I/O.
    pub fn lock(&self) -> MutexGuard<'_, OnlineProofMap> {
        self.proofs.lock()
    }
}
