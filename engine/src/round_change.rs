use crate::certificate::PreparedCertificate;
use crate::message::{Message, Payload};
use crate::round_state::MessageSet;
use ibft_common::{Address, ConsensusError, ValidatorSet, View};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Round-change messages of one sequence, grouped by target round.
///
/// Only the highest round change of each validator is kept.
#[derive(Debug, Clone)]
pub struct RoundChangeSet {
    validators: Arc<ValidatorSet>,
    rounds: BTreeMap<u64, MessageSet>,
    latest: HashMap<Address, u64>,
}

impl RoundChangeSet {
    pub fn new(validators: Arc<ValidatorSet>) -> Self {
        Self { validators, rounds: BTreeMap::new(), latest: HashMap::new() }
    }

    /// Record a round change and return how many distinct validators asked for `round`
    pub fn add(&mut self, round: u64, message: Message) -> Result<usize, ConsensusError> {
        let from = message.address;
        let previous = self.latest.get(&from).copied();
        if previous.map_or(false, |r| r > round) {
            return Ok(self.count(round));
        }

        let view = View::new(message.view().sequence, round);
        let set = self
            .rounds
            .entry(round)
            .or_insert_with(|| MessageSet::new(view, self.validators.clone()));
        if let Err(e) = set.add(message) {
            if set.is_empty() {
                self.rounds.remove(&round);
            }
            return Err(e);
        }

        if let Some(old) = previous.filter(|r| *r < round) {
            if let Some(set) = self.rounds.get_mut(&old) {
                set.remove(&from);
                if set.is_empty() {
                    self.rounds.remove(&old);
                }
            }
        }
        self.latest.insert(from, round);
        Ok(self.count(round))
    }

    /// Number of rounds holding at least one round change
    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn count(&self, round: u64) -> usize {
        self.rounds.get(&round).map(|s| s.len()).unwrap_or(0)
    }

    /// Forget rounds below `round` and empty rounds
    pub fn clear(&mut self, round: u64) {
        self.rounds.retain(|r, set| *r >= round && !set.is_empty());
        self.latest.retain(|_, r| *r >= round);
    }

    /// Highest round asked for by at least `threshold` validators
    pub fn max_round(&self, threshold: usize) -> Option<u64> {
        self.rounds
            .iter()
            .rev()
            .find(|(_, set)| set.len() >= threshold)
            .map(|(round, _)| *round)
    }

    /// Most recent prepared certificate carried by the round changes for `round`
    pub fn highest_certificate(&self, round: u64) -> Option<&PreparedCertificate> {
        self.rounds
            .get(&round)?
            .values()
            .filter_map(|m| match &m.payload {
                Payload::RoundChange(rc) => rc.prepared.as_ref(),
                _ => None,
            })
            .max_by_key(|c| c.view.round)
    }
}
