use crate::certificate::{CommittedCertificate, CommittedSeal, PreparedCertificate};
use crate::message::{Message, Preprepare, Subject};
use ibft_common::{Address, ConsensusError, Hash, Proposal, ValidatorSet, View};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Votes for one view, at most one per validator
#[derive(Debug, Clone)]
pub struct MessageSet {
    view: View,
    validators: Arc<ValidatorSet>,
    messages: BTreeMap<Address, Message>,
}

impl MessageSet {
    pub fn new(view: View, validators: Arc<ValidatorSet>) -> Self {
        Self { view, validators, messages: BTreeMap::new() }
    }

    pub fn view(&self) -> View {
        self.view
    }

    /// Add a vote; returns false when the sender already voted
    pub fn add(&mut self, message: Message) -> Result<bool, ConsensusError> {
        let actual = message.view();
        if actual != self.view {
            return Err(ConsensusError::ViewMismatch { expected: self.view, actual });
        }
        if !self.validators.contains(&message.address) {
            return Err(ConsensusError::UnauthorizedAddress(message.address));
        }
        if self.messages.contains_key(&message.address) {
            return Ok(false);
        }
        self.messages.insert(message.address, message);
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, address: &Address) -> Option<&Message> {
        self.messages.get(address)
    }

    pub fn remove(&mut self, address: &Address) -> Option<Message> {
        self.messages.remove(address)
    }

    pub fn values(&self) -> impl Iterator<Item = &Message> {
        self.messages.values()
    }
}

/// Progress of a single round
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RoundPhase {
    Idle,
    PreprepareReceived,
    Prepared,
    Committed,
}

/// Scratch state for the engine's current view
#[derive(Debug, Clone)]
pub struct RoundState {
    view: View,
    validators: Arc<ValidatorSet>,
    preprepare: Option<Preprepare>,
    prepares: MessageSet,
    commits: MessageSet,
    /// Survives round changes within a sequence
    locked: Option<PreparedCertificate>,
    pending_request: Option<Arc<dyn Proposal>>,
}

impl RoundState {
    pub fn new(
        view: View,
        validators: Arc<ValidatorSet>,
        locked: Option<PreparedCertificate>,
        pending_request: Option<Arc<dyn Proposal>>,
    ) -> Self {
        Self {
            view,
            prepares: MessageSet::new(view, validators.clone()),
            commits: MessageSet::new(view, validators.clone()),
            validators,
            preprepare: None,
            locked,
            pending_request,
        }
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn sequence(&self) -> u64 {
        self.view.sequence
    }

    pub fn round(&self) -> u64 {
        self.view.round
    }

    pub fn validators(&self) -> &Arc<ValidatorSet> {
        &self.validators
    }

    /// Install the round's preprepare; a round accepts exactly one
    pub fn set_preprepare(&mut self, preprepare: Preprepare) -> Result<(), ConsensusError> {
        if preprepare.view != self.view {
            return Err(ConsensusError::ViewMismatch { expected: self.view, actual: preprepare.view });
        }
        if self.preprepare.is_some() {
            return Err(ConsensusError::DuplicatePreprepare(self.view));
        }
        self.preprepare = Some(preprepare);
        Ok(())
    }

    pub fn preprepare(&self) -> Option<&Preprepare> {
        self.preprepare.as_ref()
    }

    /// Proposal of the accepted preprepare, if it carried one
    pub fn proposal(&self) -> Option<&Arc<dyn Proposal>> {
        self.preprepare.as_ref().and_then(|p| p.proposal.as_ref())
    }

    /// What prepares and commits for this round must reference
    pub fn subject(&self) -> Subject {
        Subject {
            view: self.view,
            digest: self.proposal().map(|p| p.hash()).unwrap_or_default(),
        }
    }

    pub fn add_prepare(&mut self, message: Message) -> Result<bool, ConsensusError> {
        self.prepares.add(message)
    }

    pub fn add_commit(&mut self, message: Message) -> Result<bool, ConsensusError> {
        self.commits.add(message)
    }

    pub fn prepares(&self) -> &MessageSet {
        &self.prepares
    }

    pub fn commits(&self) -> &MessageSet {
        &self.commits
    }

    pub fn has_quorum_prepares(&self) -> bool {
        self.prepares.len() as u64 >= self.validators.quorum_size()
    }

    pub fn has_quorum_commits(&self) -> bool {
        self.commits.len() as u64 >= self.validators.quorum_size()
    }

    /// Distinct validators that prepared or committed; a commit implies the sender prepared
    pub fn prepare_or_commit_size(&self) -> usize {
        let prepared = self.prepares.len();
        let commit_only = self
            .commits
            .values()
            .filter(|m| self.prepares.get(&m.address).is_none())
            .count();
        prepared + commit_only
    }

    pub fn has_quorum_prepare_or_commit(&self) -> bool {
        self.prepare_or_commit_size() as u64 >= self.validators.quorum_size()
    }

    /// Lock the current proposal with the prepares gathered this round.
    ///
    /// A full certificate always replaces the lock; a partial one only fills an empty lock.
    pub fn lock_proposal(&mut self) -> bool {
        let Some(proposal) = self.proposal().cloned() else {
            return false;
        };
        let certificate = PreparedCertificate {
            proposal,
            view: self.view,
            prepares: self.prepares.values().cloned().collect(),
        };
        if self.locked.is_none() || certificate.has_quorum(&self.validators) {
            self.locked = Some(certificate);
            return true;
        }
        false
    }

    pub fn unlock(&mut self) {
        self.locked = None;
    }

    pub fn locked(&self) -> Option<&PreparedCertificate> {
        self.locked.as_ref()
    }

    pub fn locked_hash(&self) -> Option<Hash> {
        self.locked.as_ref().map(|c| c.proposal.hash())
    }

    pub fn is_hash_locked(&self) -> bool {
        self.locked.is_some()
    }

    /// Take over a certificate prepared in a later round than the current lock
    pub fn adopt(&mut self, certificate: PreparedCertificate) -> bool {
        if certificate.view.sequence != self.view.sequence {
            return false;
        }
        let newer = match &self.locked {
            None => true,
            Some(current) => certificate.view.round > current.view.round,
        };
        if newer {
            self.locked = Some(certificate);
        }
        newer
    }

    pub fn pending_request(&self) -> Option<&Arc<dyn Proposal>> {
        self.pending_request.as_ref()
    }

    pub fn set_pending_request(&mut self, request: Arc<dyn Proposal>) {
        self.pending_request = Some(request);
    }

    pub fn phase(&self) -> RoundPhase {
        if self.preprepare.is_none() {
            RoundPhase::Idle
        } else if self.has_quorum_commits() {
            RoundPhase::Committed
        } else if self.has_quorum_prepares() {
            RoundPhase::Prepared
        } else {
            RoundPhase::PreprepareReceived
        }
    }

    /// Seals of the commits gathered for the current proposal.
    ///
    /// Returns `None` without a proposal or without a quorum, so nothing is ever
    /// certified for an empty round.
    pub fn committed_certificate(&self) -> Option<CommittedCertificate> {
        let proposal = self.proposal()?;
        if !self.has_quorum_commits() {
            return None;
        }
        let digest = proposal.hash();
        let seals = self
            .commits
            .values()
            .filter(|m| m.subject().map(|s| s.digest) == Some(digest))
            .filter_map(|m| {
                m.committed_seal.clone().map(|signature| CommittedSeal {
                    validator: m.address,
                    signature,
                })
            })
            .collect::<Vec<_>>();
        if (seals.len() as u64) < self.validators.quorum_size() {
            return None;
        }
        Some(CommittedCertificate { view: self.view, digest, seals })
    }
}
