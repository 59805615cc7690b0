use crate::backend::Backend;
use crate::backlog::Backlog;
use crate::certificate::CommittedCertificate;
use crate::config::{EngineConfig, PruneTrigger};
use crate::message::{committed_seal_bytes, Message, MessageCode, Payload, Preprepare, RoundChange};
use crate::metrics::ConsensusMetrics;
use crate::round_change::RoundChangeSet;
use crate::round_state::RoundState;
use ibft_common::{Address, ConsensusError, IbftResult, OnlineProofRegistry, Proposal, ValidatorSet, View};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Engine state within the current view
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum State {
    /// Waiting for the proposer's preprepare
    #[default]
    AcceptRequest,
    Preprepared,
    Prepared,
    Committed,
    /// Waiting for a quorum of round changes
    RoundChange,
}

impl State {
    /// Position in the normal case; waiting for a round change counts as no progress
    fn progress(self) -> u8 {
        match self {
            State::AcceptRequest | State::RoundChange => 0,
            State::Preprepared => 1,
            State::Prepared => 2,
            State::Committed => 3,
        }
    }
}

/// Proposal finalized by this replica
#[derive(Debug, Clone)]
pub struct FinalizedProposal {
    pub proposal: Arc<dyn Proposal>,
    pub certificate: CommittedCertificate,
    pub proposer: Option<Address>,
}

/// Snapshot of the engine, published after every transition
#[derive(Debug, Clone, Default)]
pub struct EngineStatus {
    pub view: View,
    pub state: State,
    pub proposer: Option<Address>,
    pub quorum_size: u64,
    pub validator_count: u64,
    pub last_committed: Option<FinalizedProposal>,
}

/// Input of the consensus task
pub(crate) enum CoreEvent {
    Request(Arc<dyn Proposal>),
    Message(Message),
    Timeout { generation: u64 },
    FinalCommitted,
}

/// Deadline of the current round, delivered through the event queue
#[derive(Debug, Default)]
struct RoundChangeTimer {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl RoundChangeTimer {
    fn reset(&mut self, after: Duration, events: mpsc::UnboundedSender<CoreEvent>) {
        self.stop();
        let generation = self.generation;
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(CoreEvent::Timeout { generation });
        }));
    }

    /// Cancel the deadline; a timeout already queued becomes stale
    fn stop(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }
}

/// Classify a message view against the local view and state
pub(crate) fn check_message_view(state: State, current: View, code: MessageCode, view: View) -> Result<(), ConsensusError> {
    if code == MessageCode::RoundChange {
        if view.sequence > current.sequence {
            return Err(ConsensusError::FutureMessage);
        }
        if view < current {
            return Err(ConsensusError::OldMessage);
        }
        return Ok(());
    }

    if view > current {
        return Err(ConsensusError::FutureMessage);
    }
    if view < current {
        return Err(ConsensusError::OldMessage);
    }
    if state == State::RoundChange {
        return Err(ConsensusError::FutureMessage);
    }
    if state == State::AcceptRequest && code > MessageCode::Preprepare {
        return Err(ConsensusError::FutureMessage);
    }
    Ok(())
}

/// Agreement state machine of one replica.
///
/// Owned by a single task; all input arrives through `CoreEvent`s.
pub(crate) struct Core {
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) address: Address,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) state: State,
    pub(crate) current: RoundState,
    pub(crate) validators: Arc<ValidatorSet>,
    pub(crate) proposer: Option<Address>,
    pub(crate) round_change_set: RoundChangeSet,
    /// Requests for sequences not reached yet
    pub(crate) pending_requests: BTreeMap<u64, Arc<dyn Proposal>>,
    pub(crate) backlog: Backlog,
    pub(crate) metrics: Arc<ConsensusMetrics>,
    proposed: Option<View>,
    timer: RoundChangeTimer,
    proposal_fetch: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<CoreEvent>,
    registry: OnlineProofRegistry,
    status: Arc<RwLock<EngineStatus>>,
    last_committed: Option<FinalizedProposal>,
}

impl Core {
    pub(crate) fn new(
        config: Arc<EngineConfig>,
        backend: Arc<dyn Backend>,
        validators: ValidatorSet,
        registry: OnlineProofRegistry,
        status: Arc<RwLock<EngineStatus>>,
        metrics: Arc<ConsensusMetrics>,
        events: mpsc::UnboundedSender<CoreEvent>,
    ) -> Self {
        let validators = Arc::new(validators);
        let last_committed = status.read().last_committed.clone();
        Self {
            address: backend.address(),
            state: State::AcceptRequest,
            current: RoundState::new(View::default(), validators.clone(), None, None),
            round_change_set: RoundChangeSet::new(validators.clone()),
            backlog: Backlog::new(config.backlog_capacity),
            pending_requests: BTreeMap::new(),
            proposer: None,
            proposed: None,
            timer: RoundChangeTimer::default(),
            proposal_fetch: None,
            validators,
            config,
            backend,
            events,
            registry,
            status,
            metrics,
            last_committed,
        }
    }

    /// Drive the state machine until shutdown is signalled
    pub(crate) async fn run(mut self, mut events: mpsc::UnboundedReceiver<CoreEvent>, mut shutdown: watch::Receiver<bool>) {
        info!(address = %self.address, "Consensus task started");
        self.start_new_round(0);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }

        self.shutdown();
    }

    pub(crate) fn handle_event(&mut self, event: CoreEvent) {
        match event {
            CoreEvent::Request(request) => self.handle_request(request),
            CoreEvent::Message(message) => self.handle_message(message),
            CoreEvent::Timeout { generation } => self.handle_timeout(generation),
            CoreEvent::FinalCommitted => self.handle_final_committed(),
        }
    }

    fn shutdown(&mut self) {
        self.timer.stop();
        if let Some(fetch) = self.proposal_fetch.take() {
            fetch.abort();
        }
        info!(address = %self.address, view = %self.current.view(), "Consensus task stopped");
    }

    pub(crate) fn is_proposer(&self) -> bool {
        self.proposer == Some(self.address)
    }

    /// True while the round has not yet reached `state`
    pub(crate) fn state_before(&self, state: State) -> bool {
        self.state.progress() < state.progress()
    }

    pub(crate) fn check_message(&self, code: MessageCode, view: View) -> Result<(), ConsensusError> {
        check_message_view(self.state, self.current.view(), code, view)
    }

    /// Highest finalized sequence known locally or to the backend, with its proposer
    fn last_finalized(&self) -> (u64, Option<Address>) {
        let (proposal, proposer) = self.backend.last_proposal();
        let backend_number = proposal.map(|p| p.number()).unwrap_or(0);
        match &self.last_committed {
            Some(own) if own.proposal.number() >= backend_number => {
                (own.proposal.number(), own.proposer.or(proposer))
            }
            _ => (backend_number, proposer),
        }
    }

    /// Enter `round` of the current sequence, or round 0 of the next one once
    /// the current sequence is finalized.
    pub(crate) fn start_new_round(&mut self, round: u64) {
        let (last_number, last_proposer) = self.last_finalized();
        let current = self.current.view();

        let (view, round_change) = if last_number >= current.sequence {
            if last_number > current.sequence {
                debug!(from = current.sequence, to = last_number + 1, "Catching up to finalized sequence");
            }
            (View::new(last_number + 1, 0), false)
        } else if last_number + 1 == current.sequence {
            if round == 0 {
                return;
            }
            if round < current.round {
                warn!(round, current = current.round, "New round should not be smaller than current round");
                return;
            }
            (View::new(current.sequence, round), true)
        } else {
            warn!(
                last = last_number,
                current = current.sequence,
                "Finalized sequence is behind the current sequence"
            );
            return;
        };

        if !round_change {
            match self.backend.validators(view.sequence).and_then(|set| {
                set.validate()?;
                Ok(set)
            }) {
                Ok(set) => self.validators = Arc::new(set),
                Err(e) => error!(error = %e, sequence = view.sequence, "Keeping previous validator set"),
            }
            self.round_change_set = RoundChangeSet::new(self.validators.clone());
            self.registry.set_current_sequence(view.sequence);
            self.registry.register(view.sequence);
        } else {
            self.round_change_set.clear(view.round);
        }

        self.update_round_state(view, round_change);
        self.proposer = Some(
            self.validators
                .calc_proposer(last_proposer.as_ref(), view.round, self.config.proposer_policy)
                .address(),
        );
        if let Some(fetch) = self.proposal_fetch.take() {
            fetch.abort();
        }

        info!(
            sequence = view.sequence,
            round = view.round,
            proposer = ?self.proposer,
            is_proposer = self.is_proposer(),
            "Starting new round"
        );

        let has_request = self.current.pending_request().is_some()
            || self.current.is_hash_locked()
            || self.pending_requests.contains_key(&view.sequence);
        self.set_state(State::AcceptRequest);

        if round_change && self.is_proposer() {
            if let Some(certificate) = self.current.locked() {
                let proposal = certificate.proposal.clone();
                self.send_preprepare(proposal);
            } else if let Some(request) = self.current.pending_request().cloned() {
                self.send_preprepare(request);
            }
        }
        if self.is_proposer() && !has_request {
            self.fetch_proposal(view.sequence);
        }

        self.new_round_change_timer();
    }

    fn update_round_state(&mut self, view: View, round_change: bool) {
        let (locked, pending) = if round_change {
            (self.current.locked().cloned(), self.current.pending_request().cloned())
        } else {
            (None, None)
        };
        self.current = RoundState::new(view, self.validators.clone(), locked, pending);
    }

    pub(crate) fn set_state(&mut self, state: State) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, view = %self.current.view(), "State transition");
            self.state = state;
        }
        if state == State::AcceptRequest {
            self.process_pending_requests();
        }
        self.process_backlog();
        self.publish_status();
    }

    fn process_pending_requests(&mut self) {
        let sequence = self.current.sequence();
        self.pending_requests = self.pending_requests.split_off(&sequence);
        if let Some(request) = self.pending_requests.remove(&sequence) {
            trace!(sequence, "Replaying pending request");
            self.post(CoreEvent::Request(request));
        }
    }

    fn process_backlog(&mut self) {
        let (state, view) = (self.state, self.current.view());
        let ready = self
            .backlog
            .drain_ready(|m| check_message_view(state, view, m.code(), m.view()));
        for message in ready {
            trace!(code = ?message.code(), view = %message.view(), from = %message.address, "Replaying backlogged message");
            self.post(CoreEvent::Message(message));
        }
    }

    fn post(&self, event: CoreEvent) {
        if self.events.send(event).is_err() {
            debug!("Consensus event queue closed");
        }
    }

    fn publish_status(&self) {
        let mut status = self.status.write();
        status.view = self.current.view();
        status.state = self.state;
        status.proposer = self.proposer;
        status.quorum_size = self.validators.quorum_size();
        status.validator_count = self.validators.size();
        status.last_committed = self.last_committed.clone();
    }

    fn fetch_proposal(&mut self, sequence: u64) {
        let backend = self.backend.clone();
        let events = self.events.clone();
        self.proposal_fetch = Some(tokio::spawn(async move {
            if let Some(proposal) = backend.get_proposal(sequence).await {
                let _ = events.send(CoreEvent::Request(proposal));
            }
        }));
    }

    fn new_round_change_timer(&mut self) {
        let timeout = self.config.round_timeout(self.current.round());
        self.timer.reset(timeout, self.events.clone());
    }

    /// Sign `message` as the local validator.
    ///
    /// Commits get a committed seal only when the round holds a real proposal.
    pub(crate) fn finalize_message(&self, message: &mut Message) -> IbftResult<()> {
        message.committed_seal = None;
        if message.code() == MessageCode::Commit {
            match self.current.proposal() {
                Some(proposal) => {
                    let seal = self.backend.sign(&committed_seal_bytes(message.view(), &proposal.hash()))?;
                    message.committed_seal = Some(seal);
                }
                None => warn!(view = %self.current.view(), "No proposal in the current round, commit left unsealed"),
            }
        }
        let backend = &self.backend;
        message.sign_with(self.address, |data| backend.sign(data))
    }

    /// Sign, send to peers and loop back to ourselves
    fn broadcast(&self, payload: Payload) {
        let mut message = Message::new(payload);
        if let Err(e) = self.finalize_message(&mut message) {
            error!(error = %e, "Failed to finalize message");
            return;
        }
        if let Err(e) = self.backend.broadcast(&self.validators, &message) {
            warn!(error = %e, code = ?message.code(), "Broadcast failed");
        }
        self.post(CoreEvent::Message(message));
    }

    pub(crate) fn handle_request(&mut self, request: Arc<dyn Proposal>) {
        let number = request.number();
        let sequence = self.current.sequence();
        if number < sequence {
            debug!(number, sequence, "Dropping request for a finalized sequence");
            return;
        }
        if number > sequence {
            trace!(number, sequence, "Storing request for a future sequence");
            self.pending_requests.insert(number, request);
            return;
        }

        self.current.set_pending_request(request.clone());
        if self.state == State::AcceptRequest {
            self.send_preprepare(request);
        }
    }

    pub(crate) fn send_preprepare(&mut self, request: Arc<dyn Proposal>) {
        let view = self.current.view();
        if request.number() != view.sequence || !self.is_proposer() || self.proposed == Some(view) {
            return;
        }
        let proposal = match self.current.locked() {
            Some(certificate) if certificate.proposal.hash() != request.hash() => {
                debug!(locked = %certificate.proposal.hash(), "Re-proposing locked proposal");
                certificate.proposal.clone()
            }
            _ => request,
        };

        self.proposed = Some(view);
        self.metrics.record_proposal();
        info!(sequence = view.sequence, round = view.round, hash = %proposal.hash(), "Broadcasting preprepare");
        self.broadcast(Payload::Preprepare(Preprepare { view, proposal: Some(proposal) }));
    }

    pub(crate) fn send_prepare(&self) {
        self.broadcast(Payload::Prepare(self.current.subject()));
    }

    pub(crate) fn send_commit(&self) {
        self.broadcast(Payload::Commit(self.current.subject()));
    }

    pub(crate) fn send_next_round_change(&mut self) {
        self.send_round_change(self.current.round() + 1);
    }

    /// Move to `round` and ask the other validators to follow
    pub(crate) fn send_round_change(&mut self, round: u64) {
        let current = self.current.view();
        if current.round >= round {
            trace!(round, current = current.round, "Already at or past the requested round");
            return;
        }

        self.catch_up_round(View::new(current.sequence, round));
        let prepared = self
            .current
            .locked()
            .filter(|c| c.has_quorum(&self.validators))
            .cloned();
        info!(sequence = current.sequence, round, prepared = prepared.is_some(), "Sending round change");
        self.broadcast(Payload::RoundChange(RoundChange { view: self.current.view(), prepared }));
    }

    fn catch_up_round(&mut self, view: View) {
        if view.round > self.current.round() {
            self.metrics.record_round_change();
        }
        self.update_round_state(view, true);
        self.round_change_set.clear(view.round);
        self.set_state(State::RoundChange);
        self.new_round_change_timer();
    }

    /// Finalize the current proposal once a quorum committed to it
    pub(crate) fn commit(&mut self) {
        self.set_state(State::Committed);
        self.timer.stop();

        let view = self.current.view();
        let Some(proposal) = self.current.proposal().cloned() else {
            error!(%view, error = %ConsensusError::EmptyProposal, "Commit quorum without a proposal, nothing sealed");
            self.send_next_round_change();
            return;
        };
        let Some(certificate) = self.current.committed_certificate() else {
            error!(%view, "Commit quorum without enough committed seals");
            self.send_next_round_change();
            return;
        };

        match self.backend.commit(proposal.clone(), certificate.clone()) {
            Ok(()) => {
                info!(
                    sequence = view.sequence,
                    round = view.round,
                    hash = %proposal.hash(),
                    seals = certificate.seals.len(),
                    "Committed proposal"
                );
                self.metrics.record_commit();
                self.last_committed = Some(FinalizedProposal {
                    proposal,
                    certificate,
                    proposer: self.proposer,
                });
                self.publish_status();

                if self.config.online_proofs.prune_trigger == PruneTrigger::Finalize {
                    self.registry
                        .prune_stale(&self.config.prune_strategy(), view.sequence + 1);
                }
                self.post(CoreEvent::FinalCommitted);
            }
            Err(e) => {
                warn!(error = %e, %view, "Backend rejected commit, requesting round change");
                self.metrics.record_failed_commit();
                self.current.unlock();
                self.send_next_round_change();
            }
        }
    }

    fn handle_final_committed(&mut self) {
        trace!(sequence = self.current.sequence(), "Proposal finalized");
        self.start_new_round(0);
    }

    pub(crate) fn handle_timeout(&mut self, generation: u64) {
        if !self.timer.is_current(generation) {
            trace!(generation, "Ignoring stale round change timer");
            return;
        }

        let view = self.current.view();
        warn!(error = %ConsensusError::RoundTimeout(view), state = ?self.state, "Round change timer expired");
        self.metrics.record_timeout();

        if self.state != State::RoundChange {
            let threshold = self.validators.f() as usize + 1;
            if let Some(max_round) = self.round_change_set.max_round(threshold) {
                if max_round > view.round {
                    self.send_round_change(max_round);
                    return;
                }
            }
        }

        let (last_number, _) = self.last_finalized();
        if last_number >= view.sequence {
            self.start_new_round(0);
        } else {
            self.send_next_round_change();
        }
    }
}
