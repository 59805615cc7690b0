use crate::consensus::{Core, State};
use crate::message::{committed_seal_bytes, Message, MessageCode, Payload, Preprepare, RoundChange, Subject};
use ibft_common::{ConsensusError, FaultCategory};
use tracing::{debug, error, info, trace, warn};

impl Core {
    /// Verify, classify and apply a message; failures are logged and the message dropped
    pub(crate) fn handle_message(&mut self, message: Message) {
        let code = message.code();
        let view = message.view();
        let from = message.address;

        match self.dispatch(&message) {
            Ok(()) => {}
            Err(ConsensusError::FutureMessage) => {
                trace!(?code, %view, %from, "Storing future message");
                if self.backlog.store(message) {
                    self.metrics.record_backlogged();
                } else {
                    debug!(%from, "Backlog full for sender, dropping message");
                    self.metrics.record_dropped("backlog_full");
                }
            }
            Err(ConsensusError::OldMessage) => {
                trace!(?code, %view, %from, current = %self.current.view(), "Ignoring old message");
            }
            Err(e) => match e.category() {
                FaultCategory::AuthenticationFailure => {
                    debug!(error = %e, ?code, %from, "Rejected unauthenticated message");
                    self.metrics.record_dropped("authentication");
                }
                FaultCategory::SafetyGuard => {
                    error!(error = %e, ?code, %view, %from, "Rejected message violating a safety guard");
                    self.metrics.record_dropped("safety");
                }
                _ => {
                    warn!(error = %e, ?code, %view, %from, "Rejected message");
                    self.metrics.record_dropped("protocol");
                }
            },
        }
    }

    fn dispatch(&mut self, message: &Message) -> Result<(), ConsensusError> {
        message.verify(&self.validators)?;
        match &message.payload {
            Payload::Preprepare(preprepare) => self.handle_preprepare(message, preprepare),
            Payload::Prepare(subject) => self.handle_prepare(message, subject),
            Payload::Commit(subject) => self.handle_commit(message, subject),
            Payload::RoundChange(round_change) => self.handle_round_change(message, round_change),
        }
    }

    fn handle_preprepare(&mut self, message: &Message, preprepare: &Preprepare) -> Result<(), ConsensusError> {
        self.check_message(MessageCode::Preprepare, preprepare.view)?;

        if self.proposer != Some(message.address) {
            return Err(ConsensusError::NotFromProposer(message.address));
        }
        let proposal = preprepare
            .proposal
            .as_ref()
            .ok_or_else(|| ConsensusError::InvalidMessage("preprepare without proposal".into()))?;
        if proposal.number() != preprepare.view.sequence {
            return Err(ConsensusError::InvalidMessage(format!(
                "proposal number {} does not match sequence {}",
                proposal.number(),
                preprepare.view.sequence
            )));
        }
        if self.state != State::AcceptRequest {
            return Err(ConsensusError::DuplicatePreprepare(preprepare.view));
        }

        if let Err(e) = self.backend.verify(proposal.as_ref()) {
            warn!(error = %e, hash = %proposal.hash(), "Proposal failed verification, requesting round change");
            self.send_next_round_change();
            return Err(ConsensusError::InvalidProposal(e.to_string()));
        }

        match self.current.locked_hash() {
            Some(locked) if locked == proposal.hash() => {
                self.current.set_preprepare(preprepare.clone())?;
                debug!(hash = %locked, "Preprepare matches locked proposal, committing directly");
                self.set_state(State::Prepared);
                self.send_commit();
            }
            Some(_) => {
                self.send_next_round_change();
                return Err(ConsensusError::LockedProposalMismatch);
            }
            None => {
                self.current.set_preprepare(preprepare.clone())?;
                debug!(hash = %proposal.hash(), from = %message.address, "Accepted preprepare");
                self.set_state(State::Preprepared);
                self.send_prepare();
            }
        }
        Ok(())
    }

    /// Votes must reference the proposal accepted for the current view
    fn check_subject(&self, subject: &Subject) -> Result<(), ConsensusError> {
        if *subject != self.current.subject() {
            return Err(ConsensusError::InconsistentSubject);
        }
        Ok(())
    }

    fn handle_prepare(&mut self, message: &Message, subject: &Subject) -> Result<(), ConsensusError> {
        self.check_message(MessageCode::Prepare, subject.view)?;
        self.check_subject(subject)?;
        self.current.add_prepare(message.clone())?;

        let locked_here = self.current.locked_hash() == Some(subject.digest);
        if (self.current.has_quorum_prepare_or_commit() || locked_here) && self.state_before(State::Prepared) {
            self.enter_prepared();
        }
        Ok(())
    }

    fn enter_prepared(&mut self) {
        self.current.lock_proposal();
        debug!(
            view = %self.current.view(),
            voters = self.current.prepare_or_commit_size(),
            "Prepared"
        );
        self.set_state(State::Prepared);
        self.send_commit();
    }

    fn handle_commit(&mut self, message: &Message, subject: &Subject) -> Result<(), ConsensusError> {
        self.check_message(MessageCode::Commit, subject.view)?;
        self.check_subject(subject)?;

        let (_, validator) = self
            .validators
            .get_by_address(&message.address)
            .ok_or(ConsensusError::UnauthorizedAddress(message.address))?;
        let seal = message
            .committed_seal
            .as_ref()
            .ok_or(ConsensusError::InvalidCommittedSeal)?;
        validator
            .verify(&committed_seal_bytes(subject.view, &subject.digest), seal)
            .map_err(|_| ConsensusError::InvalidCommittedSeal)?;

        self.current.add_commit(message.clone())?;
        if self.current.has_quorum_prepare_or_commit() && self.state_before(State::Prepared) {
            self.enter_prepared();
        }
        if self.current.has_quorum_commits() && self.state_before(State::Committed) {
            self.current.lock_proposal();
            self.commit();
        }
        Ok(())
    }

    fn handle_round_change(&mut self, message: &Message, round_change: &RoundChange) -> Result<(), ConsensusError> {
        self.check_message(MessageCode::RoundChange, round_change.view)?;

        if let Some(certificate) = &round_change.prepared {
            if certificate.view.sequence != round_change.view.sequence
                || certificate.view.round >= round_change.view.round
            {
                return Err(ConsensusError::InvalidPreparedCertificate(
                    "certificate is not from an earlier round of this sequence".into(),
                ));
            }
            certificate.verify(&self.validators)?;
        }

        let target = round_change.view.round;
        let count = self.round_change_set.add(target, message.clone())?;
        debug!(from = %message.address, round = target, count, "Received round change");

        if let Some(certificate) = self.round_change_set.highest_certificate(target).cloned() {
            let round = certificate.view.round;
            let hash = certificate.proposal.hash();
            if self.current.adopt(certificate) {
                info!(round, %hash, "Adopted prepared certificate from round change");
            }
        }

        let f = self.validators.f() as usize;
        if count > f && self.current.round() < target {
            self.send_round_change(target);
        }

        let quorum = self.validators.quorum_size() as usize;
        if self.round_change_set.count(target) >= quorum
            && self.state == State::RoundChange
            && self.current.round() == target
        {
            self.start_new_round(target);
        }
        Ok(())
    }
}
