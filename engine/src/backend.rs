use crate::certificate::CommittedCertificate;
use crate::message::Message;
use async_trait::async_trait;
use ibft_common::{Address, IbftResult, Proposal, Signature, ValidatorSet};
use std::sync::Arc;

/// Everything the engine needs from its host: chain access, transport and signing.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Address of the local validator
    fn address(&self) -> Address;

    /// Validators responsible for `sequence`
    fn validators(&self, sequence: u64) -> IbftResult<ValidatorSet>;

    /// Sign with the local validator key
    fn sign(&self, data: &[u8]) -> IbftResult<Signature>;

    /// Deliver a message to every other validator. Must not block on the network.
    fn broadcast(&self, validators: &ValidatorSet, message: &Message) -> IbftResult<()>;

    /// Check a proposal before voting for it
    fn verify(&self, _proposal: &dyn Proposal) -> IbftResult<()> {
        Ok(())
    }

    /// Hand over a finalized proposal with its certificate
    fn commit(&self, proposal: Arc<dyn Proposal>, certificate: CommittedCertificate) -> IbftResult<()>;

    /// Latest finalized proposal and who proposed it, when known
    fn last_proposal(&self) -> (Option<Arc<dyn Proposal>>, Option<Address>);

    /// Candidate proposal for `sequence`; may wait until one exists.
    ///
    /// `None` means the backend will push requests through `new_request` instead.
    async fn get_proposal(&self, _sequence: u64) -> Option<Arc<dyn Proposal>> {
        None
    }
}
