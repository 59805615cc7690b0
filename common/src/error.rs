use thiserror::Error;
use crate::types::{Address, View};

/// Main error type for the Istanbul BFT engine
#[derive(Error, Debug)]
pub enum IbftError {
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("Validator set error: {0}")]
    ValidatorSet(#[from] ValidatorSetError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Engine is not running")]
    NotStarted,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Invalid private key")]
    InvalidPrivateKey,

    #[error("Missing signature")]
    MissingSignature,
}

/// Protocol-level outcomes of handling a consensus message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("Message belongs to an earlier view")]
    OldMessage,

    #[error("Message belongs to a later view")]
    FutureMessage,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Duplicate preprepare for view {0}")]
    DuplicatePreprepare(View),

    #[error("Preprepare from {0} who is not the proposer")]
    NotFromProposer(Address),

    #[error("Message subject does not match the current round")]
    InconsistentSubject,

    #[error("Vote for view {actual} while collecting view {expected}")]
    ViewMismatch { expected: View, actual: View },

    #[error("Sender {0} is not a validator")]
    UnauthorizedAddress(Address),

    #[error("Message signature does not verify")]
    InvalidSignature,

    #[error("Commit carries no valid committed seal")]
    InvalidCommittedSeal,

    #[error("Invalid proposal: {0}")]
    InvalidProposal(String),

    #[error("Proposal does not match the locked proposal")]
    LockedProposalMismatch,

    #[error("Invalid prepared certificate: {0}")]
    InvalidPreparedCertificate(String),

    #[error("Insufficient votes: got {got}, needed {needed}")]
    InsufficientVotes { got: usize, needed: usize },

    #[error("Refusing to seal an empty proposal")]
    EmptyProposal,

    #[error("Round timed out at view {0}")]
    RoundTimeout(View),
}

/// Validator set construction errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidatorSetError {
    #[error("Validator set is empty")]
    Empty,

    #[error("Duplicate validator: {0}")]
    DuplicateValidator(Address),

    #[error("{size} validators cannot tolerate {f} faults (need at least {required})")]
    InsufficientValidators { size: u64, f: u64, required: u64 },
}

/// Serialization errors
#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("Binary serialization failed: {0}")]
    BinaryFailed(#[from] bincode::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Result type alias for engine operations
pub type IbftResult<T> = Result<T, IbftError>;

/// How the engine reacts to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultCategory {
    /// Conflicting or misdirected protocol traffic; dropped
    ProtocolViolation,
    /// Bad signature or non-validator sender; dropped silently
    AuthenticationFailure,
    /// Refusal to sign for an empty proposal
    SafetyGuard,
    /// Round deadline elapsed; recovered by round change
    LivenessTimeout,
    /// Prevents the engine from starting
    Configuration,
    Internal,
}

impl ConsensusError {
    /// Classify the error
    pub fn category(&self) -> FaultCategory {
        match self {
            ConsensusError::UnauthorizedAddress(_)
            | ConsensusError::InvalidSignature
            | ConsensusError::InvalidCommittedSeal => FaultCategory::AuthenticationFailure,
            ConsensusError::EmptyProposal => FaultCategory::SafetyGuard,
            ConsensusError::RoundTimeout(_) => FaultCategory::LivenessTimeout,
            _ => FaultCategory::ProtocolViolation,
        }
    }

    /// Whether the message should be kept for a later view
    pub fn is_future(&self) -> bool {
        matches!(self, ConsensusError::FutureMessage)
    }

    /// Stale traffic is expected during normal operation and is not counted as a fault
    pub fn is_stale(&self) -> bool {
        matches!(self, ConsensusError::OldMessage | ConsensusError::FutureMessage)
    }
}

impl IbftError {
    /// Classify the error
    pub fn category(&self) -> FaultCategory {
        match self {
            IbftError::Consensus(e) => e.category(),
            IbftError::Crypto(_) => FaultCategory::AuthenticationFailure,
            IbftError::ValidatorSet(_) | IbftError::Config(_) => FaultCategory::Configuration,
            IbftError::Serialization(_)
            | IbftError::Backend(_)
            | IbftError::NotStarted
            | IbftError::Internal(_) => FaultCategory::Internal,
        }
    }

    /// Check if error prevents the engine from running at all
    pub fn is_fatal(&self) -> bool {
        self.category() == FaultCategory::Configuration
    }
}

impl From<bincode::Error> for IbftError {
    fn from(err: bincode::Error) -> Self {
        IbftError::Serialization(SerializationError::BinaryFailed(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            ConsensusError::DuplicatePreprepare(View::new(1, 0)).category(),
            FaultCategory::ProtocolViolation
        );
        assert_eq!(ConsensusError::InvalidSignature.category(), FaultCategory::AuthenticationFailure);
        assert_eq!(ConsensusError::EmptyProposal.category(), FaultCategory::SafetyGuard);

        let err: IbftError = ValidatorSetError::Empty.into();
        assert!(err.is_fatal());
        assert!(!IbftError::from(ConsensusError::OldMessage).is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = ValidatorSetError::InsufficientValidators { size: 4, f: 2, required: 7 };
        assert_eq!(err.to_string(), "4 validators cannot tolerate 2 faults (need at least 7)");
    }
}
