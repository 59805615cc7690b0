//! Istanbul BFT consensus for a single replica.
//!
//! The host supplies a [`Backend`] for signing, transport and finalization; the
//! [`IstanbulEngine`] drives preprepare, prepare, commit and round change on top of it.

pub mod backend;
pub mod backlog;
pub mod certificate;
pub mod config;
mod consensus;
pub mod engine;
mod handler;
pub mod message;
pub mod metrics;
mod pruner;
pub mod round_change;
pub mod round_state;

pub use backend::Backend;
pub use certificate::{CommittedCertificate, CommittedSeal, PreparedCertificate};
pub use config::{EngineConfig, OnlineProofConfig, PruneTrigger};
pub use consensus::{EngineStatus, FinalizedProposal, State};
pub use engine::IstanbulEngine;
pub use message::{committed_seal_bytes, Message, MessageCode, Payload, Preprepare, RoundChange, Subject};
pub use metrics::{ConsensusMetrics, ConsensusMetricsSnapshot};
pub use round_state::{MessageSet, RoundPhase, RoundState};
