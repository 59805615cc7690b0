use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Consensus counters, mirrored to the global `metrics` recorder
#[derive(Debug, Default)]
pub struct ConsensusMetrics {
    /// Proposals broadcast while acting as proposer
    pub proposals: AtomicU64,

    /// Finalized proposals
    pub commits: AtomicU64,

    /// Rounds entered through round change
    pub round_changes: AtomicU64,

    /// Round deadlines that elapsed
    pub timeouts: AtomicU64,

    /// Messages rejected as protocol violations or authentication failures
    pub dropped_messages: AtomicU64,

    /// Messages buffered for a later view
    pub backlogged_messages: AtomicU64,

    /// Backend commit failures
    pub failed_commits: AtomicU64,
}

/// Lightweight snapshot for API serialization
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsensusMetricsSnapshot {
    pub proposals: u64,
    pub commits: u64,
    pub round_changes: u64,
    pub timeouts: u64,
    pub dropped_messages: u64,
    pub backlogged_messages: u64,
    pub failed_commits: u64,
}

impl ConsensusMetrics {
    pub fn record_proposal(&self) {
        self.proposals.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ibft_proposals_total").increment(1);
    }

    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ibft_commits_total").increment(1);
    }

    pub fn record_round_change(&self) {
        self.round_changes.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ibft_round_changes_total").increment(1);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ibft_timeouts_total").increment(1);
    }

    pub fn record_dropped(&self, reason: &'static str) {
        self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ibft_messages_dropped_total", "reason" => reason).increment(1);
    }

    pub fn record_backlogged(&self) {
        self.backlogged_messages.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ibft_messages_backlogged_total").increment(1);
    }

    pub fn record_failed_commit(&self) {
        self.failed_commits.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ibft_failed_commits_total").increment(1);
    }

    pub fn snapshot(&self) -> ConsensusMetricsSnapshot {
        ConsensusMetricsSnapshot {
            proposals: self.proposals.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            round_changes: self.round_changes.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
            backlogged_messages: self.backlogged_messages.load(Ordering::Relaxed),
            failed_commits: self.failed_commits.load(Ordering::Relaxed),
        }
    }
}
