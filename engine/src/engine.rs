use crate::backend::Backend;
use crate::config::{EngineConfig, PruneTrigger};
use crate::consensus::{Core, CoreEvent, EngineStatus, FinalizedProposal, State};
use crate::message::Message;
use crate::metrics::{ConsensusMetrics, ConsensusMetricsSnapshot};
use crate::pruner;
use futures::future::join_all;
use ibft_common::{Address, IbftError, IbftResult, OnlineProofRegistry, Proposal, View};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

struct RunningEngine {
    events: mpsc::UnboundedSender<CoreEvent>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Istanbul BFT engine of one replica.
///
/// All protocol work runs on a single task started by [`IstanbulEngine::start`];
/// the methods here only enqueue input or read published state, so they are
/// safe to call from the backend's own callbacks.
pub struct IstanbulEngine {
    config: Arc<EngineConfig>,
    backend: Arc<dyn Backend>,
    address: Address,
    registry: OnlineProofRegistry,
    status: Arc<RwLock<EngineStatus>>,
    metrics: Arc<ConsensusMetrics>,
    running: Mutex<Option<RunningEngine>>,
}

impl IstanbulEngine {
    pub fn new(config: EngineConfig, backend: Arc<dyn Backend>) -> IbftResult<Self> {
        config.validate()?;
        Ok(Self {
            address: backend.address(),
            config: Arc::new(config),
            backend,
            registry: OnlineProofRegistry::new(),
            status: Arc::new(RwLock::new(EngineStatus::default())),
            metrics: Arc::new(ConsensusMetrics::default()),
            running: Mutex::new(None),
        })
    }

    /// Start the consensus task. Calling it on a running engine does nothing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> IbftResult<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            debug!(address = %self.address, "Engine already running");
            return Ok(());
        }

        let (last, _) = self.backend.last_proposal();
        let sequence = last.map(|p| p.number()).unwrap_or(0) + 1;
        let validators = self
            .backend
            .validators(sequence)
            .and_then(|set| {
                set.validate()?;
                Ok(set)
            })
            .map_err(|e| IbftError::Config(format!("Invalid validator set for sequence {}: {}", sequence, e)))?;

        {
            let mut status = self.status.write();
            status.quorum_size = validators.quorum_size();
            status.validator_count = validators.size();
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let core = Core::new(
            self.config.clone(),
            self.backend.clone(),
            validators,
            self.registry.clone(),
            self.status.clone(),
            self.metrics.clone(),
            events_tx.clone(),
        );

        let mut tasks = vec![tokio::spawn(core.run(events_rx, shutdown_rx.clone()))];
        if self.config.online_proofs.prune_trigger == PruneTrigger::Interval {
            tasks.push(tokio::spawn(pruner::run(
                self.registry.clone(),
                self.config.prune_strategy(),
                self.config.prune_interval(),
                shutdown_rx,
            )));
        }

        *running = Some(RunningEngine {
            events: events_tx,
            shutdown: shutdown_tx,
            tasks,
        });
        info!(address = %self.address, sequence, "Istanbul engine started");
        Ok(())
    }

    /// Stop the engine and wait for its tasks. Calling it again does nothing.
    pub async fn stop(&self) -> IbftResult<()> {
        let running = self.running.lock().take();
        let Some(running) = running else {
            debug!(address = %self.address, "Engine already stopped");
            return Ok(());
        };

        let _ = running.shutdown.send(true);
        drop(running.events);

        for result in join_all(running.tasks).await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!(error = %e, "Engine task failed");
                    return Err(IbftError::Internal(format!("Engine task failed: {}", e)));
                }
            }
        }

        info!(address = %self.address, view = %self.current_view(), "Istanbul engine stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Submit a candidate proposal; only the round's proposer acts on it
    pub fn new_request(&self, proposal: Arc<dyn Proposal>) -> IbftResult<()> {
        self.send_event(CoreEvent::Request(proposal))
    }

    /// Deliver a message received from another validator
    pub fn handle_message(&self, message: Message) -> IbftResult<()> {
        self.send_event(CoreEvent::Message(message))
    }

    fn send_event(&self, event: CoreEvent) -> IbftResult<()> {
        let running = self.running.lock();
        let running = running.as_ref().ok_or(IbftError::NotStarted)?;
        running.events.send(event).map_err(|_| IbftError::NotStarted)
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn current_view(&self) -> View {
        self.status.read().view
    }

    pub fn state(&self) -> State {
        self.status.read().state
    }

    pub fn proposer(&self) -> Option<Address> {
        self.status.read().proposer
    }

    pub fn is_proposer(&self) -> bool {
        self.proposer() == Some(self.address)
    }

    /// Votes needed for a quorum in the current validator set
    pub fn quorum_size(&self) -> u64 {
        self.status.read().quorum_size
    }

    pub fn last_committed(&self) -> Option<FinalizedProposal> {
        self.status.read().last_committed.clone()
    }

    pub fn status(&self) -> EngineStatus {
        self.status.read().clone()
    }

    /// Shared online proof registry; `lock()` on it gives exclusive access
    pub fn online_proofs(&self) -> &OnlineProofRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> ConsensusMetricsSnapshot {
        self.metrics.snapshot()
    }
}
