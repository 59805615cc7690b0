#![allow(dead_code)]

use ibft_common::{Address, Block, Hash, IbftError, IbftResult, KeyPair, Proposal, Signature, ValidatorSet, ValidatorSetError};
use ibft_engine::{Backend, CommittedCertificate, EngineConfig, IstanbulEngine, Message};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once, Weak};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Initialize logging for tests
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with_test_writer()
            .try_init();
    });
}

pub fn make_block(number: u64, parent_hash: Hash, payload: &str) -> Arc<dyn Proposal> {
    Arc::new(Block::new(number, parent_hash, payload.as_bytes().to_vec()))
}

/// In-memory transport delivering every broadcast to all other engines
#[derive(Default)]
pub struct VirtualNetwork {
    peers: RwLock<HashMap<Address, Weak<IstanbulEngine>>>,
}

impl VirtualNetwork {
    pub fn register(&self, engine: &Arc<IstanbulEngine>) {
        self.peers.write().insert(engine.address(), Arc::downgrade(engine));
    }

    fn deliver(&self, from: Address, message: &Message) {
        let peers: Vec<Arc<IstanbulEngine>> = self
            .peers
            .read()
            .iter()
            .filter(|(address, _)| **address != from)
            .filter_map(|(_, peer)| peer.upgrade())
            .collect();
        for peer in peers {
            // stopped peers just miss the message
            let _ = peer.handle_message(message.clone());
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommittedRecord {
    pub proposal: Arc<dyn Proposal>,
    pub certificate: CommittedCertificate,
}

pub struct TestBackend {
    key: KeyPair,
    validators: ValidatorSet,
    network: Arc<VirtualNetwork>,
    committed: Mutex<Vec<CommittedRecord>>,
    invalid_validators: AtomicBool,
}

impl TestBackend {
    pub fn committed(&self) -> Vec<CommittedRecord> {
        self.committed.lock().clone()
    }

    pub fn committed_numbers(&self) -> Vec<u64> {
        self.committed.lock().iter().map(|r| r.proposal.number()).collect()
    }

    /// Make `validators` fail as if the chain returned an unusable set
    pub fn set_invalid_validators(&self, invalid: bool) {
        self.invalid_validators.store(invalid, Ordering::SeqCst);
    }

    pub fn validator_set(&self) -> &ValidatorSet {
        &self.validators
    }
}

#[async_trait::async_trait]
impl Backend for TestBackend {
    fn address(&self) -> Address {
        self.key.address()
    }

    fn validators(&self, _sequence: u64) -> IbftResult<ValidatorSet> {
        if self.invalid_validators.load(Ordering::SeqCst) {
            return Err(IbftError::ValidatorSet(ValidatorSetError::Empty));
        }
        Ok(self.validators.clone())
    }

    fn sign(&self, data: &[u8]) -> IbftResult<Signature> {
        Ok(self.key.sign(data))
    }

    fn broadcast(&self, _validators: &ValidatorSet, message: &Message) -> IbftResult<()> {
        self.network.deliver(self.key.address(), message);
        Ok(())
    }

    fn commit(&self, proposal: Arc<dyn Proposal>, certificate: CommittedCertificate) -> IbftResult<()> {
        self.committed.lock().push(CommittedRecord { proposal, certificate });
        Ok(())
    }

    fn last_proposal(&self) -> (Option<Arc<dyn Proposal>>, Option<Address>) {
        (self.committed.lock().last().map(|r| r.proposal.clone()), None)
    }
}

/// `n` engines wired through one virtual network.
///
/// Keys are ordered by address, so engine `i` is validator `i` of the set.
pub struct TestSystem {
    pub network: Arc<VirtualNetwork>,
    pub backends: Vec<Arc<TestBackend>>,
    pub engines: Vec<Arc<IstanbulEngine>>,
}

impl TestSystem {
    pub fn new(n: usize) -> Self {
        Self::with_config(n, EngineConfig::default())
    }

    pub fn with_config(n: usize, config: EngineConfig) -> Self {
        init_test_logging();

        let mut keys: Vec<KeyPair> = (0..n).map(|i| KeyPair::from_seed([i as u8 + 1; 32])).collect();
        keys.sort_by_key(|k| k.address());
        let validators = ValidatorSet::new(keys.iter().map(|k| k.validator()).collect()).unwrap();
        let network = Arc::new(VirtualNetwork::default());

        let mut backends = Vec::with_capacity(n);
        let mut engines = Vec::with_capacity(n);
        for key in keys {
            let backend = Arc::new(TestBackend {
                key,
                validators: validators.clone(),
                network: network.clone(),
                committed: Mutex::new(Vec::new()),
                invalid_validators: AtomicBool::new(false),
            });
            let engine = Arc::new(IstanbulEngine::new(config.clone(), backend.clone()).unwrap());
            network.register(&engine);
            backends.push(backend);
            engines.push(engine);
        }

        Self { network, backends, engines }
    }

    pub fn start(&self) {
        for engine in &self.engines {
            engine.start().unwrap();
        }
    }

    pub fn start_only(&self, indexes: &[usize]) {
        for index in indexes {
            self.engines[*index].start().unwrap();
        }
    }

    pub async fn stop(&self) {
        for engine in &self.engines {
            engine.stop().await.unwrap();
        }
    }

    /// Hand `proposal` to every running engine; only the proposer acts on it
    pub fn submit(&self, proposal: Arc<dyn Proposal>) {
        for engine in &self.engines {
            let _ = engine.new_request(proposal.clone());
        }
    }

    /// Poll until `condition` holds or `limit` elapses
    pub async fn wait_for<F>(&self, limit: Duration, mut condition: F) -> bool
    where
        F: FnMut(&TestSystem) -> bool,
    {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if condition(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition(self)
    }
}
