//! In-process test harness: mock collaborators, a multi-node network, and a
//! single-subject driver for fine-grained message ordering.
//!
//! Each scenario file uses the slice of this module it needs.
#![allow(dead_code)]

use beacon_consensus::{
    BlockExecutor, BlockStore, ConsensusConfig, ConsensusState, EvidencePool, FatalAppError,
    Mempool, ValidationError,
};
use beacon_core::{
    Action, ConsensusMessage, Event, NilWal, NodeEvent, OutboundMessage, SharedWal, StateMachine,
    TimeoutInfo,
};
use beacon_dkg::{Coordinator, DkgConfig};
use beacon_node::NodeStateMachine;
use beacon_threshold::BlsVerifier;
use beacon_types::{
    Address, Block, BlockId, ChainState, Commit, DkgMessage, DuplicateVoteEvidence, Hash, Header,
    KeyPair, PartSet, Tx, Validator, ValidatorSet,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const CHAIN_ID: &str = "test-chain";

// ═══════════════════════════════════════════════════════════════════════════
// Mock collaborators
// ═══════════════════════════════════════════════════════════════════════════

/// Block executor over an opaque no-op application.
#[derive(Default)]
pub struct MockExecutor;

impl BlockExecutor for MockExecutor {
    fn create_proposal_block(
        &self,
        height: u64,
        state: &ChainState,
        last_commit: Commit,
        proposer: Address,
    ) -> Option<(Block, PartSet)> {
        let header = Header {
            chain_id: state.chain_id.clone(),
            height,
            time: 1_000 + height,
            last_block_id: state.last_block_id,
            proposer_address: proposer,
            validators_hash: state.validators.hash(),
            app_hash: state.app_hash,
            data_hash: Hash::ZERO,
            last_commit_hash: Hash::ZERO,
            random_data: vec![],
            random_hash: Hash::ZERO,
        };
        let block = Block::new(header, vec![Tx(format!("tx-{height}").into_bytes())], last_commit);
        let parts = block.make_part_set();
        Some((block, parts))
    }

    fn validate_block(&self, _state: &ChainState, _block: &Block) -> Result<(), ValidationError> {
        Ok(())
    }

    fn apply_block(
        &self,
        mut state: ChainState,
        block_id: BlockId,
        block: &Block,
    ) -> Result<ChainState, FatalAppError> {
        state.last_validators = state.validators.clone();
        state.last_block_height = block.height();
        state.last_block_id = block_id;
        state.last_block_time = block.header.time;
        Ok(state)
    }
}

/// In-memory block store shared between the node and assertions.
#[derive(Default)]
pub struct MemBlockStore {
    inner: Mutex<Vec<(Block, Commit)>>,
}

impl MemBlockStore {
    pub fn latest(&self) -> Option<Block> {
        self.inner.lock().unwrap().last().map(|(b, _)| b.clone())
    }
}

impl BlockStore for MemBlockStore {
    fn height(&self) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .last()
            .map(|(b, _)| b.height())
            .unwrap_or(0)
    }

    fn save_block(&self, block: Block, _parts: PartSet, seen_commit: Commit) {
        let mut inner = self.inner.lock().unwrap();
        assert_eq!(
            block.height(),
            inner.last().map(|(b, _)| b.height()).unwrap_or(0) + 1,
            "blocks must be stored sequentially"
        );
        inner.push((block, seen_commit));
    }

    fn load_block(&self, height: u64) -> Option<Block> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .find(|(b, _)| b.height() == height)
            .map(|(b, _)| b.clone())
    }

    fn load_seen_commit(&self, height: u64) -> Option<Commit> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .find(|(b, _)| b.height() == height)
            .map(|(_, c)| c.clone())
    }
}

#[derive(Default)]
pub struct MockMempool;

impl Mempool for MockMempool {
    fn lock(&self) {}
    fn unlock(&self) {}
    fn flush_app_conn(&self) {}
    fn update(&self, _height: u64, _txs: &[Tx]) {}
}

/// Evidence pool that records everything for assertions.
#[derive(Default)]
pub struct RecordingEvidencePool {
    inner: Mutex<Vec<DuplicateVoteEvidence>>,
}

impl RecordingEvidencePool {
    pub fn evidence(&self) -> Vec<DuplicateVoteEvidence> {
        self.inner.lock().unwrap().clone()
    }
}

impl EvidencePool for RecordingEvidencePool {
    fn add_evidence(&self, evidence: DuplicateVoteEvidence) {
        self.inner.lock().unwrap().push(evidence);
    }

    fn pending_evidence(&self) -> Vec<DuplicateVoteEvidence> {
        self.evidence()
    }

    fn update(&self, _block: &Block, _state: &ChainState) {}
}

// ═══════════════════════════════════════════════════════════════════════════
// Network fixture
// ═══════════════════════════════════════════════════════════════════════════

/// Keys and the validator set for an n-node network, with trusted-dealer BLS
/// verifiers. Key index i matches validator index i.
pub struct Network {
    pub keys: Vec<KeyPair>,
    pub validators: ValidatorSet,
    pub verifiers: Vec<Arc<BlsVerifier>>,
}

impl Network {
    pub fn new(n: usize, seed: u64) -> Self {
        use rand::SeedableRng;
        let mut rng = rand_chacha::ChaCha20Rng::seed_from_u64(seed);
        let keys: Vec<KeyPair> = (0..n).map(|_| KeyPair::generate(&mut rng)).collect();
        let validators = ValidatorSet::new(
            keys.iter()
                .map(|k| Validator::new(k.public_key(), 1))
                .collect(),
        );
        // Reorder keys so index i signs as validator i.
        let keys: Vec<KeyPair> = validators
            .validators()
            .iter()
            .map(|v| {
                keys.iter()
                    .find(|k| k.address() == v.address)
                    .unwrap()
                    .clone()
            })
            .collect();
        let verifiers = BlsVerifier::dealer(&validators.addresses(), &mut rng);
        Network {
            keys,
            validators,
            verifiers,
        }
    }

    pub fn address(&self, index: usize) -> Address {
        self.keys[index].address()
    }

    /// The validator index proposing at (height 1, round 0).
    pub fn first_proposer(&self) -> usize {
        let proposer = self.validators.get_proposer().address;
        self.validators
            .validators()
            .iter()
            .position(|v| v.address == proposer)
            .unwrap()
    }
}

/// One node under test plus handles to its mocks.
pub struct TestNode {
    pub node: NodeStateMachine,
    pub store: Arc<MemBlockStore>,
    pub evidence: Arc<RecordingEvidencePool>,
    /// Self-messages waiting for re-delivery.
    pub internal: VecDeque<ConsensusMessage>,
    /// The latest scheduled timeout ticket.
    pub pending_timeout: Option<TimeoutInfo>,
    pub events: Vec<NodeEvent>,
    /// Broadcasts not yet routed by the harness.
    pub outbound: VecDeque<OutboundMessage>,
}

pub fn build_node(net: &Network, index: usize, config: ConsensusConfig) -> TestNode {
    let store = Arc::new(MemBlockStore::default());
    let evidence = Arc::new(RecordingEvidencePool::default());
    let wal: SharedWal = Arc::new(Mutex::new(NilWal));
    let consensus = ConsensusState::new(
        config,
        ChainState::genesis(CHAIN_ID, net.validators.clone()),
        Some(net.keys[index].clone()),
        Arc::new(MockExecutor),
        store.clone(),
        Arc::new(MockMempool),
        evidence.clone(),
        wal,
    );
    let dkg = Coordinator::new(
        DkgConfig {
            run_at_startup: false,
            ..DkgConfig::default()
        },
        net.address(index),
    );
    let mut node = NodeStateMachine::new(consensus, dkg);
    node.set_verifier(net.verifiers[index].clone());
    node.set_time(Duration::from_secs(1));
    TestNode {
        node,
        store,
        evidence,
        internal: VecDeque::new(),
        pending_timeout: None,
        events: Vec::new(),
        outbound: VecDeque::new(),
    }
}

impl TestNode {
    /// Feed one event, absorbing the resulting actions.
    pub fn dispatch(&mut self, event: Event) {
        let actions = self.node.handle(event);
        self.absorb(actions);
    }

    pub fn start(&mut self) {
        let actions = self.node.start();
        self.absorb(actions);
    }

    fn absorb(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Broadcast { message } => self.outbound.push_back(message),
                Action::EnqueueInternal { msg } => self.internal.push_back(msg),
                Action::ScheduleTimeout { info } => self.pending_timeout = Some(info),
                Action::Publish { event } => self.events.push(event),
            }
        }
    }

    /// Process queued self-messages until none remain.
    pub fn drain_internal(&mut self) {
        while let Some(msg) = self.internal.pop_front() {
            self.dispatch(Event::InternalMessage { msg });
        }
    }

    /// Deliver the pending timeout ticket, if any.
    pub fn fire_timeout(&mut self) {
        if let Some(info) = self.pending_timeout.take() {
            self.dispatch(Event::TimeoutElapsed { info });
            self.drain_internal();
        }
    }

    pub fn deliver(&mut self, msg: ConsensusMessage, from: &str) {
        self.dispatch(Event::PeerMessage {
            msg,
            peer_id: from.to_string(),
        });
        self.drain_internal();
    }

    pub fn deliver_dkg(&mut self, msg: DkgMessage) {
        self.dispatch(Event::DkgMessageReceived { msg });
    }

    pub fn height(&self) -> u64 {
        self.node.consensus().round_state().height
    }

    pub fn round(&self) -> u32 {
        self.node.consensus().round_state().round
    }

    pub fn has_event(&self, name: &str) -> bool {
        self.events.iter().any(|e| e.type_name() == name)
    }
}

/// A fully connected in-process network of nodes.
pub struct Harness {
    pub nodes: Vec<TestNode>,
}

impl Harness {
    pub fn new(net: &Network, config: ConsensusConfig) -> Self {
        let nodes = (0..net.keys.len())
            .map(|i| build_node(net, i, config.clone()))
            .collect();
        Harness { nodes }
    }

    pub fn start_all(&mut self) {
        for node in &mut self.nodes {
            node.start();
        }
        self.route_until_quiet();
    }

    /// Fire every node's pending timeout, then let the network settle.
    pub fn fire_all_timeouts(&mut self) {
        for node in &mut self.nodes {
            node.fire_timeout();
        }
        self.route_until_quiet();
    }

    /// Deliver queued broadcasts to every other node until the network goes
    /// quiet.
    pub fn route_until_quiet(&mut self) {
        loop {
            let mut moved = false;
            for i in 0..self.nodes.len() {
                self.nodes[i].drain_internal();
                while let Some(message) = self.nodes[i].outbound.pop_front() {
                    moved = true;
                    for j in 0..self.nodes.len() {
                        if i == j {
                            continue;
                        }
                        match message.clone() {
                            OutboundMessage::Consensus(msg) => {
                                self.nodes[j].deliver(msg, &format!("node-{i}"))
                            }
                            OutboundMessage::Dkg(msg) => self.nodes[j].deliver_dkg(msg),
                        }
                    }
                }
            }
            if !moved {
                break;
            }
        }
    }
}
