//! Full-loop smoke test: a single-validator chain commits blocks through
//! the real router (queues, WAL ordering, ticker, event bus).

use beacon_consensus::{
    BlockExecutor, BlockStore, ConsensusConfig, ConsensusState, EvidencePool, FatalAppError,
    Mempool, ValidationError,
};
use beacon_core::{NilWal, NodeEvent, SharedWal};
use beacon_dkg::{Coordinator, DkgConfig};
use beacon_node::NodeStateMachine;
use beacon_production::{Metrics, Runner, RunnerConfig};
use beacon_threshold::BlsVerifier;
use beacon_types::{
    Address, Block, BlockId, ChainState, Commit, DuplicateVoteEvidence, Hash, Header, KeyPair,
    PartSet, Tx, Validator, ValidatorSet,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CHAIN_ID: &str = "smoke-chain";

struct SmokeExecutor;

impl BlockExecutor for SmokeExecutor {
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
            time: height * 100,
            last_block_id: state.last_block_id,
            proposer_address: proposer,
            validators_hash: state.validators.hash(),
            app_hash: state.app_hash,
            data_hash: Hash::ZERO,
            last_commit_hash: Hash::ZERO,
            random_data: vec![],
            random_hash: Hash::ZERO,
        };
        let block = Block::new(header, vec![Tx(b"smoke".to_vec())], last_commit);
        let parts = block.make_part_set();
        Some((block, parts))
    }

    fn validate_block(&self, _: &ChainState, _: &Block) -> Result<(), ValidationError> {
        Ok(())
    }

    fn apply_block(
        &self,
        mut state: ChainState,
        block_id: BlockId,
        block: &Block,
    ) -> Result<ChainState, FatalAppError> {
        state.last_block_height = block.height();
        state.last_block_id = block_id;
        state.last_block_time = block.header.time;
        Ok(state)
    }
}

#[derive(Default)]
struct SmokeStore(Mutex<Vec<(Block, Commit)>>);

impl BlockStore for SmokeStore {
    fn height(&self) -> u64 {
        self.0.lock().unwrap().last().map(|(b, _)| b.height()).unwrap_or(0)
    }
    fn save_block(&self, block: Block, _: PartSet, seen_commit: Commit) {
        self.0.lock().unwrap().push((block, seen_commit));
    }
    fn load_block(&self, height: u64) -> Option<Block> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .find(|(b, _)| b.height() == height)
            .map(|(b, _)| b.clone())
    }
    fn load_seen_commit(&self, height: u64) -> Option<Commit> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .find(|(b, _)| b.height() == height)
            .map(|(_, c)| c.clone())
    }
}

struct SmokeMempool;
impl Mempool for SmokeMempool {
    fn lock(&self) {}
    fn unlock(&self) {}
    fn flush_app_conn(&self) {}
    fn update(&self, _: u64, _: &[Tx]) {}
}

struct SmokeEvidence;
impl EvidencePool for SmokeEvidence {
    fn add_evidence(&self, _: DuplicateVoteEvidence) {}
    fn pending_evidence(&self) -> Vec<DuplicateVoteEvidence> {
        vec![]
    }
    fn update(&self, _: &Block, _: &ChainState) {}
}

#[tokio::test]
async fn single_validator_chain_commits_through_the_router() {
    use rand::SeedableRng;
    let mut rng = rand_chacha::ChaCha20Rng::seed_from_u64(1);
    let key = KeyPair::generate(&mut rng);
    let validators = ValidatorSet::new(vec![Validator::new(key.public_key(), 1)]);
    let verifiers = BlsVerifier::dealer(&validators.addresses(), &mut rng);

    let config = ConsensusConfig {
        timeout_commit: Duration::from_millis(20),
        timeout_propose: Duration::from_millis(100),
        ..ConsensusConfig::default()
    };
    let wal: SharedWal = Arc::new(Mutex::new(NilWal));
    let store = Arc::new(SmokeStore::default());
    let mut consensus = ConsensusState::new(
        config,
        ChainState::genesis(CHAIN_ID, validators),
        Some(key.clone()),
        Arc::new(SmokeExecutor),
        store.clone(),
        Arc::new(SmokeMempool),
        Arc::new(SmokeEvidence),
        wal.clone(),
    );
    consensus.set_verifier(verifiers[0].clone());

    let dkg = Coordinator::new(
        DkgConfig {
            run_at_startup: false,
            ..DkgConfig::default()
        },
        key.address(),
    );
    let node = NodeStateMachine::new(consensus, dkg);

    let (runner, handles) = Runner::new(
        node,
        wal,
        None,
        RunnerConfig::default(),
        Metrics::noop(),
    );
    let beacon_production::RunnerHandles {
        peer_tx: _peer_tx,
        dkg_tx: _dkg_tx,
        tx_notify_tx: _tx_notify_tx,
        mut outbound_rx,
        mut event_rx,
        shutdown_tx,
        done_rx,
    } = handles;
    let runner_task = tokio::spawn(runner.run());

    // Drain outbound broadcasts so the queue never backs up.
    tokio::spawn(async move { while outbound_rx.recv().await.is_some() {} });

    let mut committed = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_secs(5), event_rx.recv()).await {
            Ok(Ok(NodeEvent::NewBlock { height, .. })) => {
                committed = Some(height);
                if height >= 2 {
                    break;
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => break,
        }
    }
    assert!(
        matches!(committed, Some(h) if h >= 2),
        "expected at least two committed blocks, got {committed:?}"
    );
    assert!(store.height() >= 2);
    let block1 = store.load_block(1).unwrap();
    verifiers[0]
        .verify_random_data(beacon_types::GENESIS_RANDOM_DATA, &block1.header.random_data)
        .unwrap();

    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(5), done_rx).await;
    runner_task.abort();
}
