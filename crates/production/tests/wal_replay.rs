//! Crash-recovery: replaying the WAL reconstructs the round state, and the
//! next self-signature after recovery is byte-identical to the one an
//! uninterrupted node would produce.

use beacon_consensus::{
    BlockExecutor, BlockStore, ConsensusConfig, ConsensusState, EvidencePool, FatalAppError,
    Mempool, ValidationError,
};
use beacon_core::{
    Action, ConsensusMessage, SharedWal, Step, TimeoutInfo, Wal, WalMessage,
};
use beacon_production::{replay_start, FileWal};
use beacon_threshold::BlsVerifier;
use beacon_types::{
    Address, Block, BlockId, ChainState, Commit, DuplicateVoteEvidence, KeyPair, PartSet,
    Proposal, Tx, Validator, ValidatorSet, Vote, VoteType,
};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CHAIN_ID: &str = "replay-chain";

struct NoopExecutor;

impl BlockExecutor for NoopExecutor {
    fn create_proposal_block(
        &self,
        height: u64,
        state: &ChainState,
        last_commit: Commit,
        proposer: Address,
    ) -> Option<(Block, PartSet)> {
        let header = beacon_types::Header {
            chain_id: state.chain_id.clone(),
            height,
            time: 5_000,
            last_block_id: state.last_block_id,
            proposer_address: proposer,
            validators_hash: state.validators.hash(),
            app_hash: state.app_hash,
            data_hash: beacon_types::Hash::ZERO,
            last_commit_hash: beacon_types::Hash::ZERO,
            random_data: vec![],
            random_hash: beacon_types::Hash::ZERO,
        };
        let block = Block::new(header, vec![Tx(b"replay-tx".to_vec())], last_commit);
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
        Ok(state)
    }
}

#[derive(Default)]
struct NoopStore(Mutex<Vec<(Block, Commit)>>);

impl BlockStore for NoopStore {
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

struct NoopMempool;
impl Mempool for NoopMempool {
    fn lock(&self) {}
    fn unlock(&self) {}
    fn flush_app_conn(&self) {}
    fn update(&self, _: u64, _: &[Tx]) {}
}

struct NoopEvidence;
impl EvidencePool for NoopEvidence {
    fn add_evidence(&self, _: DuplicateVoteEvidence) {}
    fn pending_evidence(&self) -> Vec<DuplicateVoteEvidence> {
        vec![]
    }
    fn update(&self, _: &Block, _: &ChainState) {}
}

struct Fixture {
    keys: Vec<KeyPair>,
    validators: ValidatorSet,
    verifiers: Vec<Arc<BlsVerifier>>,
}

fn fixture() -> Fixture {
    use rand::SeedableRng;
    let mut rng = rand_chacha::ChaCha20Rng::seed_from_u64(99);
    let keys: Vec<KeyPair> = (0..4).map(|_| KeyPair::generate(&mut rng)).collect();
    let validators = ValidatorSet::new(
        keys.iter()
            .map(|k| Validator::new(k.public_key(), 1))
            .collect(),
    );
    let keys: Vec<KeyPair> = validators
        .validators()
        .iter()
        .map(|v| keys.iter().find(|k| k.address() == v.address).unwrap().clone())
        .collect();
    let verifiers = BlsVerifier::dealer(&validators.addresses(), &mut rng);
    Fixture {
        keys,
        validators,
        verifiers,
    }
}

/// A consensus state that mirrors every input into a WAL, the way the
/// router does.
struct Subject {
    cs: ConsensusState,
    wal: SharedWal,
    internal: VecDeque<ConsensusMessage>,
    pending_timeout: Option<TimeoutInfo>,
    /// Self-signed votes, in signing order.
    own_votes: Vec<Vote>,
}

impl Subject {
    fn new(fixture: &Fixture, index: usize, wal: SharedWal) -> Self {
        let mut cs = ConsensusState::new(
            ConsensusConfig::default(),
            ChainState::genesis(CHAIN_ID, fixture.validators.clone()),
            Some(fixture.keys[index].clone()),
            Arc::new(NoopExecutor),
            Arc::new(NoopStore::default()),
            Arc::new(NoopMempool),
            Arc::new(NoopEvidence),
            wal.clone(),
        );
        cs.set_verifier(fixture.verifiers[index].clone());
        cs.set_time(Duration::from_secs(10));
        Subject {
            cs,
            wal,
            internal: VecDeque::new(),
            pending_timeout: None,
            own_votes: Vec::new(),
        }
    }

    fn absorb(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::EnqueueInternal { msg } => self.internal.push_back(msg),
                Action::ScheduleTimeout { info } => self.pending_timeout = Some(info),
                _ => {}
            }
        }
    }

    fn start(&mut self) {
        let actions = self.cs.start();
        self.absorb(actions);
    }

    /// Deliver a peer message, logging it first like the router would.
    fn deliver(&mut self, msg: ConsensusMessage) {
        self.wal
            .lock()
            .unwrap()
            .write(&WalMessage::MsgInfo {
                msg: msg.clone(),
                peer_id: "peer".into(),
            })
            .unwrap();
        let actions = self.cs.handle_message(msg, "peer".into());
        self.absorb(actions);
        self.drain_internal();
    }

    fn fire_timeout(&mut self) {
        let info = self.pending_timeout.take().expect("a timeout is pending");
        self.wal
            .lock()
            .unwrap()
            .write(&WalMessage::Timeout(info))
            .unwrap();
        let actions = self.cs.handle_timeout(info);
        self.absorb(actions);
        self.drain_internal();
    }

    fn drain_internal(&mut self) {
        while let Some(msg) = self.internal.pop_front() {
            if let ConsensusMessage::Vote(vote) = &msg {
                self.own_votes.push(vote.clone());
            }
            self.wal
                .lock()
                .unwrap()
                .write_sync(&WalMessage::MsgInfo {
                    msg: msg.clone(),
                    peer_id: String::new(),
                })
                .unwrap();
            let actions = self.cs.handle_message(msg, String::new());
            self.absorb(actions);
        }
    }

    /// Replay logged entries without re-logging them.
    fn replay(&mut self, entries: &[WalMessage]) {
        for entry in entries {
            let actions = match entry.clone() {
                WalMessage::MsgInfo { msg, peer_id } => {
                    if let ConsensusMessage::Vote(vote) = &msg {
                        if peer_id.is_empty() {
                            self.own_votes.push(vote.clone());
                        }
                    }
                    self.cs.handle_message(msg, peer_id)
                }
                WalMessage::Timeout(info) => self.cs.handle_timeout(info),
                WalMessage::EndHeight { .. } => continue,
            };
            self.absorb(actions);
        }
    }
}

fn file_wal(path: &Path) -> SharedWal {
    Arc::new(Mutex::new(FileWal::open(path).unwrap()))
}

fn nil_wal() -> SharedWal {
    Arc::new(Mutex::new(beacon_core::NilWal))
}

#[test]
fn replay_reconstructs_state_and_resigns_identically() {
    let fixture = fixture();
    let proposer = {
        let addr = fixture.validators.get_proposer().address;
        fixture
            .validators
            .validators()
            .iter()
            .position(|v| v.address == addr)
            .unwrap()
    };
    let subject_idx = (proposer + 1) % 4;
    let others: Vec<usize> = (0..4).filter(|i| *i != subject_idx).collect();

    let dir = tempfile::tempdir().unwrap();
    let wal_path = dir.path().join("cs.wal");

    // Inputs shared by all timelines.
    let state = ChainState::genesis(CHAIN_ID, fixture.validators.clone());
    let (block, parts) = NoopExecutor
        .create_proposal_block(1, &state, Commit::empty(), fixture.keys[proposer].address())
        .unwrap();
    let block_id = block.block_id(&parts);
    let proposal = Proposal::sign_new(
        &fixture.keys[proposer],
        CHAIN_ID,
        1,
        0,
        None,
        block_id,
        5_001,
    );
    let peer_prevote = |i: usize| {
        ConsensusMessage::Vote(Vote::sign_new(
            &fixture.keys[i],
            CHAIN_ID,
            VoteType::Prevote,
            1,
            0,
            block_id,
            6_000 + i as u64,
            i as u32,
            vec![],
        ))
    };

    // Timeline A: live until one peer prevote, then "crash".
    let mut live = Subject::new(&fixture, subject_idx, file_wal(&wal_path));
    live.start();
    live.fire_timeout();
    live.deliver(ConsensusMessage::Proposal(proposal.clone()));
    for part in parts.parts() {
        live.deliver(ConsensusMessage::BlockPart {
            height: 1,
            round: 0,
            part: part.clone(),
        });
    }
    live.deliver(peer_prevote(others[0]));
    assert_eq!(live.cs.round_state().step, Step::Prevote);
    let votes_before_crash = live.own_votes.clone();
    assert_eq!(votes_before_crash.len(), 1, "the subject prevoted once");
    drop(live);

    // Timeline B: recover from the log.
    let entries = FileWal::read_entries(&wal_path).unwrap();
    let (start, _) = replay_start(&entries);
    let mut recovered = Subject::new(&fixture, subject_idx, nil_wal());
    recovered.replay(&entries[start..]);

    let rs = recovered.cs.round_state();
    assert_eq!(rs.height, 1);
    assert_eq!(rs.round, 0);
    assert_eq!(rs.step, Step::Prevote);
    assert_eq!(recovered.own_votes, votes_before_crash);

    // Timeline C: a control that never crashed.
    let mut control = Subject::new(&fixture, subject_idx, nil_wal());
    control.start();
    control.fire_timeout();
    control.deliver(ConsensusMessage::Proposal(proposal));
    for part in parts.parts() {
        control.deliver(ConsensusMessage::BlockPart {
            height: 1,
            round: 0,
            part: part.clone(),
        });
    }
    control.deliver(peer_prevote(others[0]));

    // Feed both the same polka-completing prevote; the recovered node must
    // produce the identical precommit, signature and BLS partial included.
    recovered.deliver(peer_prevote(others[1]));
    control.deliver(peer_prevote(others[1]));

    let recovered_precommit = recovered
        .own_votes
        .iter()
        .find(|v| v.vote_type == VoteType::Precommit)
        .expect("recovered node precommitted");
    let control_precommit = control
        .own_votes
        .iter()
        .find(|v| v.vote_type == VoteType::Precommit)
        .expect("control node precommitted");
    assert_eq!(
        beacon_types::wire_encode(recovered_precommit),
        beacon_types::wire_encode(control_precommit),
        "post-recovery signatures must be byte-identical"
    );
    assert_eq!(recovered.cs.round_state().locked_round, Some(0));
}
