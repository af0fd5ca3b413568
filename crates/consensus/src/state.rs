//! The round-based consensus state machine.
//!
//! Per-height progression `NewHeight → NewRound → Propose → Prevote →
//! PrevoteWait → Precommit → PrecommitWait → Commit`, with the classic
//! locking discipline, extended with the randomness beacon: every precommit
//! carries a BLS partial signature over the previous block's randomness, and
//! the commit path recovers the threshold signature and stamps it onto the
//! block before finalizing.
//!
//! All methods are synchronous and run on the router loop; they return the
//! actions (broadcasts, timeout tickets, notifications) for the router to
//! execute. Invariant violations on the commit path panic: a node that can
//! no longer trust its own state must stop signing, and the router turns the
//! panic into a halt.

use crate::config::ConsensusConfig;
use crate::height_vote_set::HeightVoteSet;
use crate::round_state::RoundState;
use crate::traits::{BlockExecutor, BlockStore, EvidencePool, Mempool};
use crate::vote_set::{AddVoteError, VoteSet};
use beacon_core::{
    Action, ConsensusMessage, NodeEvent, OutboundMessage, PeerId, SharedWal, Step, TimeoutInfo,
    Wal, WalMessage,
};
use beacon_threshold::BlsVerifier;
use beacon_types::{
    Block, BlockId, ChainState, Commit, KeyPair, Part, PartSet, Proposal, Vote, VoteType,
    GENESIS_RANDOM_DATA,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// The consensus core for one node.
pub struct ConsensusState {
    config: ConsensusConfig,
    state: ChainState,
    rs: RoundState,

    /// Absent for non-validator observers.
    priv_validator: Option<KeyPair>,
    /// Threshold BLS verifier; replaced by the DKG coordinator when a round
    /// certifies. Absent until the first DKG succeeds, during which the node
    /// does not sign.
    verifier: Option<Arc<BlsVerifier>>,

    block_exec: Arc<dyn BlockExecutor>,
    block_store: Arc<dyn BlockStore>,
    mempool: Arc<dyn Mempool>,
    evidence_pool: Arc<dyn EvidencePool>,
    wal: SharedWal,

    now: Duration,
}

impl ConsensusState {
    pub fn new(
        config: ConsensusConfig,
        state: ChainState,
        priv_validator: Option<KeyPair>,
        block_exec: Arc<dyn BlockExecutor>,
        block_store: Arc<dyn BlockStore>,
        mempool: Arc<dyn Mempool>,
        evidence_pool: Arc<dyn EvidencePool>,
        wal: SharedWal,
    ) -> Self {
        let rs = RoundState {
            height: state.last_block_height + 1,
            round: 0,
            step: Step::NewHeight,
            start_time: Duration::ZERO,
            commit_time: Duration::ZERO,
            validators: state.validators.clone(),
            proposal: None,
            proposal_block: None,
            proposal_block_parts: None,
            locked_round: None,
            locked_block: None,
            locked_block_parts: None,
            valid_round: None,
            valid_block: None,
            valid_block_parts: None,
            votes: HeightVoteSet::new(
                state.chain_id.clone(),
                state.last_block_height + 1,
                state.validators.clone(),
            ),
            commit_round: None,
            last_commit: None,
            last_validators: state.last_validators.clone(),
            triggered_timeout_precommit: false,
        };
        let mut cs = ConsensusState {
            config,
            rs,
            priv_validator,
            verifier: None,
            block_exec,
            block_store,
            mempool,
            evidence_pool,
            wal,
            state,
            now: Duration::ZERO,
        };
        cs.reconstruct_last_commit();
        cs
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════

    /// Immutable snapshot of the round state.
    pub fn round_state(&self) -> &RoundState {
        &self.rs
    }

    pub fn chain_state(&self) -> &ChainState {
        &self.state
    }

    pub fn verifier(&self) -> Option<&Arc<BlsVerifier>> {
        self.verifier.as_ref()
    }

    /// Install (or replace) the threshold verifier. Called by the node when
    /// a DKG round certifies.
    pub fn set_verifier(&mut self, verifier: Arc<BlsVerifier>) {
        info!(
            t = verifier.threshold(),
            n = verifier.participants(),
            "installing BLS verifier"
        );
        self.verifier = Some(verifier);
    }

    pub fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn now_ms(&self) -> u64 {
        self.now.as_millis() as u64
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Entry points
    // ═══════════════════════════════════════════════════════════════════════

    /// Schedule round 0 of the current height. Called once at startup.
    pub fn start(&mut self) -> Vec<Action> {
        if self.rs.start_time == Duration::ZERO {
            self.rs.start_time = self.now + self.config.timeout_commit;
        }
        vec![self.schedule_round0()]
    }

    /// Process one consensus message (from a peer or from ourselves).
    pub fn handle_message(&mut self, msg: ConsensusMessage, peer_id: PeerId) -> Vec<Action> {
        let mut actions = Vec::new();
        match msg {
            ConsensusMessage::Proposal(proposal) => {
                if let Err(e) = self.set_proposal(proposal) {
                    debug!(peer = %peer_id, "rejected proposal: {e}");
                }
            }
            ConsensusMessage::BlockPart { height, round, part } => {
                self.add_block_part(height, round, part, &mut actions);
            }
            ConsensusMessage::Vote(vote) => {
                self.try_add_vote(vote, &peer_id, &mut actions);
            }
        }
        actions
    }

    /// Process an elapsed timeout ticket.
    #[instrument(skip(self, ti), fields(height = ti.height, round = ti.round, step = %ti.step))]
    pub fn handle_timeout(&mut self, ti: TimeoutInfo) -> Vec<Action> {
        // Stale tickets are dropped: the state has moved past them.
        if ti.height != self.rs.height
            || ti.round < self.rs.round
            || (ti.round == self.rs.round && ti.step < self.rs.step)
        {
            debug!(
                cur_round = self.rs.round,
                cur_step = %self.rs.step,
                "ignoring stale timeout"
            );
            return vec![];
        }

        let mut actions = Vec::new();
        match ti.step {
            Step::NewHeight => self.enter_new_round(ti.height, 0, &mut actions),
            Step::NewRound => self.enter_propose(ti.height, 0, &mut actions),
            Step::Propose => {
                actions.push(publish(NodeEvent::TimeoutPropose {
                    height: ti.height,
                    round: ti.round,
                }));
                self.enter_prevote(ti.height, ti.round, &mut actions);
            }
            Step::PrevoteWait => {
                actions.push(publish(NodeEvent::TimeoutWait {
                    height: ti.height,
                    round: ti.round,
                }));
                self.enter_precommit(ti.height, ti.round, &mut actions);
            }
            Step::PrecommitWait => {
                actions.push(publish(NodeEvent::TimeoutWait {
                    height: ti.height,
                    round: ti.round,
                }));
                self.enter_precommit(ti.height, ti.round, &mut actions);
                self.enter_new_round(ti.height, ti.round + 1, &mut actions);
            }
            step => panic!("invalid timeout step: {step}"),
        }
        actions
    }

    /// The mempool signalled available transactions.
    pub fn handle_txs_available(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        // Only relevant while waiting to propose round 0.
        if self.rs.round != 0 {
            return actions;
        }
        match self.rs.step {
            Step::NewHeight => {
                if self.need_proof_block(self.rs.height) {
                    // Proposing happens on round entry regardless.
                    return actions;
                }
                let timeout = self
                    .rs
                    .start_time
                    .saturating_sub(self.now)
                    .saturating_add(Duration::from_millis(1));
                actions.push(Action::ScheduleTimeout {
                    info: TimeoutInfo {
                        duration: timeout,
                        height: self.rs.height,
                        round: 0,
                        step: Step::NewRound,
                    },
                });
            }
            Step::NewRound => self.enter_propose(self.rs.height, 0, &mut actions),
            _ => {}
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Proposals and block parts
    // ═══════════════════════════════════════════════════════════════════════

    fn set_proposal(&mut self, proposal: Proposal) -> Result<(), String> {
        // Already have one.
        if self.rs.proposal.is_some() {
            return Ok(());
        }
        // Does not apply.
        if proposal.height != self.rs.height || proposal.round != self.rs.round {
            return Ok(());
        }
        // The proof-of-lock round must predate the proposal round.
        if let Some(pol) = proposal.pol_round {
            if pol >= proposal.round {
                return Err(format!(
                    "invalid POL round {pol} for proposal round {}",
                    proposal.round
                ));
            }
        }
        let proposer = self.rs.validators.get_proposer();
        if !proposal.verify(&self.state.chain_id, &proposer.pub_key) {
            return Err("invalid proposal signature".into());
        }

        info!(
            height = proposal.height,
            round = proposal.round,
            block = ?proposal.block_id.hash,
            "received proposal"
        );
        if self.rs.proposal_block_parts.is_none() {
            self.rs.proposal_block_parts =
                Some(PartSet::from_header(proposal.block_id.parts_header));
        }
        self.rs.proposal = Some(proposal);
        Ok(())
    }

    fn add_block_part(
        &mut self,
        height: u64,
        round: u32,
        part: Part,
        actions: &mut Vec<Action>,
    ) {
        if self.rs.height != height {
            debug!(height, round, "block part from wrong height");
            return;
        }
        let Some(parts) = self.rs.proposal_block_parts.as_mut() else {
            // Happens after advancing rounds while old parts are in flight.
            debug!(height, round, index = part.index, "unexpected block part");
            return;
        };

        let added = match parts.add_part(part) {
            Ok(added) => added,
            Err(e) => {
                debug!("rejected block part: {e}");
                return;
            }
        };
        if !added || !parts.is_complete() {
            return;
        }

        let block: Block = match parts.reassemble().and_then(|bytes| {
            beacon_types::wire_decode(&bytes).map_err(|_| beacon_types::PartSetError::RootMismatch)
        }) {
            Ok(block) => block,
            Err(e) => {
                warn!("failed to reconstruct proposal block: {e}");
                return;
            }
        };

        info!(
            height = block.height(),
            hash = ?block.hash(),
            "received complete proposal block"
        );
        let block_hash = block.hash();
        self.rs.proposal_block = Some(block);
        actions.push(publish(NodeEvent::CompleteProposal {
            height: self.rs.height,
            round: self.rs.round,
            block_hash,
        }));

        // A polka may already exist for this block.
        let maj23 = self
            .rs
            .votes
            .prevotes(self.rs.round)
            .and_then(|v| v.two_thirds_majority());
        if let Some(block_id) = maj23 {
            if !block_id.is_nil() && self.rs.valid_round < Some(self.rs.round) {
                let hashes_to = self
                    .rs
                    .proposal_block
                    .as_ref()
                    .is_some_and(|b| b.hashes_to(&block_id.hash));
                if hashes_to {
                    debug!(round = self.rs.round, "updating valid block from completed proposal");
                    self.rs.valid_round = Some(self.rs.round);
                    self.rs.valid_block = self.rs.proposal_block.clone();
                    self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
                    actions.push(publish(NodeEvent::ValidBlock {
                        height: self.rs.height,
                        round: self.rs.round,
                    }));
                }
            }
        }

        if self.rs.step <= Step::Propose && self.rs.is_proposal_complete() {
            self.enter_prevote(height, self.rs.round, actions);
            if maj23.is_some() {
                self.enter_precommit(height, self.rs.round, actions);
            }
        } else if self.rs.step == Step::Commit {
            // The block we were waiting on arrived; recover its randomness
            // before finalizing (blocks gossip without it).
            self.stamp_randomness_if_missing();
            self.try_finalize_commit(height, actions);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Vote ingestion
    // ═══════════════════════════════════════════════════════════════════════

    fn try_add_vote(&mut self, vote: Vote, peer_id: &PeerId, actions: &mut Vec<Action>) {
        match self.add_vote(vote, actions) {
            Ok(_) => {}
            Err(AddVoteError::HeightMismatch { vote, expected }) => {
                debug!(vote, expected, peer = %peer_id, "ignoring vote at wrong height");
            }
            Err(AddVoteError::ConflictingVote(evidence)) => {
                let own = self
                    .priv_validator
                    .as_ref()
                    .is_some_and(|kp| kp.address() == evidence.validator_address());
                if own {
                    error!(
                        height = evidence.height(),
                        "found conflicting vote from ourselves; was this validator state reset?"
                    );
                    return;
                }
                warn!(
                    validator = %evidence.validator_address(),
                    height = evidence.height(),
                    "conflicting votes, submitting evidence"
                );
                self.evidence_pool.add_evidence(*evidence);
            }
            Err(e) => {
                info!(peer = %peer_id, "error adding vote: {e}");
            }
        }
    }

    fn add_vote(&mut self, vote: Vote, actions: &mut Vec<Action>) -> Result<bool, AddVoteError> {
        debug!(
            height = vote.height,
            round = vote.round,
            step = %vote.vote_type,
            index = vote.validator_index,
            "adding vote"
        );

        // A precommit for the previous height? These come in while we wait
        // for the commit timeout.
        if vote.height + 1 == self.rs.height {
            if !(self.rs.step == Step::NewHeight && vote.vote_type == VoteType::Precommit) {
                return Err(AddVoteError::HeightMismatch {
                    vote: vote.height,
                    expected: self.rs.height,
                });
            }
            let Some(last_commit) = self.rs.last_commit.as_mut() else {
                return Err(AddVoteError::HeightMismatch {
                    vote: vote.height,
                    expected: self.rs.height,
                });
            };
            let added = last_commit.add_vote(vote.clone())?;
            if !added {
                return Ok(false);
            }
            info!(height = vote.height, "added straggler vote to last commit");
            actions.push(publish(NodeEvent::Vote { vote }));
            if self.config.skip_timeout_commit && self.rs.last_commit.as_ref().unwrap().has_all()
            {
                self.enter_new_round(self.rs.height, 0, actions);
            }
            return Ok(true);
        }

        // Other height mismatches are ignored.
        if vote.height != self.rs.height {
            return Err(AddVoteError::HeightMismatch {
                vote: vote.height,
                expected: self.rs.height,
            });
        }

        // Precommit partials must verify against the signer's public share.
        if vote.vote_type == VoteType::Precommit {
            if let Some(verifier) = self.verifier.as_ref() {
                let prev_random = self.previous_random();
                verifier.verify_share(
                    &vote.validator_address,
                    &prev_random,
                    &vote.bls_signature,
                )?;
            }
        }

        let height = self.rs.height;
        let vote_round = vote.round;
        let vote_type = vote.vote_type;
        let added = self.rs.votes.add_vote(vote.clone())?;
        if !added {
            return Ok(false);
        }
        actions.push(publish(NodeEvent::Vote { vote }));

        match vote_type {
            VoteType::Prevote => self.on_prevote_added(height, vote_round, actions),
            VoteType::Precommit => self.on_precommit_added(height, vote_round, actions),
        }
        Ok(true)
    }

    fn on_prevote_added(&mut self, height: u64, vote_round: u32, actions: &mut Vec<Action>) {
        let (maj23, has_any) = {
            let prevotes = self.rs.votes.prevotes(vote_round).expect("round tracked");
            (prevotes.two_thirds_majority(), prevotes.has_two_thirds_any())
        };

        if let Some(block_id) = maj23 {
            // There was a polka. Unlock if it points away from our lock:
            // `locked_round < vote_round <= round`.
            let locked_elsewhere = self.rs.locked_block.as_ref().is_some_and(|locked| {
                self.rs.locked_round < Some(vote_round)
                    && vote_round <= self.rs.round
                    && !locked.hashes_to(&block_id.hash)
            });
            if locked_elsewhere {
                info!(
                    locked_round = ?self.rs.locked_round,
                    pol_round = vote_round,
                    "unlocking because of a later polka"
                );
                self.rs.locked_round = None;
                self.rs.locked_block = None;
                self.rs.locked_block_parts = None;
                actions.push(publish(NodeEvent::Unlock {
                    height,
                    round: vote_round,
                }));
            }

            // Update Valid* if the polka is for a block we hold in this round.
            if !block_id.is_nil()
                && self.rs.valid_round < Some(vote_round)
                && vote_round == self.rs.round
            {
                let hashes_to = self
                    .rs
                    .proposal_block
                    .as_ref()
                    .is_some_and(|b| b.hashes_to(&block_id.hash));
                if hashes_to {
                    info!(round = vote_round, "updating valid block because of polka");
                    self.rs.valid_round = Some(vote_round);
                    self.rs.valid_block = self.rs.proposal_block.clone();
                    self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
                } else {
                    info!("polka for a block we don't have; fetching parts");
                    self.rs.proposal_block = None;
                }
                let header_matches = self
                    .rs
                    .proposal_block_parts
                    .as_ref()
                    .is_some_and(|p| p.has_header(&block_id.parts_header));
                if !header_matches {
                    self.rs.proposal_block_parts =
                        Some(PartSet::from_header(block_id.parts_header));
                }
                actions.push(publish(NodeEvent::ValidBlock {
                    height,
                    round: vote_round,
                }));
            }
        }

        if self.rs.round < vote_round && has_any {
            // Round skip: 2/3-any at a future round.
            self.enter_new_round(height, vote_round, actions);
        } else if self.rs.round == vote_round && Step::Prevote <= self.rs.step {
            if let Some(block_id) = maj23 {
                if self.rs.is_proposal_complete() || block_id.is_nil() {
                    self.enter_precommit(height, vote_round, actions);
                } else if has_any {
                    self.enter_prevote_wait(height, vote_round, actions);
                }
            } else if has_any {
                self.enter_prevote_wait(height, vote_round, actions);
            }
        } else if self
            .rs
            .proposal
            .as_ref()
            .is_some_and(|p| p.pol_round == Some(vote_round))
            && self.rs.is_proposal_complete()
        {
            // The proposal's POL has materialized.
            self.enter_prevote(height, self.rs.round, actions);
        }
    }

    fn on_precommit_added(&mut self, height: u64, vote_round: u32, actions: &mut Vec<Action>) {
        let (maj23, has_any, has_all) = {
            let precommits = self.rs.votes.precommits(vote_round).expect("round tracked");
            (
                precommits.two_thirds_majority(),
                precommits.has_two_thirds_any(),
                precommits.has_all(),
            )
        };

        if let Some(block_id) = maj23 {
            // The majority could be from a higher round; catch up first.
            self.enter_new_round(height, vote_round, actions);
            self.enter_precommit(height, vote_round, actions);
            if !block_id.is_nil() {
                self.enter_commit(height, vote_round, actions);
                if self.config.skip_timeout_commit && has_all {
                    self.enter_new_round(self.rs.height, 0, actions);
                }
            } else {
                self.enter_precommit_wait(height, vote_round, actions);
            }
        } else if self.rs.round <= vote_round && has_any {
            self.enter_new_round(height, vote_round, actions);
            self.enter_precommit_wait(height, vote_round, actions);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Step transitions
    // ═══════════════════════════════════════════════════════════════════════

    #[instrument(skip(self, actions))]
    fn enter_new_round(&mut self, height: u64, round: u32, actions: &mut Vec<Action>) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step != Step::NewHeight)
        {
            debug!(
                height = self.rs.height,
                round = self.rs.round,
                step = %self.rs.step,
                "enter_new_round: invalid args"
            );
            return;
        }
        info!(
            height = self.rs.height,
                round = self.rs.round,
                step = %self.rs.step,
            "entering new round"
        );

        // Copy-on-write: the frozen set stays byte-identical for the rounds
        // that already used it.
        if self.rs.round < round {
            let mut validators = self.rs.validators.clone();
            validators.increment_proposer_priority(round - self.rs.round);
            self.rs.validators = validators;
        }

        self.update_round_step(round, Step::NewRound);
        if round != 0 {
            debug!("resetting proposal info");
            self.rs.proposal = None;
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = None;
        }
        // Track the next round too, to allow round skipping.
        self.rs.votes.set_round(round + 1);
        self.rs.triggered_timeout_precommit = false;
        actions.push(publish(NodeEvent::NewRound { height, round }));

        let wait_for_txs =
            self.config.wait_for_txs() && round == 0 && !self.need_proof_block(height);
        if wait_for_txs {
            if self.config.create_empty_blocks_interval > Duration::ZERO {
                actions.push(Action::ScheduleTimeout {
                    info: TimeoutInfo {
                        duration: self.config.create_empty_blocks_interval,
                        height,
                        round,
                        step: Step::NewRound,
                    },
                });
            }
        } else {
            self.enter_propose(height, round, actions);
        }
    }

    /// True on the first height and whenever the previous block changed the
    /// app hash, in which case an empty "proof" block is proposed right away.
    fn need_proof_block(&self, height: u64) -> bool {
        if height == 1 {
            return true;
        }
        match self.block_store.load_block(height - 1) {
            Some(block) => block.header.app_hash != self.state.app_hash,
            None => true,
        }
    }

    #[instrument(skip(self, actions))]
    fn enter_propose(&mut self, height: u64, round: u32, actions: &mut Vec<Action>) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && Step::Propose <= self.rs.step)
        {
            debug!(
                height = self.rs.height,
                round = self.rs.round,
                step = %self.rs.step,
                "enter_propose: invalid args"
            );
            return;
        }
        info!(
            height = self.rs.height,
                round = self.rs.round,
                step = %self.rs.step,
            "entering propose"
        );

        // If the proposal does not arrive in time, prevote nil.
        actions.push(Action::ScheduleTimeout {
            info: TimeoutInfo {
                duration: self.config.propose(round),
                height,
                round,
                step: Step::Propose,
            },
        });

        if let Some(kp) = self.priv_validator.clone() {
            let address = kp.address();
            if self.rs.validators.has_address(&address) {
                if self.rs.validators.get_proposer().address == address {
                    info!("our turn to propose");
                    self.decide_proposal(height, round, &kp, actions);
                } else {
                    debug!(
                        proposer = %self.rs.validators.get_proposer().address,
                        "not our turn to propose"
                    );
                }
            } else {
                debug!("this node is not a validator");
            }
        }

        self.update_round_step(round, Step::Propose);
        if self.rs.is_proposal_complete() {
            self.enter_prevote(height, self.rs.round, actions);
        }
    }

    fn decide_proposal(
        &mut self,
        height: u64,
        round: u32,
        keypair: &KeyPair,
        actions: &mut Vec<Action>,
    ) {
        let (block, parts) = if let (Some(block), Some(parts)) =
            (self.rs.valid_block.clone(), self.rs.valid_block_parts.clone())
        {
            // A block already earned a polka; re-propose it.
            (block, parts)
        } else {
            match self.create_proposal_block(keypair) {
                Some(pair) => pair,
                None => return,
            }
        };

        // Flush the log first, so a replay recomputes the identical proposal
        // before re-signing anything.
        self.wal_flush();

        let block_id = block.block_id(&parts);
        let proposal = Proposal::sign_new(
            keypair,
            &self.state.chain_id,
            height,
            round,
            self.rs.valid_round,
            block_id,
            self.now_ms(),
        );
        info!(height, round, block = ?block_id.hash, "signed proposal");

        self.send_internal(ConsensusMessage::Proposal(proposal), actions);
        for part in parts.parts() {
            self.send_internal(
                ConsensusMessage::BlockPart {
                    height,
                    round,
                    part: part.clone(),
                },
                actions,
            );
        }
    }

    fn create_proposal_block(&self, keypair: &KeyPair) -> Option<(Block, PartSet)> {
        let commit = if self.rs.height == 1 {
            Commit::empty()
        } else if let Some(commit) = self
            .rs
            .last_commit
            .as_ref()
            .and_then(|votes| votes.make_commit())
        {
            commit
        } else {
            error!("cannot propose: no commit for the previous block");
            return None;
        };
        self.block_exec
            .create_proposal_block(self.rs.height, &self.state, commit, keypair.address())
    }

    #[instrument(skip(self, actions))]
    fn enter_prevote(&mut self, height: u64, round: u32, actions: &mut Vec<Action>) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && Step::Prevote <= self.rs.step)
        {
            debug!(
                height = self.rs.height,
                round = self.rs.round,
                step = %self.rs.step,
                "enter_prevote: invalid args"
            );
            return;
        }
        info!(
            height = self.rs.height,
                round = self.rs.round,
                step = %self.rs.step,
            "entering prevote"
        );

        self.do_prevote(height, round, actions);
        self.update_round_step(round, Step::Prevote);
        // 2/3-any prevotes will take us to PrevoteWait from add_vote.
    }

    fn do_prevote(&mut self, _height: u64, _round: u32, actions: &mut Vec<Action>) {
        // Locked: prevote the lock.
        if let (Some(block), Some(parts)) = (
            self.rs.locked_block.clone(),
            self.rs.locked_block_parts.clone(),
        ) {
            debug!("prevoting locked block");
            let block_id = block.block_id(&parts);
            self.sign_add_vote(VoteType::Prevote, block_id, actions);
            return;
        }

        // No proposal block: prevote nil.
        let Some(block) = self.rs.proposal_block.clone() else {
            debug!("no proposal block, prevoting nil");
            self.sign_add_vote(VoteType::Prevote, BlockId::nil(), actions);
            return;
        };

        // Invalid block: prevote nil.
        if let Err(e) = self.block_exec.validate_block(&self.state, &block) {
            warn!("proposal block is invalid, prevoting nil: {e}");
            self.sign_add_vote(VoteType::Prevote, BlockId::nil(), actions);
            return;
        }

        let parts = self
            .rs
            .proposal_block_parts
            .clone()
            .expect("complete proposal implies parts");
        let block_id = block.block_id(&parts);
        self.sign_add_vote(VoteType::Prevote, block_id, actions);
    }

    #[instrument(skip(self, actions))]
    fn enter_prevote_wait(&mut self, height: u64, round: u32, actions: &mut Vec<Action>) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && Step::PrevoteWait <= self.rs.step)
        {
            debug!(
                height = self.rs.height,
                round = self.rs.round,
                step = %self.rs.step,
                "enter_prevote_wait: invalid args"
            );
            return;
        }
        let has_any = self
            .rs
            .votes
            .prevotes(round)
            .is_some_and(|v| v.has_two_thirds_any());
        assert!(
            has_any,
            "enter_prevote_wait({height}/{round}) without 2/3-any prevotes"
        );
        info!("entering prevote wait");

        actions.push(Action::ScheduleTimeout {
            info: TimeoutInfo {
                duration: self.config.prevote(round),
                height,
                round,
                step: Step::PrevoteWait,
            },
        });
        self.update_round_step(round, Step::PrevoteWait);
    }

    #[instrument(skip(self, actions))]
    fn enter_precommit(&mut self, height: u64, round: u32, actions: &mut Vec<Action>) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && Step::Precommit <= self.rs.step)
        {
            debug!(
                height = self.rs.height,
                round = self.rs.round,
                step = %self.rs.step,
                "enter_precommit: invalid args"
            );
            return;
        }
        info!(
            height = self.rs.height,
                round = self.rs.round,
                step = %self.rs.step,
            "entering precommit"
        );

        let maj23 = self
            .rs
            .votes
            .prevotes(round)
            .and_then(|v| v.two_thirds_majority());

        // No polka: precommit nil.
        let Some(block_id) = maj23 else {
            if self.rs.locked_block.is_some() {
                info!("no polka while locked, precommitting nil");
            } else {
                info!("no polka, precommitting nil");
            }
            self.sign_add_vote(VoteType::Precommit, BlockId::nil(), actions);
            self.update_round_step(round, Step::Precommit);
            return;
        };

        actions.push(publish(NodeEvent::Polka { height, round }));
        let (pol_round, _) = self.rs.votes.pol_info().expect("polka observed above");
        assert!(
            pol_round >= round,
            "POL round {pol_round} behind precommit round {round}"
        );

        // Polka for nil: unlock and precommit nil.
        if block_id.is_nil() {
            if self.rs.locked_block.is_none() {
                info!("polka for nil");
            } else {
                info!("polka for nil while locked, unlocking");
                self.rs.locked_round = None;
                self.rs.locked_block = None;
                self.rs.locked_block_parts = None;
                actions.push(publish(NodeEvent::Unlock { height, round }));
            }
            self.sign_add_vote(VoteType::Precommit, BlockId::nil(), actions);
            self.update_round_step(round, Step::Precommit);
            return;
        }

        // Polka for our locked block: relock at this round.
        if self
            .rs
            .locked_block
            .as_ref()
            .is_some_and(|b| b.hashes_to(&block_id.hash))
        {
            info!("polka for the locked block, relocking");
            self.rs.locked_round = Some(round);
            actions.push(publish(NodeEvent::Relock { height, round }));
            self.sign_add_vote(VoteType::Precommit, block_id, actions);
            self.update_round_step(round, Step::Precommit);
            return;
        }

        // Polka for the proposal block: lock it.
        if self
            .rs
            .proposal_block
            .as_ref()
            .is_some_and(|b| b.hashes_to(&block_id.hash))
        {
            let block = self.rs.proposal_block.clone().expect("checked above");
            if let Err(e) = self.block_exec.validate_block(&self.state, &block) {
                panic!("polka for an invalid block: {e}");
            }
            info!(block = ?block_id.hash, "polka for the proposal block, locking");
            self.rs.locked_round = Some(round);
            self.rs.locked_block = Some(block);
            self.rs.locked_block_parts = self.rs.proposal_block_parts.clone();
            actions.push(publish(NodeEvent::Lock { height, round }));
            self.sign_add_vote(VoteType::Precommit, block_id, actions);
            self.update_round_step(round, Step::Precommit);
            return;
        }

        // Polka for a block we don't have: unlock, fetch it, precommit nil.
        info!(block = ?block_id.hash, "polka for an unknown block, unlocking");
        self.rs.locked_round = None;
        self.rs.locked_block = None;
        self.rs.locked_block_parts = None;
        let header_matches = self
            .rs
            .proposal_block_parts
            .as_ref()
            .is_some_and(|p| p.has_header(&block_id.parts_header));
        if !header_matches {
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = Some(PartSet::from_header(block_id.parts_header));
        }
        actions.push(publish(NodeEvent::Unlock { height, round }));
        self.sign_add_vote(VoteType::Precommit, BlockId::nil(), actions);
        self.update_round_step(round, Step::Precommit);
    }

    #[instrument(skip(self, actions))]
    fn enter_precommit_wait(&mut self, height: u64, round: u32, actions: &mut Vec<Action>) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.triggered_timeout_precommit)
        {
            debug!(
                height = self.rs.height,
                round = self.rs.round,
                triggered = self.rs.triggered_timeout_precommit,
                "enter_precommit_wait: invalid args"
            );
            return;
        }
        let has_any = self
            .rs
            .votes
            .precommits(round)
            .is_some_and(|v| v.has_two_thirds_any());
        assert!(
            has_any,
            "enter_precommit_wait({height}/{round}) without 2/3-any precommits"
        );
        info!("entering precommit wait");

        actions.push(Action::ScheduleTimeout {
            info: TimeoutInfo {
                duration: self.config.precommit(round),
                height,
                round,
                step: Step::PrecommitWait,
            },
        });
        self.rs.triggered_timeout_precommit = true;
    }

    #[instrument(skip(self, actions))]
    fn enter_commit(&mut self, height: u64, commit_round: u32, actions: &mut Vec<Action>) {
        if self.rs.height != height || Step::Commit <= self.rs.step {
            debug!(
                height = self.rs.height,
                round = self.rs.round,
                step = %self.rs.step,
                "enter_commit: invalid args"
            );
            return;
        }
        info!(
            height = self.rs.height,
                round = self.rs.round,
                step = %self.rs.step,
            "entering commit"
        );

        let block_id = self
            .rs
            .votes
            .precommits(commit_round)
            .and_then(|v| v.two_thirds_majority())
            .unwrap_or_else(|| panic!("enter_commit({height}/{commit_round}) without a 2/3 precommit majority"));

        // The Locked* fields no longer matter; move them over to the
        // proposal if they match the committed hash.
        if self
            .rs
            .locked_block
            .as_ref()
            .is_some_and(|b| b.hashes_to(&block_id.hash))
        {
            info!("commit is for the locked block, promoting it to proposal");
            self.rs.proposal_block = self.rs.locked_block.clone();
            self.rs.proposal_block_parts = self.rs.locked_block_parts.clone();
        }

        // Recover this block's randomness from the precommit partials. With
        // a 2/3 majority of honest partials, failure is impossible.
        let verifier = self
            .verifier
            .clone()
            .expect("commit reached without a BLS verifier");
        let prev_random = self.previous_random();
        let partials = self
            .rs
            .votes
            .precommits(commit_round)
            .expect("round tracked")
            .votes()
            .filter(|v| !v.bls_signature.is_empty())
            .map(|v| v.bls_signature.clone())
            .collect::<Vec<_>>();
        let random_data = verifier
            .recover(&prev_random, &partials)
            .unwrap_or_else(|e| panic!("failed to recover random data from precommits: {e}"));
        info!(random = ?beacon_types::Hash::of(&random_data), "recovered block randomness");
        if let Some(block) = self.rs.proposal_block.as_mut() {
            block.header.set_random_data(random_data);
        } else {
            debug!("no proposal block to stamp randomness on yet");
        }

        // If we don't have the committed block, set up to fetch it.
        let have_block = self
            .rs
            .proposal_block
            .as_ref()
            .is_some_and(|b| b.hashes_to(&block_id.hash));
        if !have_block {
            let header_matches = self
                .rs
                .proposal_block_parts
                .as_ref()
                .is_some_and(|p| p.has_header(&block_id.parts_header));
            if !header_matches {
                info!(commit = ?block_id.hash, "commit is for a block we don't know; waiting for parts");
                self.rs.proposal_block = None;
                self.rs.proposal_block_parts = Some(PartSet::from_header(block_id.parts_header));
                actions.push(publish(NodeEvent::ValidBlock {
                    height,
                    round: commit_round,
                }));
            }
        }

        // Keep rs.round unchanged; commit_round points at the precommits.
        self.rs.step = Step::Commit;
        self.rs.commit_round = Some(commit_round);
        self.rs.commit_time = self.now;
        self.try_finalize_commit(height, actions);
    }

    fn try_finalize_commit(&mut self, height: u64, actions: &mut Vec<Action>) {
        assert_eq!(
            self.rs.height, height,
            "try_finalize_commit at the wrong height"
        );

        let commit_round = self.rs.commit_round.expect("commit round set in enter_commit");
        let Some(block_id) = self
            .rs
            .votes
            .precommits(commit_round)
            .and_then(|v| v.two_thirds_majority())
            .filter(|id| !id.is_nil())
        else {
            error!("cannot finalize: no 2/3 precommit majority for a block");
            return;
        };
        let have_block = self
            .rs
            .proposal_block
            .as_ref()
            .is_some_and(|b| b.hashes_to(&block_id.hash));
        if !have_block {
            debug!(commit = ?block_id.hash, "cannot finalize yet: we don't have the block");
            return;
        }
        self.finalize_commit(height, actions);
    }

    /// Increment the height and move to `NewHeight`. Every check in here is
    /// an invariant; a failure means this node cannot trust its own state.
    fn finalize_commit(&mut self, height: u64, actions: &mut Vec<Action>) {
        if self.rs.height != height || self.rs.step != Step::Commit {
            debug!(
                height = self.rs.height,
                round = self.rs.round,
                step = %self.rs.step,
                "finalize_commit: invalid args"
            );
            return;
        }

        let commit_round = self.rs.commit_round.expect("commit round set");
        let precommits = self
            .rs
            .votes
            .precommits(commit_round)
            .expect("round tracked")
            .clone();
        let block_id = precommits
            .two_thirds_majority()
            .expect("cannot finalize without a 2/3 precommit majority");
        let block = self
            .rs
            .proposal_block
            .clone()
            .expect("cannot finalize without the block");
        let parts = self
            .rs
            .proposal_block_parts
            .clone()
            .expect("cannot finalize without block parts");

        assert!(
            parts.has_header(&block_id.parts_header),
            "finalize: proposal parts header does not match the commit"
        );
        assert!(
            block.hashes_to(&block_id.hash),
            "finalize: proposal block does not hash to the commit hash"
        );
        if let Err(e) = self.block_exec.validate_block(&self.state, &block) {
            panic!("2/3 committed an invalid block: {e}");
        }
        let prev_random = self.previous_random();
        let verifier = self.verifier.clone().expect("finalize without a verifier");
        if let Err(e) = verifier.verify_random_data(&prev_random, &block.header.random_data) {
            panic!("committed block carries invalid random data: {e}");
        }

        info!(
            height = block.height(),
            hash = ?block.hash(),
            txs = block.data.len(),
            "finalizing commit"
        );

        // Save to the block store before the EndHeight marker: replay after a
        // crash between the two re-applies the block from the store.
        if self.block_store.height() < block.height() {
            let seen_commit = precommits
                .make_commit()
                .expect("majority precommits make a commit");
            self.block_store
                .save_block(block.clone(), parts, seen_commit);
        } else {
            info!(height = block.height(), "block already stored, finalizing anyway");
        }

        // The durability boundary for this height.
        self.wal_write_sync(WalMessage::EndHeight { height });

        // Apply the block under the mempool lock: flush in-flight application
        // calls, commit, then update the mempool against the new height.
        let state_copy = self.state.clone();
        self.mempool.lock();
        self.mempool.flush_app_conn();
        let apply_result = self.block_exec.apply_block(state_copy, block_id, &block);
        let new_state = match apply_result {
            Ok(state) => {
                self.mempool.update(block.height(), &block.data);
                self.mempool.unlock();
                state
            }
            Err(e) => {
                self.mempool.unlock();
                // Continuing after an application failure risks signing from
                // an unknown state; the router halts on this panic and the
                // embedder decides whether to exit the process.
                panic!("failed to apply block at height {height}: {e}");
            }
        };

        self.evidence_pool.update(&block, &new_state);
        actions.push(publish(NodeEvent::NewBlock {
            height: block.height(),
            block_hash: block.hash(),
            random_hash: block.header.random_hash,
        }));
        actions.push(publish(NodeEvent::NewBlockHeader {
            height: block.height(),
            block_hash: block.hash(),
        }));

        self.update_to_state(new_state, actions);

        // Schedule round 0 of the next height.
        actions.push(self.schedule_round0());
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Height transitions
    // ═══════════════════════════════════════════════════════════════════════

    /// Reset the round state for the height after `state.last_block_height`.
    fn update_to_state(&mut self, state: ChainState, actions: &mut Vec<Action>) {
        if self.rs.commit_round.is_some() && self.rs.height != state.last_block_height {
            panic!(
                "update_to_state expected state at height {} but got {}",
                self.rs.height, state.last_block_height
            );
        }
        if !self.state.is_genesis() && self.state.last_block_height + 1 != self.rs.height {
            panic!(
                "inconsistent heights: state {} + 1 != round state {}",
                self.state.last_block_height, self.rs.height
            );
        }

        // A stale state (e.g. double delivery) is ignored.
        if !self.state.is_genesis() && state.last_block_height <= self.state.last_block_height {
            debug!(
                new = state.last_block_height + 1,
                old = self.state.last_block_height + 1,
                "ignoring update_to_state for stale height"
            );
            return;
        }

        let last_precommits = self.rs.commit_round.map(|round| {
            let precommits = self
                .rs
                .votes
                .precommits(round)
                .expect("commit round tracked")
                .clone();
            assert!(
                precommits.two_thirds_majority().is_some(),
                "update_to_state called but the last precommit set has no majority"
            );
            precommits
        });

        let height = state.last_block_height + 1;
        let validators_changed = self.state.validators.hash() != state.validators.hash();

        self.rs.height = height;
        self.rs.round = 0;
        self.rs.step = Step::NewHeight;
        self.rs.start_time = if self.rs.commit_time == Duration::ZERO {
            self.now + self.config.timeout_commit
        } else {
            self.rs.commit_time + self.config.timeout_commit
        };
        self.rs.validators = state.validators.clone();
        self.rs.proposal = None;
        self.rs.proposal_block = None;
        self.rs.proposal_block_parts = None;
        self.rs.locked_round = None;
        self.rs.locked_block = None;
        self.rs.locked_block_parts = None;
        self.rs.valid_round = None;
        self.rs.valid_block = None;
        self.rs.valid_block_parts = None;
        self.rs.votes = HeightVoteSet::new(state.chain_id.clone(), height, state.validators.clone());
        self.rs.commit_round = None;
        self.rs.last_commit = last_precommits;
        self.rs.last_validators = state.last_validators.clone();
        self.rs.triggered_timeout_precommit = false;

        if validators_changed {
            actions.push(publish(NodeEvent::ValidatorSetUpdates {
                validators: state.validators.clone(),
            }));
        }
        self.state = state;
    }

    /// Rebuild the last-commit vote set from the stored seen-commit, so a
    /// restarted node can still serve stragglers and propose.
    fn reconstruct_last_commit(&mut self) {
        if self.state.is_genesis() {
            return;
        }
        let Some(seen_commit) = self
            .block_store
            .load_seen_commit(self.state.last_block_height)
        else {
            return;
        };
        let Some(first) = seen_commit.votes().next() else {
            return;
        };
        let mut votes = VoteSet::new(
            self.state.chain_id.clone(),
            self.state.last_block_height,
            first.round,
            VoteType::Precommit,
            self.state.last_validators.clone(),
        );
        for vote in seen_commit.votes() {
            if let Err(e) = votes.add_vote(vote.clone()) {
                panic!("failed to reconstruct last commit: {e}");
            }
        }
        assert!(
            votes.two_thirds_majority().is_some(),
            "reconstructed last commit has no 2/3 majority"
        );
        self.rs.last_commit = Some(votes);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Signing and helpers
    // ═══════════════════════════════════════════════════════════════════════

    /// Sign a vote and feed it through the internal queue (and gossip).
    ///
    /// Does nothing if we have no key, we are not in the validator set, or no
    /// BLS verifier is installed yet.
    fn sign_add_vote(&mut self, vote_type: VoteType, block_id: BlockId, actions: &mut Vec<Action>) {
        let Some(keypair) = self.priv_validator.clone() else {
            return;
        };
        let Some((index, _)) = self.rs.validators.get_by_address(&keypair.address()) else {
            return;
        };
        let Some(verifier) = self.verifier.clone() else {
            debug!("no BLS verifier installed, not voting");
            return;
        };

        let bls_signature = if vote_type == VoteType::Precommit {
            let prev_random = self.previous_random();
            match verifier.sign(&prev_random) {
                Ok(partial) if !partial.is_empty() => partial,
                Ok(_) | Err(_) => {
                    error!(
                        height = self.rs.height,
                        round = self.rs.round,
                        "error producing BLS partial, not voting"
                    );
                    return;
                }
            }
        } else {
            vec![]
        };

        // Flush the log so a replay recomputes the same vote before the key
        // signs anything new.
        self.wal_flush();

        let vote = Vote::sign_new(
            &keypair,
            &self.state.chain_id,
            vote_type,
            self.rs.height,
            self.rs.round,
            block_id,
            self.now_ms(),
            index,
            bls_signature,
        );
        info!(
            height = vote.height,
            round = vote.round,
            step = %vote.vote_type,
            block = ?vote.block_id.hash,
            "signed and pushed vote"
        );
        self.send_internal(ConsensusMessage::Vote(vote), actions);
    }

    /// Internal messages go back through the router (which WAL-fsyncs them)
    /// and out to peers.
    fn send_internal(&self, msg: ConsensusMessage, actions: &mut Vec<Action>) {
        actions.push(Action::EnqueueInternal { msg: msg.clone() });
        actions.push(Action::Broadcast {
            message: OutboundMessage::Consensus(msg),
        });
    }

    /// The previous block's randomness; the chain bottoms out at the
    /// published genesis seed.
    fn previous_random(&self) -> Vec<u8> {
        if self.rs.height == 1 {
            return GENESIS_RANDOM_DATA.to_vec();
        }
        let prev = self
            .block_store
            .load_block(self.rs.height - 1)
            .unwrap_or_else(|| {
                panic!(
                    "block store is missing block {} below our height",
                    self.rs.height - 1
                )
            });
        prev.header.random_data
    }

    /// Stamp recovered randomness onto a proposal block that arrived after
    /// `enter_commit` (gossiped blocks carry none).
    fn stamp_randomness_if_missing(&mut self) {
        let needs_stamp = self
            .rs
            .proposal_block
            .as_ref()
            .is_some_and(|b| b.header.random_data.is_empty());
        if !needs_stamp {
            return;
        }
        let commit_round = self.rs.commit_round.expect("in commit step");
        let verifier = self.verifier.clone().expect("commit without verifier");
        let prev_random = self.previous_random();
        let partials: Vec<Vec<u8>> = self
            .rs
            .votes
            .precommits(commit_round)
            .expect("round tracked")
            .votes()
            .filter(|v| !v.bls_signature.is_empty())
            .map(|v| v.bls_signature.clone())
            .collect();
        let random_data = verifier
            .recover(&prev_random, &partials)
            .unwrap_or_else(|e| panic!("failed to recover random data from precommits: {e}"));
        if let Some(block) = self.rs.proposal_block.as_mut() {
            block.header.set_random_data(random_data);
        }
    }

    fn update_round_step(&mut self, round: u32, step: Step) {
        self.rs.round = round;
        self.rs.step = step;
    }

    fn schedule_round0(&self) -> Action {
        let duration = self.rs.start_time.saturating_sub(self.now);
        Action::ScheduleTimeout {
            info: TimeoutInfo {
                duration,
                height: self.rs.height,
                round: 0,
                step: Step::NewHeight,
            },
        }
    }

    fn wal_flush(&self) {
        let mut wal = self.wal.lock().expect("wal lock poisoned");
        if let Err(e) = wal.flush_and_sync() {
            panic!("failed to flush the WAL: {e}");
        }
    }

    fn wal_write_sync(&self, msg: WalMessage) {
        let mut wal = self.wal.lock().expect("wal lock poisoned");
        if let Err(e) = wal.write_sync(&msg) {
            panic!("failed to fsync the WAL: {e}");
        }
    }
}

fn publish(event: NodeEvent) -> Action {
    Action::Publish { event }
}

impl std::fmt::Debug for ConsensusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusState")
            .field("height", &self.rs.height)
            .field("round", &self.rs.round)
            .field("step", &self.rs.step)
            .field("has_verifier", &self.verifier.is_some())
            .finish()
    }
}
