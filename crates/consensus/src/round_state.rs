//! Per-height consensus state.

use crate::height_vote_set::HeightVoteSet;
use crate::vote_set::VoteSet;
use beacon_core::Step;
use beacon_types::{Block, PartSet, Proposal, ValidatorSet};
use std::time::Duration;

/// Everything the state machine tracks for the height in progress.
///
/// Created on entry to `NewHeight`, mutated only by the router loop, torn
/// down when `update_to_state` advances the height. External readers observe
/// via an immutable borrow; no lock is involved.
///
/// Invariants: `locked_round <= valid_round <= round` (where set); a locked
/// block always had a prevote 2/3 majority at `locked_round`; `step` is
/// monotone non-decreasing within a (height, round).
#[derive(Debug)]
pub struct RoundState {
    pub height: u64,
    pub round: u32,
    pub step: Step,
    /// When round 0 of this height may start.
    pub start_time: Duration,
    /// When the commit for this height was reached.
    pub commit_time: Duration,
    pub validators: ValidatorSet,

    pub proposal: Option<Proposal>,
    pub proposal_block: Option<Block>,
    pub proposal_block_parts: Option<PartSet>,

    pub locked_round: Option<u32>,
    pub locked_block: Option<Block>,
    pub locked_block_parts: Option<PartSet>,

    /// Most recent round with a polka for a block we hold.
    pub valid_round: Option<u32>,
    pub valid_block: Option<Block>,
    pub valid_block_parts: Option<PartSet>,

    pub votes: HeightVoteSet,
    pub commit_round: Option<u32>,
    /// Precommits that justified the previous block.
    pub last_commit: Option<VoteSet>,
    pub last_validators: ValidatorSet,
    pub triggered_timeout_precommit: bool,
}

impl RoundState {
    /// True once both the proposal and its full block are present.
    pub fn is_proposal_complete(&self) -> bool {
        self.proposal.is_some() && self.proposal_block.is_some()
    }
}
