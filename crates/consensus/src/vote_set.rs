//! Vote accumulation and 2/3 majority tracking.

use beacon_types::{
    BlockId, Commit, DuplicateVoteEvidence, ValidatorSet, Vote, VoteType,
};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::trace;

/// Why a vote was not added.
#[derive(Debug, Error)]
pub enum AddVoteError {
    #[error("vote height {vote} does not match {expected}")]
    HeightMismatch { vote: u64, expected: u64 },

    #[error("vote round {vote} does not match {expected}")]
    RoundMismatch { vote: u32, expected: u32 },

    #[error("vote type {vote} does not match {expected}")]
    TypeMismatch { vote: VoteType, expected: VoteType },

    #[error("validator index {0} not in the validator set")]
    UnknownValidator(u32),

    #[error("validator index {index} does not match address {address}")]
    AddressMismatch {
        index: u32,
        address: beacon_types::Address,
    },

    #[error("invalid vote signature from validator {0}")]
    InvalidSignature(beacon_types::Address),

    #[error("conflicting vote from validator {}", .0.validator_address())]
    ConflictingVote(Box<DuplicateVoteEvidence>),

    #[error("invalid BLS randomness share on precommit: {0}")]
    InvalidBlsShare(#[from] beacon_threshold::ThresholdError),

    #[error("no round state for round {0}")]
    UnknownRound(u32),
}

/// Collects the votes of one (height, round, step) and watches for a 2/3
/// voting-power majority.
#[derive(Debug, Clone)]
pub struct VoteSet {
    chain_id: String,
    height: u64,
    round: u32,
    vote_type: VoteType,
    validators: ValidatorSet,
    /// One slot per validator index.
    votes: Vec<Option<Vote>>,
    /// Accumulated voting power per block id.
    power_by_block: BTreeMap<BlockId, u64>,
    total_power: u64,
    /// The first block id to cross 2/3 of the total power, if any.
    maj23: Option<BlockId>,
}

impl VoteSet {
    pub fn new(
        chain_id: impl Into<String>,
        height: u64,
        round: u32,
        vote_type: VoteType,
        validators: ValidatorSet,
    ) -> Self {
        VoteSet {
            chain_id: chain_id.into(),
            height,
            round,
            vote_type,
            votes: vec![None; validators.size()],
            power_by_block: BTreeMap::new(),
            total_power: 0,
            maj23: None,
            validators,
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    /// Add a vote after authenticating it.
    ///
    /// Returns `Ok(false)` for an exact duplicate. A second, different vote
    /// from the same validator is equivocation and surfaces both votes.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, AddVoteError> {
        if vote.height != self.height {
            return Err(AddVoteError::HeightMismatch {
                vote: vote.height,
                expected: self.height,
            });
        }
        if vote.round != self.round {
            return Err(AddVoteError::RoundMismatch {
                vote: vote.round,
                expected: self.round,
            });
        }
        if vote.vote_type != self.vote_type {
            return Err(AddVoteError::TypeMismatch {
                vote: vote.vote_type,
                expected: self.vote_type,
            });
        }

        let validator = self
            .validators
            .get_by_index(vote.validator_index)
            .ok_or(AddVoteError::UnknownValidator(vote.validator_index))?;
        if validator.address != vote.validator_address {
            return Err(AddVoteError::AddressMismatch {
                index: vote.validator_index,
                address: vote.validator_address,
            });
        }
        if !vote.verify(&self.chain_id, &validator.pub_key) {
            return Err(AddVoteError::InvalidSignature(vote.validator_address));
        }

        let slot = &mut self.votes[vote.validator_index as usize];
        if let Some(existing) = slot {
            if *existing == vote {
                return Ok(false);
            }
            // Same signer, same (height, round, step), different content.
            return Err(AddVoteError::ConflictingVote(Box::new(
                DuplicateVoteEvidence::new(existing.clone(), vote),
            )));
        }

        let power = validator.voting_power;
        let block_power = self.power_by_block.entry(vote.block_id).or_insert(0);
        *block_power += power;
        if self.maj23.is_none() && *block_power >= self.validators.quorum_power() {
            trace!(
                height = self.height,
                round = self.round,
                step = %self.vote_type,
                block = ?vote.block_id.hash,
                "2/3 majority reached"
            );
            self.maj23 = Some(vote.block_id);
        }
        self.total_power += power;
        *slot = Some(vote);
        Ok(true)
    }

    /// The block id (possibly nil) holding a 2/3 majority, if any.
    pub fn two_thirds_majority(&self) -> Option<BlockId> {
        self.maj23
    }

    /// True once any mix of votes totals more than 2/3 of the power.
    pub fn has_two_thirds_any(&self) -> bool {
        self.total_power >= self.validators.quorum_power()
    }

    /// True when every validator has voted.
    pub fn has_all(&self) -> bool {
        self.votes.iter().all(|v| v.is_some())
    }

    /// All votes present, in validator order.
    pub fn votes(&self) -> impl Iterator<Item = &Vote> {
        self.votes.iter().flatten()
    }

    /// Build the commit for the majority block.
    ///
    /// Only votes for the committed block are included; slots of validators
    /// who voted otherwise (or not at all) stay empty.
    pub fn make_commit(&self) -> Option<Commit> {
        let maj = self.maj23?;
        if maj.is_nil() {
            return None;
        }
        let precommits = self
            .votes
            .iter()
            .map(|slot| slot.clone().filter(|v| v.block_id == maj))
            .collect();
        Some(Commit {
            block_id: maj,
            precommits,
        })
    }
}
