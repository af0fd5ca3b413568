//! Misbehavior evidence.

use crate::crypto::Address;
use crate::vote::Vote;
use serde::{Deserialize, Serialize};

/// Two conflicting signed votes from the same validator at the same height,
/// round and step. Proof of equivocation, surfaced to the evidence pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateVoteEvidence {
    pub vote_a: Vote,
    pub vote_b: Vote,
}

impl DuplicateVoteEvidence {
    pub fn new(vote_a: Vote, vote_b: Vote) -> Self {
        DuplicateVoteEvidence { vote_a, vote_b }
    }

    pub fn validator_address(&self) -> Address {
        self.vote_a.validator_address
    }

    pub fn height(&self) -> u64 {
        self.vote_a.height
    }
}
