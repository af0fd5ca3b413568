//! Per-height vote bookkeeping across rounds.

use crate::vote_set::{AddVoteError, VoteSet};
use beacon_types::{BlockId, ValidatorSet, Vote, VoteType};
use std::collections::BTreeMap;

/// Prevotes and precommits for every round of one height.
///
/// Tracks the current round plus one ahead, so 2/3-any detection at `r + 1`
/// can trigger round skipping.
#[derive(Debug, Clone)]
pub struct HeightVoteSet {
    chain_id: String,
    height: u64,
    validators: ValidatorSet,
    round: u32,
    rounds: BTreeMap<u32, RoundVotes>,
}

#[derive(Debug, Clone)]
struct RoundVotes {
    prevotes: VoteSet,
    precommits: VoteSet,
}

impl HeightVoteSet {
    pub fn new(chain_id: impl Into<String>, height: u64, validators: ValidatorSet) -> Self {
        let chain_id = chain_id.into();
        let mut hvs = HeightVoteSet {
            chain_id,
            height,
            validators,
            round: 0,
            rounds: BTreeMap::new(),
        };
        hvs.ensure_round(0);
        hvs.ensure_round(1);
        hvs
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    /// Advance to `round`, also tracking `round + 1` for round skipping.
    pub fn set_round(&mut self, round: u32) {
        self.ensure_round(round.saturating_sub(1));
        self.ensure_round(round);
        if let Some(next) = round.checked_add(1) {
            self.ensure_round(next);
        }
        self.round = round;
    }

    fn ensure_round(&mut self, round: u32) {
        self.rounds.entry(round).or_insert_with(|| RoundVotes {
            prevotes: VoteSet::new(
                self.chain_id.clone(),
                self.height,
                round,
                VoteType::Prevote,
                self.validators.clone(),
            ),
            precommits: VoteSet::new(
                self.chain_id.clone(),
                self.height,
                round,
                VoteType::Precommit,
                self.validators.clone(),
            ),
        });
    }

    /// Route a vote into its (round, step) set.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, AddVoteError> {
        // Votes for rounds we are not yet tracking create the set on demand;
        // peers can legitimately run ahead of us.
        self.ensure_round(vote.round);
        let round = self
            .rounds
            .get_mut(&vote.round)
            .ok_or(AddVoteError::UnknownRound(vote.round))?;
        match vote.vote_type {
            VoteType::Prevote => round.prevotes.add_vote(vote),
            VoteType::Precommit => round.precommits.add_vote(vote),
        }
    }

    pub fn prevotes(&self, round: u32) -> Option<&VoteSet> {
        self.rounds.get(&round).map(|r| &r.prevotes)
    }

    pub fn precommits(&self, round: u32) -> Option<&VoteSet> {
        self.rounds.get(&round).map(|r| &r.precommits)
    }

    /// The most recent round with a prevote 2/3 majority (the proof-of-lock),
    /// if any.
    pub fn pol_info(&self) -> Option<(u32, BlockId)> {
        self.rounds
            .iter()
            .rev()
            .find_map(|(round, votes)| votes.prevotes.two_thirds_majority().map(|id| (*round, id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_types::{Hash, KeyPair, PartSetHeader, Validator};

    const CHAIN: &str = "test-chain";

    fn setup() -> (Vec<KeyPair>, HeightVoteSet) {
        let keys: Vec<KeyPair> = (0..4).map(|i| KeyPair::from_seed(&[i + 1; 32])).collect();
        let validators: Vec<Validator> = keys
            .iter()
            .map(|k| Validator::new(k.public_key(), 1))
            .collect();
        let set = ValidatorSet::new(validators);
        let keys = set
            .validators()
            .iter()
            .map(|v| {
                keys.iter()
                    .find(|k| k.address() == v.address)
                    .unwrap()
                    .clone()
            })
            .collect();
        (keys, HeightVoteSet::new(CHAIN, 1, set))
    }

    fn vote(keys: &[KeyPair], index: u32, round: u32, vote_type: VoteType) -> Vote {
        let id = BlockId {
            hash: Hash::of(b"block"),
            parts_header: PartSetHeader {
                total: 1,
                hash: Hash::of(b"parts"),
            },
        };
        Vote::sign_new(
            &keys[index as usize],
            CHAIN,
            vote_type,
            1,
            round,
            id,
            10,
            index,
            vec![],
        )
    }

    #[test]
    fn routes_by_round_and_type() {
        let (keys, mut hvs) = setup();
        hvs.add_vote(vote(&keys, 0, 0, VoteType::Prevote)).unwrap();
        hvs.add_vote(vote(&keys, 1, 0, VoteType::Precommit)).unwrap();
        assert_eq!(hvs.prevotes(0).unwrap().votes().count(), 1);
        assert_eq!(hvs.precommits(0).unwrap().votes().count(), 1);
    }

    #[test]
    fn future_round_votes_are_tracked() {
        let (keys, mut hvs) = setup();
        // Round 5 is far ahead of the tracked window; the set is created.
        hvs.add_vote(vote(&keys, 0, 5, VoteType::Precommit)).unwrap();
        assert_eq!(hvs.precommits(5).unwrap().votes().count(), 1);
    }

    #[test]
    fn pol_info_finds_latest_majority() {
        let (keys, mut hvs) = setup();
        for i in 0..3 {
            hvs.add_vote(vote(&keys, i, 0, VoteType::Prevote)).unwrap();
        }
        hvs.set_round(2);
        for i in 0..3 {
            hvs.add_vote(vote(&keys, i, 2, VoteType::Prevote)).unwrap();
        }
        let (round, _) = hvs.pol_info().unwrap();
        assert_eq!(round, 2);
    }
}
