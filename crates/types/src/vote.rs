//! Consensus votes.

use crate::block::BlockId;
use crate::crypto::{Address, KeyPair, PublicKey, Signature};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The two voting steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VoteType {
    Prevote,
    Precommit,
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteType::Prevote => write!(f, "prevote"),
            VoteType::Precommit => write!(f, "precommit"),
        }
    }
}

/// A signed vote for a block (or nil) at a given height, round and step.
///
/// Precommits additionally carry a BLS partial signature over the previous
/// block's randomness; prevotes leave it empty. The ordinary signature
/// authenticates the whole vote, partial included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub vote_type: VoteType,
    pub height: u64,
    pub round: u32,
    pub block_id: BlockId,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: u64,
    pub validator_address: Address,
    pub validator_index: u32,
    pub signature: Signature,
    /// BLS partial over the previous block's randomness (precommits only).
    pub bls_signature: Vec<u8>,
}

/// The byte string a validator signs for a vote. Chain-id scoped so votes
/// cannot be replayed across chains.
#[derive(Serialize)]
struct CanonicalVote<'a> {
    chain_id: &'a str,
    vote_type: VoteType,
    height: u64,
    round: u32,
    block_id: BlockId,
    timestamp: u64,
    bls_signature: &'a [u8],
}

impl Vote {
    /// Construct and sign a vote.
    #[allow(clippy::too_many_arguments)]
    pub fn sign_new(
        keypair: &KeyPair,
        chain_id: &str,
        vote_type: VoteType,
        height: u64,
        round: u32,
        block_id: BlockId,
        timestamp: u64,
        validator_index: u32,
        bls_signature: Vec<u8>,
    ) -> Self {
        let sign_bytes = canonical_bytes(
            chain_id,
            vote_type,
            height,
            round,
            block_id,
            timestamp,
            &bls_signature,
        );
        Vote {
            vote_type,
            height,
            round,
            block_id,
            timestamp,
            validator_address: keypair.address(),
            validator_index,
            signature: keypair.sign(&sign_bytes),
            bls_signature,
        }
    }

    /// The canonical bytes this vote's signature covers.
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        canonical_bytes(
            chain_id,
            self.vote_type,
            self.height,
            self.round,
            self.block_id,
            self.timestamp,
            &self.bls_signature,
        )
    }

    /// Verify the ordinary signature against the claimed validator key.
    pub fn verify(&self, chain_id: &str, pub_key: &PublicKey) -> bool {
        pub_key.address() == self.validator_address
            && pub_key.verify(&self.sign_bytes(chain_id), &self.signature)
    }

    /// True if this vote is for nil.
    pub fn is_nil(&self) -> bool {
        self.block_id.is_nil()
    }
}

fn canonical_bytes(
    chain_id: &str,
    vote_type: VoteType,
    height: u64,
    round: u32,
    block_id: BlockId,
    timestamp: u64,
    bls_signature: &[u8],
) -> Vec<u8> {
    crate::wire_encode(&CanonicalVote {
        chain_id,
        vote_type,
        height,
        round,
        block_id,
        timestamp,
        bls_signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> KeyPair {
        KeyPair::from_seed(&[5u8; 32])
    }

    #[test]
    fn vote_signature_verifies() {
        let kp = keypair();
        let vote = Vote::sign_new(
            &kp,
            "test-chain",
            VoteType::Prevote,
            3,
            0,
            BlockId::nil(),
            123,
            0,
            vec![],
        );
        assert!(vote.verify("test-chain", &kp.public_key()));
        assert!(!vote.verify("other-chain", &kp.public_key()));
    }

    #[test]
    fn signature_covers_bls_partial() {
        let kp = keypair();
        let mut vote = Vote::sign_new(
            &kp,
            "test-chain",
            VoteType::Precommit,
            3,
            0,
            BlockId::nil(),
            123,
            0,
            b"partial".to_vec(),
        );
        assert!(vote.verify("test-chain", &kp.public_key()));
        vote.bls_signature = b"tampered".to_vec();
        assert!(!vote.verify("test-chain", &kp.public_key()));
    }
}
