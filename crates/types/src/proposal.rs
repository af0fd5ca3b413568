//! Block proposals.

use crate::block::BlockId;
use crate::crypto::{KeyPair, PublicKey, Signature};
use serde::{Deserialize, Serialize};

/// A signed proposal for a block at (height, round).
///
/// `pol_round` names the round of the proof-of-lock (the prevote majority)
/// that justifies re-proposing a valid block from an earlier round, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub height: u64,
    pub round: u32,
    pub pol_round: Option<u32>,
    pub block_id: BlockId,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: u64,
    pub signature: Signature,
}

#[derive(Serialize)]
struct CanonicalProposal<'a> {
    chain_id: &'a str,
    height: u64,
    round: u32,
    pol_round: Option<u32>,
    block_id: BlockId,
    timestamp: u64,
}

impl Proposal {
    pub fn sign_new(
        keypair: &KeyPair,
        chain_id: &str,
        height: u64,
        round: u32,
        pol_round: Option<u32>,
        block_id: BlockId,
        timestamp: u64,
    ) -> Self {
        let sign_bytes = canonical_bytes(chain_id, height, round, pol_round, block_id, timestamp);
        Proposal {
            height,
            round,
            pol_round,
            block_id,
            timestamp,
            signature: keypair.sign(&sign_bytes),
        }
    }

    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        canonical_bytes(
            chain_id,
            self.height,
            self.round,
            self.pol_round,
            self.block_id,
            self.timestamp,
        )
    }

    pub fn verify(&self, chain_id: &str, pub_key: &PublicKey) -> bool {
        pub_key.verify(&self.sign_bytes(chain_id), &self.signature)
    }
}

fn canonical_bytes(
    chain_id: &str,
    height: u64,
    round: u32,
    pol_round: Option<u32>,
    block_id: BlockId,
    timestamp: u64,
) -> Vec<u8> {
    crate::wire_encode(&CanonicalProposal {
        chain_id,
        height,
        round,
        pol_round,
        block_id,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proposal_signature_verifies() {
        let kp = KeyPair::from_seed(&[8u8; 32]);
        let proposal =
            Proposal::sign_new(&kp, "test-chain", 7, 1, None, BlockId::nil(), 55);
        assert!(proposal.verify("test-chain", &kp.public_key()));

        let other = KeyPair::from_seed(&[9u8; 32]);
        assert!(!proposal.verify("test-chain", &other.public_key()));
    }
}
