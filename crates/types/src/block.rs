//! Blocks, headers, and commits.

use crate::crypto::Address;
use crate::hash::Hash;
use crate::part_set::{PartSet, PartSetHeader};
use crate::vote::Vote;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Published seed for the randomness chain: block 1's randomness is the
/// threshold signature over this constant.
pub const GENESIS_RANDOM_DATA: &[u8] = b"beacon genesis randomness seed v1";

/// A single opaque transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx(pub Vec<u8>);

impl Tx {
    pub fn hash(&self) -> Hash {
        Hash::of(&self.0)
    }
}

/// References a block by hash plus the header of its part set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct BlockId {
    pub hash: Hash,
    pub parts_header: PartSetHeader,
}

impl BlockId {
    /// The nil block reference used by nil votes.
    pub fn nil() -> Self {
        BlockId::default()
    }

    pub fn is_nil(&self) -> bool {
        self.hash.is_zero() && self.parts_header.is_zero()
    }
}

/// Block header.
///
/// `random_data` is the threshold signature recovered from this block's own
/// precommit partials over the previous block's randomness. It is stamped
/// onto the header at commit time, after voting has finished, so it is
/// excluded from the block hash along with `random_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub chain_id: String,
    pub height: u64,
    /// Proposer wall clock, milliseconds since the UNIX epoch.
    pub time: u64,
    pub last_block_id: BlockId,
    pub proposer_address: Address,
    pub validators_hash: Hash,
    /// Application state hash after the previous block.
    pub app_hash: Hash,
    pub data_hash: Hash,
    pub last_commit_hash: Hash,
    /// Recovered randomness for this block; empty until commit.
    pub random_data: Vec<u8>,
    /// SHA-256 of `random_data`; zero until commit.
    pub random_hash: Hash,
}

impl Header {
    /// Block hash. Covers every field except the randomness pair, which is
    /// only known after the precommits are in.
    pub fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update((self.chain_id.len() as u64).to_le_bytes());
        hasher.update(self.chain_id.as_bytes());
        hasher.update(self.height.to_le_bytes());
        hasher.update(self.time.to_le_bytes());
        hasher.update(self.last_block_id.hash.as_bytes());
        hasher.update(self.last_block_id.parts_header.total.to_le_bytes());
        hasher.update(self.last_block_id.parts_header.hash.as_bytes());
        hasher.update(self.proposer_address.as_bytes());
        hasher.update(self.validators_hash.as_bytes());
        hasher.update(self.app_hash.as_bytes());
        hasher.update(self.data_hash.as_bytes());
        hasher.update(self.last_commit_hash.as_bytes());
        Hash(hasher.finalize().into())
    }

    /// Stamp recovered randomness onto the header.
    pub fn set_random_data(&mut self, random_data: Vec<u8>) {
        self.random_hash = Hash::of(&random_data);
        self.random_data = random_data;
    }
}

/// The precommits that justified the previous block, embedded in the current
/// block for light-client verification and randomness recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub block_id: BlockId,
    /// One slot per validator index; `None` where the validator did not sign.
    pub precommits: Vec<Option<Vote>>,
}

impl Commit {
    /// An empty commit (used for the first block only).
    pub fn empty() -> Self {
        Commit {
            block_id: BlockId::nil(),
            precommits: vec![],
        }
    }

    pub fn hash(&self) -> Hash {
        Hash::of(&crate::wire_encode(self))
    }

    /// Iterate the present precommit votes.
    pub fn votes(&self) -> impl Iterator<Item = &Vote> {
        self.precommits.iter().flatten()
    }
}

/// A block: header, transactions, and the previous height's commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub data: Vec<Tx>,
    pub last_commit: Commit,
}

impl Block {
    /// Assemble a block, filling in the derived header hashes.
    pub fn new(mut header: Header, data: Vec<Tx>, last_commit: Commit) -> Self {
        header.data_hash = hash_txs(&data);
        header.last_commit_hash = last_commit.hash();
        Block {
            header,
            data,
            last_commit,
        }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// True if this block hashes to `hash`.
    pub fn hashes_to(&self, hash: &Hash) -> bool {
        self.hash() == *hash
    }

    /// Serialize and split into gossip parts.
    pub fn make_part_set(&self) -> PartSet {
        PartSet::from_data(&crate::wire_encode(self))
    }

    /// The block id for this block given its part set.
    pub fn block_id(&self, parts: &PartSet) -> BlockId {
        BlockId {
            hash: self.hash(),
            parts_header: parts.header(),
        }
    }
}

fn hash_txs(txs: &[Tx]) -> Hash {
    let mut hasher = Sha256::new();
    for tx in txs {
        hasher.update(tx.hash().as_bytes());
    }
    Hash(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Header {
        Header {
            chain_id: "test-chain".into(),
            height: 5,
            time: 1_000,
            last_block_id: BlockId::nil(),
            proposer_address: Address([1; 20]),
            validators_hash: Hash::of(b"vals"),
            app_hash: Hash::of(b"app"),
            data_hash: Hash::ZERO,
            last_commit_hash: Hash::ZERO,
            random_data: vec![],
            random_hash: Hash::ZERO,
        }
    }

    #[test]
    fn block_hash_excludes_randomness() {
        let mut a = header();
        let hash_before = a.hash();
        a.set_random_data(b"recovered".to_vec());
        assert_eq!(a.hash(), hash_before);
        assert_eq!(a.random_hash, Hash::of(b"recovered"));
    }

    #[test]
    fn block_hash_covers_height() {
        let a = header();
        let mut b = header();
        b.height += 1;
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn block_roundtrips_through_parts() {
        let block = Block::new(header(), vec![Tx(b"tx1".to_vec())], Commit::empty());
        let parts = block.make_part_set();
        let bytes = parts.reassemble().unwrap();
        let decoded: Block = crate::wire_decode(&bytes).unwrap();
        assert_eq!(decoded, block);
    }
}
