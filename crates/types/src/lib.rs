//! Core types for beacon consensus.
//!
//! This crate provides the foundational types used throughout the consensus
//! implementation:
//!
//! - **Primitives**: Hash, keys, signatures, addresses
//! - **Validators**: `Validator`, `ValidatorSet` with deterministic proposer rotation
//! - **Consensus types**: `Block`, `Vote`, `Proposal`, `Commit`, `PartSet`
//! - **DKG wire envelope**: `DkgMessage`
//!
//! # Design Philosophy
//!
//! This crate is self-contained and does not depend on any other workspace
//! crates, making it the foundation layer. All wire types encode
//! deterministically (bincode with fixed-width integers), so signatures over
//! their canonical forms are reproducible byte-for-byte.

mod block;
mod chain;
mod crypto;
mod dkg;
mod evidence;
mod hash;
mod part_set;
mod proposal;
mod validator;
mod vote;

pub use block::{Block, BlockId, Commit, Header, Tx, GENESIS_RANDOM_DATA};
pub use chain::ChainState;
pub use crypto::{Address, KeyPair, PublicKey, Signature};
pub use dkg::{DkgMessage, DkgMessageKind};
pub use evidence::DuplicateVoteEvidence;
pub use hash::{sha256, Hash};
pub use part_set::{Part, PartSet, PartSetError, PartSetHeader, BLOCK_PART_SIZE};
pub use proposal::Proposal;
pub use validator::{Validator, ValidatorSet};
pub use vote::{Vote, VoteType};

/// Encode a wire or WAL value deterministically.
///
/// Bincode's default options use fixed-width little-endian integers, so the
/// encoding is reproducible byte-for-byte across nodes and restarts.
pub fn wire_encode<T: serde::Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("serialization of wire types is infallible")
}

/// Decode a value produced by [`wire_encode`].
pub fn wire_decode<'a, T: serde::Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}
