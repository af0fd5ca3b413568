//! Committed chain state.

use crate::block::BlockId;
use crate::hash::Hash;
use crate::validator::ValidatorSet;
use serde::{Deserialize, Serialize};

/// The state of the chain after the last committed block. Handed to the
/// consensus engine at startup and replaced on every commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    pub chain_id: String,
    pub last_block_height: u64,
    pub last_block_id: BlockId,
    /// Milliseconds since the UNIX epoch; zero at genesis.
    pub last_block_time: u64,
    /// Validators for the next block.
    pub validators: ValidatorSet,
    /// Validators that signed the last block.
    pub last_validators: ValidatorSet,
    /// Application state hash after the last block.
    pub app_hash: Hash,
}

impl ChainState {
    /// Genesis state: no blocks committed yet.
    pub fn genesis(chain_id: impl Into<String>, validators: ValidatorSet) -> Self {
        ChainState {
            chain_id: chain_id.into(),
            last_block_height: 0,
            last_block_id: BlockId::nil(),
            last_block_time: 0,
            last_validators: validators.clone(),
            validators,
            app_hash: Hash::ZERO,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.last_block_height == 0
    }
}
