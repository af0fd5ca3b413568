//! External collaborator interfaces.
//!
//! The consensus core consumes these; real implementations (application
//! connection, persistent stores) live outside this workspace's scope, with
//! mocks in the tests.

use beacon_types::{
    Address, Block, BlockId, ChainState, Commit, DuplicateVoteEvidence, PartSet, Tx,
};
use thiserror::Error;

/// A block failed application-level validation.
#[derive(Debug, Error)]
#[error("block validation failed: {0}")]
pub struct ValidationError(pub String);

/// The application failed while applying a committed block. Fatal.
#[derive(Debug, Error)]
#[error("apply block failed: {0}")]
pub struct FatalAppError(pub String);

/// Builds, validates, and applies blocks against the application.
pub trait BlockExecutor: Send + Sync {
    /// Build the next proposal block. `None` when nothing can be proposed
    /// (e.g. no commit for the previous block yet).
    fn create_proposal_block(
        &self,
        height: u64,
        state: &ChainState,
        last_commit: Commit,
        proposer: Address,
    ) -> Option<(Block, PartSet)>;

    fn validate_block(&self, state: &ChainState, block: &Block) -> Result<(), ValidationError>;

    /// Apply a committed block, returning the next chain state.
    fn apply_block(
        &self,
        state: ChainState,
        block_id: BlockId,
        block: &Block,
    ) -> Result<ChainState, FatalAppError>;
}

/// The mempool surface the core needs: the lock held around the
/// application-commit critical section, plus the post-commit update.
pub trait Mempool: Send + Sync {
    fn lock(&self);
    fn unlock(&self);
    /// Flush in-flight application calls before committing.
    fn flush_app_conn(&self);
    /// Remove committed transactions and revalidate the rest.
    fn update(&self, height: u64, txs: &[Tx]);
}

/// Receives misbehavior evidence.
pub trait EvidencePool: Send + Sync {
    fn add_evidence(&self, evidence: DuplicateVoteEvidence);
    fn pending_evidence(&self) -> Vec<DuplicateVoteEvidence>;
    fn update(&self, block: &Block, state: &ChainState);
}

/// Committed block storage.
pub trait BlockStore: Send + Sync {
    /// Height of the latest stored block (0 when empty).
    fn height(&self) -> u64;
    fn save_block(&self, block: Block, parts: PartSet, seen_commit: Commit);
    fn load_block(&self, height: u64) -> Option<Block>;
    /// The precommits this node saw justify the block at `height`. May
    /// differ from the last-commit embedded in the next block.
    fn load_seen_commit(&self, height: u64) -> Option<Commit>;
}
