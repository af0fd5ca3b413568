//! The beacon consensus core.
//!
//! A round-based BFT state machine committing a totally ordered chain of
//! blocks, with threshold-BLS randomness woven through the vote path: each
//! precommit carries a partial signature over the previous block's
//! randomness, and each committed block reveals the recovered threshold
//! signature.
//!
//! # Architecture
//!
//! [`ConsensusState`] is a synchronous state machine in the `Event` →
//! `Vec<Action>` style: the router loop feeds it messages, timeouts, and
//! mempool signals; it returns broadcasts, timeout tickets, and
//! notifications. The application, mempool, evidence pool and block store
//! are external collaborators behind traits.

mod config;
mod height_vote_set;
mod round_state;
mod state;
mod traits;
mod vote_set;

pub use config::ConsensusConfig;
pub use height_vote_set::HeightVoteSet;
pub use round_state::RoundState;
pub use state::ConsensusState;
pub use traits::{
    BlockExecutor, BlockStore, EvidencePool, FatalAppError, Mempool, ValidationError,
};
pub use vote_set::{AddVoteError, VoteSet};
