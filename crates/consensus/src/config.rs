//! Consensus timing configuration.

use serde::Deserialize;
use std::time::Duration;

/// Timeouts and behavior switches for the round state machine.
///
/// Per-round timeouts grow linearly: `base + round * delta`, giving slow
/// validators progressively more time after failed rounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub timeout_propose: Duration,
    pub timeout_propose_delta: Duration,
    pub timeout_prevote: Duration,
    pub timeout_prevote_delta: Duration,
    pub timeout_precommit: Duration,
    pub timeout_precommit_delta: Duration,
    /// Pause after a commit before starting the next height, letting
    /// straggler precommits arrive for the last-commit set.
    pub timeout_commit: Duration,
    /// Start the next height as soon as all precommits are in, instead of
    /// waiting out `timeout_commit`.
    pub skip_timeout_commit: bool,
    /// Propose empty blocks when the mempool is idle.
    pub create_empty_blocks: bool,
    /// When not creating empty blocks eagerly, still propose one after this
    /// interval (zero = wait for transactions indefinitely).
    pub create_empty_blocks_interval: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            timeout_propose: Duration::from_millis(3000),
            timeout_propose_delta: Duration::from_millis(500),
            timeout_prevote: Duration::from_millis(1000),
            timeout_prevote_delta: Duration::from_millis(500),
            timeout_precommit: Duration::from_millis(1000),
            timeout_precommit_delta: Duration::from_millis(500),
            timeout_commit: Duration::from_millis(1000),
            skip_timeout_commit: false,
            create_empty_blocks: true,
            create_empty_blocks_interval: Duration::ZERO,
        }
    }
}

impl ConsensusConfig {
    pub fn propose(&self, round: u32) -> Duration {
        self.timeout_propose + self.timeout_propose_delta * round
    }

    pub fn prevote(&self, round: u32) -> Duration {
        self.timeout_prevote + self.timeout_prevote_delta * round
    }

    pub fn precommit(&self, round: u32) -> Duration {
        self.timeout_precommit + self.timeout_precommit_delta * round
    }

    /// Whether proposals should wait for mempool transactions.
    pub fn wait_for_txs(&self) -> bool {
        !self.create_empty_blocks || self.create_empty_blocks_interval > Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_grow_with_round() {
        let config = ConsensusConfig::default();
        assert!(config.propose(0) < config.propose(1));
        assert_eq!(
            config.prevote(2),
            config.timeout_prevote + config.timeout_prevote_delta * 2
        );
    }
}
