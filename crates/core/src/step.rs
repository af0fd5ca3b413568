//! Round steps and timeout tickets.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// The consensus steps within a height, in progression order.
///
/// The ordering is load-bearing: step monotonicity within a (height, round)
/// and staleness checks on timeout tickets both compare variants with `<`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Step {
    NewHeight,
    NewRound,
    Propose,
    Prevote,
    PrevoteWait,
    Precommit,
    PrecommitWait,
    Commit,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::NewHeight => "NewHeight",
            Step::NewRound => "NewRound",
            Step::Propose => "Propose",
            Step::Prevote => "Prevote",
            Step::PrevoteWait => "PrevoteWait",
            Step::Precommit => "Precommit",
            Step::PrecommitWait => "PrecommitWait",
            Step::Commit => "Commit",
        };
        f.write_str(name)
    }
}

/// A single-shot timeout ticket.
///
/// Tickets are identified by (height, round, step); a tick whose tuple is
/// stale relative to the current round state is dropped on delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutInfo {
    pub duration: Duration,
    pub height: u64,
    pub round: u32,
    pub step: Step,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_ordered() {
        assert!(Step::NewHeight < Step::NewRound);
        assert!(Step::Propose < Step::Prevote);
        assert!(Step::PrecommitWait < Step::Commit);
    }
}
