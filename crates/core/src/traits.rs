//! State machine trait.

use crate::{Action, Event};
use std::time::Duration;

/// A synchronous, deterministic state machine.
///
/// The router sets the clock before each call; handlers must not block or
/// perform I/O.
pub trait StateMachine {
    /// Process one event, returning the actions to execute.
    fn handle(&mut self, event: Event) -> Vec<Action>;

    /// Set the current wall-clock time (milliseconds granularity).
    fn set_time(&mut self, now: Duration);
}
