//! Actions returned by the node state machine.

use crate::event::NodeEvent;
use crate::message::{ConsensusMessage, OutboundMessage};
use crate::step::TimeoutInfo;

/// Actions the state machine wants the router to perform.
///
/// Actions are **commands** - they describe something to do.
/// The router executes actions; some feed back into the state machine as
/// events (internal messages, timeout ticks).
#[derive(Debug, Clone)]
pub enum Action {
    /// Hand a message to the gossip layer.
    Broadcast { message: OutboundMessage },

    /// Feed a self-generated message back through the internal queue.
    ///
    /// The router WAL-fsyncs the message before the state machine handles
    /// it, which is what makes self-signing crash-safe.
    EnqueueInternal { msg: ConsensusMessage },

    /// Arm the timeout ticker. Replaces any previously scheduled ticket.
    ScheduleTimeout { info: TimeoutInfo },

    /// Publish a notification to external observers.
    Publish { event: NodeEvent },
}

impl Action {
    /// Action type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::EnqueueInternal { .. } => "EnqueueInternal",
            Action::ScheduleTimeout { .. } => "ScheduleTimeout",
            Action::Publish { .. } => "Publish",
        }
    }
}
