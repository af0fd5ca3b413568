//! Wire messages exchanged between nodes.

use beacon_types::{DkgMessage, Part, Proposal, Vote};
use serde::{Deserialize, Serialize};

/// Opaque peer identifier assigned by the gossip layer. Empty for messages a
/// node generated itself.
pub type PeerId = String;

/// Consensus messages carried by gossip and by the internal queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    Proposal(Proposal),
    BlockPart {
        height: u64,
        round: u32,
        part: Part,
    },
    Vote(Vote),
}

impl ConsensusMessage {
    /// Message type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            ConsensusMessage::Proposal(_) => "Proposal",
            ConsensusMessage::BlockPart { .. } => "BlockPart",
            ConsensusMessage::Vote(_) => "Vote",
        }
    }
}

/// Everything a node can hand to the gossip layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboundMessage {
    Consensus(ConsensusMessage),
    Dkg(DkgMessage),
}
