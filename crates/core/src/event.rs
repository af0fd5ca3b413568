//! Events consumed by the node state machine, and notifications it emits.

use crate::message::{ConsensusMessage, PeerId};
use crate::step::TimeoutInfo;
use beacon_types::{Address, DkgMessage, Hash, ValidatorSet, Vote};

/// All possible inputs to the node state machine.
///
/// Events are **passive data** - they describe something that happened.
/// The state machine processes events and returns actions.
#[derive(Debug, Clone)]
pub enum Event {
    /// A consensus message arrived from a peer. WAL-appended (no fsync)
    /// before the state machine sees it.
    PeerMessage {
        msg: ConsensusMessage,
        peer_id: PeerId,
    },

    /// A self-generated consensus message (own proposal, own vote, own block
    /// parts). WAL-appended **with fsync** before the state machine sees it,
    /// so a crash cannot cause double-signing.
    InternalMessage { msg: ConsensusMessage },

    /// A scheduled timeout elapsed.
    TimeoutElapsed { info: TimeoutInfo },

    /// A DKG message arrived from a peer.
    DkgMessageReceived { msg: DkgMessage },

    /// The mempool has transactions available.
    TxsAvailable,
}

impl Event {
    /// Event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::PeerMessage { .. } => "PeerMessage",
            Event::InternalMessage { .. } => "InternalMessage",
            Event::TimeoutElapsed { .. } => "TimeoutElapsed",
            Event::DkgMessageReceived { .. } => "DkgMessageReceived",
            Event::TxsAvailable => "TxsAvailable",
        }
    }
}

/// Notifications published for external observers (reactors, RPC, tests).
#[derive(Debug, Clone)]
pub enum NodeEvent {
    // ═══════════════════════════════════════════════════════════════════════
    // Consensus
    // ═══════════════════════════════════════════════════════════════════════
    NewRound { height: u64, round: u32 },
    CompleteProposal { height: u64, round: u32, block_hash: Hash },
    Polka { height: u64, round: u32 },
    Lock { height: u64, round: u32 },
    Unlock { height: u64, round: u32 },
    Relock { height: u64, round: u32 },
    ValidBlock { height: u64, round: u32 },
    TimeoutPropose { height: u64, round: u32 },
    TimeoutWait { height: u64, round: u32 },
    Vote { vote: Vote },
    NewBlockHeader { height: u64, block_hash: Hash },
    NewBlock { height: u64, block_hash: Hash, random_hash: Hash },
    ValidatorSetUpdates { validators: ValidatorSet },

    // ═══════════════════════════════════════════════════════════════════════
    // DKG
    // ═══════════════════════════════════════════════════════════════════════
    DkgPubKeyReceived { round_id: u64 },
    DkgDealsProcessed { round_id: u64 },
    DkgResponsesProcessed { round_id: u64 },
    DkgJustificationsProcessed { round_id: u64 },
    DkgInstanceCertified { round_id: u64 },
    DkgCommitsProcessed { round_id: u64 },
    DkgComplaintProcessed { round_id: u64 },
    DkgReconstructCommitsProcessed { round_id: u64 },
    DkgRoundAborted { round_id: u64, losers: Vec<Address> },
}

impl NodeEvent {
    /// Event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeEvent::NewRound { .. } => "NewRound",
            NodeEvent::CompleteProposal { .. } => "CompleteProposal",
            NodeEvent::Polka { .. } => "Polka",
            NodeEvent::Lock { .. } => "Lock",
            NodeEvent::Unlock { .. } => "Unlock",
            NodeEvent::Relock { .. } => "Relock",
            NodeEvent::ValidBlock { .. } => "ValidBlock",
            NodeEvent::TimeoutPropose { .. } => "TimeoutPropose",
            NodeEvent::TimeoutWait { .. } => "TimeoutWait",
            NodeEvent::Vote { .. } => "Vote",
            NodeEvent::NewBlockHeader { .. } => "NewBlockHeader",
            NodeEvent::NewBlock { .. } => "NewBlock",
            NodeEvent::ValidatorSetUpdates { .. } => "ValidatorSetUpdates",
            NodeEvent::DkgPubKeyReceived { .. } => "DkgPubKeyReceived",
            NodeEvent::DkgDealsProcessed { .. } => "DkgDealsProcessed",
            NodeEvent::DkgResponsesProcessed { .. } => "DkgResponsesProcessed",
            NodeEvent::DkgJustificationsProcessed { .. } => "DkgJustificationsProcessed",
            NodeEvent::DkgInstanceCertified { .. } => "DkgInstanceCertified",
            NodeEvent::DkgCommitsProcessed { .. } => "DkgCommitsProcessed",
            NodeEvent::DkgComplaintProcessed { .. } => "DkgComplaintProcessed",
            NodeEvent::DkgReconstructCommitsProcessed { .. } => {
                "DkgReconstructCommitsProcessed"
            }
            NodeEvent::DkgRoundAborted { .. } => "DkgRoundAborted",
        }
    }
}
