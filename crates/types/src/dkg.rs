//! DKG wire envelope.

use crate::crypto::Address;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The seven DKG message kinds, one per dealer stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DkgMessageKind {
    PubKey,
    Deal,
    Response,
    Justification,
    Commits,
    Complaint,
    ReconstructCommit,
}

impl DkgMessageKind {
    /// Name for telemetry.
    pub fn as_str(&self) -> &'static str {
        match self {
            DkgMessageKind::PubKey => "PubKey",
            DkgMessageKind::Deal => "Deal",
            DkgMessageKind::Response => "Response",
            DkgMessageKind::Justification => "Justification",
            DkgMessageKind::Commits => "Commits",
            DkgMessageKind::Complaint => "Complaint",
            DkgMessageKind::ReconstructCommit => "ReconstructCommit",
        }
    }
}

impl fmt::Display for DkgMessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope for every DKG broadcast.
///
/// `data` is a deterministic encoding of curve points and scalars; it may be
/// empty for justification / complaint / reconstruct messages that have
/// nothing to report. `to_index` targets deals at a recipient; `num_entities`
/// carries the commitment-point count packed into commits and complaints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgMessage {
    pub kind: DkgMessageKind,
    pub round_id: u64,
    pub addr: Address,
    pub data: Vec<u8>,
    pub to_index: Option<u32>,
    pub num_entities: Option<u32>,
}

impl DkgMessage {
    pub fn new(kind: DkgMessageKind, round_id: u64, addr: Address, data: Vec<u8>) -> Self {
        DkgMessage {
            kind,
            round_id,
            addr,
            data,
            to_index: None,
            num_entities: None,
        }
    }

    pub fn with_to_index(mut self, to_index: u32) -> Self {
        self.to_index = Some(to_index);
        self
    }

    pub fn with_num_entities(mut self, num_entities: u32) -> Self {
        self.num_entities = Some(num_entities);
        self
    }
}
