//! Write-ahead log entry types and access trait.

use crate::message::{ConsensusMessage, PeerId};
use crate::step::TimeoutInfo;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// One WAL record.
///
/// Every consensus input is logged before it mutates state. `EndHeight` is
/// the durability boundary: replay starts after the last `EndHeight` marker
/// and re-feeds the remaining entries to reconstruct the round state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalMessage {
    MsgInfo {
        msg: ConsensusMessage,
        peer_id: PeerId,
    },
    Timeout(TimeoutInfo),
    EndHeight {
        height: u64,
    },
}

/// Write access to the log.
///
/// The router appends every consensus input before it mutates state;
/// `write_sync` additionally fsyncs, which is required for self-generated
/// messages and the `EndHeight` marker.
pub trait Wal: Send {
    fn write(&mut self, msg: &WalMessage) -> std::io::Result<()>;
    fn write_sync(&mut self, msg: &WalMessage) -> std::io::Result<()>;
    fn flush_and_sync(&mut self) -> std::io::Result<()>;
}

/// The log is shared between the router (message appends) and the consensus
/// state (`EndHeight`, pre-sign flushes); all access happens on the router
/// thread, the lock only satisfies `Send` bounds.
pub type SharedWal = Arc<Mutex<dyn Wal>>;

/// A log that drops everything. Used in tests and before the real log opens.
#[derive(Debug, Default)]
pub struct NilWal;

impl Wal for NilWal {
    fn write(&mut self, _msg: &WalMessage) -> std::io::Result<()> {
        Ok(())
    }

    fn write_sync(&mut self, _msg: &WalMessage) -> std::io::Result<()> {
        Ok(())
    }

    fn flush_and_sync(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
