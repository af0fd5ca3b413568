//! Core event/action model for the beacon node.
//!
//! This crate provides the foundational types for the consensus architecture:
//!
//! - [`Event`]: All possible inputs to the state machine
//! - [`Action`]: All possible outputs from the state machine
//! - [`NodeEvent`]: Notifications published to external observers
//! - [`StateMachine`]: The trait the composite node state machine implements
//!
//! # Architecture
//!
//! The core is built on a simple event-driven model:
//!
//! ```text
//! Events → StateMachine::handle() → Actions
//! ```
//!
//! The state machine is:
//! - **Synchronous**: No async, no .await
//! - **Deterministic**: Same state + event = same actions
//! - **Pure-ish**: Mutates self, but performs no I/O
//!
//! All I/O is handled by the router loop (`beacon-production`), which:
//! 1. Appends inbound messages to the write-ahead log (fsync for
//!    self-generated messages)
//! 2. Delivers events to the state machine
//! 3. Executes the returned actions (broadcasts, timers, notifications)

mod action;
mod event;
mod message;
mod step;
mod traits;
mod wal;

pub use action::Action;
pub use event::{Event, NodeEvent};
pub use message::{ConsensusMessage, OutboundMessage, PeerId};
pub use step::{Step, TimeoutInfo};
pub use traits::StateMachine;
pub use wal::{NilWal, SharedWal, Wal, WalMessage};
