//! Distributed key generation: the dealer state machine and the round
//! coordinator.
//!
//! The [`Dealer`] drives one DKG round through its seven stages, consuming
//! inbound [`beacon_types::DkgMessage`]s and emitting outbound ones. The
//! [`Coordinator`] schedules rounds against consensus height, routes
//! messages, aborts timed-out rounds (surfacing the losers), and hands the
//! freshly produced [`beacon_threshold::BlsVerifier`] to the node.

mod coordinator;
mod dealer;

pub use coordinator::{Coordinator, DkgConfig};
pub use dealer::{Dealer, DealerError, DealerFaults};
