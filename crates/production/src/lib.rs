//! Production plumbing for a beacon node: the router loop, the write-ahead
//! log, the timeout ticker, metrics and telemetry.
//!
//! The state machines in `beacon-node` are synchronous and deterministic;
//! everything with a side effect lives here. The [`Runner`] owns the WAL and
//! all queues; external components (gossip, mempool notifier, RPC) interact
//! exclusively through the [`RunnerHandles`].

mod metrics;
mod runner;
mod telemetry;
mod ticker;
mod wal;

pub use metrics::Metrics;
pub use runner::{Runner, RunnerConfig, RunnerError, RunnerHandles};
pub use telemetry::init_tracing;
pub use ticker::TimeoutTicker;
pub use wal::{replay_start, FileWal};
