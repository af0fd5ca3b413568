//! The message router: a single cooperative loop multiplexing every input
//! to the node state machine.
//!
//! Each iteration serves exactly one source: an inbound DKG message, a
//! transactions-available signal, a peer message, an internal self-message,
//! a timeout tick, or shutdown. Ordering guarantees:
//!
//! - peer messages are WAL-appended before the state machine sees them;
//! - internal self-messages are WAL-appended **with fsync** first, so a
//!   crash can never cause double-signing;
//! - the `EndHeight` marker (written by the consensus core inside commit)
//!   delimits the durability of a height.
//!
//! A panic inside a handler is caught; the router logs it and shuts down
//! gracefully. A node in an unknown state must not sign.

use crate::metrics::Metrics;
use crate::ticker::TimeoutTicker;
use crate::wal::{replay_start, FileWal};
use beacon_core::{
    Action, ConsensusMessage, Event, NodeEvent, OutboundMessage, PeerId, SharedWal, StateMachine,
    Wal, WalMessage,
};
use beacon_node::NodeStateMachine;
use beacon_types::DkgMessage;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("WAL error: {0}")]
    Wal(#[from] std::io::Error),
}

/// Queue capacities for the router.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub peer_queue_size: usize,
    pub internal_queue_size: usize,
    pub dkg_queue_size: usize,
    pub outbound_queue_size: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            peer_queue_size: 1000,
            internal_queue_size: 1000,
            dkg_queue_size: 1000,
            outbound_queue_size: 1000,
        }
    }
}

/// Handles the embedder uses to talk to a running router.
pub struct RunnerHandles {
    /// Feed gossip consensus messages in.
    pub peer_tx: mpsc::Sender<(ConsensusMessage, PeerId)>,
    /// Feed gossip DKG messages in.
    pub dkg_tx: mpsc::Sender<DkgMessage>,
    /// Signal that the mempool has transactions.
    pub tx_notify_tx: mpsc::Sender<()>,
    /// Outbound messages for the gossip layer.
    pub outbound_rx: mpsc::Receiver<OutboundMessage>,
    /// Node event notifications.
    pub event_rx: broadcast::Receiver<NodeEvent>,
    /// Cooperative shutdown.
    pub shutdown_tx: oneshot::Sender<()>,
    /// Resolves when the loop has fully stopped.
    pub done_rx: oneshot::Receiver<()>,
}

/// The router loop.
pub struct Runner {
    node: NodeStateMachine,
    wal: SharedWal,
    wal_path: Option<std::path::PathBuf>,
    metrics: Metrics,

    peer_rx: mpsc::Receiver<(ConsensusMessage, PeerId)>,
    internal_tx: mpsc::Sender<ConsensusMessage>,
    internal_rx: mpsc::Receiver<ConsensusMessage>,
    dkg_rx: mpsc::Receiver<DkgMessage>,
    tx_notify_rx: mpsc::Receiver<()>,
    ticker: TimeoutTicker,
    tock_rx: mpsc::Receiver<beacon_core::TimeoutInfo>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    event_tx: broadcast::Sender<NodeEvent>,
    shutdown_rx: oneshot::Receiver<()>,
    done_tx: Option<oneshot::Sender<()>>,
}

impl Runner {
    /// Build a router around a node state machine.
    ///
    /// `wal` must be the same handle the consensus core was built with.
    /// `wal_path` enables crash recovery: entries after the last `EndHeight`
    /// marker are replayed into the state machine before the loop starts.
    pub fn new(
        node: NodeStateMachine,
        wal: SharedWal,
        wal_path: Option<std::path::PathBuf>,
        config: RunnerConfig,
        metrics: Metrics,
    ) -> (Self, RunnerHandles) {
        let (peer_tx, peer_rx) = mpsc::channel(config.peer_queue_size);
        let (internal_tx, internal_rx) = mpsc::channel(config.internal_queue_size);
        let (dkg_tx, dkg_rx) = mpsc::channel(config.dkg_queue_size);
        let (tx_notify_tx, tx_notify_rx) = mpsc::channel(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue_size);
        let (event_tx, event_rx) = broadcast::channel(1024);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let (ticker, tock_rx) = TimeoutTicker::new(16);

        let runner = Runner {
            node,
            wal,
            wal_path,
            metrics,
            peer_rx,
            internal_tx,
            internal_rx,
            dkg_rx,
            tx_notify_rx,
            ticker,
            tock_rx,
            outbound_tx,
            event_tx,
            shutdown_rx,
            done_tx: Some(done_tx),
        };
        let handles = RunnerHandles {
            peer_tx,
            dkg_tx,
            tx_notify_tx,
            outbound_rx,
            event_rx,
            shutdown_tx,
            done_rx,
        };
        (runner, handles)
    }

    /// Replay WAL entries recorded after the last committed height, then run
    /// the loop until shutdown or a fatal handler panic.
    pub async fn run(mut self) -> Result<(), RunnerError> {
        self.catchup_replay()?;

        let start_actions = self.node.start();
        if self.execute_actions(start_actions).await.is_err() {
            self.on_exit();
            return Ok(());
        }

        info!("router loop started");
        loop {
            let step = tokio::select! {
                Some(msg) = self.dkg_rx.recv() => {
                    self.dispatch(Event::DkgMessageReceived { msg }, WalPolicy::Skip).await
                }
                Some(_) = self.tx_notify_rx.recv() => {
                    self.dispatch(Event::TxsAvailable, WalPolicy::Skip).await
                }
                Some((msg, peer_id)) = self.peer_rx.recv() => {
                    self.dispatch(Event::PeerMessage { msg, peer_id }, WalPolicy::Append).await
                }
                Some(msg) = self.internal_rx.recv() => {
                    self.dispatch(Event::InternalMessage { msg }, WalPolicy::AppendSync).await
                }
                Some(info) = self.tock_rx.recv() => {
                    self.dispatch(Event::TimeoutElapsed { info }, WalPolicy::Append).await
                }
                _ = &mut self.shutdown_rx => {
                    info!("shutdown requested");
                    break;
                }
            };
            if step.is_err() {
                break;
            }
        }

        self.on_exit();
        Ok(())
    }

    /// Feed one event through the state machine, honoring the WAL ordering
    /// for its source. A panic in the handler stops the loop.
    async fn dispatch(&mut self, event: Event, wal_policy: WalPolicy) -> Result<(), Halt> {
        if let Some(entry) = wal_entry(&event) {
            let result = {
                let mut wal = self.wal.lock().expect("wal lock poisoned");
                match wal_policy {
                    WalPolicy::Skip => Ok(()),
                    WalPolicy::Append => wal.write(&entry),
                    WalPolicy::AppendSync => wal.write_sync(&entry),
                }
            };
            if let Err(e) = result {
                error!("WAL append failed, halting: {e}");
                return Err(Halt);
            }
        }

        self.node.set_time(wall_clock());
        let handled = std::panic::catch_unwind(AssertUnwindSafe(|| self.node.handle(event)));
        let actions = match handled {
            Ok(actions) => actions,
            Err(panic) => {
                // An unknown-state node must not sign anything further.
                error!(
                    "CONSENSUS FAILURE: handler panicked: {}; halting",
                    panic_message(&*panic)
                );
                return Err(Halt);
            }
        };
        self.execute_actions(actions).await
    }

    async fn execute_actions(&mut self, actions: Vec<Action>) -> Result<(), Halt> {
        for action in actions {
            match action {
                Action::Broadcast { message } => {
                    if self.outbound_tx.send(message).await.is_err() {
                        warn!("outbound queue closed, dropping broadcast");
                    }
                }
                Action::EnqueueInternal { msg } => {
                    if self.internal_tx.try_send(msg).is_err() {
                        // The loop is its own consumer; a full or closed
                        // queue means self-messages would be lost.
                        error!("internal queue unavailable, halting");
                        return Err(Halt);
                    }
                }
                Action::ScheduleTimeout { info } => self.ticker.schedule(info),
                Action::Publish { event } => {
                    self.metrics.observe(&event);
                    debug!(event = event.type_name(), "publishing event");
                    let _ = self.event_tx.send(event);
                }
            }
        }
        Ok(())
    }

    /// Replay entries recorded after the last `EndHeight` marker.
    ///
    /// Replayed self-messages re-derive byte-identical signatures: the vote
    /// content is a function of the (replayed) round state, and signing is
    /// deterministic.
    fn catchup_replay(&mut self) -> Result<(), RunnerError> {
        let Some(path) = self.wal_path.clone() else {
            return Ok(());
        };
        let entries = FileWal::read_entries(&path)?;
        let (start, last_height) = replay_start(&entries);
        if entries[start..].is_empty() {
            debug!("no WAL entries to replay");
            return Ok(());
        }
        info!(
            entries = entries.len() - start,
            after_height = ?last_height,
            "replaying WAL"
        );
        self.node.set_time(wall_clock());
        for entry in &entries[start..] {
            let event = match entry.clone() {
                WalMessage::MsgInfo { msg, peer_id } if peer_id.is_empty() => {
                    Event::InternalMessage { msg }
                }
                WalMessage::MsgInfo { msg, peer_id } => Event::PeerMessage { msg, peer_id },
                WalMessage::Timeout(info) => Event::TimeoutElapsed { info },
                WalMessage::EndHeight { .. } => continue,
            };
            // Replay mutates state only; outputs were already broadcast in
            // the previous life, so the actions are dropped (fresh timeout
            // tickets come from `start`).
            let _ = self.node.handle(event);
        }
        Ok(())
    }

    fn on_exit(&mut self) {
        self.ticker.stop();
        {
            let mut wal = self.wal.lock().expect("wal lock poisoned");
            if let Err(e) = wal.flush_and_sync() {
                warn!("failed to flush WAL on shutdown: {e}");
            }
        }
        if let Some(done) = self.done_tx.take() {
            let _ = done.send(());
        }
        info!("router loop stopped");
    }
}

/// Fatal condition: stop the loop without processing anything further.
struct Halt;

#[derive(Debug, Clone, Copy)]
enum WalPolicy {
    Skip,
    Append,
    AppendSync,
}

fn wal_entry(event: &Event) -> Option<WalMessage> {
    match event {
        Event::PeerMessage { msg, peer_id } => Some(WalMessage::MsgInfo {
            msg: msg.clone(),
            peer_id: peer_id.clone(),
        }),
        Event::InternalMessage { msg } => Some(WalMessage::MsgInfo {
            msg: msg.clone(),
            peer_id: String::new(),
        }),
        Event::TimeoutElapsed { info } => Some(WalMessage::Timeout(*info)),
        Event::DkgMessageReceived { .. } | Event::TxsAvailable => None,
    }
}

fn wall_clock() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
