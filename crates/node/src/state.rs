//! The composite node state machine.

use beacon_consensus::ConsensusState;
use beacon_core::{Action, Event, NodeEvent, StateMachine};
use beacon_dkg::Coordinator;
use beacon_threshold::BlsVerifier;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Combined node state machine.
///
/// Owns the consensus core and the DKG coordinator; all mutation happens on
/// the router loop through [`StateMachine::handle`].
pub struct NodeStateMachine {
    consensus: ConsensusState,
    dkg: Coordinator,
    now: Duration,
}

impl NodeStateMachine {
    pub fn new(consensus: ConsensusState, dkg: Coordinator) -> Self {
        NodeStateMachine {
            consensus,
            dkg,
            now: Duration::ZERO,
        }
    }

    pub fn consensus(&self) -> &ConsensusState {
        &self.consensus
    }

    pub fn consensus_mut(&mut self) -> &mut ConsensusState {
        &mut self.consensus
    }

    pub fn dkg(&self) -> &Coordinator {
        &self.dkg
    }

    /// Install a verifier directly (e.g. a trusted-dealer test setup or a
    /// key loaded from disk). DKG rounds replace it as they certify.
    pub fn set_verifier(&mut self, verifier: Arc<BlsVerifier>) {
        self.consensus.set_verifier(verifier);
    }

    /// Start consensus (schedule round 0) and the DKG schedule.
    pub fn start(&mut self) -> Vec<Action> {
        let mut actions = self.consensus.start();
        let height = self.consensus.round_state().height;
        let validators = self.consensus.chain_state().validators.clone();
        actions.extend(self.dkg.check_dkg_time(height, &validators));
        self.install_fresh_verifier();
        actions
    }

    /// The DKG schedule follows committed heights; a `NewBlock` notification
    /// in the outgoing actions means the height advanced.
    fn drive_dkg_schedule(&mut self, actions: &mut Vec<Action>) {
        let committed: Vec<u64> = actions
            .iter()
            .filter_map(|action| match action {
                Action::Publish {
                    event: NodeEvent::NewBlock { height, .. },
                } => Some(*height),
                _ => None,
            })
            .collect();
        for height in committed {
            let validators = self.consensus.chain_state().validators.clone();
            actions.extend(self.dkg.check_dkg_time(height + 1, &validators));
            self.install_fresh_verifier();
        }
    }

    fn install_fresh_verifier(&mut self) {
        if let Some(verifier) = self.dkg.take_fresh_verifier() {
            self.consensus.set_verifier(verifier);
        }
    }
}

impl StateMachine for NodeStateMachine {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        debug!(event = event.type_name(), "node: handling event");
        let mut actions = match event {
            Event::PeerMessage { msg, peer_id } => self.consensus.handle_message(msg, peer_id),
            Event::InternalMessage { msg } => self.consensus.handle_message(msg, String::new()),
            Event::TimeoutElapsed { info } => self.consensus.handle_timeout(info),
            Event::TxsAvailable => self.consensus.handle_txs_available(),
            Event::DkgMessageReceived { msg } => {
                let actions = self.dkg.handle_message(msg);
                self.install_fresh_verifier();
                actions
            }
        };
        self.drive_dkg_schedule(&mut actions);
        actions
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
        self.consensus.set_time(now);
    }
}

impl std::fmt::Debug for NodeStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStateMachine")
            .field("consensus", &self.consensus)
            .field("dkg", &self.dkg)
            .finish()
    }
}
