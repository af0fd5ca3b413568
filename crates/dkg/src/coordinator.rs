//! The DKG coordinator: schedules rounds against consensus height, routes
//! inbound messages to the dealer, and publishes the verifier when a round
//! certifies.

use crate::dealer::{Dealer, DealerError, DealerFaults};
use beacon_core::{Action, NodeEvent, OutboundMessage};
use beacon_threshold::BlsVerifier;
use beacon_types::{Address, DkgMessage, ValidatorSet};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// DKG scheduling configuration. Rounds are measured in consensus heights.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct DkgConfig {
    /// Start a key-generation round as soon as the node starts.
    pub run_at_startup: bool,
    /// Start a fresh round every N heights (0 = only at startup / on abort).
    pub interval_heights: u64,
    /// Abort a round that has not certified after this many heights.
    pub round_timeout_heights: u64,
    /// Deterministic randomness for tests; real deployments leave it unset.
    pub seed: Option<u64>,
}

impl Default for DkgConfig {
    fn default() -> Self {
        DkgConfig {
            run_at_startup: true,
            interval_heights: 0,
            round_timeout_heights: 10,
            seed: None,
        }
    }
}

/// Drives DKG rounds for one node.
pub struct Coordinator {
    config: DkgConfig,
    addr: Address,
    faults: DealerFaults,

    dealer: Option<Dealer>,
    /// True while a round is in flight.
    active: bool,
    round_start_height: u64,

    verifier: Option<Arc<BlsVerifier>>,
    /// Set when a round certifies; the node takes it and installs it into
    /// consensus.
    fresh_verifier: Option<Arc<BlsVerifier>>,
    losers: Vec<Address>,
}

impl Coordinator {
    pub fn new(config: DkgConfig, addr: Address) -> Self {
        Self::with_faults(config, addr, DealerFaults::default())
    }

    /// Test entry: a coordinator whose dealer misbehaves in a chosen way.
    pub fn with_faults(config: DkgConfig, addr: Address, faults: DealerFaults) -> Self {
        Coordinator {
            config,
            addr,
            faults,
            dealer: None,
            active: false,
            round_start_height: 0,
            verifier: None,
            fresh_verifier: None,
            losers: Vec::new(),
        }
    }

    /// The verifier produced by the most recent successful round, if any.
    pub fn verifier(&self) -> Option<Arc<BlsVerifier>> {
        self.verifier.clone()
    }

    /// A verifier produced since the last call, for installation into the
    /// consensus core.
    pub fn take_fresh_verifier(&mut self) -> Option<Arc<BlsVerifier>> {
        self.fresh_verifier.take()
    }

    /// Validators that failed the most recently aborted round.
    pub fn losers(&self) -> &[Address] {
        &self.losers
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn round_id(&self) -> u64 {
        self.dealer.as_ref().map(|d| d.round_id()).unwrap_or(0)
    }

    /// Called whenever the consensus height advances (and once at startup):
    /// starts scheduled rounds and aborts timed-out ones.
    pub fn check_dkg_time(&mut self, height: u64, validators: &ValidatorSet) -> Vec<Action> {
        let mut actions = Vec::new();

        if self.active
            && self.config.round_timeout_heights > 0
            && height.saturating_sub(self.round_start_height) >= self.config.round_timeout_heights
        {
            warn!(
                height,
                started = self.round_start_height,
                "dkg round timed out"
            );
            self.abort_round(&mut actions);
            self.round_start_height = height;
            return actions;
        }

        let start_now = !self.active
            && (self.dealer.is_none() && self.config.run_at_startup
                || self.config.interval_heights > 0 && height % self.config.interval_heights == 0);
        if start_now {
            info!(height, "dkg: starting a key generation round");
            self.round_start_height = height;
            self.start_round(validators, &mut actions);
        }
        actions
    }

    /// Route one inbound DKG message to the dealer.
    pub fn handle_message(&mut self, msg: DkgMessage) -> Vec<Action> {
        let mut actions = Vec::new();
        if !self.active {
            debug!(kind = %msg.kind, "dkg: no round in flight, dropping message");
            return actions;
        }
        let round_id = self.round_id();
        if msg.round_id != round_id {
            debug!(
                kind = %msg.kind,
                got = msg.round_id,
                current = round_id,
                "dkg: dropping message for another round"
            );
            return actions;
        }

        let handled = self
            .dealer
            .as_mut()
            .expect("active round has a dealer")
            .handle_message(&msg);
        let result = match handled {
            Ok(()) => self.drain_dealer(&mut actions),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => self.harvest_verifier(&mut actions),
            Err(e) => {
                warn!("dkg: round {round_id} failed: {e}");
                self.abort_round(&mut actions);
            }
        }
        actions
    }

    fn start_round(&mut self, validators: &ValidatorSet, actions: &mut Vec<Action>) {
        if self.dealer.is_none() {
            let rng = match self.config.seed {
                Some(seed) => ChaCha20Rng::seed_from_u64(seed),
                None => ChaCha20Rng::from_entropy(),
            };
            self.dealer = Some(Dealer::new(
                validators.clone(),
                self.addr,
                self.faults,
                rng,
            ));
        }
        self.active = true;
        let started = self.dealer.as_mut().expect("just created").start();
        let started = match started {
            Ok(()) => self.drain_dealer(actions),
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            warn!("dkg: failed to start round: {e}");
            self.abort_round(actions);
        }
    }

    /// Broadcast the dealer's outbound messages. Our own broadcasts are also
    /// fed back to the dealer: readiness thresholds count our own
    /// justifications, commits and complaints like everyone else's.
    fn drain_dealer(&mut self, actions: &mut Vec<Action>) -> Result<(), DealerError> {
        let dealer = self.dealer.as_mut().expect("active round has a dealer");
        for event in dealer.take_events() {
            actions.push(Action::Publish { event });
        }
        let mut queue: VecDeque<DkgMessage> = dealer.take_outbox().into();
        while let Some(msg) = queue.pop_front() {
            actions.push(Action::Broadcast {
                message: OutboundMessage::Dkg(msg.clone()),
            });
            dealer.handle_message(&msg)?;
            for event in dealer.take_events() {
                actions.push(Action::Publish { event });
            }
            queue.extend(dealer.take_outbox());
        }
        Ok(())
    }

    /// If the instance finished, publish the verifier and close the round.
    fn harvest_verifier(&mut self, _actions: &mut Vec<Action>) {
        let Some(dealer) = self.dealer.as_mut() else {
            return;
        };
        match dealer.verifier() {
            Ok(verifier) => {
                info!(
                    round_id = dealer.round_id(),
                    t = verifier.threshold(),
                    n = verifier.participants(),
                    "dkg: round certified, verifier ready"
                );
                let verifier = Arc::new(verifier);
                self.verifier = Some(verifier.clone());
                self.fresh_verifier = Some(verifier);
                self.active = false;
                dealer.reset();
            }
            Err(DealerError::VerifierNotReady) => {}
            Err(e) => debug!("dkg: verifier not available: {e}"),
        }
    }

    /// Abort the round: surface the losers and start over with the next
    /// round id.
    fn abort_round(&mut self, actions: &mut Vec<Action>) {
        let Some(dealer) = self.dealer.as_mut() else {
            return;
        };
        dealer.compute_losers();
        self.losers = dealer.losers().to_vec();
        let round_id = dealer.round_id();
        warn!(
            round_id,
            losers = self.losers.len(),
            "dkg: aborting round"
        );
        actions.push(Action::Publish {
            event: NodeEvent::DkgRoundAborted {
                round_id,
                losers: self.losers.clone(),
            },
        });

        dealer.reset();
        let restarted = {
            let dealer = self.dealer.as_mut().expect("dealer exists");
            dealer.start()
        };
        match restarted {
            Ok(()) => {
                if let Err(e) = self.drain_dealer(actions) {
                    warn!("dkg: failed to restart round: {e}");
                    self.active = false;
                }
            }
            Err(e) => {
                warn!("dkg: failed to restart round: {e}");
                self.active = false;
            }
        }
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("active", &self.active)
            .field("round_id", &self.round_id())
            .field("has_verifier", &self.verifier.is_some())
            .finish()
    }
}
