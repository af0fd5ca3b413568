//! DKG end-to-end scenarios driven through the coordinators.

mod support;

use beacon_core::{Action, NodeEvent, OutboundMessage};
use beacon_dkg::{Coordinator, DealerFaults, DkgConfig};
use beacon_types::DkgMessage;
use std::collections::VecDeque;
use support::Network;

/// A fully connected network of coordinators with per-node fault switches.
struct DkgHarness {
    net: Network,
    coordinators: Vec<Coordinator>,
    events: Vec<Vec<NodeEvent>>,
}

impl DkgHarness {
    fn new(n: usize, seed: u64, faults: Vec<DealerFaults>) -> Self {
        let net = Network::new(n, seed);
        let coordinators = (0..n)
            .map(|i| {
                Coordinator::with_faults(
                    DkgConfig {
                        run_at_startup: true,
                        round_timeout_heights: 10,
                        seed: Some(seed * 100 + i as u64),
                        ..DkgConfig::default()
                    },
                    net.address(i),
                    faults[i],
                )
            })
            .collect();
        DkgHarness {
            events: vec![Vec::new(); n],
            net,
            coordinators,
        }
    }

    fn honest(n: usize, seed: u64) -> Self {
        Self::new(n, seed, vec![DealerFaults::default(); n])
    }

    /// Start every coordinator's round and route messages to quiescence.
    fn run(&mut self) {
        let mut wire: VecDeque<(usize, DkgMessage)> = VecDeque::new();
        for i in 0..self.coordinators.len() {
            let actions = self.coordinators[i].check_dkg_time(1, &self.net.validators);
            self.absorb(i, actions, &mut wire);
        }
        self.route(&mut wire);
    }

    /// Advance every coordinator's height view (e.g. past the round
    /// timeout), routing whatever that triggers.
    fn advance_height(&mut self, height: u64) {
        let mut wire = VecDeque::new();
        for i in 0..self.coordinators.len() {
            let actions = self.coordinators[i].check_dkg_time(height, &self.net.validators);
            self.absorb(i, actions, &mut wire);
        }
        self.route(&mut wire);
    }

    fn route(&mut self, wire: &mut VecDeque<(usize, DkgMessage)>) {
        while let Some((from, msg)) = wire.pop_front() {
            for i in 0..self.coordinators.len() {
                if i == from {
                    continue;
                }
                let actions = self.coordinators[i].handle_message(msg.clone());
                self.absorb(i, actions, wire);
            }
        }
    }

    fn absorb(
        &mut self,
        from: usize,
        actions: Vec<Action>,
        wire: &mut VecDeque<(usize, DkgMessage)>,
    ) {
        for action in actions {
            match action {
                Action::Broadcast {
                    message: OutboundMessage::Dkg(msg),
                } => wire.push_back((from, msg)),
                Action::Publish { event } => self.events[from].push(event),
                _ => {}
            }
        }
    }

    fn events_of(&self, node: usize, name: &str) -> usize {
        self.events[node]
            .iter()
            .filter(|e| e.type_name() == name)
            .count()
    }
}

/// With every participant honest on a synchronous network, all n qualify and
/// every node ends with a verifier whose shares sign under one collective
/// key with t = 2n/3.
#[test]
fn full_mesh_dkg_certifies_on_every_node() {
    let mut harness = DkgHarness::honest(4, 3);
    harness.run();

    let verifiers: Vec<_> = harness
        .coordinators
        .iter()
        .map(|c| c.verifier().expect("round should have certified"))
        .collect();
    for (i, verifier) in verifiers.iter().enumerate() {
        assert_eq!(verifier.threshold(), 2);
        assert_eq!(verifier.participants(), 4);
        assert!(!harness.coordinators[i].is_active());
        assert_eq!(harness.events_of(i, "DkgInstanceCertified"), 1);
    }

    // Shares produced by independent nodes combine into one signature that
    // every node accepts.
    let msg = b"post-dkg randomness";
    let partials: Vec<Vec<u8>> = verifiers
        .iter()
        .zip(harness.net.validators.addresses())
        .map(|(v, addr)| {
            let partial = v.sign(msg).unwrap();
            // Cross-verify each share on a different node.
            verifiers[0].verify_share(&addr, msg, &partial).unwrap();
            partial
        })
        .collect();
    let full = verifiers[1].recover(msg, &partials).unwrap();
    for verifier in &verifiers {
        verifier.verify_random_data(msg, &full).unwrap();
    }
}

/// A dealer that never broadcasts its deals stalls phase I; after the round
/// timeout everyone blames it and moves to the next round id.
#[test]
fn silent_dealer_is_blamed_and_round_restarts() {
    let silent = 2;
    let mut faults = vec![DealerFaults::default(); 4];
    faults[silent].withhold_deals = true;
    let mut harness = DkgHarness::new(4, 5, faults);

    harness.run();
    // Phase I cannot complete: nobody certifies.
    for coordinator in &harness.coordinators {
        assert!(coordinator.verifier().is_none());
        assert!(coordinator.is_active());
        assert_eq!(coordinator.round_id(), 1);
    }

    // Past the round timeout the coordinators abort and start round 2.
    harness.advance_height(11);
    let silent_addr = harness.net.address(silent);
    for (i, coordinator) in harness.coordinators.iter().enumerate() {
        if i == silent {
            continue;
        }
        assert_eq!(
            coordinator.losers(),
            &[silent_addr],
            "node {i} should blame exactly the silent dealer"
        );
        assert_eq!(coordinator.round_id(), 2, "a fresh round should have begun");
        assert_eq!(harness.events_of(i, "DkgRoundAborted"), 1);
    }
}

/// A dealer that withholds one commitment point triggers the complaint and
/// reconstruction path; the DKG still finalizes with a working collective
/// key on the honest nodes.
#[test]
fn withheld_commitment_point_still_certifies() {
    let cheater = 1;
    let mut faults = vec![DealerFaults::default(); 4];
    faults[cheater].truncate_commits = true;
    let mut harness = DkgHarness::new(4, 9, faults);

    harness.run();

    let honest: Vec<usize> = (0..4).filter(|i| *i != cheater).collect();
    let verifiers: Vec<_> = honest
        .iter()
        .map(|&i| {
            harness.coordinators[i]
                .verifier()
                .unwrap_or_else(|| panic!("honest node {i} should have certified"))
        })
        .collect();

    for &i in &honest {
        assert_eq!(harness.events_of(i, "DkgComplaintProcessed"), 1);
        assert_eq!(harness.events_of(i, "DkgReconstructCommitsProcessed"), 1);
    }

    // t = 2 of the honest shares suffice, and all honest nodes agree on the
    // collective key.
    let msg = b"reconstructed key still works";
    let partials: Vec<Vec<u8>> = verifiers.iter().map(|v| v.sign(msg).unwrap()).collect();
    let full = verifiers[0].recover(msg, &partials[..2]).unwrap();
    for verifier in &verifiers {
        verifier.verify_random_data(msg, &full).unwrap();
    }
}
