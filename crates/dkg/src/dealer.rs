//! The DKG dealer: a phased state machine over one key-generation round.
//!
//! Transitions live in an ordered queue and execute strictly in order. Each
//! transition reports whether its inputs are ready; a not-ready head stops
//! the drain until the next inbound message, an error aborts the round. The
//! actual cryptography is `beacon_threshold::DistKeyGenerator`; the dealer
//! owns message collection, deduplication, readiness thresholds, and the
//! QUAL/loser bookkeeping.

use beacon_core::NodeEvent;
use beacon_threshold::dkg::{
    ComplaintCommits, Deal, DistKeyGenerator, Justification, ReconstructCommits, Response,
    SecretCommits,
};
use beacon_threshold::{BlsShare, BlsVerifier, DkgError, G2Point};
use beacon_types::{wire_decode, wire_encode, Address, DkgMessage, DkgMessageKind, ValidatorSet};
use bls12_381::{G2Projective, Scalar};
use ff::Field;
use group::Group;
use rand_chacha::ChaCha20Rng;
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DealerError {
    #[error("failed to decode {kind} payload from {from}: {reason}")]
    Decode {
        kind: DkgMessageKind,
        from: Address,
        reason: String,
    },

    #[error("commits entity count {claimed} does not match payload {actual}")]
    EntityCountMismatch { claimed: u32, actual: u32 },

    #[error("instance is not certified")]
    NotCertified,

    #[error("some participants failed to complete phase I")]
    PhaseIIncomplete,

    #[error("round is finished but the dkg instance is not ready")]
    InstanceNotReady,

    #[error("verifier is not ready")]
    VerifierNotReady,

    #[error(transparent)]
    Instance(#[from] DkgError),
}

/// Misbehavior switches for tests: each reproduces a concrete byzantine
/// dealer without touching the protocol code.
#[derive(Debug, Clone, Copy, Default)]
pub struct DealerFaults {
    /// Never broadcast any deal (the "silent dealer").
    pub withhold_deals: bool,
    /// Skip the deal addressed to one participant index.
    pub withhold_deal_to: Option<u32>,
    /// Broadcast one commitment point short in the Commits message.
    pub truncate_commits: bool,
}

/// The ordered transition queue entries, one per protocol stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    SendDeals,
    ProcessDeals,
    ProcessResponses,
    ProcessJustifications,
    ProcessCommits,
    ProcessComplaints,
    ProcessReconstructCommits,
}

/// One participant's view of a DKG round.
pub struct Dealer {
    validators: ValidatorSet,
    addr: Address,
    round_id: u64,
    faults: DealerFaults,
    rng: ChaCha20Rng,

    sec_key: Option<Scalar>,
    instance: Option<DistKeyGenerator>,
    participant_id: Option<u32>,
    transitions: VecDeque<Transition>,

    /// Sorted on use; deduplicated on insert.
    pub_keys: Vec<(Address, G2Projective)>,
    deals: BTreeMap<Address, Deal>,
    responses: Vec<Response>,
    justifications: BTreeMap<Address, Option<Justification>>,
    commits: Vec<SecretCommits>,
    complaints: Vec<Option<ComplaintCommits>>,
    reconstruct_commits: Vec<Option<ReconstructCommits>>,

    losers: Vec<Address>,

    outbox: Vec<DkgMessage>,
    events: Vec<NodeEvent>,
}

impl Dealer {
    pub fn new(
        validators: ValidatorSet,
        addr: Address,
        faults: DealerFaults,
        rng: ChaCha20Rng,
    ) -> Self {
        Dealer {
            validators,
            addr,
            round_id: 0,
            faults,
            rng,
            sec_key: None,
            instance: None,
            participant_id: None,
            transitions: VecDeque::new(),
            pub_keys: Vec::new(),
            deals: BTreeMap::new(),
            responses: Vec::new(),
            justifications: BTreeMap::new(),
            commits: Vec::new(),
            complaints: Vec::new(),
            reconstruct_commits: Vec::new(),
            losers: Vec::new(),
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn round_id(&self) -> u64 {
        self.round_id
    }

    pub fn losers(&self) -> &[Address] {
        &self.losers
    }

    /// Outbound messages produced since the last drain.
    pub fn take_outbox(&mut self) -> Vec<DkgMessage> {
        std::mem::take(&mut self.outbox)
    }

    /// Events fired since the last drain.
    pub fn take_events(&mut self) -> Vec<NodeEvent> {
        std::mem::take(&mut self.events)
    }

    /// Begin a new round: sample a fresh round key, queue the transitions,
    /// broadcast our round public key.
    pub fn start(&mut self) -> Result<(), DealerError> {
        self.round_id += 1;
        let sec_key = Scalar::random(&mut self.rng);
        let pub_key = G2Projective::generator() * sec_key;
        self.sec_key = Some(sec_key);
        self.generate_transitions();

        info!(round_id = self.round_id, "dkg: sending round public key");
        self.send(DkgMessage::new(
            DkgMessageKind::PubKey,
            self.round_id,
            self.addr,
            wire_encode(&G2Point(pub_key)),
        ));
        Ok(())
    }

    /// Clear every field so nothing leaks into the next round.
    pub fn reset(&mut self) {
        self.sec_key = None;
        self.instance = None;
        self.participant_id = None;
        self.transitions.clear();
        self.pub_keys.clear();
        self.deals.clear();
        self.responses.clear();
        self.justifications.clear();
        self.commits.clear();
        self.complaints.clear();
        self.reconstruct_commits.clear();
        self.losers.clear();
        self.outbox.clear();
        self.events.clear();
    }

    fn generate_transitions(&mut self) {
        self.transitions = VecDeque::from([
            // Phase I
            Transition::SendDeals,
            Transition::ProcessDeals,
            Transition::ProcessResponses,
            Transition::ProcessJustifications,
            // Phase II
            Transition::ProcessCommits,
            Transition::ProcessComplaints,
            Transition::ProcessReconstructCommits,
        ]);
    }

    /// Route one inbound message and drain any newly ready transitions.
    pub fn handle_message(&mut self, msg: &DkgMessage) -> Result<(), DealerError> {
        match msg.kind {
            DkgMessageKind::PubKey => self.handle_pub_key(msg)?,
            DkgMessageKind::Deal => self.handle_deal(msg)?,
            DkgMessageKind::Response => self.handle_response(msg)?,
            DkgMessageKind::Justification => self.handle_justification(msg)?,
            DkgMessageKind::Commits => self.handle_commit(msg)?,
            DkgMessageKind::Complaint => self.handle_complaint(msg)?,
            DkgMessageKind::ReconstructCommit => self.handle_reconstruct_commit(msg)?,
        }
        self.transit()
    }

    /// Drain ready transitions from the head of the queue.
    pub fn transit(&mut self) -> Result<(), DealerError> {
        while let Some(transition) = self.transitions.front().copied() {
            let ready = match transition {
                Transition::SendDeals => self.send_deals()?,
                Transition::ProcessDeals => self.process_deals()?,
                Transition::ProcessResponses => self.process_responses()?,
                Transition::ProcessJustifications => self.process_justifications()?,
                Transition::ProcessCommits => self.process_commits()?,
                Transition::ProcessComplaints => self.process_complaints()?,
                Transition::ProcessReconstructCommits => self.process_reconstruct_commits()?,
            };
            if !ready {
                return Ok(());
            }
            self.transitions.pop_front();
        }
        Ok(())
    }

    /// Extract the verifier once the instance has finished.
    pub fn verifier(&self) -> Result<BlsVerifier, DealerError> {
        let instance = self.instance.as_ref().ok_or(DealerError::VerifierNotReady)?;
        if !instance.finished() {
            return Err(DealerError::VerifierNotReady);
        }
        let share = instance.dist_key_share()?;
        let n = self.validators.size();
        let t = n * 2 / 3;
        let participants: Vec<Address> = {
            let mut addrs: Vec<Address> = self.pub_keys.iter().map(|(a, _)| *a).collect();
            addrs.sort();
            addrs
        };
        Ok(BlsVerifier::new(
            share.commitments.clone(),
            Some(BlsShare {
                id: share.pri_share.index,
                pri_share: share.pri_share,
            }),
            t,
            n,
            participants,
        ))
    }

    /// Who to blame when a round dies: participants that never showed up at
    /// the stage we are stuck on, or the non-QUAL set once the instance
    /// exists.
    pub fn compute_losers(&mut self) {
        if !self.losers.is_empty() {
            return;
        }
        let losers: Vec<Address> = if self.pub_keys.len() < self.validators.size() {
            self.validators
                .addresses()
                .into_iter()
                .filter(|a| *a != self.addr && !self.pub_keys.iter().any(|(pk, _)| pk == a))
                .collect()
        } else if self.deals.len() < self.validators.size() - 1 {
            self.validators
                .addresses()
                .into_iter()
                .filter(|a| *a != self.addr && !self.deals.contains_key(a))
                .collect()
        } else if let Some(instance) = self.instance.as_ref() {
            let qual = instance.qual();
            self.sorted_addresses()
                .iter()
                .enumerate()
                .filter(|(idx, _)| !qual.contains(&(*idx as u32)))
                .map(|(_, a)| *a)
                .collect()
        } else {
            vec![]
        };
        self.losers = losers;
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Phase I
    // ═══════════════════════════════════════════════════════════════════════

    fn handle_pub_key(&mut self, msg: &DkgMessage) -> Result<(), DealerError> {
        let point: G2Point = decode(msg)?;
        // Deduplicate (addr, point) pairs.
        if !self
            .pub_keys
            .iter()
            .any(|(a, p)| *a == msg.addr && *p == point.0)
        {
            self.pub_keys.push((msg.addr, point.0));
        }
        Ok(())
    }

    fn send_deals(&mut self) -> Result<bool, DealerError> {
        if self.pub_keys.len() < self.validators.size() {
            return Ok(false);
        }
        self.events.push(NodeEvent::DkgPubKeyReceived {
            round_id: self.round_id,
        });

        // Canonical participant order: sorted by address.
        self.pub_keys.sort_by(|a, b| a.0.cmp(&b.0));
        let points: Vec<G2Projective> = self.pub_keys.iter().map(|(_, p)| *p).collect();
        let threshold = self.validators.size() * 2 / 3;
        let sec_key = self.sec_key.expect("round started");
        let mut instance =
            DistKeyGenerator::new(sec_key, points, threshold, &mut self.rng)?;
        self.participant_id = Some(instance.index());

        let deals = instance.deals(&mut self.rng)?;
        self.instance = Some(instance);

        let mut sent = 0;
        for (to_index, deal) in deals {
            if self.faults.withhold_deals || self.faults.withhold_deal_to == Some(to_index) {
                continue;
            }
            let msg = DkgMessage::new(
                DkgMessageKind::Deal,
                self.round_id,
                self.addr,
                wire_encode(&deal),
            )
            .with_to_index(to_index);
            self.send(msg);
            sent += 1;
        }
        info!(round_id = self.round_id, deals = sent, "dkg: sending deals");
        Ok(true)
    }

    fn handle_deal(&mut self, msg: &DkgMessage) -> Result<(), DealerError> {
        // Deals carry their recipient; everyone else drops them.
        if msg.to_index != self.participant_id {
            debug!(intended = ?msg.to_index, "dkg: rejecting deal meant for another participant");
            return Ok(());
        }
        if self.deals.contains_key(&msg.addr) {
            return Ok(());
        }
        let deal: Deal = decode(msg)?;
        debug!(from = %msg.addr, "dkg: deal is for us, storing");
        self.deals.insert(msg.addr, deal);
        Ok(())
    }

    fn process_deals(&mut self) -> Result<bool, DealerError> {
        if self.deals.len() < self.validators.size() - 1 {
            return Ok(false);
        }
        info!(round_id = self.round_id, deals = self.deals.len(), "dkg: processing deals");

        let instance = self.instance.as_mut().expect("deals sent before processing");
        let mut messages = Vec::new();
        for deal in self.deals.values() {
            let response = instance.process_deal(deal)?;
            messages.push(DkgMessage::new(
                DkgMessageKind::Response,
                self.round_id,
                self.addr,
                wire_encode(&response),
            ));
        }
        for msg in messages {
            self.send(msg);
        }
        self.events.push(NodeEvent::DkgDealsProcessed {
            round_id: self.round_id,
        });
        Ok(true)
    }

    fn handle_response(&mut self, msg: &DkgMessage) -> Result<(), DealerError> {
        let response: Response = decode(msg)?;
        // Our own responses come back through gossip; skip them.
        if Some(response.verifier) == self.participant_id {
            debug!("dkg: skipping our own response");
            return Ok(());
        }
        self.responses.push(response);
        Ok(())
    }

    fn process_responses(&mut self) -> Result<bool, DealerError> {
        let n = self.validators.size();
        if self.responses.len() < (n - 1) * (n - 1) {
            return Ok(false);
        }
        info!(
            round_id = self.round_id,
            responses = self.responses.len(),
            "dkg: processing responses"
        );

        let instance = self.instance.as_mut().expect("deals sent before responses");
        let mut messages = Vec::new();
        for response in &self.responses {
            // The justification payload stays empty unless this response
            // complains about our own deal.
            let justification = instance.process_response(response)?;
            let data = justification.map(|j| wire_encode(&j)).unwrap_or_default();
            messages.push(DkgMessage::new(
                DkgMessageKind::Justification,
                self.round_id,
                self.addr,
                data,
            ));
        }
        for msg in messages {
            self.send(msg);
        }
        self.events.push(NodeEvent::DkgResponsesProcessed {
            round_id: self.round_id,
        });
        Ok(true)
    }

    fn handle_justification(&mut self, msg: &DkgMessage) -> Result<(), DealerError> {
        if self.justifications.contains_key(&msg.addr) {
            return Ok(());
        }
        let justification = if msg.data.is_empty() {
            None
        } else {
            Some(decode::<Justification>(msg)?)
        };
        self.justifications.insert(msg.addr, justification);
        Ok(())
    }

    fn process_justifications(&mut self) -> Result<bool, DealerError> {
        if self.justifications.len() < self.validators.size() {
            return Ok(false);
        }
        info!(round_id = self.round_id, "dkg: processing justifications");

        {
            let instance = self
                .instance
                .as_mut()
                .expect("deals sent before justifications");
            for justification in self.justifications.values().flatten() {
                debug!(
                    dealer = justification.dealer,
                    "dkg: processing non-empty justification"
                );
                instance.process_justification(justification)?;
            }
        }
        self.events.push(NodeEvent::DkgJustificationsProcessed {
            round_id: self.round_id,
        });

        let certified = self
            .instance
            .as_ref()
            .is_some_and(|instance| instance.certified());
        if !certified {
            return Err(DealerError::NotCertified);
        }
        self.events.push(NodeEvent::DkgInstanceCertified {
            round_id: self.round_id,
        });

        let qual = self.instance.as_ref().expect("instance exists").qual();
        info!(round_id = self.round_id, qual = ?qual, "dkg: got the QUAL set");
        if qual.len() < self.validators.size() {
            let addrs = self.sorted_addresses();
            for (idx, addr) in addrs.iter().enumerate() {
                if !qual.contains(&(idx as u32)) {
                    self.losers.push(*addr);
                }
            }
            return Err(DealerError::PhaseIIncomplete);
        }

        let mut commits = self
            .instance
            .as_mut()
            .expect("instance exists")
            .secret_commits()?;
        if self.faults.truncate_commits {
            commits.commitments.pop();
        }
        let num_entities = commits.commitments.len() as u32;
        let msg = DkgMessage::new(
            DkgMessageKind::Commits,
            self.round_id,
            self.addr,
            wire_encode(&commits),
        )
        .with_num_entities(num_entities);
        self.send(msg);
        Ok(true)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Phase II
    // ═══════════════════════════════════════════════════════════════════════

    fn handle_commit(&mut self, msg: &DkgMessage) -> Result<(), DealerError> {
        let commits: SecretCommits = decode(msg)?;
        let actual = commits.commitments.len() as u32;
        if msg.num_entities != Some(actual) {
            return Err(DealerError::EntityCountMismatch {
                claimed: msg.num_entities.unwrap_or(0),
                actual,
            });
        }
        self.commits.push(commits);
        Ok(())
    }

    fn process_commits(&mut self) -> Result<bool, DealerError> {
        let Some(instance) = self.instance.as_mut() else {
            return Ok(false);
        };
        if self.commits.len() < instance.qual().len() {
            return Ok(false);
        }
        info!(round_id = self.round_id, "dkg: processing commits");

        let mut any_complaint = false;
        let mut messages = Vec::new();
        for commits in &self.commits {
            let mut msg = DkgMessage::new(
                DkgMessageKind::Complaint,
                self.round_id,
                self.addr,
                vec![],
            );
            match instance.process_secret_commits(commits) {
                Ok(None) => {}
                Ok(Some(complaint)) => {
                    any_complaint = true;
                    msg.num_entities = Some(complaint.commitments.len() as u32);
                    msg.data = wire_encode(&complaint);
                }
                // Commits from our own broadcast echo back once.
                Err(DkgError::DuplicateCommits(_)) => continue,
                Err(e) => return Err(e.into()),
            }
            messages.push(msg);
        }
        self.events.push(NodeEvent::DkgCommitsProcessed {
            round_id: self.round_id,
        });

        // With nothing to complain about the instance is already finished;
        // the coordinator will pick the verifier up. Only a complaint makes
        // the remaining phases necessary.
        if any_complaint {
            for msg in messages {
                self.send(msg);
            }
        }
        Ok(true)
    }

    fn handle_complaint(&mut self, msg: &DkgMessage) -> Result<(), DealerError> {
        let complaint = if msg.data.is_empty() {
            None
        } else {
            Some(decode::<ComplaintCommits>(msg)?)
        };
        self.complaints.push(complaint);
        Ok(())
    }

    fn process_complaints(&mut self) -> Result<bool, DealerError> {
        let Some(instance) = self.instance.as_mut() else {
            return Ok(false);
        };
        if self.complaints.len() < instance.qual().len() - 1 {
            return Ok(false);
        }
        info!(round_id = self.round_id, "dkg: processing complaints");

        let mut messages = Vec::new();
        for complaint in &self.complaints {
            let mut msg = DkgMessage::new(
                DkgMessageKind::ReconstructCommit,
                self.round_id,
                self.addr,
                vec![],
            );
            if let Some(complaint) = complaint {
                if let Some(reconstruct) = instance.process_complaint_commits(complaint)? {
                    msg.data = wire_encode(&reconstruct);
                }
            }
            messages.push(msg);
        }
        for msg in messages {
            self.send(msg);
        }
        self.events.push(NodeEvent::DkgComplaintProcessed {
            round_id: self.round_id,
        });
        Ok(true)
    }

    fn handle_reconstruct_commit(&mut self, msg: &DkgMessage) -> Result<(), DealerError> {
        let reconstruct = if msg.data.is_empty() {
            None
        } else {
            Some(decode::<ReconstructCommits>(msg)?)
        };
        self.reconstruct_commits.push(reconstruct);
        Ok(())
    }

    fn process_reconstruct_commits(&mut self) -> Result<bool, DealerError> {
        let Some(instance) = self.instance.as_mut() else {
            return Ok(false);
        };
        if self.reconstruct_commits.len() < instance.qual().len() - 1 {
            return Ok(false);
        }
        info!(round_id = self.round_id, "dkg: processing reconstruct commits");

        for reconstruct in self.reconstruct_commits.iter().flatten() {
            instance.process_reconstruct_commits(reconstruct)?;
        }
        self.events.push(NodeEvent::DkgReconstructCommitsProcessed {
            round_id: self.round_id,
        });

        if !instance.finished() {
            return Err(DealerError::InstanceNotReady);
        }
        Ok(true)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Helpers
    // ═══════════════════════════════════════════════════════════════════════

    fn send(&mut self, msg: DkgMessage) {
        self.outbox.push(msg);
    }

    fn sorted_addresses(&self) -> Vec<Address> {
        let mut addrs: Vec<Address> = self.pub_keys.iter().map(|(a, _)| *a).collect();
        addrs.sort();
        addrs
    }
}

fn decode<'a, T: serde::Deserialize<'a>>(msg: &'a DkgMessage) -> Result<T, DealerError> {
    wire_decode(&msg.data).map_err(|e| {
        warn!(kind = %msg.kind, from = %msg.addr, "dkg: failed to decode payload");
        DealerError::Decode {
            kind: msg.kind,
            from: msg.addr,
            reason: e.to_string(),
        }
    })
}

impl std::fmt::Debug for Dealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dealer")
            .field("round_id", &self.round_id)
            .field("participant_id", &self.participant_id)
            .field("pub_keys", &self.pub_keys.len())
            .field("deals", &self.deals.len())
            .field("responses", &self.responses.len())
            .field("pending_transitions", &self.transitions.len())
            .finish()
    }
}
