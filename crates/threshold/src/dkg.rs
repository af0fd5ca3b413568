//! Rabin-style distributed key generation.
//!
//! Every participant acts both as a dealer (sharing its own secret
//! polynomial) and as a verifier (checking everyone else's shares). The
//! protocol proceeds in two phases:
//!
//! **Phase I**: each dealer distributes Pedersen-committed, recipient-sealed
//! deals. Verifiers respond with approvals or complaints; a complained-about
//! dealer justifies by revealing the disputed share. Dealers with enough
//! approvals and no standing complaints form the QUAL set.
//!
//! **Phase II**: each qualified dealer reveals the plain commitments to its
//! secret polynomial. A dealer whose revealed commitments contradict its
//! Pedersen-committed deals is excluded the hard way: its shares are revealed
//! and its polynomial reconstructed, so its contribution still reaches the
//! collective key.
//!
//! The driving state machine (message ordering, readiness thresholds, round
//! aborts) lives in `beacon-dkg`; this type is purely computational and
//! assumes calls arrive in protocol order.

use crate::encoding::{G2Point, Sc};
use crate::poly::{PriPoly, PriShare, PubPoly};
use crate::ThresholdError;
use bls12_381::hash_to_curve::{ExpandMsgXmd, HashToCurve};
use bls12_381::{G2Projective, Scalar};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ff::Field;
use group::Group;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Domain separation tag for the Pedersen blinding generator.
const H2_DST: &[u8] = b"BEACON-DKG-PEDERSEN-BLS12381G2_XMD:SHA-256_SSWU_RO_";

/// Context string mixed into deal encryption keys.
const DEAL_KEY_CONTEXT: &[u8] = b"beacon-dkg-deal-key-v1";

#[derive(Debug, Error)]
pub enum DkgError {
    #[error("own public key not found among participants")]
    NotParticipant,

    #[error("threshold {t} invalid for {n} participants")]
    InvalidThreshold { t: usize, n: usize },

    #[error("unknown dealer index {0}")]
    UnknownDealer(u32),

    #[error("unknown verifier index {0}")]
    UnknownVerifier(u32),

    #[error("deal from ourselves")]
    OwnDeal,

    #[error("deal from dealer {0} already processed")]
    DuplicateDeal(u32),

    #[error("secret commits from dealer {0} already processed")]
    DuplicateCommits(u32),

    #[error("instance is not certified")]
    NotCertified,

    #[error("dealer {0} is not in the QUAL set")]
    NotQualified(u32),

    #[error("complaint against dealer {dealer} does not hold")]
    InvalidComplaint { dealer: u32 },

    #[error("instance is not finished")]
    NotFinished,

    #[error(transparent)]
    Threshold(#[from] ThresholdError),
}

/// A Phase I deal: Pedersen commitments plus the share pair sealed to its
/// recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deal {
    pub dealer: u32,
    pub commitments: Vec<G2Point>,
    pub encrypted: EncryptedShare,
}

/// An ephemeral-DH ChaCha20-Poly1305 box around the (share, blinding) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedShare {
    pub dh_point: G2Point,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// A verifier's verdict on one dealer's deal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub dealer: u32,
    pub verifier: u32,
    pub approved: bool,
}

/// A dealer's answer to a complaint: the disputed share pair in the clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Justification {
    pub dealer: u32,
    pub verifier: u32,
    pub share_f: Sc,
    pub share_g: Sc,
    pub commitments: Vec<G2Point>,
}

/// Phase II: the plain commitments to a dealer's secret polynomial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretCommits {
    pub dealer: u32,
    pub commitments: Vec<G2Point>,
}

/// Proof that a qualified dealer's revealed commitments contradict its
/// Pedersen-committed deal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplaintCommits {
    pub dealer: u32,
    pub verifier: u32,
    pub share_f: Sc,
    pub share_g: Sc,
    pub commitments: Vec<G2Point>,
}

/// A revealed share of a misbehaving dealer, for polynomial reconstruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconstructCommits {
    pub dealer: u32,
    pub verifier: u32,
    pub share_f: Sc,
}

/// The output of a finished DKG run.
#[derive(Debug, Clone)]
pub struct DistKeyShare {
    pub pri_share: PriShare,
    pub commitments: PubPoly,
}

impl DistKeyShare {
    /// The collective public key.
    pub fn public_key(&self) -> G2Projective {
        self.commitments.commit()
    }
}

/// A deal we verified and kept.
#[derive(Clone)]
struct ProcessedDeal {
    share_f: Scalar,
    share_g: Scalar,
    commitments: Vec<G2Projective>,
}

/// Rabin-style distributed key generator for one participant.
pub struct DistKeyGenerator {
    secret: Scalar,
    participants: Vec<G2Projective>,
    index: u32,
    threshold: usize,

    secret_poly: PriPoly,
    blind_poly: PriPoly,
    pedersen_commits: Vec<G2Projective>,

    deals: BTreeMap<u32, ProcessedDeal>,
    approvals: BTreeMap<u32, BTreeSet<u32>>,
    complaints: BTreeMap<u32, BTreeSet<u32>>,
    secret_commits: BTreeMap<u32, PubPoly>,
    bad_dealers: BTreeSet<u32>,
    reconstruct_pool: BTreeMap<u32, Vec<PriShare>>,
}

impl DistKeyGenerator {
    /// Create a generator for the participant whose long-term secret is
    /// `secret`. `participants` must hold every participant's public point in
    /// the canonical (address-sorted) order shared by all nodes.
    pub fn new<R: RngCore + CryptoRng>(
        secret: Scalar,
        participants: Vec<G2Projective>,
        threshold: usize,
        rng: &mut R,
    ) -> Result<Self, DkgError> {
        let n = participants.len();
        if threshold < 1 || threshold >= n {
            return Err(DkgError::InvalidThreshold { t: threshold, n });
        }
        let own_pub = G2Projective::generator() * secret;
        let index = participants
            .iter()
            .position(|p| *p == own_pub)
            .ok_or(DkgError::NotParticipant)? as u32;

        let secret_poly = PriPoly::new(Scalar::random(&mut *rng), threshold, rng);
        let blind_poly = PriPoly::new(Scalar::random(&mut *rng), threshold, rng);
        // E_k = g2^{f_k} · h2^{g_k}
        let h2 = pedersen_h();
        let pedersen_commits: Vec<G2Projective> = secret_poly
            .coeffs()
            .iter()
            .zip(blind_poly.coeffs())
            .map(|(f, g)| G2Projective::generator() * f + h2 * g)
            .collect();

        let mut dkg = DistKeyGenerator {
            secret,
            participants,
            index,
            threshold,
            secret_poly,
            blind_poly,
            pedersen_commits,
            deals: BTreeMap::new(),
            approvals: BTreeMap::new(),
            complaints: BTreeMap::new(),
            secret_commits: BTreeMap::new(),
            bad_dealers: BTreeSet::new(),
            reconstruct_pool: BTreeMap::new(),
        };

        // A dealer holds (and approves) its own deal from the start.
        dkg.deals.insert(
            index,
            ProcessedDeal {
                share_f: dkg.secret_poly.eval(index).value,
                share_g: dkg.blind_poly.eval(index).value,
                commitments: dkg.pedersen_commits.clone(),
            },
        );
        dkg.approvals.entry(index).or_default().insert(index);

        Ok(dkg)
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn participants(&self) -> usize {
        self.participants.len()
    }

    /// Produce one sealed deal per remote participant, keyed by recipient
    /// index.
    pub fn deals<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<BTreeMap<u32, Deal>, DkgError> {
        let mut out = BTreeMap::new();
        for recipient in 0..self.participants.len() as u32 {
            if recipient == self.index {
                continue;
            }
            let share_f = self.secret_poly.eval(recipient).value;
            let share_g = self.blind_poly.eval(recipient).value;

            let mut plaintext = Vec::with_capacity(64);
            plaintext.extend_from_slice(&share_f.to_bytes());
            plaintext.extend_from_slice(&share_g.to_bytes());

            let eph = Scalar::random(&mut *rng);
            let dh_point = G2Projective::generator() * eph;
            let shared = self.participants[recipient as usize] * eph;
            let key = deal_key(&shared);

            let mut nonce = [0u8; 12];
            rng.fill_bytes(&mut nonce);
            let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
            let ciphertext = cipher
                .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
                .expect("chacha20poly1305 encryption is infallible");

            out.insert(
                recipient,
                Deal {
                    dealer: self.index,
                    commitments: self
                        .pedersen_commits
                        .iter()
                        .map(|p| G2Point(*p))
                        .collect(),
                    encrypted: EncryptedShare {
                        dh_point: G2Point(dh_point),
                        nonce: nonce.to_vec(),
                        ciphertext,
                    },
                },
            );
        }
        Ok(out)
    }

    /// Open and verify a deal addressed to us, producing our response.
    ///
    /// A deal that fails to open or whose share contradicts its commitments
    /// yields a complaint response, not an error; errors are reserved for
    /// structural misuse (own deal, unknown or duplicate dealer).
    pub fn process_deal(&mut self, deal: &Deal) -> Result<Response, DkgError> {
        let dealer = deal.dealer;
        if dealer as usize >= self.participants.len() {
            return Err(DkgError::UnknownDealer(dealer));
        }
        if dealer == self.index {
            return Err(DkgError::OwnDeal);
        }
        if self.deals.contains_key(&dealer) {
            return Err(DkgError::DuplicateDeal(dealer));
        }

        let approved = self.open_and_verify(deal);
        if approved {
            self.record(dealer, self.index, true);
        } else {
            self.record(dealer, self.index, false);
        }
        Ok(Response {
            dealer,
            verifier: self.index,
            approved,
        })
    }

    fn open_and_verify(&mut self, deal: &Deal) -> bool {
        if deal.commitments.len() != self.threshold {
            return false;
        }
        if deal.encrypted.nonce.len() != 12 {
            return false;
        }
        let shared = deal.encrypted.dh_point.0 * self.secret;
        let key = deal_key(&shared);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let plaintext = match cipher.decrypt(
            Nonce::from_slice(&deal.encrypted.nonce),
            deal.encrypted.ciphertext.as_slice(),
        ) {
            Ok(p) if p.len() == 64 => p,
            _ => return false,
        };

        let f_bytes: [u8; 32] = plaintext[..32].try_into().expect("length checked");
        let g_bytes: [u8; 32] = plaintext[32..].try_into().expect("length checked");
        let share_f = match Option::<Scalar>::from(Scalar::from_bytes(&f_bytes)) {
            Some(s) => s,
            None => return false,
        };
        let share_g = match Option::<Scalar>::from(Scalar::from_bytes(&g_bytes)) {
            Some(s) => s,
            None => return false,
        };

        let commitments: Vec<G2Projective> = deal.commitments.iter().map(|p| p.0).collect();
        if !pedersen_check(&commitments, self.index, share_f, share_g) {
            return false;
        }

        self.deals.insert(
            deal.dealer,
            ProcessedDeal {
                share_f,
                share_g,
                commitments,
            },
        );
        true
    }

    /// Record another verifier's response. Produces a justification when the
    /// complaint targets our own deal.
    pub fn process_response(
        &mut self,
        resp: &Response,
    ) -> Result<Option<Justification>, DkgError> {
        let n = self.participants.len() as u32;
        if resp.dealer >= n {
            return Err(DkgError::UnknownDealer(resp.dealer));
        }
        if resp.verifier >= n {
            return Err(DkgError::UnknownVerifier(resp.verifier));
        }
        self.record(resp.dealer, resp.verifier, resp.approved);

        if !resp.approved && resp.dealer == self.index {
            return Ok(Some(Justification {
                dealer: self.index,
                verifier: resp.verifier,
                share_f: Sc(self.secret_poly.eval(resp.verifier).value),
                share_g: Sc(self.blind_poly.eval(resp.verifier).value),
                commitments: self
                    .pedersen_commits
                    .iter()
                    .map(|p| G2Point(*p))
                    .collect(),
            }));
        }
        Ok(None)
    }

    /// Check a dealer's justification of a complained-about share.
    pub fn process_justification(&mut self, just: &Justification) -> Result<(), DkgError> {
        let n = self.participants.len() as u32;
        if just.dealer >= n {
            return Err(DkgError::UnknownDealer(just.dealer));
        }
        if just.verifier >= n {
            return Err(DkgError::UnknownVerifier(just.verifier));
        }

        let commitments: Vec<G2Projective> = just.commitments.iter().map(|p| p.0).collect();
        let consistent = commitments.len() == self.threshold
            && self
                .deals
                .get(&just.dealer)
                .map(|d| d.commitments == commitments)
                .unwrap_or(true)
            && pedersen_check(&commitments, just.verifier, just.share_f.0, just.share_g.0);

        if consistent {
            // The complaint is answered; the verifier counts as approving.
            self.record(just.dealer, just.verifier, true);
            if let Some(set) = self.complaints.get_mut(&just.dealer) {
                set.remove(&just.verifier);
            }
        }
        // An inconsistent justification leaves the complaint standing, which
        // keeps the dealer out of QUAL.
        Ok(())
    }

    /// True once enough dealers are qualified to proceed to Phase II.
    pub fn certified(&self) -> bool {
        self.qual().len() >= self.threshold
    }

    /// The qualified dealers: enough approvals, no standing complaints.
    pub fn qual(&self) -> Vec<u32> {
        (0..self.participants.len() as u32)
            .filter(|d| {
                let approvals = self.approvals.get(d).map(|s| s.len()).unwrap_or(0);
                let complaints = self.complaints.get(d).map(|s| s.len()).unwrap_or(0);
                approvals >= self.threshold && complaints == 0
            })
            .collect()
    }

    /// Reveal the plain commitments to our secret polynomial (Phase II).
    pub fn secret_commits(&mut self) -> Result<SecretCommits, DkgError> {
        if !self.certified() {
            return Err(DkgError::NotCertified);
        }
        let commits = self.secret_poly.commit();
        self.secret_commits
            .insert(self.index, commits.clone());
        Ok(SecretCommits {
            dealer: self.index,
            commitments: commits.coeffs().iter().map(|p| G2Point(*p)).collect(),
        })
    }

    /// Verify a dealer's revealed commitments against our share of its deal.
    pub fn process_secret_commits(
        &mut self,
        sc: &SecretCommits,
    ) -> Result<Option<ComplaintCommits>, DkgError> {
        if sc.dealer as usize >= self.participants.len() {
            return Err(DkgError::UnknownDealer(sc.dealer));
        }
        if !self.qual().contains(&sc.dealer) {
            return Err(DkgError::NotQualified(sc.dealer));
        }
        if sc.dealer == self.index {
            return Ok(None);
        }
        if self.secret_commits.contains_key(&sc.dealer) {
            return Err(DkgError::DuplicateCommits(sc.dealer));
        }

        let Some(deal) = self.deals.get(&sc.dealer).cloned() else {
            // No share to check against; keep the commitments provisionally.
            let coeffs: Vec<G2Projective> = sc.commitments.iter().map(|p| p.0).collect();
            if coeffs.len() == self.threshold {
                self.secret_commits
                    .insert(sc.dealer, PubPoly::from_coeffs(coeffs));
            }
            return Ok(None);
        };

        let coeffs: Vec<G2Projective> = sc.commitments.iter().map(|p| p.0).collect();
        let valid = coeffs.len() == self.threshold
            && PubPoly::from_coeffs(coeffs.clone()).eval(self.index).value
                == G2Projective::generator() * deal.share_f;

        if valid {
            self.secret_commits
                .insert(sc.dealer, PubPoly::from_coeffs(coeffs));
            Ok(None)
        } else {
            Ok(Some(ComplaintCommits {
                dealer: sc.dealer,
                verifier: self.index,
                share_f: Sc(deal.share_f),
                share_g: Sc(deal.share_g),
                commitments: deal.commitments.iter().map(|p| G2Point(*p)).collect(),
            }))
        }
    }

    /// Verify a complaint against a qualified dealer. A valid complaint
    /// excludes the dealer's revealed commitments and yields our share of its
    /// deal for reconstruction.
    pub fn process_complaint_commits(
        &mut self,
        cc: &ComplaintCommits,
    ) -> Result<Option<ReconstructCommits>, DkgError> {
        let n = self.participants.len() as u32;
        if cc.dealer >= n {
            return Err(DkgError::UnknownDealer(cc.dealer));
        }
        if cc.verifier >= n {
            return Err(DkgError::UnknownVerifier(cc.verifier));
        }
        if !self.qual().contains(&cc.dealer) {
            return Err(DkgError::NotQualified(cc.dealer));
        }

        if self.bad_dealers.contains(&cc.dealer) {
            // Already convicted; our reconstruction share is already out.
            return Ok(None);
        }

        // The revealed share must be one the dealer actually dealt...
        let commitments: Vec<G2Projective> = cc.commitments.iter().map(|p| p.0).collect();
        let dealt = commitments.len() == self.threshold
            && self
                .deals
                .get(&cc.dealer)
                .map(|d| d.commitments == commitments)
                .unwrap_or(true)
            && pedersen_check(&commitments, cc.verifier, cc.share_f.0, cc.share_g.0);
        if !dealt {
            return Err(DkgError::InvalidComplaint { dealer: cc.dealer });
        }

        // ...and must contradict the dealer's revealed secret commitments. If
        // we rejected those commitments ourselves they are absent here, which
        // is a contradiction already.
        if let Some(pub_poly) = self.secret_commits.get(&cc.dealer) {
            let consistent = pub_poly.eval(cc.verifier).value
                == G2Projective::generator() * cc.share_f.0;
            if consistent {
                return Err(DkgError::InvalidComplaint { dealer: cc.dealer });
            }
            self.secret_commits.remove(&cc.dealer);
        }

        self.bad_dealers.insert(cc.dealer);
        let own_share = self
            .deals
            .get(&cc.dealer)
            .map(|d| d.share_f)
            .ok_or(DkgError::UnknownDealer(cc.dealer))?;
        self.pool_reconstruct_share(
            cc.dealer,
            PriShare {
                index: self.index,
                value: own_share,
            },
        );
        Ok(Some(ReconstructCommits {
            dealer: cc.dealer,
            verifier: self.index,
            share_f: Sc(own_share),
        }))
    }

    /// Pool a revealed share of a convicted dealer; reconstruct its
    /// polynomial once enough shares are in.
    pub fn process_reconstruct_commits(
        &mut self,
        rc: &ReconstructCommits,
    ) -> Result<(), DkgError> {
        let n = self.participants.len() as u32;
        if rc.dealer >= n {
            return Err(DkgError::UnknownDealer(rc.dealer));
        }
        if rc.verifier >= n {
            return Err(DkgError::UnknownVerifier(rc.verifier));
        }
        self.pool_reconstruct_share(
            rc.dealer,
            PriShare {
                index: rc.verifier,
                value: rc.share_f.0,
            },
        );
        self.try_reconstruct(rc.dealer)?;
        Ok(())
    }

    /// True once every qualified dealer's commitments are known (revealed or
    /// reconstructed).
    pub fn finished(&self) -> bool {
        self.certified()
            && self
                .qual()
                .iter()
                .all(|d| self.secret_commits.contains_key(d))
    }

    /// Extract the distributed key share. Only valid once finished.
    pub fn dist_key_share(&self) -> Result<DistKeyShare, DkgError> {
        if !self.finished() {
            return Err(DkgError::NotFinished);
        }
        let qual = self.qual();

        let mut share_value = Scalar::ZERO;
        let mut pub_poly: Option<PubPoly> = None;
        for dealer in &qual {
            let deal = self
                .deals
                .get(dealer)
                .ok_or(DkgError::UnknownDealer(*dealer))?;
            share_value += deal.share_f;

            let commits = self
                .secret_commits
                .get(dealer)
                .ok_or(DkgError::NotFinished)?;
            pub_poly = Some(match pub_poly {
                None => commits.clone(),
                Some(acc) => acc.add(commits)?,
            });
        }

        Ok(DistKeyShare {
            pri_share: PriShare {
                index: self.index,
                value: share_value,
            },
            commitments: pub_poly.ok_or(DkgError::NotFinished)?,
        })
    }

    fn record(&mut self, dealer: u32, verifier: u32, approved: bool) {
        if approved {
            self.approvals.entry(dealer).or_default().insert(verifier);
        } else {
            self.complaints.entry(dealer).or_default().insert(verifier);
        }
    }

    fn pool_reconstruct_share(&mut self, dealer: u32, share: PriShare) {
        let pool = self.reconstruct_pool.entry(dealer).or_default();
        if !pool.iter().any(|s| s.index == share.index) {
            pool.push(share);
        }
    }

    fn try_reconstruct(&mut self, dealer: u32) -> Result<(), DkgError> {
        if !self.bad_dealers.contains(&dealer) || self.secret_commits.contains_key(&dealer) {
            return Ok(());
        }
        let pool = self.reconstruct_pool.get(&dealer).cloned().unwrap_or_default();
        if pool.len() < self.threshold {
            return Ok(());
        }
        let poly = PriPoly::recover(&pool, self.threshold)?;
        self.secret_commits.insert(dealer, poly.commit());
        Ok(())
    }
}

/// The Pedersen blinding generator, hashed to a point with an unknown
/// discrete log relative to the standard generator.
fn pedersen_h() -> G2Projective {
    <G2Projective as HashToCurve<ExpandMsgXmd<sha2_09::Sha256>>>::hash_to_curve(
        b"beacon-dkg-h",
        H2_DST,
    )
}

/// Check `g2^f · h2^g == Π E_k^{x^k}` at the verifier's x-coordinate.
fn pedersen_check(
    commitments: &[G2Projective],
    verifier: u32,
    share_f: Scalar,
    share_g: Scalar,
) -> bool {
    let expected = PubPoly::from_coeffs(commitments.to_vec()).eval(verifier).value;
    let actual = G2Projective::generator() * share_f + pedersen_h() * share_g;
    expected == actual
}

fn deal_key(shared: &G2Projective) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bls12_381::G2Affine::from(shared).to_compressed());
    hasher.update(DEAL_KEY_CONTEXT);
    hasher.finalize().into()
}
