//! The per-node threshold BLS verifier handed from DKG to consensus.

use crate::poly::{PriShare, PubPoly};
use crate::sig::{self, PartialSignature};
use crate::ThresholdError;
use beacon_types::Address;
use std::collections::BTreeMap;

/// This node's share of the distributed key.
#[derive(Debug, Clone)]
pub struct BlsShare {
    /// DKG participant index.
    pub id: u32,
    pub pri_share: PriShare,
}

/// Threshold BLS verifier: collective public polynomial, this node's private
/// share, and the (t, n) parameters.
///
/// Shared read-only between the DKG coordinator (which replaces it when a
/// round certifies) and the consensus core (which signs precommit partials
/// and recovers block randomness with it). Deterministic on its inputs.
pub struct BlsVerifier {
    master_poly: PubPoly,
    share: Option<BlsShare>,
    t: usize,
    n: usize,
    /// Validator address → DKG participant index, captured at key generation.
    index_by_addr: BTreeMap<Address, u32>,
}

impl BlsVerifier {
    /// Assemble a verifier from DKG output.
    ///
    /// `participants` must be the canonical (address-sorted) participant
    /// ordering used by the DKG round, so that share indices line up.
    pub fn new(
        master_poly: PubPoly,
        share: Option<BlsShare>,
        t: usize,
        n: usize,
        participants: Vec<Address>,
    ) -> Self {
        let index_by_addr = participants
            .into_iter()
            .enumerate()
            .map(|(i, addr)| (addr, i as u32))
            .collect();
        BlsVerifier {
            master_poly,
            share,
            t,
            n,
            index_by_addr,
        }
    }

    pub fn threshold(&self) -> usize {
        self.t
    }

    pub fn participants(&self) -> usize {
        self.n
    }

    /// Sign `msg` with this node's private share.
    pub fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, ThresholdError> {
        let share = self.share.as_ref().ok_or(ThresholdError::MissingShare)?;
        Ok(sig::sign_share(&share.pri_share, msg).encode())
    }

    /// Verify a single partial signature attributed to `addr`.
    pub fn verify_share(
        &self,
        addr: &Address,
        msg: &[u8],
        partial: &[u8],
    ) -> Result<(), ThresholdError> {
        let expected_index = *self
            .index_by_addr
            .get(addr)
            .ok_or(ThresholdError::UnknownValidator(*addr))?;
        let partial = PartialSignature::decode(partial)?;
        if partial.index as u32 != expected_index {
            return Err(ThresholdError::InvalidShare {
                index: partial.index,
            });
        }
        sig::verify_partial(&self.master_poly, msg, &partial)
    }

    /// Aggregate at least t partial signatures into the full threshold
    /// signature over `msg`.
    pub fn recover(&self, msg: &[u8], partials: &[Vec<u8>]) -> Result<Vec<u8>, ThresholdError> {
        let decoded: Vec<PartialSignature> = partials
            .iter()
            .filter_map(|bytes| PartialSignature::decode(bytes).ok())
            .filter(|p| sig::verify_partial(&self.master_poly, msg, p).is_ok())
            .collect();
        sig::recover_signature(&self.master_poly, msg, &decoded, self.t)
    }

    /// Check that `new_random` is a valid threshold signature of the
    /// collective key over `prev_random`.
    pub fn verify_random_data(
        &self,
        prev_random: &[u8],
        new_random: &[u8],
    ) -> Result<(), ThresholdError> {
        sig::verify_signature(&self.master_poly.commit(), prev_random, new_random)
    }

    /// Deal verifiers for a test network from a master polynomial directly
    /// (trusted-dealer mode). One verifier per address, in the given order;
    /// `t = ⌊2n/3⌋`.
    pub fn dealer<R: rand::RngCore + rand::CryptoRng>(
        addresses: &[Address],
        rng: &mut R,
    ) -> Vec<std::sync::Arc<BlsVerifier>> {
        use crate::poly::PriPoly;
        use bls12_381::Scalar;
        use ff::Field;

        let n = addresses.len();
        let t = n * 2 / 3;
        let poly = PriPoly::new(Scalar::random(&mut *rng), t.max(1), rng);
        let master = poly.commit();

        (0..n as u32)
            .map(|i| {
                std::sync::Arc::new(BlsVerifier::new(
                    master.clone(),
                    Some(BlsShare {
                        id: i,
                        pri_share: poly.eval(i),
                    }),
                    t.max(1),
                    n,
                    addresses.to_vec(),
                ))
            })
            .collect()
    }
}

impl std::fmt::Debug for BlsVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlsVerifier")
            .field("t", &self.t)
            .field("n", &self.n)
            .field("has_share", &self.share.is_some())
            .finish()
    }
}
