//! Threshold BLS signatures (signatures on G1, keys on G2).

use crate::poly::{lagrange_weight_at_zero, PriShare, PubPoly};
use crate::ThresholdError;
use bls12_381::hash_to_curve::{ExpandMsgXmd, HashToCurve};
use bls12_381::{pairing, G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
use ff::Field;
use group::Group;

/// Domain separation tag for hashing messages onto G1.
const DST: &[u8] = b"BEACON-BLS-SIG-BLS12381G1_XMD:SHA-256_SSWU_RO_";

/// A partial signature: the signer's share index plus its G1 point.
///
/// Encoded as 2 bytes big-endian index followed by the 48-byte compressed
/// point, so recovery needs no external index map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialSignature {
    pub index: u16,
    pub point: G1Projective,
}

impl PartialSignature {
    pub const ENCODED_LEN: usize = 2 + 48;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(&G1Affine::from(&self.point).to_compressed());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ThresholdError> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(ThresholdError::Decode(format!(
                "partial signature must be {} bytes, got {}",
                Self::ENCODED_LEN,
                bytes.len()
            )));
        }
        let index = u16::from_be_bytes([bytes[0], bytes[1]]);
        let arr: [u8; 48] = bytes[2..].try_into().expect("length checked above");
        let point = Option::<G1Affine>::from(G1Affine::from_compressed(&arr))
            .ok_or_else(|| ThresholdError::Decode("invalid G1 point".into()))?;
        Ok(PartialSignature {
            index,
            point: G1Projective::from(point),
        })
    }
}

/// Hash a message onto G1.
pub fn hash_to_g1(msg: &[u8]) -> G1Projective {
    <G1Projective as HashToCurve<ExpandMsgXmd<sha2_09::Sha256>>>::hash_to_curve(msg, DST)
}

/// Sign `msg` with a private share.
pub fn sign_share(share: &PriShare, msg: &[u8]) -> PartialSignature {
    PartialSignature {
        index: share.index as u16,
        point: hash_to_g1(msg) * share.value,
    }
}

/// Verify a partial signature against the collective public polynomial.
pub fn verify_partial(
    pub_poly: &PubPoly,
    msg: &[u8],
    partial: &PartialSignature,
) -> Result<(), ThresholdError> {
    let pub_share = pub_poly.eval(partial.index as u32).value;
    let h = hash_to_g1(msg);
    let lhs = pairing(&G1Affine::from(&h), &G2Affine::from(&pub_share));
    let rhs = pairing(
        &G1Affine::from(&partial.point),
        &G2Affine::generator(),
    );
    if lhs == rhs {
        Ok(())
    } else {
        Err(ThresholdError::InvalidShare {
            index: partial.index,
        })
    }
}

/// Combine at least `threshold` partial signatures into the full signature
/// and check it against the collective key.
pub fn recover_signature(
    pub_poly: &PubPoly,
    msg: &[u8],
    partials: &[PartialSignature],
    threshold: usize,
) -> Result<Vec<u8>, ThresholdError> {
    // Deduplicate by index; recovery is deterministic on the chosen subset
    // because indices are taken in ascending order.
    let mut by_index: std::collections::BTreeMap<u16, &PartialSignature> =
        std::collections::BTreeMap::new();
    for p in partials {
        by_index.entry(p.index).or_insert(p);
    }
    if by_index.len() < threshold {
        return Err(ThresholdError::InsufficientShares {
            got: by_index.len(),
            need: threshold,
        });
    }

    let subset: Vec<&PartialSignature> = by_index.values().take(threshold).copied().collect();
    let index_set: Vec<PriShare> = subset
        .iter()
        .map(|p| PriShare {
            index: p.index as u32,
            value: Scalar::ZERO,
        })
        .collect();

    let mut full = G1Projective::identity();
    for partial in &subset {
        let weight = lagrange_weight_at_zero(&index_set, partial.index as u32)?;
        full += partial.point * weight;
    }

    let sig_bytes = G1Affine::from(&full).to_compressed().to_vec();
    verify_signature(&pub_poly.commit(), msg, &sig_bytes)?;
    Ok(sig_bytes)
}

/// Verify a full threshold signature against the collective public key.
pub fn verify_signature(
    collective_key: &G2Projective,
    msg: &[u8],
    signature: &[u8],
) -> Result<(), ThresholdError> {
    let arr: [u8; 48] = signature
        .try_into()
        .map_err(|_| ThresholdError::Decode("signature must be 48 bytes".into()))?;
    let sig = Option::<G1Affine>::from(G1Affine::from_compressed(&arr))
        .ok_or_else(|| ThresholdError::Decode("invalid G1 point".into()))?;

    let h = hash_to_g1(msg);
    let lhs = pairing(&G1Affine::from(&h), &G2Affine::from(collective_key));
    let rhs = pairing(&sig, &G2Affine::generator());
    if lhs == rhs {
        Ok(())
    } else {
        Err(ThresholdError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poly::PriPoly;
    use ff::Field;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn setup(n: u32, t: usize) -> (PriPoly, PubPoly, Vec<PriShare>) {
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let poly = PriPoly::new(Scalar::random(&mut rng), t, &mut rng);
        let commit = poly.commit();
        let shares = (0..n).map(|i| poly.eval(i)).collect();
        (poly, commit, shares)
    }

    #[test]
    fn partial_signatures_verify() {
        let (_, commit, shares) = setup(4, 2);
        let msg = b"beacon round 1";
        for share in &shares {
            let partial = sign_share(share, msg);
            verify_partial(&commit, msg, &partial).unwrap();
        }
    }

    #[test]
    fn wrong_message_rejected() {
        let (_, commit, shares) = setup(4, 2);
        let partial = sign_share(&shares[0], b"message a");
        assert!(matches!(
            verify_partial(&commit, b"message b", &partial),
            Err(ThresholdError::InvalidShare { index: 0 })
        ));
    }

    #[test]
    fn recovery_needs_threshold_partials() {
        let (_, commit, shares) = setup(4, 3);
        let msg = b"needs three";
        let partials: Vec<PartialSignature> =
            shares.iter().map(|s| sign_share(s, msg)).collect();

        assert!(matches!(
            recover_signature(&commit, msg, &partials[..2], 3),
            Err(ThresholdError::InsufficientShares { got: 2, need: 3 })
        ));
        let sig = recover_signature(&commit, msg, &partials[..3], 3).unwrap();
        verify_signature(&commit.commit(), msg, &sig).unwrap();
    }

    #[test]
    fn recovery_is_subset_independent() {
        let (_, commit, shares) = setup(5, 3);
        let msg = b"any subset";
        let partials: Vec<PartialSignature> =
            shares.iter().map(|s| sign_share(s, msg)).collect();

        let a = recover_signature(&commit, msg, &partials[..3], 3).unwrap();
        let b = recover_signature(&commit, msg, &partials[2..], 3).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn partial_encoding_roundtrip() {
        let (_, _, shares) = setup(4, 2);
        let partial = sign_share(&shares[2], b"enc");
        let decoded = PartialSignature::decode(&partial.encode()).unwrap();
        assert_eq!(partial, decoded);
    }
}
