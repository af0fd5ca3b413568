//! Polynomials over the BLS12-381 scalar field, in the clear and in the
//! exponent.
//!
//! Share x-coordinates are `index + 1` throughout: participant `i` evaluates
//! at `x = i + 1`, keeping the secret at `x = 0` off every share.

use crate::ThresholdError;
use bls12_381::{G2Projective, Scalar};
use ff::Field;
use group::Group;
use rand::{CryptoRng, RngCore};

/// A share of a secret polynomial: the evaluation at `x = i + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriShare {
    pub index: u32,
    pub value: Scalar,
}

/// A public share: the commitment polynomial evaluated at `x = i + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubShare {
    pub index: u32,
    pub value: G2Projective,
}

/// A secret polynomial of degree `t - 1`.
#[derive(Clone)]
pub struct PriPoly {
    coeffs: Vec<Scalar>,
}

impl PriPoly {
    /// Sample a random polynomial with the given constant term and threshold.
    pub fn new<R: RngCore + CryptoRng>(secret: Scalar, threshold: usize, rng: &mut R) -> Self {
        assert!(threshold >= 1, "threshold must be at least 1");
        let mut coeffs = Vec::with_capacity(threshold);
        coeffs.push(secret);
        for _ in 1..threshold {
            coeffs.push(Scalar::random(&mut *rng));
        }
        PriPoly { coeffs }
    }

    /// Number of shares needed to reconstruct (degree + 1).
    pub fn threshold(&self) -> usize {
        self.coeffs.len()
    }

    pub fn coeffs(&self) -> &[Scalar] {
        &self.coeffs
    }

    pub fn secret(&self) -> Scalar {
        self.coeffs[0]
    }

    /// Evaluate at participant `index` (x = index + 1), Horner style.
    pub fn eval(&self, index: u32) -> PriShare {
        let x = x_coord(index);
        let mut acc = Scalar::ZERO;
        for coeff in self.coeffs.iter().rev() {
            acc = acc * x + coeff;
        }
        PriShare { index, value: acc }
    }

    /// The commitment polynomial `g₂^{a_k}`.
    pub fn commit(&self) -> PubPoly {
        PubPoly {
            coeffs: self
                .coeffs
                .iter()
                .map(|c| G2Projective::generator() * c)
                .collect(),
        }
    }

    /// Recover the polynomial coefficients from `t` distinct shares.
    ///
    /// Used when a qualified dealer misbehaves in Phase II and the group
    /// reconstructs its contribution from the revealed shares.
    pub fn recover(shares: &[PriShare], threshold: usize) -> Result<PriPoly, ThresholdError> {
        let points: Vec<(Scalar, Scalar)> = dedup_shares(shares, threshold)?
            .iter()
            .map(|s| (x_coord(s.index), s.value))
            .collect();

        let mut coeffs = vec![Scalar::ZERO; threshold];
        for (j, (xj, yj)) in points.iter().enumerate() {
            let basis = lagrange_basis(&points, j, *xj)?;
            for (k, b) in basis.iter().enumerate() {
                coeffs[k] += *b * yj;
            }
        }
        Ok(PriPoly { coeffs })
    }
}

/// A polynomial committed in the exponent on G2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubPoly {
    coeffs: Vec<G2Projective>,
}

impl PubPoly {
    pub fn from_coeffs(coeffs: Vec<G2Projective>) -> Self {
        assert!(!coeffs.is_empty(), "public polynomial must not be empty");
        PubPoly { coeffs }
    }

    pub fn coeffs(&self) -> &[G2Projective] {
        &self.coeffs
    }

    pub fn threshold(&self) -> usize {
        self.coeffs.len()
    }

    /// The committed secret: the constant term.
    pub fn commit(&self) -> G2Projective {
        self.coeffs[0]
    }

    /// Evaluate at participant `index` (x = index + 1), Horner in the
    /// exponent.
    pub fn eval(&self, index: u32) -> PubShare {
        let x = x_coord(index);
        let mut acc = G2Projective::identity();
        for coeff in self.coeffs.iter().rev() {
            acc = acc * x + coeff;
        }
        PubShare { index, value: acc }
    }

    /// Coefficient-wise sum of two commitment polynomials.
    pub fn add(&self, other: &PubPoly) -> Result<PubPoly, ThresholdError> {
        if self.coeffs.len() != other.coeffs.len() {
            return Err(ThresholdError::Interpolation(format!(
                "degree mismatch: {} vs {}",
                self.coeffs.len(),
                other.coeffs.len()
            )));
        }
        Ok(PubPoly {
            coeffs: self
                .coeffs
                .iter()
                .zip(&other.coeffs)
                .map(|(a, b)| a + b)
                .collect(),
        })
    }

    /// Recover the commitment polynomial from `t` distinct public shares.
    pub fn recover(shares: &[PubShare], threshold: usize) -> Result<PubPoly, ThresholdError> {
        let deduped = {
            let mut seen = std::collections::BTreeSet::new();
            let mut out = Vec::new();
            for s in shares {
                if seen.insert(s.index) {
                    out.push(*s);
                }
                if out.len() == threshold {
                    break;
                }
            }
            if out.len() < threshold {
                return Err(ThresholdError::InsufficientShares {
                    got: out.len(),
                    need: threshold,
                });
            }
            out
        };
        let xs: Vec<(Scalar, Scalar)> = deduped
            .iter()
            .map(|s| (x_coord(s.index), Scalar::ZERO))
            .collect();

        let mut coeffs = vec![G2Projective::identity(); threshold];
        for (j, share) in deduped.iter().enumerate() {
            let basis = lagrange_basis(&xs, j, x_coord(share.index))?;
            for (k, b) in basis.iter().enumerate() {
                coeffs[k] += share.value * b;
            }
        }
        Ok(PubPoly { coeffs })
    }
}

/// Lagrange interpolation at `x = 0` over scalar-valued shares.
pub fn recover_secret(shares: &[PriShare], threshold: usize) -> Result<Scalar, ThresholdError> {
    let shares = dedup_shares(shares, threshold)?;
    let mut acc = Scalar::ZERO;
    for share in &shares {
        acc += share.value * lagrange_weight_at_zero(&shares, share.index)?;
    }
    Ok(acc)
}

/// The Lagrange coefficient λ_i evaluated at x = 0 for the given share set.
pub fn lagrange_weight_at_zero(
    shares: &[PriShare],
    index: u32,
) -> Result<Scalar, ThresholdError> {
    let xi = x_coord(index);
    let mut num = Scalar::ONE;
    let mut den = Scalar::ONE;
    for other in shares {
        if other.index == index {
            continue;
        }
        let xm = x_coord(other.index);
        num *= xm;
        den *= xm - xi;
    }
    let inv = Option::<Scalar>::from(den.invert())
        .ok_or_else(|| ThresholdError::Interpolation("duplicate share x-coordinates".into()))?;
    Ok(num * inv)
}

/// Coefficients of the Lagrange basis polynomial L_j(x) for the point set.
///
/// `points` supplies the x-coordinates (second tuple element unused here).
fn lagrange_basis(
    points: &[(Scalar, Scalar)],
    j: usize,
    xj: Scalar,
) -> Result<Vec<Scalar>, ThresholdError> {
    // Start from the constant polynomial 1 and multiply in (x - x_m)/(x_j - x_m).
    let mut basis = vec![Scalar::ONE];
    for (m, (xm, _)) in points.iter().enumerate() {
        if m == j {
            continue;
        }
        let den = Option::<Scalar>::from((xj - xm).invert()).ok_or_else(|| {
            ThresholdError::Interpolation("duplicate share x-coordinates".into())
        })?;
        // basis *= (x - xm) * den
        let mut next = vec![Scalar::ZERO; basis.len() + 1];
        for (k, b) in basis.iter().enumerate() {
            let scaled = *b * den;
            next[k] -= scaled * xm;
            next[k + 1] += scaled;
        }
        basis = next;
    }
    Ok(basis)
}

fn dedup_shares(shares: &[PriShare], threshold: usize) -> Result<Vec<PriShare>, ThresholdError> {
    let mut seen = std::collections::BTreeSet::new();
    let mut out = Vec::new();
    for s in shares {
        if seen.insert(s.index) {
            out.push(*s);
        }
        if out.len() == threshold {
            break;
        }
    }
    if out.len() < threshold {
        return Err(ThresholdError::InsufficientShares {
            got: out.len(),
            need: threshold,
        });
    }
    Ok(out)
}

fn x_coord(index: u32) -> Scalar {
    Scalar::from(index as u64 + 1)
}
