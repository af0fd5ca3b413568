//! Threshold BLS signatures and distributed key generation over BLS12-381.
//!
//! Two layers live here:
//!
//! - [`BlsVerifier`] (with [`sig`] underneath): t-of-n threshold signatures.
//!   Signatures are points on G1, public keys on G2; partial signatures embed
//!   their share index and any t of them Lagrange-interpolate into the full
//!   signature under the collective key.
//! - [`DistKeyGenerator`]: a Rabin-style DKG that produces the collective
//!   public polynomial and one private share per participant with no trusted
//!   dealer. Phase I distributes Pedersen-committed deals and resolves
//!   complaints through justifications; Phase II reveals the secret
//!   commitments, with complaint and share-reconstruction paths for dealers
//!   that misbehave after qualifying.
//!
//! All state machines driving these primitives (message ordering, retries,
//! round aborts) live in `beacon-dkg`; this crate is purely computational.

mod encoding;
mod poly;
mod verifier;

pub mod dkg;
pub mod sig;

pub use dkg::{DistKeyGenerator, DistKeyShare, DkgError};
pub use encoding::{G1Point, G2Point, Sc};
pub use poly::{PriPoly, PriShare, PubPoly, PubShare};
pub use verifier::{BlsShare, BlsVerifier};

use thiserror::Error;

/// Errors from threshold signature operations.
#[derive(Debug, Error)]
pub enum ThresholdError {
    #[error("this verifier holds no private share")]
    MissingShare,

    #[error("invalid partial signature from share index {index}")]
    InvalidShare { index: u16 },

    #[error("unknown validator {0}")]
    UnknownValidator(beacon_types::Address),

    #[error("insufficient partial signatures: got {got}, need {need}")]
    InsufficientShares { got: usize, need: usize },

    #[error("signature does not verify against the collective key")]
    InvalidSignature,

    #[error("malformed encoding: {0}")]
    Decode(String),

    #[error("shares do not interpolate: {0}")]
    Interpolation(String),
}
