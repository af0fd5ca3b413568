//! Serde wrappers for curve elements.
//!
//! Scalars encode as 32 bytes little-endian, G1 as 48-byte compressed, G2 as
//! 96-byte compressed. Decoding rejects non-canonical encodings, so every
//! wire value has exactly one byte representation.

use bls12_381::{G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A field scalar with a canonical serde encoding.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Sc(pub Scalar);

/// A G1 group element with a canonical serde encoding.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct G1Point(pub G1Projective);

/// A G2 group element with a canonical serde encoding.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct G2Point(pub G2Projective);

impl fmt::Debug for Sc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sc(..)")
    }
}

impl fmt::Debug for G1Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = G1Affine::from(&self.0).to_compressed();
        for b in &bytes[..6] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..")
    }
}

impl fmt::Debug for G2Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = G2Affine::from(&self.0).to_compressed();
        for b in &bytes[..6] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..")
    }
}

impl Serialize for Sc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0.to_bytes())
    }
}

impl<'de> Deserialize<'de> for Sc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = Vec::deserialize(deserializer)?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| de::Error::custom("scalar must be 32 bytes"))?;
        Option::<Scalar>::from(Scalar::from_bytes(&arr))
            .map(Sc)
            .ok_or_else(|| de::Error::custom("non-canonical scalar"))
    }
}

impl Serialize for G1Point {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&G1Affine::from(&self.0).to_compressed())
    }
}

impl<'de> Deserialize<'de> for G1Point {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = Vec::deserialize(deserializer)?;
        let arr: [u8; 48] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| de::Error::custom("G1 point must be 48 bytes"))?;
        Option::<G1Affine>::from(G1Affine::from_compressed(&arr))
            .map(|p| G1Point(G1Projective::from(p)))
            .ok_or_else(|| de::Error::custom("invalid G1 point"))
    }
}

impl Serialize for G2Point {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&G2Affine::from(&self.0).to_compressed())
    }
}

impl<'de> Deserialize<'de> for G2Point {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = Vec::deserialize(deserializer)?;
        let arr: [u8; 96] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| de::Error::custom("G2 point must be 96 bytes"))?;
        Option::<G2Affine>::from(G2Affine::from_compressed(&arr))
            .map(|p| G2Point(G2Projective::from(p)))
            .ok_or_else(|| de::Error::custom("invalid G2 point"))
    }
}
