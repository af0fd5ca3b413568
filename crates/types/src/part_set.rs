//! Block part sets.
//!
//! A proposed block is serialized and split into fixed-size parts so it can
//! be gossiped incrementally. The parts header (count + root hash over the
//! part hashes) is what votes and proposals reference; the full block is only
//! reconstructed once every part has arrived.

use crate::hash::Hash;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Size of a single block part in bytes.
pub const BLOCK_PART_SIZE: usize = 65536;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartSetError {
    #[error("part index {index} out of bounds (total {total})")]
    IndexOutOfBounds { index: u32, total: u32 },

    #[error("part {index} does not match its position hash")]
    InvalidPart { index: u32 },

    #[error("part set is incomplete ({count}/{total})")]
    Incomplete { count: u32, total: u32 },

    #[error("reassembled parts do not hash to the header root")]
    RootMismatch,
}

/// Identifies a part set: part count and root hash over the part hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct PartSetHeader {
    pub total: u32,
    pub hash: Hash,
}

impl PartSetHeader {
    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.hash.is_zero()
    }
}

/// A single block part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub index: u32,
    pub bytes: Vec<u8>,
}

impl Part {
    pub fn hash(&self) -> Hash {
        Hash(Sha256::digest(&self.bytes).into())
    }
}

/// A (possibly partial) set of block parts.
#[derive(Debug, Clone)]
pub struct PartSet {
    header: PartSetHeader,
    parts: Vec<Option<Part>>,
    count: u32,
}

impl PartSet {
    /// Split serialized block bytes into parts and compute the header.
    pub fn from_data(data: &[u8]) -> Self {
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[]]
        } else {
            data.chunks(BLOCK_PART_SIZE).collect()
        };
        let parts: Vec<Option<Part>> = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| {
                Some(Part {
                    index: i as u32,
                    bytes: c.to_vec(),
                })
            })
            .collect();
        let hash = root_hash(parts.iter().map(|p| p.as_ref().unwrap().hash()));
        PartSet {
            header: PartSetHeader {
                total: parts.len() as u32,
                hash,
            },
            count: parts.len() as u32,
            parts,
        }
    }

    /// An empty set expecting parts matching `header`.
    pub fn from_header(header: PartSetHeader) -> Self {
        PartSet {
            parts: vec![None; header.total as usize],
            header,
            count: 0,
        }
    }

    pub fn header(&self) -> PartSetHeader {
        self.header
    }

    /// True if the header matches (same part count and root).
    pub fn has_header(&self, header: &PartSetHeader) -> bool {
        self.header == *header
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.header.total
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn total(&self) -> u32 {
        self.header.total
    }

    pub fn get_part(&self, index: u32) -> Option<&Part> {
        self.parts.get(index as usize).and_then(|p| p.as_ref())
    }

    /// Add a part. Returns `Ok(false)` if the slot was already filled.
    pub fn add_part(&mut self, part: Part) -> Result<bool, PartSetError> {
        let index = part.index;
        if index >= self.header.total {
            return Err(PartSetError::IndexOutOfBounds {
                index,
                total: self.header.total,
            });
        }
        if self.parts[index as usize].is_some() {
            return Ok(false);
        }
        self.parts[index as usize] = Some(part);
        self.count += 1;
        Ok(true)
    }

    /// Reassemble the original bytes, verifying the root hash.
    pub fn reassemble(&self) -> Result<Vec<u8>, PartSetError> {
        if !self.is_complete() {
            return Err(PartSetError::Incomplete {
                count: self.count,
                total: self.header.total,
            });
        }
        let root = root_hash(self.parts.iter().map(|p| p.as_ref().unwrap().hash()));
        if root != self.header.hash {
            return Err(PartSetError::RootMismatch);
        }
        let mut out = Vec::new();
        for part in self.parts.iter().flatten() {
            out.extend_from_slice(&part.bytes);
        }
        Ok(out)
    }

    /// Iterate the parts present so far.
    pub fn parts(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter().flatten()
    }
}

fn root_hash(part_hashes: impl Iterator<Item = Hash>) -> Hash {
    let mut hasher = Sha256::new();
    for h in part_hashes {
        hasher.update(h.as_bytes());
    }
    Hash(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_reassemble() {
        let data: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
        let set = PartSet::from_data(&data);
        assert_eq!(set.total(), 4);
        assert!(set.is_complete());

        let mut receiving = PartSet::from_header(set.header());
        for part in set.parts() {
            assert!(receiving.add_part(part.clone()).unwrap());
        }
        assert_eq!(receiving.reassemble().unwrap(), data);
    }

    #[test]
    fn duplicate_part_is_not_an_error() {
        let set = PartSet::from_data(b"tiny");
        let mut receiving = PartSet::from_header(set.header());
        let part = set.get_part(0).unwrap().clone();
        assert!(receiving.add_part(part.clone()).unwrap());
        assert!(!receiving.add_part(part).unwrap());
    }

    #[test]
    fn out_of_bounds_part_rejected() {
        let set = PartSet::from_data(b"tiny");
        let mut receiving = PartSet::from_header(set.header());
        let err = receiving
            .add_part(Part {
                index: 9,
                bytes: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, PartSetError::IndexOutOfBounds { .. }));
    }

    #[test]
    fn corrupted_part_fails_root_check() {
        let set = PartSet::from_data(b"some block bytes");
        let mut receiving = PartSet::from_header(set.header());
        receiving
            .add_part(Part {
                index: 0,
                bytes: b"other block bytes".to_vec(),
            })
            .unwrap();
        assert_eq!(receiving.reassemble().unwrap_err(), PartSetError::RootMismatch);
    }

    #[test]
    fn empty_data_still_yields_one_part() {
        let set = PartSet::from_data(&[]);
        assert_eq!(set.total(), 1);
        assert_eq!(set.reassemble().unwrap(), Vec::<u8>::new());
    }
}
