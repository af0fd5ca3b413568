//! Validators and the validator set.
//!
//! The set keeps a deterministic proposer pointer advanced by a priority
//! rule: on each increment every validator gains priority equal to its voting
//! power, the highest-priority validator becomes the proposer, and the
//! proposer pays the total voting power back. Over time each validator
//! proposes proportionally to its stake.

use crate::crypto::{Address, PublicKey};
use crate::hash::Hash;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A single validator: identity, stake weight, and rotation priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    pub pub_key: PublicKey,
    pub voting_power: u64,
    /// Proposer rotation accumulator. Not part of the set hash.
    pub proposer_priority: i64,
}

impl Validator {
    pub fn new(pub_key: PublicKey, voting_power: u64) -> Self {
        Validator {
            address: pub_key.address(),
            pub_key,
            voting_power,
            proposer_priority: 0,
        }
    }
}

/// An ordered collection of validators with a proposer pointer.
///
/// Validators are kept sorted by address, which fixes each validator's index
/// for the lifetime of the set. Copies are deep: `clone()` yields a frozen
/// snapshot whose priorities can be advanced independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    total_voting_power: u64,
    /// Index of the current proposer.
    proposer: usize,
}

impl ValidatorSet {
    /// Build a set from validators; establishes the first proposer.
    ///
    /// # Panics
    ///
    /// Panics on an empty list or duplicate addresses.
    pub fn new(mut validators: Vec<Validator>) -> Self {
        assert!(!validators.is_empty(), "validator set must not be empty");
        validators.sort_by(|a, b| a.address.cmp(&b.address));
        for pair in validators.windows(2) {
            assert!(
                pair[0].address != pair[1].address,
                "duplicate validator address {}",
                pair[0].address
            );
        }
        let total_voting_power = validators.iter().map(|v| v.voting_power).sum();
        let mut set = ValidatorSet {
            validators,
            total_voting_power,
            proposer: 0,
        };
        set.increment_proposer_priority(1);
        set
    }

    pub fn size(&self) -> usize {
        self.validators.len()
    }

    pub fn total_voting_power(&self) -> u64 {
        self.total_voting_power
    }

    /// The amount of voting power that constitutes a 2/3+ majority.
    pub fn quorum_power(&self) -> u64 {
        self.total_voting_power * 2 / 3 + 1
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn has_address(&self, address: &Address) -> bool {
        self.index_of(address).is_some()
    }

    /// Look up a validator by address, returning its index too.
    pub fn get_by_address(&self, address: &Address) -> Option<(u32, &Validator)> {
        self.index_of(address)
            .map(|idx| (idx as u32, &self.validators[idx]))
    }

    pub fn get_by_index(&self, index: u32) -> Option<&Validator> {
        self.validators.get(index as usize)
    }

    /// The current proposer.
    pub fn get_proposer(&self) -> &Validator {
        &self.validators[self.proposer]
    }

    /// Advance the proposer pointer by `times` rotation steps.
    pub fn increment_proposer_priority(&mut self, times: u32) {
        assert!(times > 0, "cannot increment priority zero times");
        for _ in 0..times {
            for v in &mut self.validators {
                v.proposer_priority += v.voting_power as i64;
            }
            // Highest priority proposes; ties break towards the lowest address
            // because the set is address-sorted and we keep the first maximum.
            let mut max_idx = 0;
            for (idx, v) in self.validators.iter().enumerate() {
                if v.proposer_priority > self.validators[max_idx].proposer_priority {
                    max_idx = idx;
                }
            }
            self.validators[max_idx].proposer_priority -= self.total_voting_power as i64;
            self.proposer = max_idx;
        }
    }

    /// Deterministic hash of the set: addresses and powers in index order.
    ///
    /// Proposer priorities are rotation state, not identity, and are excluded.
    pub fn hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        for v in &self.validators {
            hasher.update(v.address.as_bytes());
            hasher.update(v.voting_power.to_le_bytes());
        }
        Hash(hasher.finalize().into())
    }

    /// Addresses in index order (the canonical DKG participant ordering).
    pub fn addresses(&self) -> Vec<Address> {
        self.validators.iter().map(|v| v.address).collect()
    }

    fn index_of(&self, address: &Address) -> Option<usize> {
        self.validators
            .binary_search_by(|v| v.address.cmp(address))
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn make_set(n: usize) -> ValidatorSet {
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let validators = (0..n)
            .map(|_| Validator::new(KeyPair::generate(&mut rng).public_key(), 1))
            .collect();
        ValidatorSet::new(validators)
    }

    #[test]
    fn lookup_by_address_and_index() {
        let set = make_set(4);
        for (i, v) in set.validators().iter().enumerate() {
            let (idx, found) = set.get_by_address(&v.address).unwrap();
            assert_eq!(idx as usize, i);
            assert_eq!(found.address, v.address);
            assert_eq!(set.get_by_index(idx).unwrap().address, v.address);
        }
    }

    #[test]
    fn equal_power_rotation_visits_everyone() {
        let mut set = make_set(4);
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..4 {
            seen.insert(set.get_proposer().address);
            set.increment_proposer_priority(1);
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn weighted_rotation_is_proportional() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let heavy = KeyPair::generate(&mut rng).public_key();
        let light = KeyPair::generate(&mut rng).public_key();
        let mut set = ValidatorSet::new(vec![
            Validator::new(heavy, 3),
            Validator::new(light, 1),
        ]);
        let heavy_addr = heavy.address();

        let mut heavy_count = 0;
        for _ in 0..8 {
            if set.get_proposer().address == heavy_addr {
                heavy_count += 1;
            }
            set.increment_proposer_priority(1);
        }
        assert_eq!(heavy_count, 6);
    }

    #[test]
    fn copy_on_write_leaves_original_untouched() {
        let set = make_set(4);
        let before = crate::wire_encode(&set);

        let mut copy = set.clone();
        copy.increment_proposer_priority(3);

        assert_eq!(before, crate::wire_encode(&set));
        assert_ne!(before, crate::wire_encode(&copy));
    }

    #[test]
    fn quorum_power_is_two_thirds_plus_one() {
        let set = make_set(4);
        assert_eq!(set.quorum_power(), 3);
    }

    #[test]
    fn set_hash_ignores_priorities() {
        let set = make_set(4);
        let mut rotated = set.clone();
        rotated.increment_proposer_priority(2);
        assert_eq!(set.hash(), rotated.hash());
    }
}
