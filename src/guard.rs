//! Cardinality guards: cap the number of distinct values a dimension may take per
//! combination of key dimensions.

use crate::bitset::Bitset;
use crate::dictionary::OVERFLOW_CODE;
use crate::schema::CardinalityGuardSpec;

use std::collections::HashMap;

/// Runtime state of one guard.
#[derive(Debug)]
pub struct CardinalityGuard {
    dim: usize,
    keys: Vec<usize>,
    limit: u64,
    accepted: HashMap<Box<[u64]>, Bitset>,
}

impl CardinalityGuard {
    pub fn new(spec: &CardinalityGuardSpec) -> Self {
        Self {
            dim: spec.dim,
            keys: spec.keys.clone(),
            limit: spec.limit,
            accepted: HashMap::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Admits the guarded value of `dims` or rewrites it to [`OVERFLOW_CODE`].
    ///
    /// Returns `true` when the value was substituted.
    pub fn protect(&mut self, dims: &mut [u64]) -> bool {
        let key: Box<[u64]> = self.keys.iter().map(|&k| dims[k]).collect();
        let value = dims[self.dim];
        let set = self.accepted.entry(key).or_default();
        if set.contains(value) {
            return false;
        }
        if set.cardinality() >= self.limit {
            dims[self.dim] = OVERFLOW_CODE;
            return true;
        }
        set.add(value);
        false
    }

    /// Number of accepted values for a key tuple.
    pub fn accepted_count(&self, key: &[u64]) -> u64 {
        self.accepted.get(key).map(Bitset::cardinality).unwrap_or(0)
    }

    pub fn key_count(&self) -> usize {
        self.accepted.len()
    }

    pub fn optimize(&mut self) {
        for set in self.accepted.values_mut() {
            set.optimize();
        }
    }
}
