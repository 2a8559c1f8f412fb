//! Set-valued accumulator used by bitset metrics and cardinality guards.

use roaring::RoaringTreemap;

/// Compressed set of `u64` values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bitset {
    bits: RoaringTreemap,
}

impl Bitset {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&mut self, value: u64) {
        self.bits.insert(value);
    }

    #[inline]
    pub fn contains(&self, value: u64) -> bool {
        self.bits.contains(value)
    }

    pub fn cardinality(&self) -> u64 {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn union_with(&mut self, other: &Bitset) {
        self.bits |= &other.bits;
    }

    pub fn clear(&mut self) {
        self.bits.clear();
    }

    /// Rebuilds the container layout from the sorted values, dropping the slack that
    /// accumulates while a set grows one element at a time.
    pub fn optimize(&mut self) {
        let compact: RoaringTreemap = self.bits.iter().collect();
        self.bits = compact;
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.bits.iter()
    }
}
