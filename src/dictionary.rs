//! Dictionary encoding for string dimensions.
//!
//! Each string dimension owns one [`DimensionDict`]: a value->code map plus an append-only
//! code->value sequence. Code `0` is reserved for values that did not fit under the
//! configured cardinality; an ingested `__exceeded` literal resolves to it as well. Lookups from the query
//! side that miss return the width's maximum code instead, so a filter on an unknown value
//! can never match rows that were stored under the overflow code.

use crate::error::DbError;
use crate::types::CodeWidth;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Value stored at code 0.
pub const EXCEEDED_VALUE: &str = "__exceeded";

/// Code assigned to values that overflow the dictionary or a cardinality guard.
pub const OVERFLOW_CODE: u64 = 0;

/// Value->code map, one variant per code width.
#[derive(Debug)]
enum ValueCodes {
    W1(HashMap<String, u8>),
    W2(HashMap<String, u16>),
    W4(HashMap<String, u32>),
    W8(HashMap<String, u64>),
}

impl ValueCodes {
    fn new(width: CodeWidth) -> Self {
        match width {
            CodeWidth::W1 => ValueCodes::W1(HashMap::new()),
            CodeWidth::W2 => ValueCodes::W2(HashMap::new()),
            CodeWidth::W4 => ValueCodes::W4(HashMap::new()),
            CodeWidth::W8 => ValueCodes::W8(HashMap::new()),
        }
    }

    #[inline]
    fn get(&self, value: &str) -> Option<u64> {
        match self {
            ValueCodes::W1(m) => m.get(value).map(|&c| c as u64),
            ValueCodes::W2(m) => m.get(value).map(|&c| c as u64),
            ValueCodes::W4(m) => m.get(value).map(|&c| c as u64),
            ValueCodes::W8(m) => m.get(value).copied(),
        }
    }

    /// `code` must fit the width; the dictionary's cardinality cap guarantees it.
    fn insert(&mut self, value: String, code: u64) {
        match self {
            ValueCodes::W1(m) => {
                m.insert(value, code as u8);
            }
            ValueCodes::W2(m) => {
                m.insert(value, code as u16);
            }
            ValueCodes::W4(m) => {
                m.insert(value, code as u32);
            }
            ValueCodes::W8(m) => {
                m.insert(value, code);
            }
        }
    }
}

#[derive(Debug)]
struct DictInner {
    v2c: ValueCodes,
    c2v: Vec<String>,
}

/// Bijection between the values of one string dimension and fixed-width codes.
#[derive(Debug)]
pub struct DimensionDict {
    width: CodeWidth,
    cardinality: u64,
    inner: RwLock<DictInner>,
}

impl DimensionDict {
    /// Creates a dictionary accepting at most `cardinality` distinct values.
    ///
    /// The cap is clamped below the width's maximum code, which stays reserved for
    /// read-side misses.
    pub fn new(width: CodeWidth, cardinality: u64) -> Self {
        let cardinality = cardinality.min(width.max_code() - 1);
        let mut v2c = ValueCodes::new(width);
        v2c.insert(EXCEEDED_VALUE.to_string(), OVERFLOW_CODE);
        Self {
            width,
            cardinality,
            inner: RwLock::new(DictInner {
                v2c,
                c2v: vec![EXCEEDED_VALUE.to_string()],
            }),
        }
    }

    pub fn width(&self) -> CodeWidth {
        self.width
    }

    pub fn cardinality(&self) -> u64 {
        self.cardinality
    }

    /// Read path: the value's code, or the width's maximum code when unknown.
    pub fn decode(&self, value: &str) -> Result<u64, DbError> {
        Ok(self.lookup(value)?.unwrap_or_else(|| self.width.max_code()))
    }

    /// Shared-lock lookup without the not-found sentinel.
    #[inline]
    pub fn lookup(&self, value: &str) -> Result<Option<u64>, DbError> {
        let inner = self.inner.read()?;
        Ok(inner.v2c.get(value))
    }

    /// Write path used by ingestion.
    ///
    /// Returns `None` when the value is new and the dictionary is already full; the caller
    /// stores [`OVERFLOW_CODE`] for that occurrence and the dictionary does not grow.
    pub fn encode_or_create(&self, value: &str) -> Result<Option<u64>, DbError> {
        if let Some(code) = self.lookup(value)? {
            return Ok(Some(code));
        }
        let mut inner = self.inner.write()?;
        // Another writer may have inserted it between the two locks.
        if let Some(code) = inner.v2c.get(value) {
            return Ok(Some(code));
        }
        let code = inner.c2v.len() as u64;
        if code > self.cardinality {
            return Ok(None);
        }
        inner.v2c.insert(value.to_string(), code);
        inner.c2v.push(value.to_string());
        Ok(Some(code))
    }

    /// Value behind `code`, if the code was ever assigned.
    pub fn value(&self, code: u64) -> Result<Option<String>, DbError> {
        let inner = self.inner.read()?;
        Ok(usize::try_from(code)
            .ok()
            .and_then(|idx| inner.c2v.get(idx))
            .cloned())
    }

    /// Number of assigned codes, not counting the overflow slot.
    pub fn len(&self) -> Result<usize, DbError> {
        let inner = self.inner.read()?;
        Ok(inner.c2v.len() - 1)
    }

    pub fn is_empty(&self) -> Result<bool, DbError> {
        Ok(self.len()? == 0)
    }
}

/// Registry of per-(table, dimension) dictionaries, created lazily and kept for the
/// lifetime of the database.
#[derive(Debug, Default)]
pub struct Dictionaries {
    dicts: Mutex<HashMap<(String, String), Arc<DimensionDict>>>,
}

impl Dictionaries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the dictionary for `(table, dimension)`, creating it on first use.
    pub fn get_or_create(
        &self,
        table: &str,
        dimension: &str,
        width: CodeWidth,
        cardinality: u64,
    ) -> Result<Arc<DimensionDict>, DbError> {
        let mut dicts = self.dicts.lock()?;
        let dict = dicts
            .entry((table.to_string(), dimension.to_string()))
            .or_insert_with(|| Arc::new(DimensionDict::new(width, cardinality)));
        Ok(Arc::clone(dict))
    }

    pub fn get(&self, table: &str, dimension: &str) -> Result<Option<Arc<DimensionDict>>, DbError> {
        let dicts = self.dicts.lock()?;
        Ok(dicts
            .get(&(table.to_string(), dimension.to_string()))
            .cloned())
    }

    pub fn len(&self) -> Result<usize, DbError> {
        Ok(self.dicts.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, DbError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn codes_are_dense_and_stable() {
        let dict = DimensionDict::new(CodeWidth::W4, 1_000);
        assert_eq!(dict.encode_or_create("US").unwrap(), Some(1));
        assert_eq!(dict.encode_or_create("IL").unwrap(), Some(2));
        assert_eq!(dict.encode_or_create("US").unwrap(), Some(1));
        assert_eq!(dict.len().unwrap(), 2);
        assert_eq!(dict.value(2).unwrap().as_deref(), Some("IL"));
        assert_eq!(dict.value(0).unwrap().as_deref(), Some(EXCEEDED_VALUE));
    }

    #[test]
    fn overflow_does_not_grow_dictionary() {
        let dict = DimensionDict::new(CodeWidth::W1, 2);
        assert_eq!(dict.encode_or_create("a").unwrap(), Some(1));
        assert_eq!(dict.encode_or_create("b").unwrap(), Some(2));
        assert_eq!(dict.encode_or_create("c").unwrap(), None);
        assert_eq!(dict.len().unwrap(), 2);
        // Already-known values still resolve after the cap is hit.
        assert_eq!(dict.encode_or_create("b").unwrap(), Some(2));
    }

    #[test]
    fn overflow_value_resolves_to_the_overflow_code() {
        let dict = DimensionDict::new(CodeWidth::W2, 10);
        assert_eq!(dict.lookup(EXCEEDED_VALUE).unwrap(), Some(OVERFLOW_CODE));
        assert_eq!(dict.encode_or_create(EXCEEDED_VALUE).unwrap(), Some(OVERFLOW_CODE));
        assert_eq!(dict.encode_or_create("US").unwrap(), Some(1));
        assert_eq!(dict.len().unwrap(), 1);
    }

    #[test]
    fn read_miss_returns_max_of_width() {
        assert_eq!(DimensionDict::new(CodeWidth::W1, 10).decode("x").unwrap(), 255);
        assert_eq!(DimensionDict::new(CodeWidth::W2, 10).decode("x").unwrap(), 65_535);
        assert_eq!(
            DimensionDict::new(CodeWidth::W4, 10).decode("x").unwrap(),
            u32::MAX as u64
        );
        assert_eq!(DimensionDict::new(CodeWidth::W8, 10).decode("x").unwrap(), u64::MAX);
    }

    #[test]
    fn cardinality_is_clamped_below_read_sentinel() {
        let dict = DimensionDict::new(CodeWidth::W1, 1_000);
        assert_eq!(dict.cardinality(), 254);
        for i in 0..300 {
            dict.encode_or_create(&format!("v{i}")).unwrap();
        }
        assert_eq!(dict.len().unwrap(), 254);
        assert_eq!(dict.decode("v253").unwrap(), 254);
    }

    #[test]
    fn concurrent_encoders_agree_on_codes() {
        let dict = Arc::new(DimensionDict::new(CodeWidth::W4, 10_000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let dict = Arc::clone(&dict);
                thread::spawn(move || {
                    (0..500)
                        .map(|i| dict.encode_or_create(&format!("k{i}")).unwrap().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let results: Vec<Vec<u64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for r in &results[1..] {
            assert_eq!(r, &results[0]);
        }
        assert_eq!(dict.len().unwrap(), 500);
    }

    #[test]
    fn registry_returns_the_same_instance() {
        let registry = Dictionaries::new();
        let a = registry.get_or_create("events", "country", CodeWidth::W4, 100).unwrap();
        a.encode_or_create("US").unwrap();
        let b = registry.get_or_create("events", "country", CodeWidth::W4, 100).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.decode("US").unwrap(), 1);
        assert!(registry.get("events", "city").unwrap().is_none());
        assert_eq!(registry.len().unwrap(), 1);
    }
}
