//! Numeric primitives shared by the schema, the dictionaries and the generated row logic.
//!
//! Every scalar column value is carried as a `u64` bit pattern; a column's [`NumType`]
//! decides how that pattern is read back. Generated closures are monomorphized over
//! [`RawNum`] so the per-row code never matches on the column type.

use crate::error::DbError;
use serde::Deserialize;
use std::fmt::Debug;

/// A fixed-width scalar that can round-trip through a `u64` slot.
pub trait RawNum: Copy + PartialOrd + Debug + Send + Sync + 'static {
    /// Smallest representable value (identity for running maximums).
    const LOWEST: Self;
    /// Largest representable value (identity for running minimums).
    const HIGHEST: Self;

    fn from_raw(raw: u64) -> Self;
    fn to_raw(self) -> u64;
    fn parse(s: &str) -> Option<Self>;
    /// Addition used by sum aggregations. Integers wrap on overflow.
    fn sum(self, other: Self) -> Self;
    fn render(self) -> String;
}

macro_rules! impl_raw_unsigned {
    ($($t:ty),*) => {$(
        impl RawNum for $t {
            const LOWEST: Self = <$t>::MIN;
            const HIGHEST: Self = <$t>::MAX;

            #[inline]
            fn from_raw(raw: u64) -> Self {
                raw as $t
            }
            #[inline]
            fn to_raw(self) -> u64 {
                self as u64
            }
            fn parse(s: &str) -> Option<Self> {
                s.trim().parse::<$t>().ok()
            }
            #[inline]
            fn sum(self, other: Self) -> Self {
                self.wrapping_add(other)
            }
            fn render(self) -> String {
                self.to_string()
            }
        }
    )*};
}

macro_rules! impl_raw_signed {
    ($($t:ty),*) => {$(
        impl RawNum for $t {
            const LOWEST: Self = <$t>::MIN;
            const HIGHEST: Self = <$t>::MAX;

            #[inline]
            fn from_raw(raw: u64) -> Self {
                raw as i64 as $t
            }
            #[inline]
            fn to_raw(self) -> u64 {
                self as i64 as u64
            }
            fn parse(s: &str) -> Option<Self> {
                s.trim().parse::<$t>().ok()
            }
            #[inline]
            fn sum(self, other: Self) -> Self {
                self.wrapping_add(other)
            }
            fn render(self) -> String {
                self.to_string()
            }
        }
    )*};
}

impl_raw_unsigned!(u8, u16, u32, u64);
impl_raw_signed!(i8, i16, i32, i64);

impl RawNum for f64 {
    const LOWEST: Self = f64::NEG_INFINITY;
    const HIGHEST: Self = f64::INFINITY;

    #[inline]
    fn from_raw(raw: u64) -> Self {
        f64::from_bits(raw)
    }
    #[inline]
    fn to_raw(self) -> u64 {
        self.to_bits()
    }
    fn parse(s: &str) -> Option<Self> {
        s.trim().parse::<f64>().ok()
    }
    #[inline]
    fn sum(self, other: Self) -> Self {
        self + other
    }
    fn render(self) -> String {
        render_float(self)
    }
}

impl RawNum for f32 {
    const LOWEST: Self = f32::NEG_INFINITY;
    const HIGHEST: Self = f32::INFINITY;

    #[inline]
    fn from_raw(raw: u64) -> Self {
        f64::from_bits(raw) as f32
    }
    #[inline]
    fn to_raw(self) -> u64 {
        (self as f64).to_bits()
    }
    fn parse(s: &str) -> Option<Self> {
        s.trim().parse::<f32>().ok()
    }
    #[inline]
    fn sum(self, other: Self) -> Self {
        self + other
    }
    fn render(self) -> String {
        render_float(self as f64)
    }
}

/// Renders with at most six fractional digits, trailing zeros trimmed (`1.2`, not `1.2000000000000002`).
fn render_float(v: f64) -> String {
    let s = format!("{:.6}", v);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" {
        "0".to_string()
    } else {
        s.to_string()
    }
}

/// Declared numeric type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumType {
    Byte,
    UByte,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    Float,
    Double,
}

/// Runs `$body` with `$T` aliased to the Rust type behind a [`NumType`].
macro_rules! with_num_type {
    ($ty:expr, $T:ident => $body:expr) => {
        match $ty {
            $crate::types::NumType::Byte => {
                type $T = i8;
                $body
            }
            $crate::types::NumType::UByte => {
                type $T = u8;
                $body
            }
            $crate::types::NumType::Short => {
                type $T = i16;
                $body
            }
            $crate::types::NumType::UShort => {
                type $T = u16;
                $body
            }
            $crate::types::NumType::Int => {
                type $T = i32;
                $body
            }
            $crate::types::NumType::UInt => {
                type $T = u32;
                $body
            }
            $crate::types::NumType::Long => {
                type $T = i64;
                $body
            }
            $crate::types::NumType::ULong => {
                type $T = u64;
                $body
            }
            $crate::types::NumType::Float => {
                type $T = f32;
                $body
            }
            $crate::types::NumType::Double => {
                type $T = f64;
                $body
            }
        }
    };
}
pub(crate) use with_num_type;

impl NumType {
    /// Size in bytes.
    pub fn size(self) -> u8 {
        match self {
            NumType::Byte | NumType::UByte => 1,
            NumType::Short | NumType::UShort => 2,
            NumType::Int | NumType::UInt | NumType::Float => 4,
            NumType::Long | NumType::ULong | NumType::Double => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, NumType::Float | NumType::Double)
    }

    /// Narrowest unsigned type able to hold `max`.
    pub fn unsigned_for_max(max: u64) -> NumType {
        if max <= u8::MAX as u64 {
            NumType::UByte
        } else if max <= u16::MAX as u64 {
            NumType::UShort
        } else if max <= u32::MAX as u64 {
            NumType::UInt
        } else {
            NumType::ULong
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            NumType::Byte => "byte",
            NumType::UByte => "ubyte",
            NumType::Short => "short",
            NumType::UShort => "ushort",
            NumType::Int => "int",
            NumType::UInt => "uint",
            NumType::Long => "long",
            NumType::ULong => "ulong",
            NumType::Float => "float",
            NumType::Double => "double",
        }
    }

    pub fn from_name(name: &str) -> Option<NumType> {
        Some(match name {
            "byte" => NumType::Byte,
            "ubyte" => NumType::UByte,
            "short" => NumType::Short,
            "ushort" => NumType::UShort,
            "int" => NumType::Int,
            "uint" => NumType::UInt,
            "long" => NumType::Long,
            "ulong" => NumType::ULong,
            "float" => NumType::Float,
            "double" => NumType::Double,
            _ => return None,
        })
    }

    /// Parses `s` into the raw slot representation of this type.
    pub fn parse_raw(self, s: &str) -> Option<u64> {
        with_num_type!(self, T => T::parse(s).map(RawNum::to_raw))
    }

    pub fn render_raw(self, raw: u64) -> String {
        with_num_type!(self, T => T::from_raw(raw).render())
    }

    pub fn lowest_raw(self) -> u64 {
        with_num_type!(self, T => T::LOWEST.to_raw())
    }

    pub fn highest_raw(self) -> u64 {
        with_num_type!(self, T => T::HIGHEST.to_raw())
    }
}

/// Width of a dictionary code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeWidth {
    W1,
    W2,
    W4,
    W8,
}

impl CodeWidth {
    pub fn from_bytes(bytes: u8) -> Result<CodeWidth, DbError> {
        match bytes {
            1 => Ok(CodeWidth::W1),
            2 => Ok(CodeWidth::W2),
            4 => Ok(CodeWidth::W4),
            8 => Ok(CodeWidth::W8),
            other => Err(DbError::UnsupportedCodeWidth(other)),
        }
    }

    /// Narrowest width whose maximum code stays above `cardinality`, so that codes
    /// `1..=cardinality` never collide with the read-miss sentinel.
    pub fn for_cardinality(cardinality: u64) -> CodeWidth {
        if cardinality < u8::MAX as u64 {
            CodeWidth::W1
        } else if cardinality < u16::MAX as u64 {
            CodeWidth::W2
        } else if cardinality < u32::MAX as u64 {
            CodeWidth::W4
        } else {
            CodeWidth::W8
        }
    }

    pub fn bytes(self) -> u8 {
        match self {
            CodeWidth::W1 => 1,
            CodeWidth::W2 => 2,
            CodeWidth::W4 => 4,
            CodeWidth::W8 => 8,
        }
    }

    /// Largest representable code; returned by dictionary lookups that miss.
    pub fn max_code(self) -> u64 {
        match self {
            CodeWidth::W1 => u8::MAX as u64,
            CodeWidth::W2 => u16::MAX as u64,
            CodeWidth::W4 => u32::MAX as u64,
            CodeWidth::W8 => u64::MAX,
        }
    }

    pub fn num_type(self) -> NumType {
        match self {
            CodeWidth::W1 => NumType::UByte,
            CodeWidth::W2 => NumType::UShort,
            CodeWidth::W4 => NumType::UInt,
            CodeWidth::W8 => NumType::ULong,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_values_survive_raw_slots() {
        assert_eq!(i32::from_raw((-5i32).to_raw()), -5);
        assert_eq!(i8::from_raw(i8::MIN.to_raw()), i8::MIN);
        assert_eq!(f32::from_raw(1.5f32.to_raw()), 1.5);
    }

    #[test]
    fn float_rendering_trims_noise() {
        assert_eq!((0.1f64 + 1.1).render(), "1.2");
        assert_eq!(2.0f64.render(), "2");
        assert_eq!(0.0f64.render(), "0");
    }

    #[test]
    fn code_width_for_cardinality_keeps_room_for_sentinel() {
        assert_eq!(CodeWidth::for_cardinality(5), CodeWidth::W1);
        assert_eq!(CodeWidth::for_cardinality(255), CodeWidth::W2);
        assert_eq!(CodeWidth::for_cardinality(70_000), CodeWidth::W4);
        assert_eq!(CodeWidth::for_cardinality(u64::MAX - 1), CodeWidth::W8);
    }

    #[test]
    fn unsupported_code_width_is_rejected() {
        assert!(matches!(
            CodeWidth::from_bytes(3),
            Err(DbError::UnsupportedCodeWidth(3))
        ));
        assert_eq!(CodeWidth::from_bytes(2).unwrap(), CodeWidth::W2);
    }

    #[test]
    fn unsigned_for_max_picks_narrowest() {
        assert_eq!(NumType::unsigned_for_max(200), NumType::UByte);
        assert_eq!(NumType::unsigned_for_max(4_000_000), NumType::UInt);
        assert_eq!(NumType::unsigned_for_max(u64::MAX), NumType::ULong);
    }
}
