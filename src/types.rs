//! Core types: physical column types, cell values and key hashing

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::column::ColumnValues;
use crate::error::{MvccError, Result};
use crate::memory::Pod;

/// Version number of a committed write. Strictly increasing per sub-tablet.
pub type Version = u64;

/// Row id: `block << 16 | offset`
pub type RowId = u32;

/// Physical storage type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhysicalType {
    Int8,
    Int16,
    Int32,
    Int64,
    Int128,
    Float32,
    Float64,
    String, // Variable length, not storable yet
}

impl PhysicalType {
    /// Size in bytes (for fixed-width types)
    pub fn size(&self) -> Option<usize> {
        match self {
            PhysicalType::Int8 => Some(1),
            PhysicalType::Int16 => Some(2),
            PhysicalType::Int32 | PhysicalType::Float32 => Some(4),
            PhysicalType::Int64 | PhysicalType::Float64 => Some(8),
            PhysicalType::Int128 => Some(16),
            PhysicalType::String => None,
        }
    }

    /// Lowercase type name as used in schema text
    pub fn name(&self) -> &'static str {
        match self {
            PhysicalType::Int8 => "int8",
            PhysicalType::Int16 => "int16",
            PhysicalType::Int32 => "int32",
            PhysicalType::Int64 => "int64",
            PhysicalType::Int128 => "int128",
            PhysicalType::Float32 => "float32",
            PhysicalType::Float64 => "float64",
            PhysicalType::String => "string",
        }
    }
}

impl fmt::Display for PhysicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PhysicalType {
    type Err = MvccError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "int8" => Ok(PhysicalType::Int8),
            "int16" => Ok(PhysicalType::Int16),
            "int32" => Ok(PhysicalType::Int32),
            "int64" => Ok(PhysicalType::Int64),
            "int128" => Ok(PhysicalType::Int128),
            "float32" => Ok(PhysicalType::Float32),
            "float64" => Ok(PhysicalType::Float64),
            "string" => Ok(PhysicalType::String),
            other => Err(MvccError::InvalidArgument(format!(
                "unknown type name: {}",
                other
            ))),
        }
    }
}

/// A single cell value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Int128(i128),
    Float32(f32),
    Float64(f64),
    String(String),
}

impl Value {
    /// Physical type this value carries
    pub fn physical_type(&self) -> PhysicalType {
        match self {
            Value::Int8(_) => PhysicalType::Int8,
            Value::Int16(_) => PhysicalType::Int16,
            Value::Int32(_) => PhysicalType::Int32,
            Value::Int64(_) => PhysicalType::Int64,
            Value::Int128(_) => PhysicalType::Int128,
            Value::Float32(_) => PhysicalType::Float32,
            Value::Float64(_) => PhysicalType::Float64,
            Value::String(_) => PhysicalType::String,
        }
    }

    /// Approximate encoded size in bytes
    pub fn encoded_size(&self) -> usize {
        match self {
            Value::String(s) => s.len() + 2,
            other => other.physical_type().size().unwrap_or(0),
        }
    }

    /// Parse a literal of the given type
    pub fn parse(ptype: PhysicalType, text: &str) -> Result<Self> {
        let bad = |e: &dyn fmt::Display| {
            MvccError::InvalidArgument(format!("bad {} literal {:?}: {}", ptype, text, e))
        };
        Ok(match ptype {
            PhysicalType::Int8 => Value::Int8(text.parse().map_err(|e| bad(&e))?),
            PhysicalType::Int16 => Value::Int16(text.parse().map_err(|e| bad(&e))?),
            PhysicalType::Int32 => Value::Int32(text.parse().map_err(|e| bad(&e))?),
            PhysicalType::Int64 => Value::Int64(text.parse().map_err(|e| bad(&e))?),
            PhysicalType::Int128 => Value::Int128(text.parse().map_err(|e| bad(&e))?),
            PhysicalType::Float32 => Value::Float32(text.parse().map_err(|e| bad(&e))?),
            PhysicalType::Float64 => Value::Float64(text.parse().map_err(|e| bad(&e))?),
            PhysicalType::String => Value::String(text.to_string()),
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int8(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Int128(v) => write!(f, "{}", v),
            Value::Float32(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{:?}", v),
        }
    }
}

macro_rules! impl_from_value {
    ($($t:ty => $variant:ident),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::$variant(v)
            }
        })*
    };
}

impl_from_value!(i8 => Int8, i16 => Int16, i32 => Int32, i64 => Int64,
    i128 => Int128, f32 => Float32, f64 => Float64, String => String);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

/// 64-bit integer mixer used to hash primary keys
#[inline]
pub fn hash_code(key: u64) -> u64 {
    let mut key = (!key).wrapping_add(key << 21);
    key ^= key >> 24;
    key = key.wrapping_add(key << 3).wrapping_add(key << 8);
    key ^= key >> 14;
    key = key.wrapping_add(key << 2).wrapping_add(key << 4);
    key ^= key >> 28;
    key.wrapping_add(key << 31)
}

/// Fixed-width element types a column can store.
///
/// Every column operation is written once, generic over this trait.
pub trait NativeType: Pod + PartialEq + Default + fmt::Debug {
    const TYPE: PhysicalType;

    /// Extract a value of exactly this type
    fn from_value(value: &Value) -> Option<Self>;

    fn into_value(self) -> Value;

    /// Key hash of this value
    fn hashcode(self) -> u64;

    /// Key equality. Floats compare by bit pattern so that every stored key can be found again.
    fn key_eq(self, other: Self) -> bool {
        self == other
    }

    fn into_column_values(values: Vec<Self>) -> ColumnValues;

    /// Borrow materialized values when they are of this type
    fn slice_of(values: &ColumnValues) -> Option<&[Self]>;
}

macro_rules! impl_native_int {
    ($($t:ty => $variant:ident),*) => {
        $(impl NativeType for $t {
            const TYPE: PhysicalType = PhysicalType::$variant;

            #[inline]
            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(*v),
                    _ => None,
                }
            }

            #[inline]
            fn into_value(self) -> Value {
                Value::$variant(self)
            }

            #[inline]
            fn hashcode(self) -> u64 {
                hash_code(self as i64 as u64)
            }

            fn into_column_values(values: Vec<Self>) -> ColumnValues {
                ColumnValues::$variant(values)
            }

            fn slice_of(values: &ColumnValues) -> Option<&[Self]> {
                match values {
                    ColumnValues::$variant(v) => Some(v),
                    _ => None,
                }
            }
        })*
    };
}

impl_native_int!(i8 => Int8, i16 => Int16, i32 => Int32, i64 => Int64);

impl NativeType for i128 {
    const TYPE: PhysicalType = PhysicalType::Int128;

    #[inline]
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int128(v) => Some(*v),
            _ => None,
        }
    }

    #[inline]
    fn into_value(self) -> Value {
        Value::Int128(self)
    }

    #[inline]
    fn hashcode(self) -> u64 {
        xxh3_64(&self.to_le_bytes())
    }

    fn into_column_values(values: Vec<Self>) -> ColumnValues {
        ColumnValues::Int128(values)
    }

    fn slice_of(values: &ColumnValues) -> Option<&[Self]> {
        match values {
            ColumnValues::Int128(v) => Some(v),
            _ => None,
        }
    }
}

macro_rules! impl_native_float {
    ($($t:ty => $variant:ident),*) => {
        $(impl NativeType for $t {
            const TYPE: PhysicalType = PhysicalType::$variant;

            #[inline]
            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(*v),
                    _ => None,
                }
            }

            #[inline]
            fn into_value(self) -> Value {
                Value::$variant(self)
            }

            #[inline]
            fn hashcode(self) -> u64 {
                hash_code(self.to_bits() as u64)
            }

            #[inline]
            fn key_eq(self, other: Self) -> bool {
                self.to_bits() == other.to_bits()
            }

            fn into_column_values(values: Vec<Self>) -> ColumnValues {
                ColumnValues::$variant(values)
            }

            fn slice_of(values: &ColumnValues) -> Option<&[Self]> {
                match values {
                    ColumnValues::$variant(v) => Some(v),
                    _ => None,
                }
            }
        })*
    };
}

impl_native_float!(f32 => Float32, f64 => Float64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_code_mixes() {
        assert_ne!(hash_code(1), hash_code(2));
        assert_eq!(hash_code(12345), hash_code(12345));
        // low bits of consecutive keys should not be consecutive
        let spread: std::collections::HashSet<u64> = (0..256u64).map(|k| hash_code(k) & 0xff).collect();
        assert!(spread.len() > 100);
    }

    #[test]
    fn test_type_names_roundtrip() {
        for t in [
            PhysicalType::Int8,
            PhysicalType::Int16,
            PhysicalType::Int32,
            PhysicalType::Int64,
            PhysicalType::Int128,
            PhysicalType::Float32,
            PhysicalType::Float64,
            PhysicalType::String,
        ] {
            assert_eq!(t.name().parse::<PhysicalType>().unwrap(), t);
        }
        assert!("uint8".parse::<PhysicalType>().is_err());
        assert_eq!(PhysicalType::Int128.size(), Some(16));
        assert_eq!(PhysicalType::String.size(), None);
    }

    #[test]
    fn test_native_conversions() {
        assert_eq!(i32::from_value(&Value::Int32(-5)), Some(-5));
        assert_eq!(i32::from_value(&Value::Int64(-5)), None);
        assert_eq!(7i8.into_value(), Value::Int8(7));
        assert_eq!((-1i32).hashcode(), (-1i64).hashcode());
        assert_ne!(1i128.hashcode(), 2i128.hashcode());
        assert!(f64::NAN.key_eq(f64::NAN));
        assert!(!0.0f32.key_eq(-0.0f32));
    }

    #[test]
    fn test_value_parse() {
        assert_eq!(Value::parse(PhysicalType::Int16, "-12").unwrap(), Value::Int16(-12));
        assert_eq!(Value::parse(PhysicalType::Float64, "1.5").unwrap(), Value::Float64(1.5));
        assert!(Value::parse(PhysicalType::Int8, "300").is_err());
        assert_eq!(Value::Int32(3).to_string(), "3");
    }
}
