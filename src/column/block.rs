//! Materialized column values for one block or one point-lookup batch

use crate::types::{NativeType, PhysicalType, Value};

/// Typed value vector
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValues {
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Int128(Vec<i128>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

macro_rules! dispatch {
    ($values:expr, $v:ident => $body:expr) => {
        match $values {
            ColumnValues::Int8($v) => $body,
            ColumnValues::Int16($v) => $body,
            ColumnValues::Int32($v) => $body,
            ColumnValues::Int64($v) => $body,
            ColumnValues::Int128($v) => $body,
            ColumnValues::Float32($v) => $body,
            ColumnValues::Float64($v) => $body,
        }
    };
}

impl ColumnValues {
    pub fn len(&self) -> usize {
        dispatch!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn physical_type(&self) -> PhysicalType {
        match self {
            ColumnValues::Int8(_) => PhysicalType::Int8,
            ColumnValues::Int16(_) => PhysicalType::Int16,
            ColumnValues::Int32(_) => PhysicalType::Int32,
            ColumnValues::Int64(_) => PhysicalType::Int64,
            ColumnValues::Int128(_) => PhysicalType::Int128,
            ColumnValues::Float32(_) => PhysicalType::Float32,
            ColumnValues::Float64(_) => PhysicalType::Float64,
        }
    }

    /// Value at `idx`, ignoring null flags
    pub fn get(&self, idx: usize) -> Option<Value> {
        dispatch!(self, v => v.get(idx).map(|x| (*x).into_value()))
    }
}

/// Values of one column plus null flags
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnBlock {
    values: ColumnValues,
    /// Present only when at least one cell is null
    nulls: Option<Vec<bool>>,
}

impl ColumnBlock {
    pub(crate) fn new<T: NativeType>(values: Vec<T>, nulls: Option<Vec<bool>>) -> Self {
        Self {
            values: T::into_column_values(values),
            nulls,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn physical_type(&self) -> PhysicalType {
        self.values.physical_type()
    }

    pub fn values(&self) -> &ColumnValues {
        &self.values
    }

    /// Typed view of the values; `None` if `T` is not this column's type
    pub fn typed<T: NativeType>(&self) -> Option<&[T]> {
        T::slice_of(&self.values)
    }

    pub fn is_null(&self, idx: usize) -> bool {
        self.nulls
            .as_ref()
            .map_or(false, |n| n.get(idx).copied().unwrap_or(false))
    }

    pub fn has_nulls(&self) -> bool {
        self.nulls.is_some()
    }

    /// Cell at `idx`; `None` for null or out of range
    pub fn get(&self, idx: usize) -> Option<Value> {
        if self.is_null(idx) {
            return None;
        }
        self.values.get(idx)
    }
}
