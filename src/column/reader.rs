//! Snapshot readers
//!
//! A reader pins one column generation and the delta chain of the version
//! it was opened at. It never takes a lock after construction.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::column::{block_of, offset_of, CapturedVersion, Column, ColumnBlock, ColumnDelta, ColumnPage, BLOCK_SIZE};
use crate::error::{MvccError, Result};
use crate::schema::ColumnSchema;
use crate::types::{NativeType, RowId, Value, Version};

/// Type-erased read access to one column at one version
pub trait ColumnReader: Send + Sync {
    fn schema(&self) -> &ColumnSchema;

    /// The newest retained version at or below the requested one
    fn real_version(&self) -> Version;

    /// Cell value; `None` for null
    fn get(&self, rid: RowId) -> Option<Value>;

    fn is_null(&self, rid: RowId) -> bool;

    /// Hash of a probe value, as stored keys are hashed
    fn hashcode(&self, value: &Value) -> Result<u64>;

    /// Hash of the stored cell; `None` for null
    fn hashcode_at(&self, rid: RowId) -> Option<u64>;

    /// Whether the stored cell equals `value` (same type, non-null)
    fn equals(&self, rid: RowId, value: &Value) -> bool;

    /// Materialize the first `nrows` rows of page `block`
    fn read_block(&self, block: usize, nrows: usize) -> Result<ColumnBlock>;

    /// Materialize the given rows in order
    fn get_by_rids(&self, rids: &[RowId]) -> ColumnBlock;
}

/// Resolve a cell through the delta chain, then the base page. `None` is null.
#[inline]
pub(crate) fn lookup<T: NativeType>(
    nullable: bool,
    base: &[Arc<ColumnPage>],
    deltas: &[Arc<ColumnDelta>],
    rid: RowId,
) -> Option<T> {
    for delta in deltas {
        if let Some(idx) = delta.find_idx(rid) {
            if nullable && delta.is_null(idx) {
                return None;
            }
            return Some(delta.value::<T>(idx));
        }
    }
    let page = base.get(block_of(rid))?;
    let offset = offset_of(rid);
    if nullable && page.is_null(offset) {
        return None;
    }
    Some(page.values::<T>()[offset])
}

pub(crate) fn probe_value<T: NativeType>(schema: &ColumnSchema, value: &Value) -> Result<T> {
    T::from_value(value).ok_or_else(|| {
        MvccError::InvalidArgument(format!(
            "column {} expects {}, got {}",
            schema.name,
            T::TYPE,
            value.physical_type()
        ))
    })
}

/// Reader for one element type
pub struct TypedColumnReader<T: NativeType> {
    column: Arc<Column>,
    real_version: Version,
    deltas: Vec<Arc<ColumnDelta>>,
    nullable: bool,
    _marker: PhantomData<T>,
}

impl<T: NativeType> TypedColumnReader<T> {
    pub(crate) fn new(column: Arc<Column>, captured: CapturedVersion) -> Self {
        let nullable = column.schema().nullable;
        Self {
            column,
            real_version: captured.real_version,
            deltas: captured.deltas,
            nullable,
            _marker: PhantomData,
        }
    }

    /// Typed cell value; `None` for null
    #[inline]
    pub fn get_typed(&self, rid: RowId) -> Option<T> {
        lookup::<T>(self.nullable, self.column.base_pages(), &self.deltas, rid)
    }

    /// Number of deltas consulted by this snapshot
    pub fn delta_depth(&self) -> usize {
        self.deltas.len()
    }
}

impl<T: NativeType> ColumnReader for TypedColumnReader<T> {
    fn schema(&self) -> &ColumnSchema {
        self.column.schema()
    }

    fn real_version(&self) -> Version {
        self.real_version
    }

    fn get(&self, rid: RowId) -> Option<Value> {
        self.get_typed(rid).map(NativeType::into_value)
    }

    fn is_null(&self, rid: RowId) -> bool {
        self.get_typed(rid).is_none()
    }

    fn hashcode(&self, value: &Value) -> Result<u64> {
        Ok(probe_value::<T>(self.column.schema(), value)?.hashcode())
    }

    fn hashcode_at(&self, rid: RowId) -> Option<u64> {
        self.get_typed(rid).map(NativeType::hashcode)
    }

    fn equals(&self, rid: RowId, value: &Value) -> bool {
        match (T::from_value(value), self.get_typed(rid)) {
            (Some(probe), Some(stored)) => probe.key_eq(stored),
            _ => false,
        }
    }

    fn read_block(&self, block: usize, nrows: usize) -> Result<ColumnBlock> {
        if nrows > BLOCK_SIZE {
            return Err(MvccError::InvalidArgument(format!(
                "cannot read {} rows from one block",
                nrows
            )));
        }
        if nrows == 0 {
            return Ok(ColumnBlock::new::<T>(Vec::new(), None));
        }
        let page = self.column.base_pages().get(block).ok_or_else(|| {
            MvccError::NotFound(format!(
                "block {} of column {}",
                block,
                self.column.schema().name
            ))
        })?;

        let mut values = page.values::<T>()[..nrows].to_vec();
        let mut nulls: Option<Vec<bool>> = if self.nullable && page.has_nulls() {
            Some((0..nrows).map(|off| page.is_null(off)).collect())
        } else {
            None
        };

        // oldest first so newer deltas overwrite
        for delta in self.deltas.iter().rev() {
            let (start, _) = delta.index().block_range(block);
            for (k, &off) in delta.index().block_offsets(block).iter().enumerate() {
                let off = off as usize;
                if off >= nrows {
                    break;
                }
                let idx = start as usize + k;
                if self.nullable && delta.is_null(idx) {
                    nulls.get_or_insert_with(|| vec![false; nrows])[off] = true;
                } else {
                    values[off] = delta.value::<T>(idx);
                    if let Some(flags) = nulls.as_mut() {
                        flags[off] = false;
                    }
                }
            }
        }

        Ok(ColumnBlock::new(values, nulls))
    }

    fn get_by_rids(&self, rids: &[RowId]) -> ColumnBlock {
        let mut values = Vec::with_capacity(rids.len());
        let mut nulls: Option<Vec<bool>> = None;
        for (i, &rid) in rids.iter().enumerate() {
            match self.get_typed(rid) {
                Some(v) => values.push(v),
                None => {
                    values.push(T::default());
                    nulls.get_or_insert_with(|| vec![false; rids.len()])[i] = true;
                }
            }
        }
        ColumnBlock::new(values, nulls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::ColumnWriter;
    use crate::types::PhysicalType;

    fn nullable_column() -> Arc<Column> {
        let schema = ColumnSchema::new("city", 4, PhysicalType::Int8, true);
        let col = Arc::new(Column::new(schema, 1).unwrap());
        let mut w = col.write().unwrap();
        for rid in 0..100u32 {
            let v = if rid % 10 == 0 { None } else { Some(Value::Int8(rid as i8)) };
            w.insert(rid, v.as_ref()).unwrap();
        }
        let col = w.finalize(2).unwrap();

        let mut w = col.write().unwrap();
        w.update(5, None).unwrap();
        w.update(10, Some(&Value::Int8(-10))).unwrap();
        w.finalize(3).unwrap()
    }

    #[test]
    fn test_nulls_through_versions() {
        let col = nullable_column();

        let v2 = col.read(2).unwrap();
        assert_eq!(v2.get(5), Some(Value::Int8(5)));
        assert!(v2.is_null(10));

        let v3 = col.read(3).unwrap();
        assert!(v3.is_null(5));
        assert_eq!(v3.get(10), Some(Value::Int8(-10)));
        assert!(v3.is_null(20));
        assert_eq!(v3.get(21), Some(Value::Int8(21)));
    }

    #[test]
    fn test_read_block_overlays_deltas() {
        let col = nullable_column();
        let block = col.read(3).unwrap().read_block(0, 100).unwrap();
        assert_eq!(block.len(), 100);
        assert_eq!(block.get(5), None);
        assert_eq!(block.get(10), Some(Value::Int8(-10)));
        assert_eq!(block.get(20), None);
        assert_eq!(block.get(99), Some(Value::Int8(99)));

        let old = col.read(2).unwrap().read_block(0, 11).unwrap();
        assert_eq!(old.len(), 11);
        assert_eq!(old.get(5), Some(Value::Int8(5)));
        assert_eq!(old.get(10), None);

        assert!(col.read(3).unwrap().read_block(1, 10).is_err());
    }

    #[test]
    fn test_get_by_rids_and_equals() {
        let col = nullable_column();
        let reader = col.read(3).unwrap();
        let block = reader.get_by_rids(&[10, 5, 7]);
        assert_eq!(block.get(0), Some(Value::Int8(-10)));
        assert_eq!(block.get(1), None);
        assert_eq!(block.get(2), Some(Value::Int8(7)));

        assert!(reader.equals(7, &Value::Int8(7)));
        assert!(!reader.equals(7, &Value::Int16(7)));
        assert!(!reader.equals(5, &Value::Int8(0)));
        assert_eq!(reader.hashcode(&Value::Int8(7)).unwrap(), reader.hashcode_at(7).unwrap());
        assert!(reader.hashcode(&Value::Int32(7)).is_err());
    }
}
