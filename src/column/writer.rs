//! Column writers
//!
//! A writer owns the column's write token until it is finalized or dropped.
//! Inserts go straight into private base pages (published pages are copied
//! on first touch); updates of existing rows are buffered in an ordered map
//! and become one [`ColumnDelta`] at finalize.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::trace;

use crate::column::reader::{lookup, probe_value};
use crate::column::{
    block_of, clone_with_room, expanded_capacity, offset_of, CapturedVersion, Column, ColumnDelta,
    ColumnPage, VersionInfo, WriteToken,
};
use crate::error::{MvccError, Result};
use crate::schema::ColumnSchema;
use crate::types::{NativeType, RowId, Value, Version};

/// Type-erased write access to the latest version of one column
pub trait ColumnWriter: Send {
    fn schema(&self) -> &ColumnSchema;

    /// Write a cell of a new row directly into the base pages
    fn insert(&mut self, rid: RowId, value: Option<&Value>) -> Result<()>;

    /// Buffer a new value for an existing row
    fn update(&mut self, rid: RowId, value: Option<&Value>) -> Result<()>;

    /// Cell as this writer currently sees it; `None` for null
    fn get(&self, rid: RowId) -> Option<Value>;

    fn hashcode(&self, value: &Value) -> Result<u64>;

    fn hashcode_at(&self, rid: RowId) -> Option<u64>;

    fn equals(&self, rid: RowId, value: &Value) -> bool;

    /// Buffered updates so far
    fn num_updates(&self) -> usize;

    /// Publish the buffered changes as `version`, returning the new column generation
    fn finalize(self: Box<Self>, version: Version) -> Result<Arc<Column>>;
}

/// Writer for one element type
pub struct TypedColumnWriter<T: NativeType> {
    column: Arc<Column>,
    base: Vec<Arc<ColumnPage>>,
    base_dirty: bool,
    deltas: Vec<Arc<ColumnDelta>>,
    updates: BTreeMap<RowId, Option<T>>,
    nullable: bool,
    _token: WriteToken,
}

impl<T: NativeType> TypedColumnWriter<T> {
    pub(crate) fn new(column: Arc<Column>, captured: CapturedVersion, token: WriteToken) -> Result<Self> {
        let base = clone_with_room(column.base_pages())?;
        let nullable = column.schema().nullable;
        Ok(Self {
            column,
            base,
            base_dirty: false,
            deltas: captured.deltas,
            updates: BTreeMap::new(),
            nullable,
            _token: token,
        })
    }

    fn check_null(&self, value: Option<T>) -> Result<()> {
        if value.is_none() && !self.nullable {
            return Err(MvccError::InvalidArgument(format!(
                "column {} is not nullable",
                self.column.schema().name
            )));
        }
        Ok(())
    }

    fn expand_base(&mut self) -> Result<()> {
        if self.base.len() == self.base.capacity() {
            let additional = expanded_capacity(self.base.capacity()) - self.base.len();
            self.base
                .try_reserve_exact(additional)
                .map_err(|e| MvccError::OutOfMemory(format!("base page vector: {}", e)))?;
        }
        self.base.push(Arc::new(ColumnPage::alloc(self.column.esize())?));
        trace!(column = %self.column.schema().name, pages = self.base.len(), "expanded base");
        Ok(())
    }

    /// Page `block`, copied first if a published generation still shares it
    fn page_mut(&mut self, block: usize) -> Result<&mut ColumnPage> {
        let slot = &mut self.base[block];
        if Arc::get_mut(slot).is_none() {
            let copy = slot.try_clone()?;
            *slot = Arc::new(copy);
        }
        Arc::get_mut(slot)
            .ok_or_else(|| MvccError::IllegalState(format!("page {} is still shared", block)))
    }

    pub fn insert_typed(&mut self, rid: RowId, value: Option<T>) -> Result<()> {
        self.check_null(value)?;
        let block = block_of(rid);
        if block > self.base.len() {
            return Err(MvccError::InvalidArgument(format!(
                "row {} skips past the {} allocated pages",
                rid,
                self.base.len()
            )));
        }
        if block == self.base.len() {
            self.expand_base()?;
        }
        let offset = offset_of(rid);
        let page = self.page_mut(block)?;
        match value {
            Some(v) => {
                page.values_mut::<T>()[offset] = v;
                page.set_not_null(offset);
            }
            None => page.set_null(offset)?,
        }
        self.base_dirty = true;
        Ok(())
    }

    pub fn update_typed(&mut self, rid: RowId, value: Option<T>) -> Result<()> {
        self.check_null(value)?;
        if block_of(rid) >= self.base.len() {
            return Err(MvccError::InvalidArgument(format!(
                "update of row {} which was never inserted",
                rid
            )));
        }
        self.updates.insert(rid, value);
        Ok(())
    }

    #[inline]
    pub fn get_typed(&self, rid: RowId) -> Option<T> {
        match self.updates.get(&rid) {
            Some(v) => *v,
            None => lookup::<T>(self.nullable, &self.base, &self.deltas, rid),
        }
    }

    fn typed_arg(&self, value: Option<&Value>) -> Result<Option<T>> {
        value
            .map(|v| probe_value::<T>(self.column.schema(), v))
            .transpose()
    }
}

impl<T: NativeType> ColumnWriter for TypedColumnWriter<T> {
    fn schema(&self) -> &ColumnSchema {
        self.column.schema()
    }

    fn insert(&mut self, rid: RowId, value: Option<&Value>) -> Result<()> {
        let value = self.typed_arg(value)?;
        self.insert_typed(rid, value)
    }

    fn update(&mut self, rid: RowId, value: Option<&Value>) -> Result<()> {
        let value = self.typed_arg(value)?;
        self.update_typed(rid, value)
    }

    fn get(&self, rid: RowId) -> Option<Value> {
        self.get_typed(rid).map(NativeType::into_value)
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

    fn num_updates(&self) -> usize {
        self.updates.len()
    }

    fn finalize(self: Box<Self>, version: Version) -> Result<Arc<Column>> {
        let this = *self;
        let latest = this.column.latest_version();
        if version <= latest {
            return Err(MvccError::InvalidArgument(format!(
                "version {} of column {} is not after {}",
                version,
                this.column.schema().name,
                latest
            )));
        }
        if this.updates.is_empty() && !this.base_dirty {
            return Ok(this.column);
        }

        let delta = if this.updates.is_empty() {
            None
        } else {
            Some(Arc::new(ColumnDelta::build(this.base.len(), &this.updates)?))
        };
        trace!(
            column = %this.column.schema().name,
            version,
            updates = this.updates.len(),
            pages = this.base.len(),
            "finalized column"
        );

        let mut versions = clone_with_room(this.column.version_list())?;
        versions.push(VersionInfo { version, delta });
        let next = this.column.next_generation(this.base, versions);
        Ok(Arc::new(next))
    }
}
