//! Sub-tablet: the unit of versioned storage
//!
//! A [`MemSubTablet`] owns one [`Column`] per schema column, the primary key
//! [`HashIndex`] and the list of committed `(version, row count)` pairs.
//!
//! Writes go through a [`SubTabletWriter`], which holds the sub-tablet's
//! write lock for its whole life, so there is at most one in flight. The
//! writer stages everything privately (new column generations, a
//! copy-on-write index) and [`SubTabletWriter::commit`] publishes it all at
//! once under the state lock. Readers take that lock only long enough to
//! clone the `Arc`s they need.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::column::{Column, ColumnReader, ColumnWriter};
use crate::config::IndexConfig;
use crate::error::{MvccError, Result};
use crate::index::{Entry, HashIndex, NOSLOT};
use crate::schema::Schema;
use crate::tablet::row::PartialRow;
use crate::types::{RowId, Value, Version};

/// Cid of the (single) key column
const KEY_CID: u32 = 1;

/// Committed version and the number of rows visible at it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTabletVersion {
    pub version: Version,
    pub size: usize,
}

/// Outcome of a commit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSummary {
    pub version: Version,
    /// Rows appended
    pub inserted: usize,
    /// Existing rows changed
    pub updated: usize,
    /// Visible rows after the commit
    pub num_rows: usize,
}

/// Consistent view of a sub-tablet taken by [`MemSubTablet::snapshot`]
pub struct SubTabletSnapshot {
    version: Version,
    size: usize,
    columns: Vec<Arc<Column>>,
    index: Arc<HashIndex>,
}

impl SubTabletSnapshot {
    /// Rows visible at the snapshot version
    pub fn size(&self) -> usize {
        self.size
    }

    /// Open a reader of the `i`th captured column
    pub fn read(&self, i: usize) -> Result<Box<dyn ColumnReader>> {
        let column = self
            .columns
            .get(i)
            .ok_or_else(|| MvccError::InvalidArgument(format!("snapshot has no column {}", i)))?;
        column.read(self.version)
    }

    /// Index as of the captured commit
    pub fn index(&self) -> &Arc<HashIndex> {
        &self.index
    }
}

struct SubTabletState {
    versions: Vec<SubTabletVersion>,
    columns: Vec<Option<Arc<Column>>>,
    index: Arc<HashIndex>,
}

/// Versioned in-memory storage for one schema
pub struct MemSubTablet {
    state: Mutex<SubTabletState>,
    write_lock: Mutex<()>,
    config: IndexConfig,
}

impl MemSubTablet {
    /// Create an empty sub-tablet whose first version is `version`
    pub fn create(version: Version, schema: &Schema, config: &IndexConfig) -> Result<Self> {
        if schema.num_key_column() != 1 {
            return Err(MvccError::NotSupported(format!(
                "{} key columns",
                schema.num_key_column()
            )));
        }
        let mut columns = vec![None; schema.cid_size() as usize];
        for cs in schema.columns() {
            columns[cs.cid as usize] = Some(Arc::new(Column::new(cs.clone(), version)?));
        }
        let index = Arc::new(HashIndex::new(config.initial_capacity)?);
        let mut versions = Vec::with_capacity(64);
        versions.push(SubTabletVersion { version, size: 0 });

        debug!(
            version,
            columns = schema.columns().len(),
            index_capacity = index.capacity(),
            "created sub-tablet"
        );
        Ok(Self {
            state: Mutex::new(SubTabletState {
                versions,
                columns,
                index,
            }),
            write_lock: Mutex::new(()),
            config: config.clone(),
        })
    }

    pub fn latest_version(&self) -> Version {
        self.state.lock().versions.last().map_or(0, |v| v.version)
    }

    /// Committed versions, ascending
    pub fn versions(&self) -> Vec<SubTabletVersion> {
        self.state.lock().versions.clone()
    }

    /// Rows visible at `version`
    pub fn get_size(&self, version: Version) -> Result<usize> {
        let state = self.state.lock();
        let idx = state.versions.partition_point(|v| v.version <= version);
        if idx == 0 {
            return Err(MvccError::NotFound(format!(
                "version {} precedes the sub-tablet",
                version
            )));
        }
        Ok(state.versions[idx - 1].size)
    }

    /// Open a reader of column `cid` at `version`
    pub fn read_column(&self, version: Version, cid: u32) -> Result<Box<dyn ColumnReader>> {
        let column = self.column(cid)?;
        column.read(version)
    }

    /// Current column generation of `cid`
    pub fn column(&self, cid: u32) -> Result<Arc<Column>> {
        let state = self.state.lock();
        state
            .columns
            .get(cid as usize)
            .and_then(Clone::clone)
            .ok_or_else(|| MvccError::NotFound(format!("column cid {}", cid)))
    }

    /// The index of the latest committed version
    pub fn read_index(&self) -> Arc<HashIndex> {
        self.state.lock().index.clone()
    }

    /// Capture the row count at `version`, the columns `cids` and the index
    /// under one lock, so they all come from the same commit
    pub fn snapshot(&self, version: Version, cids: &[u32]) -> Result<SubTabletSnapshot> {
        let state = self.state.lock();
        let idx = state.versions.partition_point(|v| v.version <= version);
        if idx == 0 {
            return Err(MvccError::NotFound(format!(
                "version {} precedes the sub-tablet",
                version
            )));
        }
        let columns = cids
            .iter()
            .map(|&cid| {
                state
                    .columns
                    .get(cid as usize)
                    .and_then(Clone::clone)
                    .ok_or_else(|| MvccError::NotFound(format!("column cid {}", cid)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(SubTabletSnapshot {
            version,
            size: state.versions[idx - 1].size,
            columns,
            index: state.index.clone(),
        })
    }

    /// Start the single write of this sub-tablet
    pub fn begin_write(&self, schema: &Schema) -> Result<SubTabletWriter<'_>> {
        let guard = self.write_lock.try_lock().ok_or_else(|| {
            MvccError::IllegalState("a write is already in progress".to_string())
        })?;
        if schema.num_key_column() != 1 {
            return Err(MvccError::NotSupported(format!(
                "{} key columns",
                schema.num_key_column()
            )));
        }

        let (latest, columns, index) = {
            let state = self.state.lock();
            let latest = state.versions.last().copied().unwrap_or(SubTabletVersion {
                version: 0,
                size: 0,
            });
            (latest, state.columns.clone(), state.index.clone())
        };

        for cs in schema.columns() {
            let column = columns
                .get(cs.cid as usize)
                .and_then(Option::as_ref)
                .ok_or_else(|| MvccError::NotFound(format!("column {} (cid {})", cs.name, cs.cid)))?;
            let stored = column.schema();
            if stored.ptype != cs.ptype || stored.nullable != cs.nullable {
                return Err(MvccError::InvalidArgument(format!(
                    "column {} does not match the stored {}",
                    cs, stored
                )));
            }
        }

        let mut writers: Vec<Option<Box<dyn ColumnWriter>>> = Vec::new();
        writers.resize_with(columns.len(), || None);
        open_writer(&mut writers, &columns, KEY_CID)?;

        Ok(SubTabletWriter {
            tablet: self,
            _guard: guard,
            schema: schema.clone(),
            base_version: latest.version,
            row_size: latest.size,
            columns,
            writers,
            write_index: index,
            index_dirty: false,
            entries: Vec::new(),
            inserted: 0,
            updated: 0,
            aborted: false,
        })
    }

    pub fn memory_usage(&self) -> usize {
        let state = self.state.lock();
        let columns: usize = state
            .columns
            .iter()
            .flatten()
            .map(|c| c.memory_usage())
            .sum();
        columns + state.index.memory_usage()
    }
}

fn open_writer<'w>(
    writers: &'w mut [Option<Box<dyn ColumnWriter>>],
    columns: &[Option<Arc<Column>>],
    cid: u32,
) -> Result<&'w mut (dyn ColumnWriter + 'static)> {
    let idx = cid as usize;
    let slot = writers
        .get_mut(idx)
        .ok_or_else(|| MvccError::NotFound(format!("column cid {}", cid)))?;
    if slot.is_none() {
        let column = columns
            .get(idx)
            .and_then(Option::as_ref)
            .ok_or_else(|| MvccError::NotFound(format!("column cid {}", cid)))?;
        *slot = Some(column.write()?);
    }
    slot.as_deref_mut()
        .ok_or_else(|| MvccError::IllegalState(format!("no writer for cid {}", cid)))
}

/// Exclusive writer of a [`MemSubTablet`].
///
/// Dropping it without committing discards every staged change.
pub struct SubTabletWriter<'a> {
    tablet: &'a MemSubTablet,
    _guard: MutexGuard<'a, ()>,
    schema: Schema,
    base_version: Version,
    row_size: usize,
    columns: Vec<Option<Arc<Column>>>,
    writers: Vec<Option<Box<dyn ColumnWriter>>>,
    write_index: Arc<HashIndex>,
    index_dirty: bool,
    entries: Vec<Entry>,
    inserted: usize,
    updated: usize,
    aborted: bool,
}

impl<'a> SubTabletWriter<'a> {
    /// Version this write is based on
    pub fn base_version(&self) -> Version {
        self.base_version
    }

    /// Rows including the ones appended by this write
    pub fn row_size(&self) -> usize {
        self.row_size
    }

    pub fn inserted(&self) -> usize {
        self.inserted
    }

    pub fn updated(&self) -> usize {
        self.updated
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Upsert one staged row. On error the whole write is aborted.
    pub fn apply_row(&mut self, row: &PartialRow) -> Result<()> {
        if self.aborted {
            return Err(MvccError::IllegalState(
                "write was aborted by an earlier error".to_string(),
            ));
        }
        let result = self.apply_row_inner(row);
        if let Err(e) = &result {
            self.aborted = true;
            warn!(error = %e, base_version = self.base_version, "aborting sub-tablet write");
        }
        result
    }

    fn apply_row_inner(&mut self, row: &PartialRow) -> Result<()> {
        if row.is_delete() {
            return Err(MvccError::NotSupported("row delete".to_string()));
        }
        let key = row
            .key()
            .ok_or_else(|| MvccError::InvalidArgument("row has no cells".to_string()))?;
        if key.cid != KEY_CID {
            return Err(MvccError::InvalidArgument(format!(
                "first cell must be the key column, got cid {}",
                key.cid
            )));
        }
        let key_value = key
            .value
            .as_ref()
            .ok_or_else(|| MvccError::InvalidArgument("null key".to_string()))?;
        for cell in row.cells() {
            let cs = self
                .schema
                .get_by_cid(cell.cid)
                .ok_or_else(|| MvccError::NotFound(format!("cid {}", cell.cid)))?;
            cs.check(cell.value.as_ref())?;
        }

        let hash = self.key_writer()?.hashcode(key_value)?;
        let (slot, matched) = self.probe(hash, key_value)?;
        match matched {
            Some(rid) => self.update_row(rid, row)?,
            None => self.insert_row(slot, hash, row)?,
        }

        if self.write_index.need_rehash() {
            self.rebuild_index(self.row_size * 2)?;
        }
        Ok(())
    }

    fn key_writer(&self) -> Result<&dyn ColumnWriter> {
        self.writers
            .get(KEY_CID as usize)
            .and_then(|w| w.as_deref())
            .ok_or_else(|| MvccError::IllegalState("key column writer is not open".to_string()))
    }

    /// Find the row holding `key` and a free slot for it
    fn probe(&mut self, hash: u64, key: &Value) -> Result<(u32, Option<RowId>)> {
        loop {
            let slot = self.write_index.find(hash, &mut self.entries);
            let key_writer = self
                .writers
                .get(KEY_CID as usize)
                .and_then(|w| w.as_deref())
                .ok_or_else(|| MvccError::IllegalState("key column writer is not open".to_string()))?;
            let row_size = self.row_size;
            let matched = self
                .entries
                .iter()
                .find(|e| (e.value as usize) < row_size && key_writer.equals(e.value, key))
                .map(|e| e.value);
            if matched.is_some() || slot != NOSLOT {
                return Ok((slot, matched));
            }
            // every chunk on the probe sequence is full
            let grow = self.write_index.capacity() + self.tablet.config.rehash_increment;
            self.rebuild_index(grow)?;
        }
    }

    fn insert_row(&mut self, slot: u32, hash: u64, row: &PartialRow) -> Result<()> {
        let rid = RowId::try_from(self.row_size)
            .ok()
            .filter(|rid| *rid != NOSLOT)
            .ok_or_else(|| MvccError::InvalidArgument("sub-tablet row ids exhausted".to_string()))?;

        for cs in self.schema.columns() {
            if row.get(cs.cid).is_none() && cs.default_value.is_none() && !cs.nullable {
                return Err(MvccError::InvalidArgument(format!(
                    "column {} is not nullable and has no default",
                    cs.name
                )));
            }
        }
        for cs in self.schema.columns() {
            let value = match row.get(cs.cid) {
                Some(cell) => cell.value.as_ref(),
                None => cs.default_value.as_ref(),
            };
            open_writer(&mut self.writers, &self.columns, cs.cid)?.insert(rid, value)?;
        }

        self.index_mut()?.set(slot, hash, rid)?;
        self.row_size += 1;
        self.inserted += 1;
        Ok(())
    }

    fn update_row(&mut self, rid: RowId, row: &PartialRow) -> Result<()> {
        for cell in &row.cells()[1..] {
            if self.schema.is_key(cell.cid) {
                return Err(MvccError::NotSupported(format!(
                    "update of key column cid {}",
                    cell.cid
                )));
            }
            open_writer(&mut self.writers, &self.columns, cell.cid)?.update(rid, cell.value.as_ref())?;
        }
        self.updated += 1;
        Ok(())
    }

    /// Private copy of the index, cloned from the published one on first use
    fn index_mut(&mut self) -> Result<&mut HashIndex> {
        if Arc::get_mut(&mut self.write_index).is_none() {
            let copy = self.write_index.try_clone()?;
            self.write_index = Arc::new(copy);
        }
        self.index_dirty = true;
        Arc::get_mut(&mut self.write_index)
            .ok_or_else(|| MvccError::IllegalState("write index is shared".to_string()))
    }

    /// Rebuild the index with at least `min_capacity` slots, growing until every row fits
    fn rebuild_index(&mut self, min_capacity: usize) -> Result<()> {
        let mut capacity = min_capacity.max(self.tablet.config.initial_capacity);
        let mut attempts = 1;
        loop {
            if let Some(index) = self.build_index(capacity)? {
                debug!(
                    rows = self.row_size,
                    capacity = index.capacity(),
                    attempts,
                    "rebuilt hash index"
                );
                self.write_index = Arc::new(index);
                self.index_dirty = true;
                return Ok(());
            }
            capacity += self.tablet.config.rehash_increment;
            attempts += 1;
        }
    }

    fn build_index(&self, capacity: usize) -> Result<Option<HashIndex>> {
        let key_writer = self.key_writer()?;
        let mut index = HashIndex::new(capacity)?;
        for rid in 0..self.row_size as RowId {
            let hash = key_writer
                .hashcode_at(rid)
                .ok_or_else(|| MvccError::IllegalState(format!("row {} has a null key", rid)))?;
            if !index.add(hash, rid) {
                return Ok(None);
            }
        }
        Ok(Some(index))
    }

    /// Publish every staged change as `version`
    pub fn commit(mut self, version: Version) -> Result<WriteSummary> {
        if self.aborted {
            return Err(MvccError::IllegalState(
                "cannot commit an aborted write".to_string(),
            ));
        }
        if version <= self.base_version {
            return Err(MvccError::InvalidArgument(format!(
                "commit version {} is not after {}",
                version, self.base_version
            )));
        }

        let mut finalized = Vec::new();
        for (cid, slot) in self.writers.iter_mut().enumerate() {
            if let Some(writer) = slot.take() {
                finalized.push((cid, writer.finalize(version)?));
            }
        }

        {
            let mut state = self.tablet.state.lock();
            for (cid, column) in finalized {
                state.columns[cid] = Some(column);
            }
            if self.index_dirty {
                state.index = self.write_index.clone();
            }
            state.versions.push(SubTabletVersion {
                version,
                size: self.row_size,
            });
        }

        let summary = WriteSummary {
            version,
            inserted: self.inserted,
            updated: self.updated,
            num_rows: self.row_size,
        };
        info!(
            version,
            inserted = summary.inserted,
            updated = summary.updated,
            rows = summary.num_rows,
            "committed sub-tablet write"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::tablet::row::PartialRowWriter;

    fn setup() -> (Arc<Schema>, MemSubTablet) {
        let schema: Arc<Schema> = Arc::new("int32 id,int32 uv,int32 pv,int8 city null".parse().unwrap());
        let sub = MemSubTablet::create(1, &schema, &Config::small().index).unwrap();
        (schema, sub)
    }

    fn row(schema: &Arc<Schema>, cells: &[(&str, Option<Value>)]) -> PartialRow {
        let mut w = PartialRowWriter::new(schema.clone());
        for (name, value) in cells {
            w.set(name, value.clone()).unwrap();
        }
        w.build().unwrap()
    }

    fn full_row(schema: &Arc<Schema>, id: i32, uv: i32, pv: i32) -> PartialRow {
        row(
            schema,
            &[
                ("id", Some(Value::Int32(id))),
                ("uv", Some(Value::Int32(uv))),
                ("pv", Some(Value::Int32(pv))),
            ],
        )
    }

    #[test]
    fn test_insert_then_update() {
        let (schema, sub) = setup();
        let mut w = sub.begin_write(&schema).unwrap();
        for id in 0..100 {
            w.apply_row(&full_row(&schema, id, id, 0)).unwrap();
        }
        let summary = w.commit(2).unwrap();
        assert_eq!(summary, WriteSummary { version: 2, inserted: 100, updated: 0, num_rows: 100 });

        let mut w = sub.begin_write(&schema).unwrap();
        w.apply_row(&row(&schema, &[("id", Some(Value::Int32(7))), ("pv", Some(Value::Int32(70)))]))
            .unwrap();
        let summary = w.commit(3).unwrap();
        assert_eq!((summary.inserted, summary.updated, summary.num_rows), (0, 1, 100));

        assert_eq!(sub.get_size(1).unwrap(), 0);
        assert_eq!(sub.get_size(2).unwrap(), 100);
        assert_eq!(sub.get_size(10).unwrap(), 100);
        assert!(sub.get_size(0).is_err());

        let pv3 = sub.read_column(3, 3).unwrap();
        let pv2 = sub.read_column(2, 3).unwrap();
        assert_eq!(pv3.get(7), Some(Value::Int32(70)));
        assert_eq!(pv2.get(7), Some(Value::Int32(0)));
        // uv untouched by version 3
        assert_eq!(sub.read_column(3, 2).unwrap().get(7), Some(Value::Int32(7)));
        // absent nullable column was written as null
        assert!(sub.read_column(3, 4).unwrap().is_null(7));
    }

    #[test]
    fn test_duplicate_key_in_one_write() {
        let (schema, sub) = setup();
        let mut w = sub.begin_write(&schema).unwrap();
        w.apply_row(&full_row(&schema, 5, 1, 1)).unwrap();
        w.apply_row(&full_row(&schema, 5, 2, 2)).unwrap();
        assert_eq!(w.row_size(), 1);
        assert_eq!((w.inserted(), w.updated()), (1, 1));
        w.commit(2).unwrap();
        assert_eq!(sub.read_column(2, 2).unwrap().get(0), Some(Value::Int32(2)));
    }

    #[test]
    fn test_index_grows_past_initial_capacity() {
        let (schema, sub) = setup();
        let initial = sub.read_index().capacity();
        let mut w = sub.begin_write(&schema).unwrap();
        for id in 0..5000 {
            w.apply_row(&full_row(&schema, id, 0, 0)).unwrap();
        }
        w.commit(2).unwrap();
        let index = sub.read_index();
        assert!(index.capacity() > initial);
        assert_eq!(index.size(), 5000);
        assert!(!index.need_rehash());
    }

    #[test]
    fn test_snapshot_pins_one_commit() {
        let (schema, sub) = setup();
        let mut w = sub.begin_write(&schema).unwrap();
        w.apply_row(&full_row(&schema, 1, 10, 10)).unwrap();
        w.commit(2).unwrap();

        let snap = sub.snapshot(u64::MAX, &[2, 3]).unwrap();

        let mut w = sub.begin_write(&schema).unwrap();
        w.apply_row(&full_row(&schema, 1, 20, 20)).unwrap();
        w.apply_row(&full_row(&schema, 2, 20, 20)).unwrap();
        w.commit(3).unwrap();

        // a version above every commit still resolves against the captured generation
        assert_eq!(snap.size(), 1);
        assert_eq!(snap.read(0).unwrap().get(0), Some(Value::Int32(10)));
        assert_eq!(snap.read(1).unwrap().get(0), Some(Value::Int32(10)));
        assert_eq!(snap.index().size(), 1);
        assert!(snap.read(2).is_err());

        assert!(matches!(sub.snapshot(0, &[2]), Err(MvccError::NotFound(_))));
        assert!(matches!(sub.snapshot(3, &[9]), Err(MvccError::NotFound(_))));
    }

    #[test]
    fn test_single_writer() {
        let (schema, sub) = setup();
        let w = sub.begin_write(&schema).unwrap();
        assert!(matches!(sub.begin_write(&schema), Err(MvccError::IllegalState(_))));
        drop(w);
        assert!(sub.begin_write(&schema).is_ok());
    }

    #[test]
    fn test_failed_row_aborts_write() {
        let (schema, sub) = setup();
        let mut w = sub.begin_write(&schema).unwrap();
        w.apply_row(&full_row(&schema, 1, 1, 1)).unwrap();
        // pv is not nullable and has no default
        let err = w
            .apply_row(&row(&schema, &[("id", Some(Value::Int32(2)))]))
            .unwrap_err();
        assert!(matches!(err, MvccError::InvalidArgument(_)));
        assert!(w.is_aborted());
        assert!(matches!(w.apply_row(&full_row(&schema, 3, 1, 1)), Err(MvccError::IllegalState(_))));
        assert!(matches!(w.commit(2), Err(MvccError::IllegalState(_))));

        assert_eq!(sub.latest_version(), 1);
        assert_eq!(sub.get_size(5).unwrap(), 0);
        assert_eq!(sub.read_index().size(), 0);
    }

    #[test]
    fn test_commit_version_must_increase() {
        let (schema, sub) = setup();
        let w = sub.begin_write(&schema).unwrap();
        assert!(matches!(w.commit(1), Err(MvccError::InvalidArgument(_))));
        let w = sub.begin_write(&schema).unwrap();
        w.commit(4).unwrap();
        assert_eq!(sub.latest_version(), 4);
        assert_eq!(sub.versions().len(), 2);
    }

    #[test]
    fn test_delete_rejected() {
        let (schema, sub) = setup();
        let mut w = sub.begin_write(&schema).unwrap();
        let mut rw = PartialRowWriter::new(schema.clone());
        rw.set("id", Some(Value::Int32(1))).unwrap();
        rw.set_delete();
        let err = w.apply_row(&rw.build().unwrap()).unwrap_err();
        assert!(matches!(err, MvccError::NotSupported(_)));
    }

    #[test]
    fn test_multi_key_schema_not_supported() {
        let schema = Schema::new(
            vec![
                crate::schema::ColumnSchema::new("a", 1, crate::types::PhysicalType::Int32, false),
                crate::schema::ColumnSchema::new("b", 2, crate::types::PhysicalType::Int32, false),
            ],
            2,
        )
        .unwrap();
        let err = MemSubTablet::create(1, &schema, &IndexConfig::default()).err().unwrap();
        assert!(matches!(err, MvccError::NotSupported(_)));
    }
}
