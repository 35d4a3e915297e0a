//! Snapshot scans and point gets
//!
//! A scan pins one version: the schema, row count and column readers are
//! resolved when it is opened, so commits that land while it runs are not
//! visible to it.

use std::sync::Arc;

use crate::column::{ColumnBlock, ColumnReader, BLOCK_SIZE};
use crate::error::{MvccError, Result};
use crate::index::{Entry, HashIndex};
use crate::schema::Schema;
use crate::types::{RowId, Value, Version};

/// What to read and at which version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSpec {
    pub version: Version,
    /// Maximum rows to scan
    pub limit: Option<usize>,
    /// Projected column names, in output order
    pub columns: Vec<String>,
    /// Open the key index too, enabling [`MemTabletScan::get`]
    pub support_get: bool,
}

impl ScanSpec {
    pub fn new(version: Version, columns: Vec<String>) -> Self {
        Self {
            version,
            limit: None,
            columns,
            support_get: false,
        }
    }

    /// Parse a comma separated projection such as `"id,pv"`
    pub fn parse(version: Version, projection: &str, support_get: bool) -> Result<Self> {
        let columns: Vec<String> = projection
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if columns.is_empty() {
            return Err(MvccError::InvalidArgument(format!(
                "empty projection {:?}",
                projection
            )));
        }
        Ok(Self {
            support_get,
            ..Self::new(version, columns)
        })
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_get(mut self) -> Self {
        self.support_get = true;
        self
    }
}

/// Projected columns of a run of rows
#[derive(Debug, Default)]
pub struct RowBlock {
    num_rows: usize,
    columns: Vec<ColumnBlock>,
}

impl RowBlock {
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn columns(&self) -> &[ColumnBlock] {
        &self.columns
    }

    /// Column by its position in the projection
    pub fn column(&self, idx: usize) -> Option<&ColumnBlock> {
        self.columns.get(idx)
    }

    /// Cell at `row` of projected column `col`; `None` for null or out of range
    pub fn get(&self, row: usize, col: usize) -> Option<Value> {
        self.columns.get(col)?.get(row)
    }
}

/// Result of a point get: matched rows in `block`, one offset per key
#[derive(Debug)]
pub struct GetResult {
    /// Row of `block` holding each key, `None` if the key is absent
    pub offsets: Vec<Option<usize>>,
    pub block: RowBlock,
}

impl GetResult {
    pub fn num_found(&self) -> usize {
        self.block.num_rows()
    }

    /// Projected column `col` of the row found for key `key_idx`
    pub fn get(&self, key_idx: usize, col: usize) -> Option<Value> {
        let row = (*self.offsets.get(key_idx)?)?;
        self.block.get(row, col)
    }
}

/// Block-at-a-time reader of one tablet version
pub struct MemTabletScan {
    schema: Arc<Schema>,
    spec: ScanSpec,
    num_rows: usize,
    readers: Vec<Box<dyn ColumnReader>>,
    key_reader: Option<Box<dyn ColumnReader>>,
    index: Option<Arc<HashIndex>>,
    entries: Vec<Entry>,
    next_block: usize,
    block: RowBlock,
}

impl MemTabletScan {
    pub(crate) fn new(
        schema: Arc<Schema>,
        spec: ScanSpec,
        num_rows: usize,
        readers: Vec<Box<dyn ColumnReader>>,
        key_reader: Option<Box<dyn ColumnReader>>,
        index: Option<Arc<HashIndex>>,
    ) -> Self {
        let num_rows = spec.limit.map_or(num_rows, |limit| limit.min(num_rows));
        Self {
            schema,
            spec,
            num_rows,
            readers,
            key_reader,
            index,
            entries: Vec::new(),
            next_block: 0,
            block: RowBlock::default(),
        }
    }

    /// Schema of the scanned version
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn spec(&self) -> &ScanSpec {
        &self.spec
    }

    /// Rows this scan will return
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Read the next block of rows; `None` once every row was returned
    pub fn next_scan_block(&mut self) -> Result<Option<&RowBlock>> {
        let start = self.next_block * BLOCK_SIZE;
        if start >= self.num_rows {
            return Ok(None);
        }
        let nrows = (self.num_rows - start).min(BLOCK_SIZE);
        let columns = self
            .readers
            .iter()
            .map(|r| r.read_block(self.next_block, nrows))
            .collect::<Result<Vec<_>>>()?;
        self.next_block += 1;
        self.block = RowBlock {
            num_rows: nrows,
            columns,
        };
        Ok(Some(&self.block))
    }

    /// Look up rows by key value
    pub fn get(&mut self, keys: &[Value]) -> Result<GetResult> {
        let (key_reader, index) = match (&self.key_reader, &self.index) {
            (Some(reader), Some(index)) => (reader, index),
            _ => {
                return Err(MvccError::InvalidArgument(
                    "scan was not opened with get support".to_string(),
                ))
            }
        };

        let mut rids: Vec<RowId> = Vec::with_capacity(keys.len());
        let mut offsets = Vec::with_capacity(keys.len());
        for key in keys {
            let hash = key_reader.hashcode(key)?;
            index.find(hash, &mut self.entries);
            // the index may be newer than this scan
            let found = self
                .entries
                .iter()
                .find(|e| (e.value as usize) < self.num_rows && key_reader.equals(e.value, key));
            match found {
                Some(e) => {
                    offsets.push(Some(rids.len()));
                    rids.push(e.value);
                }
                None => offsets.push(None),
            }
        }

        let columns = self.readers.iter().map(|r| r.get_by_rids(&rids)).collect();
        Ok(GetResult {
            offsets,
            block: RowBlock {
                num_rows: rids.len(),
                columns,
            },
        })
    }
}
