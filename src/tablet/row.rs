//! Staged rows
//!
//! Rows to be written are staged as [`PartialRow`]s: a key plus any subset
//! of the other columns, ordered by cid. Rows are grouped into bounded
//! [`PartialRowBatch`]es, and the batches of one commit form a [`WriteTx`].

use std::sync::Arc;

use crate::config::WriteConfig;
use crate::error::{MvccError, Result};
use crate::schema::Schema;
use crate::types::Value;

/// One staged cell. `value == None` writes a null.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub cid: u32,
    pub value: Option<Value>,
}

/// A staged row: cells ascending by cid, the first one is the key
#[derive(Debug, Clone, PartialEq)]
pub struct PartialRow {
    cells: Vec<Cell>,
    delete: bool,
}

impl PartialRow {
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cell_size(&self) -> usize {
        self.cells.len()
    }

    /// The key cell
    pub fn key(&self) -> Option<&Cell> {
        self.cells.first()
    }

    pub fn get(&self, cid: u32) -> Option<&Cell> {
        self.cells
            .binary_search_by_key(&cid, |c| c.cid)
            .ok()
            .map(|i| &self.cells[i])
    }

    pub fn is_delete(&self) -> bool {
        self.delete
    }
}

/// A bounded group of staged rows
#[derive(Debug)]
pub struct PartialRowBatch {
    schema: Arc<Schema>,
    rows: Vec<PartialRow>,
    byte_size: usize,
    row_capacity: usize,
    byte_capacity: usize,
}

impl PartialRowBatch {
    pub fn new(schema: Arc<Schema>, row_capacity: usize, byte_capacity: usize) -> Self {
        Self {
            schema,
            rows: Vec::new(),
            byte_size: 0,
            row_capacity,
            byte_capacity,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn row_size(&self) -> usize {
        self.rows.len()
    }

    pub fn row_capacity(&self) -> usize {
        self.row_capacity
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn byte_capacity(&self) -> usize {
        self.byte_capacity
    }

    pub fn rows(&self) -> &[PartialRow] {
        &self.rows
    }

    pub fn get_row(&self, idx: usize) -> Option<&PartialRow> {
        self.rows.get(idx)
    }

    fn has_room(&self, row_bytes: usize) -> bool {
        self.rows.len() < self.row_capacity && self.byte_size + row_bytes + 4 <= self.byte_capacity
    }

    fn push(&mut self, row: PartialRow, row_bytes: usize) -> Result<()> {
        if !self.has_room(row_bytes) {
            return Err(MvccError::InvalidArgument("over capacity".to_string()));
        }
        self.byte_size += row_bytes + 4;
        self.rows.push(row);
        Ok(())
    }
}

/// Builds [`PartialRow`]s against a schema, validating every cell
#[derive(Debug)]
pub struct PartialRowWriter {
    schema: Arc<Schema>,
    /// Indexed by cid; outer `None` means unset
    cells: Vec<Option<Option<Value>>>,
    delete: bool,
}

impl PartialRowWriter {
    pub fn new(schema: Arc<Schema>) -> Self {
        let cid_size = schema.cid_size() as usize;
        Self {
            schema,
            cells: vec![None; cid_size],
            delete: false,
        }
    }

    /// Clear all cells for the next row
    pub fn start_row(&mut self) {
        self.cells.iter_mut().for_each(|c| *c = None);
        self.delete = false;
    }

    /// Set a cell by column name; `None` writes a null
    pub fn set(&mut self, name: &str, value: Option<Value>) -> Result<()> {
        let cid = self
            .schema
            .get(name)
            .ok_or_else(|| MvccError::NotFound(format!("column {} not found", name)))?
            .cid;
        self.set_by_cid(cid, value)
    }

    /// Set a cell by column id; `None` writes a null
    pub fn set_by_cid(&mut self, cid: u32, value: Option<Value>) -> Result<()> {
        let column = self
            .schema
            .get_by_cid(cid)
            .ok_or_else(|| MvccError::NotFound(format!("cid {} not found", cid)))?;
        column.check(value.as_ref())?;
        self.cells[cid as usize] = Some(value);
        Ok(())
    }

    /// Mark the row as a delete of its key
    pub fn set_delete(&mut self) {
        self.delete = true;
    }

    /// Finish the current row
    pub fn build(&mut self) -> Result<PartialRow> {
        for key in self.schema.key_columns() {
            if self.cells[key.cid as usize].is_none() {
                return Err(MvccError::InvalidArgument(format!(
                    "build without key column {}",
                    key.name
                )));
            }
        }
        let cells = self
            .cells
            .iter_mut()
            .enumerate()
            .filter_map(|(cid, slot)| {
                slot.take().map(|value| Cell {
                    cid: cid as u32,
                    value,
                })
            })
            .collect();
        let row = PartialRow {
            cells,
            delete: self.delete,
        };
        self.start_row();
        Ok(row)
    }

    /// Finish the current row and append it to `batch`
    pub fn write_row_to_batch(&mut self, batch: &mut PartialRowBatch) -> Result<()> {
        if !Arc::ptr_eq(&self.schema, batch.schema()) && *self.schema != **batch.schema() {
            return Err(MvccError::InvalidArgument(
                "row and batch schemas differ".to_string(),
            ));
        }
        let bytes = self.pending_byte_size();
        if !batch.has_room(bytes) {
            return Err(MvccError::InvalidArgument("over capacity".to_string()));
        }
        let row = self.build()?;
        batch.push(row, bytes)
    }

    fn pending_byte_size(&self) -> usize {
        let bitmaps = (self.schema.cid_size() as usize + 7) / 8 * 2;
        bitmaps
            + self
                .cells
                .iter()
                .flatten()
                .map(|v| v.as_ref().map_or(0, Value::encoded_size))
                .sum::<usize>()
    }
}

/// All staged rows of one commit
#[derive(Debug)]
pub struct WriteTx {
    schema: Arc<Schema>,
    config: WriteConfig,
    batches: Vec<PartialRowBatch>,
}

impl WriteTx {
    pub fn new(schema: Arc<Schema>, config: WriteConfig) -> Self {
        Self {
            schema,
            config,
            batches: Vec::new(),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Open a new empty batch and return it
    pub fn new_batch(&mut self) -> &mut PartialRowBatch {
        self.batches.push(PartialRowBatch::new(
            self.schema.clone(),
            self.config.batch_row_capacity,
            self.config.batch_byte_capacity,
        ));
        let last = self.batches.len() - 1;
        &mut self.batches[last]
    }

    pub fn batch_size(&self) -> usize {
        self.batches.len()
    }

    pub fn get_batch(&self, idx: usize) -> Option<&PartialRowBatch> {
        self.batches.get(idx)
    }

    pub fn batches(&self) -> &[PartialRowBatch] {
        &self.batches
    }

    /// Total staged rows
    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(PartialRowBatch::row_size).sum()
    }

    /// Append the writer's current row to the last batch, opening a new batch when it is full
    pub fn add_row(&mut self, writer: &mut PartialRowWriter) -> Result<()> {
        let bytes = writer.pending_byte_size();
        if let Some(batch) = self.batches.last_mut() {
            if batch.has_room(bytes) {
                return writer.write_row_to_batch(batch);
            }
        }
        // kept only once the row is in it
        let mut batch = PartialRowBatch::new(
            self.schema.clone(),
            self.config.batch_row_capacity,
            self.config.batch_byte_capacity,
        );
        writer.write_row_to_batch(&mut batch)?;
        self.batches.push(batch);
        Ok(())
    }

    /// Stage a complete row given as `(column name, value)` pairs
    pub fn insert_row<'a>(
        &mut self,
        cells: impl IntoIterator<Item = (&'a str, Option<Value>)>,
    ) -> Result<()> {
        let mut writer = PartialRowWriter::new(self.schema.clone());
        for (name, value) in cells {
            writer.set(name, value)?;
        }
        self.add_row(&mut writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Arc<Schema> {
        Arc::new("int32 id,int32 uv,int32 pv,int8 city null".parse().unwrap())
    }

    #[test]
    fn test_build_row() {
        let mut w = PartialRowWriter::new(schema());
        w.set("pv", Some(Value::Int32(3))).unwrap();
        w.set("id", Some(Value::Int32(1))).unwrap();
        w.set("city", None).unwrap();
        let row = w.build().unwrap();

        let cids: Vec<u32> = row.cells().iter().map(|c| c.cid).collect();
        assert_eq!(cids, vec![1, 3, 4]);
        assert_eq!(row.key().unwrap().value, Some(Value::Int32(1)));
        assert_eq!(row.get(4).unwrap().value, None);
        assert!(row.get(2).is_none());
        assert!(!row.is_delete());

        // writer was reset
        assert!(w.build().is_err());
    }

    #[test]
    fn test_cell_validation() {
        let mut w = PartialRowWriter::new(schema());
        assert!(matches!(w.set("nope", Some(Value::Int32(1))), Err(MvccError::NotFound(_))));
        assert!(matches!(w.set("pv", None), Err(MvccError::InvalidArgument(_))));
        assert!(matches!(w.set("pv", Some(Value::Int8(1))), Err(MvccError::InvalidArgument(_))));
        assert!(matches!(w.set_by_cid(9, None), Err(MvccError::NotFound(_))));

        w.set("uv", Some(Value::Int32(1))).unwrap();
        let err = w.build().unwrap_err();
        assert!(err.to_string().contains("key column"));
    }

    #[test]
    fn test_batch_capacity() {
        let sc = schema();
        let mut batch = PartialRowBatch::new(sc.clone(), 2, 1 << 20);
        let mut w = PartialRowWriter::new(sc.clone());
        for id in 0..2 {
            w.set("id", Some(Value::Int32(id))).unwrap();
            w.write_row_to_batch(&mut batch).unwrap();
        }
        w.set("id", Some(Value::Int32(3))).unwrap();
        let err = w.write_row_to_batch(&mut batch).unwrap_err();
        assert_eq!(err, MvccError::InvalidArgument("over capacity".to_string()));
        assert_eq!(batch.row_size(), 2);

        let mut tiny = PartialRowBatch::new(sc, 100, 8);
        assert!(w.write_row_to_batch(&mut tiny).is_err());
    }

    #[test]
    fn test_write_tx_opens_batches() {
        let config = WriteConfig {
            batch_row_capacity: 10,
            batch_byte_capacity: 1 << 20,
        };
        let mut tx = WriteTx::new(schema(), config);
        for id in 0..25 {
            tx.insert_row([("id", Some(Value::Int32(id))), ("pv", Some(Value::Int32(1)))])
                .unwrap();
        }
        assert_eq!(tx.batch_size(), 3);
        assert_eq!(tx.num_rows(), 25);
        assert_eq!(tx.get_batch(2).unwrap().row_size(), 5);
        assert!(tx.get_batch(3).is_none());
    }

    #[test]
    fn test_oversized_row_leaves_no_empty_batch() {
        let config = WriteConfig {
            batch_row_capacity: 10,
            batch_byte_capacity: 16,
        };
        let mut tx = WriteTx::new(schema(), config);
        let mut w = PartialRowWriter::new(tx.schema().clone());
        w.set("id", Some(Value::Int32(1))).unwrap();
        w.set("uv", Some(Value::Int32(1))).unwrap();
        w.set("pv", Some(Value::Int32(1))).unwrap();
        let err = tx.add_row(&mut w).unwrap_err();
        assert_eq!(err, MvccError::InvalidArgument("over capacity".to_string()));
        assert_eq!(tx.batch_size(), 0);

        // a row without its key fails too, still without a stray batch
        let mut w = PartialRowWriter::new(tx.schema().clone());
        w.set("uv", Some(Value::Int32(1))).unwrap();
        assert!(tx.add_row(&mut w).is_err());
        assert_eq!(tx.batch_size(), 0);

        tx.insert_row([("id", Some(Value::Int32(2)))]).unwrap();
        assert_eq!(tx.batch_size(), 1);
        assert_eq!(tx.num_rows(), 1);
    }

    #[test]
    fn test_delete_flag() {
        let mut w = PartialRowWriter::new(schema());
        w.set("id", Some(Value::Int32(1))).unwrap();
        w.set_delete();
        assert!(w.build().unwrap().is_delete());
    }
}
