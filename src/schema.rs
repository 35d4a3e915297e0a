//! Table schemas
//!
//! A schema is an ordered list of columns. Column id 0 is reserved for the
//! row delete marker, so user columns start at cid 1 and the key columns are
//! always cids `1..=num_key_column`.
//!
//! Schemas can be written as text, one `<type> <name> [null]` item per column:
//!
//! ```text
//! int32 id,int32 uv,int32 pv,int8 city null
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{MvccError, Result};
use crate::types::{PhysicalType, Value};

/// Longest string cell accepted by the row writer
pub const MAX_STRING_LEN: usize = 65535;

/// Largest column id; per-cid tables are sized by the largest cid in use
pub const MAX_CID: u32 = 65535;

/// Definition of a single column
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub cid: u32,
    pub ptype: PhysicalType,
    pub nullable: bool,
    pub default_value: Option<Value>,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, cid: u32, ptype: PhysicalType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            cid,
            ptype,
            nullable,
            default_value: None,
        }
    }

    /// Attach a default value used when an inserted row omits this column
    pub fn with_default(mut self, value: Value) -> Result<Self> {
        if value.physical_type() != self.ptype {
            return Err(MvccError::InvalidArgument(format!(
                "default for column {} must be {}, got {}",
                self.name,
                self.ptype,
                value.physical_type()
            )));
        }
        self.default_value = Some(value);
        Ok(self)
    }

    /// Validate a cell (`None` is null) against this column's type and nullability
    pub fn check(&self, value: Option<&Value>) -> Result<()> {
        match value {
            None if !self.nullable => Err(MvccError::InvalidArgument(format!(
                "column {} is not nullable",
                self.name
            ))),
            None => Ok(()),
            Some(v) if v.physical_type() != self.ptype => Err(MvccError::InvalidArgument(format!(
                "column {} expects {}, got {}",
                self.name,
                self.ptype,
                v.physical_type()
            ))),
            Some(Value::String(s)) if s.len() > MAX_STRING_LEN => Err(MvccError::InvalidArgument(
                format!("string too long for column {}: {} bytes", self.name, s.len()),
            )),
            Some(_) => Ok(()),
        }
    }
}

impl fmt::Display for ColumnSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.ptype, self.name)?;
        if self.nullable {
            write!(f, " null")?;
        }
        Ok(())
    }
}

/// Ordered set of columns with key metadata
#[derive(Debug, Clone)]
pub struct Schema {
    columns: Vec<ColumnSchema>,
    num_key_column: u32,
    cid_size: u32,
    name_idx: HashMap<String, usize>,
    cid_idx: Vec<Option<usize>>,
}

impl Schema {
    /// Build a schema. The first `num_key_column` columns must be cids `1..=num_key_column`.
    pub fn new(columns: Vec<ColumnSchema>, num_key_column: u32) -> Result<Self> {
        if num_key_column == 0 {
            return Err(MvccError::InvalidArgument(
                "schema needs at least one key column".to_string(),
            ));
        }
        if columns.len() < num_key_column as usize {
            return Err(MvccError::InvalidArgument(format!(
                "{} key columns declared but schema has {} columns",
                num_key_column,
                columns.len()
            )));
        }

        if let Some(col) = columns.iter().find(|c| c.cid > MAX_CID) {
            return Err(MvccError::InvalidArgument(format!(
                "column {} has cid {} above the limit {}",
                col.name, col.cid, MAX_CID
            )));
        }
        let cid_size = columns
            .iter()
            .map(|c| c.cid)
            .max()
            .unwrap_or(0)
            .checked_add(1)
            .ok_or_else(|| MvccError::InvalidArgument("cid overflow".to_string()))?;
        let mut name_idx = HashMap::with_capacity(columns.len());
        let mut cid_idx = vec![None; cid_size as usize];
        for (i, col) in columns.iter().enumerate() {
            if col.cid == 0 {
                return Err(MvccError::InvalidArgument(format!(
                    "column {} uses reserved cid 0",
                    col.name
                )));
            }
            if cid_idx[col.cid as usize].replace(i).is_some() {
                return Err(MvccError::InvalidArgument(format!("duplicate cid {}", col.cid)));
            }
            if name_idx.insert(col.name.clone(), i).is_some() {
                return Err(MvccError::InvalidArgument(format!(
                    "duplicate column name {}",
                    col.name
                )));
            }
            if let Some(default) = &col.default_value {
                if default.physical_type() != col.ptype {
                    return Err(MvccError::InvalidArgument(format!(
                        "default for column {} has wrong type",
                        col.name
                    )));
                }
            }
        }

        for (i, col) in columns.iter().take(num_key_column as usize).enumerate() {
            if col.cid != i as u32 + 1 {
                return Err(MvccError::InvalidArgument(format!(
                    "key column {} must have cid {}",
                    col.name,
                    i + 1
                )));
            }
            if col.nullable {
                return Err(MvccError::InvalidArgument(format!(
                    "key column {} cannot be nullable",
                    col.name
                )));
            }
        }

        Ok(Self {
            columns,
            num_key_column,
            cid_size,
            name_idx,
            cid_idx,
        })
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn num_key_column(&self) -> u32 {
        self.num_key_column
    }

    /// One past the largest cid
    pub fn cid_size(&self) -> u32 {
        self.cid_size
    }

    pub fn is_key(&self, cid: u32) -> bool {
        cid >= 1 && cid <= self.num_key_column
    }

    pub fn key_columns(&self) -> &[ColumnSchema] {
        &self.columns[..self.num_key_column as usize]
    }

    /// Look up a column by name
    pub fn get(&self, name: &str) -> Option<&ColumnSchema> {
        self.name_idx.get(name).map(|&i| &self.columns[i])
    }

    /// Look up a column by cid
    pub fn get_by_cid(&self, cid: u32) -> Option<&ColumnSchema> {
        self.cid_idx
            .get(cid as usize)
            .copied()
            .flatten()
            .map(|i| &self.columns[i])
    }
}

impl PartialEq for Schema {
    fn eq(&self, other: &Self) -> bool {
        self.num_key_column == other.num_key_column && self.columns == other.columns
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, col) in self.columns.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", col)?;
        }
        Ok(())
    }
}

impl FromStr for Schema {
    type Err = MvccError;

    fn from_str(s: &str) -> Result<Self> {
        let mut columns = Vec::new();
        for (i, item) in s.split(',').map(str::trim).filter(|t| !t.is_empty()).enumerate() {
            let parts: Vec<&str> = item.split_whitespace().collect();
            let nullable = match parts.get(2) {
                None => false,
                Some(&"null") if parts.len() == 3 => true,
                _ => {
                    return Err(MvccError::InvalidArgument(format!(
                        "bad column definition: {:?}",
                        item
                    )))
                }
            };
            if parts.len() < 2 {
                return Err(MvccError::InvalidArgument(format!(
                    "bad column definition: {:?}",
                    item
                )));
            }
            let ptype: PhysicalType = parts[0].parse()?;
            columns.push(ColumnSchema::new(parts[1], i as u32 + 1, ptype, nullable));
        }
        Schema::new(columns, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schema() {
        let schema: Schema = "int32 id,int32 uv,int32 pv,int8 city null".parse().unwrap();
        assert_eq!(schema.columns().len(), 4);
        assert_eq!(schema.num_key_column(), 1);
        assert_eq!(schema.cid_size(), 5);

        let city = schema.get("city").unwrap();
        assert_eq!(city.cid, 4);
        assert_eq!(city.ptype, PhysicalType::Int8);
        assert!(city.nullable);
        assert_eq!(schema.get_by_cid(3).unwrap().name, "pv");
        assert!(schema.get_by_cid(0).is_none());
        assert!(schema.get("missing").is_none());
        assert!(schema.is_key(1));
        assert!(!schema.is_key(2));

        assert_eq!(schema.to_string(), "int32 id,int32 uv,int32 pv,int8 city null");
    }

    #[test]
    fn test_parse_rejects_bad_items() {
        assert!("int32".parse::<Schema>().is_err());
        assert!("int32 id notnull".parse::<Schema>().is_err());
        assert!("varchar id".parse::<Schema>().is_err());
        assert!("int32 id null".parse::<Schema>().is_err()); // nullable key
        assert!("int32 id,int8 id".parse::<Schema>().is_err());
        assert!("".parse::<Schema>().is_err());
    }

    #[test]
    fn test_new_validates_cids() {
        let cols = vec![
            ColumnSchema::new("id", 2, PhysicalType::Int64, false),
            ColumnSchema::new("v", 1, PhysicalType::Int64, false),
        ];
        assert!(Schema::new(cols, 1).is_err());

        let cols = vec![ColumnSchema::new("id", 0, PhysicalType::Int64, false)];
        assert!(Schema::new(cols, 1).is_err());

        let cols = vec![ColumnSchema::new("id", 1, PhysicalType::Int64, false)];
        assert!(Schema::new(cols, 0).is_err());
    }

    #[test]
    fn test_new_rejects_huge_cids() {
        for cid in [u32::MAX, 1 << 30, MAX_CID + 1] {
            let cols = vec![
                ColumnSchema::new("id", 1, PhysicalType::Int64, false),
                ColumnSchema::new("v", cid, PhysicalType::Int32, true),
            ];
            assert!(
                matches!(Schema::new(cols, 1), Err(MvccError::InvalidArgument(_))),
                "cid {}",
                cid
            );
        }

        let cols = vec![
            ColumnSchema::new("id", 1, PhysicalType::Int64, false),
            ColumnSchema::new("v", MAX_CID, PhysicalType::Int32, true),
        ];
        let schema = Schema::new(cols, 1).unwrap();
        assert_eq!(schema.cid_size(), MAX_CID + 1);
    }

    #[test]
    fn test_column_check() {
        let col = ColumnSchema::new("pv", 3, PhysicalType::Int32, false);
        assert!(col.check(Some(&Value::Int32(1))).is_ok());
        assert!(col.check(Some(&Value::Int64(1))).is_err());
        assert!(col.check(None).is_err());

        let city = ColumnSchema::new("city", 4, PhysicalType::Int8, true);
        assert!(city.check(None).is_ok());

        assert!(ColumnSchema::new("d", 5, PhysicalType::Int8, false)
            .with_default(Value::Int32(0))
            .is_err());
        let d = ColumnSchema::new("d", 5, PhysicalType::Int8, false)
            .with_default(Value::Int8(9))
            .unwrap();
        assert_eq!(d.default_value, Some(Value::Int8(9)));
    }
}
