//! Configuration for the MVCC column store
//!
//! Row block geometry is fixed at compile time (see [`crate::column::BLOCK_SIZE`]);
//! only index sizing and staging capacities are tunable.

use serde::{Deserialize, Serialize};

use crate::error::{MvccError, Result};

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Primary key index configuration
    pub index: IndexConfig,

    /// Write staging configuration
    pub write: WriteConfig,
}

/// Hash index sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Capacity (rows) of the index a new sub-tablet starts with
    pub initial_capacity: usize,

    /// Capacity added per retry when a rebuild cannot place every row
    pub rehash_increment: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 1 << 16, // 64K rows
            rehash_increment: 65536,
        }
    }
}

/// Staged row batch capacities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    /// Maximum rows per staged batch
    pub batch_row_capacity: usize,

    /// Maximum encoded bytes per staged batch
    pub batch_byte_capacity: usize,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            batch_row_capacity: 1 << 15, // 32K rows
            batch_byte_capacity: 1_000_000, // ~1 MB
        }
    }
}

impl Config {
    /// Create a config with a tiny index and small batches, for tests and tools
    pub fn small() -> Self {
        let mut config = Self::default();
        config.index.initial_capacity = 64;
        config.index.rehash_increment = 64;
        config.write.batch_row_capacity = 1024;
        config.write.batch_byte_capacity = 64 * 1024; // 64 KB
        config
    }

    /// Parse a config from JSON, filling missing fields with defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.index.initial_capacity == 0 {
            return Err(MvccError::InvalidConfig(
                "index.initial_capacity must be > 0".to_string(),
            ));
        }
        if self.index.rehash_increment == 0 {
            return Err(MvccError::InvalidConfig(
                "index.rehash_increment must be > 0".to_string(),
            ));
        }
        if self.write.batch_row_capacity == 0 {
            return Err(MvccError::InvalidConfig(
                "write.batch_row_capacity must be > 0".to_string(),
            ));
        }
        if self.write.batch_byte_capacity == 0 {
            return Err(MvccError::InvalidConfig(
                "write.batch_byte_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
