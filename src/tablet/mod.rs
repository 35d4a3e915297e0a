//! Tablets
//!
//! A [`MemTablet`] is the public face of one table: it tracks schema
//! versions, turns a staged [`WriteTx`] into a commit of its
//! [`MemSubTablet`] and opens version-pinned scans.

mod row;
mod scan;
mod sub_tablet;

pub use row::{Cell, PartialRow, PartialRowBatch, PartialRowWriter, WriteTx};
pub use scan::{GetResult, MemTabletScan, RowBlock, ScanSpec};
pub use sub_tablet::{
    MemSubTablet, SubTabletSnapshot, SubTabletVersion, SubTabletWriter, WriteSummary,
};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{MvccError, Result};
use crate::schema::Schema;
use crate::types::Version;

/// In-memory tablet with versioned schema and data
pub struct MemTablet {
    dir: PathBuf,
    config: Config,
    /// `(version, schema)` ascending by version
    schemas: RwLock<Vec<(Version, Arc<Schema>)>>,
    sub_tablet: MemSubTablet,
}

impl MemTablet {
    /// Create an empty tablet at version 0
    pub fn create(dir: impl AsRef<Path>, schema: Schema, config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        let sub_tablet = MemSubTablet::create(0, &schema, &config.index)?;
        info!(dir = %dir.display(), schema = %schema, "created tablet");
        Ok(Arc::new(Self {
            dir,
            config,
            schemas: RwLock::new(vec![(0, Arc::new(schema))]),
            sub_tablet,
        }))
    }

    /// Reopen a tablet from disk
    pub fn load(dir: impl AsRef<Path>, version: Version) -> Result<Arc<Self>> {
        Err(MvccError::NotSupported(format!(
            "loading tablet {} at version {}",
            dir.as_ref().display(),
            version
        )))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn latest_schema(&self) -> Arc<Schema> {
        let schemas = self.schemas.read();
        // never empty, create() inserts version 0
        schemas[schemas.len() - 1].1.clone()
    }

    /// Schema in effect at `version`
    pub fn get_schema(&self, version: Version) -> Option<Arc<Schema>> {
        let schemas = self.schemas.read();
        let idx = schemas.partition_point(|(v, _)| *v <= version);
        idx.checked_sub(1).map(|i| schemas[i].1.clone())
    }

    pub fn latest_version(&self) -> Version {
        self.sub_tablet.latest_version()
    }

    /// Start staging rows against the latest schema
    pub fn create_writetx(&self) -> WriteTx {
        WriteTx::new(self.latest_schema(), self.config.write.clone())
    }

    /// Apply every staged row of `wtx` and publish the result as `version`
    pub fn commit(&self, wtx: WriteTx, version: Version) -> Result<WriteSummary> {
        let schema = self.latest_schema();
        if !Arc::ptr_eq(wtx.schema(), &schema) && **wtx.schema() != *schema {
            return Err(MvccError::InvalidArgument(
                "write transaction was staged against an outdated schema".to_string(),
            ));
        }
        let mut writer = self.sub_tablet.begin_write(&schema)?;
        for batch in wtx.batches() {
            for row in batch.rows() {
                writer.apply_row(row)?;
            }
        }
        debug!(
            version,
            batches = wtx.batch_size(),
            rows = wtx.num_rows(),
            "applied write transaction"
        );
        writer.commit(version)
    }

    /// Open a scan pinned to `spec.version`
    pub fn scan(&self, spec: ScanSpec) -> Result<MemTabletScan> {
        let schema = self
            .get_schema(spec.version)
            .ok_or_else(|| MvccError::NotFound(format!("schema at version {}", spec.version)))?;

        let mut cids = Vec::with_capacity(spec.columns.len() + 1);
        for name in &spec.columns {
            let cs = schema
                .get(name)
                .ok_or_else(|| MvccError::NotFound(format!("column {}", name)))?;
            cids.push(cs.cid);
        }
        if spec.support_get {
            if schema.num_key_column() != 1 {
                return Err(MvccError::NotSupported(format!(
                    "get on {} key columns",
                    schema.num_key_column()
                )));
            }
            cids.push(schema.key_columns()[0].cid);
        }

        // row count, columns and index must all come from one commit
        let snapshot = self.sub_tablet.snapshot(spec.version, &cids)?;
        let readers = (0..spec.columns.len())
            .map(|i| snapshot.read(i))
            .collect::<Result<Vec<_>>>()?;
        let (key_reader, index) = if spec.support_get {
            (
                Some(snapshot.read(spec.columns.len())?),
                Some(snapshot.index().clone()),
            )
        } else {
            (None, None)
        };

        Ok(MemTabletScan::new(
            schema,
            spec,
            snapshot.size(),
            readers,
            key_reader,
            index,
        ))
    }

    pub fn sub_tablet(&self) -> &MemSubTablet {
        &self.sub_tablet
    }

    pub fn memory_usage(&self) -> usize {
        self.sub_tablet.memory_usage()
    }
}

impl std::fmt::Debug for MemTablet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTablet")
            .field("dir", &self.dir)
            .field("latest_version", &self.latest_version())
            .finish()
    }
}
