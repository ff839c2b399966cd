//! Timevault storage backends
//!
//! This module provides the physical storage layer for time series arrays:
//!
//! - **types**: Core data structures (SingleTimeSeries, TimeSeriesMetadata)
//! - **memory**: Heap-map backend
//! - **segment**: Columnar segment file format
//! - **columnar**: Directory-of-segments backend
//! - **sql**: Embedded-SQL backend
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   SingleTimeSeries → TimeSeriesStore::add_time_series → physical medium
//!
//! Read Path:
//!   TimeSeriesMetadata → resolve sub-range → fetch only covering rows
//! ```
//!
//! All three backends satisfy one contract, [`TimeSeriesStore`]; the manager
//! holds exactly one of them behind the trait and never inspects the concrete
//! type. The only place a storage kind is branched on is deserialization,
//! where the descriptor tag is the legitimate dispatch key.

pub mod columnar;
pub mod error;
pub mod memory;
pub mod segment;
pub mod sql;
pub mod types;

// Re-export commonly used types
pub use columnar::ColumnarStore;
pub use error::{StoreError, StoreResult};
pub use memory::InMemoryStore;
pub use segment::{Segment, SegmentHeader, DEFAULT_BLOCK_LEN, SEGMENT_EXTENSION};
pub use sql::{SqlStore, SQLITE_ENGINE};
pub use types::{
    MetadataFilter, Normalization, SingleTimeSeries, TimeSeriesMetadata, SINGLE_TIME_SERIES,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Physical storage kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// Heap map, lost at process exit
    InMemory,
    /// One columnar segment file per array under a managed directory
    Columnar,
    /// Single embedded-SQL database file
    Sql,
}

impl StorageKind {
    /// Discriminator tag recorded in descriptors
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::InMemory => "in_memory",
            StorageKind::Columnar => "columnar",
            StorageKind::Sql => "sql",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_memory" => Ok(StorageKind::InMemory),
            "columnar" => Ok(StorageKind::Columnar),
            "sql" => Ok(StorageKind::Sql),
            other => Err(StoreError::Unimplemented(format!(
                "storage kind `{other}`"
            ))),
        }
    }
}

/// Record written during serialization, sufficient to reconstruct a backend
///
/// `directory` is relative to a parent directory the caller declares at
/// deserialization time; `filename` is relative to `directory`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageDescriptor {
    /// Storage kind discriminator tag
    pub storage_kind: String,
    /// Snapshot directory, relative to the declared parent
    pub directory: PathBuf,
    /// Database file for SQL snapshots, relative to `directory`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<PathBuf>,
    /// Embedded engine tag for SQL snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_name: Option<String>,
}

impl StorageDescriptor {
    /// Create a descriptor for a snapshot under `directory`
    ///
    /// The backend fills the remaining fields during serialization.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            storage_kind: String::new(),
            directory: directory.into(),
            filename: None,
            engine_name: None,
        }
    }

    /// Parse the storage kind tag; an unknown tag is an error, never a fallback
    pub fn kind(&self) -> StoreResult<StorageKind> {
        self.storage_kind.parse()
    }
}

/// The storage backend contract
///
/// Implementations own their physical medium and its lifecycle. The manager
/// owns exactly one implementation at a time; backends are swapped only
/// through the serialize/deserialize protocol.
pub trait TimeSeriesStore {
    /// Storage kind tag, fixed at construction
    fn kind(&self) -> StorageKind;

    /// Containing directory of the physical medium; `None` for in-memory
    fn directory(&self) -> Option<&Path>;

    /// Embedded engine tag; `None` for non-SQL backends
    fn engine_name(&self) -> Option<&str> {
        None
    }

    /// Store an array. Idempotent per physical id: a second add for an id
    /// that is already stored is a silent no-op, because multiple metadata
    /// records may point at one physical array.
    fn add_time_series(
        &mut self,
        metadata: &TimeSeriesMetadata,
        series: &SingleTimeSeries,
    ) -> StoreResult<()>;

    /// Fetch the full array, or exactly the requested sub-range
    fn get_time_series(
        &self,
        metadata: &TimeSeriesMetadata,
        start_time: Option<DateTime<Utc>>,
        length: Option<u64>,
    ) -> StoreResult<SingleTimeSeries>;

    /// Delete the physical array
    fn remove_time_series(&mut self, time_series_id: u64) -> StoreResult<()>;

    /// Snapshot the physical medium into `dst` and record the descriptor
    /// fields needed to reconstruct it. Copy/backup semantics: the live
    /// store is never mutated. When `src` is given, its contents are
    /// snapshotted instead of the live medium.
    fn serialize(
        &self,
        descriptor: &mut StorageDescriptor,
        dst: &Path,
        src: Option<&Path>,
    ) -> StoreResult<()>;
}
