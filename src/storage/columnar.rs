//! Columnar file-based time series storage
//!
//! One immutable segment file per physical id under a managed directory.
//! Writable stores own a temporary directory that is deleted when the store
//! is dropped; read-only stores open a permanent directory in place.
//! Sub-range reads decode only the blocks covering the request.

use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

use crate::storage::error::{StoreError, StoreResult};
use crate::storage::segment::{Segment, SEGMENT_EXTENSION};
use crate::storage::types::{SingleTimeSeries, TimeSeriesMetadata};
use crate::storage::{StorageDescriptor, StorageKind, TimeSeriesStore};

/// The managed directory behind a columnar store
#[derive(Debug)]
enum StoreDirectory {
    /// Owned temporary directory, deleted on drop
    Temp(TempDir),
    /// Caller-provided directory, left in place
    Permanent(PathBuf),
}

impl StoreDirectory {
    fn path(&self) -> &Path {
        match self {
            StoreDirectory::Temp(dir) => dir.path(),
            StoreDirectory::Permanent(path) => path,
        }
    }
}

/// Stores time series as columnar segment files on disk
#[derive(Debug)]
pub struct ColumnarStore {
    directory: StoreDirectory,
}

impl ColumnarStore {
    /// Create a writable store on a fresh temporary directory
    ///
    /// The directory is created under `base` when given, otherwise under the
    /// system temp dir, and removed when the store is dropped.
    pub fn with_temp_directory(base: Option<&Path>) -> StoreResult<Self> {
        let dir = match base {
            Some(base) => {
                fs::create_dir_all(base)?;
                tempfile::Builder::new()
                    .prefix("timevault-")
                    .tempdir_in(base)?
            }
            None => tempfile::Builder::new().prefix("timevault-").tempdir()?,
        };
        debug!("created columnar store at {}", dir.path().display());
        Ok(Self {
            directory: StoreDirectory::Temp(dir),
        })
    }

    /// Open a store on a permanent directory
    ///
    /// Used as the target of snapshots and for read-only deserialization;
    /// nothing is deleted on drop.
    pub fn with_permanent_directory(directory: impl Into<PathBuf>) -> StoreResult<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        Ok(Self {
            directory: StoreDirectory::Permanent(directory),
        })
    }

    /// Create a writable store populated from an existing snapshot directory
    pub fn from_directory_to_temp(src: &Path, base: Option<&Path>) -> StoreResult<Self> {
        let store = Self::with_temp_directory(base)?;
        let copied = copy_segment_files(src, store.directory.path())?;
        debug!(
            "copied {} segment files from {} to {}",
            copied,
            src.display(),
            store.directory.path().display()
        );
        Ok(store)
    }

    fn segment_path(&self, time_series_id: u64) -> PathBuf {
        self.directory
            .path()
            .join(format!("{time_series_id}.{SEGMENT_EXTENSION}"))
    }
}

/// Copy every segment file from `src` into `dst`, returning the count
fn copy_segment_files(src: &Path, dst: &Path) -> StoreResult<usize> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;
    for entry in fs::read_dir(src)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some(SEGMENT_EXTENSION) {
            if let Some(file_name) = path.file_name() {
                fs::copy(&path, dst.join(file_name))?;
                copied += 1;
            }
        }
    }
    Ok(copied)
}

impl TimeSeriesStore for ColumnarStore {
    fn kind(&self) -> StorageKind {
        StorageKind::Columnar
    }

    fn directory(&self) -> Option<&Path> {
        Some(self.directory.path())
    }

    fn add_time_series(
        &mut self,
        metadata: &TimeSeriesMetadata,
        series: &SingleTimeSeries,
    ) -> StoreResult<()> {
        let path = self.segment_path(metadata.time_series_id);
        if path.exists() {
            debug!("{} was already stored", series.summary());
            return Ok(());
        }
        Segment::write(&path, series)?;
        debug!("added {} to {}", series.summary(), path.display());
        Ok(())
    }

    fn get_time_series(
        &self,
        metadata: &TimeSeriesMetadata,
        start_time: Option<DateTime<Utc>>,
        length: Option<u64>,
    ) -> StoreResult<SingleTimeSeries> {
        let path = self.segment_path(metadata.time_series_id);
        if !path.exists() {
            return Err(StoreError::NotStored(format!(
                "no time series with id {} is stored",
                metadata.time_series_id
            )));
        }

        let (index, required) = metadata.get_range(start_time, length)?;
        let segment = Segment::open(&path)?;
        let data = segment.read_rows(index, required)?;

        Ok(SingleTimeSeries {
            id: Some(metadata.time_series_id),
            variable_name: metadata.variable_name.clone(),
            resolution: metadata.resolution,
            initial_time: metadata.time_at(index),
            data,
            units: metadata.units.clone(),
            normalization: metadata.normalization,
        })
    }

    fn remove_time_series(&mut self, time_series_id: u64) -> StoreResult<()> {
        let path = self.segment_path(time_series_id);
        if !path.exists() {
            return Err(StoreError::NotStored(format!(
                "no time series with id {time_series_id} is stored"
            )));
        }
        fs::remove_file(&path)?;
        Ok(())
    }

    fn serialize(
        &self,
        descriptor: &mut StorageDescriptor,
        dst: &Path,
        src: Option<&Path>,
    ) -> StoreResult<()> {
        let src_dir = src.unwrap_or_else(|| self.directory.path());
        let copied = copy_segment_files(src_dir, dst)?;
        descriptor.storage_kind = StorageKind::Columnar.as_str().to_string();
        info!(
            "snapshotted {} segment files to {}",
            copied,
            dst.display()
        );
        Ok(())
    }
}
