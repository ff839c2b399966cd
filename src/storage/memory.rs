//! In-memory time series storage
//!
//! Arrays live in a heap map keyed by physical id. Range reads slice the
//! stored vector directly. In-memory state cannot outlive the process, so
//! serialization transcodes every held array into the columnar file format.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::storage::columnar::ColumnarStore;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::types::{SingleTimeSeries, TimeSeriesMetadata};
use crate::storage::{StorageDescriptor, StorageKind, TimeSeriesStore};

/// Stores time series in memory
#[derive(Debug, Default)]
pub struct InMemoryStore {
    /// Keyed by physical time series id, not metadata row id
    arrays: HashMap<u64, SingleTimeSeries>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of held arrays
    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }
}

impl TimeSeriesStore for InMemoryStore {
    fn kind(&self) -> StorageKind {
        StorageKind::InMemory
    }

    fn directory(&self) -> Option<&Path> {
        None
    }

    fn add_time_series(
        &mut self,
        metadata: &TimeSeriesMetadata,
        series: &SingleTimeSeries,
    ) -> StoreResult<()> {
        if self.arrays.contains_key(&metadata.time_series_id) {
            debug!("{} was already stored", series.summary());
        } else {
            self.arrays.insert(metadata.time_series_id, series.clone());
            debug!("added {} to store", series.summary());
        }
        Ok(())
    }

    fn get_time_series(
        &self,
        metadata: &TimeSeriesMetadata,
        start_time: Option<DateTime<Utc>>,
        length: Option<u64>,
    ) -> StoreResult<SingleTimeSeries> {
        let base = self.arrays.get(&metadata.time_series_id).ok_or_else(|| {
            StoreError::NotStored(format!(
                "no time series with id {} is stored",
                metadata.time_series_id
            ))
        })?;

        if start_time.is_none() && length.is_none() {
            return Ok(base.clone());
        }

        let (index, required) = metadata.get_range(start_time, length)?;
        if index + required > base.data.len() {
            return Err(StoreError::Consistency(format!(
                "metadata for time series {} declares {} samples but {} are stored",
                metadata.time_series_id,
                metadata.length,
                base.data.len()
            )));
        }

        Ok(SingleTimeSeries {
            id: Some(metadata.time_series_id),
            variable_name: base.variable_name.clone(),
            resolution: base.resolution,
            initial_time: metadata.time_at(index),
            data: base.data[index..index + required].to_vec(),
            units: base.units.clone(),
            normalization: metadata.normalization,
        })
    }

    fn remove_time_series(&mut self, time_series_id: u64) -> StoreResult<()> {
        self.arrays.remove(&time_series_id).ok_or_else(|| {
            StoreError::NotStored(format!(
                "no time series with id {time_series_id} is stored"
            ))
        })?;
        Ok(())
    }

    fn serialize(
        &self,
        descriptor: &mut StorageDescriptor,
        dst: &Path,
        _src: Option<&Path>,
    ) -> StoreResult<()> {
        let mut store = ColumnarStore::with_permanent_directory(dst)?;
        for series in self.arrays.values() {
            let metadata = TimeSeriesMetadata::from_data(series, Default::default())?;
            store.add_time_series(&metadata, series)?;
        }
        descriptor.storage_kind = StorageKind::Columnar.as_str().to_string();
        debug!(
            "transcoded {} in-memory arrays to columnar files in {}",
            self.arrays.len(),
            dst.display()
        );
        Ok(())
    }
}
