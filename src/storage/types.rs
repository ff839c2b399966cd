//! Core data types for the timevault storage layer
//!
//! This module defines the fundamental types used throughout the storage layer:
//! - `SingleTimeSeries`: A regularly sampled array of numeric values
//! - `TimeSeriesMetadata`: The record binding a stored array to components
//! - `Normalization`: Optional transform applied to raw values
//! - `MetadataFilter`: Filter builder for metadata index queries

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::storage::error::{StoreError, StoreResult};

/// Type discriminator stored with every metadata row
pub const SINGLE_TIME_SERIES: &str = "single_time_series";

/// Transform applied to raw values when a series is constructed.
///
/// The descriptor travels with the metadata so readers can tell how the
/// stored values relate to the raw ones.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// Divide every value by the maximum absolute value
    Max,
    /// Divide every value by a fixed quantity
    ByValue(f64),
}

impl Normalization {
    /// Apply the transform in place
    pub fn apply(&self, values: &mut [f64]) {
        let divisor = match self {
            Normalization::Max => values.iter().fold(0.0_f64, |acc, v| acc.max(v.abs())),
            Normalization::ByValue(v) => *v,
        };
        if divisor != 0.0 {
            for v in values.iter_mut() {
                *v /= divisor;
            }
        }
    }
}

/// A regularly sampled time series array
///
/// The time axis is implicit: sample `i` falls at
/// `initial_time + i * resolution`. Identity is by `id`; two series with the
/// same `id` are the same physical array no matter how many metadata records
/// point at them.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleTimeSeries {
    /// Physical storage id, assigned by the allocator when first added
    pub id: Option<u64>,
    /// Name of the measured variable (e.g. "active_power")
    pub variable_name: String,
    /// Time between consecutive samples
    pub resolution: TimeDelta,
    /// Timestamp of the first sample
    pub initial_time: DateTime<Utc>,
    /// The sample values
    pub data: Vec<f64>,
    /// Optional unit tag carried opaquely with the values
    pub units: Option<String>,
    /// Transform that was applied to the raw values, if any
    pub normalization: Option<Normalization>,
}

impl SingleTimeSeries {
    /// Create a new series with required fields
    pub fn new(
        variable_name: impl Into<String>,
        initial_time: DateTime<Utc>,
        resolution: TimeDelta,
        data: Vec<f64>,
    ) -> Self {
        Self {
            id: None,
            variable_name: variable_name.into(),
            resolution,
            initial_time,
            data,
            units: None,
            normalization: None,
        }
    }

    /// Builder: tag the values with a unit
    pub fn units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    /// Builder: normalize the raw values and record the descriptor
    pub fn normalized(mut self, normalization: Normalization) -> Self {
        normalization.apply(&mut self.data);
        self.normalization = Some(normalization);
        self
    }

    /// Number of stored samples
    pub fn length(&self) -> u64 {
        self.data.len() as u64
    }

    /// Iterate the timestamp of every sample
    pub fn timestamps(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        let start = self.initial_time;
        let step_us = self.resolution.num_microseconds().unwrap_or(0);
        (0..self.data.len() as i64).map(move |i| start + TimeDelta::microseconds(step_us * i))
    }

    /// Short description for log lines
    pub fn summary(&self) -> String {
        format!(
            "SingleTimeSeries.{} ({} samples)",
            self.variable_name,
            self.data.len()
        )
    }
}

/// The record binding a stored array to an owning component
///
/// Multiple metadata records may reference the same `time_series_id`; the
/// physical array is stored once and deleted only when the last record is
/// removed.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesMetadata {
    /// Name of the measured variable
    pub variable_name: String,
    /// Type discriminator (`single_time_series`)
    pub time_series_type: String,
    /// Timestamp of the first stored sample
    pub initial_time: DateTime<Utc>,
    /// Time between consecutive samples
    pub resolution: TimeDelta,
    /// Number of stored samples
    pub length: u64,
    /// Physical storage id of the array
    pub time_series_id: u64,
    /// Optional unit tag
    pub units: Option<String>,
    /// Transform applied to the raw values, if any
    pub normalization: Option<Normalization>,
    /// User-supplied key/value pairs; values must be primitive JSON values
    pub user_attributes: BTreeMap<String, Value>,
}

impl TimeSeriesMetadata {
    /// Build the metadata record for a series
    ///
    /// The series must already have a physical id assigned; the manager
    /// assigns one before calling this.
    pub fn from_data(
        series: &SingleTimeSeries,
        user_attributes: BTreeMap<String, Value>,
    ) -> StoreResult<Self> {
        let time_series_id = series.id.ok_or_else(|| {
            StoreError::Consistency(format!("{} has no physical id assigned", series.summary()))
        })?;
        for (key, value) in &user_attributes {
            if !(value.is_null() || value.is_boolean() || value.is_number() || value.is_string()) {
                let msg = format!("user attribute `{key}` must be a primitive JSON value");
                return Err(StoreError::OperationNotAllowed(msg));
            }
        }
        Ok(Self {
            variable_name: series.variable_name.clone(),
            time_series_type: SINGLE_TIME_SERIES.to_string(),
            initial_time: series.initial_time,
            resolution: series.resolution,
            length: series.length(),
            time_series_id,
            units: series.units.clone(),
            normalization: series.normalization,
            user_attributes,
        })
    }

    /// Resolve a requested sub-range to a (start index, row count) pair
    ///
    /// Defaults to the full array. A `start_time` outside the stored axis or
    /// a `length` running past the stored samples is an error, never a
    /// silent truncation.
    pub fn get_range(
        &self,
        start_time: Option<DateTime<Utc>>,
        length: Option<u64>,
    ) -> StoreResult<(usize, usize)> {
        let resolution_us = self.resolution.num_microseconds().unwrap_or(0);
        if resolution_us <= 0 {
            let msg = format!("resolution must be positive: {:?}", self.resolution);
            return Err(StoreError::OperationNotAllowed(msg));
        }

        let index = match start_time {
            None => 0,
            Some(ts) => {
                if ts < self.initial_time {
                    let msg = format!(
                        "start_time {ts} is before the initial time {}",
                        self.initial_time
                    );
                    return Err(StoreError::OperationNotAllowed(msg));
                }
                let offset_us = (ts - self.initial_time).num_microseconds().ok_or_else(|| {
                    StoreError::OperationNotAllowed(format!("start_time {ts} is out of range"))
                })?;
                let index = (offset_us / resolution_us) as u64;
                if index >= self.length {
                    let msg = format!("start_time {ts} is past the last stored sample");
                    return Err(StoreError::OperationNotAllowed(msg));
                }
                index
            }
        };

        let required = length.unwrap_or(self.length - index);
        if index + required > self.length {
            let msg = format!(
                "requested {required} samples at offset {index} but only {} are stored",
                self.length
            );
            return Err(StoreError::OperationNotAllowed(msg));
        }
        Ok((index as usize, required as usize))
    }

    /// Timestamp of the sample at `index`
    pub fn time_at(&self, index: usize) -> DateTime<Utc> {
        let step_us = self.resolution.num_microseconds().unwrap_or(0);
        self.initial_time + TimeDelta::microseconds(step_us * index as i64)
    }

    /// Short description for log lines and error messages
    pub fn summary(&self) -> String {
        format!("{}.{}", self.time_series_type, self.variable_name)
    }
}

/// Filter for metadata index queries
///
/// An empty filter matches every metadata row attached to a component.
/// Attribute predicates match the stored attribute bag exactly; there is no
/// partial or fuzzy matching.
#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    /// Match a specific variable name
    pub variable_name: Option<String>,
    /// Match a specific type discriminator
    pub time_series_type: Option<String>,
    /// Match rows whose attribute bag equals these pairs exactly
    pub user_attributes: BTreeMap<String, Value>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: match a variable name
    pub fn variable_name(mut self, name: impl Into<String>) -> Self {
        self.variable_name = Some(name.into());
        self
    }

    /// Builder: match a type discriminator
    pub fn time_series_type(mut self, time_series_type: impl Into<String>) -> Self {
        self.time_series_type = Some(time_series_type.into());
        self
    }

    /// Builder: add an attribute to the exact-match bag
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.user_attributes.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hourly_series(n: usize) -> SingleTimeSeries {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let data: Vec<f64> = (0..n).map(|i| i as f64).collect();
        SingleTimeSeries::new("active_power", start, TimeDelta::hours(1), data)
    }

    #[test]
    fn test_series_creation() {
        let series = hourly_series(24).units("kW");
        assert_eq!(series.length(), 24);
        assert_eq!(series.units.as_deref(), Some("kW"));
        assert!(series.id.is_none());
        assert_eq!(series.summary(), "SingleTimeSeries.active_power (24 samples)");
    }

    #[test]
    fn test_timestamps() {
        let series = hourly_series(3);
        let stamps: Vec<_> = series.timestamps().collect();
        assert_eq!(stamps.len(), 3);
        assert_eq!(stamps[0], series.initial_time);
        assert_eq!(stamps[2], series.initial_time + TimeDelta::hours(2));
    }

    #[test]
    fn test_normalization_max() {
        let series = hourly_series(5).normalized(Normalization::Max);
        assert_eq!(series.data[4], 1.0);
        assert_eq!(series.data[2], 0.5);
        assert_eq!(series.normalization, Some(Normalization::Max));
    }

    #[test]
    fn test_normalization_by_value() {
        let series = hourly_series(3).normalized(Normalization::ByValue(2.0));
        assert_eq!(series.data, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_metadata_requires_id() {
        let series = hourly_series(4);
        let err = TimeSeriesMetadata::from_data(&series, BTreeMap::new()).unwrap_err();
        assert!(matches!(err, StoreError::Consistency(_)));
    }

    #[test]
    fn test_metadata_rejects_nested_attributes() {
        let mut series = hourly_series(4);
        series.id = Some(1);

        let mut attrs = BTreeMap::new();
        attrs.insert("scenario".to_string(), Value::from("high"));
        assert!(TimeSeriesMetadata::from_data(&series, attrs).is_ok());

        let mut attrs = BTreeMap::new();
        attrs.insert("nested".to_string(), serde_json::json!({"a": 1}));
        let err = TimeSeriesMetadata::from_data(&series, attrs).unwrap_err();
        assert!(matches!(err, StoreError::OperationNotAllowed(_)));
    }

    #[test]
    fn test_get_range_defaults() {
        let mut series = hourly_series(10);
        series.id = Some(1);
        let metadata = TimeSeriesMetadata::from_data(&series, BTreeMap::new()).unwrap();

        assert_eq!(metadata.get_range(None, None).unwrap(), (0, 10));
        assert_eq!(metadata.get_range(None, Some(4)).unwrap(), (0, 4));
    }

    #[test]
    fn test_get_range_with_start_time() {
        let mut series = hourly_series(10);
        series.id = Some(1);
        let metadata = TimeSeriesMetadata::from_data(&series, BTreeMap::new()).unwrap();

        let start = metadata.initial_time + TimeDelta::hours(3);
        assert_eq!(metadata.get_range(Some(start), None).unwrap(), (3, 7));
        assert_eq!(metadata.get_range(Some(start), Some(2)).unwrap(), (3, 2));
    }

    #[test]
    fn test_get_range_out_of_bounds() {
        let mut series = hourly_series(10);
        series.id = Some(1);
        let metadata = TimeSeriesMetadata::from_data(&series, BTreeMap::new()).unwrap();

        // Before the first sample
        let early = metadata.initial_time - TimeDelta::hours(1);
        assert!(matches!(
            metadata.get_range(Some(early), None),
            Err(StoreError::OperationNotAllowed(_))
        ));

        // Past the last sample
        let late = metadata.initial_time + TimeDelta::hours(10);
        assert!(matches!(
            metadata.get_range(Some(late), None),
            Err(StoreError::OperationNotAllowed(_))
        ));

        // Length running past the stored samples
        let start = metadata.initial_time + TimeDelta::hours(8);
        assert!(matches!(
            metadata.get_range(Some(start), Some(5)),
            Err(StoreError::OperationNotAllowed(_))
        ));
    }

    #[test]
    fn test_time_at() {
        let mut series = hourly_series(10);
        series.id = Some(1);
        let metadata = TimeSeriesMetadata::from_data(&series, BTreeMap::new()).unwrap();
        assert_eq!(metadata.time_at(0), metadata.initial_time);
        assert_eq!(
            metadata.time_at(5),
            metadata.initial_time + TimeDelta::hours(5)
        );
    }

    #[test]
    fn test_filter_builder() {
        let filter = MetadataFilter::new()
            .variable_name("active_power")
            .attribute("scenario", "high");

        assert_eq!(filter.variable_name.as_deref(), Some("active_power"));
        assert_eq!(
            filter.user_attributes.get("scenario"),
            Some(&Value::from("high"))
        );
    }
}
