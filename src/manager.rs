//! Time series manager
//!
//! Orchestrates the id allocator, the metadata index, and exactly one
//! physical storage backend. The manager is fixed in storage kind for its
//! lifetime; the only way to change backends is the serialize/deserialize
//! protocol, which constructs a brand-new manager from a snapshot
//! descriptor.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::component::Component;
use crate::config::StoreOptions;
use crate::id::IdAllocator;
use crate::index::{TimeSeriesMetadataStore, METADATA_DB_FILENAME};
use crate::storage::columnar::ColumnarStore;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::memory::InMemoryStore;
use crate::storage::sql::{SqlStore, SQLITE_ENGINE};
use crate::storage::types::{MetadataFilter, SingleTimeSeries, TimeSeriesMetadata};
use crate::storage::{StorageDescriptor, StorageKind, TimeSeriesStore};

/// Manages time series arrays for a system
pub struct TimeSeriesManager {
    allocator: IdAllocator,
    metadata_store: TimeSeriesMetadataStore,
    storage: Box<dyn TimeSeriesStore>,
    read_only: bool,
}

impl std::fmt::Debug for TimeSeriesManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeSeriesManager")
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl TimeSeriesManager {
    /// Construct a manager with the backend selected by the options
    pub fn new(options: &StoreOptions) -> StoreResult<Self> {
        let storage: Box<dyn TimeSeriesStore> = if options.in_memory {
            Box::new(InMemoryStore::new())
        } else if options.use_sql {
            Box::new(SqlStore::with_temp_file(
                options.directory.as_deref(),
                &options.engine_name,
            )?)
        } else {
            Box::new(ColumnarStore::with_temp_directory(
                options.directory.as_deref(),
            )?)
        };

        Ok(Self {
            allocator: IdAllocator::new(),
            metadata_store: TimeSeriesMetadataStore::new()?,
            storage,
            read_only: options.read_only,
        })
    }

    /// Store a time series array for one or more components
    ///
    /// Assigns a physical id if the series has none. The array is physically
    /// stored only when no metadata row references its id yet; the metadata
    /// rows are registered regardless, so several components can share one
    /// stored array.
    pub fn add(
        &mut self,
        series: &mut SingleTimeSeries,
        components: &[&dyn Component],
        user_attributes: BTreeMap<String, Value>,
    ) -> StoreResult<()> {
        self.handle_read_only()?;
        if components.is_empty() {
            return Err(StoreError::OperationNotAllowed(
                "add requires at least one component".to_string(),
            ));
        }

        if series.id.is_none() {
            series.id = Some(self.allocator.next_id());
        }
        let metadata = TimeSeriesMetadata::from_data(series, user_attributes)?;

        if !self.metadata_store.has_time_series(metadata.time_series_id)? {
            self.storage.add_time_series(&metadata, series)?;
        }
        self.metadata_store.add(&metadata, components)?;
        debug!(
            "added {} to {} components",
            series.summary(),
            components.len()
        );
        Ok(())
    }

    /// Return the single time series matching the filter
    pub fn get(
        &self,
        component: &dyn Component,
        filter: &MetadataFilter,
        start_time: Option<DateTime<Utc>>,
        length: Option<u64>,
    ) -> StoreResult<SingleTimeSeries> {
        let metadata = self.metadata_store.get_metadata(component, filter)?;
        self.get_by_metadata(&metadata, start_time, length)
    }

    /// Fetch an array directly from a metadata record
    pub fn get_by_metadata(
        &self,
        metadata: &TimeSeriesMetadata,
        start_time: Option<DateTime<Utc>>,
        length: Option<u64>,
    ) -> StoreResult<SingleTimeSeries> {
        self.storage.get_time_series(metadata, start_time, length)
    }

    /// Return true if the component has time series matching the filter
    pub fn has_time_series(
        &self,
        component: &dyn Component,
        filter: &MetadataFilter,
    ) -> StoreResult<bool> {
        self.metadata_store.has_time_series_metadata(component, filter)
    }

    /// Return all time series matching the filter
    pub fn list_time_series(
        &self,
        component: &dyn Component,
        filter: &MetadataFilter,
        start_time: Option<DateTime<Utc>>,
        length: Option<u64>,
    ) -> StoreResult<Vec<SingleTimeSeries>> {
        self.list_time_series_metadata(component, filter)?
            .iter()
            .map(|metadata| self.get_by_metadata(metadata, start_time, length))
            .collect()
    }

    /// Return all metadata matching the filter
    pub fn list_time_series_metadata(
        &self,
        component: &dyn Component,
        filter: &MetadataFilter,
    ) -> StoreResult<Vec<TimeSeriesMetadata>> {
        self.metadata_store.list_metadata(component, filter)
    }

    /// Remove all time series matching the filter from the components
    ///
    /// Deletes the matching metadata rows first, then physically deletes
    /// only the arrays left with zero metadata references. An array still
    /// referenced by surviving metadata is never deleted.
    pub fn remove(
        &mut self,
        components: &[&dyn Component],
        filter: &MetadataFilter,
    ) -> StoreResult<()> {
        self.handle_read_only()?;
        let touched = self.metadata_store.remove(components, filter)?;
        let missing = self.metadata_store.list_missing_time_series(&touched)?;
        for time_series_id in missing {
            self.storage.remove_time_series(time_series_id)?;
            info!("removed time series {}", time_series_id);
        }
        Ok(())
    }

    /// Snapshot the storage and the metadata index into `dst`
    ///
    /// The backend fills the descriptor; an in-memory backend transcodes its
    /// arrays to the columnar format first, because heap state has no
    /// durable representation of its own.
    pub fn serialize(
        &self,
        descriptor: &mut StorageDescriptor,
        dst: &Path,
        src: Option<&Path>,
    ) -> StoreResult<()> {
        fs::create_dir_all(dst)?;
        self.storage.serialize(descriptor, dst, src)?;
        self.metadata_store
            .backup_to(&dst.join(METADATA_DB_FILENAME))?;
        info!("serialized time series storage to {}", dst.display());
        Ok(())
    }

    /// Reconstruct a manager from a snapshot descriptor
    ///
    /// `parent_dir` is the directory the descriptor's relative paths are
    /// resolved against. Writable modes copy the snapshot into fresh private
    /// temp media first; read-only modes open it in place.
    pub fn deserialize(
        descriptor: &StorageDescriptor,
        parent_dir: &Path,
        options: &StoreOptions,
    ) -> StoreResult<Self> {
        if options.in_memory {
            return Err(StoreError::OperationNotAllowed(
                "deserialization does not support in-memory storage".to_string(),
            ));
        }

        let time_series_dir = parent_dir.join(&descriptor.directory);
        let storage: Box<dyn TimeSeriesStore> = match descriptor.kind()? {
            StorageKind::Sql => {
                let filename = descriptor.filename.as_ref().ok_or_else(|| {
                    StoreError::Serialization(
                        "descriptor is missing the database filename".to_string(),
                    )
                })?;
                let engine_name = descriptor.engine_name.as_deref().unwrap_or(SQLITE_ENGINE);
                let db_file = time_series_dir.join(filename);
                if options.read_only {
                    Box::new(SqlStore::from_file(&db_file, engine_name)?)
                } else {
                    Box::new(SqlStore::from_file_to_temp_file(
                        &db_file,
                        Some(&time_series_dir),
                        engine_name,
                    )?)
                }
            }
            StorageKind::Columnar => {
                if options.read_only {
                    Box::new(ColumnarStore::with_permanent_directory(&time_series_dir)?)
                } else {
                    Box::new(ColumnarStore::from_directory_to_temp(
                        &time_series_dir,
                        None,
                    )?)
                }
            }
            StorageKind::InMemory => {
                return Err(StoreError::OperationNotAllowed(
                    "in-memory state cannot be reconstructed from a snapshot descriptor"
                        .to_string(),
                ));
            }
        };

        let metadata_path = time_series_dir.join(METADATA_DB_FILENAME);
        let metadata_store = if metadata_path.exists() {
            TimeSeriesMetadataStore::from_backup_file(&metadata_path)?
        } else {
            TimeSeriesMetadataStore::new()?
        };

        // Never reissue an id that is live in the restored index
        let allocator = match metadata_store.max_time_series_id()? {
            Some(max) => IdAllocator::starting_at(max + 1),
            None => IdAllocator::new(),
        };

        Ok(Self {
            allocator,
            metadata_store,
            storage,
            read_only: options.read_only,
        })
    }

    /// Storage kind of the active backend
    pub fn storage_kind(&self) -> StorageKind {
        self.storage.kind()
    }

    /// Containing directory of the physical medium; `None` for in-memory
    pub fn directory(&self) -> Option<&Path> {
        self.storage.directory()
    }

    /// Embedded engine tag; `None` unless the backend is SQL
    pub fn engine_name(&self) -> Option<&str> {
        self.storage.engine_name()
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Direct access to the metadata index
    pub fn metadata_store(&self) -> &TimeSeriesMetadataStore {
        &self.metadata_store
    }

    fn handle_read_only(&self) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::OperationNotAllowed(
                "cannot modify time series in read-only mode".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use tempfile::tempdir;

    struct Generator {
        id: Option<u64>,
        name: String,
    }

    impl Component for Generator {
        fn id(&self) -> Option<u64> {
            self.id
        }

        fn component_type(&self) -> &'static str {
            "Generator"
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    fn generator(id: u64) -> Generator {
        Generator {
            id: Some(id),
            name: format!("gen{id}"),
        }
    }

    fn hourly_series(variable_name: &str, n: usize) -> SingleTimeSeries {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let data: Vec<f64> = (0..n).map(|i| i as f64 * 0.25).collect();
        SingleTimeSeries::new(variable_name, start, TimeDelta::hours(1), data)
    }

    fn all_backend_options() -> Vec<StoreOptions> {
        vec![
            StoreOptions::default(),
            StoreOptions {
                in_memory: true,
                ..Default::default()
            },
            StoreOptions {
                use_sql: true,
                ..Default::default()
            },
        ]
    }

    #[test]
    fn test_add_assigns_id_and_round_trips() {
        for options in all_backend_options() {
            let mut manager = TimeSeriesManager::new(&options).unwrap();
            let gen = generator(1);
            let mut series = hourly_series("active_power", 24);

            manager.add(&mut series, &[&gen], BTreeMap::new()).unwrap();
            assert!(series.id.is_some());

            let filter = MetadataFilter::new().variable_name("active_power");
            assert!(manager.has_time_series(&gen, &filter).unwrap());

            let fetched = manager.get(&gen, &filter, None, None).unwrap();
            assert_eq!(fetched.data, series.data);
        }
    }

    #[test]
    fn test_add_requires_components() {
        let mut manager = TimeSeriesManager::new(&StoreOptions::default()).unwrap();
        let mut series = hourly_series("active_power", 4);
        let err = manager.add(&mut series, &[], BTreeMap::new()).unwrap_err();
        assert!(matches!(err, StoreError::OperationNotAllowed(_)));
    }

    #[test]
    fn test_idempotent_physical_add() {
        let mut manager = TimeSeriesManager::new(&StoreOptions::default()).unwrap();
        let gen1 = generator(1);
        let gen2 = generator(2);
        let mut series = hourly_series("active_power", 24);

        // Two metadata records, one physical array
        manager.add(&mut series, &[&gen1], BTreeMap::new()).unwrap();
        manager.add(&mut series, &[&gen2], BTreeMap::new()).unwrap();

        let filter = MetadataFilter::new().variable_name("active_power");
        let from_gen1 = manager.get(&gen1, &filter, None, None).unwrap();
        let from_gen2 = manager.get(&gen2, &filter, None, None).unwrap();

        assert_eq!(from_gen1.id, from_gen2.id);
        assert_eq!(from_gen1.data, from_gen2.data);
    }

    #[test]
    fn test_range_contract_all_backends() {
        for options in all_backend_options() {
            let mut manager = TimeSeriesManager::new(&options).unwrap();
            let gen = generator(1);
            let mut series = hourly_series("active_power", 12);
            manager.add(&mut series, &[&gen], BTreeMap::new()).unwrap();

            let filter = MetadataFilter::new().variable_name("active_power");

            for n in 1..=12u64 {
                let fetched = manager.get(&gen, &filter, None, Some(n)).unwrap();
                assert_eq!(fetched.data, &series.data[..n as usize]);
            }

            let start = series.initial_time + TimeDelta::hours(2);
            for n in 1..=10u64 {
                let fetched = manager.get(&gen, &filter, Some(start), Some(n)).unwrap();
                assert_eq!(fetched.data, &series.data[2..2 + n as usize]);
                assert_eq!(fetched.initial_time, start);
            }

            // A length past the stored samples is an error, not a truncation
            let err = manager
                .get(&gen, &filter, Some(start), Some(11))
                .unwrap_err();
            assert!(matches!(err, StoreError::OperationNotAllowed(_)));
        }
    }

    #[test]
    fn test_ambiguous_query_rejected() {
        let mut manager = TimeSeriesManager::new(&StoreOptions::default()).unwrap();
        let gen = generator(1);
        let mut s1 = hourly_series("active_power", 8);
        let mut s2 = hourly_series("reactive_power", 8);
        manager.add(&mut s1, &[&gen], BTreeMap::new()).unwrap();
        manager.add(&mut s2, &[&gen], BTreeMap::new()).unwrap();

        let err = manager
            .get(&gen, &MetadataFilter::new(), None, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::OperationNotAllowed(_)));
    }

    #[test]
    fn test_reference_counted_deletion() {
        for options in all_backend_options() {
            let mut manager = TimeSeriesManager::new(&options).unwrap();
            let gen1 = generator(1);
            let gen2 = generator(2);
            let mut series = hourly_series("active_power", 24);

            manager.add(&mut series, &[&gen1, &gen2], BTreeMap::new()).unwrap();
            let filter = MetadataFilter::new().variable_name("active_power");

            // Removing one reference must keep the physical array
            manager.remove(&[&gen1], &filter).unwrap();
            assert!(manager.get(&gen2, &filter, None, None).is_ok());

            // Removing the last reference deletes it
            manager.remove(&[&gen2], &filter).unwrap();
            assert!(matches!(
                manager.get(&gen2, &filter, None, None),
                Err(StoreError::NotStored(_))
            ));
        }
    }

    #[test]
    fn test_remove_unmatched_is_not_stored() {
        let mut manager = TimeSeriesManager::new(&StoreOptions::default()).unwrap();
        let gen = generator(1);
        let err = manager
            .remove(&[&gen], &MetadataFilter::new())
            .unwrap_err();
        assert!(matches!(err, StoreError::NotStored(_)));
    }

    #[test]
    fn test_list_time_series() {
        let mut manager = TimeSeriesManager::new(&StoreOptions::default()).unwrap();
        let gen = generator(1);
        let mut s1 = hourly_series("active_power", 8);
        let mut s2 = hourly_series("reactive_power", 8);
        manager.add(&mut s1, &[&gen], BTreeMap::new()).unwrap();
        manager.add(&mut s2, &[&gen], BTreeMap::new()).unwrap();

        let all = manager
            .list_time_series(&gen, &MetadataFilter::new(), None, None)
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].variable_name, "active_power");
        assert_eq!(all[1].variable_name, "reactive_power");
    }

    #[test]
    fn test_attribute_disambiguation() {
        let mut manager = TimeSeriesManager::new(&StoreOptions::default()).unwrap();
        let gen = generator(1);

        let mut high = hourly_series("active_power", 8);
        let mut attrs = BTreeMap::new();
        attrs.insert("scenario".to_string(), Value::from("high"));
        manager.add(&mut high, &[&gen], attrs).unwrap();

        let mut low = hourly_series("active_power", 8);
        let mut attrs = BTreeMap::new();
        attrs.insert("scenario".to_string(), Value::from("low"));
        manager.add(&mut low, &[&gen], attrs).unwrap();

        let filter = MetadataFilter::new()
            .variable_name("active_power")
            .attribute("scenario", "high");
        let fetched = manager.get(&gen, &filter, None, None).unwrap();
        assert_eq!(fetched.id, high.id);
    }

    #[test]
    fn test_read_only_enforcement() {
        let options = StoreOptions {
            read_only: true,
            ..Default::default()
        };
        let mut manager = TimeSeriesManager::new(&options).unwrap();
        let gen = generator(1);
        let mut series = hourly_series("active_power", 4);

        let err = manager
            .add(&mut series, &[&gen], BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, StoreError::OperationNotAllowed(_)));

        let err = manager.remove(&[&gen], &MetadataFilter::new()).unwrap_err();
        assert!(matches!(err, StoreError::OperationNotAllowed(_)));

        // Nothing was registered
        assert!(!manager
            .has_time_series(&gen, &MetadataFilter::new())
            .unwrap());
    }

    #[test]
    fn test_backend_selection() {
        let manager = TimeSeriesManager::new(&StoreOptions::default()).unwrap();
        assert_eq!(manager.storage_kind(), StorageKind::Columnar);
        assert!(manager.directory().is_some());
        assert!(manager.engine_name().is_none());

        let manager = TimeSeriesManager::new(&StoreOptions {
            in_memory: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(manager.storage_kind(), StorageKind::InMemory);
        assert!(manager.directory().is_none());

        let manager = TimeSeriesManager::new(&StoreOptions {
            use_sql: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(manager.storage_kind(), StorageKind::Sql);
        assert_eq!(manager.engine_name(), Some(SQLITE_ENGINE));
    }

    fn snapshot_manager(options: &StoreOptions) -> (tempfile::TempDir, StorageDescriptor, Vec<f64>) {
        let mut manager = TimeSeriesManager::new(options).unwrap();
        let gen = generator(1);
        let mut series = hourly_series("active_power", 48);
        manager.add(&mut series, &[&gen], BTreeMap::new()).unwrap();

        let parent = tempdir().unwrap();
        let mut descriptor = StorageDescriptor::new("time_series");
        manager
            .serialize(&mut descriptor, &parent.path().join("time_series"), None)
            .unwrap();
        (parent, descriptor, series.data)
    }

    #[test]
    fn test_migration_round_trip_sql() {
        let options = StoreOptions {
            use_sql: true,
            ..Default::default()
        };
        let (parent, descriptor, data) = snapshot_manager(&options);
        assert_eq!(descriptor.kind().unwrap(), StorageKind::Sql);

        let gen = generator(1);
        let filter = MetadataFilter::new().variable_name("active_power");

        let read_only = StoreOptions {
            read_only: true,
            ..Default::default()
        };
        let restored =
            TimeSeriesManager::deserialize(&descriptor, parent.path(), &read_only).unwrap();
        assert!(restored.read_only());
        assert_eq!(restored.storage_kind(), StorageKind::Sql);

        let fetched = restored.get(&gen, &filter, None, None).unwrap();
        assert_eq!(fetched.data, data);

        // Sub-ranges survive migration too
        let start = fetched.initial_time + TimeDelta::hours(10);
        let window = restored.get(&gen, &filter, Some(start), Some(5)).unwrap();
        assert_eq!(window.data, &data[10..15]);
    }

    #[test]
    fn test_migration_round_trip_columnar() {
        let (parent, descriptor, data) = snapshot_manager(&StoreOptions::default());
        assert_eq!(descriptor.kind().unwrap(), StorageKind::Columnar);

        let gen = generator(1);
        let filter = MetadataFilter::new().variable_name("active_power");

        let read_only = StoreOptions {
            read_only: true,
            ..Default::default()
        };
        let restored =
            TimeSeriesManager::deserialize(&descriptor, parent.path(), &read_only).unwrap();
        let fetched = restored.get(&gen, &filter, None, None).unwrap();
        assert_eq!(fetched.data, data);
    }

    #[test]
    fn test_migration_from_in_memory_downgrades() {
        let options = StoreOptions {
            in_memory: true,
            ..Default::default()
        };
        let (parent, descriptor, data) = snapshot_manager(&options);

        // Heap state has no durable form; the snapshot is columnar
        assert_eq!(descriptor.kind().unwrap(), StorageKind::Columnar);

        let gen = generator(1);
        let filter = MetadataFilter::new().variable_name("active_power");
        let restored = TimeSeriesManager::deserialize(
            &descriptor,
            parent.path(),
            &StoreOptions::default(),
        )
        .unwrap();
        let fetched = restored.get(&gen, &filter, None, None).unwrap();
        assert_eq!(fetched.data, data);
    }

    #[test]
    fn test_writable_restore_is_isolated() {
        let options = StoreOptions {
            use_sql: true,
            ..Default::default()
        };
        let (parent, descriptor, data) = snapshot_manager(&options);

        let gen = generator(1);
        let filter = MetadataFilter::new().variable_name("active_power");

        // Mutate a writable restore
        let mut writable = TimeSeriesManager::deserialize(
            &descriptor,
            parent.path(),
            &StoreOptions::default(),
        )
        .unwrap();
        writable.remove(&[&gen], &filter).unwrap();
        assert!(matches!(
            writable.get(&gen, &filter, None, None),
            Err(StoreError::NotStored(_))
        ));

        // The snapshot still holds everything
        let read_only = StoreOptions {
            read_only: true,
            ..Default::default()
        };
        let pristine =
            TimeSeriesManager::deserialize(&descriptor, parent.path(), &read_only).unwrap();
        let fetched = pristine.get(&gen, &filter, None, None).unwrap();
        assert_eq!(fetched.data, data);
    }

    #[test]
    fn test_restored_allocator_skips_live_ids() {
        let (parent, descriptor, _) = snapshot_manager(&StoreOptions::default());

        let mut restored = TimeSeriesManager::deserialize(
            &descriptor,
            parent.path(),
            &StoreOptions::default(),
        )
        .unwrap();

        let gen = generator(2);
        let mut series = hourly_series("reactive_power", 8);
        restored.add(&mut series, &[&gen], BTreeMap::new()).unwrap();

        let max = restored.metadata_store().max_time_series_id().unwrap();
        assert_eq!(series.id, max);
        assert!(series.id.unwrap() > 1);
    }

    #[test]
    fn test_deserialize_rejects_in_memory_mode() {
        let (parent, descriptor, _) = snapshot_manager(&StoreOptions::default());

        let options = StoreOptions {
            in_memory: true,
            ..Default::default()
        };
        let err =
            TimeSeriesManager::deserialize(&descriptor, parent.path(), &options).unwrap_err();
        assert!(matches!(err, StoreError::OperationNotAllowed(_)));
    }

    #[test]
    fn test_deserialize_rejects_in_memory_tag() {
        let mut descriptor = StorageDescriptor::new("time_series");
        descriptor.storage_kind = StorageKind::InMemory.as_str().to_string();

        let parent = tempdir().unwrap();
        let err = TimeSeriesManager::deserialize(
            &descriptor,
            parent.path(),
            &StoreOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::OperationNotAllowed(_)));
    }

    #[test]
    fn test_deserialize_unknown_tag_is_unimplemented() {
        let mut descriptor = StorageDescriptor::new("time_series");
        descriptor.storage_kind = "parquet".to_string();

        let parent = tempdir().unwrap();
        let err = TimeSeriesManager::deserialize(
            &descriptor,
            parent.path(),
            &StoreOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Unimplemented(_)));
    }
}
