//! Time series metadata index
//!
//! A relational table binding stored arrays to their owning components plus
//! user attributes. One row per (component, attributes) attachment; many rows
//! may reference the same physical array. The store runs on an owned
//! in-memory SQLite connection and is snapshotted/restored through the
//! engine's backup primitive when a manager is serialized.
//!
//! Attribute predicates match the stored bag exactly: bags are serialized as
//! canonical JSON (BTreeMap ordering), so equality is textual.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::debug;

use crate::component::Component;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::sql::run_backup;
use crate::storage::types::{MetadataFilter, TimeSeriesMetadata, SINGLE_TIME_SERIES};
use chrono::{DateTime, TimeDelta, Utc};

const TABLE_NAME: &str = "time_series_metadata";

/// File name of the metadata snapshot inside a serialization directory
pub const METADATA_DB_FILENAME: &str = "time_series_metadata.db";

/// Relational index of time series metadata
pub struct TimeSeriesMetadataStore {
    conn: Connection,
}

impl TimeSeriesMetadataStore {
    /// Create an empty store on a fresh in-memory database
    pub fn new() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        create_table(&conn)?;
        debug!("created in-memory time series metadata table");
        Ok(Self { conn })
    }

    /// Restore a store from a snapshot file
    pub fn from_backup_file(path: &Path) -> StoreResult<Self> {
        let src = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let mut conn = Connection::open_in_memory()?;
        run_backup(&src, &mut conn)?;
        debug!("restored time series metadata from {}", path.display());
        Ok(Self { conn })
    }

    /// Snapshot the store into a database file
    pub fn backup_to(&self, path: &Path) -> StoreResult<()> {
        let mut dst = Connection::open(path)?;
        run_backup(&self.conn, &mut dst)?;
        Ok(())
    }

    /// Insert one row per component the series is attached to
    ///
    /// A component that already has a row with the same variable name, type,
    /// and attribute bag rejects the attachment.
    pub fn add(
        &mut self,
        metadata: &TimeSeriesMetadata,
        components: &[&dyn Component],
    ) -> StoreResult<()> {
        let attributes = canonical_attributes(metadata)?;
        let normalization = metadata
            .normalization
            .map(|n| serde_json::to_string(&n))
            .transpose()?;

        let mut keys = Vec::with_capacity(components.len());
        for component in components {
            let (component_id, component_type) = component_key(*component)?;
            if self.is_attached(component_id, component_type, metadata, &attributes)? {
                let msg = format!(
                    "{} is already attached to {}",
                    metadata.summary(),
                    component.label()
                );
                return Err(StoreError::OperationNotAllowed(msg));
            }
            keys.push((component_id, component_type));
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT INTO {TABLE_NAME} (
                    time_series_id, time_series_type, variable_name,
                    initial_time, resolution_us, length, units,
                    normalization, user_attributes, component_id, component_type
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))?;
            for (component_id, component_type) in &keys {
                stmt.execute(params![
                    metadata.time_series_id as i64,
                    metadata.time_series_type,
                    metadata.variable_name,
                    metadata.initial_time.to_rfc3339(),
                    metadata.resolution.num_microseconds().unwrap_or(0),
                    metadata.length as i64,
                    metadata.units,
                    normalization,
                    attributes,
                    component_id,
                    component_type,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Return true if any row references this physical id
    pub fn has_time_series(&self, time_series_id: u64) -> StoreResult<bool> {
        let exists: bool = self.conn.query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {TABLE_NAME} WHERE time_series_id = ?)"),
            params![time_series_id as i64],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Return true if the component has metadata matching the filter
    pub fn has_time_series_metadata(
        &self,
        component: &dyn Component,
        filter: &MetadataFilter,
    ) -> StoreResult<bool> {
        let (where_clause, query_params) = filter_clause(component, filter)?;
        let exists: bool = self.conn.query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {TABLE_NAME} WHERE {where_clause})"),
            params_from_iter(query_params),
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Return the single metadata row matching the filter
    ///
    /// Zero matches is `NotStored`; more than one is an ambiguous query and
    /// a caller error, never resolved by picking one.
    pub fn get_metadata(
        &self,
        component: &dyn Component,
        filter: &MetadataFilter,
    ) -> StoreResult<TimeSeriesMetadata> {
        let mut rows = self.list_metadata(component, filter)?;
        match rows.len() {
            0 => Err(StoreError::NotStored(format!(
                "no time series matching the filters is attached to {}",
                component.label()
            ))),
            1 => Ok(rows.remove(0)),
            n => Err(StoreError::OperationNotAllowed(format!(
                "the filters matched {n} time series attached to {}; narrow the query",
                component.label()
            ))),
        }
    }

    /// Return all metadata rows matching the filter, in insertion order
    pub fn list_metadata(
        &self,
        component: &dyn Component,
        filter: &MetadataFilter,
    ) -> StoreResult<Vec<TimeSeriesMetadata>> {
        let (where_clause, query_params) = filter_clause(component, filter)?;
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT time_series_id, time_series_type, variable_name, initial_time,
                    resolution_us, length, units, normalization, user_attributes
             FROM {TABLE_NAME} WHERE {where_clause} ORDER BY id"
        ))?;

        let rows: Vec<MetadataRow> = stmt
            .query_map(params_from_iter(query_params), |row| {
                Ok(MetadataRow {
                    time_series_id: row.get(0)?,
                    time_series_type: row.get(1)?,
                    variable_name: row.get(2)?,
                    initial_time: row.get(3)?,
                    resolution_us: row.get(4)?,
                    length: row.get(5)?,
                    units: row.get(6)?,
                    normalization: row.get(7)?,
                    user_attributes: row.get(8)?,
                })
            })?
            .collect::<Result<_, _>>()?;

        rows.into_iter().map(MetadataRow::into_metadata).collect()
    }

    /// Delete all rows matching the filter across the given components
    ///
    /// Returns the distinct physical ids the deleted rows referenced.
    pub fn remove(
        &mut self,
        components: &[&dyn Component],
        filter: &MetadataFilter,
    ) -> StoreResult<Vec<u64>> {
        let mut touched: BTreeSet<u64> = BTreeSet::new();
        let mut deleted = 0;

        for component in components {
            let (where_clause, query_params) = filter_clause(*component, filter)?;

            let ids: Vec<i64> = {
                let mut stmt = self.conn.prepare_cached(&format!(
                    "SELECT DISTINCT time_series_id FROM {TABLE_NAME} WHERE {where_clause}"
                ))?;
                let ids = stmt
                    .query_map(params_from_iter(query_params.clone()), |row| row.get(0))?
                    .collect::<Result<_, _>>()?;
                ids
            };
            touched.extend(ids.into_iter().map(|id| id as u64));

            deleted += self.conn.execute(
                &format!("DELETE FROM {TABLE_NAME} WHERE {where_clause}"),
                params_from_iter(query_params),
            )?;
        }

        if deleted == 0 {
            return Err(StoreError::NotStored(
                "no time series matched the removal filters".to_string(),
            ));
        }
        debug!("removed {} time series metadata rows", deleted);
        Ok(touched.into_iter().collect())
    }

    /// Of the given physical ids, return those no metadata row references
    ///
    /// This is the reference-counting gate: only ids reported here may be
    /// physically deleted.
    pub fn list_missing_time_series(&self, time_series_ids: &[u64]) -> StoreResult<Vec<u64>> {
        let mut missing = Vec::new();
        for &id in time_series_ids {
            if !self.has_time_series(id)? {
                missing.push(id);
            }
        }
        Ok(missing)
    }

    /// Highest physical id any row references, if the store is non-empty
    pub fn max_time_series_id(&self) -> StoreResult<Option<u64>> {
        let max: Option<i64> = self.conn.query_row(
            &format!("SELECT MAX(time_series_id) FROM {TABLE_NAME}"),
            [],
            |row| row.get(0),
        )?;
        Ok(max.map(|id| id as u64))
    }

    /// Total number of metadata rows
    pub fn count_rows(&self) -> StoreResult<u64> {
        let count: i64 =
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {TABLE_NAME}"), [], |row| {
                    row.get(0)
                })?;
        Ok(count as u64)
    }

    fn is_attached(
        &self,
        component_id: i64,
        component_type: &str,
        metadata: &TimeSeriesMetadata,
        attributes: &str,
    ) -> StoreResult<bool> {
        let exists: bool = self.conn.query_row(
            &format!(
                "SELECT EXISTS(SELECT 1 FROM {TABLE_NAME}
                 WHERE component_id = ? AND component_type = ?
                   AND variable_name = ? AND time_series_type = ?
                   AND user_attributes = ?)"
            ),
            params![
                component_id,
                component_type,
                metadata.variable_name,
                metadata.time_series_type,
                attributes
            ],
            |row| row.get(0),
        )?;
        Ok(exists)
    }
}

fn create_table(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {TABLE_NAME} (
                id INTEGER PRIMARY KEY,
                time_series_id INTEGER NOT NULL,
                time_series_type TEXT NOT NULL,
                variable_name TEXT NOT NULL,
                initial_time TEXT NOT NULL,
                resolution_us INTEGER NOT NULL,
                length INTEGER NOT NULL,
                units TEXT,
                normalization TEXT,
                user_attributes TEXT NOT NULL,
                component_id INTEGER NOT NULL,
                component_type TEXT NOT NULL
            )"
        ),
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE INDEX IF NOT EXISTS by_component
             ON {TABLE_NAME}(component_id, component_type, variable_name)"
        ),
        [],
    )?;
    conn.execute(
        &format!("CREATE INDEX IF NOT EXISTS by_time_series_id ON {TABLE_NAME}(time_series_id)"),
        [],
    )?;
    Ok(())
}

/// Canonical JSON text of the attribute bag (BTreeMap ordering)
fn canonical_attributes(metadata: &TimeSeriesMetadata) -> StoreResult<String> {
    Ok(serde_json::to_string(&metadata.user_attributes)?)
}

fn component_key(component: &dyn Component) -> StoreResult<(i64, &'static str)> {
    let id = component.id().ok_or_else(|| {
        StoreError::OperationNotAllowed(format!(
            "{} must be attached to a system before its time series can be indexed",
            component.label()
        ))
    })?;
    Ok((id as i64, component.component_type()))
}

/// Build the WHERE clause and parameters for a component + filter query
fn filter_clause(
    component: &dyn Component,
    filter: &MetadataFilter,
) -> StoreResult<(String, Vec<SqlValue>)> {
    let (component_id, component_type) = component_key(component)?;
    let mut clauses = vec!["component_id = ?", "component_type = ?"];
    let mut query_params: Vec<SqlValue> = vec![
        SqlValue::from(component_id),
        SqlValue::from(component_type.to_string()),
    ];

    if let Some(variable_name) = &filter.variable_name {
        clauses.push("variable_name = ?");
        query_params.push(SqlValue::from(variable_name.clone()));
    }
    if let Some(time_series_type) = &filter.time_series_type {
        clauses.push("time_series_type = ?");
        query_params.push(SqlValue::from(time_series_type.clone()));
    }
    if !filter.user_attributes.is_empty() {
        clauses.push("user_attributes = ?");
        query_params.push(SqlValue::from(serde_json::to_string(
            &filter.user_attributes,
        )?));
    }

    Ok((clauses.join(" AND "), query_params))
}

/// Raw row shape pulled out of SQLite before conversion
struct MetadataRow {
    time_series_id: i64,
    time_series_type: String,
    variable_name: String,
    initial_time: String,
    resolution_us: i64,
    length: i64,
    units: Option<String>,
    normalization: Option<String>,
    user_attributes: String,
}

impl MetadataRow {
    fn into_metadata(self) -> StoreResult<TimeSeriesMetadata> {
        if self.time_series_type != SINGLE_TIME_SERIES {
            return Err(StoreError::Unimplemented(format!(
                "time series type `{}`",
                self.time_series_type
            )));
        }
        let initial_time: DateTime<Utc> = DateTime::parse_from_rfc3339(&self.initial_time)
            .map_err(|e| {
                StoreError::Corruption(format!(
                    "invalid initial_time `{}`: {e}",
                    self.initial_time
                ))
            })?
            .with_timezone(&Utc);
        let normalization = self
            .normalization
            .map(|text| serde_json::from_str(&text))
            .transpose()?;

        Ok(TimeSeriesMetadata {
            variable_name: self.variable_name,
            time_series_type: self.time_series_type,
            initial_time,
            resolution: TimeDelta::microseconds(self.resolution_us),
            length: self.length as u64,
            time_series_id: self.time_series_id as u64,
            units: self.units,
            normalization,
            user_attributes: serde_json::from_str(&self.user_attributes)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::{Normalization, SingleTimeSeries};
    use chrono::TimeZone;
    use serde_json::Value;
    use std::collections::BTreeMap;
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

    fn metadata(id: u64, variable_name: &str, attrs: BTreeMap<String, Value>) -> TimeSeriesMetadata {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let data: Vec<f64> = (0..24).map(|i| i as f64).collect();
        let mut series =
            SingleTimeSeries::new(variable_name, start, TimeDelta::hours(1), data).units("kW");
        series.id = Some(id);
        TimeSeriesMetadata::from_data(&series, attrs).unwrap()
    }

    fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect()
    }

    #[test]
    fn test_add_and_get() {
        let mut store = TimeSeriesMetadataStore::new().unwrap();
        let gen = generator(1);
        let meta = metadata(10, "active_power", BTreeMap::new());

        store.add(&meta, &[&gen]).unwrap();

        let fetched = store
            .get_metadata(&gen, &MetadataFilter::new().variable_name("active_power"))
            .unwrap();
        assert_eq!(fetched, meta);
        assert!(store.has_time_series(10).unwrap());
        assert!(!store.has_time_series(11).unwrap());
    }

    #[test]
    fn test_metadata_roundtrip_preserves_fields() {
        let mut store = TimeSeriesMetadataStore::new().unwrap();
        let gen = generator(1);

        let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let data: Vec<f64> = (0..8).map(|i| i as f64).collect();
        let mut series = SingleTimeSeries::new("load", start, TimeDelta::minutes(15), data)
            .units("MW")
            .normalized(Normalization::ByValue(2.0));
        series.id = Some(5);
        let meta = TimeSeriesMetadata::from_data(&series, attrs(&[("scenario", "high")])).unwrap();

        store.add(&meta, &[&gen]).unwrap();
        let fetched = store.get_metadata(&gen, &MetadataFilter::new()).unwrap();

        assert_eq!(fetched.normalization, Some(Normalization::ByValue(2.0)));
        assert_eq!(fetched.units.as_deref(), Some("MW"));
        assert_eq!(fetched.resolution, TimeDelta::minutes(15));
        assert_eq!(fetched.user_attributes, meta.user_attributes);
    }

    #[test]
    fn test_one_row_per_component() {
        let mut store = TimeSeriesMetadataStore::new().unwrap();
        let gen1 = generator(1);
        let gen2 = generator(2);
        let meta = metadata(10, "active_power", BTreeMap::new());

        store.add(&meta, &[&gen1, &gen2]).unwrap();
        assert_eq!(store.count_rows().unwrap(), 2);

        // Both components resolve the same physical id
        let filter = MetadataFilter::new();
        assert_eq!(
            store.get_metadata(&gen1, &filter).unwrap().time_series_id,
            10
        );
        assert_eq!(
            store.get_metadata(&gen2, &filter).unwrap().time_series_id,
            10
        );
    }

    #[test]
    fn test_duplicate_attachment_rejected() {
        let mut store = TimeSeriesMetadataStore::new().unwrap();
        let gen = generator(1);
        let meta = metadata(10, "active_power", BTreeMap::new());

        store.add(&meta, &[&gen]).unwrap();
        let err = store.add(&meta, &[&gen]).unwrap_err();
        assert!(matches!(err, StoreError::OperationNotAllowed(_)));
        assert_eq!(store.count_rows().unwrap(), 1);
    }

    #[test]
    fn test_unassigned_component_rejected() {
        let mut store = TimeSeriesMetadataStore::new().unwrap();
        let gen = Generator {
            id: None,
            name: "floating".to_string(),
        };
        let meta = metadata(10, "active_power", BTreeMap::new());
        assert!(matches!(
            store.add(&meta, &[&gen]),
            Err(StoreError::OperationNotAllowed(_))
        ));
    }

    #[test]
    fn test_ambiguous_get_rejected() {
        let mut store = TimeSeriesMetadataStore::new().unwrap();
        let gen = generator(1);

        store
            .add(&metadata(10, "active_power", BTreeMap::new()), &[&gen])
            .unwrap();
        store
            .add(&metadata(11, "reactive_power", BTreeMap::new()), &[&gen])
            .unwrap();

        // An unfiltered get matches both rows
        let err = store.get_metadata(&gen, &MetadataFilter::new()).unwrap_err();
        assert!(matches!(err, StoreError::OperationNotAllowed(_)));

        // Narrowing resolves it
        let fetched = store
            .get_metadata(&gen, &MetadataFilter::new().variable_name("active_power"))
            .unwrap();
        assert_eq!(fetched.time_series_id, 10);
    }

    #[test]
    fn test_attribute_matching_is_exact() {
        let mut store = TimeSeriesMetadataStore::new().unwrap();
        let gen = generator(1);

        store
            .add(
                &metadata(10, "active_power", attrs(&[("scenario", "high"), ("year", "2030")])),
                &[&gen],
            )
            .unwrap();

        // The full bag matches
        let filter = MetadataFilter::new()
            .attribute("scenario", "high")
            .attribute("year", "2030");
        assert!(store.has_time_series_metadata(&gen, &filter).unwrap());

        // A partial bag does not
        let filter = MetadataFilter::new().attribute("scenario", "high");
        assert!(!store.has_time_series_metadata(&gen, &filter).unwrap());

        // A wrong value does not
        let filter = MetadataFilter::new()
            .attribute("scenario", "low")
            .attribute("year", "2030");
        assert!(!store.has_time_series_metadata(&gen, &filter).unwrap());
    }

    #[test]
    fn test_list_metadata_in_insertion_order() {
        let mut store = TimeSeriesMetadataStore::new().unwrap();
        let gen = generator(1);

        store
            .add(&metadata(10, "a", BTreeMap::new()), &[&gen])
            .unwrap();
        store
            .add(&metadata(11, "b", BTreeMap::new()), &[&gen])
            .unwrap();
        store
            .add(&metadata(12, "c", BTreeMap::new()), &[&gen])
            .unwrap();

        let rows = store.list_metadata(&gen, &MetadataFilter::new()).unwrap();
        let ids: Vec<u64> = rows.iter().map(|m| m.time_series_id).collect();
        assert_eq!(ids, vec![10, 11, 12]);
    }

    #[test]
    fn test_remove_returns_touched_ids() {
        let mut store = TimeSeriesMetadataStore::new().unwrap();
        let gen1 = generator(1);
        let gen2 = generator(2);

        store
            .add(&metadata(10, "active_power", BTreeMap::new()), &[&gen1, &gen2])
            .unwrap();

        let touched = store
            .remove(&[&gen1], &MetadataFilter::new().variable_name("active_power"))
            .unwrap();
        assert_eq!(touched, vec![10]);

        // gen2 still references the array
        assert_eq!(store.list_missing_time_series(&touched).unwrap(), Vec::<u64>::new());

        let touched = store
            .remove(&[&gen2], &MetadataFilter::new().variable_name("active_power"))
            .unwrap();
        assert_eq!(store.list_missing_time_series(&touched).unwrap(), vec![10]);
    }

    #[test]
    fn test_remove_nothing_is_not_stored() {
        let mut store = TimeSeriesMetadataStore::new().unwrap();
        let gen = generator(1);
        let err = store.remove(&[&gen], &MetadataFilter::new()).unwrap_err();
        assert!(matches!(err, StoreError::NotStored(_)));
    }

    #[test]
    fn test_max_time_series_id() {
        let mut store = TimeSeriesMetadataStore::new().unwrap();
        assert_eq!(store.max_time_series_id().unwrap(), None);

        let gen = generator(1);
        store
            .add(&metadata(42, "active_power", BTreeMap::new()), &[&gen])
            .unwrap();
        assert_eq!(store.max_time_series_id().unwrap(), Some(42));
    }

    #[test]
    fn test_backup_and_restore() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(METADATA_DB_FILENAME);
        let gen = generator(1);
        let meta = metadata(10, "active_power", attrs(&[("scenario", "high")]));

        {
            let mut store = TimeSeriesMetadataStore::new().unwrap();
            store.add(&meta, &[&gen]).unwrap();
            store.backup_to(&path).unwrap();
        }

        let store = TimeSeriesMetadataStore::from_backup_file(&path).unwrap();
        let fetched = store.get_metadata(&gen, &MetadataFilter::new()).unwrap();
        assert_eq!(fetched, meta);
    }
}
