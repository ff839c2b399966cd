//! Embedded-SQL time series storage
//!
//! A single SQLite database file with one wide table `(id, timestamp, value)`
//! indexed by `(id, timestamp)`. Ingestion materializes the explicit
//! timestamp column from the series' implicit time axis; range reads are
//! literal filtered and ordered queries. Snapshots use the engine's online
//! backup primitive. Writable instances always open a fresh tempfile-owned
//! database that is deleted when the store is dropped.

use chrono::{DateTime, Utc};
use rusqlite::backup::Backup;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempPath;
use tracing::{debug, info};

use crate::storage::error::{StoreError, StoreResult};
use crate::storage::types::{SingleTimeSeries, TimeSeriesMetadata};
use crate::storage::{StorageDescriptor, StorageKind, TimeSeriesStore};

/// Tag of the only embedded engine this crate ships
pub const SQLITE_ENGINE: &str = "sqlite";

const TABLE_NAME: &str = "time_series";

/// Stores time series in an embedded SQL database
pub struct SqlStore {
    // Declared before `temp` so the connection closes before the file goes
    conn: Connection,
    path: PathBuf,
    engine_name: String,
    /// Present on writable instances; dropping it deletes the database file
    temp: Option<TempPath>,
}

impl std::fmt::Debug for SqlStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlStore")
            .field("path", &self.path)
            .field("engine_name", &self.engine_name)
            .field("temp", &self.temp)
            .finish_non_exhaustive()
    }
}

impl SqlStore {
    /// Create a writable store on a fresh temporary database file
    ///
    /// The file is created under `base` when given, otherwise under the
    /// system temp dir, and deleted when the store is dropped.
    pub fn with_temp_file(base: Option<&Path>, engine_name: &str) -> StoreResult<Self> {
        check_engine(engine_name)?;
        let temp = new_temp_db_path(base)?;
        let path = temp.to_path_buf();

        let conn = open_writable(&path)?;
        init_schema(&conn)?;
        debug!("created time series database at {}", path.display());

        Ok(Self {
            conn,
            path,
            engine_name: engine_name.to_string(),
            temp: Some(temp),
        })
    }

    /// Open an existing database file read-only
    pub fn from_file(path: &Path, engine_name: &str) -> StoreResult<Self> {
        check_engine(engine_name)?;
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
            engine_name: engine_name.to_string(),
            temp: None,
        })
    }

    /// Create a writable store by backing up an existing database file into a
    /// fresh private temporary file
    ///
    /// Mutation through the new store never touches the original snapshot.
    pub fn from_file_to_temp_file(
        src: &Path,
        dst_dir: Option<&Path>,
        engine_name: &str,
    ) -> StoreResult<Self> {
        check_engine(engine_name)?;
        let temp = new_temp_db_path(dst_dir)?;
        let path = temp.to_path_buf();

        let src_conn = Connection::open_with_flags(
            src,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let mut conn = open_writable(&path)?;
        run_backup(&src_conn, &mut conn)?;
        debug!(
            "copied time series database {} to {}",
            src.display(),
            path.display()
        );

        Ok(Self {
            conn,
            path,
            engine_name: engine_name.to_string(),
            temp: Some(temp),
        })
    }

    /// Path of the underlying database file
    pub fn database_path(&self) -> &Path {
        &self.path
    }

    fn has_id(&self, time_series_id: u64) -> StoreResult<bool> {
        let exists: bool = self.conn.query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {TABLE_NAME} WHERE id = ?)"),
            params![time_series_id as i64],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn backup_to(&self, dst_file: &Path) -> StoreResult<()> {
        let mut dst = Connection::open(dst_file)?;
        run_backup(&self.conn, &mut dst)?;
        // Snapshots are opened read-only later; WAL would require a -shm file
        dst.execute_batch("PRAGMA journal_mode = DELETE;")?;
        Ok(())
    }
}

fn check_engine(engine_name: &str) -> StoreResult<()> {
    if engine_name != SQLITE_ENGINE {
        return Err(StoreError::Unimplemented(format!(
            "embedded engine `{engine_name}`"
        )));
    }
    Ok(())
}

/// Reserve a fresh `.db` path whose owner deletes it on drop
fn new_temp_db_path(base: Option<&Path>) -> StoreResult<TempPath> {
    let file = match base {
        Some(base) => {
            fs::create_dir_all(base)?;
            tempfile::Builder::new()
                .prefix("timevault-")
                .suffix(".db")
                .tempfile_in(base)?
        }
        None => tempfile::Builder::new()
            .prefix("timevault-")
            .suffix(".db")
            .tempfile()?,
    };
    Ok(file.into_temp_path())
}

fn open_writable(path: &Path) -> StoreResult<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA cache_size = 10000;
        PRAGMA temp_store = MEMORY;
        ",
    )?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {TABLE_NAME} (
                id INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                value REAL NOT NULL
            )"
        ),
        [],
    )?;
    conn.execute(
        &format!("CREATE INDEX IF NOT EXISTS by_id_timestamp ON {TABLE_NAME}(id, timestamp)"),
        [],
    )?;
    Ok(())
}

pub(crate) fn run_backup(src: &Connection, dst: &mut Connection) -> StoreResult<()> {
    let backup = Backup::new(src, dst)?;
    backup.run_to_completion(100, Duration::from_millis(1), None)?;
    Ok(())
}

impl TimeSeriesStore for SqlStore {
    fn kind(&self) -> StorageKind {
        StorageKind::Sql
    }

    fn directory(&self) -> Option<&Path> {
        self.path.parent()
    }

    fn engine_name(&self) -> Option<&str> {
        Some(&self.engine_name)
    }

    fn add_time_series(
        &mut self,
        metadata: &TimeSeriesMetadata,
        series: &SingleTimeSeries,
    ) -> StoreResult<()> {
        if self.has_id(metadata.time_series_id)? {
            debug!("{} was already stored", series.summary());
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT INTO {TABLE_NAME} (id, timestamp, value) VALUES (?, ?, ?)"
            ))?;
            for (ts, value) in series.timestamps().zip(series.data.iter()) {
                stmt.execute(params![
                    metadata.time_series_id as i64,
                    ts.timestamp_micros(),
                    value
                ])?;
            }
        }
        tx.commit()?;
        debug!("added {} to time series database", series.summary());
        Ok(())
    }

    fn get_time_series(
        &self,
        metadata: &TimeSeriesMetadata,
        start_time: Option<DateTime<Utc>>,
        length: Option<u64>,
    ) -> StoreResult<SingleTimeSeries> {
        let id = metadata.time_series_id;
        if !self.has_id(id)? {
            return Err(StoreError::NotStored(format!(
                "no time series with id {id} is stored"
            )));
        }

        let (index, required) = metadata.get_range(start_time, length)?;

        let mut sql = format!("SELECT value FROM {TABLE_NAME} WHERE id = ?");
        let mut query_params: Vec<Value> = vec![Value::from(id as i64)];
        if let Some(ts) = start_time {
            sql.push_str(" AND timestamp >= ?");
            query_params.push(Value::from(ts.timestamp_micros()));
        }
        sql.push_str(" ORDER BY timestamp");
        if length.is_some() {
            sql.push_str(&format!(" LIMIT {required}"));
        }

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let values: Vec<f64> = stmt
            .query_map(params_from_iter(query_params), |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        if values.len() != required {
            return Err(StoreError::Consistency(format!(
                "expected {required} rows for time series {id}, backend returned {}",
                values.len()
            )));
        }

        Ok(SingleTimeSeries {
            id: Some(id),
            variable_name: metadata.variable_name.clone(),
            resolution: metadata.resolution,
            initial_time: metadata.time_at(index),
            data: values,
            units: metadata.units.clone(),
            normalization: metadata.normalization,
        })
    }

    fn remove_time_series(&mut self, time_series_id: u64) -> StoreResult<()> {
        let changed = self.conn.execute(
            &format!("DELETE FROM {TABLE_NAME} WHERE id = ?"),
            params![time_series_id as i64],
        )?;
        if changed == 0 {
            return Err(StoreError::NotStored(format!(
                "no time series with id {time_series_id} is stored"
            )));
        }
        Ok(())
    }

    fn serialize(
        &self,
        descriptor: &mut StorageDescriptor,
        dst: &Path,
        _src: Option<&Path>,
    ) -> StoreResult<()> {
        fs::create_dir_all(dst)?;
        let file = tempfile::Builder::new()
            .prefix("time_series_")
            .suffix(".db")
            .tempfile_in(dst)?;
        // The snapshot outlives this store; disable the tempfile cleanup
        let (_, path) = file.keep().map_err(|e| StoreError::Io(e.error))?;
        self.backup_to(&path)?;

        descriptor.storage_kind = StorageKind::Sql.as_str().to_string();
        descriptor.filename = path.file_name().map(PathBuf::from);
        descriptor.engine_name = Some(self.engine_name.clone());
        info!("backed up time series database to {}", path.display());
        Ok(())
    }
}
