use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDateTime, Utc};
use duckdb::Connection;
use hopline_core::error::{HoplineError, Result};

use crate::schema::SCHEMA_SQL;

/// Counts and bounds over the stored data, mostly for startup banners and
/// tests.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreStatus {
    pub db_path: String,
    pub db_size_bytes: u64,
    pub trace_record_count: usize,
    pub span_count: usize,
    pub oldest_record_ts: Option<DateTime<Utc>>,
    pub newest_record_ts: Option<DateTime<Utc>>,
}

/// Shared DuckDB handle. Clones share one connection behind a mutex; every
/// service in the chain writes into the same database.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    db_path: String,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| HoplineError::Io(format!("failed to create db dir: {e}")))?;
        }

        let conn = Connection::open(path)
            .map_err(|e| HoplineError::Store(format!("failed to open duckdb: {e}")))?;
        conn.execute_batch("PRAGMA threads=4;")
            .map_err(|e| HoplineError::Store(format!("failed to set pragmas: {e}")))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| HoplineError::Store(format!("failed to initialize schema: {e}")))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.display().to_string(),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| HoplineError::Store(format!("failed to open in-memory db: {e}")))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| HoplineError::Store(format!("failed to initialize schema: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: ":memory:".to_string(),
        })
    }

    pub(crate) fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    pub fn status(&self) -> Result<StoreStatus> {
        let conn = self.conn();

        let trace_record_count = scalar_usize(&conn, "SELECT COUNT(*) FROM trace_records")?;
        let span_count = scalar_usize(&conn, "SELECT COUNT(*) FROM spans")?;
        let oldest_record_ts = scalar_ts(&conn, "SELECT MIN(request_ts) FROM trace_records")?;
        let newest_record_ts = scalar_ts(&conn, "SELECT MAX(request_ts) FROM trace_records")?;

        let db_size_bytes = if self.db_path == ":memory:" {
            0
        } else {
            fs::metadata(&self.db_path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(StoreStatus {
            db_path: self.db_path.clone(),
            db_size_bytes,
            trace_record_count,
            span_count,
            oldest_record_ts,
            newest_record_ts,
        })
    }
}

fn scalar_usize(conn: &Connection, sql: &str) -> Result<usize> {
    conn.query_row(sql, [], |row| row.get::<_, i64>(0))
        .map(|v| v as usize)
        .map_err(|e| HoplineError::Store(format!("query failed: {e}")))
}

fn scalar_ts(conn: &Connection, sql: &str) -> Result<Option<DateTime<Utc>>> {
    conn.query_row(sql, [], |row| row.get::<_, Option<NaiveDateTime>>(0))
        .map(|opt| opt.map(|dt| dt.and_utc()))
        .map_err(|e| HoplineError::Store(format!("query failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_store_initializes() {
        let store = Store::open_in_memory().unwrap();
        let status = store.status().unwrap();
        assert_eq!(status.trace_record_count, 0);
        assert_eq!(status.span_count, 0);
        assert!(status.oldest_record_ts.is_none());
    }

    #[test]
    fn clones_share_the_same_database() {
        let store = Store::open_in_memory().unwrap();
        let clone = store.clone();
        let trace = testkit::trace_id(1);
        store
            .insert_trace_record(&testkit::sample_record(&trace, "user-service", 0))
            .unwrap();
        assert_eq!(clone.status().unwrap().trace_record_count, 1);
    }
}
