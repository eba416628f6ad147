use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span};

/// One completed speed test. `timestamp` (epoch millis) is the unique key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedTestRecord {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss_percent: f64,
    pub timestamp: i64,
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("history schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },
    #[error("history store lock poisoned")]
    Poisoned,
}

pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS speed_test (
    timestamp            INTEGER PRIMARY KEY,
    download_mbps        REAL NOT NULL,
    upload_mbps          REAL NOT NULL,
    latency_ms           REAL NOT NULL,
    jitter_ms            REAL NOT NULL,
    packet_loss_percent  REAL NOT NULL
);
";

/// Persisted speed-test log, one row per timestamp.
///
/// The connection sits behind a mutex so concurrent appends are serialized;
/// two appends with the same timestamp resolve last-write-wins.
pub struct HistoryStore {
    conn: Mutex<Connection>,
}

impl HistoryStore {
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        let _span = info_span!("history_open", path = %path.display()).entered();
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, HistoryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self, HistoryError> {
        let found: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        match found {
            0 => {
                let tx = conn.transaction()?;
                tx.execute_batch(SCHEMA_V1)?;
                tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
                tx.commit()?;
                info!(version = SCHEMA_VERSION, "Initialized history schema");
            }
            SCHEMA_VERSION => debug!(version = found, "History schema up to date"),
            _ => {
                return Err(HistoryError::SchemaTooNew { found, supported: SCHEMA_VERSION });
            }
        }
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, HistoryError> {
        self.conn.lock().map_err(|_| HistoryError::Poisoned)
    }

    /// Inserts `record`, replacing any record with the same timestamp.
    pub fn append(&self, record: &SpeedTestRecord) -> Result<(), HistoryError> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO speed_test \
             (timestamp, download_mbps, upload_mbps, latency_ms, jitter_ms, packet_loss_percent) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.timestamp,
                record.download_mbps,
                record.upload_mbps,
                record.latency_ms,
                record.jitter_ms,
                record.packet_loss_percent,
            ],
        )?;
        debug!(timestamp = record.timestamp, "Appended speed test record");
        Ok(())
    }

    /// Every record, newest first.
    pub fn list_all(&self) -> Result<Vec<SpeedTestRecord>, HistoryError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, download_mbps, upload_mbps, latency_ms, jitter_ms, packet_loss_percent \
             FROM speed_test ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SpeedTestRecord {
                timestamp: row.get(0)?,
                download_mbps: row.get(1)?,
                upload_mbps: row.get(2)?,
                latency_ms: row.get(3)?,
                jitter_ms: row.get(4)?,
                packet_loss_percent: row.get(5)?,
            })
        })?;

        let mut records = rows.collect::<Result<Vec<_>, _>>()?;
        records.reverse();
        Ok(records)
    }

    pub fn len(&self) -> Result<usize, HistoryError> {
        let count: i64 = self.conn()?.query_row("SELECT COUNT(*) FROM speed_test", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Deletes every record; returns how many were removed.
    pub fn clear(&self) -> Result<usize, HistoryError> {
        let removed = self.conn()?.execute("DELETE FROM speed_test", [])?;
        info!(removed, "Cleared speed test history");
        Ok(removed)
    }
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(timestamp: i64, download_mbps: f64) -> SpeedTestRecord {
        SpeedTestRecord {
            download_mbps,
            upload_mbps: 20.0,
            latency_ms: 12.0,
            jitter_ms: 1.5,
            packet_loss_percent: 0.0,
            timestamp,
        }
    }

    #[test]
    fn list_all_is_newest_first() {
        let store = HistoryStore::open_in_memory().unwrap();
        for ts in [100, 300, 200] {
            store.append(&record(ts, 1.0)).unwrap();
        }
        let order: Vec<i64> = store.list_all().unwrap().iter().map(|r| r.timestamp).collect();
        assert_eq!(order, vec![300, 200, 100]);
    }

    #[test]
    fn duplicate_timestamp_overwrites() {
        let store = HistoryStore::open_in_memory().unwrap();
        store.append(&record(100, 1.0)).unwrap();
        store.append(&record(200, 1.0)).unwrap();
        store.append(&record(100, 99.0)).unwrap();

        let all = store.list_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(store.len().unwrap(), 2);
        let at_100: Vec<_> = all.iter().filter(|r| r.timestamp == 100).collect();
        assert_eq!(at_100.len(), 1);
        assert_eq!(at_100[0].download_mbps, 99.0);
    }

    #[test]
    fn empty_store_lists_nothing() {
        let store = HistoryStore::open_in_memory().unwrap();
        assert!(store.list_all().unwrap().is_empty());
        assert_eq!(store.len().unwrap(), 0);
    }

    #[test]
    fn clear_removes_everything() {
        let store = HistoryStore::open_in_memory().unwrap();
        store.append(&record(1, 1.0)).unwrap();
        store.append(&record(2, 1.0)).unwrap();
        assert_eq!(store.clear().unwrap(), 2);
        assert!(store.list_all().unwrap().is_empty());
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        {
            let store = HistoryStore::open(&path).unwrap();
            store.append(&record(1_700_000_000_000, 512.5)).unwrap();
        }
        let store = HistoryStore::open(&path).unwrap();
        let all = store.list_all().unwrap();
        assert_eq!(all, vec![record(1_700_000_000_000, 512.5)]);
    }

    #[test]
    fn fresh_file_is_stamped_with_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        drop(HistoryStore::open(&path).unwrap());

        let conn = Connection::open(&path).unwrap();
        let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0)).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn newer_schema_is_refused_and_left_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        {
            let store = HistoryStore::open(&path).unwrap();
            store.append(&record(5, 1.0)).unwrap();
        }
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1).unwrap();
        }

        let err = HistoryStore::open(&path).unwrap_err();
        assert!(matches!(err, HistoryError::SchemaTooNew { found, .. } if found == SCHEMA_VERSION + 1));

        let conn = Connection::open(&path).unwrap();
        let rows: i64 = conn.query_row("SELECT COUNT(*) FROM speed_test", [], |row| row.get(0)).unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn unwritable_location_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("history.db");
        assert!(matches!(HistoryStore::open(&path), Err(HistoryError::Sqlite(_))));
    }

    #[test]
    fn concurrent_appends_same_key_leave_one_row() {
        let store = Arc::new(HistoryStore::open_in_memory().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.append(&record(42, f64::from(i))).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len().unwrap(), 1);
    }
}
