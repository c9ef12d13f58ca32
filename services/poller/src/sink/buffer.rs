//! Durable SQLite staging buffer.
//!
//! Batches land here as JSON payloads keyed by the batch key string; a
//! separate mover ships them onward and deletes them. With a TTL
//! configured, rows that outlive it are pruned on the next insert.
//!
//! # SQLite durability settings
//! Applied at open: WAL, synchronous=FULL, wal_autocheckpoint=1000,
//! foreign_keys=ON. PRAGMA integrity_check runs at open; returns an error
//! if it fails.

use rusqlite::{Connection, params};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::SinkError;
use meter_core::{BatchKey, Record};

/// The local staging buffer sink.
pub struct BufferSink {
    conn: Arc<Mutex<Connection>>,
    /// Row lifetime in seconds; 0 disables expiry.
    ttl_secs: u64,
}

impl BufferSink {
    /// Open (or create) the staging buffer at the given path.
    pub fn open(path: &Path, ttl_secs: u64) -> Result<BufferSink, SinkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SinkError::Unavailable(format!("creating {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| SinkError::Unavailable(format!("opening {}: {e}", path.display())))?;
        apply_pragmas(&conn)?;
        run_integrity_check(&conn)?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(BufferSink {
            conn: Arc::new(Mutex::new(conn)),
            ttl_secs,
        })
    }

    /// In-memory buffer for tests.
    pub fn open_in_memory(ttl_secs: u64) -> Result<BufferSink, SinkError> {
        let conn = Connection::open_in_memory()?;
        apply_pragmas(&conn)?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(BufferSink {
            conn: Arc::new(Mutex::new(conn)),
            ttl_secs,
        })
    }

    /// Stage one batch. Re-staging the same key replaces the payload
    /// (a re-read window supersedes the previous attempt).
    pub async fn insert(&self, key: &BatchKey, records: &[Record]) -> Result<bool, SinkError> {
        let payload = serde_json::to_string(records)?;
        let now = chrono::Utc::now().timestamp();
        let expires_at = if self.ttl_secs == 0 {
            None
        } else {
            Some(now + self.ttl_secs as i64)
        };

        let conn = self.conn.lock().await;
        let pruned = conn.execute(
            "DELETE FROM staging WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now],
        )?;
        if pruned > 0 {
            debug!(pruned, "expired staging rows removed");
        }
        conn.execute(
            "INSERT OR REPLACE INTO staging (key, kind, payload, inserted_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![key.to_string(), key.kind.as_str(), payload, now, expires_at],
        )?;
        Ok(true)
    }

    /// Payload staged under a key, if any. Used by the mover and by tests.
    pub async fn staged(&self, key: &str) -> Result<Option<String>, SinkError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT payload FROM staging WHERE key = ?1")?;
        let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        Ok(rows.next().transpose()?)
    }

    /// Total staged batches.
    pub async fn staged_count(&self) -> Result<i64, SinkError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM staging", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn apply_pragmas(conn: &Connection) -> Result<(), SinkError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=FULL;
         PRAGMA wal_autocheckpoint=1000;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}

fn run_integrity_check(conn: &Connection) -> Result<(), SinkError> {
    let result: String = conn.pragma_query_value(None, "integrity_check", |row| row.get(0))?;
    if result != "ok" {
        return Err(SinkError::IntegrityCheckFailed(result));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meter_core::DataKind;

    fn batch_key() -> BatchKey {
        BatchKey::new("acme", "10067967", 1_649_100_604, DataKind::List1)
    }

    #[tokio::test]
    async fn staged_payload_round_trips_as_json() {
        let sink = BufferSink::open_in_memory(0).unwrap();
        let records = vec![
            Record::new("F.F", "00000000"),
            Record::new("1.8.0", "01281.6601").with_unit("kWh"),
        ];
        assert!(sink.insert(&batch_key(), &records).await.unwrap());

        let payload = sink
            .staged("acme:10067967_1649100604:list1")
            .await
            .unwrap()
            .unwrap();
        let restored: Vec<Record> = serde_json::from_str(&payload).unwrap();
        assert_eq!(restored, records);
    }

    #[tokio::test]
    async fn restaging_a_key_replaces_the_payload() {
        let sink = BufferSink::open_in_memory(0).unwrap();
        let key = batch_key();
        sink.insert(&key, &[Record::new("F.F", "00000001")])
            .await
            .unwrap();
        sink.insert(&key, &[Record::new("F.F", "00000002")])
            .await
            .unwrap();
        assert_eq!(sink.staged_count().await.unwrap(), 1);
        let payload = sink.staged(&key.to_string()).await.unwrap().unwrap();
        assert!(payload.contains("00000002"));
    }

    #[tokio::test]
    async fn expired_rows_are_pruned_on_insert() {
        let sink = BufferSink::open_in_memory(1).unwrap();
        // Forge an already-expired row.
        {
            let conn = sink.conn.lock().await;
            conn.execute(
                "INSERT INTO staging (key, kind, payload, inserted_at, expires_at)
                 VALUES ('stale', 'list1', '[]', 0, 1)",
                [],
            )
            .unwrap();
        }
        sink.insert(&batch_key(), &[Record::new("F.F", "00000000")])
            .await
            .unwrap();
        assert!(sink.staged("stale").await.unwrap().is_none());
        assert_eq!(sink.staged_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/staging.sqlite3");
        let sink = BufferSink::open(&path, 0).unwrap();
        sink.insert(&batch_key(), &[Record::new("F.F", "00000000")])
            .await
            .unwrap();
        assert!(path.exists());
    }
}
