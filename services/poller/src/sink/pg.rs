//! Direct relational sink.
//!
//! Reference tables `obis(id, obis)` and `meters(id, meter_id, …)` are
//! cached at connect; unknown OBIS codes are inserted on first sight and
//! the cache refreshed. Data rows land in `data(meter_id, ts, obis_id,
//! value)` with upsert-on-conflict replacing the value, so a re-read
//! window is idempotent.

use chrono::{TimeZone, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::SinkError;
use crate::config::DbConfig;
use meter_core::{BatchKey, Record};

/// The Postgres record sink.
pub struct PgSink {
    pool: PgPool,
    schema: String,
    obis_cache: RwLock<HashMap<String, i64>>,
    meter_cache: RwLock<HashMap<String, i64>>,
}

impl PgSink {
    /// Connect and warm the OBIS and meter id caches.
    pub async fn connect(db: &DbConfig) -> Result<PgSink, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(&db.url())
            .await
            .map_err(|e| SinkError::Unavailable(format!("{}: {e}", db.redacted_url())))?;
        info!(url = %db.redacted_url(), schema = %db.pg_schema, "relational sink connected");

        let sink = PgSink {
            pool,
            schema: db.pg_schema.clone(),
            obis_cache: RwLock::new(HashMap::new()),
            meter_cache: RwLock::new(HashMap::new()),
        };
        sink.refresh_obis_cache().await?;
        sink.refresh_meter_cache().await?;
        Ok(sink)
    }

    /// Insert one batch inside a transaction; commit confirms acceptance.
    pub async fn insert(&self, key: &BatchKey, records: &[Record]) -> Result<bool, SinkError> {
        let meter_fk = self.meter_fk(&key.meter_id).await?;
        let upsert = format!(
            "INSERT INTO {schema}.data (meter_id, ts, obis_id, value) VALUES ($1, $2, $3, $4)
             ON CONFLICT (meter_id, ts, obis_id) DO UPDATE SET value = EXCLUDED.value",
            schema = self.schema
        );

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;
        for record in records {
            let Some(obis_id) = self.obis_fk(&record.obis).await? else {
                warn!(obis = %record.obis, "OBIS code not registered, skipping record");
                continue;
            };
            let ts = record.line_time.unwrap_or(key.dispatched_at);
            let ts = Utc
                .timestamp_opt(ts, 0)
                .single()
                .ok_or_else(|| SinkError::Rejected(format!("record timestamp {ts} out of range")))?;
            sqlx::query(sqlx::AssertSqlSafe(upsert.clone()))
                .bind(meter_fk)
                .bind(ts)
                .bind(obis_id)
                .bind(&record.value)
                .execute(&mut *tx)
                .await?;
            inserted += 1;
        }
        tx.commit().await?;
        debug!(key = %key, inserted, "batch committed");
        Ok(inserted > 0)
    }

    // -----------------------------------------------------------------------
    // Reference caches
    // -----------------------------------------------------------------------

    async fn meter_fk(&self, meter_id: &str) -> Result<i64, SinkError> {
        if let Some(id) = self.meter_cache.read().await.get(meter_id) {
            return Ok(*id);
        }
        // A meter new to the roster since connect; reload once.
        self.refresh_meter_cache().await?;
        self.meter_cache
            .read()
            .await
            .get(meter_id)
            .copied()
            .ok_or_else(|| SinkError::Rejected(format!("meter {meter_id} not registered")))
    }

    /// Reference id for an OBIS code, registering unknown codes on first
    /// sight.
    async fn obis_fk(&self, obis: &str) -> Result<Option<i64>, SinkError> {
        if let Some(id) = self.obis_cache.read().await.get(obis) {
            return Ok(Some(*id));
        }
        let sql = format!(
            "INSERT INTO {schema}.obis (obis) VALUES ($1) ON CONFLICT (obis) DO NOTHING",
            schema = self.schema
        );
        sqlx::query(sqlx::AssertSqlSafe(sql)).bind(obis).execute(&self.pool).await?;
        info!(obis, "registered new OBIS code");
        self.refresh_obis_cache().await?;
        Ok(self.obis_cache.read().await.get(obis).copied())
    }

    async fn refresh_obis_cache(&self) -> Result<(), SinkError> {
        let sql = format!(
            "SELECT id, obis FROM {schema}.obis ORDER BY id",
            schema = self.schema
        );
        let rows = sqlx::query(sqlx::AssertSqlSafe(sql)).fetch_all(&self.pool).await?;
        let mut cache = self.obis_cache.write().await;
        cache.clear();
        for row in rows {
            cache.insert(row.try_get::<String, _>("obis")?, row.try_get::<i64, _>("id")?);
        }
        info!(codes = cache.len(), "OBIS codes loaded");
        Ok(())
    }

    async fn refresh_meter_cache(&self) -> Result<(), SinkError> {
        let sql = format!(
            "SELECT id, meter_id FROM {schema}.meters ORDER BY id",
            schema = self.schema
        );
        let rows = sqlx::query(sqlx::AssertSqlSafe(sql)).fetch_all(&self.pool).await?;
        let mut cache = self.meter_cache.write().await;
        cache.clear();
        for row in rows {
            cache.insert(
                row.try_get::<String, _>("meter_id")?,
                row.try_get::<i64, _>("id")?,
            );
        }
        info!(meters = cache.len(), "meter ids loaded");
        Ok(())
    }
}
