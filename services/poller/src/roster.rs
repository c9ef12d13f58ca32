//! Roster source and watermark store.
//!
//! The live roster is the Postgres join `meters ⋈ queries`, filtered to
//! active meters with a positive interval for the requested kind. Every
//! successful snapshot is mirrored to a JSON cache file keyed by
//! `(schema, kind)`; when the database is unreachable the cache stands in.
//! No cache and no database is fatal — the fleet never runs on a silently
//! empty roster.
//!
//! Expected roster schema (reference):
//! ```sql
//! meters(id BIGINT PRIMARY KEY, meter_id TEXT, description TEXT,
//!        manufacturer TEXT, ip_address TEXT, port INT, use_meter_id BOOL,
//!        timeout INT, password TEXT, password_type TEXT, timezone TEXT,
//!        org TEXT, is_active BOOL, p01_from TIMESTAMPTZ,
//!        p98_from TIMESTAMPTZ)
//! queries(id BIGINT PRIMARY KEY, list1 INT, … p211 INT, error INT)
//! ```

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::DbConfig;
use meter_core::{DataKind, MeterDescriptor, PasswordKind, WatermarkField};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("roster query failed: {0}")]
    Db(#[from] sqlx::Error),
    #[error("roster source unreachable and no cache at {0}")]
    Unavailable(String),
    #[error("cache io: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache parse: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no database connection for watermark update")]
    NoConnection,
}

// ---------------------------------------------------------------------------
// RosterStore
// ---------------------------------------------------------------------------

pub struct RosterStore {
    pool: Option<PgPool>,
    schema: String,
    cache_dir: PathBuf,
}

impl RosterStore {
    /// Connect to the roster database. A failed connection is tolerated —
    /// snapshots then come from the cache until the source recovers.
    pub async fn connect(db: &DbConfig, cache_dir: &str) -> RosterStore {
        let pool = match PgPoolOptions::new()
            .max_connections(4)
            .connect(&db.url())
            .await
        {
            Ok(pool) => {
                info!(url = %db.redacted_url(), "connected to roster source");
                Some(pool)
            }
            Err(e) => {
                warn!(url = %db.redacted_url(), error = %e, "roster source unreachable, relying on cache");
                None
            }
        };
        RosterStore {
            pool,
            schema: db.pg_schema.clone(),
            cache_dir: PathBuf::from(cache_dir),
        }
    }

    /// Cache-only store (tests, degraded operation).
    pub fn cache_only(schema: &str, cache_dir: &Path) -> RosterStore {
        RosterStore {
            pool: None,
            schema: schema.to_owned(),
            cache_dir: cache_dir.to_owned(),
        }
    }

    pub fn cache_path(&self, kind: DataKind) -> PathBuf {
        self.cache_dir
            .join(format!("meters_{}_{}.json", self.schema, kind.as_str()))
    }

    /// The active roster for one kind.
    ///
    /// Database first; on success the result also refreshes the cache
    /// file. On failure the cache is returned if present.
    pub async fn snapshot(&self, kind: DataKind) -> Result<Vec<MeterDescriptor>, RosterError> {
        if let Some(pool) = &self.pool {
            match self.query_meters(pool, kind).await {
                Ok(meters) => {
                    info!(kind = %kind, meters = meters.len(), "roster loaded from database");
                    if let Err(e) = self.write_cache(kind, &meters) {
                        warn!(path = %self.cache_path(kind).display(), error = %e, "roster cache not written");
                    }
                    return Ok(meters);
                }
                Err(e) => {
                    warn!(kind = %kind, error = %e, "roster query failed, trying cache");
                }
            }
        }
        self.read_cache(kind)
    }

    async fn query_meters(
        &self,
        pool: &PgPool,
        kind: DataKind,
    ) -> Result<Vec<MeterDescriptor>, sqlx::Error> {
        // kind.as_str() comes from a closed enum and the schema is
        // validated at config load, so the interpolation is inert.
        let sql = format!(
            "SELECT m.id, m.meter_id, m.description, m.manufacturer, m.ip_address, m.port,
                    m.use_meter_id, m.timeout, m.password, m.password_type, m.timezone, m.org,
                    m.is_active, m.p01_from, m.p98_from,
                    q.list1, q.list2, q.list3, q.list4, q.p01, q.p02,
                    q.p98, q.p99, q.p200, q.p210, q.p211, q.error
             FROM {schema}.meters m
             INNER JOIN {schema}.queries q ON m.id = q.id
             WHERE q.{kind} > 0 AND m.is_active = TRUE",
            schema = self.schema,
            kind = kind.as_str()
        );
        let rows = sqlx::query(sqlx::AssertSqlSafe(sql)).fetch_all(pool).await?;
        rows.iter().map(map_meter_row).collect()
    }

    fn write_cache(&self, kind: DataKind, meters: &[MeterDescriptor]) -> Result<(), RosterError> {
        std::fs::create_dir_all(&self.cache_dir)?;
        let path = self.cache_path(kind);
        std::fs::write(&path, serde_json::to_string(meters)?)?;
        debug!(path = %path.display(), "roster cache written");
        Ok(())
    }

    fn read_cache(&self, kind: DataKind) -> Result<Vec<MeterDescriptor>, RosterError> {
        let path = self.cache_path(kind);
        if !path.is_file() {
            return Err(RosterError::Unavailable(path.display().to_string()));
        }
        info!(path = %path.display(), "roster loaded from cache file");
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    // -----------------------------------------------------------------------
    // Watermarks
    // -----------------------------------------------------------------------

    /// Advance a resume watermark. The guard keeps advancement strictly
    /// monotone — a stale write (concurrent session, clock skew) is a
    /// no-op.
    pub async fn set_watermark(
        &self,
        meter_id: &str,
        field: WatermarkField,
        instant: DateTime<Utc>,
    ) -> Result<(), RosterError> {
        let pool = self.pool.as_ref().ok_or(RosterError::NoConnection)?;
        let sql = format!(
            "UPDATE {schema}.meters SET {col} = $1
             WHERE meter_id = $2 AND ({col} IS NULL OR {col} < $1)",
            schema = self.schema,
            col = field.column_name()
        );
        let result = sqlx::query(sqlx::AssertSqlSafe(sql))
            .bind(instant)
            .bind(meter_id)
            .execute(pool)
            .await?;
        debug!(
            meter_id,
            field = %field,
            instant = %instant,
            updated = result.rows_affected(),
            "watermark advanced"
        );
        Ok(())
    }

    /// Drop a resume watermark (the window was consumed clean).
    pub async fn clear_watermark(
        &self,
        meter_id: &str,
        field: WatermarkField,
    ) -> Result<(), RosterError> {
        let pool = self.pool.as_ref().ok_or(RosterError::NoConnection)?;
        let sql = format!(
            "UPDATE {schema}.meters SET {col} = NULL WHERE meter_id = $1",
            schema = self.schema,
            col = field.column_name()
        );
        sqlx::query(sqlx::AssertSqlSafe(sql)).bind(meter_id).execute(pool).await?;
        debug!(meter_id, field = %field, "watermark cleared");
        Ok(())
    }
}

fn map_meter_row(row: &PgRow) -> Result<MeterDescriptor, sqlx::Error> {
    let password_type = row
        .try_get::<Option<String>, _>("password_type")?
        .map(|s| match s.to_lowercase().as_str() {
            "manufacturer" => PasswordKind::Manufacturer,
            _ => PasswordKind::Utility,
        })
        .unwrap_or_default();

    Ok(MeterDescriptor {
        id: row.try_get("id")?,
        meter_id: row.try_get("meter_id")?,
        description: row.try_get("description")?,
        manufacturer: row.try_get("manufacturer")?,
        ip_address: row.try_get("ip_address")?,
        port: u16::try_from(row.try_get::<i32, _>("port")?).unwrap_or(8000),
        use_meter_id: row
            .try_get::<Option<bool>, _>("use_meter_id")?
            .unwrap_or(false),
        timeout: row
            .try_get::<Option<i32>, _>("timeout")?
            .and_then(|v| u32::try_from(v).ok()),
        password: row.try_get("password")?,
        password_type,
        timezone: row.try_get("timezone")?,
        org: row.try_get("org")?,
        is_active: row.try_get("is_active")?,
        list1: interval(row, "list1")?,
        list2: interval(row, "list2")?,
        list3: interval(row, "list3")?,
        list4: interval(row, "list4")?,
        p01: interval(row, "p01")?,
        p02: interval(row, "p02")?,
        p98: interval(row, "p98")?,
        p99: interval(row, "p99")?,
        p200: interval(row, "p200")?,
        p210: interval(row, "p210")?,
        p211: interval(row, "p211")?,
        error: interval(row, "error")?,
        p01_from: row
            .try_get::<Option<DateTime<Utc>>, _>("p01_from")?
            .map(|t| t.timestamp()),
        p98_from: row
            .try_get::<Option<DateTime<Utc>>, _>("p98_from")?
            .map(|t| t.timestamp()),
    })
}

fn interval(row: &PgRow, column: &str) -> Result<u32, sqlx::Error> {
    Ok(row
        .try_get::<Option<i32>, _>(column)?
        .map_or(0, |v| u32::try_from(v).unwrap_or(0)))
}
