//! SQLite storage layer -- schema, pool, and the query surface used by
//! ingestion and detection.

pub mod schema;

use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use uuid::Uuid;

use crate::ingest::NewLogRecord;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Timestamps are stored as UTC `YYYY-MM-DD HH:MM:SS` text so that SQLite's
/// datetime functions and plain string comparison agree.
const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub(crate) fn fmt_ts(t: DateTime<Utc>) -> String {
    t.format(TS_FORMAT).to_string()
}

pub(crate) fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TS_FORMAT)
        .ok()
        .map(|n| n.and_utc())
}

/// Write a batch of log records in a single transaction.
/// Records land in arrival order; row ids are assigned here.
pub fn insert_logs(pool: &Pool, batch: &[NewLogRecord]) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }

    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO logs (service_id, level, message, metadata_json, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for rec in batch {
            stmt.execute(params![
                rec.service_id,
                rec.level.to_string(),
                rec.message,
                serde_json::to_string(&rec.metadata)?,
                fmt_ts(rec.timestamp),
            ])?;
        }
    }
    tx.commit()?;

    Ok(())
}

/// Per-minute ERROR counts in `[since, until)`, newest bucket first.
/// Served by the (level, timestamp) index.
pub fn error_minute_buckets(
    pool: &Pool,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<(String, i64)>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT strftime('%Y-%m-%d %H:%M', timestamp) AS minute, COUNT(*)
         FROM logs
         WHERE level = 'ERROR' AND timestamp >= ?1 AND timestamp < ?2
         GROUP BY minute
         ORDER BY minute DESC",
    )?;

    let rows = stmt.query_map(params![fmt_ts(since), fmt_ts(until)], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut buckets = Vec::new();
    for r in rows {
        buckets.push(r?);
    }
    Ok(buckets)
}

/// Count ERROR records since `cutoff` that are not yet attributed to any
/// incident. The exclusion is what keeps repeated detection ticks from
/// re-flagging an already-handled burst.
pub fn count_uncorrelated_errors(pool: &Pool, cutoff: DateTime<Utc>) -> Result<i64> {
    let conn = pool.get()?;
    let count = conn.query_row(
        "SELECT COUNT(*) FROM logs
         WHERE level = 'ERROR' AND timestamp >= ?1 AND incident_id IS NULL",
        params![fmt_ts(cutoff)],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Attribute every still-uncorrelated ERROR record since `cutoff` to the
/// given incident, in one bulk update. Returns the number of rows updated.
pub fn correlate_errors(pool: &Pool, cutoff: DateTime<Utc>, incident_id: &Uuid) -> Result<usize> {
    let conn = pool.get()?;
    let updated = conn.execute(
        "UPDATE logs SET incident_id = ?1
         WHERE level = 'ERROR' AND timestamp >= ?2 AND incident_id IS NULL",
        params![incident_id.to_string(), fmt_ts(cutoff)],
    )?;
    Ok(updated)
}
