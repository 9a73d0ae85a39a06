//! Time-ordered check history, keyed by `(service, check name)`.
//!
//! The executor only talks to the [`HistoryStore`] trait. Every call is a
//! single statement, so each one is atomic on its own. Read-then-write
//! sequences for one key are safe because runs of the same check never
//! overlap; runs of different checks touch disjoint rows.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use uuid::Uuid;

use super::{CheckKey, CheckRecord, Pool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Oldest first.
    Ascending,
    /// Newest first.
    Descending,
}

impl SortOrder {
    fn sql(&self) -> &'static str {
        match self {
            SortOrder::Ascending => "created_at ASC, rowid ASC",
            SortOrder::Descending => "created_at DESC, rowid DESC",
        }
    }
}

#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append a new record.
    async fn insert(&self, record: &CheckRecord) -> Result<()>;

    /// Refresh the timestamp of an existing record.
    async fn update_in_place(&self, id: Uuid, created_at: DateTime<Utc>) -> Result<()>;

    /// Most recent record for `key`, optionally restricted to one day bucket.
    async fn find_latest(&self, key: &CheckKey, day_bucket: Option<u32>) -> Result<Option<CheckRecord>>;

    async fn find_range(&self, key: &CheckKey, order: SortOrder, limit: usize) -> Result<Vec<CheckRecord>>;

    async fn count(&self, key: &CheckKey) -> Result<usize>;

    /// Delete records by id, returning how many were removed.
    async fn delete_many(&self, ids: &[Uuid]) -> Result<usize>;
}

/// [`HistoryStore`] backed by the `check_records` table.
#[derive(Clone)]
pub struct SqliteHistory {
    pool: Pool,
}

impl SqliteHistory {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .context("history query task failed")?
    }
}

const COLUMNS: &str = "id, service, check_name, created_at, day_bucket, duration_ms, \
                       check_type, output, metric, metric_unit, status, error";

struct RawRecord {
    id: String,
    service: String,
    check_name: String,
    created_at: i64,
    day_bucket: i64,
    duration_ms: i64,
    check_type: String,
    output: String,
    metric: Option<f64>,
    metric_unit: Option<String>,
    status: String,
    error: Option<String>,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            service: row.get(1)?,
            check_name: row.get(2)?,
            created_at: row.get(3)?,
            day_bucket: row.get(4)?,
            duration_ms: row.get(5)?,
            check_type: row.get(6)?,
            output: row.get(7)?,
            metric: row.get(8)?,
            metric_unit: row.get(9)?,
            status: row.get(10)?,
            error: row.get(11)?,
        })
    }
}

impl TryFrom<RawRecord> for CheckRecord {
    type Error = anyhow::Error;

    fn try_from(raw: RawRecord) -> Result<Self> {
        Ok(CheckRecord {
            id: Uuid::parse_str(&raw.id).with_context(|| format!("bad record id '{}'", raw.id))?,
            created_at: DateTime::from_timestamp_millis(raw.created_at)
                .with_context(|| format!("bad timestamp {} on record {}", raw.created_at, raw.id))?,
            day_bucket: u32::try_from(raw.day_bucket)?,
            duration_ms: u64::try_from(raw.duration_ms)?,
            check_type: raw.check_type.parse().map_err(anyhow::Error::msg)?,
            status: raw.status.parse()?,
            service: raw.service,
            check_name: raw.check_name,
            output: raw.output,
            metric: raw.metric,
            metric_unit: raw.metric_unit,
            error: raw.error,
        })
    }
}

fn collect(rows: Vec<RawRecord>) -> Result<Vec<CheckRecord>> {
    rows.into_iter().map(CheckRecord::try_from).collect()
}

#[async_trait::async_trait]
impl HistoryStore for SqliteHistory {
    async fn insert(&self, record: &CheckRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!("INSERT INTO check_records ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"),
                params![
                    record.id.to_string(),
                    record.service,
                    record.check_name,
                    record.created_at.timestamp_millis(),
                    record.day_bucket,
                    record.duration_ms as i64,
                    record.check_type.to_string(),
                    record.output,
                    record.metric,
                    record.metric_unit,
                    record.status.as_str(),
                    record.error,
                ],
            )
            .context("Failed to insert check record")?;
            Ok(())
        })
        .await
    }

    async fn update_in_place(&self, id: Uuid, created_at: DateTime<Utc>) -> Result<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE check_records SET created_at = ?1 WHERE id = ?2",
                params![created_at.timestamp_millis(), id.to_string()],
            )?;
            if changed == 0 {
                anyhow::bail!("check record {} not found", id);
            }
            Ok(())
        })
        .await
    }

    async fn find_latest(&self, key: &CheckKey, day_bucket: Option<u32>) -> Result<Option<CheckRecord>> {
        let key = key.clone();
        let raw = self
            .with_conn(move |conn| {
                let order = SortOrder::Descending.sql();
                let raw = match day_bucket {
                    Some(day) => conn
                        .query_row(
                            &format!(
                                "SELECT {COLUMNS} FROM check_records
                                 WHERE service = ?1 AND check_name = ?2 AND day_bucket = ?3
                                 ORDER BY {order} LIMIT 1"
                            ),
                            params![key.service, key.check_name, day],
                            RawRecord::from_row,
                        )
                        .optional()?,
                    None => conn
                        .query_row(
                            &format!(
                                "SELECT {COLUMNS} FROM check_records
                                 WHERE service = ?1 AND check_name = ?2
                                 ORDER BY {order} LIMIT 1"
                            ),
                            params![key.service, key.check_name],
                            RawRecord::from_row,
                        )
                        .optional()?,
                };
                Ok(raw)
            })
            .await?;

        raw.map(CheckRecord::try_from).transpose()
    }

    async fn find_range(&self, key: &CheckKey, order: SortOrder, limit: usize) -> Result<Vec<CheckRecord>> {
        let key = key.clone();
        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM check_records
                     WHERE service = ?1 AND check_name = ?2
                     ORDER BY {} LIMIT ?3",
                    order.sql()
                ))?;
                let rows = stmt
                    .query_map(
                        params![key.service, key.check_name, limit as i64],
                        RawRecord::from_row,
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await?;

        collect(rows)
    }

    async fn count(&self, key: &CheckKey) -> Result<usize> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM check_records WHERE service = ?1 AND check_name = ?2",
                params![key.service, key.check_name],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    async fn delete_many(&self, ids: &[Uuid]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        self.with_conn(move |conn| {
            let placeholders = vec!["?"; ids.len()].join(", ");
            let deleted = conn.execute(
                &format!("DELETE FROM check_records WHERE id IN ({placeholders})"),
                params_from_iter(ids.iter()),
            )?;
            Ok(deleted)
        })
        .await
    }
}
