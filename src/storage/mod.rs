//! SQLite storage layer -- check history records, schema, queries.

pub mod history;
pub mod schema;

use anyhow::Result;
use chrono::{DateTime, Datelike, Local, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::CheckType;

pub use self::history::{HistoryStore, SortOrder, SqliteHistory};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Identifies the history of one check: `(service, check name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckKey {
    pub service: String,
    pub check_name: String,
}

impl CheckKey {
    pub fn new(service: impl Into<String>, check_name: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            check_name: check_name.into(),
        }
    }
}

impl std::fmt::Display for CheckKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service, self.check_name)
    }
}

/// Persisted classification of a history record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Healthy,
    Unhealthy,
    /// Healthy again, right after an unhealthy record.
    WasUnhealthy,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Healthy => "healthy",
            Status::Unhealthy => "unhealthy",
            Status::WasUnhealthy => "was-unhealthy",
        }
    }

    pub fn is_healthy(&self) -> bool {
        !matches!(self, Status::Unhealthy)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "healthy" => Ok(Status::Healthy),
            "unhealthy" => Ok(Status::Unhealthy),
            "was-unhealthy" => Ok(Status::WasUnhealthy),
            other => anyhow::bail!("unknown status '{}'", other),
        }
    }
}

/// One entry in a check's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRecord {
    pub id: Uuid,
    pub service: String,
    pub check_name: String,
    pub created_at: DateTime<Utc>,
    pub day_bucket: u32,
    pub duration_ms: u64,
    pub check_type: CheckType,
    pub output: String,
    pub metric: Option<f64>,
    pub metric_unit: Option<String>,
    pub status: Status,
    pub error: Option<String>,
}

impl CheckRecord {
    pub fn key(&self) -> CheckKey {
        CheckKey::new(&self.service, &self.check_name)
    }
}

/// Local calendar day of `at`, encoded as `yyyymmdd`.
pub fn day_bucket(at: DateTime<Utc>) -> u32 {
    let local = at.with_timezone(&Local);
    // Years before 0 never reach the store.
    local.year().max(0) as u32 * 10_000 + local.month() * 100 + local.day()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [Status::Healthy, Status::Unhealthy, Status::WasUnhealthy] {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
        }
        assert!("inprogress".parse::<Status>().is_err());
        assert!(Status::WasUnhealthy.is_healthy());
        assert!(!Status::Unhealthy.is_healthy());
    }

    #[test]
    fn test_day_bucket_follows_local_calendar_day() {
        let noon = Local.with_ymd_and_hms(2024, 6, 9, 12, 0, 0).unwrap().with_timezone(&Utc);
        assert_eq!(day_bucket(noon), 20240609);
        assert_eq!(day_bucket(noon + Duration::hours(11)), 20240609);
        assert_eq!(day_bucket(noon + Duration::hours(13)), 20240610);
        // Same day-of-month in a different month is a different bucket.
        assert_ne!(day_bucket(noon), day_bucket(noon + Duration::days(31)));
    }

    #[test]
    fn test_open_pool_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patrol.db");
        let pool = open_pool(path.to_str().unwrap()).unwrap();
        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM check_records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
