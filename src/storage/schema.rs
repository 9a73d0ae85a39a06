//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS check_records (
            id TEXT PRIMARY KEY,
            service TEXT NOT NULL,
            check_name TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            day_bucket INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL,
            check_type TEXT NOT NULL,
            output TEXT NOT NULL DEFAULT '',
            metric REAL,
            metric_unit TEXT,
            status TEXT NOT NULL,
            error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_check_records_key_created
            ON check_records(service, check_name, created_at);
        CREATE INDEX IF NOT EXISTS idx_check_records_key_day
            ON check_records(service, check_name, day_bucket);

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM check_records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error
    }
}
