use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::{Result, SchedulerError};

/// Open a connection to the engine database and apply the pragmas every
/// engine connection relies on.
///
/// WAL plus a busy timeout lets several engine instances (each with several
/// connections) share one file without spurious `SQLITE_BUSY` failures.
pub fn open(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    Ok(conn)
}

/// Private in-memory database, used by tests and by single-process setups
/// that do not need history to survive a restart.
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    // journal_mode returns a row, so it cannot go through execute_batch
    let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    init_db(conn)
}

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `schedules`, `job_executions` and `schedule_leases` tables
/// (idempotent) together with the indexes the dispatcher polls on.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schedules (
            id                  TEXT    NOT NULL PRIMARY KEY,
            owner_domain        TEXT    NOT NULL,
            name                TEXT    NOT NULL DEFAULT '',
            cron_expression     TEXT,               -- NULL for one-shot schedules
            run_at              TEXT,               -- NULL for cron schedules
            timezone            TEXT    NOT NULL,
            enabled             INTEGER NOT NULL DEFAULT 1,
            next_run_at         TEXT,
            last_run_at         TEXT,
            last_status         TEXT,
            last_error          TEXT,
            alert               INTEGER NOT NULL DEFAULT 0,
            concurrency_policy  TEXT    NOT NULL,
            retry_policy        TEXT    NOT NULL,   -- JSON-encoded RetryPolicy
            timeout_ms          INTEGER NOT NULL,
            payload             TEXT    NOT NULL,   -- opaque JSON, domain-owned
            created_at          TEXT    NOT NULL,
            updated_at          TEXT    NOT NULL
        ) STRICT;

        -- Due-set polling: WHERE enabled = 1 AND next_run_at <= ? ORDER BY next_run_at
        CREATE INDEX IF NOT EXISTS idx_schedules_next_run ON schedules (enabled, next_run_at);

        CREATE TABLE IF NOT EXISTS job_executions (
            id                   TEXT    NOT NULL PRIMARY KEY,
            schedule_id          TEXT    NOT NULL,
            attempt              INTEGER NOT NULL,
            parent_execution_id  TEXT,
            status               TEXT    NOT NULL,
            trigger_kind         TEXT    NOT NULL,
            scheduled_for        TEXT    NOT NULL,
            started_at           TEXT,
            finished_at          TEXT,
            error                TEXT,
            result_summary       TEXT,              -- opaque JSON
            progress             TEXT,              -- JSON-encoded Progress
            instance_id          TEXT,
            created_at           TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_executions_schedule
            ON job_executions (schedule_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_executions_status
            ON job_executions (status, scheduled_for);

        CREATE TABLE IF NOT EXISTS schedule_leases (
            schedule_id  TEXT    NOT NULL PRIMARY KEY,
            holder       TEXT    NOT NULL,
            acquired_at  INTEGER NOT NULL,      -- unix millis
            expires_at   INTEGER NOT NULL       -- unix millis
        ) STRICT;
        ",
    )?;
    Ok(())
}

/// Fixed-width RFC3339 (`2024-01-01T00:05:00.000Z`): lexical order in SQLite
/// equals chronological order.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn ts_opt(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(ts)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SchedulerError::Persistence(format!("bad timestamp {s:?}: {e}")))
}

pub(crate) fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

/// Map a poisoned connection mutex to a persistence error instead of panicking.
pub(crate) fn poisoned<T>(_: std::sync::PoisonError<T>) -> SchedulerError {
    SchedulerError::Persistence("connection mutex poisoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn init_db_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('schedules', 'job_executions', 'schedule_leases')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }

    #[test]
    fn timestamps_sort_lexically() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(1);
        let c = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        assert_eq!(ts(a), "2024-01-01T00:05:00.000Z");
        assert!(ts(a) < ts(b));
        assert!(ts(b) < ts(c));
        assert_eq!(parse_ts(&ts(b)).unwrap(), b);
    }
}
