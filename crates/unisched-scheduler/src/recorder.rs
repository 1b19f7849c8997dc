use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, error, info, instrument};
use unisched_core::{ExecutionId, InstanceId, ScheduleId};

use crate::db::{init_db, parse_ts, parse_ts_opt, poisoned, ts};
use crate::error::{Result, SchedulerError};
use crate::types::{ExecutionStatus, JobExecution, Pagination, Progress, Trigger};

const COLUMNS: &str = "id, schedule_id, attempt, parent_execution_id, status, trigger_kind,
     scheduled_for, started_at, finished_at, error, result_summary, progress,
     instance_id, created_at";

/// Append-style execution history with state-machine validation.
///
/// Every status change goes through [`ExecutionRecorder::transition`], which
/// refuses moves the state machine does not allow and guards the write with
/// the expected current status, so a terminal row is never rewritten.
pub struct ExecutionRecorder {
    conn: Mutex<Connection>,
}

impl ExecutionRecorder {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a new `Pending` execution.
    #[instrument(skip_all, fields(schedule_id = %schedule_id, attempt = attempt))]
    pub fn create_pending(
        &self,
        schedule_id: &ScheduleId,
        attempt: u32,
        parent: Option<&ExecutionId>,
        trigger: Trigger,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<JobExecution> {
        let execution = JobExecution {
            id: ExecutionId::new(),
            schedule_id: schedule_id.clone(),
            attempt,
            parent_execution_id: parent.cloned(),
            status: ExecutionStatus::Pending,
            trigger,
            scheduled_for,
            started_at: None,
            finished_at: None,
            error: None,
            result_summary: None,
            progress: None,
            instance_id: None,
            created_at: now,
        };

        let conn = self.conn.lock().map_err(poisoned)?;
        conn.execute(
            "INSERT INTO job_executions
                (id, schedule_id, attempt, parent_execution_id, status, trigger_kind,
                 scheduled_for, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                execution.id.as_str(),
                execution.schedule_id.as_str(),
                execution.attempt,
                execution.parent_execution_id.as_ref().map(|p| p.as_str()),
                execution.status.as_str(),
                execution.trigger.as_str(),
                ts(execution.scheduled_for),
                ts(execution.created_at),
            ],
        )?;
        debug!(execution_id = %execution.id, trigger = %trigger, "execution recorded as pending");
        Ok(execution)
    }

    /// `Pending → Running`, stamping the start time and the owning instance.
    pub fn mark_running(
        &self,
        id: &ExecutionId,
        instance_id: &InstanceId,
        now: DateTime<Utc>,
    ) -> Result<JobExecution> {
        self.transition(id, ExecutionStatus::Running, now, Some(instance_id), None, None)
    }

    /// Move a running (or, for `Cancelled`, pending) execution to a terminal status.
    pub fn finish(
        &self,
        id: &ExecutionId,
        status: ExecutionStatus,
        now: DateTime<Utc>,
        error: Option<&str>,
        result_summary: Option<&serde_json::Value>,
    ) -> Result<JobExecution> {
        if !status.is_terminal() {
            return Err(SchedulerError::Validation(format!(
                "finish() requires a terminal status, got {status}"
            )));
        }
        self.transition(id, status, now, None, error, result_summary)
    }

    /// Apply one state-machine move.
    ///
    /// An illegal move is a programming error: it is logged at `error!` and
    /// returned as [`SchedulerError::InvalidTransition`]; nothing is written.
    #[instrument(skip_all, fields(execution_id = %id, to = %to))]
    pub fn transition(
        &self,
        id: &ExecutionId,
        to: ExecutionStatus,
        now: DateTime<Utc>,
        instance_id: Option<&InstanceId>,
        error: Option<&str>,
        result_summary: Option<&serde_json::Value>,
    ) -> Result<JobExecution> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let current = load(&conn, id)?;
        if !current.status.can_transition_to(to) {
            error!(
                execution_id = %id,
                from = %current.status,
                to = %to,
                "rejected invalid execution transition"
            );
            return Err(SchedulerError::InvalidTransition {
                execution_id: id.to_string(),
                from: current.status,
                to,
            });
        }

        let now_s = ts(now);
        let changed = if to == ExecutionStatus::Running {
            conn.execute(
                "UPDATE job_executions SET status = ?1, started_at = ?2, instance_id = ?3
                 WHERE id = ?4 AND status = ?5",
                params![
                    to.as_str(),
                    now_s,
                    instance_id.map(|i| i.as_str()),
                    id.as_str(),
                    current.status.as_str(),
                ],
            )?
        } else {
            let summary = result_summary
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| SchedulerError::Persistence(format!("encode result_summary: {e}")))?;
            conn.execute(
                "UPDATE job_executions SET status = ?1, finished_at = ?2, error = ?3,
                        result_summary = ?4
                 WHERE id = ?5 AND status = ?6",
                params![
                    to.as_str(),
                    now_s,
                    error,
                    summary,
                    id.as_str(),
                    current.status.as_str(),
                ],
            )?
        };

        if changed == 0 {
            // Someone moved the row between our read and the guarded write.
            let actual = load(&conn, id)?;
            error!(
                execution_id = %id,
                from = %actual.status,
                to = %to,
                "lost execution transition race"
            );
            return Err(SchedulerError::InvalidTransition {
                execution_id: id.to_string(),
                from: actual.status,
                to,
            });
        }

        let updated = load(&conn, id)?;
        if to.is_terminal() {
            info!(
                execution_id = %id,
                schedule_id = %updated.schedule_id,
                attempt = updated.attempt,
                status = %to,
                "execution finished"
            );
        }
        Ok(updated)
    }

    /// Store the latest progress report. Ignored once the execution left `Running`.
    pub fn record_progress(&self, id: &ExecutionId, progress: &Progress) -> Result<()> {
        let encoded = serde_json::to_string(progress)
            .map_err(|e| SchedulerError::Persistence(format!("encode progress: {e}")))?;
        let conn = self.conn.lock().map_err(poisoned)?;
        let changed = conn.execute(
            "UPDATE job_executions SET progress = ?1 WHERE id = ?2 AND status = 'running'",
            params![encoded, id.as_str()],
        )?;
        if changed == 0 {
            debug!(execution_id = %id, "progress for an execution that is not running dropped");
        }
        Ok(())
    }

    pub fn get_execution(&self, id: &ExecutionId) -> Result<JobExecution> {
        let conn = self.conn.lock().map_err(poisoned)?;
        load(&conn, id)
    }

    /// History of one schedule, most recent first.
    pub fn list_executions(
        &self,
        schedule_id: &ScheduleId,
        page: Pagination,
    ) -> Result<Vec<JobExecution>> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM job_executions
             WHERE schedule_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt
            .query_map(
                params![schedule_id.as_str(), page.limit as i64, page.offset as i64],
                ExecutionRow::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(ExecutionRow::into_execution).collect()
    }

    pub fn latest_execution(&self, schedule_id: &ScheduleId) -> Result<Option<JobExecution>> {
        Ok(self
            .list_executions(schedule_id, Pagination::new(1, 0))?
            .into_iter()
            .next())
    }

    /// `Pending` executions whose `scheduled_for` has arrived, oldest first.
    pub fn due_pending(&self, now: DateTime<Utc>) -> Result<Vec<JobExecution>> {
        self.select_where(
            "status = 'pending' AND scheduled_for <= ?1 ORDER BY scheduled_for, rowid",
            params![ts(now)],
        )
    }

    /// Every execution currently marked `Running`, across all instances.
    pub fn running_executions(&self) -> Result<Vec<JobExecution>> {
        self.select_where("status = 'running' ORDER BY started_at", params![])
    }

    pub fn running_for(&self, schedule_id: &ScheduleId) -> Result<Vec<JobExecution>> {
        self.select_where(
            "schedule_id = ?1 AND status = 'running'",
            params![schedule_id.as_str()],
        )
    }

    /// Cancel every `Pending` execution of a schedule; returns the cancelled rows.
    #[instrument(skip_all, fields(schedule_id = %schedule_id))]
    pub fn cancel_pending(
        &self,
        schedule_id: &ScheduleId,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobExecution>> {
        let pending = self.select_where(
            "schedule_id = ?1 AND status = 'pending'",
            params![schedule_id.as_str()],
        )?;
        let mut cancelled = Vec::with_capacity(pending.len());
        for execution in pending {
            match self.finish(
                &execution.id,
                ExecutionStatus::Cancelled,
                now,
                Some("schedule deleted"),
                None,
            ) {
                Ok(updated) => cancelled.push(updated),
                // picked up by a dispatcher in the meantime
                Err(SchedulerError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(cancelled)
    }

    /// Delete terminal executions that finished before `cutoff`.
    #[instrument(skip_all, fields(cutoff = %ts(cutoff)))]
    pub fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let removed = conn.execute(
            "DELETE FROM job_executions
             WHERE status IN ('succeeded', 'failed', 'timed_out', 'cancelled')
               AND finished_at IS NOT NULL AND finished_at < ?1",
            params![ts(cutoff)],
        )?;
        if removed > 0 {
            info!(removed, cutoff = %ts(cutoff), "pruned execution history");
        }
        Ok(removed)
    }

    fn select_where(
        &self,
        clause: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<JobExecution>> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let mut stmt =
            conn.prepare(&format!("SELECT {COLUMNS} FROM job_executions WHERE {clause}"))?;
        let rows = stmt
            .query_map(params, ExecutionRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(ExecutionRow::into_execution).collect()
    }
}

fn load(conn: &Connection, id: &ExecutionId) -> Result<JobExecution> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM job_executions WHERE id = ?1"),
        params![id.as_str()],
        ExecutionRow::from_row,
    )
    .optional()?
    .ok_or_else(|| SchedulerError::ExecutionNotFound { id: id.to_string() })?
    .into_execution()
}

/// Raw column values; decoding happens outside the rusqlite closure so that
/// a bad enum or JSON value surfaces as a persistence error.
struct ExecutionRow {
    id: String,
    schedule_id: String,
    attempt: u32,
    parent_execution_id: Option<String>,
    status: String,
    trigger: String,
    scheduled_for: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    error: Option<String>,
    result_summary: Option<String>,
    progress: Option<String>,
    instance_id: Option<String>,
    created_at: String,
}

impl ExecutionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            schedule_id: row.get(1)?,
            attempt: row.get(2)?,
            parent_execution_id: row.get(3)?,
            status: row.get(4)?,
            trigger: row.get(5)?,
            scheduled_for: row.get(6)?,
            started_at: row.get(7)?,
            finished_at: row.get(8)?,
            error: row.get(9)?,
            result_summary: row.get(10)?,
            progress: row.get(11)?,
            instance_id: row.get(12)?,
            created_at: row.get(13)?,
        })
    }

    fn into_execution(self) -> Result<JobExecution> {
        let status = self.status.parse::<ExecutionStatus>().map_err(SchedulerError::Persistence)?;
        let trigger = self.trigger.parse::<Trigger>().map_err(SchedulerError::Persistence)?;
        let result_summary = self
            .result_summary
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| SchedulerError::Persistence(format!("decode result_summary: {e}")))?;
        let progress = self
            .progress
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| SchedulerError::Persistence(format!("decode progress: {e}")))?;
        Ok(JobExecution {
            id: ExecutionId::from(self.id),
            schedule_id: ScheduleId::from(self.schedule_id),
            attempt: self.attempt,
            parent_execution_id: self.parent_execution_id.map(ExecutionId::from),
            status,
            trigger,
            scheduled_for: parse_ts(&self.scheduled_for)?,
            started_at: parse_ts_opt(self.started_at)?,
            finished_at: parse_ts_opt(self.finished_at)?,
            error: self.error,
            result_summary,
            progress,
            instance_id: self.instance_id.map(InstanceId::from),
            created_at: parse_ts(&self.created_at)?,
        })
    }
}
