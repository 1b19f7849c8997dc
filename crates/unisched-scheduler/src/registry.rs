use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, instrument};
use unisched_core::config::{MAX_PAYLOAD_BYTES, MAX_TIMEOUT_MS};
use unisched_core::ScheduleId;

use crate::db::{init_db, parse_ts, parse_ts_opt, poisoned, ts, ts_opt};
use crate::error::{Result, SchedulerError};
use crate::handler::DomainHandler;
use crate::retry::validate_policy;
use crate::schedule::initial_next_run;
use crate::types::{
    ConcurrencyPolicy, ExecutionStatus, OwnerDomain, RetryPolicy, ScheduleDefinition,
    ScheduleFilter, ScheduleSpec,
};

const COLUMNS: &str = "id, owner_domain, name, cron_expression, run_at, timezone, enabled,
     next_run_at, last_run_at, last_status, last_error, alert, concurrency_policy,
     retry_policy, timeout_ms, payload, created_at, updated_at";

/// Change to a schedule's alert flag when recording an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertUpdate {
    Keep,
    Raise,
    Clear,
}

/// Persistent schedule definitions plus the per-domain handler table.
pub struct ScheduleRegistry {
    conn: Mutex<Connection>,
    handlers: RwLock<HashMap<OwnerDomain, Arc<dyn DomainHandler>>>,
}

impl ScheduleRegistry {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            handlers: RwLock::new(HashMap::new()),
        })
    }

    /// Register the handler for `domain`. Each domain gets exactly one.
    pub fn register_domain(
        &self,
        domain: OwnerDomain,
        handler: Arc<dyn DomainHandler>,
    ) -> Result<()> {
        let mut handlers = self.handlers.write().map_err(poisoned)?;
        if handlers.contains_key(&domain) {
            return Err(SchedulerError::DomainAlreadyRegistered {
                domain: domain.to_string(),
            });
        }
        handlers.insert(domain, handler);
        info!(domain = %domain, "domain handler registered");
        Ok(())
    }

    pub fn get_handler(&self, domain: OwnerDomain) -> Result<Arc<dyn DomainHandler>> {
        self.handlers
            .read()
            .map_err(poisoned)?
            .get(&domain)
            .cloned()
            .ok_or_else(|| SchedulerError::DomainNotRegistered {
                domain: domain.to_string(),
            })
    }

    /// Create or replace a schedule definition.
    ///
    /// Timing fields, retry policy and payload are validated before anything
    /// is written. Updating an existing id keeps its run history fields
    /// (`last_*`, `alert`, `created_at`) and recomputes `next_run_at` as of `now`.
    #[instrument(skip_all, fields(owner_domain = %spec.owner_domain))]
    pub fn upsert(&self, spec: ScheduleSpec, now: DateTime<Utc>) -> Result<ScheduleDefinition> {
        let next_run_at = initial_next_run(&spec, now)?;
        validate_policy(&spec.retry_policy)?;
        validate_payload(&spec.payload)?;
        if spec.timeout_ms == 0 || spec.timeout_ms > MAX_TIMEOUT_MS {
            return Err(SchedulerError::Validation(format!(
                "timeout_ms must be within 1..={MAX_TIMEOUT_MS}, got {}",
                spec.timeout_ms
            )));
        }
        let timeout_ms = i64::try_from(spec.timeout_ms)
            .map_err(|_| SchedulerError::Validation("timeout_ms out of range".to_string()))?;

        let retry_json = encode(&spec.retry_policy, "retry_policy")?;
        let payload_json = encode(&spec.payload, "payload")?;
        let id = spec.id.clone().unwrap_or_default();

        let conn = self.conn.lock().map_err(poisoned)?;
        conn.execute(
            "INSERT INTO schedules
                (id, owner_domain, name, cron_expression, run_at, timezone, enabled,
                 next_run_at, concurrency_policy, retry_policy, timeout_ms, payload,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
             ON CONFLICT(id) DO UPDATE SET
                 owner_domain = excluded.owner_domain,
                 name = excluded.name,
                 cron_expression = excluded.cron_expression,
                 run_at = excluded.run_at,
                 timezone = excluded.timezone,
                 enabled = excluded.enabled,
                 next_run_at = excluded.next_run_at,
                 concurrency_policy = excluded.concurrency_policy,
                 retry_policy = excluded.retry_policy,
                 timeout_ms = excluded.timeout_ms,
                 payload = excluded.payload,
                 updated_at = excluded.updated_at",
            params![
                id.as_str(),
                spec.owner_domain.as_str(),
                spec.name,
                spec.cron_expression,
                ts_opt(spec.run_at),
                spec.timezone,
                spec.enabled,
                ts(next_run_at),
                spec.concurrency_policy.as_str(),
                retry_json,
                timeout_ms,
                payload_json,
                ts(now),
            ],
        )?;
        let schedule = load(&conn, &id)?;
        info!(
            schedule_id = %id,
            next_run_at = %ts(next_run_at),
            enabled = schedule.enabled,
            "schedule upserted"
        );
        Ok(schedule)
    }

    /// Stop new dispatch. An execution already running is left alone.
    #[instrument(skip_all, fields(schedule_id = %id))]
    pub fn pause(&self, id: &ScheduleId, now: DateTime<Utc>) -> Result<ScheduleDefinition> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let changed = conn.execute(
            "UPDATE schedules SET enabled = 0, updated_at = ?1 WHERE id = ?2",
            params![ts(now), id.as_str()],
        )?;
        if changed == 0 {
            return Err(not_found(id));
        }
        info!(schedule_id = %id, "schedule paused");
        load(&conn, id)
    }

    /// Re-enable dispatch and clear the alert state.
    ///
    /// A cron schedule's `next_run_at` is recomputed from `now`, so firings
    /// missed while paused are not replayed. A one-shot that already fired
    /// cannot be resumed; upsert it with a new `run_at` instead.
    #[instrument(skip_all, fields(schedule_id = %id))]
    pub fn resume(&self, id: &ScheduleId, now: DateTime<Utc>) -> Result<ScheduleDefinition> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let current = load(&conn, id)?;
        let next_run_at = match (&current.cron_expression, current.run_at) {
            (Some(expr), _) => crate::schedule::next_fire_time(expr, &current.timezone, now)?,
            (None, Some(at)) if current.last_run_at.is_none() => at,
            _ => {
                return Err(SchedulerError::Validation(format!(
                    "one-shot schedule {id} already fired; upsert a new run_at to re-arm it"
                )))
            }
        };
        conn.execute(
            "UPDATE schedules SET enabled = 1, alert = 0, next_run_at = ?1, updated_at = ?2
             WHERE id = ?3",
            params![ts(next_run_at), ts(now), id.as_str()],
        )?;
        info!(schedule_id = %id, next_run_at = %ts(next_run_at), "schedule resumed");
        load(&conn, id)
    }

    /// Pull the next firing forward to `now`, so whichever engine ticks next
    /// dispatches it. Used by operators that have no handler table of their own.
    #[instrument(skip_all, fields(schedule_id = %id))]
    pub fn mark_due(&self, id: &ScheduleId, now: DateTime<Utc>) -> Result<ScheduleDefinition> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let current = load(&conn, id)?;
        if !current.enabled {
            return Err(SchedulerError::Validation(format!(
                "schedule {id} is disabled; resume it first"
            )));
        }
        conn.execute(
            "UPDATE schedules SET next_run_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![ts(now), id.as_str()],
        )?;
        info!(schedule_id = %id, "schedule marked due");
        load(&conn, id)
    }

    /// Remove the definition. Its execution history stays until pruned.
    #[instrument(skip_all, fields(schedule_id = %id))]
    pub fn delete(&self, id: &ScheduleId) -> Result<()> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let changed = conn.execute("DELETE FROM schedules WHERE id = ?1", params![id.as_str()])?;
        if changed == 0 {
            return Err(not_found(id));
        }
        info!(schedule_id = %id, "schedule deleted");
        Ok(())
    }

    pub fn get(&self, id: &ScheduleId) -> Result<ScheduleDefinition> {
        let conn = self.conn.lock().map_err(poisoned)?;
        load(&conn, id)
    }

    pub fn exists(&self, id: &ScheduleId) -> Result<bool> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM schedules WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Schedules matching `filter`, oldest first.
    pub fn list(&self, filter: &ScheduleFilter) -> Result<Vec<ScheduleDefinition>> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM schedules
             WHERE (?1 IS NULL OR owner_domain = ?1)
               AND (?2 IS NULL OR enabled = ?2)
               AND (?3 IS NULL OR alert = ?3)
             ORDER BY created_at, rowid"
        ))?;
        let rows = stmt
            .query_map(
                params![
                    filter.owner_domain.map(|d| d.as_str()),
                    filter.enabled,
                    filter.alerting,
                ],
                ScheduleRow::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(ScheduleRow::into_schedule).collect()
    }

    /// Enabled schedules with `next_run_at <= now`, earliest first.
    pub fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleDefinition>> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM schedules
             WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1
             ORDER BY next_run_at, rowid"
        ))?;
        let rows = stmt
            .query_map(params![ts(now)], ScheduleRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(ScheduleRow::into_schedule).collect()
    }

    /// Claim the firing at `expected_next` by moving `next_run_at` on.
    ///
    /// Compare-and-set on `next_run_at`: returns `false` when another
    /// instance (or an earlier tick) already claimed this firing. A `None`
    /// successor disables the schedule (one-shot). `last_run_at` is stamped.
    #[instrument(skip_all, fields(schedule_id = %id))]
    pub fn claim_firing(
        &self,
        id: &ScheduleId,
        expected_next: DateTime<Utc>,
        new_next: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let changed = conn.execute(
            "UPDATE schedules
             SET next_run_at = ?1,
                 enabled = CASE WHEN ?1 IS NULL THEN 0 ELSE enabled END,
                 last_run_at = ?2,
                 updated_at = ?2
             WHERE id = ?3 AND enabled = 1 AND next_run_at = ?4",
            params![ts_opt(new_next), ts(now), id.as_str(), ts(expected_next)],
        )?;
        debug!(schedule_id = %id, claimed = changed == 1, "claim firing");
        Ok(changed == 1)
    }

    /// Stamp the outcome of the latest finished execution on the schedule.
    /// A schedule deleted in the meantime is silently ignored.
    pub fn record_outcome(
        &self,
        id: &ScheduleId,
        status: ExecutionStatus,
        error: Option<&str>,
        alert: AlertUpdate,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let alert_sql = match alert {
            AlertUpdate::Keep => "alert",
            AlertUpdate::Raise => "1",
            AlertUpdate::Clear => "0",
        };
        let conn = self.conn.lock().map_err(poisoned)?;
        conn.execute(
            &format!(
                "UPDATE schedules SET last_status = ?1, last_error = ?2, alert = {alert_sql},
                        updated_at = ?3
                 WHERE id = ?4"
            ),
            params![status.as_str(), error, ts(now), id.as_str()],
        )?;
        Ok(())
    }
}

/// Payloads are opaque to the engine but must be JSON containers (or null)
/// and bounded in size.
pub fn validate_payload(payload: &serde_json::Value) -> Result<()> {
    match payload {
        serde_json::Value::Null | serde_json::Value::Object(_) | serde_json::Value::Array(_) => {}
        other => {
            return Err(SchedulerError::Validation(format!(
                "payload must be a JSON object, array or null, got {}",
                json_kind(other)
            )))
        }
    }
    let size = serde_json::to_vec(payload)
        .map_err(|e| SchedulerError::Validation(format!("payload is not serialisable: {e}")))?
        .len();
    if size > MAX_PAYLOAD_BYTES {
        return Err(SchedulerError::Validation(format!(
            "payload is {size} bytes, limit is {MAX_PAYLOAD_BYTES}"
        )));
    }
    Ok(())
}

fn json_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

fn encode<T: serde::Serialize>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| SchedulerError::Persistence(format!("encode {what}: {e}")))
}

fn not_found(id: &ScheduleId) -> SchedulerError {
    SchedulerError::ScheduleNotFound { id: id.to_string() }
}

fn load(conn: &Connection, id: &ScheduleId) -> Result<ScheduleDefinition> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM schedules WHERE id = ?1"),
        params![id.as_str()],
        ScheduleRow::from_row,
    )
    .optional()?
    .ok_or_else(|| not_found(id))?
    .into_schedule()
}

struct ScheduleRow {
    id: String,
    owner_domain: String,
    name: String,
    cron_expression: Option<String>,
    run_at: Option<String>,
    timezone: String,
    enabled: bool,
    next_run_at: Option<String>,
    last_run_at: Option<String>,
    last_status: Option<String>,
    last_error: Option<String>,
    alert: bool,
    concurrency_policy: String,
    retry_policy: String,
    timeout_ms: i64,
    payload: String,
    created_at: String,
    updated_at: String,
}

impl ScheduleRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_domain: row.get(1)?,
            name: row.get(2)?,
            cron_expression: row.get(3)?,
            run_at: row.get(4)?,
            timezone: row.get(5)?,
            enabled: row.get(6)?,
            next_run_at: row.get(7)?,
            last_run_at: row.get(8)?,
            last_status: row.get(9)?,
            last_error: row.get(10)?,
            alert: row.get(11)?,
            concurrency_policy: row.get(12)?,
            retry_policy: row.get(13)?,
            timeout_ms: row.get(14)?,
            payload: row.get(15)?,
            created_at: row.get(16)?,
            updated_at: row.get(17)?,
        })
    }

    fn into_schedule(self) -> Result<ScheduleDefinition> {
        let retry_policy: RetryPolicy = serde_json::from_str(&self.retry_policy)
            .map_err(|e| SchedulerError::Persistence(format!("decode retry_policy: {e}")))?;
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| SchedulerError::Persistence(format!("decode payload: {e}")))?;
        let last_status = self
            .last_status
            .as_deref()
            .map(str::parse::<ExecutionStatus>)
            .transpose()
            .map_err(SchedulerError::Persistence)?;
        Ok(ScheduleDefinition {
            id: ScheduleId::from(self.id),
            owner_domain: self
                .owner_domain
                .parse::<OwnerDomain>()
                .map_err(SchedulerError::Persistence)?,
            name: self.name,
            cron_expression: self.cron_expression,
            run_at: parse_ts_opt(self.run_at)?,
            timezone: self.timezone,
            enabled: self.enabled,
            next_run_at: parse_ts_opt(self.next_run_at)?,
            last_run_at: parse_ts_opt(self.last_run_at)?,
            last_status,
            last_error: self.last_error,
            alert: self.alert,
            concurrency_policy: self
                .concurrency_policy
                .parse::<ConcurrencyPolicy>()
                .map_err(SchedulerError::Persistence)?,
            retry_policy,
            timeout_ms: u64::try_from(self.timeout_ms).map_err(|_| {
                SchedulerError::Persistence(format!("negative timeout_ms {}", self.timeout_ms))
            })?,
            payload,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use crate::handler::{ExecutionContext, HandlerError};
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct Noop;

    #[async_trait]
    impl DomainHandler for Noop {
        async fn execute(
            &self,
            _payload: serde_json::Value,
            _ctx: ExecutionContext,
        ) -> std::result::Result<Option<serde_json::Value>, HandlerError> {
            Ok(None)
        }
    }

    fn registry() -> ScheduleRegistry {
        ScheduleRegistry::new(open_in_memory().unwrap()).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn mins(n: i64) -> chrono::Duration {
        chrono::Duration::minutes(n)
    }

    #[test]
    fn every_five_minutes_from_midnight() {
        let reg = registry();
        let s = reg
            .upsert(ScheduleSpec::cron(OwnerDomain::DataSync, "*/5 * * * *"), t0())
            .unwrap();
        assert_eq!(s.next_run_at, Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap()));
        assert_eq!(s.timezone, "UTC");
        assert!(s.enabled);
        assert_eq!(s.created_at, t0());
    }

    #[test]
    fn duplicate_domain_registration_is_rejected() {
        let reg = registry();
        reg.register_domain(OwnerDomain::Notebook, Arc::new(Noop)).unwrap();
        let err = reg
            .register_domain(OwnerDomain::Notebook, Arc::new(Noop))
            .unwrap_err();
        assert_eq!(err.code(), "DOMAIN_ALREADY_REGISTERED");
        assert!(reg.get_handler(OwnerDomain::Notebook).is_ok());
        assert!(matches!(
            reg.get_handler(OwnerDomain::Export),
            Err(SchedulerError::DomainNotRegistered { .. })
        ));
    }

    #[test]
    fn invalid_specs_are_rejected_before_persisting() {
        let reg = registry();
        let bad = [
            ScheduleSpec::cron(OwnerDomain::Workflow, "*/5 * *"),
            ScheduleSpec::cron(OwnerDomain::Workflow, "0 * * * *").with_timezone("Mars/Olympus"),
            ScheduleSpec::cron(OwnerDomain::Workflow, "0 * * * *")
                .with_payload(serde_json::json!(42)),
            ScheduleSpec::cron(OwnerDomain::Workflow, "0 * * * *").with_timeout_ms(0),
            ScheduleSpec::cron(OwnerDomain::Workflow, "0 * * * *").with_timeout_ms(u64::MAX),
            ScheduleSpec::cron(OwnerDomain::Workflow, "0 * * * *")
                .with_timeout_ms(MAX_TIMEOUT_MS + 1),
            ScheduleSpec::cron(OwnerDomain::Workflow, "0 * * * *").with_retry(RetryPolicy {
                max_attempts: 0,
                ..RetryPolicy::default()
            }),
            ScheduleSpec {
                run_at: Some(t0()),
                ..ScheduleSpec::cron(OwnerDomain::Workflow, "0 * * * *")
            },
        ];
        for spec in bad {
            let err = reg.upsert(spec, t0()).unwrap_err();
            assert_eq!(err.code(), "VALIDATION_ERROR", "{err}");
        }
        assert!(reg.list(&ScheduleFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn longest_timeout_survives_storage() {
        let reg = registry();
        let s = reg
            .upsert(
                ScheduleSpec::cron(OwnerDomain::Workflow, "0 * * * *")
                    .with_timeout_ms(MAX_TIMEOUT_MS),
                t0(),
            )
            .unwrap();
        assert_eq!(reg.get(&s.id).unwrap().timeout_ms, MAX_TIMEOUT_MS);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let big = serde_json::json!({ "blob": "x".repeat(MAX_PAYLOAD_BYTES) });
        assert!(validate_payload(&big).is_err());
        assert!(validate_payload(&serde_json::json!([1, 2])).is_ok());
        assert!(validate_payload(&serde_json::Value::Null).is_ok());
    }

    #[test]
    fn update_preserves_history_fields() {
        let reg = registry();
        let s = reg
            .upsert(ScheduleSpec::cron(OwnerDomain::Import, "0 * * * *"), t0())
            .unwrap();
        reg.record_outcome(&s.id, ExecutionStatus::Failed, Some("boom"), AlertUpdate::Raise, t0())
            .unwrap();

        let updated = reg
            .upsert(
                ScheduleSpec::cron(OwnerDomain::Import, "30 * * * *")
                    .with_id(s.id.clone())
                    .with_name("hourly import"),
                t0() + mins(1),
            )
            .unwrap();
        assert_eq!(updated.id, s.id);
        assert_eq!(updated.name, "hourly import");
        assert_eq!(updated.next_run_at, Some(t0() + mins(30)));
        assert_eq!(updated.last_status, Some(ExecutionStatus::Failed));
        assert_eq!(updated.last_error.as_deref(), Some("boom"));
        assert!(updated.alert);
        assert_eq!(updated.created_at, t0());
        assert_eq!(updated.updated_at, t0() + mins(1));
    }

    #[test]
    fn due_set_respects_enabled_and_order() {
        let reg = registry();
        let late = reg
            .upsert(ScheduleSpec::cron(OwnerDomain::Export, "10 * * * *"), t0())
            .unwrap();
        let early = reg
            .upsert(ScheduleSpec::cron(OwnerDomain::Export, "5 * * * *"), t0())
            .unwrap();
        reg.upsert(ScheduleSpec::cron(OwnerDomain::Export, "1 * * * *").disabled(), t0())
            .unwrap();

        assert!(reg.due_schedules(t0() + mins(4)).unwrap().is_empty());
        let due: Vec<_> = reg
            .due_schedules(t0() + mins(10))
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(due, vec![early.id, late.id]);
    }

    #[test]
    fn pause_and_resume() {
        let reg = registry();
        let s = reg
            .upsert(ScheduleSpec::cron(OwnerDomain::Automation, "*/5 * * * *"), t0())
            .unwrap();
        reg.pause(&s.id, t0()).unwrap();
        assert!(reg.due_schedules(t0() + mins(5)).unwrap().is_empty());

        reg.record_outcome(&s.id, ExecutionStatus::Failed, None, AlertUpdate::Raise, t0())
            .unwrap();
        let resumed = reg.resume(&s.id, t0() + mins(12)).unwrap();
        assert!(resumed.enabled);
        assert!(!resumed.alert);
        assert_eq!(resumed.next_run_at, Some(t0() + mins(15)));
    }

    #[test]
    fn claim_is_compare_and_set() {
        let reg = registry();
        let s = reg
            .upsert(ScheduleSpec::cron(OwnerDomain::DataSync, "*/5 * * * *"), t0())
            .unwrap();
        let due = t0() + mins(5);
        assert!(reg.claim_firing(&s.id, due, Some(t0() + mins(10)), due).unwrap());
        assert!(!reg.claim_firing(&s.id, due, Some(t0() + mins(10)), due).unwrap());
        let after = reg.get(&s.id).unwrap();
        assert_eq!(after.next_run_at, Some(t0() + mins(10)));
        assert_eq!(after.last_run_at, Some(due));
    }

    #[test]
    fn one_shot_disables_itself_once_claimed() {
        let reg = registry();
        let at = t0() + mins(1);
        let s = reg.upsert(ScheduleSpec::once(OwnerDomain::Import, at), t0()).unwrap();
        assert_eq!(s.next_run_at, Some(at));
        assert!(reg.claim_firing(&s.id, at, None, at).unwrap());

        let fired = reg.get(&s.id).unwrap();
        assert!(!fired.enabled);
        assert_eq!(fired.next_run_at, None);
        assert!(reg.due_schedules(at + mins(60)).unwrap().is_empty());
        assert!(matches!(
            reg.resume(&s.id, at),
            Err(SchedulerError::Validation(_))
        ));
    }

    #[test]
    fn mark_due_pulls_next_firing_forward() {
        let reg = registry();
        let s = reg
            .upsert(ScheduleSpec::cron(OwnerDomain::Notebook, "0 0 * * *"), t0())
            .unwrap();
        assert!(reg.due_schedules(t0() + mins(1)).unwrap().is_empty());
        reg.mark_due(&s.id, t0() + mins(1)).unwrap();
        assert_eq!(reg.due_schedules(t0() + mins(1)).unwrap().len(), 1);

        reg.pause(&s.id, t0()).unwrap();
        assert!(matches!(
            reg.mark_due(&s.id, t0()),
            Err(SchedulerError::Validation(_))
        ));
    }

    #[test]
    fn list_filters() {
        let reg = registry();
        reg.upsert(ScheduleSpec::cron(OwnerDomain::Notebook, "0 * * * *"), t0())
            .unwrap();
        let wf = reg
            .upsert(ScheduleSpec::cron(OwnerDomain::Workflow, "0 * * * *").disabled(), t0())
            .unwrap();
        reg.record_outcome(&wf.id, ExecutionStatus::Failed, None, AlertUpdate::Raise, t0())
            .unwrap();

        let by_domain = reg
            .list(&ScheduleFilter {
                owner_domain: Some(OwnerDomain::Workflow),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_domain.len(), 1);
        let enabled = reg
            .list(&ScheduleFilter {
                enabled: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].owner_domain, OwnerDomain::Notebook);
        let alerting = reg
            .list(&ScheduleFilter {
                alerting: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(alerting.len(), 1);
        assert_eq!(alerting[0].id, wf.id);
    }

    #[test]
    fn delete_missing_schedule_is_not_found() {
        let reg = registry();
        let s = reg
            .upsert(ScheduleSpec::cron(OwnerDomain::Export, "0 * * * *"), t0())
            .unwrap();
        reg.delete(&s.id).unwrap();
        assert!(!reg.exists(&s.id).unwrap());
        assert_eq!(reg.delete(&s.id).unwrap_err().code(), "SCHEDULE_NOT_FOUND");
    }
}
