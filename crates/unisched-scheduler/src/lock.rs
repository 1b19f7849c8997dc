use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, instrument};
use unisched_core::{InstanceId, ScheduleId};

use crate::db::{init_db, poisoned};
use crate::error::{Result, SchedulerError};

/// A live lease row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub schedule_id: ScheduleId,
    pub holder: InstanceId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Cross-instance mutual exclusion for schedule dispatch.
///
/// A lease is a row in `schedule_leases` keyed by schedule id. Acquisition is
/// a single conditional upsert, so two instances racing on the same file see
/// exactly one winner. Leases expire on their own, which lets a crashed
/// holder's schedules be reclaimed without operator action. The holder
/// refreshes the lease by heartbeat while work is in flight.
pub struct LockManager {
    conn: Mutex<Connection>,
}

impl LockManager {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Try to take (or, for the current holder, extend) the lease.
    ///
    /// Succeeds when no lease exists, the existing one has expired, or
    /// `holder` already owns it. A re-acquire never shortens an existing lease.
    #[instrument(skip_all, fields(schedule_id = %schedule_id, holder = %holder))]
    pub fn try_acquire(
        &self,
        schedule_id: &ScheduleId,
        holder: &InstanceId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now_ms = now.timestamp_millis();
        let expires_ms = now_ms + ttl_ms(ttl);
        let conn = self.conn.lock().map_err(poisoned)?;
        let changed = conn.execute(
            "INSERT INTO schedule_leases (schedule_id, holder, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(schedule_id) DO UPDATE SET
                 acquired_at = CASE WHEN schedule_leases.holder = excluded.holder
                                    THEN schedule_leases.acquired_at
                                    ELSE excluded.acquired_at END,
                 expires_at  = CASE WHEN schedule_leases.holder = excluded.holder
                                    THEN MAX(schedule_leases.expires_at, excluded.expires_at)
                                    ELSE excluded.expires_at END,
                 holder      = excluded.holder
             WHERE schedule_leases.holder = excluded.holder
                OR schedule_leases.expires_at <= ?3",
            rusqlite::params![schedule_id.as_str(), holder.as_str(), now_ms, expires_ms],
        )?;
        let acquired = changed == 1;
        if !acquired {
            debug!("lease held by another instance");
        }
        Ok(acquired)
    }

    /// Like [`try_acquire`](Self::try_acquire) but reports contention as
    /// [`SchedulerError::LockContention`].
    pub fn acquire(
        &self,
        schedule_id: &ScheduleId,
        holder: &InstanceId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.try_acquire(schedule_id, holder, ttl, now)? {
            Ok(())
        } else {
            Err(SchedulerError::LockContention {
                schedule_id: schedule_id.to_string(),
            })
        }
    }

    /// Heartbeat: push the expiry to `now + ttl`. Returns `false` when the
    /// lease is no longer held by `holder` (it expired and was taken over).
    pub fn renew(
        &self,
        schedule_id: &ScheduleId,
        holder: &InstanceId,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let expires_ms = now.timestamp_millis() + ttl_ms(ttl);
        let conn = self.conn.lock().map_err(poisoned)?;
        let changed = conn.execute(
            "UPDATE schedule_leases SET expires_at = MAX(expires_at, ?3)
             WHERE schedule_id = ?1 AND holder = ?2",
            rusqlite::params![schedule_id.as_str(), holder.as_str(), expires_ms],
        )?;
        Ok(changed == 1)
    }

    /// Drop the lease if `holder` owns it. Returns whether a row was removed.
    pub fn release(&self, schedule_id: &ScheduleId, holder: &InstanceId) -> Result<bool> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let changed = conn.execute(
            "DELETE FROM schedule_leases WHERE schedule_id = ?1 AND holder = ?2",
            rusqlite::params![schedule_id.as_str(), holder.as_str()],
        )?;
        if changed == 1 {
            debug!(schedule_id = %schedule_id, "lease released");
        }
        Ok(changed == 1)
    }

    /// The unexpired lease on `schedule_id`, if any.
    pub fn current(&self, schedule_id: &ScheduleId, now: DateTime<Utc>) -> Result<Option<Lease>> {
        let conn = self.conn.lock().map_err(poisoned)?;
        let row = conn
            .query_row(
                "SELECT holder, acquired_at, expires_at FROM schedule_leases
                 WHERE schedule_id = ?1 AND expires_at > ?2",
                rusqlite::params![schedule_id.as_str(), now.timestamp_millis()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(holder, acquired, expires)| {
            Ok(Lease {
                schedule_id: schedule_id.clone(),
                holder: InstanceId::from(holder),
                acquired_at: from_millis(acquired)?,
                expires_at: from_millis(expires)?,
            })
        })
        .transpose()
    }
}

fn ttl_ms(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX / 2)
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| SchedulerError::Persistence(format!("bad lease timestamp {ms}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    fn setup() -> LockManager {
        LockManager::new(open_in_memory().unwrap()).unwrap()
    }

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn second_holder_is_refused_while_lease_is_live() {
        let locks = setup();
        let id = ScheduleId::from("s1");
        let (a, b) = (InstanceId::from("a"), InstanceId::from("b"));
        let now = Utc::now();

        assert!(locks.try_acquire(&id, &a, TTL, now).unwrap());
        assert!(!locks.try_acquire(&id, &b, TTL, now).unwrap());
        let err = locks.acquire(&id, &b, TTL, now).unwrap_err();
        assert_eq!(err.code(), "LOCK_CONTENTION");
        assert_eq!(locks.current(&id, now).unwrap().unwrap().holder, a);
    }

    #[test]
    fn holder_may_reacquire_without_shortening() {
        let locks = setup();
        let id = ScheduleId::from("s1");
        let a = InstanceId::from("a");
        let now = Utc::now();

        assert!(locks.try_acquire(&id, &a, Duration::from_secs(120), now).unwrap());
        assert!(locks.try_acquire(&id, &a, Duration::from_secs(5), now).unwrap());
        let lease = locks.current(&id, now).unwrap().unwrap();
        assert!(lease.expires_at >= now + chrono::Duration::seconds(119));
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let locks = setup();
        let id = ScheduleId::from("s1");
        let (a, b) = (InstanceId::from("a"), InstanceId::from("b"));
        let t0 = Utc::now();

        assert!(locks.try_acquire(&id, &a, TTL, t0).unwrap());
        let later = t0 + chrono::Duration::seconds(31);
        assert!(locks.current(&id, later).unwrap().is_none());
        assert!(locks.try_acquire(&id, &b, TTL, later).unwrap());
        // the crashed holder's heartbeat now fails
        assert!(!locks.renew(&id, &a, TTL, later).unwrap());
        assert!(!locks.release(&id, &a).unwrap());
        assert_eq!(locks.current(&id, later).unwrap().unwrap().holder, b);
    }

    #[test]
    fn renew_extends_and_release_frees() {
        let locks = setup();
        let id = ScheduleId::from("s1");
        let (a, b) = (InstanceId::from("a"), InstanceId::from("b"));
        let t0 = Utc::now();

        locks.acquire(&id, &a, TTL, t0).unwrap();
        let t1 = t0 + chrono::Duration::seconds(20);
        assert!(locks.renew(&id, &a, TTL, t1).unwrap());
        // would have expired at t0+30 without the renewal
        let t2 = t0 + chrono::Duration::seconds(40);
        assert!(!locks.try_acquire(&id, &b, TTL, t2).unwrap());

        assert!(locks.release(&id, &a).unwrap());
        assert!(locks.try_acquire(&id, &b, TTL, t2).unwrap());
    }
}
