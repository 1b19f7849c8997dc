use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};
use unisched_core::config::SchedulerConfig;
use unisched_core::{ExecutionId, InstanceId, ScheduleId};

use crate::broadcast::StatusBroadcaster;
use crate::error::{Result, SchedulerError};
use crate::handler::{DomainHandler, ExecutionContext, HandlerError};
use crate::lock::LockManager;
use crate::recorder::ExecutionRecorder;
use crate::registry::{AlertUpdate, ScheduleRegistry};
use crate::retry::{RetryController, RetryDecision};
use crate::schedule::following_run;
use crate::types::{
    ConcurrencyPolicy, DispatchOutcome, ExecutionStatus, JobExecution, ScheduleDefinition,
    StatusEvent, StatusEventKind, Trigger,
};

const ABANDONED: &str = "abandoned: lease expired";

/// Counts from one housekeeping pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub orphans_reaped: usize,
    pub executions_pruned: usize,
}

/// The local execution of a schedule, if any.
struct RunningSlot {
    execution_id: ExecutionId,
    token: CancellationToken,
    /// Firing to start as soon as this execution has finished (Queue / Replace).
    queued: Option<Trigger>,
}

enum RunOutcome {
    Succeeded(Option<serde_json::Value>),
    Failed(String),
    TimedOut,
    Cancelled,
}

/// Drives schedules from due to finished.
///
/// Per schedule, a dispatch decision and the bookkeeping after a run are
/// serialised by an in-process gate; across instances the lease in
/// `schedule_leases` is the only mutual exclusion. The lease is held from
/// dispatch until the schedule has neither a local execution nor a queued
/// firing.
pub(crate) struct Dispatcher {
    instance_id: InstanceId,
    config: SchedulerConfig,
    pub(crate) registry: Arc<ScheduleRegistry>,
    pub(crate) recorder: Arc<ExecutionRecorder>,
    pub(crate) locks: Arc<LockManager>,
    pub(crate) broadcaster: Arc<StatusBroadcaster>,
    retry: RetryController,
    slots: DashMap<ScheduleId, RunningSlot>,
    gates: DashMap<ScheduleId, Arc<Mutex<()>>>,
    suspended: DashMap<ScheduleId, String>,
    runners: TaskTracker,
    shutting_down: AtomicBool,
}

impl Dispatcher {
    pub(crate) fn new(
        instance_id: InstanceId,
        config: SchedulerConfig,
        registry: Arc<ScheduleRegistry>,
        recorder: Arc<ExecutionRecorder>,
        locks: Arc<LockManager>,
        broadcaster: Arc<StatusBroadcaster>,
    ) -> Self {
        let retry = RetryController::new(config.jitter_fraction);
        Self {
            instance_id,
            config,
            registry,
            recorder,
            locks,
            broadcaster,
            retry,
            slots: DashMap::new(),
            gates: DashMap::new(),
            suspended: DashMap::new(),
            runners: TaskTracker::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub(crate) fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub(crate) fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // --- tick ---------------------------------------------------------------

    /// One dispatcher pass: due cron firings first, then due retries.
    ///
    /// Per-schedule failures are logged (and suspend the schedule when they
    /// come from storage); only a failure to read the due sets is returned.
    pub(crate) async fn tick(
        self: &Arc<Self>,
        now: DateTime<Utc>,
    ) -> Result<Vec<(ScheduleId, DispatchOutcome)>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        let mut outcomes = Vec::new();

        for schedule in self.registry.due_schedules(now)? {
            let id = schedule.id.clone();
            if self.suspended.contains_key(&id) {
                debug!(schedule_id = %id, "due schedule is suspended");
                continue;
            }
            match self.dispatch(schedule, Trigger::Schedule, now).await {
                Ok(outcome) => outcomes.push((id, outcome)),
                Err(e) => self.dispatch_failed(&id, &e),
            }
        }

        for pending in self.recorder.due_pending(now)? {
            let id = pending.schedule_id.clone();
            if self.suspended.contains_key(&id) {
                continue;
            }
            match self.dispatch_pending(pending, now).await {
                Ok(outcome) => outcomes.push((id, outcome)),
                Err(e) => self.dispatch_failed(&id, &e),
            }
        }

        Ok(outcomes)
    }

    /// Dispatch a fresh firing of `schedule` (cron or manual).
    pub(crate) async fn dispatch(
        self: &Arc<Self>,
        schedule: ScheduleDefinition,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        self.ensure_not_suspended(&schedule.id)?;
        let gate = self.gate(&schedule.id);
        let _guard = gate.lock().await;

        let ttl = self.lease_ttl(schedule.timeout_ms);
        if !self
            .locks
            .try_acquire(&schedule.id, &self.instance_id, ttl, now)?
        {
            debug!(schedule_id = %schedule.id, "lease held by another instance");
            return Ok(DispatchOutcome::Contended);
        }

        if trigger == Trigger::Schedule {
            let Some(expected) = schedule.next_run_at else {
                self.release_if_idle(&schedule.id)?;
                return Ok(DispatchOutcome::Idle);
            };
            let next = following_run(&schedule, now)?;
            if !self
                .registry
                .claim_firing(&schedule.id, expected, next, now)?
            {
                debug!(schedule_id = %schedule.id, "firing already claimed");
                self.release_if_idle(&schedule.id)?;
                return Ok(DispatchOutcome::Idle);
            }
        }

        if let Some(mut slot) = self.slots.get_mut(&schedule.id) {
            let outcome = match schedule.concurrency_policy {
                ConcurrencyPolicy::Skip => {
                    info!(
                        schedule_id = %schedule.id,
                        running = %slot.execution_id,
                        "still running, firing skipped"
                    );
                    DispatchOutcome::Skipped
                }
                ConcurrencyPolicy::Queue => {
                    slot.queued = Some(trigger);
                    info!(schedule_id = %schedule.id, "still running, firing queued");
                    DispatchOutcome::Queued
                }
                ConcurrencyPolicy::Replace => {
                    slot.queued = Some(trigger);
                    slot.token.cancel();
                    info!(
                        schedule_id = %schedule.id,
                        replacing = %slot.execution_id,
                        "cancelling running execution for replacement"
                    );
                    DispatchOutcome::Replacing(slot.execution_id.clone())
                }
            };
            return Ok(outcome);
        }

        self.start_fresh(schedule, trigger, now)
            .map(DispatchOutcome::Started)
    }

    /// Dispatch a `Pending` execution (a retry, or a firing orphaned before it
    /// started) whose `scheduled_for` has arrived.
    async fn dispatch_pending(
        self: &Arc<Self>,
        pending: JobExecution,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let schedule = match self.registry.get(&pending.schedule_id) {
            Ok(schedule) => schedule,
            Err(SchedulerError::ScheduleNotFound { .. }) => {
                let cancelled = self.persist(
                    &pending.schedule_id,
                    self.recorder.finish(
                        &pending.id,
                        ExecutionStatus::Cancelled,
                        now,
                        Some("schedule deleted"),
                        None,
                    ),
                )?;
                self.publish(&cancelled);
                return Ok(DispatchOutcome::Idle);
            }
            Err(e) => return Err(e),
        };

        let gate = self.gate(&schedule.id);
        let _guard = gate.lock().await;

        if self.slots.contains_key(&schedule.id) {
            // waits for the current execution
            return Ok(DispatchOutcome::Idle);
        }
        let ttl = self.lease_ttl(schedule.timeout_ms);
        if !self
            .locks
            .try_acquire(&schedule.id, &self.instance_id, ttl, now)?
        {
            return Ok(DispatchOutcome::Contended);
        }
        let schedule_id = schedule.id.clone();
        let launched = self
            .reap_orphans_of(&schedule_id, now)
            .and_then(|()| self.launch(schedule, pending, now));
        match self.persist(&schedule_id, launched) {
            Ok(id) => Ok(DispatchOutcome::Started(id)),
            // started elsewhere between the due query and here
            Err(SchedulerError::InvalidTransition { execution_id, .. }) => {
                debug!(execution_id = %execution_id, "pending execution already taken");
                self.release_if_idle(&schedule_id)?;
                Ok(DispatchOutcome::Idle)
            }
            Err(e) => {
                self.release_quietly(&schedule_id);
                Err(e)
            }
        }
    }

    // --- starting -----------------------------------------------------------

    /// Record a new attempt-1 execution and launch it. Caller holds the gate
    /// and the lease, and has checked that no local execution exists. On
    /// failure the lease is given back.
    fn start_fresh(
        self: &Arc<Self>,
        schedule: ScheduleDefinition,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> Result<ExecutionId> {
        let schedule_id = schedule.id.clone();
        let started = self.reap_orphans_of(&schedule_id, now).and_then(|()| {
            let pending = self
                .recorder
                .create_pending(&schedule_id, 1, None, trigger, now, now)?;
            self.publish(&pending);
            self.launch(schedule, pending, now)
        });
        let started = self.persist(&schedule_id, started);
        if started.is_err() {
            self.release_quietly(&schedule_id);
        }
        started
    }

    /// `Pending → Running` and spawn the runner task.
    fn launch(
        self: &Arc<Self>,
        schedule: ScheduleDefinition,
        pending: JobExecution,
        now: DateTime<Utc>,
    ) -> Result<ExecutionId> {
        let running = self
            .recorder
            .mark_running(&pending.id, &self.instance_id, now)?;
        self.publish(&running);

        let token = CancellationToken::new();
        self.slots.insert(
            schedule.id.clone(),
            RunningSlot {
                execution_id: running.id.clone(),
                token: token.clone(),
                queued: None,
            },
        );

        info!(
            schedule_id = %schedule.id,
            execution_id = %running.id,
            attempt = running.attempt,
            trigger = %running.trigger,
            "execution started"
        );

        let handler = self.registry.get_handler(schedule.owner_domain);
        let span = info_span!(
            "execution",
            schedule_id = %schedule.id,
            execution_id = %running.id,
            attempt = running.attempt
        );
        let execution_id = running.id.clone();
        let this = Arc::clone(self);
        self.runners.spawn(
            async move { this.run(schedule, running, handler, token).await }.instrument(span),
        );
        Ok(execution_id)
    }

    // --- running ------------------------------------------------------------

    async fn run(
        self: Arc<Self>,
        schedule: ScheduleDefinition,
        execution: JobExecution,
        handler: Result<Arc<dyn DomainHandler>>,
        token: CancellationToken,
    ) {
        let outcome = match handler {
            Ok(handler) => self.supervise(&schedule, &execution, handler, token).await,
            Err(e) => RunOutcome::Failed(e.to_string()),
        };
        let now = Utc::now();
        self.record_outcome(&schedule, &execution, outcome, now);
        self.finalize(&schedule.id).await;
    }

    /// Run the handler under its timeout, renew the lease while it runs and
    /// translate cancellation.
    async fn supervise(
        &self,
        schedule: &ScheduleDefinition,
        execution: &JobExecution,
        handler: Arc<dyn DomainHandler>,
        token: CancellationToken,
    ) -> RunOutcome {
        let ctx = ExecutionContext::new(
            schedule.id.clone(),
            execution.id.clone(),
            execution.attempt,
            token.clone(),
            Arc::clone(&self.recorder),
            Arc::clone(&self.broadcaster),
        );
        let payload = schedule.payload.clone();
        let mut task = tokio::spawn(async move { handler.execute(payload, ctx).await });

        let deadline = tokio::time::sleep(Duration::from_millis(schedule.timeout_ms));
        tokio::pin!(deadline);
        let ttl = self.lease_ttl(schedule.timeout_ms);
        let mut heartbeat = tokio::time::interval(ttl / 3);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                joined = &mut task => return outcome_of(joined),
                _ = &mut deadline => {
                    token.cancel();
                    task.abort();
                    warn!(timeout_ms = schedule.timeout_ms, "execution timed out");
                    return RunOutcome::TimedOut;
                }
                _ = token.cancelled() => {
                    let grace = Duration::from_millis(self.config.cancel_grace_ms);
                    // a handler that returns within the grace period reports its own outcome
                    return match tokio::time::timeout(grace, &mut task).await {
                        Ok(joined) => outcome_of(joined),
                        Err(_) => {
                            warn!(
                                grace_ms = self.config.cancel_grace_ms,
                                "handler ignored cancellation, aborting"
                            );
                            task.abort();
                            RunOutcome::Cancelled
                        }
                    };
                }
                _ = heartbeat.tick() => self.heartbeat(&schedule.id, ttl),
            }
        }
    }

    fn heartbeat(&self, schedule_id: &ScheduleId, ttl: Duration) {
        match self
            .locks
            .renew(schedule_id, &self.instance_id, ttl, Utc::now())
        {
            Ok(true) => {}
            Ok(false) => warn!(schedule_id = %schedule_id, "lease lost while running"),
            Err(e) => warn!(schedule_id = %schedule_id, error = %e, "lease renewal failed"),
        }
    }

    // --- finishing ----------------------------------------------------------

    fn record_outcome(
        &self,
        schedule: &ScheduleDefinition,
        execution: &JobExecution,
        outcome: RunOutcome,
        now: DateTime<Utc>,
    ) {
        let (status, error, summary) = match outcome {
            RunOutcome::Succeeded(summary) => (ExecutionStatus::Succeeded, None, summary),
            RunOutcome::Failed(msg) => (ExecutionStatus::Failed, Some(msg), None),
            RunOutcome::TimedOut => (
                ExecutionStatus::TimedOut,
                Some(
                    SchedulerError::Timeout {
                        ms: schedule.timeout_ms,
                    }
                    .to_string(),
                ),
                None,
            ),
            RunOutcome::Cancelled => (ExecutionStatus::Cancelled, None, None),
        };

        let finished = match self.recorder.finish(
            &execution.id,
            status,
            now,
            error.as_deref(),
            summary.as_ref(),
        ) {
            Ok(finished) => finished,
            Err(e) => {
                error!(
                    execution_id = %execution.id,
                    error = %e,
                    "failed to record execution outcome"
                );
                if e.is_persistence() {
                    self.suspend(&schedule.id, e.to_string());
                }
                return;
            }
        };
        self.publish(&finished);

        if let Err(e) = self.apply_retry_policy(schedule, &finished, now) {
            error!(execution_id = %finished.id, error = %e, "failed to apply retry policy");
            if e.is_persistence() {
                self.suspend(&schedule.id, e.to_string());
            }
        }
    }

    /// Feed a terminal execution to the retry controller and stamp the
    /// result on the schedule.
    fn apply_retry_policy(
        &self,
        schedule: &ScheduleDefinition,
        finished: &JobExecution,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let error = finished.error.as_deref();
        match self.retry.on_outcome(finished, &schedule.retry_policy, now) {
            RetryDecision::Done => {
                let alert = if finished.status == ExecutionStatus::Succeeded {
                    AlertUpdate::Clear
                } else {
                    AlertUpdate::Keep
                };
                self.registry
                    .record_outcome(&schedule.id, finished.status, error, alert, now)
            }
            RetryDecision::Retry {
                attempt,
                next_attempt_at,
                delay,
            } => {
                if !self.registry.exists(&schedule.id)? {
                    debug!(schedule_id = %schedule.id, "schedule deleted, no retry");
                    return Ok(());
                }
                let successor = self.recorder.create_pending(
                    &schedule.id,
                    attempt,
                    Some(&finished.id),
                    Trigger::Retry,
                    next_attempt_at,
                    now,
                )?;
                warn!(
                    schedule_id = %schedule.id,
                    execution_id = %finished.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "execution failed, retry scheduled"
                );
                self.publish(&successor);
                self.registry
                    .record_outcome(&schedule.id, finished.status, error, AlertUpdate::Keep, now)
            }
            RetryDecision::GiveUp { reason } => {
                self.registry
                    .record_outcome(&schedule.id, finished.status, error, AlertUpdate::Raise, now)?;
                warn!(
                    schedule_id = %schedule.id,
                    execution_id = %finished.id,
                    %reason,
                    "permanent failure, schedule alerting"
                );
                self.broadcaster.publish(StatusEvent {
                    kind: StatusEventKind::Alert,
                    schedule_id: schedule.id.clone(),
                    execution_id: finished.id.clone(),
                    status: finished.status,
                    timestamp: now,
                    progress: None,
                    message: Some(reason),
                });
                Ok(())
            }
        }
    }

    /// Drop the slot, then either start the queued firing or release the lease.
    async fn finalize(self: &Arc<Self>, schedule_id: &ScheduleId) {
        let gate = self.gate(schedule_id);
        let _guard = gate.lock().await;

        let queued = self
            .slots
            .remove(schedule_id)
            .and_then(|(_, slot)| slot.queued);

        if let Some(trigger) = queued {
            if !self.shutting_down.load(Ordering::SeqCst)
                && !self.suspended.contains_key(schedule_id)
            {
                match self.start_queued(schedule_id, trigger) {
                    Ok(execution_id) => {
                        debug!(
                            schedule_id = %schedule_id,
                            execution_id = %execution_id,
                            "queued firing started"
                        );
                        return;
                    }
                    Err(e) => self.dispatch_failed(schedule_id, &e),
                }
            }
        }

        self.release_quietly(schedule_id);
    }

    fn start_queued(
        self: &Arc<Self>,
        schedule_id: &ScheduleId,
        trigger: Trigger,
    ) -> Result<ExecutionId> {
        let now = Utc::now();
        let schedule = self.registry.get(schedule_id)?;
        let ttl = self.lease_ttl(schedule.timeout_ms);
        self.locks.acquire(schedule_id, &self.instance_id, ttl, now)?;
        self.start_fresh(schedule, trigger, now)
    }

    // --- housekeeping -------------------------------------------------------

    /// Reap executions abandoned by a crashed instance and prune old history.
    pub(crate) async fn housekeeping(&self, now: DateTime<Utc>) -> Result<HousekeepingReport> {
        let mut report = HousekeepingReport::default();

        for execution in self.recorder.running_executions()? {
            let gate = self.gate(&execution.schedule_id);
            let _guard = gate.lock().await;

            let local = self
                .slots
                .get(&execution.schedule_id)
                .is_some_and(|slot| slot.execution_id == execution.id);
            if local {
                continue;
            }
            if let Some(lease) = self.locks.current(&execution.schedule_id, now)? {
                if lease.holder != self.instance_id {
                    continue;
                }
            }
            match self.abandon(&execution, now) {
                Ok(()) => report.orphans_reaped += 1,
                Err(SchedulerError::InvalidTransition { .. }) => {}
                Err(e) => self.dispatch_failed(&execution.schedule_id, &e),
            }
        }

        if self.config.retention_days > 0 {
            let cutoff = now - chrono::Duration::days(i64::from(self.config.retention_days));
            report.executions_pruned = self.recorder.prune(cutoff)?;
        }

        if report.orphans_reaped > 0 {
            info!(orphans = report.orphans_reaped, "reaped abandoned executions");
        }
        Ok(report)
    }

    /// Fail `Running` rows of `schedule_id` left behind by a lost lease.
    /// Caller holds the gate and the lease and has no local execution.
    fn reap_orphans_of(&self, schedule_id: &ScheduleId, now: DateTime<Utc>) -> Result<()> {
        for execution in self.recorder.running_for(schedule_id)? {
            match self.abandon(&execution, now) {
                Ok(()) | Err(SchedulerError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn abandon(&self, execution: &JobExecution, now: DateTime<Utc>) -> Result<()> {
        let finished = self.recorder.finish(
            &execution.id,
            ExecutionStatus::Failed,
            now,
            Some(ABANDONED),
            None,
        )?;
        warn!(
            schedule_id = %execution.schedule_id,
            execution_id = %execution.id,
            holder = ?execution.instance_id,
            "execution abandoned by its instance"
        );
        self.publish(&finished);
        match self.registry.get(&execution.schedule_id) {
            Ok(schedule) => self.apply_retry_policy(&schedule, &finished, now),
            Err(SchedulerError::ScheduleNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // --- operator controls --------------------------------------------------

    pub(crate) async fn delete(
        &self,
        schedule_id: &ScheduleId,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let gate = self.gate(schedule_id);
        let guard = gate.lock().await;

        self.registry.delete(schedule_id)?;
        let cancelled =
            self.persist(schedule_id, self.recorder.cancel_pending(schedule_id, now))?;
        for execution in &cancelled {
            self.publish(execution);
        }
        match self.slots.get_mut(schedule_id) {
            Some(mut slot) => slot.queued = None,
            None => {
                self.locks.release(schedule_id, &self.instance_id)?;
            }
        }
        self.suspended.remove(schedule_id);

        drop(guard);
        self.gates.remove(schedule_id);
        Ok(cancelled.len())
    }

    /// Drop a queued firing; the running execution continues.
    pub(crate) fn forget_queued(&self, schedule_id: &ScheduleId) {
        if let Some(mut slot) = self.slots.get_mut(schedule_id) {
            slot.queued = None;
        }
    }

    pub(crate) fn running_execution(&self, schedule_id: &ScheduleId) -> Option<ExecutionId> {
        self.slots
            .get(schedule_id)
            .map(|slot| slot.execution_id.clone())
    }

    pub(crate) fn suspended(&self) -> Vec<(ScheduleId, String)> {
        self.suspended
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub(crate) fn resolve_suspension(&self, schedule_id: &ScheduleId) -> bool {
        let lifted = self.suspended.remove(schedule_id).is_some();
        if lifted {
            info!(schedule_id = %schedule_id, "suspension lifted");
        }
        lifted
    }

    /// Stop dispatching, cancel every local execution and wait until each has
    /// recorded its outcome and released its lease.
    pub(crate) async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let running = self.slots.len();
        for slot in self.slots.iter() {
            slot.token.cancel();
        }
        self.runners.close();
        info!(running, "waiting for running executions to stop");
        self.runners.wait().await;
    }

    // --- helpers ------------------------------------------------------------

    fn gate(&self, schedule_id: &ScheduleId) -> Arc<Mutex<()>> {
        self.gates
            .entry(schedule_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Lease TTL for a schedule: never shorter than the run it protects.
    fn lease_ttl(&self, timeout_ms: u64) -> Duration {
        Duration::from_millis(
            self.config
                .lease_ttl_ms
                .max(timeout_ms.saturating_add(self.config.lease_grace_ms)),
        )
    }

    fn release_if_idle(&self, schedule_id: &ScheduleId) -> Result<()> {
        if !self.slots.contains_key(schedule_id) {
            self.locks.release(schedule_id, &self.instance_id)?;
        }
        Ok(())
    }

    fn release_quietly(&self, schedule_id: &ScheduleId) {
        if let Err(e) = self.release_if_idle(schedule_id) {
            warn!(schedule_id = %schedule_id, error = %e, "failed to release lease");
        }
    }

    fn ensure_not_suspended(&self, schedule_id: &ScheduleId) -> Result<()> {
        match self.suspended.get(schedule_id) {
            Some(reason) => Err(SchedulerError::Suspended {
                id: schedule_id.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Pass `result` through, suspending the schedule on a storage failure.
    fn persist<T>(&self, schedule_id: &ScheduleId, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_persistence() {
                self.suspend(schedule_id, e.to_string());
            }
        }
        result
    }

    fn suspend(&self, schedule_id: &ScheduleId, reason: String) {
        error!(schedule_id = %schedule_id, %reason, "dispatch suspended after persistence failure");
        self.suspended.insert(schedule_id.clone(), reason);
    }

    fn dispatch_failed(&self, schedule_id: &ScheduleId, e: &SchedulerError) {
        if e.is_persistence() {
            self.suspend(schedule_id, e.to_string());
        } else {
            error!(schedule_id = %schedule_id, error = %e, code = e.code(), "dispatch failed");
        }
    }

    fn publish(&self, execution: &JobExecution) {
        let at = execution
            .finished_at
            .or(execution.started_at)
            .unwrap_or(execution.created_at);
        self.broadcaster
            .publish(StatusEvent::transition(execution, at));
    }
}

type Joined = std::result::Result<HandlerOutput, JoinError>;
type HandlerOutput = std::result::Result<Option<serde_json::Value>, HandlerError>;

fn outcome_of(joined: Joined) -> RunOutcome {
    match joined {
        Ok(Ok(summary)) => RunOutcome::Succeeded(summary),
        Ok(Err(HandlerError::Failed(msg))) => RunOutcome::Failed(msg),
        Ok(Err(HandlerError::Cancelled)) => RunOutcome::Cancelled,
        Err(e) if e.is_panic() => RunOutcome::Failed("handler panicked".to_string()),
        Err(e) => RunOutcome::Failed(format!("handler task ended unexpectedly: {e}")),
    }
}
