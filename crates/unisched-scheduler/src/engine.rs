use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument, warn};
use unisched_core::config::SchedulerConfig;
use unisched_core::{ExecutionId, InstanceId, ScheduleId, UnischedConfig};

use crate::broadcast::{StatusBroadcaster, Subscription, Topic};
use crate::db;
use crate::dispatcher::{Dispatcher, HousekeepingReport};
use crate::error::{Result, SchedulerError};
use crate::handler::DomainHandler;
use crate::lock::LockManager;
use crate::recorder::ExecutionRecorder;
use crate::registry::ScheduleRegistry;
use crate::types::{
    DispatchOutcome, JobExecution, OwnerDomain, Pagination, ScheduleDefinition, ScheduleFilter,
    ScheduleSpec, Trigger,
};

/// One scheduling engine instance.
///
/// Owns the registry, recorder, lock manager and broadcaster and exposes the
/// whole external surface. Cheap to clone; clones share state. Several
/// instances (processes, or engines in one process) may point at the same
/// database file; each schedule is then run by at most one of them at a time.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Dispatcher>,
}

impl Engine {
    /// Open (or create) the database at `config.database.path`.
    pub fn open(config: &UnischedConfig) -> Result<Self> {
        let path = config.database.path.as_str();
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SchedulerError::Persistence(format!(
                        "create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }
        Self::with_connections(
            config.scheduler.clone(),
            db::open(path)?,
            db::open(path)?,
            db::open(path)?,
        )
    }

    /// Engine over private in-memory storage. Each component gets its own
    /// connection; none of them reads another's tables.
    pub fn in_memory(config: SchedulerConfig) -> Result<Self> {
        Self::with_connections(
            config,
            db::open_in_memory()?,
            db::open_in_memory()?,
            db::open_in_memory()?,
        )
    }

    /// Build an engine from one connection per component.
    ///
    /// Fails with a validation error when `config` could not drive the loop.
    pub fn with_connections(
        config: SchedulerConfig,
        registry: Connection,
        recorder: Connection,
        locks: Connection,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SchedulerError::Validation(e.to_string()))?;
        let instance_id = config
            .instance_id
            .clone()
            .map(InstanceId::from)
            .unwrap_or_default();
        let broadcaster = Arc::new(StatusBroadcaster::new(config.subscriber_buffer));
        let dispatcher = Dispatcher::new(
            instance_id,
            config,
            Arc::new(ScheduleRegistry::new(registry)?),
            Arc::new(ExecutionRecorder::new(recorder)?),
            Arc::new(LockManager::new(locks)?),
            broadcaster,
        );
        info!(instance_id = %dispatcher.instance_id(), "scheduling engine created");
        Ok(Self {
            inner: Arc::new(dispatcher),
        })
    }

    pub fn instance_id(&self) -> &InstanceId {
        self.inner.instance_id()
    }

    // --- domain-facing API ----------------------------------------------------

    pub fn register_domain(
        &self,
        domain: OwnerDomain,
        handler: Arc<dyn DomainHandler>,
    ) -> Result<()> {
        self.inner.registry.register_domain(domain, handler)
    }

    /// Validate and store a schedule. Returns the stored definition.
    pub fn upsert_schedule(&self, spec: ScheduleSpec) -> Result<ScheduleDefinition> {
        self.inner.registry.upsert(spec, Utc::now())
    }

    /// Stop new dispatch. A running execution finishes normally; a queued
    /// firing is dropped.
    pub fn pause(&self, id: &ScheduleId) -> Result<ScheduleDefinition> {
        let schedule = self.inner.registry.pause(id, Utc::now())?;
        self.inner.forget_queued(id);
        Ok(schedule)
    }

    pub fn resume(&self, id: &ScheduleId) -> Result<ScheduleDefinition> {
        self.inner.registry.resume(id, Utc::now())
    }

    /// Delete the schedule and cancel its pending executions. Returns how
    /// many pending executions were cancelled.
    #[instrument(skip_all, fields(schedule_id = %id))]
    pub async fn delete(&self, id: &ScheduleId) -> Result<usize> {
        self.inner.delete(id, Utc::now()).await
    }

    /// Run the schedule now, outside its cron clock. Concurrency policy and
    /// locking apply exactly as for a cron firing.
    #[instrument(skip_all, fields(schedule_id = %id))]
    pub async fn trigger_now(&self, id: &ScheduleId) -> Result<DispatchOutcome> {
        let schedule = self.inner.registry.get(id)?;
        self.inner
            .dispatch(schedule, Trigger::Manual, Utc::now())
            .await
    }

    /// Make the schedule due immediately without running it here. Any engine
    /// sharing the database picks it up on its next tick.
    pub fn request_run(&self, id: &ScheduleId) -> Result<ScheduleDefinition> {
        self.inner.registry.mark_due(id, Utc::now())
    }

    pub fn list_schedules(&self, filter: &ScheduleFilter) -> Result<Vec<ScheduleDefinition>> {
        self.inner.registry.list(filter)
    }

    pub fn get_schedule(&self, id: &ScheduleId) -> Result<ScheduleDefinition> {
        self.inner.registry.get(id)
    }

    pub fn list_executions(
        &self,
        schedule_id: &ScheduleId,
        page: Pagination,
    ) -> Result<Vec<JobExecution>> {
        self.inner.recorder.list_executions(schedule_id, page)
    }

    pub fn latest_execution(&self, schedule_id: &ScheduleId) -> Result<Option<JobExecution>> {
        self.inner.recorder.latest_execution(schedule_id)
    }

    pub fn get_execution(&self, id: &ExecutionId) -> Result<JobExecution> {
        self.inner.recorder.get_execution(id)
    }

    /// The execution this instance is running for `schedule_id`, if any.
    pub fn running_execution(&self, schedule_id: &ScheduleId) -> Option<ExecutionId> {
        self.inner.running_execution(schedule_id)
    }

    /// Live status events for one schedule or for all of them.
    pub fn subscribe_status(&self, topic: Topic) -> Subscription {
        self.inner.broadcaster.subscribe(topic)
    }

    pub fn unsubscribe_status(&self, subscription_id: u64) {
        self.inner.broadcaster.unsubscribe(subscription_id);
    }

    /// Schedules whose dispatch is halted after a storage failure, with the reason.
    pub fn suspended_schedules(&self) -> Vec<(ScheduleId, String)> {
        self.inner.suspended()
    }

    /// Lift a suspension after the operator fixed the storage problem.
    pub fn resolve_suspension(&self, id: &ScheduleId) -> bool {
        self.inner.resolve_suspension(id)
    }

    // --- driving --------------------------------------------------------------

    /// One dispatcher pass as of `now`. [`Engine::run`] calls this on every
    /// tick; tests and embedders may drive it directly.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<(ScheduleId, DispatchOutcome)>> {
        self.inner.tick(now).await
    }

    /// Reap orphaned executions and prune history older than the retention window.
    pub async fn housekeeping(&self, now: DateTime<Utc>) -> Result<HousekeepingReport> {
        self.inner.housekeeping(now).await
    }

    /// Main loop. Ticks every `tick_interval_ms` until `shutdown` flips to
    /// `true` (or its sender is dropped), then stops running executions.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let config = self.inner.config().clone();
        info!(
            instance_id = %self.instance_id(),
            tick_ms = config.tick_interval_ms,
            "scheduling engine started"
        );

        let mut interval = tokio::time::interval(Duration::from_millis(config.tick_interval_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let every = config.housekeeping_every_ticks.max(1);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if ticks % every == 0 {
                        if let Err(e) = self.housekeeping(Utc::now()).await {
                            warn!(error = %e, "housekeeping failed");
                        }
                    }
                    ticks = ticks.wrapping_add(1);
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(
                            subscribers = self.inner.broadcaster.subscriber_count(),
                            "scheduling engine shutting down"
                        );
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Stop dispatching and wait for running executions to be cancelled and
    /// recorded.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("instance_id", self.instance_id())
            .finish_non_exhaustive()
    }
}
