//! `unisched-scheduler` — unified scheduling and job-execution engine with
//! SQLite persistence.
//!
//! # Overview
//!
//! Business domains register one [`DomainHandler`] each and upsert
//! [`ScheduleSpec`]s. The [`Engine`] ticks on a fixed interval, picks up
//! schedules whose `next_run_at` has arrived, takes a per-schedule lease,
//! applies the schedule's concurrency policy and runs the handler under a
//! timeout. Every attempt is an append-only [`JobExecution`] row; failures
//! are retried with exponential backoff as new rows linked to their parent.
//! State changes are pushed to live subscribers.
//!
//! # Components
//!
//! | Module        | Role                                                   |
//! |---------------|--------------------------------------------------------|
//! | [`schedule`]  | Cron evaluation with timezone and DST handling         |
//! | [`registry`]  | Schedule definitions and the domain handler table      |
//! | [`lock`]      | Cross-instance leases with TTL and heartbeat renewal   |
//! | [`retry`]     | Backoff and give-up decisions                          |
//! | [`recorder`]  | Execution history and its state machine                |
//! | [`broadcast`] | Fan-out of status events to subscribers                |
//! | [`engine`]    | The dispatcher loop and the public facade              |
//!
//! Delivery is at-least-once: a crash after a handler finished but before
//! its outcome was written makes the execution look abandoned, and it is
//! retried once its lease has expired. Handlers must be idempotent.

pub mod broadcast;
pub mod db;
mod dispatcher;
pub mod engine;
pub mod error;
pub mod handler;
pub mod lock;
pub mod recorder;
pub mod registry;
pub mod retry;
pub mod schedule;
pub mod types;

pub use broadcast::{Subscription, Topic};
pub use dispatcher::HousekeepingReport;
pub use engine::Engine;
pub use error::{Result, SchedulerError};
pub use handler::{DomainHandler, ExecutionContext, HandlerError};
pub use schedule::{next_fire_time, next_fire_times};
pub use types::{
    ConcurrencyPolicy, DispatchOutcome, ExecutionStatus, JobExecution, OwnerDomain, Pagination,
    Progress, RetryPolicy, ScheduleDefinition, ScheduleFilter, ScheduleSpec, StatusEvent,
    StatusEventKind, Trigger,
};
