use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use unisched_core::{ExecutionId, InstanceId, ScheduleId};

/// Implements `Display` and `FromStr` over the snake_case names used both in
/// SQLite columns and on the wire.
macro_rules! string_enum {
    ($ty:ident, $what:literal, { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $s,)+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s {
                    $($s => Ok($ty::$variant),)+
                    other => Err(format!(concat!("unknown ", $what, ": {}"), other)),
                }
            }
        }
    };
}

/// The business domain that owns a schedule and supplies its handler.
///
/// Closed set: each variant maps to exactly one handler registered at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerDomain {
    DataSync,
    Notebook,
    Workflow,
    Automation,
    Import,
    Export,
}

string_enum!(OwnerDomain, "owner domain", {
    DataSync => "data_sync",
    Notebook => "notebook",
    Workflow => "workflow",
    Automation => "automation",
    Import => "import",
    Export => "export",
});

impl OwnerDomain {
    pub const ALL: [OwnerDomain; 6] = [
        OwnerDomain::DataSync,
        OwnerDomain::Notebook,
        OwnerDomain::Workflow,
        OwnerDomain::Automation,
        OwnerDomain::Import,
        OwnerDomain::Export,
    ];
}

/// What happens when a schedule comes due while one of its executions runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// Drop the firing.
    #[default]
    Skip,
    /// Run once more as soon as the current execution finishes.
    Queue,
    /// Cancel the current execution and start a new one.
    Replace,
}

string_enum!(ConcurrencyPolicy, "concurrency policy", {
    Skip => "skip",
    Queue => "queue",
    Replace => "replace",
});

/// Exponential backoff parameters for failed executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. 1 disables retries.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    /// When false a `TimedOut` execution is a permanent failure.
    #[serde(default = "default_true")]
    pub retry_on_timeout: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 60_000,
            retry_on_timeout: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Input to `upsert_schedule`. `id: None` creates a new schedule.
///
/// Exactly one of `cron_expression` and `run_at` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSpec {
    #[serde(default)]
    pub id: Option<ScheduleId>,
    pub owner_domain: OwnerDomain,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub concurrency_policy: ConcurrencyPolicy,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Opaque, domain-owned blob passed verbatim to the handler.
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_timeout_ms() -> u64 {
    60_000
}

impl ScheduleSpec {
    /// A recurring schedule driven by a cron expression (UTC by default).
    pub fn cron(owner_domain: OwnerDomain, expression: impl Into<String>) -> Self {
        Self {
            id: None,
            owner_domain,
            name: String::new(),
            cron_expression: Some(expression.into()),
            run_at: None,
            timezone: default_timezone(),
            enabled: true,
            concurrency_policy: ConcurrencyPolicy::default(),
            retry_policy: RetryPolicy::default(),
            timeout_ms: default_timeout_ms(),
            payload: serde_json::Value::Null,
        }
    }

    /// A one-shot schedule that fires once at `at` and then disables itself.
    pub fn once(owner_domain: OwnerDomain, at: DateTime<Utc>) -> Self {
        Self {
            cron_expression: None,
            run_at: Some(at),
            ..Self::cron(owner_domain, "")
        }
    }

    pub fn with_id(mut self, id: ScheduleId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn with_policy(mut self, policy: ConcurrencyPolicy) -> Self {
        self.concurrency_policy = policy;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry_policy = retry;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A persisted schedule record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub id: ScheduleId,
    pub owner_domain: OwnerDomain,
    pub name: String,
    pub cron_expression: Option<String>,
    pub run_at: Option<DateTime<Utc>>,
    pub timezone: String,
    pub enabled: bool,
    /// Derived by the cron evaluator; `None` once a one-shot has fired.
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<ExecutionStatus>,
    pub last_error: Option<String>,
    /// Set when retries were exhausted; cleared by the next success or `resume`.
    pub alert: bool,
    pub concurrency_policy: ConcurrencyPolicy,
    pub retry_policy: RetryPolicy,
    pub timeout_ms: u64,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle state of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

string_enum!(ExecutionStatus, "execution status", {
    Pending => "pending",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
    TimedOut => "timed_out",
    Cancelled => "cancelled",
});

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded
                | ExecutionStatus::Failed
                | ExecutionStatus::TimedOut
                | ExecutionStatus::Cancelled
        )
    }

    /// `Pending → Running → {Succeeded, Failed, TimedOut, Cancelled}`, plus
    /// `Pending → Cancelled` for executions dropped before they started.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Cancelled)
        )
    }
}

/// Why an execution was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// The cron clock (or a one-shot `run_at`) came due.
    Schedule,
    /// `trigger_now` was called.
    Manual,
    /// Successor of a failed attempt.
    Retry,
}

string_enum!(Trigger, "trigger", {
    Schedule => "schedule",
    Manual => "manual",
    Retry => "retry",
});

/// Last progress report from a running handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Completion fraction clamped to `[0, 1]`.
    pub fraction: f64,
    pub message: String,
}

/// One concrete run attempt. Retries are new rows linked by `parent_execution_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: ExecutionId,
    pub schedule_id: ScheduleId,
    /// 1-based.
    pub attempt: u32,
    pub parent_execution_id: Option<ExecutionId>,
    pub status: ExecutionStatus,
    pub trigger: Trigger,
    /// A `Pending` execution is not dispatched before this instant.
    pub scheduled_for: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result_summary: Option<serde_json::Value>,
    pub progress: Option<Progress>,
    pub instance_id: Option<InstanceId>,
    pub created_at: DateTime<Utc>,
}

/// Filter for `list_schedules`. Every `None` field matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleFilter {
    pub owner_domain: Option<OwnerDomain>,
    pub enabled: Option<bool>,
    pub alerting: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }
    }
}

/// Kind of a status push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusEventKind {
    /// The execution entered `status`.
    Transition,
    /// A running handler reported progress.
    Progress,
    /// Retries were exhausted; the schedule is now in alert state.
    Alert,
}

/// Event pushed to live subscribers on every execution state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub kind: StatusEventKind,
    pub schedule_id: ScheduleId,
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusEvent {
    pub fn transition(execution: &JobExecution, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: StatusEventKind::Transition,
            schedule_id: execution.schedule_id.clone(),
            execution_id: execution.id.clone(),
            status: execution.status,
            timestamp,
            progress: None,
            message: execution.error.clone(),
        }
    }
}

/// What a dispatch attempt (cron firing or `trigger_now`) did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A new execution is running.
    Started(ExecutionId),
    /// An execution was already running and the firing was dropped.
    Skipped,
    /// The firing will run when the current execution finishes.
    Queued,
    /// The current execution was signalled to cancel; the new run starts
    /// as soon as it has stopped.
    Replacing(ExecutionId),
    /// Another engine instance holds the lease.
    Contended,
    /// Nothing to do (firing already claimed, schedule gone, or a retry still
    /// waiting for the current execution).
    Idle,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip_through_from_str() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Succeeded,
            ExecutionStatus::Failed,
            ExecutionStatus::TimedOut,
            ExecutionStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<ExecutionStatus>().unwrap(), status);
        }
        assert!("done".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn terminal_states_accept_no_transitions() {
        use ExecutionStatus::*;
        for from in [Succeeded, Failed, TimedOut, Cancelled] {
            for to in [Pending, Running, Succeeded, Failed, TimedOut, Cancelled] {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn pending_cannot_jump_to_an_outcome() {
        assert!(!ExecutionStatus::Pending.can_transition_to(ExecutionStatus::Succeeded));
        assert!(!ExecutionStatus::Pending.can_transition_to(ExecutionStatus::Failed));
        assert!(ExecutionStatus::Pending.can_transition_to(ExecutionStatus::Running));
        assert!(ExecutionStatus::Running.can_transition_to(ExecutionStatus::TimedOut));
    }

    #[test]
    fn spec_deserializes_with_defaults() {
        let spec: ScheduleSpec = serde_json::from_str(
            r#"{"owner_domain":"data_sync","cron_expression":"*/5 * * * *"}"#,
        )
        .unwrap();
        assert_eq!(spec.owner_domain, OwnerDomain::DataSync);
        assert_eq!(spec.timezone, "UTC");
        assert!(spec.enabled);
        assert_eq!(spec.concurrency_policy, ConcurrencyPolicy::Skip);
        assert_eq!(spec.retry_policy.max_attempts, 3);
        assert!(spec.payload.is_null());
    }

    #[test]
    fn domain_names_are_snake_case() {
        assert_eq!(OwnerDomain::DataSync.to_string(), "data_sync");
        assert_eq!("export".parse::<OwnerDomain>().unwrap(), OwnerDomain::Export);
        assert_eq!(
            serde_json::to_string(&OwnerDomain::Notebook).unwrap(),
            r#""notebook""#
        );
    }
}
