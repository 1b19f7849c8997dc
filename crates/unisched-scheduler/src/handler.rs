use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use unisched_core::{ExecutionId, ScheduleId};

use crate::broadcast::StatusBroadcaster;
use crate::recorder::ExecutionRecorder;
use crate::types::{ExecutionStatus, Progress, StatusEvent, StatusEventKind};

/// Failure reported by a domain handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The work failed; the retry policy decides what happens next.
    #[error("{0}")]
    Failed(String),

    /// The handler noticed the cancellation signal and stopped early.
    #[error("cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }
}

/// Work performed for one owner domain.
///
/// Handlers must be idempotent: after a crash between handler completion and
/// the history write, the same payload may be delivered again once the lease
/// expires.
#[async_trait]
pub trait DomainHandler: Send + Sync {
    /// Run one execution. `payload` is the schedule's blob, passed verbatim.
    ///
    /// Long-running work should poll [`ExecutionContext::is_cancelled`] (or
    /// select on [`ExecutionContext::cancelled`]) and return
    /// [`HandlerError::Cancelled`] promptly. The returned value is stored as
    /// the execution's `result_summary`.
    async fn execute(
        &self,
        payload: serde_json::Value,
        ctx: ExecutionContext,
    ) -> Result<Option<serde_json::Value>, HandlerError>;
}

/// Context handed to a handler for the duration of one execution.
#[derive(Clone)]
pub struct ExecutionContext {
    schedule_id: ScheduleId,
    execution_id: ExecutionId,
    attempt: u32,
    cancellation: CancellationToken,
    recorder: Arc<ExecutionRecorder>,
    broadcaster: Arc<StatusBroadcaster>,
}

impl ExecutionContext {
    pub(crate) fn new(
        schedule_id: ScheduleId,
        execution_id: ExecutionId,
        attempt: u32,
        cancellation: CancellationToken,
        recorder: Arc<ExecutionRecorder>,
        broadcaster: Arc<StatusBroadcaster>,
    ) -> Self {
        Self {
            schedule_id,
            execution_id,
            attempt,
            cancellation,
            recorder,
            broadcaster,
        }
    }

    pub fn schedule_id(&self) -> &ScheduleId {
        &self.schedule_id
    }

    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// 1-based attempt number; greater than 1 for retries.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// True once the execution was cancelled, replaced, or timed out.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Record progress and push it to live subscribers.
    ///
    /// `fraction` is clamped to `[0, 1]`. Reporting never fails the
    /// execution: a storage error is logged and the event is still published.
    pub fn report_progress(&self, fraction: f64, message: impl Into<String>) {
        let progress = Progress {
            fraction: if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) },
            message: message.into(),
        };
        if let Err(e) = self.recorder.record_progress(&self.execution_id, &progress) {
            warn!(execution_id = %self.execution_id, error = %e, "failed to persist progress");
        }
        self.broadcaster.publish(StatusEvent {
            kind: StatusEventKind::Progress,
            schedule_id: self.schedule_id.clone(),
            execution_id: self.execution_id.clone(),
            status: ExecutionStatus::Running,
            timestamp: Utc::now(),
            progress: Some(progress),
            message: None,
        });
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("schedule_id", &self.schedule_id)
            .field("execution_id", &self.execution_id)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
