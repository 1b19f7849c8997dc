//! `unisched-core` — configuration and identifiers shared by the scheduler
//! engine and the operator CLI.

pub mod config;
pub mod error;
pub mod types;

pub use config::{DatabaseConfig, SchedulerConfig, UnischedConfig};
pub use error::{CoreError, Result};
pub use types::{ExecutionId, InstanceId, ScheduleId};
