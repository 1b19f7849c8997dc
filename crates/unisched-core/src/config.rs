use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_LEASE_TTL_MS: u64 = 30_000;
pub const DEFAULT_LEASE_GRACE_MS: u64 = 10_000;
pub const DEFAULT_CANCEL_GRACE_MS: u64 = 5_000;
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;
pub const DEFAULT_JITTER_FRACTION: f64 = 0.10;
pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_HOUSEKEEPING_EVERY_TICKS: u64 = 60;
pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024; // hard cap on a schedule's payload blob
pub const MAX_TIMEOUT_MS: u64 = 7 * 24 * 60 * 60 * 1000; // one week

/// Top-level config (unisched.toml + UNISCHED_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnischedConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Tuning knobs for the dispatcher loop and its collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Dispatcher tick cadence.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Lease holder identity. A fresh UUIDv7 is used when unset, so two
    /// processes sharing one database never collide.
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Lower bound for a lease TTL. The effective TTL for a run is
    /// `max(lease_ttl_ms, timeout_ms + lease_grace_ms)`.
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
    #[serde(default = "default_lease_grace_ms")]
    pub lease_grace_ms: u64,
    /// How long a cooperatively cancelled handler may take to return.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    /// Per-subscriber event buffer; a subscriber that fills it is dropped.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    /// Upper bound of the random jitter as a fraction of the backoff delay.
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
    /// Terminal executions older than this are pruned. 0 keeps everything.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_housekeeping_every_ticks")]
    pub housekeeping_every_ticks: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            instance_id: None,
            lease_ttl_ms: DEFAULT_LEASE_TTL_MS,
            lease_grace_ms: DEFAULT_LEASE_GRACE_MS,
            cancel_grace_ms: DEFAULT_CANCEL_GRACE_MS,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
            retention_days: DEFAULT_RETENTION_DAYS,
            housekeeping_every_ticks: DEFAULT_HOUSEKEEPING_EVERY_TICKS,
        }
    }
}

fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}
fn default_lease_ttl_ms() -> u64 {
    DEFAULT_LEASE_TTL_MS
}
fn default_lease_grace_ms() -> u64 {
    DEFAULT_LEASE_GRACE_MS
}
fn default_cancel_grace_ms() -> u64 {
    DEFAULT_CANCEL_GRACE_MS
}
fn default_subscriber_buffer() -> usize {
    DEFAULT_SUBSCRIBER_BUFFER
}
fn default_jitter_fraction() -> f64 {
    DEFAULT_JITTER_FRACTION
}
fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}
fn default_housekeeping_every_ticks() -> u64 {
    DEFAULT_HOUSEKEEPING_EVERY_TICKS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.unisched/unisched.db", home)
}

impl UnischedConfig {
    /// Load config from a TOML file with UNISCHED_* env var overrides.
    ///
    /// Nested keys use a double underscore:
    /// `UNISCHED_SCHEDULER__TICK_INTERVAL_MS=500`.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.unisched/unisched.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::new()
                .merge(Toml::file(&path))
                .merge(Env::prefixed("UNISCHED_").split("__")),
        )
    }

    /// Extract and sanity-check a config from an already-assembled figment.
    pub fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        let config: UnischedConfig = figment
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> crate::error::Result<()> {
        self.scheduler.validate()
    }
}

impl SchedulerConfig {
    /// Reject settings the dispatcher loop cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.tick_interval_ms == 0 {
            return Err(CoreError::Config(
                "scheduler.tick_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.subscriber_buffer == 0 {
            return Err(CoreError::Config(
                "scheduler.subscriber_buffer must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(CoreError::Config(format!(
                "scheduler.jitter_fraction must be within [0, 1], got {}",
                self.jitter_fraction
            )));
        }
        if self.housekeeping_every_ticks == 0 {
            return Err(CoreError::Config(
                "scheduler.housekeeping_every_ticks must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.unisched/unisched.toml", home)
}
