use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use unisched_core::{ScheduleId, UnischedConfig};
use unisched_scheduler::{
    next_fire_times, Engine, JobExecution, OwnerDomain, Pagination, ScheduleDefinition,
    ScheduleFilter,
};

/// Operator tool for the unisched job database.
#[derive(Debug, Parser)]
#[command(name = "unisched", version, about)]
struct Cli {
    /// Config file (falls back to UNISCHED_CONFIG, then ~/.unisched/unisched.toml).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Preview the next fire times of a cron expression.
    Next {
        expression: String,
        #[arg(long, default_value = "UTC")]
        tz: String,
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
    /// List schedules.
    List {
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        enabled: Option<bool>,
        /// Only schedules whose retries are exhausted.
        #[arg(long)]
        alerting: bool,
    },
    /// Print one schedule as JSON.
    Show { id: String },
    /// Execution history, newest first.
    History {
        id: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    Pause { id: String },
    Resume { id: String },
    /// Delete a schedule and cancel its pending retries.
    Delete { id: String },
    /// Make a schedule due now; a running engine picks it up on its next tick.
    Trigger { id: String },
    /// Reap abandoned executions and prune history past the retention window.
    Prune,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "unisched=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // `next` is pure and needs no database.
    if let Command::Next {
        expression,
        tz,
        count,
    } = &cli.command
    {
        for at in next_fire_times(expression, tz, Utc::now(), *count)? {
            println!("{}", at.to_rfc3339());
        }
        return Ok(());
    }

    // explicit flag > UNISCHED_CONFIG env > ~/.unisched/unisched.toml
    let config_path = cli.config.or_else(|| std::env::var("UNISCHED_CONFIG").ok());
    let config = UnischedConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        UnischedConfig::default()
    });
    info!(path = %config.database.path, "opening SQLite database");
    let engine = Engine::open(&config).context("open scheduler database")?;

    match cli.command {
        Command::Next { .. } => {}
        Command::List {
            domain,
            enabled,
            alerting,
        } => {
            let owner_domain = domain
                .map(|d| d.parse::<OwnerDomain>())
                .transpose()
                .map_err(|e| {
                    let known: Vec<&str> = OwnerDomain::ALL.iter().map(|d| d.as_str()).collect();
                    anyhow::anyhow!("{e} (expected one of: {})", known.join(", "))
                })?;
            let filter = ScheduleFilter {
                owner_domain,
                enabled,
                alerting: alerting.then_some(true),
            };
            for schedule in engine.list_schedules(&filter)? {
                println!("{}", schedule_line(&schedule));
            }
        }
        Command::Show { id } => {
            let schedule = engine.get_schedule(&ScheduleId::from(id))?;
            println!("{}", serde_json::to_string_pretty(&schedule)?);
        }
        Command::History { id, limit, offset } => {
            let id = ScheduleId::from(id);
            for execution in engine.list_executions(&id, Pagination::new(limit, offset))? {
                println!("{}", execution_line(&execution));
            }
        }
        Command::Pause { id } => {
            let schedule = engine.pause(&ScheduleId::from(id))?;
            println!("{}", schedule_line(&schedule));
        }
        Command::Resume { id } => {
            let schedule = engine.resume(&ScheduleId::from(id))?;
            println!("{}", schedule_line(&schedule));
        }
        Command::Delete { id } => {
            let cancelled = engine.delete(&ScheduleId::from(id)).await?;
            println!("deleted; {cancelled} pending execution(s) cancelled");
        }
        Command::Trigger { id } => {
            let schedule = engine.request_run(&ScheduleId::from(id))?;
            println!("{}", schedule_line(&schedule));
        }
        Command::Prune => {
            let report = engine.housekeeping(Utc::now()).await?;
            println!(
                "reaped {} abandoned, pruned {} execution(s)",
                report.orphans_reaped, report.executions_pruned
            );
        }
    }

    Ok(())
}

fn schedule_line(s: &ScheduleDefinition) -> String {
    let when = s
        .cron_expression
        .clone()
        .or_else(|| s.run_at.map(|at| format!("at {}", at.to_rfc3339())))
        .unwrap_or_default();
    let next = s
        .next_run_at
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    let last = s
        .last_status
        .map(|st| st.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}  {:<10} {:<8} {:<20} next={} last={}{}",
        s.id,
        s.owner_domain.as_str(),
        if s.enabled { "enabled" } else { "paused" },
        when,
        next,
        last,
        if s.alert { "  ALERT" } else { "" },
    )
}

fn execution_line(e: &JobExecution) -> String {
    let mut line = format!(
        "{}  #{} {:<10} {:<8} scheduled={}",
        e.id,
        e.attempt,
        e.status.as_str(),
        e.trigger.as_str(),
        e.scheduled_for.to_rfc3339()
    );
    if let Some(finished) = e.finished_at {
        line.push_str(&format!(" finished={}", finished.to_rfc3339()));
    }
    if let Some(err) = &e.error {
        line.push_str(&format!(" error={err:?}"));
    }
    line
}
