//! Operator CLI. Mirrors the admin HTTP surface but talks to the database
//! directly, so it works even when no server instance is up.
//!
//! Exit code 0 on success; on error a single JSON line goes to stderr and
//! the exit code is 1.

use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use steward::jobs::cron;
use steward::jobs::model::{JobFilter, JobState, NewSchedule, ScheduleUpdate};
use steward::jobs::schedules::ScheduleStore;
use steward::jobs::store::JobStore;
use steward::matview::{MatviewStore, RefreshEngine, RefreshMode};

#[derive(Parser)]
#[command(name = "stewardctl", about = "Administer the background job queue")]
struct Cli {
    /// Postgres connection string.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(subcommand)]
    Jobs(JobsCommand),
    #[command(subcommand)]
    Schedules(SchedulesCommand),
    #[command(subcommand)]
    Matviews(MatviewsCommand),
}

#[derive(Subcommand)]
enum JobsCommand {
    /// List jobs, newest first.
    List {
        #[arg(long)]
        state: Option<String>,
        #[arg(long = "type")]
        job_type: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Show one job.
    Get { id: Uuid },
    /// Re-queue a failed job with a fresh attempt budget.
    Retry { id: Uuid },
    /// Cancel a queued job.
    Cancel { id: Uuid },
    /// Counts by state plus oldest queued age.
    Stats,
}

#[derive(Subcommand)]
enum SchedulesCommand {
    List,
    Create(CreateScheduleArgs),
    Update(UpdateScheduleArgs),
    Enable { id: Uuid },
    Disable { id: Uuid },
    Delete { id: Uuid },
}

#[derive(Args)]
struct CreateScheduleArgs {
    #[arg(long)]
    name: String,
    #[arg(long = "job-type")]
    job_type: String,
    #[arg(long = "cron")]
    cron_expr: String,
    #[arg(long, default_value = "UTC")]
    timezone: String,
    /// JSON object passed to the handler.
    #[arg(long, default_value = "{}")]
    payload: String,
    #[arg(long = "max-attempts", default_value_t = 3)]
    max_attempts: i32,
    #[arg(long)]
    disabled: bool,
}

#[derive(Args)]
struct UpdateScheduleArgs {
    id: Uuid,
    #[arg(long = "job-type")]
    job_type: Option<String>,
    #[arg(long = "cron")]
    cron_expr: Option<String>,
    #[arg(long)]
    timezone: Option<String>,
    #[arg(long)]
    payload: Option<String>,
    #[arg(long = "max-attempts")]
    max_attempts: Option<i32>,
}

#[derive(Subcommand)]
enum MatviewsCommand {
    List,
    Register {
        view_name: String,
        #[arg(long, default_value = "public")]
        schema: String,
        #[arg(long, default_value = "standard")]
        mode: String,
    },
    Update {
        id: Uuid,
        #[arg(long)]
        mode: String,
    },
    Unregister { id: Uuid },
    /// Refresh synchronously and print the outcome.
    Refresh { id: Uuid },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{}", json!({ "error": e.to_string() }));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cli.database_url)
        .await?;

    match cli.command {
        Command::Jobs(cmd) => {
            let jobs = JobStore::new(pool);
            match cmd {
                JobsCommand::List {
                    state,
                    job_type,
                    limit,
                    offset,
                } => {
                    let filter = JobFilter {
                        state: state.as_deref().map(JobState::parse).transpose()?,
                        job_type,
                        limit,
                        offset,
                    };
                    print_json(&jobs.list(filter).await?)?;
                }
                JobsCommand::Get { id } => print_json(&jobs.get(id).await?)?,
                JobsCommand::Retry { id } => print_json(&jobs.retry_now(id).await?)?,
                JobsCommand::Cancel { id } => print_json(&jobs.cancel(id).await?)?,
                JobsCommand::Stats => print_json(&jobs.stats().await?)?,
            }
        }
        Command::Schedules(cmd) => {
            let schedules = ScheduleStore::new(pool);
            match cmd {
                SchedulesCommand::List => print_json(&schedules.list().await?)?,
                SchedulesCommand::Create(args) => {
                    let payload: Value = serde_json::from_str(&args.payload)?;
                    let next_run_at =
                        cron::next_occurrence(&args.cron_expr, &args.timezone, Utc::now())?;
                    let schedule = schedules
                        .create(NewSchedule {
                            name: args.name,
                            job_type: args.job_type,
                            payload,
                            cron_expr: args.cron_expr,
                            timezone: args.timezone,
                            max_attempts: args.max_attempts,
                            enabled: !args.disabled,
                            next_run_at,
                        })
                        .await?;
                    print_json(&schedule)?;
                }
                SchedulesCommand::Update(args) => {
                    let existing = schedules.get(args.id).await?;
                    let cron_expr = args
                        .cron_expr
                        .clone()
                        .unwrap_or_else(|| existing.cron_expr.clone());
                    let timezone = args
                        .timezone
                        .clone()
                        .unwrap_or_else(|| existing.timezone.clone());
                    cron::validate(&cron_expr, &timezone)?;

                    let next_run_at = if args.cron_expr.is_some() || args.timezone.is_some() {
                        Some(cron::next_occurrence(&cron_expr, &timezone, Utc::now())?)
                    } else {
                        None
                    };

                    let payload = args
                        .payload
                        .as_deref()
                        .map(serde_json::from_str::<Value>)
                        .transpose()?;

                    let schedule = schedules
                        .update(
                            args.id,
                            ScheduleUpdate {
                                job_type: args.job_type,
                                payload,
                                cron_expr: args.cron_expr,
                                timezone: args.timezone,
                                max_attempts: args.max_attempts,
                                enabled: None,
                                next_run_at,
                            },
                        )
                        .await?;
                    print_json(&schedule)?;
                }
                SchedulesCommand::Enable { id } => {
                    let existing = schedules.get(id).await?;
                    let next_run_at =
                        cron::next_occurrence(&existing.cron_expr, &existing.timezone, Utc::now())?;
                    print_json(&schedules.set_enabled(id, true, Some(next_run_at)).await?)?;
                }
                SchedulesCommand::Disable { id } => {
                    print_json(&schedules.set_enabled(id, false, None).await?)?;
                }
                SchedulesCommand::Delete { id } => {
                    schedules.delete(id).await?;
                    print_json(&json!({ "deleted": id }))?;
                }
            }
        }
        Command::Matviews(cmd) => {
            let registry = MatviewStore::new(pool.clone());
            match cmd {
                MatviewsCommand::List => print_json(&registry.list().await?)?,
                MatviewsCommand::Register {
                    view_name,
                    schema,
                    mode,
                } => {
                    let mode = RefreshMode::parse(&mode)?;
                    print_json(&registry.register(&schema, &view_name, mode).await?)?;
                }
                MatviewsCommand::Update { id, mode } => {
                    let mode = RefreshMode::parse(&mode)?;
                    print_json(&registry.set_mode(id, mode).await?)?;
                }
                MatviewsCommand::Unregister { id } => {
                    registry.delete(id).await?;
                    print_json(&json!({ "deleted": id }))?;
                }
                MatviewsCommand::Refresh { id } => {
                    let engine = RefreshEngine::new(pool, registry);
                    print_json(&engine.refresh_now(id).await?)?;
                }
            }
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
