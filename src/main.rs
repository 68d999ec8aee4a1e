//! rekur - Materializes recurring task templates into concrete task instances.
//!
//! Usage:
//!   rekur run                      Run the worker pool and the daily sweep
//!   rekur template create ...      Create a template and enqueue its generation
//!   rekur tasks <template-id>      List the instances of a template
//!   rekur rule <rule> --start ...  Preview the occurrences of a rule
//!   rekur dlq list|replay          Inspect and replay dead-lettered jobs

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use rekur::{
    AppConfig, ConfigLoader, Dispatcher, Event, EventBus, EventHandler, GenerationHandler,
    GenerationService, GoalId, JobId, JobQueue, NewTemplate, SqliteJobQueue, SqliteStore,
    SweepScheduler, TemplateChanges, TemplateId, TemplateService, UserId, WorkerPool, preview,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// rekur - recurring task materialization engine
#[derive(Parser)]
#[command(name = "rekur")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a rekur.yaml configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path, overriding the configuration (`:memory:` for a throwaway store)
    #[arg(long, global = true)]
    database: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool and the periodic sweep until interrupted
    Run {
        /// Enqueue one sweep immediately after startup
        #[arg(long)]
        sweep_now: bool,
    },

    /// Manage recurrence templates
    #[command(subcommand)]
    Template(TemplateCommand),

    /// List the task instances materialized from a template
    Tasks {
        #[arg(value_name = "TEMPLATE_ID")]
        template_id: i64,

        #[arg(short, long)]
        user: i64,
    },

    /// Print the first occurrences of a recurrence rule
    Rule {
        /// RRULE text, e.g. FREQ=WEEKLY;BYDAY=MO,WE,FR
        #[arg(value_name = "RULE")]
        rule: String,

        /// Series start (RFC 3339)
        #[arg(long)]
        start: DateTime<Utc>,

        #[arg(short = 'n', long, default_value = "10")]
        count: u16,
    },

    /// Inspect and replay dead-lettered jobs
    #[command(subcommand)]
    Dlq(DlqCommand),
}

#[derive(Subcommand)]
enum TemplateCommand {
    /// Create a template
    Create(TemplateFields),

    /// Replace every field of a template
    Update {
        #[arg(value_name = "TEMPLATE_ID")]
        template_id: i64,

        #[command(flatten)]
        fields: TemplateFields,
    },

    /// Delete a template and its future instances
    Delete {
        #[arg(value_name = "TEMPLATE_ID")]
        template_id: i64,

        #[arg(short, long)]
        user: i64,
    },

    /// List the templates of a user
    List {
        #[arg(short, long)]
        user: i64,
    },
}

#[derive(Args)]
struct TemplateFields {
    #[arg(short, long)]
    user: i64,

    #[arg(short, long)]
    goal: i64,

    #[arg(short, long)]
    title: String,

    /// First occurrence (RFC 3339)
    #[arg(long)]
    start: DateTime<Utc>,

    /// RRULE text
    #[arg(short, long)]
    rule: String,

    #[arg(short, long, default_value = "30")]
    duration: i32,

    /// Ignore the time of day of the occurrences
    #[arg(long)]
    all_day: bool,
}

#[derive(Subcommand)]
enum DlqCommand {
    /// List dead-lettered jobs
    List {
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Move a dead-lettered job back to its queue
    Replay {
        #[arg(value_name = "JOB_ID")]
        job_id: JobId,
    },
}

/// Event handler that logs job lifecycle events.
struct LoggingHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::JobStarted {
                job_id,
                kind,
                attempt,
                ..
            } => {
                info!(job_id = %job_id, job_type = %kind, attempt, "Job started");
            }
            Event::JobSucceeded {
                job_id,
                kind,
                duration,
                ..
            } => {
                info!(job_id = %job_id, job_type = %kind, ?duration, "Job succeeded");
            }
            Event::JobRetrying {
                job_id,
                kind,
                attempt,
                max_attempts,
                error,
                retry_at,
                ..
            } => {
                warn!(
                    job_id = %job_id,
                    job_type = %kind,
                    attempt,
                    max_attempts,
                    retry_at = %retry_at,
                    "Job failed, retrying: {}",
                    error
                );
            }
            Event::JobDeadLettered {
                job_id,
                kind,
                attempts,
                error,
                ..
            } => {
                error!(
                    job_id = %job_id,
                    job_type = %kind,
                    attempts,
                    "Job dead-lettered: {}",
                    error
                );
            }
            Event::SweepEnqueued { job_id, .. } => {
                info!(job_id = %job_id, "Sweep enqueued");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config, cli.database)?;

    match cli.command {
        Commands::Run { sweep_now } => run(config, sweep_now).await?,
        Commands::Template(command) => template(config, command).await?,
        Commands::Tasks { template_id, user } => {
            list_tasks(config, TemplateId::new(template_id), UserId::new(user)).await?
        }
        Commands::Rule { rule, start, count } => preview_rule(&rule, start, count)?,
        Commands::Dlq(command) => dlq(config, command).await?,
    }

    Ok(())
}

fn load_config(
    path: Option<PathBuf>,
    database: Option<String>,
) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let mut config = match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            ConfigLoader::load(&path)?
        }
        None => AppConfig::default(),
    };

    if let Some(database) = database {
        config.database = database;
        ConfigLoader::validate(&config)?;
    }
    Ok(config)
}

async fn open_store(config: &AppConfig) -> Result<SqliteStore, Box<dyn std::error::Error>> {
    let store = if config.is_in_memory() {
        warn!("Using an in-memory database; nothing survives this process");
        SqliteStore::in_memory().await?
    } else {
        SqliteStore::new(&config.database).await?
    };
    Ok(store)
}

/// Run the worker pool and the sweep scheduler until Ctrl+C.
async fn run(config: AppConfig, sweep_now: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(open_store(&config).await?);
    let queue: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::new(&store));
    let dispatcher =
        Dispatcher::new(Arc::clone(&queue)).with_regenerate_delay(config.regenerate_delay());

    let event_bus = Arc::new(EventBus::new());
    event_bus.register(Arc::new(LoggingHandler)).await;

    let service = Arc::new(GenerationService::new(
        Arc::clone(&store),
        config.expander(),
    ));
    let handler = Arc::new(GenerationHandler::new(service));

    let worker_config = config.worker_config();
    info!(
        concurrency = worker_config.concurrency,
        horizon_months = config.horizon_months,
        "Starting worker pool"
    );
    let pool = WorkerPool::new(Arc::clone(&queue), handler, worker_config)
        .with_event_bus(Arc::clone(&event_bus))
        .start();

    let schedule = config.sweep_schedule()?;
    info!(
        schedule = schedule.expression(),
        timezone = schedule.timezone(),
        "Starting sweep scheduler"
    );
    let scheduler = SweepScheduler::new(schedule, dispatcher)
        .with_event_bus(Arc::clone(&event_bus))
        .with_shutdown_timeout(Duration::from_secs(config.sweep.shutdown_timeout_secs));
    let (handle, scheduler_task) = scheduler.start();

    if sweep_now {
        let job_id = handle.trigger().await?;
        info!(job_id = %job_id, "Initial sweep enqueued");
    }

    info!("Press Ctrl+C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            handle.shutdown().await?;
        }
        _ = scheduler_task => {
            warn!("Scheduler stopped");
        }
    }

    if !pool.shutdown().await {
        warn!("Workers did not drain in time; unfinished jobs are redelivered after their lease");
    }
    store.close().await;

    info!("Goodbye!");
    Ok(())
}

async fn template_service(
    config: &AppConfig,
) -> Result<(Arc<SqliteStore>, TemplateService<SqliteStore>), Box<dyn std::error::Error>> {
    let store = Arc::new(open_store(config).await?);
    let queue: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::new(&store));
    let dispatcher = Dispatcher::new(queue).with_regenerate_delay(config.regenerate_delay());
    let service = TemplateService::new(Arc::clone(&store), dispatcher);
    Ok((store, service))
}

async fn template(
    config: AppConfig,
    command: TemplateCommand,
) -> Result<(), Box<dyn std::error::Error>> {
    let (store, service) = template_service(&config).await?;

    match command {
        TemplateCommand::Create(fields) => {
            let created = service
                .create(NewTemplate {
                    user_id: UserId::new(fields.user),
                    goal_id: GoalId::new(fields.goal),
                    title: fields.title,
                    anchor: fields.start,
                    has_time: !fields.all_day,
                    duration_minutes: fields.duration,
                    rule: fields.rule,
                })
                .await?;
            println!("Created template {}", created.id);
            println!("Instances are materialized once `rekur run` processes the queue.");
        }
        TemplateCommand::Update {
            template_id,
            fields,
        } => {
            let updated = service
                .update(
                    TemplateId::new(template_id),
                    UserId::new(fields.user),
                    TemplateChanges {
                        goal_id: GoalId::new(fields.goal),
                        title: fields.title,
                        anchor: fields.start,
                        has_time: !fields.all_day,
                        duration_minutes: fields.duration,
                        rule: fields.rule,
                    },
                )
                .await?;
            println!("Updated template {}", updated.id);
        }
        TemplateCommand::Delete { template_id, user } => {
            service
                .delete(TemplateId::new(template_id), UserId::new(user))
                .await?;
            println!("Deleted template {}", template_id);
        }
        TemplateCommand::List { user } => {
            let templates = service.list(UserId::new(user)).await?;
            if templates.is_empty() {
                println!("No templates for user {}", user);
            }
            for template in &templates {
                println!("ID: {}", template.id);
                println!("  Title: {}", template.title);
                println!("  Rule: {}", template.rule);
                println!("  Start: {}", template.anchor.to_rfc3339());
                match template.last_generated_at {
                    Some(watermark) => println!("  Generated up to: {}", watermark.to_rfc3339()),
                    None => println!("  Generated up to: never"),
                }
                println!();
            }
        }
    }

    store.close().await;
    Ok(())
}

async fn list_tasks(
    config: AppConfig,
    template_id: TemplateId,
    user_id: UserId,
) -> Result<(), Box<dyn std::error::Error>> {
    let (store, service) = template_service(&config).await?;
    let tasks = service.tasks(template_id, user_id).await?;

    println!("Tasks of template {} ({}):", template_id, tasks.len());
    for task in &tasks {
        let time = task
            .scheduled_time
            .map(|t| format!(" {}", t.format("%H:%M")))
            .unwrap_or_default();
        let done = if task.is_done { " [done]" } else { "" };
        println!("  - {}{} {}{}", task.scheduled_date, time, task.title, done);
    }

    store.close().await;
    Ok(())
}

fn preview_rule(
    rule: &str,
    start: DateTime<Utc>,
    count: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let occurrences = preview(rule, start, count)?;
    for occurrence in &occurrences {
        println!("{}", occurrence.to_rfc3339());
    }
    Ok(())
}

async fn dlq(config: AppConfig, command: DlqCommand) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(&config).await?;
    let queue = SqliteJobQueue::new(&store);

    match command {
        DlqCommand::List { limit } => {
            let jobs = queue.dead_letters(limit).await?;
            if jobs.is_empty() {
                println!("No dead-lettered jobs");
            }
            for job in &jobs {
                println!("ID: {}", job.id);
                println!("  Type: {}", job.kind);
                println!("  Queue: {}", job.queue.as_str());
                println!("  Attempts: {}", job.attempts);
                println!("  Payload: {}", job.payload);
                if let Some(err) = &job.last_error {
                    println!("  Last error: {}", err);
                }
                println!();
            }
        }
        DlqCommand::Replay { job_id } => {
            queue.replay(job_id, Utc::now()).await?;
            println!("Replayed job {}", job_id);
        }
    }

    store.close().await;
    Ok(())
}
