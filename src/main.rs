//! kairos - scheduled job execution engine.
//!
//! Usage:
//!   kairos validate <config>        Validate a configuration file
//!   kairos preview <recurrence>     Print upcoming occurrences of a recurrence
//!   kairos run <config>             Run a worker with the configured store

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use kairos::{
    Clock, ConfigLoader, EngineConfig, Event, EventBus, EventHandler, ExecutionEngine, HandlerRegistry,
    InMemoryJobStore, JobStore, JobType, LogHandler, QueueDispatcher, RecurrenceEngine,
    ScheduleManager, ScheduleRecurrence, StorageConfig, SystemClock, Worker,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Upper bound for `preview -n`.
const MAX_PREVIEW_COUNT: i64 = 1000;

/// kairos - scheduled job execution engine
#[derive(Parser)]
#[command(name = "kairos")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file without running
    Validate {
        /// Path to the YAML configuration file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// Print the upcoming occurrences of a recurrence expression
    Preview {
        /// Recurrence such as "@daily" or "@every 15m"
        #[arg(value_name = "RECURRENCE")]
        recurrence: String,

        /// First run as RFC 3339 (default: now)
        #[arg(long)]
        from: Option<String>,

        /// Number of occurrences to print (1 to 1000)
        #[arg(
            short = 'n',
            long,
            default_value = "5",
            value_parser = clap::value_parser!(u32).range(1..=MAX_PREVIEW_COUNT)
        )]
        count: u32,

        /// IANA timezone the recurrence is evaluated in
        #[arg(long, default_value = "UTC")]
        timezone: String,
    },

    /// Run a worker with the configured store and seeded jobs
    Run {
        /// Path to the YAML configuration file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },
}

/// Logs job lifecycle events.
struct LoggingHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::JobScheduled {
                job_id,
                job_type,
                run_at,
                ..
            } => {
                info!("Job '{}' ({}) scheduled for {}", job_id, job_type, run_at);
            }
            Event::JobSucceeded {
                job_id,
                duration,
                next_run_at,
                ..
            } => match next_run_at {
                Some(next) => info!(
                    "Job '{}' succeeded in {:?}, next run at {}",
                    job_id, duration, next
                ),
                None => info!("Job '{}' completed in {:?}", job_id, duration),
            },
            Event::JobRetryScheduled {
                job_id,
                error,
                retry_count,
                max_retries,
                run_at,
                ..
            } => {
                warn!(
                    "Job '{}' failed (retry {}/{} at {}): {}",
                    job_id, retry_count, max_retries, run_at, error
                );
            }
            Event::JobFailed { job_id, error, .. } => {
                error!("Job '{}' failed permanently: {}", job_id, error);
            }
            Event::JobCanceled { job_id, .. } => {
                info!("Job '{}' canceled", job_id);
            }
            _ => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => validate_config(config)?,
        Commands::Preview {
            recurrence,
            from,
            count,
            timezone,
        } => preview(&recurrence, from.as_deref(), count, &timezone)?,
        Commands::Run { config } => run(config).await?,
    }

    Ok(())
}

/// Validate a configuration file.
fn validate_config(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating configuration: {}", path.display());

    match ConfigLoader::load_at(&path, SystemClock.now()) {
        Ok(config) => {
            info!(
                "Configuration is valid: {} seeded job(s), {} storage",
                config.jobs.len(),
                match config.storage {
                    StorageConfig::Memory => "memory",
                    StorageConfig::Sqlite { .. } => "sqlite",
                }
            );
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e.into())
        }
    }
}

/// Print upcoming occurrences.
fn preview(
    expression: &str,
    from: Option<&str>,
    count: u32,
    timezone: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let recurrence = ScheduleRecurrence::parse(expression)?.with_timezone(timezone)?;
    let from = match from {
        Some(raw) => DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc),
        None => Utc::now(),
    };
    recurrence.validate(from)?;

    if !recurrence.is_recurring() {
        println!("{} runs once at {}", recurrence, from);
        return Ok(());
    }

    println!("Occurrences of {} after {}:", recurrence, from);
    for occurrence in RecurrenceEngine::next_n(&recurrence, from, count as usize)? {
        println!("  {}", occurrence);
    }

    Ok(())
}

/// Run a worker against the configured store.
async fn run(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigLoader::load_at(&path, SystemClock.now())?;

    match config.storage.clone() {
        StorageConfig::Memory => {
            info!("Using in-memory job store");
            run_worker(Arc::new(InMemoryJobStore::new()), config).await
        }
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => {
            info!("Using SQLite job store at {}", path);
            let store = Arc::new(kairos::SqliteJobStore::new(&path).await?);
            let result = run_worker(Arc::clone(&store), config).await;
            store.close().await;
            result
        }
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => {
            Err("SQLite storage requires building with the 'sqlite' feature".into())
        }
    }
}

async fn run_worker<S: JobStore + 'static>(
    store: Arc<S>,
    config: EngineConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let event_bus = Arc::new(EventBus::new());
    event_bus.register(Arc::new(LoggingHandler)).await;

    let log_type = JobType::Custom("log".into());
    let registry = HandlerRegistry::new().with_handler(log_type, Arc::new(LogHandler::new()))?;

    let (dispatcher, receiver) = QueueDispatcher::new();
    let dispatcher = Arc::new(dispatcher);
    let clock = Arc::new(SystemClock);

    let mut engine = ExecutionEngine::new(
        Arc::clone(&store),
        Arc::new(registry),
        dispatcher.clone(),
        clock.clone(),
    )
    .with_event_bus(event_bus)
    .with_worker_id(config.worker_id())
    .with_default_timeout(config.default_timeout())
    .with_retry_policy(config.retry_policy());
    for (job_type, timeout) in config.type_timeouts() {
        engine = engine.with_type_timeout(job_type, timeout);
    }

    let manager = Arc::new(
        ScheduleManager::new(store, Arc::new(engine), dispatcher, clock.clone())
            .with_due_batch_size(config.batch_size),
    );

    let now = clock.now();
    for seed in &config.jobs {
        let definition = kairos::config::build_definition(seed, config.default_max_retries, now)?;
        manager.schedule(definition).await?;
    }

    let mut worker = Worker::new(Arc::clone(&manager))
        .with_dispatch_receiver(receiver)
        .with_tick_interval(config.tick_interval())
        .with_max_concurrent_jobs(config.max_concurrent_jobs)
        .with_shutdown_timeout(config.shutdown_timeout());
    if let Some(lease) = config.claim_lease() {
        worker = worker.with_claim_lease(lease);
    }

    info!(
        "Starting worker '{}' (tick interval: {}s)...",
        manager.engine().worker_id(),
        config.tick_interval_secs
    );
    info!("Press Ctrl+C to stop");

    let (handle, worker_task) = worker.start();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            handle.shutdown().await?;
        }
        _ = worker_task => {
            info!("Worker stopped");
        }
    }

    Ok(())
}
