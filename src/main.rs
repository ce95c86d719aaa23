use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::Parser;
use pg_sync::background_jobs::{create_scheduler, BackgroundJob};
use pg_sync::config::{
    CliConfig, DEFAULT_HOST, DEFAULT_MAX_ATTEMPTS, DEFAULT_PORT, DEFAULT_RETRY_DELAY_MS,
    DEFAULT_TIMEZONE,
};
use pg_sync::server::{self, metrics};
use pg_sync::sync::DEFAULT_MAX_OUTPUT_BYTES;
use pg_sync::{AppConfig, DatabaseSyncJob, FileConfig, ProcessRunner, RequestsLoggingLevel, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[clap(version, about = "Copies a PostgreSQL database into another one on a cron schedule")]
struct CliArgs {
    /// Path to a TOML config file. Its values override flags and environment.
    #[clap(long, env = "CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Connection string of the database to copy from.
    #[clap(long, env = "DATABASE_URL_SOURCE", hide_env_values = true)]
    pub source_url: Option<String>,

    /// Connection string of the database to overwrite.
    #[clap(long, env = "DATABASE_URL_TARGET", hide_env_values = true)]
    pub target_url: Option<String>,

    /// Cron expression (5, 6 or 7 fields) for recurring syncs.
    #[clap(long, env = "SCHEDULE_TIME")]
    pub schedule: Option<String>,

    /// IANA timezone the schedule is evaluated in.
    #[clap(long, env = "SCHEDULE_TIMEZONE", default_value = DEFAULT_TIMEZONE)]
    pub timezone: String,

    /// Also sync once right after startup.
    #[clap(long, env = "RUN_ON_STARTUP", value_parser = BoolishValueParser::new())]
    pub run_on_startup: bool,

    /// Total attempts per scheduled sync.
    #[clap(long, env = "FAILOVER_RETRIES", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub retries: u32,

    /// Wait between attempts, in milliseconds.
    #[clap(long, env = "FAILOVER_RETRY_DELAY_MS", default_value_t = DEFAULT_RETRY_DELAY_MS)]
    pub retry_delay_ms: u64,

    /// Address the liveness endpoint binds to.
    #[clap(long, env = "HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// The port to listen on.
    #[clap(short, long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// The port for the metrics server (Prometheus scraping). Disabled if unset.
    #[clap(long, env = "METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// The level of logging to perform on each request.
    #[clap(long, env = "REQUESTS_LOGGING_LEVEL", default_value = "path")]
    pub logging_level: RequestsLoggingLevel,

    /// Directory where dump files are written.
    #[clap(long, env = "ARTIFACT_DIR", default_value = ".")]
    pub artifact_dir: PathBuf,

    #[clap(long, env = "PG_DUMP_BIN", default_value = "pg_dump")]
    pub pg_dump_bin: String,

    #[clap(long, env = "PSQL_BIN", default_value = "psql")]
    pub psql_bin: String,

    /// Extra pg_dump arguments, split like a shell would.
    #[clap(long, env = "PG_DUMP_EXTRA_ARGS", allow_hyphen_values = true)]
    pub pg_dump_extra_args: Option<String>,

    /// Extra psql arguments, split like a shell would.
    #[clap(long, env = "PSQL_EXTRA_ARGS", allow_hyphen_values = true)]
    pub psql_extra_args: Option<String>,

    /// Cap on captured stdout/stderr of each command, in bytes.
    #[clap(long, env = "MAX_OUTPUT_BYTES", default_value_t = DEFAULT_MAX_OUTPUT_BYTES)]
    pub max_output_bytes: usize,
}

impl From<CliArgs> for CliConfig {
    fn from(args: CliArgs) -> Self {
        CliConfig {
            source_url: args.source_url,
            target_url: args.target_url,
            schedule: args.schedule,
            timezone: args.timezone,
            run_on_startup: args.run_on_startup,
            retries: args.retries,
            retry_delay_ms: args.retry_delay_ms,
            host: args.host,
            port: args.port,
            metrics_port: args.metrics_port,
            logging_level: args.logging_level,
            artifact_dir: args.artifact_dir,
            pg_dump_bin: args.pg_dump_bin,
            psql_bin: args.psql_bin,
            pg_dump_extra_args: args.pg_dump_extra_args,
            psql_extra_args: args.psql_extra_args,
            max_output_bytes: args.max_output_bytes,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is not an error
    dotenv::dotenv().ok();

    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    info!(
        "pg-sync {} ({}, {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_PROFILE")
    );

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config file {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let config = AppConfig::resolve(&CliConfig::from(cli_args), file_config)
        .context("Invalid configuration")?;

    info!(
        "Syncing on schedule {} with up to {} attempt(s), {}ms apart",
        config.schedule.cron, config.retry.max_attempts, config.retry.delay_ms
    );
    if config.schedule.run_on_startup {
        info!("A sync will also run now, at startup");
    }

    metrics::init_metrics();

    let shutdown = CancellationToken::new();

    // Bind before anything is scheduled: a busy port is fatal
    let server_config = ServerConfig::from(&config);
    let listener = server::bind(&server_config).await?;

    let metrics_task = config.metrics_port.map(|port| {
        let host = config.host.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::run_metrics_server(&host, port, shutdown).await {
                error!("Metrics server failed: {:#}", e);
            }
        })
    });

    let (mut scheduler, scheduler_handle) = create_scheduler(shutdown.clone());
    let sync_job = Arc::new(DatabaseSyncJob::from_config(&config, Arc::new(ProcessRunner)));
    let sync_job_id = sync_job.id();
    scheduler.register_job(sync_job).await;

    let mut server_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { server::serve(listener, &server_config, shutdown).await }
    });
    let scheduler_task = tokio::spawn(async move { scheduler.run().await });

    let early_exit = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown requested");
            None
        }
        result = &mut server_task => Some(result),
    };

    shutdown.cancel();

    let server_result = match early_exit {
        Some(result) => result,
        None => server_task.await,
    };
    if let Err(e) = scheduler_task.await {
        error!("Scheduler task failed: {}", e);
    }
    if let Some(task) = metrics_task {
        let _ = task.await;
    }

    if let Some(run) = scheduler_handle.last_run(sync_job_id).await {
        info!(
            "Last sync: {:?} (triggered by {}, started {}, took {:?})",
            run.status, run.triggered_by, run.started_at, run.duration
        );
    }

    server_result.context("HTTP server task failed")??;
    info!("Bye");
    Ok(())
}
