mod config;
mod sessions;
mod watch;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;

use iterlog_db::{Database, KvStore};
use iterlog_logging::{init_tracing, LogFormat, Logger};
use iterlog_sessions::{parse_replay, replay, EndOutcome, IterationStore, StoreOptions};

use config::ProjectConfig;
use sessions::SessionsAction;

#[derive(Parser, Debug)]
#[command(
    name = "iterlog",
    about = "Per-agent iteration history built from the agent log bus",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Database file (default: iterlog.toml, then the user data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Tracing filter (default: warn)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormatChoice>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Feed a recorded JSONL file through the store
    Replay {
        file: PathBuf,

        /// Leave sessions that are still current at the end open
        #[arg(long)]
        keep_open: bool,

        /// Also append every log entry to this JSONL file
        #[arg(long)]
        log_file: Option<PathBuf>,
    },

    /// Follow a JSONL file as it grows
    Watch {
        file: PathBuf,

        /// Also append every log entry to this JSONL file
        #[arg(long)]
        log_file: Option<PathBuf>,
    },

    /// Show an agent's current session
    Current {
        agent: String,

        /// Number of recent tool calls to show
        #[arg(long, default_value_t = 10)]
        tools: usize,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Browse archived sessions
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },

    /// Estimated storage used by an agent
    Usage {
        agent: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Dump the store's internal state as JSON
    Debug,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatChoice {
    Pretty,
    Json,
    Compact,
    Quiet,
}

impl From<LogFormatChoice> for LogFormat {
    fn from(choice: LogFormatChoice) -> Self {
        match choice {
            LogFormatChoice::Pretty => LogFormat::Pretty,
            LogFormatChoice::Json => LogFormat::Json,
            LogFormatChoice::Compact => LogFormat::Compact,
            LogFormatChoice::Quiet => LogFormat::Quiet,
        }
    }
}

/// Config file values with command-line overrides applied.
struct Settings {
    db_path: Option<PathBuf>,
    log_level: String,
    log_format: LogFormat,
    log_dir: Option<PathBuf>,
    store: StoreOptions,
    logger_capacity: usize,
    poll_interval: Duration,
}

impl Settings {
    fn resolve(cli: &Cli, config: &ProjectConfig) -> Result<Self> {
        let log_format = match cli.log_format {
            Some(choice) => choice.into(),
            None => config.log_format()?.unwrap_or_default(),
        };

        Ok(Self {
            db_path: cli.db.clone().or_else(|| config.database_path.clone()),
            log_level: cli
                .log_level
                .clone()
                .or_else(|| config.log_level.clone())
                .unwrap_or_else(|| "warn".to_string()),
            log_format,
            log_dir: config.log_dir.clone(),
            store: config.store_options(),
            logger_capacity: config.logger_capacity(),
            poll_interval: config.poll_interval(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let working_dir = std::env::current_dir().context("Failed to get current directory")?;
    let config = ProjectConfig::discover(&working_dir)?.unwrap_or_default();
    let settings = Settings::resolve(&cli, &config)?;

    let _guard = init_tracing(
        &settings.log_level,
        settings.log_format,
        settings.log_dir.as_deref(),
    );

    let database = match settings.db_path {
        Some(ref path) => Database::open_at(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?,
        None => Database::open().context("Failed to open database")?,
    };
    let kv: Arc<dyn KvStore> = Arc::new(database);
    let store = IterationStore::open(kv, settings.store.clone()).await;

    match cli.command {
        Commands::Replay {
            file,
            keep_open,
            log_file,
        } => {
            let logger = build_logger(&settings, log_file.as_deref())?;
            run_replay(&store, &logger, file, keep_open).await?;
        }
        Commands::Watch { file, log_file } => {
            let logger = Arc::new(build_logger(&settings, log_file.as_deref())?);
            watch::watch_file(Arc::clone(&store), logger, &file, settings.poll_interval).await?;
        }
        Commands::Current { agent, tools, json } => {
            sessions::show_current(&store, &agent, tools, json)?;
        }
        Commands::Sessions { action } => {
            sessions::handle_sessions_command(&store, action).await?;
        }
        Commands::Usage { agent, json } => {
            sessions::show_usage(&store, &agent, json).await?;
        }
        Commands::Debug => {
            println!("{}", serde_json::to_string_pretty(&store.debug())?);
        }
    }

    Ok(())
}

fn build_logger(settings: &Settings, log_file: Option<&Path>) -> Result<Logger> {
    let logger = Logger::with_capacity(settings.log_format, settings.logger_capacity);
    match log_file {
        Some(path) => logger
            .with_file(path)
            .with_context(|| format!("Failed to open log file {}", path.display())),
        None => Ok(logger),
    }
}

async fn run_replay(
    store: &Arc<IterationStore>,
    logger: &Logger,
    file: PathBuf,
    keep_open: bool,
) -> Result<()> {
    let lines = parse_replay(&file)?;
    store.attach(logger);

    let mut summary = replay(store, logger, lines).await;

    if !keep_open {
        for (agent, outcome) in flush_current_sessions(store).await {
            match outcome {
                EndOutcome::Archived { .. } => summary.sessions_archived += 1,
                EndOutcome::Retained { ref session_id } => {
                    summary.sessions_retained += 1;
                    eprintln!(
                        "{} session {} of {} could not be archived",
                        "warning:".bright_yellow(),
                        session_id,
                        agent
                    );
                }
                EndOutcome::NoSession | EndOutcome::InProgress => {}
            }
        }
    }

    eprintln!();
    eprintln!("=== REPLAYED {} ===", file.display());
    eprintln!("Entries: {}", summary.entries);
    eprintln!("Sessions started: {}", summary.sessions_started);
    eprintln!("Sessions archived: {}", summary.sessions_archived);
    if summary.sessions_retained > 0 {
        eprintln!(
            "{}",
            format!("Sessions retained: {}", summary.sessions_retained).bright_red()
        );
    }
    Ok(())
}

/// End every session that is still current.
async fn flush_current_sessions(store: &IterationStore) -> Vec<(String, EndOutcome)> {
    let agents: Vec<String> = store.debug().current_sessions.into_keys().collect();

    let mut outcomes = Vec::with_capacity(agents.len());
    for agent in agents {
        let outcome = store.end_session(&agent).await;
        outcomes.push((agent, outcome));
    }
    outcomes
}
