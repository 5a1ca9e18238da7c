//! keyshift - copy keys between Redis-protocol stores without overwriting
//!
//! Scans the source, skips keys the target already holds, and pushes the
//! rest with `MIGRATE ... COPY`.
#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, ValueEnum};
use colored::Colorize;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, warn};

use keyshift::config::{Config, LogFormat};
use keyshift::migration::{connect_stores, ConsoleReporter, MigrationRun, RunOptions, RunStatus};
use keyshift::MigrateError;

/// Exit status for setup and configuration failures
const EXIT_SETUP: u8 = 1;

/// Exit status when the keyspace sweep breaks mid-run
const EXIT_ENUMERATION: u8 = 2;

/// keyshift - non-destructive key migration between Redis-protocol stores
#[derive(Parser, Debug)]
#[command(name = "keyshift")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Source host
    #[arg(
        long = "source-host",
        value_name = "HOST",
        env = "KEYSHIFT_SOURCE_HOST",
        required_unless_present = "config"
    )]
    source_host: Option<String>,

    /// Source port
    #[arg(long = "source-port", value_name = "PORT", env = "KEYSHIFT_SOURCE_PORT")]
    source_port: Option<u16>,

    /// Source logical database
    #[arg(long = "source-db", value_name = "DB", env = "KEYSHIFT_SOURCE_DB")]
    source_db: Option<u32>,

    /// Source ACL username
    #[arg(long = "source-user", value_name = "USER", env = "KEYSHIFT_SOURCE_USER")]
    source_user: Option<String>,

    /// Source password
    #[arg(
        long = "source-password",
        value_name = "PASSWORD",
        env = "KEYSHIFT_SOURCE_PASSWORD",
        hide_env_values = true
    )]
    source_password: Option<String>,

    /// Target host
    #[arg(
        long = "target-host",
        value_name = "HOST",
        env = "KEYSHIFT_TARGET_HOST",
        required_unless_present = "config"
    )]
    target_host: Option<String>,

    /// Target port
    #[arg(long = "target-port", value_name = "PORT", env = "KEYSHIFT_TARGET_PORT")]
    target_port: Option<u16>,

    /// Target logical database
    #[arg(long = "target-db", value_name = "DB", env = "KEYSHIFT_TARGET_DB")]
    target_db: Option<u32>,

    /// Target ACL username (forwarded to MIGRATE as AUTH2)
    #[arg(long = "target-user", value_name = "USER", env = "KEYSHIFT_TARGET_USER")]
    target_user: Option<String>,

    /// Target password (forwarded to MIGRATE as AUTH)
    #[arg(
        long = "target-password",
        value_name = "PASSWORD",
        env = "KEYSHIFT_TARGET_PASSWORD",
        hide_env_values = true
    )]
    target_password: Option<String>,

    /// Check and count only; never transfer. `--dry-run=false` overrides
    /// a config file that enables it
    #[arg(
        long = "dry-run",
        value_name = "BOOL",
        env = "KEYSHIFT_DRY_RUN",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    dry_run: Option<bool>,

    /// MIGRATE timeout in milliseconds
    #[arg(long = "timeout-ms", value_name = "MS", env = "KEYSHIFT_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Connection setup timeout in milliseconds
    #[arg(long = "connect-timeout-ms", value_name = "MS", env = "KEYSHIFT_CONNECT_TIMEOUT_MS")]
    connect_timeout_ms: Option<u64>,

    /// Keys requested per SCAN call
    #[arg(long = "chunk-size", value_name = "N", env = "KEYSHIFT_CHUNK_SIZE")]
    chunk_size: Option<usize>,

    /// Concurrent per-key workers
    #[arg(short = 'w', long = "workers", value_name = "N", env = "KEYSHIFT_WORKERS")]
    workers: Option<usize>,

    /// Only migrate keys matching this glob pattern
    #[arg(long = "match", value_name = "PATTERN", env = "KEYSHIFT_MATCH")]
    pattern: Option<String>,

    /// Path to configuration file (TOML)
    #[arg(short = 'c', long = "config", value_name = "FILE", env = "KEYSHIFT_CONFIG")]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'l', long = "log-level", value_name = "LEVEL", env = "KEYSHIFT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log output format
    #[arg(long = "log-format", value_enum, env = "KEYSHIFT_LOG_FORMAT")]
    log_format: Option<LogFormatArg>,

    /// Print one JSON object per key, then the summary, instead of text
    #[arg(long = "json", action = ArgAction::SetTrue)]
    json: bool,
}

/// CLI-friendly log format enum
#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormatArg {
    /// Human-readable
    Pretty,
    /// One JSON object per event
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

impl Cli {
    /// Apply flags and environment variables on top of `config`.
    fn apply_to_config(&self, config: &mut Config) {
        let source = &mut config.source;
        if let Some(host) = &self.source_host {
            source.host = host.clone();
        }
        if let Some(port) = self.source_port {
            source.port = port;
        }
        if let Some(db) = self.source_db {
            source.db = db;
        }
        if self.source_user.is_some() {
            source.username = self.source_user.clone();
        }
        if self.source_password.is_some() {
            source.password = self.source_password.clone();
        }

        let target = &mut config.target;
        if let Some(host) = &self.target_host {
            target.host = host.clone();
        }
        if let Some(port) = self.target_port {
            target.port = port;
        }
        if let Some(db) = self.target_db {
            target.db = db;
        }
        if self.target_user.is_some() {
            target.username = self.target_user.clone();
        }
        if self.target_password.is_some() {
            target.password = self.target_password.clone();
        }

        let migration = &mut config.migration;
        if let Some(dry_run) = self.dry_run {
            migration.dry_run = dry_run;
        }
        if let Some(ms) = self.timeout_ms {
            migration.timeout_ms = ms;
        }
        if let Some(ms) = self.connect_timeout_ms {
            migration.connect_timeout_ms = ms;
        }
        if let Some(n) = self.chunk_size {
            migration.chunk_size = n;
        }
        if let Some(n) = self.workers {
            migration.workers = n;
        }
        if self.pattern.is_some() {
            migration.pattern = self.pattern.clone();
        }

        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = self.log_format {
            config.logging.format = format.into();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            return ExitCode::from(EXIT_SETUP);
        }
    };

    init_logging(&config);

    match run(&cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            exit_code(&e)
        }
    }
}

/// Defaults, then the optional config file, then flags and environment.
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    cli.apply_to_config(&mut config);
    config.validate()?;
    Ok(config)
}

fn init_logging(config: &Config) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    // Logs go to stderr so stdout carries only the report.
    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().pretty().with_writer(std::io::stderr))
                .init();
        }
    }
}

async fn run(cli: &Cli, config: Config) -> anyhow::Result<()> {
    let destination = config.target_location();
    if !cli.json {
        println!(
            "{} Migrating {} → {}{}",
            "→".cyan().bold(),
            format!("{}/{}", config.source.endpoint(), config.source.db).yellow(),
            destination.to_string().yellow(),
            if config.migration.dry_run {
                " (dry run)".dimmed().to_string()
            } else {
                String::new()
            }
        );
    }

    let (source, target) = connect_stores(&config).await?;
    if !cli.json {
        println!("  {} source {}", "✓".green(), source.endpoint());
        println!("  {} target {}", "✓".green(), target.endpoint());
        println!();
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            return;
        }
        warn!("Shutdown signal received, finishing in-flight keys");
        let _ = shutdown_tx.send(true);
    });

    let summary = MigrationRun::new(
        source,
        target,
        &destination,
        RunOptions::from(&config.migration),
    )
    .with_reporter(Arc::new(ConsoleReporter::stdout(cli.json)))
    .with_shutdown(shutdown_rx)
    .run()
    .await?;

    if summary.status == RunStatus::Cancelled {
        warn!("run cancelled before the keyspace sweep completed");
    }
    Ok(())
}

fn exit_code(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<MigrateError>() {
        Some(MigrateError::Enumeration { .. }) | Some(MigrateError::Worker(_)) => {
            ExitCode::from(EXIT_ENUMERATION)
        }
        _ => ExitCode::from(EXIT_SETUP),
    }
}
