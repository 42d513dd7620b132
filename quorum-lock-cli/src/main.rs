//! quorum-lock - a contender process for Redlock-style locks.
//!
//! # Commands
//!
//! - `quorum-lock run <instance-id>` - Repeatedly acquire, hold and release the lock
//! - `quorum-lock config` - Validate and print the effective configuration
//!
//! Start several `run` processes with different instance ids against the
//! same Redis instances to watch them take turns.

use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

mod commands;
mod config;
mod error;
mod logging;

use config::{AppConfig, FileFormat};
use error::CliResult;
use logging::LogConfig;

/// Distributed lock contender
#[derive(Parser)]
#[command(name = "quorum-lock")]
#[command(author = "Pegasus Heavy Industries LLC")]
#[command(version)]
#[command(about = "Contend for a quorum lock across independent Redis instances")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (TOML or JSON)
    #[arg(short, long, global = true, env = "QUORUM_LOCK_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

/// Flags that override the config file.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Lock key
    #[arg(long, global = true, env = "QUORUM_LOCK_KEY")]
    key: Option<String>,

    /// Lock TTL in milliseconds
    #[arg(long, global = true, env = "QUORUM_LOCK_TTL_MS")]
    ttl_ms: Option<u64>,

    /// Redis endpoint; repeat or comma-separate for several
    #[arg(long = "endpoint", global = true, value_delimiter = ',')]
    endpoints: Vec<String>,

    /// Attempts per acquire call
    #[arg(long, global = true)]
    max_attempts: Option<u32>,

    /// Shortest simulated work in milliseconds
    #[arg(long, global = true)]
    work_min_ms: Option<u64>,

    /// Longest simulated work in milliseconds
    #[arg(long, global = true)]
    work_max_ms: Option<u64>,
}

impl Overrides {
    fn apply(self, config: &mut AppConfig) {
        if let Some(key) = self.key {
            config.key = key;
        }
        if let Some(ttl) = self.ttl_ms {
            config.ttl = Duration::from_millis(ttl);
        }
        if !self.endpoints.is_empty() {
            config.redis.endpoints = self.endpoints;
        }
        if let Some(max_attempts) = self.max_attempts {
            config.lock.max_attempts = max_attempts;
        }
        if let Some(min) = self.work_min_ms {
            config.work_min = Duration::from_millis(min);
        }
        if let Some(max) = self.work_max_ms {
            config.work_max = Duration::from_millis(max);
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire, hold and release the lock in a loop
    #[command(alias = "r")]
    Run {
        /// Name of this contender in log output
        instance: String,

        /// Stop after this many rounds
        #[arg(long)]
        rounds: Option<u64>,
    },

    /// Validate and print the effective configuration
    #[command(alias = "c")]
    Config {
        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Toml)]
        format: OutputFormat,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Toml,
    Json,
}

impl From<OutputFormat> for FileFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Toml => FileFormat::Toml,
            OutputFormat::Json => FileFormat::Json,
        }
    }
}

#[tokio::main]
async fn main() {
    // Load .env before clap reads env-backed flags.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        eprintln!("{} {}", "error:".red().bold(), e);
        process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let mut log_config = LogConfig::from_env().with_verbosity(cli.verbose, cli.quiet);
    if cli.no_color {
        log_config.color = false;
    }
    logging::init(&log_config)?;

    let mut config = AppConfig::load(cli.config.as_deref())?;
    cli.overrides.apply(&mut config);

    match cli.command {
        Commands::Run { instance, rounds } => {
            commands::run::execute(&instance, &config, rounds).await
        }
        Commands::Config { format } => {
            commands::config::execute(&config, cli.config.as_deref(), format.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_overrides_replace_file_values() {
        let cli = Cli::try_parse_from([
            "quorum-lock",
            "run",
            "alpha",
            "--rounds",
            "3",
            "--key",
            "jobs",
            "--endpoint",
            "redis://a:6379,redis://b:6379",
            "--endpoint",
            "redis://c:6379",
            "--work-max-ms",
            "900",
        ])
        .unwrap();

        let mut config = AppConfig::default();
        cli.overrides.apply(&mut config);

        assert_eq!(config.key, "jobs");
        assert_eq!(
            config.redis.endpoints,
            vec!["redis://a:6379", "redis://b:6379", "redis://c:6379"]
        );
        assert_eq!(config.work_max, Duration::from_millis(900));
        assert_eq!(config.ttl, AppConfig::default().ttl);

        match cli.command {
            Commands::Run { instance, rounds } => {
                assert_eq!(instance, "alpha");
                assert_eq!(rounds, Some(3));
            }
            _ => panic!("expected run command"),
        }
    }
}
