//! Tracing subscriber setup.
//!
//! Environment variables:
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `QUORUM_LOCK_DEBUG` | `false` | Shorthand for level `debug` |
//! | `QUORUM_LOCK_LOG_LEVEL` | `info` | `trace`, `debug`, `info`, `warn`, `error`, `off` |
//! | `QUORUM_LOCK_LOG_FORMAT` | `compact` | `pretty`, `compact`, `json` |
//! | `QUORUM_LOCK_LOG_COLOR` | stderr is a TTY | ANSI colors for non-JSON output |
//!
//! `RUST_LOG`, when set, replaces the level filter entirely.

use std::env;
use std::io::IsTerminal;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::error::{CliError, CliResult};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Pretty,
    Compact,
    Json,
}

impl Format {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pretty" => Some(Format::Pretty),
            "compact" => Some(Format::Compact),
            "json" => Some(Format::Json),
            _ => None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: LevelFilter,
    pub format: Format,
    pub color: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: Format::Compact,
            color: false,
        }
    }
}

fn flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

impl LogConfig {
    /// Read `QUORUM_LOCK_*` logging variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let debug = lookup("QUORUM_LOCK_DEBUG").is_some_and(|v| flag(&v));

        let level = lookup("QUORUM_LOCK_LOG_LEVEL")
            .and_then(|s| s.parse().ok())
            .unwrap_or(if debug {
                LevelFilter::DEBUG
            } else {
                LevelFilter::INFO
            });

        let format = lookup("QUORUM_LOCK_LOG_FORMAT")
            .and_then(|s| Format::parse(&s))
            .unwrap_or(Format::Compact);

        let color = lookup("QUORUM_LOCK_LOG_COLOR")
            .map(|v| flag(&v))
            .unwrap_or_else(|| std::io::stderr().is_terminal());

        Self {
            level,
            format,
            color,
        }
    }

    /// Apply `--verbose` / `--quiet`.
    pub fn with_verbosity(mut self, verbose: bool, quiet: bool) -> Self {
        if quiet {
            self.level = LevelFilter::WARN;
        } else if verbose {
            self.level = LevelFilter::DEBUG;
        }
        self
    }
}

/// Install the global subscriber. Log lines go to stderr.
pub fn init(config: &LogConfig) -> CliResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format {
        Format::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        Format::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(config.color)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        Format::Pretty => registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(config.color)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    installed.map_err(|e| CliError::Logging(e.to_string()))
}
