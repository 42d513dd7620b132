//! Config command
//!
//! Validates the effective configuration and prints it.

use colored::Colorize;
use quorum_lock_core::quorum;
use std::path::Path;

use crate::config::{AppConfig, FileFormat};
use crate::error::CliResult;

/// Validate and print the effective configuration.
pub fn execute(config: &AppConfig, source: Option<&Path>, format: FileFormat) -> CliResult<()> {
    match source {
        Some(path) => println!("⚙️  Configuration from {}", path.display()),
        None => println!("⚙️  Built-in configuration"),
    }
    println!();

    if let Err(e) = config.validate() {
        println!("{} {}", "❌".red(), e);
        return Err(e);
    }

    println!("{}", config.render(format)?);

    let n = config.redis.endpoints.len();
    println!(
        "{} {} stores, quorum {}, validity at most {:?}",
        "✅".green(),
        n,
        quorum(n),
        config.ttl - config.lock.drift_margin(config.ttl)
    );

    for warning in warnings(config) {
        println!("  {} {}", "⚠️  Warning:".yellow(), warning);
    }

    Ok(())
}

/// Settings that are valid but probably not intended.
fn warnings(config: &AppConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    let n = config.redis.endpoints.len();

    if n == 1 {
        warnings.push("a single store gives no fault tolerance".to_string());
    } else if n % 2 == 0 {
        warnings.push(format!(
            "{} stores tolerate no more failures than {}",
            n,
            n - 1
        ));
    }

    if config.work_max >= config.ttl {
        warnings.push(format!(
            "work_max {:?} can outlast the lock ttl {:?}",
            config.work_max, config.ttl
        ));
    }

    warnings
}
