//! echo-bench: a synthetic load generator for TCP echo servers
//!
//! Opens many concurrent connections, sends random payloads at jittered
//! intervals, verifies every echo and reports round-trip times.
//!
//! Features:
//! - Thread-per-worker pool, one mio event loop per worker
//! - Fixed or uniformly jittered send intervals
//! - Per-message rows or periodic per-worker averages on stdout
//! - Configuration via CLI arguments or TOML file

mod config;
mod runtime;

use config::Config;
use runtime::OutputSink;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Configuration errors end the run before any socket is opened.
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let addr = match config.target_addr() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging; stdout carries the report.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        target = %addr,
        length = config.length,
        interval = %config.interval,
        messages = config.messages,
        workers = config.workers,
        connections = config.connections,
        table = config.table,
        "Starting echo-bench"
    );

    match runtime::run(&config, addr, OutputSink::stdout()) {
        Ok(summary) => {
            info!(
                completed = summary.completed(),
                mismatches = summary.mismatches(),
                failed_connections = summary.failed_connections(),
                failed_workers = summary.failed_workers,
                "Run finished"
            );
            if summary.failed_workers > 0 {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!(error = %e, "Run failed");
            ExitCode::FAILURE
        }
    }
}
