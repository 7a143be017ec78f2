//! Load generation runtime.
//!
//! A pool of worker threads, each driving its own shard of connections
//! through a readiness-based event loop (epoll on Linux, kqueue on macOS):
//! - `Connection`: per-socket state machine
//! - `Scheduler`: jittered send times and payloads
//! - `Reporter`: row or average output through a shared sink
//!
//! Workers share nothing but the output sink.

mod connection;
mod mio_impl;
mod report;
mod scheduler;

pub(crate) use connection::{ConnState, Connection, Progress};
pub use report::{Clock, OutputSink, ReportMode, Reporter, RoundTrip};
pub use scheduler::{Interval, IntervalError, Scheduler};

use crate::config::Config;
use std::io;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;
use tracing::{error, info};

/// Upper bound on the pause between two worker spawns.
const MAX_SPAWN_STAGGER: Duration = Duration::from_secs(1);

/// Counters a worker hands back when its shard is done.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub worker_id: usize,
    /// Round trips reported, including mismatches.
    pub completed: usize,
    /// Round trips whose echo differed from the payload.
    pub mismatches: usize,
    /// Connections that ended before their quota.
    pub failed_connections: usize,
}

impl WorkerStats {
    pub fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            ..Self::default()
        }
    }
}

/// Outcome of a whole run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub workers: Vec<WorkerStats>,
    /// Workers that died on an I/O error or a panic.
    pub failed_workers: usize,
}

impl RunSummary {
    pub fn completed(&self) -> usize {
        self.workers.iter().map(|w| w.completed).sum()
    }

    pub fn mismatches(&self) -> usize {
        self.workers.iter().map(|w| w.mismatches).sum()
    }

    pub fn failed_connections(&self) -> usize {
        self.workers.iter().map(|w| w.failed_connections).sum()
    }
}

/// Run every worker against `addr` and wait for all of them.
pub fn run(config: &Config, addr: SocketAddr, sink: OutputSink) -> io::Result<RunSummary> {
    let mode = if config.table {
        ReportMode::Rows
    } else {
        ReportMode::Average {
            window: config.report_window,
        }
    };
    let clock = Clock::new();
    let mut stagger_rng = match config.seed {
        Some(seed) => fastrand::Rng::with_seed(seed.rotate_left(32)),
        None => fastrand::Rng::new(),
    };
    let max_stagger = Duration::from_millis(config.interval.max()).min(MAX_SPAWN_STAGGER);

    info!(
        workers = config.workers,
        connections = config.connections,
        addr = %addr,
        interval = %config.interval,
        mode = ?mode,
        "Starting load"
    );

    let mut handles = Vec::with_capacity(config.workers);

    for worker_id in 0..config.workers {
        if worker_id > 0 && !max_stagger.is_zero() {
            let pause = stagger_rng.u64(0..=max_stagger.as_millis() as u64);
            thread::sleep(Duration::from_millis(pause));
        }

        let config = config.clone();
        let reporter = Reporter::new(worker_id, mode, sink.clone(), clock);

        let handle = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || mio_impl::worker_loop(worker_id, addr, &config, reporter))?;

        handles.push((worker_id, handle));
    }

    let mut summary = RunSummary::default();
    for (worker_id, handle) in handles {
        match handle.join() {
            Ok(Ok(stats)) => {
                info!(
                    worker = stats.worker_id,
                    completed = stats.completed,
                    mismatches = stats.mismatches,
                    failed_connections = stats.failed_connections,
                    "Worker joined"
                );
                summary.workers.push(stats);
            }
            Ok(Err(e)) => {
                error!(worker = worker_id, error = %e, "Worker failed");
                summary.failed_workers += 1;
            }
            Err(_) => {
                error!(worker = worker_id, "Worker panicked");
                summary.failed_workers += 1;
            }
        }
    }

    Ok(summary)
}
