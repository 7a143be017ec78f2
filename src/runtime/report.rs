//! Round-trip reporting.
//!
//! A [`Reporter`] belongs to one worker and turns completed round trips
//! into either one row per message or a periodic mean. All workers write
//! through a shared [`OutputSink`], which serializes whole lines.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Outcome of one message, as measured by its connection.
#[derive(Debug, Clone)]
pub struct RoundTrip {
    pub conn_id: usize,
    pub started_at: Instant,
    pub send_finished_at: Instant,
    pub received_at: Instant,
    pub wait_compensation: Duration,
    pub bytes_sent: usize,
    pub bytes_received: usize,
    /// Echo mismatch or premature close.
    pub error: bool,
}

impl RoundTrip {
    /// Time from first byte sent to last byte received, minus the time the
    /// loop spent serving other connections meanwhile.
    pub fn response_time(&self) -> Duration {
        self.received_at
            .saturating_duration_since(self.started_at)
            .saturating_sub(self.wait_compensation)
    }
}

/// Output mode, chosen once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportMode {
    /// One row per message.
    Rows,
    /// Mean response time per worker every `window`.
    Average { window: Duration },
}

/// Maps monotonic instants onto Unix milliseconds.
///
/// Created once per run and shared by all workers so their timestamps are
/// comparable.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
    origin_unix_ms: f64,
}

impl Clock {
    pub fn new() -> Self {
        let wall = chrono::Utc::now();
        Self {
            origin: Instant::now(),
            origin_unix_ms: wall.timestamp_micros() as f64 / 1000.0,
        }
    }

    pub fn unix_ms(&self, at: Instant) -> f64 {
        match at.checked_duration_since(self.origin) {
            Some(after) => self.origin_unix_ms + millis(after),
            None => self.origin_unix_ms - millis(self.origin - at),
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Line-serializing writer shared by every worker.
#[derive(Clone)]
pub struct OutputSink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl OutputSink {
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// Write one line. The lock is held for the whole line, so lines from
    /// different workers never interleave.
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        let mut out = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()
    }
}

/// One line of row-mode output.
///
/// `send_start_ms,send_finish_ms,response_time_ms,bytes_sent,bytes_received,worker_id,connection_id,error_flag`
pub struct Row {
    pub send_start_ms: f64,
    pub send_finish_ms: f64,
    pub response_time_ms: f64,
    pub bytes_sent: usize,
    pub bytes_received: usize,
    pub worker_id: usize,
    pub conn_id: usize,
    pub error: bool,
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.3},{:.3},{:.3},{},{},{},{},{}",
            self.send_start_ms,
            self.send_finish_ms,
            self.response_time_ms,
            self.bytes_sent,
            self.bytes_received,
            self.worker_id,
            self.conn_id,
            u8::from(self.error)
        )
    }
}

/// Per-worker reporter; the worker's single point of output.
pub struct Reporter {
    worker_id: usize,
    mode: ReportMode,
    sink: OutputSink,
    clock: Clock,
    total_ms: f64,
    samples: u64,
    window_start: Instant,
}

impl Reporter {
    pub fn new(worker_id: usize, mode: ReportMode, sink: OutputSink, clock: Clock) -> Self {
        Self {
            worker_id,
            mode,
            sink,
            clock,
            total_ms: 0.0,
            samples: 0,
            window_start: Instant::now(),
        }
    }

    /// Record a finished message.
    pub fn record(&mut self, round_trip: &RoundTrip) -> io::Result<()> {
        let response_time_ms = millis(round_trip.response_time());
        match self.mode {
            ReportMode::Rows => {
                let row = Row {
                    send_start_ms: self.clock.unix_ms(round_trip.started_at),
                    send_finish_ms: self.clock.unix_ms(round_trip.send_finished_at),
                    response_time_ms,
                    bytes_sent: round_trip.bytes_sent,
                    bytes_received: round_trip.bytes_received,
                    worker_id: self.worker_id,
                    conn_id: round_trip.conn_id,
                    error: round_trip.error,
                };
                self.sink.write_line(&row.to_string())
            }
            ReportMode::Average { .. } => {
                self.total_ms += response_time_ms;
                self.samples += 1;
                self.tick(round_trip.received_at)
            }
        }
    }

    /// Emit the window mean if the window has elapsed.
    pub fn tick(&mut self, now: Instant) -> io::Result<()> {
        let ReportMode::Average { window } = self.mode else {
            return Ok(());
        };
        if now.saturating_duration_since(self.window_start) < window {
            return Ok(());
        }
        self.window_start = now;
        self.emit_average()
    }

    /// Flush whatever the current window holds.
    pub fn finish(&mut self) -> io::Result<()> {
        match self.mode {
            ReportMode::Rows => Ok(()),
            ReportMode::Average { .. } => self.emit_average(),
        }
    }

    fn emit_average(&mut self) -> io::Result<()> {
        if self.samples == 0 {
            return Ok(());
        }
        let mean = self.total_ms / self.samples as f64;
        self.total_ms = 0.0;
        self.samples = 0;
        self.sink
            .write_line(&format!("{},{:.3}", self.worker_id, mean))
    }
}
