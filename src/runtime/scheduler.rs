//! Send scheduling with randomized jitter.
//!
//! Every connection's next send is due at its last completion plus a
//! uniform draw from the configured interval. First connects are spread
//! over `[0, max]` so a worker never opens its whole shard at once, even
//! at a fixed rate.

use std::fmt;
use std::time::{Duration, Instant};

/// Inclusive range of inter-message delays, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    min: u64,
    max: u64,
}

impl Interval {
    /// Create an interval, rejecting `min > max`.
    pub fn new(min: u64, max: u64) -> Result<Self, IntervalError> {
        if min > max {
            return Err(IntervalError::Inverted { min, max });
        }
        Ok(Self { min, max })
    }

    /// Fixed-rate interval.
    pub fn fixed(ms: u64) -> Self {
        Self { min: ms, max: ms }
    }

    /// Parse `N` or `MIN-MAX`. An empty bound takes the value of the other
    /// one, so `-250` and `250-` both mean a fixed 250.
    pub fn parse(s: &str) -> Result<Self, IntervalError> {
        let s = s.trim();
        let Some((lo, hi)) = s.split_once('-') else {
            return parse_bound(s).map(Self::fixed);
        };

        match (lo.trim(), hi.trim()) {
            ("", "") => Err(IntervalError::Malformed(s.to_string())),
            ("", hi) => parse_bound(hi).map(Self::fixed),
            (lo, "") => parse_bound(lo).map(Self::fixed),
            (lo, hi) => Self::new(parse_bound(lo)?, parse_bound(hi)?),
        }
    }

    pub fn max(&self) -> u64 {
        self.max
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}ms", self.min)
        } else {
            write!(f, "{}-{}ms", self.min, self.max)
        }
    }
}

fn parse_bound(s: &str) -> Result<u64, IntervalError> {
    s.parse()
        .map_err(|_| IntervalError::Malformed(s.to_string()))
}

/// Interval parse errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntervalError {
    Malformed(String),
    Inverted { min: u64, max: u64 },
}

impl fmt::Display for IntervalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntervalError::Malformed(s) => {
                write!(f, "'{s}' is not `N` or `MIN-MAX` in milliseconds")
            }
            IntervalError::Inverted { min, max } => {
                write!(f, "minimum {min} is greater than maximum {max}")
            }
        }
    }
}

impl std::error::Error for IntervalError {}

/// Per-worker scheduler. Owns the worker's RNG, which is also used for
/// payload generation so a seeded run is fully reproducible.
pub struct Scheduler {
    interval: Interval,
    rng: fastrand::Rng,
}

impl Scheduler {
    pub fn new(interval: Interval, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        Self { interval, rng }
    }

    /// Uniform draw from the interval.
    pub fn jitter(&mut self) -> Duration {
        Duration::from_millis(self.rng.u64(self.interval.min..=self.interval.max))
    }

    /// First due time of a freshly created connection, anywhere in
    /// `[now, now + max]`.
    pub fn initial(&mut self, now: Instant) -> Instant {
        now + Duration::from_millis(self.rng.u64(0..=self.interval.max))
    }

    /// Next send time after a round trip completed at `completed_at`.
    pub fn next_after(&mut self, completed_at: Instant) -> Instant {
        completed_at + self.jitter()
    }

    /// `len` random printable ASCII bytes, plus a trailing newline if asked.
    pub fn payload(&mut self, len: usize, newline: bool) -> Vec<u8> {
        let mut buf = Vec::with_capacity(len + usize::from(newline));
        buf.extend((0..len).map(|_| self.rng.u8(b'!'..=b'~')));
        if newline {
            buf.push(b'\n');
        }
        buf
    }
}
