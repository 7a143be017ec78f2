//! Connection state machine for client connections.
//!
//! Each connection walks `Init -> Connecting -> Ready -> Sending -> Sent ->
//! Receiving -> Ready ... -> Closed`. Everything that only exists while a
//! message is in flight lives in [`Round`], which is carried by the
//! in-flight states and rebuilt from scratch for every message.

use crate::runtime::report::RoundTrip;
use bytes::BytesMut;
use mio::net::TcpStream;
use mio::Interest;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Per-message bookkeeping.
#[derive(Debug)]
pub struct Round {
    /// Bytes queued to send; the echo must match exactly.
    pub payload: Vec<u8>,
    /// Offset of the unsent suffix of `payload`.
    pub bytes_sent: usize,
    /// Bytes echoed back so far.
    pub recv: BytesMut,
    /// When the first byte of the payload left.
    pub started_at: Instant,
    pub send_finished_at: Option<Instant>,
    /// Time this round waited behind other connections' events.
    pub wait_compensation: Duration,
}

impl Round {
    fn new(payload: Vec<u8>, now: Instant) -> Self {
        let expected = payload.len();
        Self {
            payload,
            bytes_sent: 0,
            recv: BytesMut::with_capacity(expected),
            started_at: now,
            send_finished_at: None,
            wait_compensation: Duration::ZERO,
        }
    }

    fn expected_length(&self) -> usize {
        self.payload.len()
    }

    fn is_sent(&self) -> bool {
        self.bytes_sent == self.payload.len()
    }

    fn is_complete(&self) -> bool {
        self.recv.len() == self.expected_length()
    }

    /// Write as much of the unsent suffix as the socket takes.
    ///
    /// Returns `true` once the whole payload is written.
    fn write_to<W: Write>(&mut self, w: &mut W) -> io::Result<bool> {
        while !self.is_sent() {
            match w.write(&self.payload[self.bytes_sent..]) {
                // No progress; retry on the next readiness event.
                Ok(0) => return Ok(false),
                Ok(n) => self.bytes_sent += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Read until the socket is drained or the echo is complete. Never
    /// reads past `expected_length`.
    fn read_from<R: Read>(&mut self, r: &mut R, scratch: &mut [u8]) -> io::Result<ReadOutcome> {
        loop {
            let remaining = self.expected_length() - self.recv.len();
            if remaining == 0 {
                return Ok(ReadOutcome::Drained);
            }
            let cap = remaining.min(scratch.len());
            match r.read(&mut scratch[..cap]) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => self.recv.extend_from_slice(&scratch[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::Drained)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn into_round_trip(self, conn_id: usize, now: Instant, error: bool) -> RoundTrip {
        RoundTrip {
            conn_id,
            started_at: self.started_at,
            send_finished_at: self.send_finished_at.unwrap_or(now),
            received_at: now,
            wait_compensation: self.wait_compensation,
            bytes_sent: self.bytes_sent,
            bytes_received: self.recv.len(),
            error,
        }
    }
}

enum ReadOutcome {
    Drained,
    Eof,
}

/// Current state of a connection.
#[derive(Debug)]
pub enum ConnState {
    /// Not connected; `scheduled_at` says when to connect.
    Init,
    /// Non-blocking connect in progress.
    Connecting { started_at: Instant },
    /// Idle; `scheduled_at` says when to send.
    Ready,
    /// Payload partially written.
    Sending(Round),
    /// Payload fully written, nothing echoed yet.
    Sent(Round),
    /// Part of the echo received.
    Receiving(Round),
    /// Terminal.
    Closed,
}

impl ConnState {
    /// Short lowercase label used in transition traces.
    pub fn name(&self) -> &'static str {
        match self {
            ConnState::Init => "init",
            ConnState::Connecting { .. } => "connecting",
            ConnState::Ready => "ready",
            ConnState::Sending(_) => "sending",
            ConnState::Sent(_) => "sent",
            ConnState::Receiving(_) => "receiving",
            ConnState::Closed => "closed",
        }
    }
}

/// What the event loop has to act on after an I/O event.
#[derive(Debug)]
pub enum Progress {
    /// Nothing for the loop to do.
    Idle,
    /// A round trip finished; the connection is `Ready` again.
    Completed(RoundTrip),
    /// The peer closed the stream.
    PeerClosed,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S = TcpStream> {
    /// Slot index in the worker's arena, also the poll token.
    pub id: usize,
    pub stream: Option<S>,
    pub state: ConnState,
    /// Next due action, meaningful in `Init` and `Ready` only.
    pub scheduled_at: Instant,
    pub messages_completed: usize,
    /// Interest currently registered with the poller.
    pub registered: Option<Interest>,
}

impl<S> Connection<S> {
    /// Create a new connection in the initial state.
    pub fn new(id: usize, scheduled_at: Instant) -> Self {
        Self {
            id,
            stream: None,
            state: ConnState::Init,
            scheduled_at,
            messages_completed: 0,
            registered: None,
        }
    }

    /// Whether a connect or send is due.
    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.state, ConnState::Init | ConnState::Ready) && self.scheduled_at <= now
    }

    /// Earliest instant at which the loop must look at this connection
    /// without being woken by I/O.
    pub fn deadline(&self, connect_timeout: Duration) -> Option<Instant> {
        match self.state {
            ConnState::Init | ConnState::Ready => Some(self.scheduled_at),
            ConnState::Connecting { started_at } => Some(started_at + connect_timeout),
            _ => None,
        }
    }

    /// Interest the poller should hold for this connection. Write interest
    /// is only wanted while a connect or a send is pending.
    pub fn interest(&self) -> Option<Interest> {
        match self.state {
            ConnState::Init | ConnState::Closed => None,
            ConnState::Connecting { .. } | ConnState::Sending(_) => {
                Some(Interest::READABLE | Interest::WRITABLE)
            }
            ConnState::Ready | ConnState::Sent(_) | ConnState::Receiving(_) => {
                Some(Interest::READABLE)
            }
        }
    }

    /// Whether the connection is done and waiting to be evicted.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, ConnState::Closed)
    }

    /// The round in flight, once its first byte has been written.
    fn in_flight_mut(&mut self) -> Option<&mut Round> {
        match &mut self.state {
            ConnState::Sending(round) if round.bytes_sent > 0 => Some(round),
            ConnState::Sent(round) | ConnState::Receiving(round) => Some(round),
            _ => None,
        }
    }

    /// Credit time the loop spent on other connections while this one's
    /// own event was already pending.
    pub fn charge_wait(&mut self, waited: Duration) {
        if let Some(round) = self.in_flight_mut() {
            round.wait_compensation += waited;
        }
    }

    /// Move to the state built from the current one, tracing the edge.
    fn advance_with(&mut self, f: impl FnOnce(ConnState) -> ConnState) {
        let from = self.state.name();
        let current = std::mem::replace(&mut self.state, ConnState::Closed);
        self.state = f(current);
        let to = self.state.name();
        if from != to {
            trace!(conn = self.id, from, to, "state transition");
        }
    }

    /// `Init -> Connecting` with a freshly created socket.
    pub fn begin_connect(&mut self, stream: S, now: Instant) {
        self.stream = Some(stream);
        self.advance_with(|_| ConnState::Connecting { started_at: now });
    }

    /// `Connecting -> Ready`; the first send is due immediately.
    ///
    /// Returns when the connect was started.
    pub fn connected(&mut self, now: Instant) -> Instant {
        let mut started = now;
        self.advance_with(|state| match state {
            ConnState::Connecting { started_at } => {
                started = started_at;
                ConnState::Ready
            }
            other => other,
        });
        self.scheduled_at = now;
        started
    }

    /// Account a connect-only message. The connection falls back to
    /// `Init` and the caller releases the socket.
    pub fn finish_bare_cycle(&mut self, connect_started: Instant, now: Instant) -> RoundTrip {
        self.messages_completed += 1;
        self.advance_with(|_| ConnState::Init);
        RoundTrip {
            conn_id: self.id,
            started_at: connect_started,
            send_finished_at: now,
            received_at: now,
            wait_compensation: Duration::ZERO,
            bytes_sent: 0,
            bytes_received: 0,
            error: false,
        }
    }

    /// `Ready -> Sending` with a new payload. All per-message counters
    /// start from zero here.
    pub fn begin_round(&mut self, payload: Vec<u8>, now: Instant) {
        self.advance_with(|state| match state {
            ConnState::Ready => ConnState::Sending(Round::new(payload, now)),
            other => other,
        });
    }

    /// Set when the next connect or send is due.
    pub fn reschedule(&mut self, at: Instant) {
        self.scheduled_at = at;
    }

    /// Mark the connection closed once its quota is met.
    pub fn close(&mut self) {
        self.advance_with(|_| ConnState::Closed);
    }

    /// Close after a failure. A message in flight is returned flagged as
    /// an error so it still shows up in the report.
    pub fn abort(&mut self, now: Instant) -> Option<RoundTrip> {
        let id = self.id;
        let mut failed = None;
        self.advance_with(|state| {
            match state {
                ConnState::Sending(round) if round.bytes_sent > 0 => {
                    failed = Some(round.into_round_trip(id, now, true));
                }
                ConnState::Sent(round) | ConnState::Receiving(round) => {
                    failed = Some(round.into_round_trip(id, now, true));
                }
                _ => {}
            }
            ConnState::Closed
        });
        failed
    }

    /// `Sent -> Receiving` once echo bytes exist, then `Receiving -> Ready`
    /// once all of them are in.
    fn settle(&mut self, now: Instant) -> Progress {
        if let ConnState::Sent(round) = &self.state {
            if round.recv.is_empty() && round.expected_length() > 0 {
                return Progress::Idle;
            }
            self.advance_with(|state| match state {
                ConnState::Sent(round) => ConnState::Receiving(round),
                other => other,
            });
        }

        let id = self.id;
        let mut finished = None;
        self.advance_with(|state| match state {
            ConnState::Receiving(round) if round.is_complete() => {
                let error = round.recv[..] != round.payload[..];
                finished = Some(round.into_round_trip(id, now, error));
                ConnState::Ready
            }
            other => other,
        });

        match finished {
            Some(round_trip) => {
                self.messages_completed += 1;
                Progress::Completed(round_trip)
            }
            None => Progress::Idle,
        }
    }
}

impl<S: Read + Write> Connection<S> {
    /// Push the pending send forward.
    pub fn on_writable(&mut self, now: Instant) -> io::Result<Progress> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(Progress::Idle);
        };
        let ConnState::Sending(round) = &mut self.state else {
            return Ok(Progress::Idle);
        };

        if round.bytes_sent == 0 {
            round.started_at = now;
        }
        if !round.write_to(stream)? {
            return Ok(Progress::Idle);
        }
        round.send_finished_at = Some(now);

        self.advance_with(|state| match state {
            ConnState::Sending(round) => ConnState::Sent(round),
            other => other,
        });
        Ok(self.settle(now))
    }

    /// Pull echoed bytes. Reading also happens while the send is still in
    /// progress, so a peer that echoes as it receives never stalls.
    pub fn on_readable(&mut self, scratch: &mut [u8], now: Instant) -> io::Result<Progress> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(Progress::Idle);
        };

        let outcome = match &mut self.state {
            ConnState::Sending(round) | ConnState::Sent(round) | ConnState::Receiving(round) => {
                round.read_from(stream, scratch)?
            }
            ConnState::Ready => return drain_idle(self.id, stream, scratch),
            _ => return Ok(Progress::Idle),
        };

        match outcome {
            ReadOutcome::Eof => Ok(Progress::PeerClosed),
            ReadOutcome::Drained => Ok(self.settle(now)),
        }
    }
}

/// Bytes on an idle connection belong to no message; drop them.
fn drain_idle<R: Read>(conn: usize, r: &mut R, scratch: &mut [u8]) -> io::Result<Progress> {
    loop {
        match r.read(scratch) {
            Ok(0) => return Ok(Progress::PeerClosed),
            Ok(n) => warn!(conn, bytes = n, "Discarding unsolicited data"),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Progress::Idle),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
