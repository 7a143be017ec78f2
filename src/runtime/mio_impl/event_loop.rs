//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking connect/write/read syscalls.
//! The poll call is the only place a worker blocks, and it never blocks
//! past the earliest connect or send that is due.
//!
//! ## One iteration
//!
//! 1. Poll with a timeout derived from the earliest pending deadline.
//! 2. Dispatch every reported event to its connection. Time spent on
//!    earlier events of the same batch is credited back to the round of
//!    each later connection.
//! 3. Sweep: fire due connects and sends, time out stuck connects, and
//!    evict closed connections.

use crate::config::Config;
use crate::runtime::{
    ConnState, Connection, Progress, Reporter, RoundTrip, Scheduler, WorkerStats,
};
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Poll, Registry, Token};
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn};

const EVENTS_CAPACITY: usize = 1024;

/// Size of the per-worker read scratch buffer.
const SCRATCH_SIZE: usize = 64 * 1024;

/// Per-worker state that handlers share. Connections and the poller are
/// kept outside so a handler can borrow one connection mutably alongside
/// this.
struct Worker<'a> {
    addr: SocketAddr,
    config: &'a Config,
    scheduler: Scheduler,
    reporter: Reporter,
    stats: WorkerStats,
    scratch: Vec<u8>,
}

/// Drive one shard of connections until every one of them is closed.
pub fn worker_loop(
    worker_id: usize,
    addr: SocketAddr,
    config: &Config,
    reporter: Reporter,
) -> io::Result<WorkerStats> {
    let _span = info_span!("worker", id = worker_id).entered();

    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(EVENTS_CAPACITY);

    let seed = config.seed.map(|seed| seed.wrapping_add(worker_id as u64));
    let mut worker = Worker {
        addr,
        config,
        scheduler: Scheduler::new(config.interval, seed),
        reporter,
        stats: WorkerStats::new(worker_id),
        scratch: vec![0u8; SCRATCH_SIZE],
    };

    // Slot keys double as connection ids and poll tokens.
    let start = Instant::now();
    let mut connections: Slab<Connection> = Slab::with_capacity(config.connections);
    for _ in 0..config.connections {
        let entry = connections.vacant_entry();
        let conn = Connection::new(entry.key(), worker.scheduler.initial(start));
        entry.insert(conn);
    }

    info!(
        connections = config.connections,
        quota = config.messages,
        payload = worker.payload_len(),
        "Worker started"
    );

    while !connections.is_empty() {
        let timeout = poll_timeout(&connections, config.connect_timeout, Instant::now());
        match poll.poll(&mut events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
        let polled_at = Instant::now();

        for event in events.iter() {
            let Some(conn) = connections.get_mut(event.token().0) else {
                continue;
            };
            let now = Instant::now();
            conn.charge_wait(now.saturating_duration_since(polled_at));

            if let Err(e) = worker.handle_event(poll.registry(), conn, event, now) {
                worker.fail(conn, now, &e)?;
            }
        }

        let now = Instant::now();
        worker.sweep(poll.registry(), &mut connections, now)?;
        worker.reporter.tick(now)?;
    }

    worker.reporter.finish()?;

    info!(
        completed = worker.stats.completed,
        mismatches = worker.stats.mismatches,
        failed_connections = worker.stats.failed_connections,
        "Worker finished"
    );

    Ok(worker.stats)
}

impl Worker<'_> {
    fn payload_len(&self) -> usize {
        self.config.length + usize::from(self.config.newline)
    }

    fn handle_event(
        &mut self,
        registry: &Registry,
        conn: &mut Connection,
        event: &Event,
        now: Instant,
    ) -> io::Result<()> {
        if matches!(conn.state, ConnState::Connecting { .. }) {
            return self.handle_connecting(registry, conn, now);
        }

        if event.is_readable() || event.is_read_closed() || event.is_error() {
            let progress = conn.on_readable(&mut self.scratch, now)?;
            self.apply(conn, progress, now)?;
        }

        if event.is_writable() && !conn.is_closed() {
            let progress = conn.on_writable(now)?;
            self.apply(conn, progress, now)?;
        }

        sync_interest(registry, conn)
    }

    fn handle_connecting(
        &mut self,
        registry: &Registry,
        conn: &mut Connection,
        now: Instant,
    ) -> io::Result<()> {
        let Some(stream) = conn.stream.as_ref() else {
            return Ok(());
        };
        if !connect_finished(stream)? {
            return Ok(());
        }

        let started = conn.connected(now);
        debug!(conn = conn.id, "Connected");

        if self.payload_len() == 0 {
            let round_trip = conn.finish_bare_cycle(started, now);
            release_stream(registry, conn);
            return self.completed(conn, round_trip, now);
        }

        // The sweep that follows this batch starts the first send.
        sync_interest(registry, conn)
    }

    fn apply(&mut self, conn: &mut Connection, progress: Progress, now: Instant) -> io::Result<()> {
        match progress {
            Progress::Idle => Ok(()),
            Progress::Completed(round_trip) => self.completed(conn, round_trip, now),
            Progress::PeerClosed => {
                warn!(
                    conn = conn.id,
                    completed = conn.messages_completed,
                    "Peer closed connection"
                );
                self.abort(conn, now)
            }
        }
    }

    /// Report a finished message, then either schedule the next one or
    /// close the connection if its quota is met.
    fn completed(
        &mut self,
        conn: &mut Connection,
        round_trip: RoundTrip,
        now: Instant,
    ) -> io::Result<()> {
        self.stats.completed += 1;
        if round_trip.error {
            self.stats.mismatches += 1;
            debug!(conn = conn.id, "Echo mismatch");
        }
        self.reporter.record(&round_trip)?;

        if conn.messages_completed >= self.config.messages {
            conn.close();
        } else {
            conn.reschedule(self.scheduler.next_after(now));
        }
        Ok(())
    }

    fn fail(&mut self, conn: &mut Connection, now: Instant, error: &io::Error) -> io::Result<()> {
        warn!(conn = conn.id, error = %error, "Connection error");
        self.abort(conn, now)
    }

    /// Close a connection before its quota, reporting any message it had
    /// in flight as an error.
    fn abort(&mut self, conn: &mut Connection, now: Instant) -> io::Result<()> {
        self.stats.failed_connections += 1;
        match conn.abort(now) {
            Some(round_trip) => self.reporter.record(&round_trip),
            None => Ok(()),
        }
    }

    fn sweep(
        &mut self,
        registry: &Registry,
        connections: &mut Slab<Connection>,
        now: Instant,
    ) -> io::Result<()> {
        for (_, conn) in connections.iter_mut() {
            match conn.state {
                ConnState::Connecting { started_at }
                    if now.saturating_duration_since(started_at) >= self.config.connect_timeout =>
                {
                    let e = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
                    self.fail(conn, now, &e)?;
                }
                ConnState::Init if conn.is_due(now) => match open_stream(self.addr) {
                    Ok(stream) => conn.begin_connect(stream, now),
                    Err(e) => self.fail(conn, now, &e)?,
                },
                ConnState::Ready if conn.is_due(now) => {
                    let payload = self
                        .scheduler
                        .payload(self.config.length, self.config.newline);
                    conn.begin_round(payload, now);
                }
                _ => {}
            }

            if !conn.is_closed() {
                if let Err(e) = sync_interest(registry, conn) {
                    self.fail(conn, now, &e)?;
                }
            }
        }

        connections.retain(|_, conn| {
            if !conn.is_closed() {
                return true;
            }
            release_stream(registry, conn);
            debug!(
                conn = conn.id,
                completed = conn.messages_completed,
                "Connection closed"
            );
            false
        });

        Ok(())
    }
}

/// Time until the earliest deadline, or `None` to wait for I/O alone.
fn poll_timeout(
    connections: &Slab<Connection>,
    connect_timeout: Duration,
    now: Instant,
) -> Option<Duration> {
    connections
        .iter()
        .filter_map(|(_, conn)| conn.deadline(connect_timeout))
        .min()
        .map(|at| at.saturating_duration_since(now))
}

/// Bring the registered interest in line with what the state needs.
fn sync_interest(registry: &Registry, conn: &mut Connection) -> io::Result<()> {
    let wanted = conn.interest();
    if wanted == conn.registered {
        return Ok(());
    }

    let token = Token(conn.id);
    let Some(stream) = conn.stream.as_mut() else {
        conn.registered = None;
        return Ok(());
    };

    match (conn.registered, wanted) {
        (None, Some(interest)) => registry.register(stream, token, interest)?,
        (Some(_), Some(interest)) => registry.reregister(stream, token, interest)?,
        (Some(_), None) => registry.deregister(stream)?,
        (None, None) => {}
    }
    conn.registered = wanted;
    Ok(())
}

/// Deregister and drop the socket.
fn release_stream(registry: &Registry, conn: &mut Connection) {
    if let Some(mut stream) = conn.stream.take() {
        if conn.registered.is_some() {
            let _ = registry.deregister(&mut stream);
        }
    }
    conn.registered = None;
}

/// Create a non-blocking socket with `TCP_NODELAY` and start connecting.
fn open_stream(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    Ok(TcpStream::from_std(socket.into()))
}

/// Whether a non-blocking connect has completed. Errors mean it failed.
fn connect_finished(stream: &TcpStream) -> io::Result<bool> {
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::report::tests::SharedBuf;
    use crate::runtime::tests::{closed_port, spawn_peer, test_config, Peer};
    use crate::runtime::{Clock, Interval, OutputSink, ReportMode};

    struct Row {
        send_start: f64,
        response: f64,
        bytes_sent: usize,
        bytes_received: usize,
        conn: usize,
        error: bool,
    }

    fn run_worker(config: &Config, addr: SocketAddr) -> (WorkerStats, Vec<Row>) {
        let buf = SharedBuf::default();
        let reporter = Reporter::new(
            0,
            ReportMode::Rows,
            OutputSink::new(buf.clone()),
            Clock::new(),
        );
        let stats = worker_loop(0, addr, config, reporter).unwrap();
        let rows = buf
            .lines()
            .iter()
            .map(|line| {
                let f: Vec<&str> = line.split(',').collect();
                assert_eq!(f.len(), 8, "bad row: {line}");
                assert_eq!(f[5], "0");
                Row {
                    send_start: f[0].parse().unwrap(),
                    response: f[2].parse().unwrap(),
                    bytes_sent: f[3].parse().unwrap(),
                    bytes_received: f[4].parse().unwrap(),
                    conn: f[6].parse().unwrap(),
                    error: f[7] == "1",
                }
            })
            .collect();
        (stats, rows)
    }

    #[test]
    fn test_single_message_terminates() {
        let addr = spawn_peer(Peer::Echo);
        let config = test_config(addr);

        let (stats, rows) = run_worker(&config, addr);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed_connections, 0);
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].error);
        assert_eq!(rows[0].bytes_sent, 32);
        assert_eq!(rows[0].bytes_received, 32);
    }

    #[test]
    fn test_fixed_interval_spacing() {
        let addr = spawn_peer(Peer::Echo);
        let mut config = test_config(addr);
        config.interval = Interval::fixed(100);
        config.messages = 4;

        let (stats, rows) = run_worker(&config, addr);
        assert_eq!(stats.completed, 4);
        for pair in rows.windows(2) {
            let gap = pair[1].send_start - pair[0].send_start;
            assert!(gap >= 99.0, "gap too short: {gap}");
            assert!(gap < 400.0, "gap too long: {gap}");
        }
    }

    #[test]
    fn test_fragmented_echo() {
        let addr = spawn_peer(Peer::Fragmented { len: 32 });
        let mut config = test_config(addr);
        config.messages = 2;

        let (stats, rows) = run_worker(&config, addr);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.mismatches, 0);
        for row in &rows {
            assert!(!row.error);
            assert_eq!(row.bytes_received, 32);
            assert!(row.response >= 45.0, "completed on first fragment");
        }
    }

    #[test]
    fn test_mismatch_is_reported_and_connection_continues() {
        let addr = spawn_peer(Peer::Corrupt);
        let mut config = test_config(addr);
        config.messages = 3;

        let (stats, rows) = run_worker(&config, addr);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.mismatches, 3);
        assert_eq!(stats.failed_connections, 0);
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|row| row.error));
    }

    #[test]
    fn test_refused_connection_is_evicted() {
        let addr = closed_port();
        let mut config = test_config(addr);
        config.connections = 3;

        let (stats, rows) = run_worker(&config, addr);
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.failed_connections, 3);
        assert!(rows.is_empty());
    }

    /// Listener whose accept queue is already full, so further SYNs go
    /// unanswered. The returned sockets must stay alive for the test.
    fn saturated_listener() -> (SocketAddr, Vec<Socket>) {
        let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        listener.bind(&bind.into()).unwrap();
        listener.listen(0).unwrap();
        let addr = listener.local_addr().unwrap().as_socket().unwrap();

        let mut held = vec![listener];
        for _ in 0..8 {
            let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
            socket.set_nonblocking(true).unwrap();
            let _ = socket.connect(&addr.into());
            held.push(socket);
        }
        std::thread::sleep(Duration::from_millis(50));
        (addr, held)
    }

    #[test]
    fn test_connect_timeout_is_evicted() {
        let (addr, _held) = saturated_listener();
        let mut config = test_config(addr);
        config.connections = 2;
        config.connect_timeout = Duration::from_millis(300);

        let started = Instant::now();
        let (stats, rows) = run_worker(&config, addr);
        let elapsed = started.elapsed();

        assert_eq!(stats.completed, 0);
        assert_eq!(stats.failed_connections, 2);
        assert!(rows.is_empty());
        assert!(elapsed >= Duration::from_millis(300), "took {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    }

    #[test]
    fn test_connecting_deadline_is_connect_timeout() {
        let now = Instant::now();
        let mut connections: Slab<Connection> = Slab::new();
        let mut conn = Connection::new(0, now);
        conn.state = ConnState::Connecting { started_at: now };
        connections.insert(conn);

        assert_eq!(
            poll_timeout(&connections, Duration::from_millis(300), now),
            Some(Duration::from_millis(300))
        );
    }

    #[test]
    fn test_peer_hangup_is_evicted() {
        let addr = spawn_peer(Peer::Hangup);
        let mut config = test_config(addr);
        config.messages = 5;

        let (stats, rows) = run_worker(&config, addr);
        assert_eq!(stats.completed, 0);
        assert_eq!(stats.failed_connections, 1);
        assert!(rows.len() <= 1);
        assert!(rows.iter().all(|row| row.error));
    }

    #[test]
    fn test_zero_length_is_connect_cycle() {
        let addr = spawn_peer(Peer::Echo);
        let mut config = test_config(addr);
        config.length = 0;
        config.messages = 3;
        config.connections = 2;

        let (stats, rows) = run_worker(&config, addr);
        assert_eq!(stats.completed, 6);
        assert_eq!(rows.len(), 6);
        for row in &rows {
            assert_eq!(row.bytes_sent, 0);
            assert_eq!(row.bytes_received, 0);
            assert!(!row.error);
        }
        for conn in 0..2 {
            assert_eq!(rows.iter().filter(|row| row.conn == conn).count(), 3);
        }
    }

    #[test]
    fn test_newline_payload() {
        let addr = spawn_peer(Peer::Echo);
        let mut config = test_config(addr);
        config.length = 4;
        config.newline = true;

        let (_, rows) = run_worker(&config, addr);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].bytes_sent, 5);
        assert!(!rows[0].error);
    }

    #[test]
    fn test_large_payload_with_many_connections() {
        let addr = spawn_peer(Peer::Echo);
        let mut config = test_config(addr);
        config.length = 256 * 1024;
        config.connections = 8;
        config.messages = 2;

        let (stats, rows) = run_worker(&config, addr);
        assert_eq!(stats.completed, 16);
        assert!(rows.iter().all(|row| !row.error && row.bytes_received == 256 * 1024));
    }

    #[test]
    fn test_poll_timeout_tracks_earliest_deadline() {
        let now = Instant::now();
        let mut connections: Slab<Connection> = Slab::new();
        assert_eq!(poll_timeout(&connections, Duration::from_secs(1), now), None);

        connections.insert(Connection::new(0, now + Duration::from_millis(300)));
        connections.insert(Connection::new(1, now + Duration::from_millis(120)));
        assert_eq!(
            poll_timeout(&connections, Duration::from_secs(1), now),
            Some(Duration::from_millis(120))
        );

        connections.insert(Connection::new(2, now - Duration::from_millis(5)));
        assert_eq!(
            poll_timeout(&connections, Duration::from_secs(1), now),
            Some(Duration::ZERO)
        );
    }
}
