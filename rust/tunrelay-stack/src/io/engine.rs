//! The socket I/O multiplexer.
//!
//! A single thread waits on readiness for every session socket and on the
//! [`IoNotifier`] waker. For each session it becomes interested in, it
//! finishes pending connects, closes aborted sessions, and schedules at most
//! one read worker and one write worker on the blocking pool. Registration
//! is edge-triggered, so the session remembers edges the multiplexer could
//! not act on yet (see [`Session::mark_readable`]).

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::{Events, Poll, Token};
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, error, info, trace, warn};

use super::{reader, write_to_client, writer, IoNotifier, WAKE_TOKEN};
use crate::builder::PacketBuilder;
use crate::config::StackConfig;
use crate::error::{RelayError, Result};
use crate::platform::ClientPacketWriter;
use crate::session::{Protocol, Session};
use crate::stack::join_with_retries;
use crate::stats::StackStats;
use crate::table::SessionTable;

/// Readiness reported for one token. Wake-ups carry none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

impl Readiness {
    fn from_event(event: &Event) -> Self {
        Self {
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable() || event.is_write_closed() || event.is_error(),
        }
    }
}

/// State shared by the multiplexer thread and the socket workers.
pub(crate) struct EngineShared {
    pub(crate) table: Arc<SessionTable>,
    pub(crate) builder: Arc<PacketBuilder>,
    pub(crate) writer: Arc<dyn ClientPacketWriter>,
    pub(crate) notifier: IoNotifier,
    pub(crate) stats: Arc<StackStats>,
    pub(crate) read_chunk: usize,
    pub(crate) max_datagram: usize,
    handle: Handle,
    running: AtomicBool,
}

impl EngineShared {
    /// Evaluate one session after a readiness edge or a notification.
    fn process(self: &Arc<Self>, token: Token, readiness: Readiness) {
        let Some(session) = self.table.get_by_token(token) else {
            trace!("no session for {:?}", token);
            return;
        };

        if readiness.readable {
            session.mark_readable();
        }
        if readiness.writable {
            session.mark_writable();
        }

        if !session.is_aborting() && !session.is_connected() {
            self.try_connect(&session);
        }

        if session.is_aborting() {
            if session.channel().is_none() {
                // the socket never opened
                self.reset_client(&session);
            }
            debug!("{}: aborting, closing session", session.key());
            self.table.close_session(&session);
            return;
        }

        if !session.is_connected() {
            return;
        }

        if self.wants_write(&session) && session.try_begin_write() {
            let shared = Arc::clone(self);
            let worker_session = Arc::clone(&session);
            self.handle.spawn_blocking(move || {
                writer::write_to_remote(&shared, &worker_session);
                worker_session.end_write();
                shared.finish_worker(&worker_session);
            });
        }

        if self.wants_read(&session) && session.try_begin_read() {
            let shared = Arc::clone(self);
            let worker_session = Arc::clone(&session);
            self.handle.spawn_blocking(move || {
                reader::read_from_remote(&shared, &worker_session);
                worker_session.end_read();
                shared.finish_worker(&worker_session);
            });
        }
    }

    fn try_connect(&self, session: &Arc<Session>) {
        let Some(channel) = session.channel() else { return };
        match channel.finish_connect() {
            Ok(true) => {
                debug!("{}: connected to remote", session.key());
                session.set_connected(true);
            }
            Ok(false) => {}
            Err(e) => {
                warn!("{}: connect to {} failed: {}", session.key(), session.key().dest, e);
                self.stats.record_connect_failure();
                session.set_aborting(true);
                self.reset_client(session);
            }
        }
    }

    fn wants_write(&self, session: &Session) -> bool {
        session.has_outgoing() && session.is_data_ready() && session.can_write() && !session.is_closed()
    }

    fn wants_read(&self, session: &Session) -> bool {
        let handshake_done = session.protocol() == Protocol::Udp || session.is_established();
        session.is_read_pending()
            && handshake_done
            && !session.is_remote_eof()
            && !session.is_client_window_full()
            && !session.is_closed()
    }

    /// Called by a worker once it released its side of the session.
    fn finish_worker(&self, session: &Arc<Session>) {
        if session.is_closed() {
            return;
        }
        if session.is_aborting() {
            self.notifier.notify(session.token());
            return;
        }
        let more_writes = !session.is_busy_write() && self.wants_write(session);
        let more_reads = !session.is_busy_read() && self.wants_read(session);
        if more_writes || more_reads {
            self.notifier.notify(session.token());
        }
    }

    /// Tell the client the flow is gone. The reset sits at `send_next` so it
    /// lands inside the client's receive window.
    pub(crate) fn reset_client(&self, session: &Session) {
        if session.protocol() != Protocol::Tcp {
            return;
        }
        let Some((ip, tcp)) = session.last_tcp_headers() else { return };
        if !session.claim_reset() {
            return;
        }
        let rst = self.builder.abort(&ip, &tcp, session.send_next(), session.rec_sequence());
        if write_to_client(self.writer.as_ref(), &self.stats, &rst) {
            self.stats.record_reset();
        }
    }
}

/// Owns the multiplexer thread and the worker pool.
pub struct SocketIoEngine {
    shared: Arc<EngineShared>,
    runtime: Option<Runtime>,
    poll: Option<Poll>,
    thread: Option<JoinHandle<()>>,
    events_capacity: usize,
    poll_tick: Duration,
    cleanup_interval: Duration,
    shutdown_retries: u32,
    shutdown_retry_interval: Duration,
}

impl SocketIoEngine {
    /// `poll` must be the instance whose registry the table and notifier
    /// were built from.
    pub fn new(
        poll: Poll,
        notifier: IoNotifier,
        table: Arc<SessionTable>,
        builder: Arc<PacketBuilder>,
        writer: Arc<dyn ClientPacketWriter>,
        stats: Arc<StackStats>,
        config: &StackConfig,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.io.core_workers.max(1))
            .max_blocking_threads(config.io.max_workers.max(1))
            .thread_keep_alive(Duration::from_secs(config.io.keep_alive_secs))
            .thread_name("relay-io-worker")
            .build()?;

        let shared = Arc::new(EngineShared {
            table,
            builder,
            writer,
            notifier,
            stats,
            read_chunk: config.tcp.read_chunk.max(1),
            max_datagram: config.udp.max_datagram.max(1),
            handle: runtime.handle().clone(),
            running: AtomicBool::new(false),
        });

        Ok(Self {
            shared,
            runtime: Some(runtime),
            poll: Some(poll),
            thread: None,
            events_capacity: config.io.events_capacity.max(16),
            poll_tick: Duration::from_millis(config.io.poll_tick_ms.max(1)),
            cleanup_interval: config.cleanup_interval(),
            shutdown_retries: config.shutdown_retries,
            shutdown_retry_interval: config.shutdown_retry_interval(),
        })
    }

    /// Spawn the multiplexer thread. Fails if the engine already ran.
    pub fn start(&mut self) -> Result<()> {
        let mut poll = self
            .poll
            .take()
            .ok_or_else(|| RelayError::Internal("socket I/O engine already started".into()))?;
        self.shared.running.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let capacity = self.events_capacity;
        let tick = self.poll_tick;
        let cleanup_interval = self.cleanup_interval;
        let thread = std::thread::Builder::new()
            .name("relay-io".into())
            .spawn(move || {
                if let Err(e) = run_loop(&shared, &mut poll, capacity, tick, cleanup_interval) {
                    error!("socket I/O multiplexer failed: {}", e);
                }
                shared.running.store(false, Ordering::Release);
            })?;
        self.thread = Some(thread);
        info!("socket I/O engine started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn notifier(&self) -> &IoNotifier {
        &self.shared.notifier
    }

    /// Stop the multiplexer, drain the worker pool and close every
    /// session. Safe to call more than once.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.notifier.wake();

        if let Some(thread) = self.thread.take() {
            if !join_with_retries(thread, self.shutdown_retries, self.shutdown_retry_interval, "relay-io") {
                warn!("socket I/O multiplexer did not stop in time");
            }
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(self.shutdown_retry_interval);
        }
        self.shared.table.close_all();
        info!("socket I/O engine stopped");
    }
}

impl Drop for SocketIoEngine {
    fn drop(&mut self) {
        if self.thread.is_some() || self.runtime.is_some() {
            self.stop();
        }
    }
}

fn run_loop(
    shared: &Arc<EngineShared>,
    poll: &mut Poll,
    capacity: usize,
    tick: Duration,
    cleanup_interval: Duration,
) -> io::Result<()> {
    let mut events = Events::with_capacity(capacity);
    let mut last_cleanup = Instant::now();

    while shared.running.load(Ordering::Acquire) {
        if let Err(e) = poll.poll(&mut events, Some(tick)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            shared.process(event.token(), Readiness::from_event(event));
        }

        if !shared.running.load(Ordering::Acquire) {
            break;
        }
        for token in shared.notifier.drain() {
            shared.process(token, Readiness::default());
        }

        if last_cleanup.elapsed() >= cleanup_interval {
            shared.table.reap();
            last_cleanup = Instant::now();
        }
    }
    debug!("socket I/O multiplexer exiting");
    Ok(())
}
