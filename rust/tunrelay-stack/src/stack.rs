//! Stack assembly and lifecycle.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use mio::Poll;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::builder::PacketBuilder;
use crate::config::StackConfig;
use crate::error::{RelayError, Result};
use crate::handler::SessionHandler;
use crate::io::{IoNotifier, SocketIoEngine};
use crate::platform::{ClientPacketWriter, NoProtection, SocketProtector};
use crate::publish::{NullPublisher, PacketPublisher};
use crate::stats::{StackStats, StatsSnapshot};
use crate::table::SessionTable;

/// Largest IPv4 packet a tunnel read can return.
const MAX_PACKET: usize = 65535;

/// Builder for a [`RelayStack`]
pub struct StackBuilder {
    config: StackConfig,
    protector: Arc<dyn SocketProtector>,
    publisher: Arc<dyn PacketPublisher>,
}

impl StackBuilder {
    pub fn new() -> Self {
        Self {
            config: StackConfig::default(),
            protector: Arc::new(NoProtection),
            publisher: Arc::new(NullPublisher),
        }
    }

    pub fn config(mut self, config: StackConfig) -> Self {
        self.config = config;
        self
    }

    pub fn mss(mut self, mss: u16) -> Self {
        self.config.tcp.mss = mss;
        self
    }

    pub fn recv_window(mut self, window: u16) -> Self {
        self.config.tcp.recv_window = window;
        self
    }

    pub fn tcp_timeout(mut self, timeout: Duration) -> Self {
        self.config.tcp.idle_timeout_secs = timeout.as_secs();
        self
    }

    pub fn udp_timeout(mut self, timeout: Duration) -> Self {
        self.config.udp.idle_timeout_secs = timeout.as_secs();
        self
    }

    pub fn workers(mut self, core: usize, max: usize) -> Self {
        self.config.io.core_workers = core;
        self.config.io.max_workers = max;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.config.cleanup_interval_secs = interval.as_secs();
        self
    }

    /// Hook called on every outbound socket before it connects.
    pub fn protector<P: SocketProtector + 'static>(mut self, protector: P) -> Self {
        self.protector = Arc::new(protector);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn PacketPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn build(self, writer: Arc<dyn ClientPacketWriter>) -> Result<RelayStack> {
        RelayStack::new(self.config, writer, self.protector, self.publisher)
    }
}

impl Default for StackBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The relay: session table, packet handler and socket I/O engine wired
/// to one tunnel writer.
pub struct RelayStack {
    config: StackConfig,
    table: Arc<SessionTable>,
    handler: SessionHandler,
    engine: Mutex<SocketIoEngine>,
    stats: Arc<StackStats>,
    running: AtomicBool,
}

impl RelayStack {
    pub fn new(
        config: StackConfig,
        writer: Arc<dyn ClientPacketWriter>,
        protector: Arc<dyn SocketProtector>,
        publisher: Arc<dyn PacketPublisher>,
    ) -> Result<Self> {
        config.validate().map_err(RelayError::Internal)?;

        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let notifier = IoNotifier::new(poll.registry())?;
        let stats = Arc::new(StackStats::new());

        let table = Arc::new(SessionTable::new(registry, protector, stats.clone(), &config));
        let builder = Arc::new(PacketBuilder::new(publisher.clone(), config.tcp.recv_window));
        let handler = SessionHandler::new(
            table.clone(),
            builder.clone(),
            writer.clone(),
            publisher,
            notifier.clone(),
            stats.clone(),
            config.tcp.mss,
        );
        let engine = SocketIoEngine::new(poll, notifier, table.clone(), builder, writer, stats.clone(), &config)?;

        Ok(Self {
            config,
            table,
            handler,
            engine: Mutex::new(engine),
            stats,
            running: AtomicBool::new(false),
        })
    }

    pub fn builder() -> StackBuilder {
        StackBuilder::new()
    }

    /// Start the socket I/O engine. Packets may be handled before this, but
    /// nothing reaches remote sockets until it runs.
    pub fn start(&self) -> Result<()> {
        self.engine.lock().start()?;
        self.running.store(true, Ordering::Release);
        info!("relay stack started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Handle one packet read from the tunnel.
    pub fn handle_packet(&self, raw: &[u8]) -> Result<()> {
        self.handler.handle_inbound_packet(raw)
    }

    /// Read packets from `tunnel` until the stack stops. Empty and
    /// would-block reads pause briefly; bad packets are logged and skipped.
    pub fn run_ingest<R: Read>(&self, mut tunnel: R) -> Result<()> {
        if !self.is_running() {
            return Err(RelayError::NotRunning);
        }
        let mut buf = vec![0u8; MAX_PACKET];
        let idle = self.config.ingest_idle();

        while self.is_running() {
            match tunnel.read(&mut buf) {
                Ok(0) => std::thread::sleep(idle),
                Ok(n) => {
                    if let Err(e) = self.handle_packet(&buf[..n]) {
                        if e.is_malformed() {
                            debug!("dropping malformed packet: {}", e);
                        } else {
                            warn!("packet handling failed: {}", e);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::sleep(idle),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if !self.is_running() {
                        break;
                    }
                    return Err(e.into());
                }
            }
        }
        debug!("tunnel ingest loop exiting");
        Ok(())
    }

    /// Stop the engine and close every session.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.engine.lock().stop();
        info!("relay stack stopped: {}", self.stats.snapshot());
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for RelayStack {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Join `handle`, checking up to `retries` more times `interval` apart.
/// Returns `false` and leaves the thread detached if it never finished.
pub fn join_with_retries(handle: JoinHandle<()>, retries: u32, interval: Duration, name: &str) -> bool {
    for attempt in 0..=retries {
        if handle.is_finished() {
            if handle.join().is_err() {
                warn!("{} thread panicked", name);
            }
            return true;
        }
        if attempt < retries {
            debug!("waiting for {} thread ({}/{})", name, attempt + 1, retries);
            std::thread::sleep(interval);
        }
    }
    false
}
