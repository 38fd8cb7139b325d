//! Relay service lifecycle: capture dispatcher, relay stack and the tunnel
//! ingest thread, started and stopped as one unit.

use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{error, info, warn};
use tunrelay_stack::stack::join_with_retries;
use tunrelay_stack::{
    CaptureDispatcher, NullPublisher, PacketPublisher, PacketSubscriber, RelayStack, SocketProtector, StatsSnapshot,
    TraceSink,
};

use crate::config::ServiceConfig;
use crate::error::Result;
use crate::tun::TunDevice;

/// Optional consumers of relayed traffic.
#[derive(Default)]
pub struct CaptureTargets {
    pub sink: Option<Box<dyn TraceSink>>,
    pub subscribers: Vec<Arc<dyn PacketSubscriber>>,
}

/// A running relay bound to one tunnel.
pub struct RelayService {
    config: ServiceConfig,
    stack: Arc<RelayStack>,
    dispatcher: Option<CaptureDispatcher>,
    ingest: Option<JoinHandle<()>>,
}

impl RelayService {
    /// Wire `tun` to a new relay stack and start moving packets.
    pub fn start<P: SocketProtector + 'static>(
        config: ServiceConfig,
        tun: TunDevice,
        protector: P,
        capture: CaptureTargets,
    ) -> Result<Self> {
        config.validate()?;

        let (dispatcher, publisher): (Option<CaptureDispatcher>, Arc<dyn PacketPublisher>) = if config.capture {
            let (dispatcher, publisher) = CaptureDispatcher::start(capture.sink, capture.subscribers)?;
            (Some(dispatcher), Arc::new(publisher))
        } else {
            (None, Arc::new(NullPublisher))
        };

        let (reader, writer) = tun.split()?;
        let stack = Arc::new(
            RelayStack::builder()
                .config(config.stack.clone())
                .protector(protector)
                .publisher(publisher)
                .build(Arc::new(writer))?,
        );
        stack.start()?;

        let ingest_stack = Arc::clone(&stack);
        let ingest = std::thread::Builder::new()
            .name("relay-ingest".into())
            .spawn(move || {
                if let Err(e) = ingest_stack.run_ingest(reader) {
                    error!("tunnel ingest stopped: {}", e);
                    ingest_stack.stop();
                }
            })?;

        info!("relay service started (capture {})", if config.capture { "on" } else { "off" });
        Ok(Self {
            config,
            stack,
            dispatcher,
            ingest: Some(ingest),
        })
    }

    pub fn is_running(&self) -> bool {
        self.stack.is_running()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stack.stats()
    }

    pub fn stack(&self) -> &Arc<RelayStack> {
        &self.stack
    }

    /// Stop ingest, the engine and capture, in that order. Threads that do
    /// not finish within the configured retries are left detached.
    pub fn stop(&mut self) {
        self.stack.stop();

        let retries = self.config.stack.shutdown_retries;
        let interval = self.config.stack.shutdown_retry_interval();
        if let Some(ingest) = self.ingest.take() {
            if !join_with_retries(ingest, retries, interval, "relay-ingest") {
                warn!("tunnel ingest thread did not stop in time");
            }
        }

        if let Some(mut dispatcher) = self.dispatcher.take() {
            dispatcher.stop();
            for _ in 0..=retries {
                if dispatcher.is_finished() {
                    break;
                }
                std::thread::sleep(interval);
            }
            if dispatcher.is_finished() {
                dispatcher.join();
            } else {
                warn!("capture dispatcher did not stop in time");
            }
        }
        info!("relay service stopped: {}", self.stack.stats());
    }
}

impl Drop for RelayService {
    fn drop(&mut self) {
        if self.ingest.is_some() {
            self.stop();
        }
    }
}
