//! Fan-out of every packet crossing the relay to capture consumers.
//!
//! The handler and the packet builder publish from the hot path, so
//! [`PacketPublisher::publish`] must never block. [`CaptureDispatcher`]
//! drains an unbounded channel on its own thread and hands packets, in
//! publish order, to subscribers and an optional [`TraceSink`].

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::packet::Packet;

/// Non-blocking packet fan-out point.
pub trait PacketPublisher: Send + Sync {
    fn publish(&self, packet: Packet);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPublisher;

impl PacketPublisher for NullPublisher {
    fn publish(&self, _packet: Packet) {}
}

/// In-process consumer of published packets.
pub trait PacketSubscriber: Send + Sync {
    fn on_packet(&self, packet: &Packet);
}

/// Persistent packet trace (for example a capture file writer).
pub trait TraceSink: Send {
    fn add_packet(&mut self, data: &[u8], offset: usize, length: usize, timestamp_micros: u64) -> io::Result<()>;
}

enum CaptureEvent {
    Packet { packet: Packet, timestamp_micros: u64 },
    Shutdown,
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Publisher half of a capture channel.
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<CaptureEvent>,
}

impl PacketPublisher for ChannelPublisher {
    fn publish(&self, packet: Packet) {
        let event = CaptureEvent::Packet { packet, timestamp_micros: now_micros() };
        // Fails only once the dispatcher is gone; late packets are dropped.
        let _ = self.tx.send(event);
    }
}

/// Background thread delivering published packets.
pub struct CaptureDispatcher {
    control: mpsc::UnboundedSender<CaptureEvent>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureDispatcher {
    /// Spawn the dispatcher and return it with the publisher feeding it.
    pub fn start(
        sink: Option<Box<dyn TraceSink>>,
        subscribers: Vec<Arc<dyn PacketSubscriber>>,
    ) -> io::Result<(Self, ChannelPublisher)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = thread::Builder::new()
            .name("relay-capture".into())
            .spawn(move || dispatch_loop(rx, sink, subscribers))?;
        let publisher = ChannelPublisher { tx: tx.clone() };
        Ok((Self { control: tx, handle: Some(handle) }, publisher))
    }

    /// Ask the thread to exit after the packets already queued.
    pub fn stop(&self) {
        let _ = self.control.send(CaptureEvent::Shutdown);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the thread. Call after [`stop`](Self::stop).
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("capture dispatcher panicked");
            }
        }
    }
}

fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<CaptureEvent>,
    mut sink: Option<Box<dyn TraceSink>>,
    subscribers: Vec<Arc<dyn PacketSubscriber>>,
) {
    debug!("capture dispatcher started");
    while let Some(event) = rx.blocking_recv() {
        let (packet, timestamp_micros) = match event {
            CaptureEvent::Packet { packet, timestamp_micros } => (packet, timestamp_micros),
            CaptureEvent::Shutdown => break,
        };
        if let Some(sink) = sink.as_mut() {
            let data = packet.buffer();
            if let Err(e) = sink.add_packet(data, 0, data.len(), timestamp_micros) {
                warn!("trace sink rejected packet: {}", e);
            }
        }
        for subscriber in &subscribers {
            subscriber.on_packet(&packet);
        }
    }
    debug!("capture dispatcher stopped");
}
