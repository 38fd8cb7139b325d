//! Socket I/O engine: one multiplexer thread waiting on readiness for every
//! session socket, and a worker pool running the reads and writes it
//! schedules.

pub mod channel;
pub mod engine;
mod reader;
mod writer;

pub use channel::Channel;
pub use engine::SocketIoEngine;

use std::collections::HashSet;
use std::io;
use std::sync::Arc;

use mio::{Registry, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::packet::Packet;
use crate::platform::ClientPacketWriter;
use crate::stats::StackStats;

/// Token of the multiplexer's own waker.
pub const WAKE_TOKEN: Token = Token(0);

/// Wakes the multiplexer to re-evaluate sessions whose work became possible
/// without a socket readiness edge, or to notice shutdown.
#[derive(Clone)]
pub struct IoNotifier {
    waker: Arc<Waker>,
    pending: Arc<Mutex<Vec<Token>>>,
}

impl IoNotifier {
    pub fn new(registry: &Registry) -> io::Result<Self> {
        Ok(Self {
            waker: Arc::new(Waker::new(registry, WAKE_TOKEN)?),
            pending: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Queue `token` for evaluation and wake the multiplexer.
    pub fn notify(&self, token: Token) {
        self.pending.lock().push(token);
        self.wake();
    }

    pub fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake I/O multiplexer: {}", e);
        }
    }

    /// Queued tokens, deduplicated, in first-notified order.
    pub(crate) fn drain(&self) -> Vec<Token> {
        let queued = std::mem::take(&mut *self.pending.lock());
        let mut seen = HashSet::with_capacity(queued.len());
        queued.into_iter().filter(|t| seen.insert(*t)).collect()
    }
}

/// Hand a synthesized packet to the tunnel, counting the outcome.
pub(crate) fn write_to_client(writer: &dyn ClientPacketWriter, stats: &StackStats, packet: &Packet) -> bool {
    match writer.write_packet(packet.buffer()) {
        Ok(()) => {
            stats.record_sent(packet.len());
            true
        }
        Err(e) => {
            stats.record_write_error();
            debug!("tunnel write of {} bytes failed: {}", packet.len(), e);
            false
        }
    }
}
