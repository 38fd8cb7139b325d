//! Collaborators supplied by the host platform.

use std::io;
use std::os::unix::io::RawFd;

/// Sink for packets travelling back into the tunnel.
///
/// Implementations must accept calls from any thread; the handler and the
/// socket workers write concurrently.
pub trait ClientPacketWriter: Send + Sync {
    fn write_packet(&self, packet: &[u8]) -> io::Result<()>;
}

/// Excludes an outbound socket from the tunnel's routing before it
/// connects. Returns `false` when the platform refused.
pub trait SocketProtector: Send + Sync {
    fn protect(&self, fd: RawFd) -> bool;
}

impl<F> SocketProtector for F
where
    F: Fn(RawFd) -> bool + Send + Sync,
{
    fn protect(&self, fd: RawFd) -> bool {
        self(fd)
    }
}

/// Protector for hosts where relay sockets are not routed into the tunnel.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProtection;

impl SocketProtector for NoProtection {
    fn protect(&self, _fd: RawFd) -> bool {
        true
    }
}
