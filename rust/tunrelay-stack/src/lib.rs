//! tunrelay-stack - user-space IPv4 relay for VPN tunnels
//!
//! Terminates the TCP and UDP flows a device routes into a tun interface
//! and re-originates each one on a native, protected socket. Remote
//! responses are wrapped back into synthesized IPv4 packets and written
//! into the tunnel, so applications see ordinary connections.
//!
//! # Features
//!
//! - IPv4/TCP/UDP header codec with RFC 1071 checksums
//! - Minimal TCP endpoint: handshake, in-order data, flow control by the
//!   client's window, FIN/RST teardown
//! - Connected UDP relay with preserved datagram boundaries
//! - Edge-triggered socket multiplexer with a bounded worker pool
//! - Packet capture fan-out to subscribers and trace sinks
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                       tun device                            |
//! +-------------------------------------------------------------+
//!        | raw IPv4 packets                 ^ synthesized replies
//!        v                                  |
//! +---------------------+      +-------------------------------+
//! |   SessionHandler    |----->|   PacketBuilder (checksums)   |
//! | (flag state machine)|      +-------------------------------+
//! +---------------------+                   ^
//!        |                                  |
//!        v                                  |
//! +---------------------+      +-------------------------------+
//! |    SessionTable     |<---->|        SocketIoEngine         |
//! | (key + token index) |      | mio poll thread + worker pool |
//! +---------------------+      +-------------------------------+
//!                                           |
//!                                           v
//!                              protected TCP/UDP sockets
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tunrelay_stack::StackBuilder;
//!
//! let stack = StackBuilder::new()
//!     .mss(1360)
//!     .protector(|fd| vpn_service.protect(fd))
//!     .build(Arc::new(tun_writer))?;
//! stack.start()?;
//! stack.run_ingest(tun_reader)?;
//! ```

pub mod builder;
pub mod checksum;
pub mod config;
pub mod error;
pub mod handler;
pub mod io;
pub mod packet;
pub mod platform;
pub mod publish;
pub mod session;
pub mod stack;
pub mod stats;
pub mod table;

#[cfg(test)]
mod tests;

// Re-exports for convenience
pub use builder::PacketBuilder;
pub use config::{IoConfig, StackConfig, TcpConfig, UdpConfig};
pub use error::{HeaderError, RelayError, Result};
pub use handler::SessionHandler;
pub use io::{Channel, IoNotifier, SocketIoEngine};
pub use packet::{Ipv4Header, Packet, TcpFlags, TcpHeader, TcpOptions, TransportHeader, UdpHeader};
pub use platform::{ClientPacketWriter, NoProtection, SocketProtector};
pub use publish::{CaptureDispatcher, ChannelPublisher, NullPublisher, PacketPublisher, PacketSubscriber, TraceSink};
pub use session::{Protocol, Session, SessionState};
pub use stack::{RelayStack, StackBuilder};
pub use stats::{StackStats, StatsSnapshot};
pub use table::{SessionKey, SessionTable};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::error::{RelayError, Result};
    pub use crate::platform::{ClientPacketWriter, SocketProtector};
    pub use crate::stack::{RelayStack, StackBuilder};
    pub use crate::config::StackConfig;
}
