//! Relay statistics
//!
//! Counters are updated with relaxed atomics from every thread and read
//! through [`StackStats::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::session::Protocol;

/// Stack-wide statistics
#[derive(Debug, Default)]
pub struct StackStats {
    start_time: Option<Instant>,

    // Packet statistics
    pub packets_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub packets_invalid: AtomicU64,

    // Byte statistics
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,

    // Protocol statistics
    pub tcp_packets: AtomicU64,
    pub udp_packets: AtomicU64,
    pub other_packets: AtomicU64,

    // Session statistics
    pub tcp_sessions_total: AtomicU64,
    pub tcp_sessions_active: AtomicU64,
    pub udp_sessions_total: AtomicU64,
    pub udp_sessions_active: AtomicU64,
    pub sessions_reaped: AtomicU64,

    // Relay statistics
    pub resets_sent: AtomicU64,
    pub connect_failures: AtomicU64,
    pub write_errors: AtomicU64,
    pub window_full_pauses: AtomicU64,
    pub bytes_to_remote: AtomicU64,
    pub bytes_from_remote: AtomicU64,
}

impl StackStats {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.map(|t| t.elapsed()).unwrap_or(Duration::ZERO)
    }

    /// Packet read from the tunnel
    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Packet written to the tunnel
    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.packets_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tcp(&self) {
        self.tcp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_udp(&self) {
        self.udp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_other(&self) {
        self.other_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_session_opened(&self, protocol: Protocol) {
        match protocol {
            Protocol::Tcp => {
                self.tcp_sessions_total.fetch_add(1, Ordering::Relaxed);
                self.tcp_sessions_active.fetch_add(1, Ordering::Relaxed);
            }
            Protocol::Udp => {
                self.udp_sessions_total.fetch_add(1, Ordering::Relaxed);
                self.udp_sessions_active.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_session_closed(&self, protocol: Protocol) {
        let active = match protocol {
            Protocol::Tcp => &self.tcp_sessions_active,
            Protocol::Udp => &self.udp_sessions_active,
        };
        let _ = active.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn record_reaped(&self) {
        self.sessions_reaped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.resets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_window_full(&self) {
        self.window_full_pauses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_to_remote(&self, bytes: usize) {
        self.bytes_to_remote.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_from_remote(&self, bytes: usize) {
        self.bytes_from_remote.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime: self.uptime(),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            packets_invalid: self.packets_invalid.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            tcp_packets: self.tcp_packets.load(Ordering::Relaxed),
            udp_packets: self.udp_packets.load(Ordering::Relaxed),
            other_packets: self.other_packets.load(Ordering::Relaxed),
            tcp_sessions_total: self.tcp_sessions_total.load(Ordering::Relaxed),
            tcp_sessions_active: self.tcp_sessions_active.load(Ordering::Relaxed),
            udp_sessions_total: self.udp_sessions_total.load(Ordering::Relaxed),
            udp_sessions_active: self.udp_sessions_active.load(Ordering::Relaxed),
            sessions_reaped: self.sessions_reaped.load(Ordering::Relaxed),
            resets_sent: self.resets_sent.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            window_full_pauses: self.window_full_pauses.load(Ordering::Relaxed),
            bytes_to_remote: self.bytes_to_remote.load(Ordering::Relaxed),
            bytes_from_remote: self.bytes_from_remote.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`StackStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub packets_received: u64,
    pub packets_sent: u64,
    pub packets_dropped: u64,
    pub packets_invalid: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub tcp_packets: u64,
    pub udp_packets: u64,
    pub other_packets: u64,
    pub tcp_sessions_total: u64,
    pub tcp_sessions_active: u64,
    pub udp_sessions_total: u64,
    pub udp_sessions_active: u64,
    pub sessions_reaped: u64,
    pub resets_sent: u64,
    pub connect_failures: u64,
    pub write_errors: u64,
    pub window_full_pauses: u64,
    pub bytes_to_remote: u64,
    pub bytes_from_remote: u64,
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "up {}s | tun rx {} pkts / {} B, tx {} pkts / {} B | tcp {}/{} udp {}/{} sessions | rst {} | invalid {}",
            self.uptime.as_secs(),
            self.packets_received,
            self.bytes_received,
            self.packets_sent,
            self.bytes_sent,
            self.tcp_sessions_active,
            self.tcp_sessions_total,
            self.udp_sessions_active,
            self.udp_sessions_total,
            self.resets_sent,
            self.packets_invalid,
        )
    }
}
