//! Stack configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// TCP relay tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Upper bound for the segment size used towards the client.
    pub mss: u16,
    /// Window advertised in replies to the client.
    pub recv_window: u16,
    /// Bytes requested per socket read.
    pub read_chunk: usize,
    pub idle_timeout_secs: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            mss: 1360,
            recv_window: 65535,
            read_chunk: 16384,
            idle_timeout_secs: 300,
        }
    }
}

impl TcpConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// UDP relay tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    pub idle_timeout_secs: u64,
    /// Largest datagram read from a relay socket.
    pub max_datagram: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
            max_datagram: 65507,
        }
    }
}

impl UdpConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Socket I/O engine tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    pub core_workers: usize,
    pub max_workers: usize,
    pub keep_alive_secs: u64,
    pub events_capacity: usize,
    /// Longest readiness wait before housekeeping runs.
    pub poll_tick_ms: u64,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            core_workers: 8,
            max_workers: 100,
            keep_alive_secs: 10,
            events_capacity: 1024,
            poll_tick_ms: 1000,
        }
    }
}

/// Top-level stack configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub tcp: TcpConfig,
    pub udp: UdpConfig,
    pub io: IoConfig,
    pub cleanup_interval_secs: u64,
    pub shutdown_retries: u32,
    pub shutdown_retry_interval_ms: u64,
    /// Pause after an empty tunnel read.
    pub ingest_idle_ms: u64,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            tcp: TcpConfig::default(),
            udp: UdpConfig::default(),
            io: IoConfig::default(),
            cleanup_interval_secs: 30,
            shutdown_retries: 5,
            shutdown_retry_interval_ms: 1000,
            ingest_idle_ms: 100,
        }
    }
}

impl StackConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn shutdown_retry_interval(&self) -> Duration {
        Duration::from_millis(self.shutdown_retry_interval_ms)
    }

    pub fn ingest_idle(&self) -> Duration {
        Duration::from_millis(self.ingest_idle_ms)
    }

    /// Check the values the engine depends on.
    pub fn validate(&self) -> Result<(), String> {
        if self.io.core_workers == 0 {
            return Err("io.core_workers must be at least 1".into());
        }
        if self.io.max_workers < self.io.core_workers {
            return Err(format!(
                "io.max_workers ({}) must not be below io.core_workers ({})",
                self.io.max_workers, self.io.core_workers
            ));
        }
        if self.io.events_capacity == 0 {
            return Err("io.events_capacity must be at least 1".into());
        }
        if self.tcp.mss < 64 {
            return Err(format!("tcp.mss {} is too small", self.tcp.mss));
        }
        if self.tcp.read_chunk == 0 || self.udp.max_datagram == 0 {
            return Err("read buffer sizes must be non-zero".into());
        }
        Ok(())
    }
}
