//! tunrelay-service - platform shell around the tunrelay stack
//!
//! Takes the tunnel descriptor a VPN service hands over, plus a socket
//! protect hook, and runs the relay on it: configuration from YAML,
//! tracing setup with an in-memory log buffer for the host UI, optional
//! packet capture, and an orderly shutdown.

pub mod config;
pub mod error;
pub mod logging;
pub mod service;
pub mod tun;

pub use config::{LogLevel, ServiceConfig};
pub use error::{Result, ServiceError};
pub use logging::{clear_logs, get_recent_logs, init_logging};
pub use service::{CaptureTargets, RelayService};
pub use tun::{TunDevice, TunWriter};
