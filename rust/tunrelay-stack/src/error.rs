//! Error types for the tunrelay stack

use crate::table::SessionKey;
use std::io;
use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Failures while decoding wire-format headers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("{layer} header too short: expected {expected}, got {actual}")]
    TooShort {
        layer: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid IP version: {0}")]
    InvalidIpVersion(u8),

    #[error("Invalid IPv4 header length: {0} words")]
    InvalidHeaderLength(u8),

    #[error("Invalid IPv4 total length {total} for header of {header} bytes")]
    InvalidTotalLength { total: u16, header: usize },

    #[error("Invalid TCP data offset: {0} words")]
    InvalidDataOffset(u8),

    #[error("TCP options overrun the buffer: need {needed}, have {available}")]
    OptionsOverrun { needed: usize, available: usize },

    #[error("Unsupported transport protocol: {0}")]
    UnsupportedProtocol(u8),
}

/// Main error type for the relay stack
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed packet: {0}")]
    Header(#[from] HeaderError),

    #[error("Session already exists: {0}")]
    SessionExists(SessionKey),

    #[error("Stack is not running")]
    NotRunning,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// True when the error came from a malformed inbound packet rather than
    /// from local resources.
    pub fn is_malformed(&self) -> bool {
        matches!(self, RelayError::Header(_))
    }
}
