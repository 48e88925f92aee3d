//! Error types for the flowprobe front-end.

use thiserror::Error;

/// Main error type for capture replay.
#[derive(Error, Debug)]
pub enum Error {
    /// Error reading a capture file
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Error raised by the flow engine
    #[error("Engine error: {0}")]
    Engine(#[from] flowprobe_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors related to capture files and link layers.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Capture file not found: {path}")]
    FileNotFound { path: String },

    /// Not a readable PCAP / PCAPNG stream
    #[error("Malformed capture file: {reason}")]
    InvalidFormat { reason: String },

    /// A link layer with no decapsulation to IP
    #[error("No IP decapsulation for link type {link_type}")]
    UnsupportedLinkType { link_type: u16 },

    /// Frame too short for its link-layer header
    #[error("Truncated frame on link type {link_type}: header needs {needed} bytes, have {have}")]
    TruncatedFrame {
        link_type: u16,
        needed: usize,
        have: usize,
    },
}

/// Result alias for the capture front-end.
pub type Result<T> = std::result::Result<T, Error>;
