//! Error types for flowprobe-core.

use thiserror::Error;

use crate::address::FlowAddress;
use crate::context::ContextKind;

/// Main error type for engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Error while decoding a packet or stream.
    #[error("Protocol parse error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A child with this address is already registered under the parent.
    #[error("Context already exists for {address}")]
    DuplicateContext { address: FlowAddress },

    /// An operation needed an ancestor of a given kind and none was found.
    #[error("No {kind:?} context in ancestry")]
    MissingAncestor { kind: ContextKind },

    /// I/O error (packet injection).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors scoped to a single packet, as opposed to invariant
    /// violations that indicate a dispatch bug.
    pub fn is_parse_error(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}

/// Errors raised by protocol decoders.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Packet too short for protocol header
    #[error("{protocol}: packet too short (need {needed} bytes, have {have})")]
    PacketTooShort {
        protocol: &'static str,
        needed: usize,
        have: usize,
    },

    /// Declared length exceeds the captured bytes
    #[error("{protocol}: truncated (declared {declared} bytes, captured {captured})")]
    Truncated {
        protocol: &'static str,
        declared: usize,
        captured: usize,
    },

    /// Invalid header field value
    #[error("{protocol}: invalid {field}: {reason}")]
    InvalidField {
        protocol: &'static str,
        field: &'static str,
        reason: String,
    },

    /// Checksum mismatch
    #[error("{protocol}: checksum mismatch (expected {expected:#x}, got {actual:#x})")]
    ChecksumMismatch {
        protocol: &'static str,
        expected: u16,
        actual: u16,
    },

    /// Application grammar violation
    #[error("{protocol} protocol violation: {reason}")]
    Violation {
        protocol: &'static str,
        reason: String,
    },
}

impl ProtocolError {
    pub(crate) fn too_short(protocol: &'static str, needed: usize, have: usize) -> Self {
        ProtocolError::PacketTooShort {
            protocol,
            needed,
            have,
        }
    }

    pub(crate) fn violation(protocol: &'static str, reason: impl Into<String>) -> Self {
        ProtocolError::Violation {
            protocol,
            reason: reason.into(),
        }
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
