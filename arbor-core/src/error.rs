//! Arbor error types.
//!
//! Two layers live here:
//! - [`ErrorCode`]: the stable numeric error kinds that travel on the wire
//!   inside error responses.
//! - [`CoreError`]: failures produced by the kernel itself (codec, message
//!   well-formedness, idset parsing).

use std::io;
use thiserror::Error;

/// Stable error kinds surfaced on the wire.
///
/// The numeric values are part of the inter-broker protocol and must not be
/// reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// Malformed message or protocol misuse
    Protocol = 1,
    /// No service registered for the request topic
    MethodNotFound = 2,
    /// Credential denied by a service ACL
    Permission = 3,
    /// Request deadline expired
    Timeout = 4,
    /// Requested object does not exist
    NotFound = 5,
    /// A local client already joined this group
    AlreadyMember = 6,
    /// No cached join exists for this group
    NotMember = 7,
    /// The peer channel is closed
    PeerUnreachable = 8,
    /// The owning module exited before responding
    ModuleGone = 9,
    /// Normal end of a streaming response
    NoData = 10,
    /// Unclassified internal failure
    Internal = 11,
}

impl ErrorCode {
    /// Numeric wire representation.
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        self as u32
    }

    /// Decode a numeric wire code. Unknown codes map to `Internal` so a
    /// newer peer cannot wedge an older one.
    #[must_use]
    pub const fn from_u32(code: u32) -> Self {
        match code {
            1 => Self::Protocol,
            2 => Self::MethodNotFound,
            3 => Self::Permission,
            4 => Self::Timeout,
            5 => Self::NotFound,
            6 => Self::AlreadyMember,
            7 => Self::NotMember,
            8 => Self::PeerUnreachable,
            9 => Self::ModuleGone,
            10 => Self::NoData,
            _ => Self::Internal,
        }
    }

    /// Short lower-case name used in logs and stats keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Protocol => "protocol",
            Self::MethodNotFound => "method-not-found",
            Self::Permission => "permission",
            Self::Timeout => "timeout",
            Self::NotFound => "not-found",
            Self::AlreadyMember => "already-member",
            Self::NotMember => "not-member",
            Self::PeerUnreachable => "peer-unreachable",
            Self::ModuleGone => "module-gone",
            Self::NoData => "no-data",
            Self::Internal => "internal",
        }
    }

    /// `NoData` terminates a streaming response without signalling failure.
    #[must_use]
    pub const fn is_stream_end(self) -> bool {
        matches!(self, Self::NoData)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kernel error type for codec and model operations.
#[derive(Error, Debug)]
pub enum CoreError {
    /// IO error while framing or deframing a stream
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed wire data
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Frame or message exceeds the configured bound
    #[error("Message too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },

    /// Route stack exceeded the hop bound or contains a cycle
    #[error("Too many hops: {0}")]
    TooManyHops(String),

    /// Invalid idset text form
    #[error("Invalid idset: {0}")]
    InvalidIdset(String),

    /// Structured payload failed to serialize or deserialize
    #[error("Payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Result type alias for kernel operations.
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Create a protocol error with a message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Map this failure onto its wire error kind.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Protocol(_)
            | Self::TooLarge { .. }
            | Self::InvalidIdset(_)
            | Self::TooManyHops(_)
            | Self::Payload(_) => ErrorCode::Protocol,
            Self::Io(_) => ErrorCode::PeerUnreachable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_roundtrip() {
        for code in [
            ErrorCode::Protocol,
            ErrorCode::MethodNotFound,
            ErrorCode::Permission,
            ErrorCode::Timeout,
            ErrorCode::NotFound,
            ErrorCode::AlreadyMember,
            ErrorCode::NotMember,
            ErrorCode::PeerUnreachable,
            ErrorCode::ModuleGone,
            ErrorCode::NoData,
            ErrorCode::Internal,
        ] {
            assert_eq!(ErrorCode::from_u32(code.to_u32()), code);
        }
    }

    #[test]
    fn unknown_code_maps_to_internal() {
        assert_eq!(ErrorCode::from_u32(0), ErrorCode::Internal);
        assert_eq!(ErrorCode::from_u32(9999), ErrorCode::Internal);
    }

    #[test]
    fn stream_end_classification() {
        assert!(ErrorCode::NoData.is_stream_end());
        assert!(!ErrorCode::Timeout.is_stream_end());
    }
}
