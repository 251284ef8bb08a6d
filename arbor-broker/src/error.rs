//! Broker runtime errors.

use std::io;
use thiserror::Error;

use arbor_core::error::{CoreError, ErrorCode};
use arbor_core::message::Message;

/// Failures surfaced by the broker runtime and its client handles.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// IO error during transport setup
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Kernel-level failure (codec, payload, idset)
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A channel to a peer, module or the broker loop is closed
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    /// An RPC completed with a wire error
    #[error("RPC failed: {code}{}", .text.as_deref().map(|t| format!(": {t}")).unwrap_or_default())]
    Rpc { code: ErrorCode, text: Option<String> },

    /// Module-specific failure
    #[error("Module error: {0}")]
    Module(String),
}

/// Result type alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

impl BrokerError {
    /// Lift a response into a result: error responses become `Rpc` errors.
    pub fn check(msg: Message) -> Result<Message> {
        match msg.error() {
            Some(err) => Err(Self::Rpc { code: err.code, text: err.text.clone() }),
            None => Ok(msg),
        }
    }

    /// The wire error kind, if this is an RPC failure.
    #[must_use]
    pub const fn rpc_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True when a streaming RPC ended normally.
    #[must_use]
    pub const fn is_stream_end(&self) -> bool {
        matches!(self, Self::Rpc { code: ErrorCode::NoData, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_lifts_errors() {
        let req = Message::request("a.b").with_matchtag(1);
        assert!(BrokerError::check(Message::response_to(&req)).is_ok());

        let err = BrokerError::check(Message::error_response_to(
            &req,
            ErrorCode::NoData,
            None,
        ))
        .unwrap_err();
        assert!(err.is_stream_end());
        assert_eq!(err.rpc_code(), Some(ErrorCode::NoData));
    }
}
