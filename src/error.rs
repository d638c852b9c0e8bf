// Copyright 2026 Commlink Contributors

//! Error taxonomy for the comm substrate.
//!
//! There are two layers here.  [`ErrorCode`] is the wire-level error code: a
//! 32-bit integer carried at the front of response payloads and attached to
//! error events.  [`CommError`] is the Rust-level error returned from
//! substrate operations.  Transport failures surface as both: the reactor
//! attaches an `ErrorCode` to the event it delivers, and blocking callers
//! see the corresponding `CommError`.

use std::io;
use std::net::SocketAddr;

use num_derive::{FromPrimitive, ToPrimitive};
use thiserror::Error;

/// Wire-level error codes.
///
/// Codes below `0x10000` are generic protocol-level conditions; the
/// `0x1xxxx` block is reserved for comm-layer transport conditions.
/// Services layer their own code blocks above these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    ProtocolError = 1,
    RequestTruncated = 2,
    ResponseTruncated = 3,
    RequestTimeout = 4,

    NotConnected = 0x0001_0001,
    BrokenConnection = 0x0001_0002,
    ConnectError = 0x0001_0003,
    AlreadyConnected = 0x0001_0004,
    SendError = 0x0001_0005,
    ReceiveError = 0x0001_0006,
}

impl ErrorCode {
    /// Human-readable text for diagnostics and log records.
    pub fn text(&self) -> &'static str {
        match self {
            ErrorCode::Ok => "ok",
            ErrorCode::ProtocolError => "protocol error",
            ErrorCode::RequestTruncated => "request truncated",
            ErrorCode::ResponseTruncated => "response truncated",
            ErrorCode::RequestTimeout => "request timeout",
            ErrorCode::NotConnected => "COMM not connected",
            ErrorCode::BrokenConnection => "COMM broken connection",
            ErrorCode::ConnectError => "COMM connect error",
            ErrorCode::AlreadyConnected => "COMM already connected",
            ErrorCode::SendError => "COMM send error",
            ErrorCode::ReceiveError => "COMM receive error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.text())
    }
}

/// Errors surfaced by substrate operations.
#[derive(Debug, Error)]
pub enum CommError {
    #[error("not connected to {0}")]
    NotConnected(SocketAddr),

    #[error("broken connection to {0}")]
    BrokenConnection(SocketAddr),

    #[error("connect error")]
    ConnectError,

    #[error("already connected to {0}")]
    AlreadyConnected(SocketAddr),

    #[error("request timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("truncated buffer while decoding {0}")]
    Truncated(&'static str),

    /// An application-level error carried back as a normal response payload.
    #[error("remote error {code}: {message}")]
    Remote { code: i32, message: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CommError {
    /// Maps a wire-level code from an error event to the error a caller sees.
    pub fn from_code(code: ErrorCode, addr: SocketAddr) -> CommError {
        match code {
            ErrorCode::RequestTimeout => CommError::Timeout,
            ErrorCode::NotConnected => CommError::NotConnected(addr),
            ErrorCode::BrokenConnection => CommError::BrokenConnection(addr),
            ErrorCode::ConnectError => CommError::ConnectError,
            ErrorCode::AlreadyConnected => CommError::AlreadyConnected(addr),
            other => CommError::Remote {
                code: other as i32,
                message: other.text().to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn codes_round_trip_through_i32() {
        for code in [
            ErrorCode::Ok,
            ErrorCode::ProtocolError,
            ErrorCode::RequestTimeout,
            ErrorCode::NotConnected,
            ErrorCode::BrokenConnection,
            ErrorCode::ConnectError,
        ] {
            assert_eq!(ErrorCode::from_i32(code as i32), Some(code));
        }
    }

    #[test]
    fn unknown_code_does_not_decode() {
        assert_eq!(ErrorCode::from_i32(0x7fff_0000), None);
    }

    #[test]
    fn timeout_code_maps_to_timeout_error() {
        let addr = "127.0.0.1:1".parse().unwrap();
        assert!(matches!(
            CommError::from_code(ErrorCode::RequestTimeout, addr),
            CommError::Timeout
        ));
    }
}
