//! Crate-wide error types.
//!
//! Every fallible boundary in this engine returns one of the `thiserror`-derived types
//! below rather than a bare `String`, so a caller can match on the QUIC transport error
//! code without re-parsing a message.

use thiserror::Error;

use crate::primitives::varint::{UnexpectedEnd, VarIntBoundsExceeded};

/// The wire-format QUIC transport error codes (RFC 9000 §20.1), extended with the
/// crypto-alert range RFC 9000 reserves at `0x0100..=0x01ff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorCode {
    NoError,
    InternalError,
    ConnectionRefused,
    FlowControlError,
    StreamLimitError,
    StreamStateError,
    FinalSizeError,
    FrameEncodingError,
    TransportParameterError,
    ConnectionIdLimitError,
    ProtocolViolation,
    InvalidToken,
    ApplicationError,
    CryptoBufferExceeded,
    KeyUpdateError,
    AeadLimitReached,
    NoViablePath,
    Crypto(u8),
}

impl TransportErrorCode {
    pub const fn code(self) -> u64 {
        match self {
            Self::NoError => 0x00,
            Self::InternalError => 0x01,
            Self::ConnectionRefused => 0x02,
            Self::FlowControlError => 0x03,
            Self::StreamLimitError => 0x04,
            Self::StreamStateError => 0x05,
            Self::FinalSizeError => 0x06,
            Self::FrameEncodingError => 0x07,
            Self::TransportParameterError => 0x08,
            Self::ConnectionIdLimitError => 0x09,
            Self::ProtocolViolation => 0x0a,
            Self::InvalidToken => 0x0b,
            Self::ApplicationError => 0x0c,
            Self::CryptoBufferExceeded => 0x0d,
            Self::KeyUpdateError => 0x0e,
            Self::AeadLimitReached => 0x0f,
            Self::NoViablePath => 0x10,
            Self::Crypto(alert) => 0x0100 | alert as u64,
        }
    }

    pub const fn from_code(value: u64) -> Option<Self> {
        Some(match value {
            0x00 => Self::NoError,
            0x01 => Self::InternalError,
            0x02 => Self::ConnectionRefused,
            0x03 => Self::FlowControlError,
            0x04 => Self::StreamLimitError,
            0x05 => Self::StreamStateError,
            0x06 => Self::FinalSizeError,
            0x07 => Self::FrameEncodingError,
            0x08 => Self::TransportParameterError,
            0x09 => Self::ConnectionIdLimitError,
            0x0a => Self::ProtocolViolation,
            0x0b => Self::InvalidToken,
            0x0c => Self::ApplicationError,
            0x0d => Self::CryptoBufferExceeded,
            0x0e => Self::KeyUpdateError,
            0x0f => Self::AeadLimitReached,
            0x10 => Self::NoViablePath,
            0x0100..=0x01ff => Self::Crypto((value & 0xff) as u8),
            _ => return None,
        })
    }
}

/// A connection-fatal transport error: populates the engine's error slot and drives an
/// immediate close.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("transport error {code:?}: {reason} (frame_type={frame_type:?})")]
pub struct TransportError {
    pub code: TransportErrorCode,
    /// Wire type of the frame that triggered the error, if any (0 = unknown, per RFC 9000).
    pub frame_type: Option<u64>,
    pub reason: String,
}

impl TransportError {
    pub fn new(code: TransportErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            frame_type: None,
            reason: reason.into(),
        }
    }

    pub fn with_frame_type(mut self, frame_type: u64) -> Self {
        self.frame_type = Some(frame_type);
        self
    }

    pub fn frame_encoding(reason: impl Into<String>) -> Self {
        Self::new(TransportErrorCode::FrameEncodingError, reason)
    }

    pub fn protocol_violation(reason: impl Into<String>) -> Self {
        Self::new(TransportErrorCode::ProtocolViolation, reason)
    }
}

impl From<UnexpectedEnd> for TransportError {
    fn from(_: UnexpectedEnd) -> Self {
        Self::frame_encoding("buffer underflow decoding wire format")
    }
}

impl From<VarIntBoundsExceeded> for TransportError {
    fn from(_: VarIntBoundsExceeded) -> Self {
        Self::frame_encoding("varint exceeds 62-bit range")
    }
}

/// The reason a [`crate::connection::Connection`] stopped running, surfaced to streams and
/// to the consumer of the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection closed by transport-layer error: {0}")]
    Transport(#[from] TransportError),

    #[error("connection closed locally: code={error_code} reason={reason:?}")]
    LocallyClosed { error_code: u64, reason: String },

    #[error("connection closed by peer: code={error_code} app={is_app} reason={reason:?}")]
    PeerClosed {
        error_code: u64,
        is_app: bool,
        reason: String,
    },

    #[error("connection timed out")]
    TimedOut,

    #[error("stateless reset received")]
    Reset,
}

pub type DecodeResult<T> = Result<T, TransportError>;

pub fn require(cond: bool, reason: impl Into<String>) -> DecodeResult<()> {
    if !cond {
        return Err(TransportError::frame_encoding(reason));
    }
    Ok(())
}
