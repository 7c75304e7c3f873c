//! Error taxonomy for the transfer core.

use std::fmt;

/// Coarse classification of a [`TransferError`].
///
/// This is what a session records as its `last_error` and what the RPC
/// layer maps onto wire status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Protocol,
    Backpressure,
    DeadlineExceeded,
    Cancelled,
    Io,
    Unauthenticated,
}

impl ErrorKind {
    /// Short lowercase label, used in progress messages and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::NotFound => "not found",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Backpressure => "backpressure",
            ErrorKind::DeadlineExceeded => "deadline exceeded",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Io => "io",
            ErrorKind::Unauthenticated => "unauthenticated",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("out of order chunk: expected sequence {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },

    #[error("chunk sequence ended without a final chunk")]
    MissingFinal,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("progress buffer exceeded watermark of {watermark} events")]
    Backpressure { watermark: usize },

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
}

impl TransferError {
    /// Returns the error's kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            TransferError::NotFound(_) => ErrorKind::NotFound,
            TransferError::OutOfOrder { .. }
            | TransferError::MissingFinal
            | TransferError::Protocol(_) => ErrorKind::Protocol,
            TransferError::Backpressure { .. } => ErrorKind::Backpressure,
            TransferError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            TransferError::Cancelled => ErrorKind::Cancelled,
            TransferError::Io(_) => ErrorKind::Io,
            TransferError::Unauthenticated(_) => ErrorKind::Unauthenticated,
        }
    }

    /// Rebuilds an error from a kind and message, as received from a peer.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::InvalidArgument => TransferError::InvalidArgument(message),
            ErrorKind::NotFound => TransferError::NotFound(message),
            ErrorKind::Protocol => TransferError::Protocol(message),
            ErrorKind::Backpressure => TransferError::Backpressure { watermark: 0 },
            ErrorKind::DeadlineExceeded => TransferError::DeadlineExceeded,
            ErrorKind::Cancelled => TransferError::Cancelled,
            ErrorKind::Io => TransferError::Io(std::io::Error::other(message)),
            ErrorKind::Unauthenticated => TransferError::Unauthenticated(message),
        }
    }
}
