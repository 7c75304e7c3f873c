//! Error types for the file service.

use filepump_protocol::{Status, StatusCode};
use filepump_transfer::{ErrorKind, TransferError};

/// Errors produced by the file service transport, server and client.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection timed out")]
    Timeout,

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl ServiceError {
    /// Classifies the error with the transfer core's taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Io(_) => ErrorKind::Io,
            ServiceError::Json(_) | ServiceError::FrameTooLarge { .. } | ServiceError::Protocol(_) => {
                ErrorKind::Protocol
            }
            ServiceError::Timeout => ErrorKind::DeadlineExceeded,
            ServiceError::Transfer(e) => e.kind(),
        }
    }

    /// Converts into a [`TransferError`] so it can flow through pumps.
    pub fn into_transfer(self) -> TransferError {
        match self {
            ServiceError::Io(e) => TransferError::Io(e),
            ServiceError::Transfer(e) => e,
            ServiceError::Timeout => TransferError::DeadlineExceeded,
            other => TransferError::Protocol(other.to_string()),
        }
    }

    /// The status frame reporting this error to the peer.
    pub fn to_status(&self) -> Status {
        let message = match self {
            ServiceError::Transfer(e) => transfer_message(e),
            other => other.to_string(),
        };
        Status::new(status_code(self.kind()), message)
    }
}

/// Maps an error kind onto its wire status code.
pub fn status_code(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidArgument => StatusCode::InvalidArgument,
        ErrorKind::NotFound => StatusCode::NotFound,
        ErrorKind::Protocol => StatusCode::Protocol,
        ErrorKind::Backpressure => StatusCode::Backpressure,
        ErrorKind::DeadlineExceeded => StatusCode::DeadlineExceeded,
        ErrorKind::Cancelled => StatusCode::Cancelled,
        ErrorKind::Io => StatusCode::Io,
        ErrorKind::Unauthenticated => StatusCode::Unauthenticated,
    }
}

/// Maps a wire status code back onto an error kind. `Ok` has none.
pub fn error_kind(code: StatusCode) -> Option<ErrorKind> {
    Some(match code {
        StatusCode::Ok => return None,
        StatusCode::InvalidArgument => ErrorKind::InvalidArgument,
        StatusCode::NotFound => ErrorKind::NotFound,
        StatusCode::Protocol => ErrorKind::Protocol,
        StatusCode::Backpressure => ErrorKind::Backpressure,
        StatusCode::DeadlineExceeded => ErrorKind::DeadlineExceeded,
        StatusCode::Cancelled => ErrorKind::Cancelled,
        StatusCode::Io => ErrorKind::Io,
        StatusCode::Unauthenticated => ErrorKind::Unauthenticated,
    })
}

/// Turns a status received from the peer into a result.
pub fn check_status(status: &Status) -> Result<(), TransferError> {
    match error_kind(status.code) {
        None => Ok(()),
        Some(kind) => Err(TransferError::from_kind(kind, status.message.clone())),
    }
}

fn transfer_message(err: &TransferError) -> String {
    match err {
        TransferError::InvalidArgument(m)
        | TransferError::NotFound(m)
        | TransferError::Protocol(m)
        | TransferError::Unauthenticated(m) => m.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KINDS: [ErrorKind; 8] = [
        ErrorKind::InvalidArgument,
        ErrorKind::NotFound,
        ErrorKind::Protocol,
        ErrorKind::Backpressure,
        ErrorKind::DeadlineExceeded,
        ErrorKind::Cancelled,
        ErrorKind::Io,
        ErrorKind::Unauthenticated,
    ];

    #[test]
    fn every_kind_maps_back() {
        for kind in KINDS {
            assert_eq!(error_kind(status_code(kind)), Some(kind));
        }
        assert_eq!(error_kind(StatusCode::Ok), None);
    }

    #[test]
    fn not_found_status_keeps_plain_message() {
        let err = ServiceError::from(TransferError::NotFound("file was not found".into()));
        let status = err.to_status();
        assert_eq!(status.code, StatusCode::NotFound);
        assert_eq!(status.message, "file was not found");
    }

    #[test]
    fn out_of_order_reports_protocol() {
        let err = ServiceError::from(TransferError::OutOfOrder {
            expected: 1,
            got: 4,
        });
        assert_eq!(err.to_status().code, StatusCode::Protocol);
    }

    #[test]
    fn status_becomes_transfer_error() {
        let status = Status::new(StatusCode::Unauthenticated, "invalid bearer token");
        let err = check_status(&status).unwrap_err();
        assert!(matches!(err, TransferError::Unauthenticated(ref m) if m == "invalid bearer token"));
        assert!(check_status(&Status::ok()).is_ok());
    }

    #[test]
    fn frame_errors_are_protocol() {
        let err = ServiceError::FrameTooLarge { size: 10, max: 5 };
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(err.into_transfer().kind(), ErrorKind::Protocol);
    }
}
