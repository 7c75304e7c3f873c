use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum encoded frame size in bytes (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Bytes of a frame set aside for the JSON envelope around a chunk payload.
pub const ENVELOPE_RESERVE: usize = 4 * 1024;

/// Largest chunk whose base64 encoding still fits in one frame.
pub const MAX_CHUNK_SIZE: usize = MAX_FRAME_SIZE / 4 * 3 - ENVELOPE_RESERVE;

/// Time allowed for a client to send its call header.
pub const CALL_HEADER_TIMEOUT: Duration = Duration::from_secs(5);

/// Authorization scheme expected in [`CallHeader::authorization`](crate::CallHeader).
pub const BEARER_SCHEME: &str = "Bearer";

/// Frame type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Opens a call; payload is a `CallHeader`.
    #[serde(rename = "call")]
    Call,
    /// A request or response payload.
    #[serde(rename = "data")]
    Data,
    /// The client finished sending (half-close).
    #[serde(rename = "close_send")]
    CloseSend,
    /// Terminates the call; carries a `Status`.
    #[serde(rename = "status")]
    Status,
}

/// RPC method exposed by the file service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// Unary: list transferable files.
    #[serde(rename = "list_files")]
    ListFiles,
    /// Server streaming: download one file.
    #[serde(rename = "download")]
    Download,
    /// Client streaming: upload one file, receive its size.
    #[serde(rename = "upload")]
    Upload,
    /// Bidirectional: upload one file while receiving progress messages.
    #[serde(rename = "upload_and_notify_progress")]
    UploadAndNotifyProgress,
}

impl Method {
    /// Wire name of the method.
    pub fn as_str(self) -> &'static str {
        match self {
            Method::ListFiles => "list_files",
            Method::Download => "download",
            Method::Upload => "upload",
            Method::UploadAndNotifyProgress => "upload_and_notify_progress",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome code carried by a `status` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "invalid_argument")]
    InvalidArgument,
    #[serde(rename = "not_found")]
    NotFound,
    #[serde(rename = "protocol")]
    Protocol,
    #[serde(rename = "backpressure")]
    Backpressure,
    #[serde(rename = "deadline_exceeded")]
    DeadlineExceeded,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "io")]
    Io,
    #[serde(rename = "unauthenticated")]
    Unauthenticated,
}
