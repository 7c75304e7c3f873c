//! Wire protocol types for the filepump file service.
//!
//! Every frame on the wire carries one [`Message`] envelope. The first frame
//! of a connection is a `call` carrying a [`CallHeader`]; the rest are `data`,
//! `close_send` and a terminating `status`.

pub mod constants;
pub mod envelope;
pub mod messages;

// Re-export primary types for convenience.
pub use constants::{Method, MessageType, StatusCode};
pub use envelope::{Message, Status};
pub use messages::{
    CallHeader, ChunkFrame, DownloadRequest, ListFilesRequest, ListFilesResponse, UploadRequest,
    UploadResponse,
};
