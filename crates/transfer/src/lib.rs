//! Chunked file-transfer core.
//!
//! [`split`]/[`reassemble`] convert between payloads and [`Chunk`]s. A
//! [`TransferSession`] tracks one transfer, a [`ProgressReporter`] turns its
//! recorded chunks into [`ProgressEvent`]s, a [`StreamPump`] moves chunks from
//! a source to a sink, and a [`DuplexCoordinator`] runs two pumps over one
//! channel.

use std::time::Duration;

mod checksum;
mod codec;
mod context;
mod duplex;
mod error;
mod io;
mod progress;
mod pump;
mod session;
mod validation;

pub use checksum::{DigestSink, calculate_file_checksum, checksum_bytes};
pub use codec::{Chunk, Split, reassemble, split};
pub use context::TransferContext;
pub use duplex::{DuplexCoordinator, DuplexReport};
pub use error::{ErrorKind, TransferError};
pub use io::{
    Block, ChannelSink, ChannelSource, ChannelStream, ChunkChannel, ChunkSink, ChunkSource,
    ChunkStream, DuplexChannel, FileSink, FileSource, Framer, IoFuture, IterStream, MemorySink,
};
pub use progress::{DEFAULT_WATERMARK, ProgressEvent, ProgressEvents, ProgressReporter};
pub use pump::StreamPump;
pub use session::{Direction, Lane, SessionId, SessionSnapshot, SessionState, TransferSession};
pub use validation::{resolve_file_name, validate_file_name};

/// Default chunk size: 32 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Tuning knobs shared by pumps and coordinators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Maximum payload bytes per chunk.
    pub chunk_size: usize,
    /// Pause between successive chunk pushes. Zero disables pacing.
    pub chunk_delay: Duration,
    /// Unread progress events a session may accumulate.
    pub progress_watermark: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay: Duration::ZERO,
            progress_watermark: DEFAULT_WATERMARK,
        }
    }
}

impl TransferConfig {
    /// Checks the values are usable.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.chunk_size == 0 {
            return Err(TransferError::InvalidArgument(
                "chunk size must be at least 1".into(),
            ));
        }
        if self.progress_watermark == 0 {
            return Err(TransferError::InvalidArgument(
                "progress watermark must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// A reporter using this config's watermark.
    pub fn reporter(&self) -> Result<ProgressReporter, TransferError> {
        ProgressReporter::new(self.progress_watermark)
    }
}
