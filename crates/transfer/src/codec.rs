//! Splitting payloads into chunks and putting them back together.

use crate::TransferError;

/// One ordered unit of a transfer's byte stream.
///
/// Immutable once constructed. Sequence numbers start at 0 and increase by
/// one per chunk; the last chunk of a transfer is marked final and may be
/// empty (a zero-byte file is a single empty final chunk).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    sequence: u64,
    payload: Vec<u8>,
    is_final: bool,
}

impl Chunk {
    /// Creates a chunk.
    pub fn new(sequence: u64, payload: Vec<u8>, is_final: bool) -> Self {
        Self {
            sequence,
            payload,
            is_final,
        }
    }

    /// Position of this chunk within its transfer.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The chunk's bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Returns `true` if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Returns `true` for the last chunk of a transfer.
    pub fn is_final(&self) -> bool {
        self.is_final
    }

    /// Consumes the chunk, returning its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// Lazy iterator over the chunks of a payload. See [`split`].
///
/// A clone continues from the same position, so clone before iterating to
/// walk the payload twice.
#[derive(Debug, Clone)]
pub struct Split<'a> {
    data: &'a [u8],
    chunk_size: usize,
    offset: usize,
    sequence: u64,
    done: bool,
}

impl Iterator for Split<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.done {
            return None;
        }
        let end = self.offset.saturating_add(self.chunk_size).min(self.data.len());
        let is_final = end == self.data.len();
        let chunk = Chunk::new(self.sequence, self.data[self.offset..end].to_vec(), is_final);
        self.offset = end;
        self.sequence += 1;
        self.done = is_final;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining_chunks();
        (n, Some(n))
    }
}

impl ExactSizeIterator for Split<'_> {}

impl Split<'_> {
    fn remaining_chunks(&self) -> usize {
        if self.done {
            return 0;
        }
        let remaining = self.data.len() - self.offset;
        remaining.div_ceil(self.chunk_size).max(1)
    }
}

/// Splits `data` into chunks of at most `chunk_size` bytes.
///
/// The last chunk is marked final. An empty payload yields exactly one empty
/// final chunk. Fails with `InvalidArgument` when `chunk_size` is 0.
pub fn split(data: &[u8], chunk_size: usize) -> Result<Split<'_>, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidArgument(
            "chunk size must be at least 1".into(),
        ));
    }
    Ok(Split {
        data,
        chunk_size,
        offset: 0,
        sequence: 0,
        done: false,
    })
}

/// Concatenates chunk payloads in sequence order.
///
/// Fails with `OutOfOrder` unless sequences run 0, 1, 2, ... without gaps,
/// with `MissingFinal` if the input ends before a final chunk, and with
/// `Protocol` if anything follows the final chunk.
pub fn reassemble<I>(chunks: I) -> Result<Vec<u8>, TransferError>
where
    I: IntoIterator<Item = Chunk>,
{
    let mut out = Vec::new();
    let mut expected = 0u64;
    let mut finished = false;

    for chunk in chunks {
        if finished {
            return Err(TransferError::Protocol(format!(
                "chunk {} arrived after the final chunk",
                chunk.sequence()
            )));
        }
        if chunk.sequence() != expected {
            return Err(TransferError::OutOfOrder {
                expected,
                got: chunk.sequence(),
            });
        }
        expected += 1;
        finished = chunk.is_final();
        out.extend_from_slice(chunk.payload());
    }

    if !finished {
        return Err(TransferError::MissingFinal);
    }
    Ok(out)
}
