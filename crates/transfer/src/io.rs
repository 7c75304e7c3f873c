//! Capability traits the pumps move data through, plus the stock adapters.
//!
//! Methods return boxed futures so the traits stay object safe.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;

use crate::codec::Chunk;
use crate::error::TransferError;

/// Boxed future returned by the capability traits.
pub type IoFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransferError>> + Send + 'a>>;

/// One read from a [`ChunkSource`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    pub data: Vec<u8>,
    /// No more data follows this block.
    pub end_of_input: bool,
}

impl Block {
    pub fn data(data: Vec<u8>) -> Self {
        Self {
            data,
            end_of_input: false,
        }
    }

    pub fn last(data: Vec<u8>) -> Self {
        Self {
            data,
            end_of_input: true,
        }
    }
}

/// Byte-level producer: a file reader or a network receiver.
pub trait ChunkSource: Send {
    fn read(&mut self) -> IoFuture<'_, Block>;
}

/// Chunk-level producer. Yields `None` when the underlying stream ends.
pub trait ChunkStream: Send {
    fn next_chunk(&mut self) -> IoFuture<'_, Option<Chunk>>;
}

/// Chunk consumer: a file writer or a network sender.
pub trait ChunkSink: Send {
    fn write<'a>(&'a mut self, chunk: &'a Chunk) -> IoFuture<'a, ()>;

    /// Flushes and releases the sink after the last chunk.
    fn close(&mut self) -> IoFuture<'_, ()>;
}

/// A bidirectional chunk channel that splits into independent halves.
pub trait DuplexChannel: Send {
    type Sink: ChunkSink;
    type Stream: ChunkStream;

    fn into_split(self) -> (Self::Sink, Self::Stream);
}

impl<S: ChunkSource + ?Sized> ChunkSource for &mut S {
    fn read(&mut self) -> IoFuture<'_, Block> {
        (**self).read()
    }
}

impl<S: ChunkSource + ?Sized> ChunkSource for Box<S> {
    fn read(&mut self) -> IoFuture<'_, Block> {
        (**self).read()
    }
}

impl<S: ChunkStream + ?Sized> ChunkStream for &mut S {
    fn next_chunk(&mut self) -> IoFuture<'_, Option<Chunk>> {
        (**self).next_chunk()
    }
}

impl<S: ChunkStream + ?Sized> ChunkStream for Box<S> {
    fn next_chunk(&mut self) -> IoFuture<'_, Option<Chunk>> {
        (**self).next_chunk()
    }
}

impl<S: ChunkSink + ?Sized> ChunkSink for &mut S {
    fn write<'a>(&'a mut self, chunk: &'a Chunk) -> IoFuture<'a, ()> {
        (**self).write(chunk)
    }

    fn close(&mut self) -> IoFuture<'_, ()> {
        (**self).close()
    }
}

impl<S: ChunkSink + ?Sized> ChunkSink for Box<S> {
    fn write<'a>(&'a mut self, chunk: &'a Chunk) -> IoFuture<'a, ()> {
        (**self).write(chunk)
    }

    fn close(&mut self) -> IoFuture<'_, ()> {
        (**self).close()
    }
}

// ---------------------------------------------------------------------------
// Framer
// ---------------------------------------------------------------------------

/// Turns a [`ChunkSource`] into a [`ChunkStream`].
///
/// Sequences start at 0. One block of lookahead lets the last data block carry
/// the final flag; a source that ends with an empty read gets no extra chunk,
/// and an empty source yields a single empty final chunk.
pub struct Framer<S> {
    source: S,
    next_sequence: u64,
    pending: Option<Block>,
    done: bool,
}

impl<S: ChunkSource> Framer<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            next_sequence: 0,
            pending: None,
            done: false,
        }
    }

    pub fn into_inner(self) -> S {
        self.source
    }

    async fn read_block(&mut self) -> Result<Block, TransferError> {
        loop {
            let block = self.source.read().await?;
            if block.end_of_input || !block.data.is_empty() {
                return Ok(block);
            }
        }
    }

    fn emit(&mut self, data: Vec<u8>, is_final: bool) -> Chunk {
        let chunk = Chunk::new(self.next_sequence, data, is_final);
        self.next_sequence += 1;
        if is_final {
            self.done = true;
        }
        chunk
    }

    async fn advance(&mut self) -> Result<Option<Chunk>, TransferError> {
        if self.done {
            return Ok(None);
        }
        let current = match self.pending.take() {
            Some(block) => block,
            None => self.read_block().await?,
        };
        if current.end_of_input {
            return Ok(Some(self.emit(current.data, true)));
        }

        let next = self.read_block().await?;
        if next.end_of_input && next.data.is_empty() {
            return Ok(Some(self.emit(current.data, true)));
        }
        self.pending = Some(next);
        Ok(Some(self.emit(current.data, false)))
    }
}

impl<S: ChunkSource> ChunkStream for Framer<S> {
    fn next_chunk(&mut self) -> IoFuture<'_, Option<Chunk>> {
        Box::pin(self.advance())
    }
}

/// Streams pre-built chunks, e.g. the output of [`split`](crate::split).
pub struct IterStream<I> {
    chunks: I,
}

impl<I> IterStream<I>
where
    I: Iterator<Item = Chunk> + Send,
{
    pub fn new(chunks: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            chunks: chunks.into_iter(),
        }
    }
}

impl<I> ChunkStream for IterStream<I>
where
    I: Iterator<Item = Chunk> + Send,
{
    fn next_chunk(&mut self) -> IoFuture<'_, Option<Chunk>> {
        let next = self.chunks.next();
        Box::pin(async move { Ok(next) })
    }
}

// ---------------------------------------------------------------------------
// File adapters
// ---------------------------------------------------------------------------

/// Reads a file in blocks of at most `block_size` bytes.
///
/// The handle is owned here and closed when the source is dropped.
pub struct FileSource {
    file: File,
    block_size: usize,
}

impl FileSource {
    pub async fn open(path: &Path, block_size: usize) -> Result<Self, TransferError> {
        if block_size == 0 {
            return Err(TransferError::InvalidArgument(
                "block size must be at least 1".into(),
            ));
        }
        let file = File::open(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TransferError::NotFound(path.display().to_string())
            } else {
                TransferError::Io(e)
            }
        })?;
        Ok(Self { file, block_size })
    }

    async fn fill(&mut self) -> Result<Block, TransferError> {
        let mut buf = vec![0u8; self.block_size];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        let end_of_input = filled < self.block_size;
        Ok(Block {
            data: buf,
            end_of_input,
        })
    }
}

impl ChunkSource for FileSource {
    fn read(&mut self) -> IoFuture<'_, Block> {
        Box::pin(self.fill())
    }
}

/// Writes chunk payloads to a file in sequence order.
pub struct FileSink {
    writer: BufWriter<File>,
    path: PathBuf,
    written: u64,
}

impl FileSink {
    /// Creates (or truncates) the file at `path`.
    pub async fn create(path: &Path) -> Result<Self, TransferError> {
        let file = File::create(path).await?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    async fn write_payload(&mut self, payload: &[u8]) -> Result<(), TransferError> {
        self.writer.write_all(payload).await?;
        self.written += payload.len() as u64;
        Ok(())
    }

    async fn flush_and_sync(&mut self) -> Result<(), TransferError> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_all().await?;
        Ok(())
    }
}

impl ChunkSink for FileSink {
    fn write<'a>(&'a mut self, chunk: &'a Chunk) -> IoFuture<'a, ()> {
        Box::pin(self.write_payload(chunk.payload()))
    }

    fn close(&mut self) -> IoFuture<'_, ()> {
        Box::pin(self.flush_and_sync())
    }
}

// ---------------------------------------------------------------------------
// In-memory and channel adapters
// ---------------------------------------------------------------------------

/// Collects payloads in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    data: Vec<u8>,
    chunks: u64,
    closed: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl ChunkSink for MemorySink {
    fn write<'a>(&'a mut self, chunk: &'a Chunk) -> IoFuture<'a, ()> {
        self.data.extend_from_slice(chunk.payload());
        self.chunks += 1;
        Box::pin(async { Ok(()) })
    }

    fn close(&mut self) -> IoFuture<'_, ()> {
        self.closed = true;
        Box::pin(async { Ok(()) })
    }
}

/// Byte source fed through an mpsc channel. Ends when all senders drop.
pub struct ChannelSource {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { rx }
    }
}

impl ChunkSource for ChannelSource {
    fn read(&mut self) -> IoFuture<'_, Block> {
        Box::pin(async move {
            Ok(match self.rx.recv().await {
                Some(data) => Block::data(data),
                None => Block::last(Vec::new()),
            })
        })
    }
}

/// Chunk sink forwarding into an mpsc channel. `close` drops the sender.
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Chunk>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Chunk>) -> Self {
        Self { tx: Some(tx) }
    }
}

fn channel_closed() -> TransferError {
    TransferError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "chunk channel closed",
    ))
}

impl ChunkSink for ChannelSink {
    fn write<'a>(&'a mut self, chunk: &'a Chunk) -> IoFuture<'a, ()> {
        Box::pin(async move {
            match &self.tx {
                Some(tx) => tx.send(chunk.clone()).await.map_err(|_| channel_closed()),
                None => Err(channel_closed()),
            }
        })
    }

    fn close(&mut self) -> IoFuture<'_, ()> {
        self.tx = None;
        Box::pin(async { Ok(()) })
    }
}

/// Chunk stream reading from an mpsc channel.
pub struct ChannelStream {
    rx: mpsc::Receiver<Chunk>,
}

impl ChannelStream {
    pub fn new(rx: mpsc::Receiver<Chunk>) -> Self {
        Self { rx }
    }
}

impl ChunkStream for ChannelStream {
    fn next_chunk(&mut self) -> IoFuture<'_, Option<Chunk>> {
        Box::pin(async move { Ok(self.rx.recv().await) })
    }
}

/// In-process duplex channel: one end of a [`ChunkChannel::pair`].
pub struct ChunkChannel {
    sink: ChannelSink,
    stream: ChannelStream,
}

impl ChunkChannel {
    /// Two connected ends; chunks written on one are read on the other.
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            Self {
                sink: ChannelSink::new(a_tx),
                stream: ChannelStream::new(b_rx),
            },
            Self {
                sink: ChannelSink::new(b_tx),
                stream: ChannelStream::new(a_rx),
            },
        )
    }
}

impl DuplexChannel for ChunkChannel {
    type Sink = ChannelSink;
    type Stream = ChannelStream;

    fn into_split(self) -> (ChannelSink, ChannelStream) {
        (self.sink, self.stream)
    }
}
