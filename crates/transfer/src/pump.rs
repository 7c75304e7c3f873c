//! Moves chunks from a stream into a sink, recording each on the session.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, trace};

use crate::TransferConfig;
use crate::codec::Chunk;
use crate::context::TransferContext;
use crate::error::TransferError;
use crate::io::{ChunkSink, ChunkSource, ChunkStream, Framer};
use crate::session::{Lane, TransferSession};

pub(crate) fn lock_session(session: &Mutex<TransferSession>) -> MutexGuard<'_, TransferSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One-direction transfer loop.
///
/// Every suspension point (read, pacing delay, write, close) races the
/// context, so a cancel or an expired deadline is observed within one chunk.
#[derive(Debug, Clone, Default)]
pub struct StreamPump {
    chunk_delay: Duration,
    lane: Option<Lane>,
}

impl StreamPump {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            chunk_delay: config.chunk_delay,
            lane: None,
        }
    }

    /// Records chunks on `lane` instead of the session's data lane.
    pub fn on_lane(mut self, lane: Lane) -> Self {
        self.lane = Some(lane);
        self
    }

    /// Pumps a byte-level source, framing it into chunks on the way.
    pub async fn run<S, K>(
        &self,
        ctx: &TransferContext,
        source: S,
        sink: K,
        session: &Mutex<TransferSession>,
    ) -> Result<u64, TransferError>
    where
        S: ChunkSource,
        K: ChunkSink,
    {
        self.run_stream(ctx, Framer::new(source), sink, session).await
    }

    /// Pumps chunks until the final one has been written, returning the
    /// payload bytes moved.
    ///
    /// On any error the session is failed (or cancelled) with it and the
    /// error is returned. Chunks following the final one are left unread.
    pub async fn run_stream<S, K>(
        &self,
        ctx: &TransferContext,
        mut stream: S,
        mut sink: K,
        session: &Mutex<TransferSession>,
    ) -> Result<u64, TransferError>
    where
        S: ChunkStream,
        K: ChunkSink,
    {
        match self.pump(ctx, &mut stream, &mut sink, session).await {
            Ok(moved) => Ok(moved),
            Err(err) => {
                let mut guard = lock_session(session);
                debug!(session = %guard.id(), error = %err, "pump stopped");
                guard.fail(&err);
                Err(err)
            }
        }
    }

    async fn pump<S, K>(
        &self,
        ctx: &TransferContext,
        stream: &mut S,
        sink: &mut K,
        session: &Mutex<TransferSession>,
    ) -> Result<u64, TransferError>
    where
        S: ChunkStream,
        K: ChunkSink,
    {
        let mut moved = 0u64;
        let mut pushed = 0u64;
        loop {
            ctx.check()?;
            let chunk = tokio::select! {
                biased;
                err = ctx.done() => return Err(err),
                next = stream.next_chunk() => next?.ok_or(TransferError::MissingFinal)?,
            };

            if pushed > 0 {
                self.pace(ctx).await?;
            }
            self.record(&chunk, session)?;

            tokio::select! {
                biased;
                err = ctx.done() => return Err(err),
                written = sink.write(&chunk) => written?,
            }
            moved += chunk.len() as u64;
            pushed += 1;

            if chunk.is_final() {
                break;
            }
        }

        tokio::select! {
            biased;
            err = ctx.done() => return Err(err),
            closed = sink.close() => closed?,
        }

        // The lane only finishes once the final chunk is written and the
        // sink closed, so a late write or close failure still fails it.
        let mut guard = lock_session(session);
        let lane = self.lane_of(&guard);
        guard.finish_lane(lane)?;
        trace!(bytes = moved, "pump finished");
        Ok(moved)
    }

    fn lane_of(&self, session: &TransferSession) -> Lane {
        self.lane.unwrap_or(session.direction().data_lane())
    }

    fn record(&self, chunk: &Chunk, session: &Mutex<TransferSession>) -> Result<(), TransferError> {
        let mut guard = lock_session(session);
        let lane = self.lane_of(&guard);
        trace!(
            session = %guard.id(),
            ?lane,
            sequence = chunk.sequence(),
            len = chunk.len(),
            is_final = chunk.is_final(),
            "pumping chunk"
        );
        guard.admit(lane, chunk)
    }

    async fn pace(&self, ctx: &TransferContext) -> Result<(), TransferError> {
        if self.chunk_delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            biased;
            err = ctx.done() => Err(err),
            _ = tokio::time::sleep(self.chunk_delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::split;
    use crate::error::ErrorKind;
    use crate::io::{
        Block, ChannelSource, FileSink, FileSource, IoFuture, IterStream, MemorySink,
    };
    use crate::progress::ProgressReporter;
    use crate::session::{Direction, SessionState};
    use tokio::sync::mpsc;

    fn session(direction: Direction) -> Mutex<TransferSession> {
        Mutex::new(TransferSession::new(direction))
    }

    struct FailingSink;

    impl ChunkSink for FailingSink {
        fn write<'a>(&'a mut self, _chunk: &'a Chunk) -> IoFuture<'a, ()> {
            Box::pin(async {
                Err(TransferError::Io(std::io::Error::other("disk full")))
            })
        }

        fn close(&mut self) -> IoFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
    }

    /// Accepts writes but fails to flush on close.
    struct FailingCloseSink;

    impl ChunkSink for FailingCloseSink {
        fn write<'a>(&'a mut self, _chunk: &'a Chunk) -> IoFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }

        fn close(&mut self) -> IoFuture<'_, ()> {
            Box::pin(async {
                Err(TransferError::Io(std::io::Error::other("sync failed")))
            })
        }
    }

    struct FailingSource;

    impl ChunkSource for FailingSource {
        fn read(&mut self) -> IoFuture<'_, Block> {
            Box::pin(async {
                Err(TransferError::Io(std::io::Error::other("read failed")))
            })
        }
    }

    #[tokio::test]
    async fn pumps_file_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.bin");
        let output = dir.path().join("out.bin");
        let data: Vec<u8> = (0..100_000u32).map(|i| (i * 7 % 256) as u8).collect();
        std::fs::write(&input, &data).unwrap();

        let session = session(Direction::Upload);
        let events = ProgressReporter::default()
            .observe(&mut lock_session(&session))
            .unwrap();

        let pump = StreamPump::new(&TransferConfig::default());
        let source = FileSource::open(&input, 32 * 1024).await.unwrap();
        let sink = FileSink::create(&output).await.unwrap();
        let moved = pump
            .run(&TransferContext::new(), source, sink, &session)
            .await
            .unwrap();

        assert_eq!(moved, data.len() as u64);
        assert_eq!(std::fs::read(&output).unwrap(), data);
        let guard = lock_session(&session);
        assert_eq!(guard.state(), SessionState::Completed);
        assert_eq!(guard.bytes_transferred(), data.len() as u64);
        drop(guard);

        let mut events = events;
        let mut last = 0;
        while let Some(event) = events.recv().await {
            assert!(event.bytes_transferred >= last);
            last = event.bytes_transferred;
        }
        assert_eq!(last, data.len() as u64);
    }

    #[tokio::test]
    async fn empty_input_completes_with_zero_bytes() {
        let session = session(Direction::Upload);
        let (tx, rx) = mpsc::channel::<Vec<u8>>(1);
        drop(tx);

        let mut sink = MemorySink::new();
        let moved = StreamPump::default()
            .run(&TransferContext::new(), ChannelSource::new(rx), &mut sink, &session)
            .await
            .unwrap();

        assert_eq!(moved, 0);
        assert_eq!(sink.chunks(), 1);
        assert!(sink.is_closed());
        let guard = lock_session(&session);
        assert_eq!(guard.state(), SessionState::Completed);
        assert_eq!(guard.bytes_transferred(), 0);
    }

    #[tokio::test]
    async fn write_error_fails_session() {
        let session = session(Direction::Upload);
        let chunks = split(b"abcdef", 2).unwrap();
        let err = StreamPump::default()
            .run_stream(&TransferContext::new(), IterStream::new(chunks), FailingSink, &session)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Io);
        let guard = lock_session(&session);
        assert_eq!(guard.state(), SessionState::Failed);
        assert_eq!(guard.last_error(), Some(ErrorKind::Io));
    }

    #[tokio::test]
    async fn failed_final_write_is_not_completed() {
        let mut session = TransferSession::new(Direction::Upload);
        let mut events = ProgressReporter::default().observe(&mut session).unwrap();
        let session = Mutex::new(session);

        let err = StreamPump::default()
            .run_stream(
                &TransferContext::new(),
                IterStream::new(split(b"abc", 8).unwrap()),
                FailingSink,
                &session,
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Io);
        let guard = lock_session(&session);
        assert_eq!(guard.state(), SessionState::Failed);
        assert_eq!(guard.last_error(), Some(ErrorKind::Io));
        drop(guard);

        let mut messages = Vec::new();
        while let Some(event) = events.recv().await {
            messages.push(event.message);
        }
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], "sent 3 bytes");
        assert!(messages[1].starts_with("failed: "));
    }

    #[tokio::test]
    async fn failed_close_is_not_completed() {
        let session = session(Direction::Download);
        let err = StreamPump::default()
            .run_stream(
                &TransferContext::new(),
                IterStream::new(split(b"abcdef", 4).unwrap()),
                FailingCloseSink,
                &session,
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Io);
        let guard = lock_session(&session);
        assert_eq!(guard.state(), SessionState::Failed);
        assert_eq!(guard.last_error(), Some(ErrorKind::Io));
        assert_eq!(guard.bytes_transferred(), 6);
    }

    #[tokio::test]
    async fn read_error_fails_session() {
        let session = session(Direction::Upload);
        let err = StreamPump::default()
            .run(&TransferContext::new(), FailingSource, MemorySink::new(), &session)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(lock_session(&session).state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn stream_without_final_is_protocol_error() {
        let session = session(Direction::Download);
        let chunks = vec![
            Chunk::new(0, b"a".to_vec(), false),
            Chunk::new(1, b"b".to_vec(), false),
        ];
        let err = StreamPump::default()
            .run_stream(&TransferContext::new(), IterStream::new(chunks), MemorySink::new(), &session)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::MissingFinal));
        assert_eq!(lock_session(&session).last_error(), Some(ErrorKind::Protocol));
    }

    #[tokio::test]
    async fn out_of_order_stream_stops_pump() {
        let session = session(Direction::Download);
        let chunks = vec![
            Chunk::new(0, b"a".to_vec(), false),
            Chunk::new(2, b"c".to_vec(), true),
        ];
        let mut sink = MemorySink::new();
        let err = StreamPump::default()
            .run_stream(&TransferContext::new(), IterStream::new(chunks), &mut sink, &session)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::OutOfOrder { expected: 1, got: 2 }));
        assert_eq!(sink.data(), b"a");
        assert!(!sink.is_closed());
    }

    #[tokio::test]
    async fn trailing_chunks_are_not_consumed() {
        let session = session(Direction::Download);
        let chunks = vec![
            Chunk::new(0, b"a".to_vec(), true),
            Chunk::new(1, b"b".to_vec(), false),
        ];
        let mut stream = IterStream::new(chunks);
        StreamPump::default()
            .run_stream(&TransferContext::new(), &mut stream, MemorySink::new(), &session)
            .await
            .unwrap();
        let trailing = stream.next_chunk().await.unwrap().unwrap();
        assert_eq!(trailing.sequence(), 1);
    }

    #[tokio::test]
    async fn cancel_mid_read_cancels_session() {
        let session = session(Direction::Upload);
        let (tx, rx) = mpsc::channel::<Vec<u8>>(4);
        tx.send(b"first".to_vec()).await.unwrap();

        let ctx = TransferContext::new();
        let canceller = ctx.clone();
        let mut sink = MemorySink::new();
        let pump = StreamPump::default();
        let run = pump.run(&ctx, ChannelSource::new(rx), &mut sink, &session);
        let cancel = async {
            tokio::task::yield_now().await;
            canceller.cancel();
        };
        let (result, ()) = tokio::join!(run, cancel);

        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert_eq!(lock_session(&session).state(), SessionState::Cancelled);
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fails_session_during_pacing() {
        let config = TransferConfig {
            chunk_delay: Duration::from_secs(1),
            ..TransferConfig::default()
        };
        let session = session(Direction::Upload);
        let data = [0u8; 10];
        let chunks = split(&data, 1).unwrap();
        let ctx = TransferContext::new().with_timeout(Duration::from_millis(2500));

        let err = StreamPump::new(&config)
            .run_stream(&ctx, IterStream::new(chunks), MemorySink::new(), &session)
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::DeadlineExceeded));
        let guard = lock_session(&session);
        assert_eq!(guard.state(), SessionState::Failed);
        assert_eq!(guard.last_error(), Some(ErrorKind::DeadlineExceeded));
        assert_eq!(guard.bytes_transferred(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_delays_between_chunks() {
        let config = TransferConfig {
            chunk_delay: Duration::from_millis(100),
            ..TransferConfig::default()
        };
        let session = session(Direction::Upload);
        let start = tokio::time::Instant::now();
        StreamPump::new(&config)
            .run_stream(
                &TransferContext::new(),
                IterStream::new(split(b"abcd", 1).unwrap()),
                MemorySink::new(),
                &session,
            )
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(400));
    }
}
