//! File client: one connection per call.

use std::future::Future;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use filepump_protocol::{
    CallHeader, DownloadRequest, ListFilesRequest, ListFilesResponse, Message, MessageType, Method,
    UploadRequest, UploadResponse,
};
use filepump_transfer::{
    Chunk, ChunkSink, ChunkSource, DuplexCoordinator, DuplexReport, ErrorKind, FileSink,
    FileSource, Framer, IoFuture, StreamPump, TransferConfig, TransferContext, TransferError,
    TransferSession,
};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::TCP_CONNECT_TIMEOUT;
use crate::error::{ServiceError, check_status};
use crate::frames::{FramedConnection, Role};
use crate::wire::check_transfer_config;

/// How long to wait for the server's status after a failed write.
const STATUS_GRACE: Duration = Duration::from_secs(1);

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address (`host:port`).
    pub server_address: String,
    /// Bearer token sent with every call.
    pub token: Option<String>,
    pub transfer: TransferConfig,
    /// Upper bound for a whole call, connection included.
    pub call_timeout: Option<Duration>,
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1:50051".into(),
            token: None,
            transfer: TransferConfig::default(),
            call_timeout: None,
            connect_timeout: TCP_CONNECT_TIMEOUT,
        }
    }
}

/// Client for the file service.
#[derive(Debug, Clone)]
pub struct FileClient {
    config: ClientConfig,
}

impl FileClient {
    pub fn new(config: ClientConfig) -> Result<Self, ServiceError> {
        check_transfer_config(&config.transfer)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Lists the files the server offers.
    pub async fn list_files(&self, ctx: &TransferContext) -> Result<Vec<String>, ServiceError> {
        let ctx = self.call_context(ctx);
        bounded(&ctx, async {
            let mut conn = self.open(&ctx, Method::ListFiles).await?;
            conn.send_data(&ListFilesRequest::default()).await?;
            conn.send_close_send().await?;
            let response: ListFilesResponse = conn.recv_data().await?;
            conn.finish().await?;
            Ok::<_, ServiceError>(response.filenames)
        })
        .await
    }

    /// Downloads `filename` into `sink`, recording chunks on `session`.
    ///
    /// Returns the payload bytes received.
    pub async fn download<K: ChunkSink>(
        &self,
        ctx: &TransferContext,
        filename: &str,
        sink: K,
        session: &Mutex<TransferSession>,
    ) -> Result<u64, ServiceError> {
        let ctx = self.call_context(ctx);
        bounded(&ctx, async {
            let mut conn = self.open(&ctx, Method::Download).await?;
            conn.send_data(&DownloadRequest {
                filename: filename.to_string(),
            })
            .await?;
            conn.send_close_send().await?;

            let received = StreamPump::new(&self.config.transfer)
                .run_stream(&ctx, conn.chunk_stream(), sink, session)
                .await?;
            conn.finish().await?;
            info!(file = filename, bytes = received, "download complete");
            Ok::<_, ServiceError>(received)
        })
        .await
    }

    /// Downloads `filename` into a local file, removing it on failure.
    pub async fn download_to_file(
        &self,
        ctx: &TransferContext,
        filename: &str,
        path: &Path,
        session: &Mutex<TransferSession>,
    ) -> Result<u64, ServiceError> {
        let sink = FileSink::create(path).await?;
        let result = self.download(ctx, filename, sink, session).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(path).await;
        }
        result
    }

    /// Uploads everything `source` yields. Without a `filename` the server
    /// only counts the bytes.
    pub async fn upload<S: ChunkSource>(
        &self,
        ctx: &TransferContext,
        source: S,
        filename: Option<&str>,
        session: &Mutex<TransferSession>,
    ) -> Result<UploadResponse, ServiceError> {
        let ctx = self.call_context(ctx);
        bounded(&ctx, async {
            let mut conn = self.open(&ctx, Method::Upload).await?;
            conn.send_data(&UploadRequest {
                filename: filename.map(str::to_string),
            })
            .await?;

            let pumped = StreamPump::new(&self.config.transfer)
                .run(&ctx, source, conn.chunk_sink(), session)
                .await;
            if let Err(e) = pumped {
                return Err(explain(&mut conn, e).await);
            }
            let response: UploadResponse = conn.recv_data().await?;
            conn.finish().await?;
            info!(file = ?filename, bytes = response.size, "upload complete");
            Ok::<_, ServiceError>(response)
        })
        .await
    }

    /// Uploads a local file.
    pub async fn upload_file(
        &self,
        ctx: &TransferContext,
        path: &Path,
        filename: Option<&str>,
        session: &Mutex<TransferSession>,
    ) -> Result<UploadResponse, ServiceError> {
        let source = FileSource::open(path, self.config.transfer.chunk_size).await?;
        self.upload(ctx, source, filename, session).await
    }

    /// Uploads `source` while the server streams progress notes back into
    /// `notes`. `session` must be a duplex upload session.
    pub async fn upload_and_notify_progress<S, K>(
        &self,
        ctx: &TransferContext,
        source: S,
        filename: Option<&str>,
        notes: K,
        session: &Mutex<TransferSession>,
    ) -> Result<DuplexReport, ServiceError>
    where
        S: ChunkSource,
        K: ChunkSink,
    {
        if !session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_duplex()
        {
            return Err(TransferError::InvalidArgument(
                "upload with progress needs a duplex session".into(),
            )
            .into());
        }

        let ctx = self.call_context(ctx);
        bounded(&ctx, async {
            let mut conn = self.open(&ctx, Method::UploadAndNotifyProgress).await?;
            conn.send_data(&UploadRequest {
                filename: filename.map(str::to_string),
            })
            .await?;

            let ran = DuplexCoordinator::new(self.config.transfer.clone())
                .run_duplex(&ctx, Framer::new(source), conn.duplex(), notes, session)
                .await;
            let report = match ran {
                Ok(report) => report,
                Err(e) => return Err(explain(&mut conn, e).await),
            };
            conn.finish().await?;
            info!(file = ?filename, bytes = report.sent, "upload with progress complete");
            Ok::<_, ServiceError>(report)
        })
        .await
    }

    fn call_context(&self, ctx: &TransferContext) -> TransferContext {
        match self.config.call_timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.child(),
        }
    }

    /// Connects and sends the call header.
    async fn open(
        &self,
        ctx: &TransferContext,
        method: Method,
    ) -> Result<FramedConnection, ServiceError> {
        let address = self.config.server_address.as_str();
        let stream = tokio::select! {
            biased;
            err = ctx.done() => return Err(err.into()),
            result = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(address)) => {
                match result {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => return Err(ServiceError::Timeout),
                }
            }
        };

        let mut conn = FramedConnection::from_tcp(stream, Role::Client);
        conn.set_call_id(uuid::Uuid::new_v4().to_string());
        let header = match &self.config.token {
            Some(token) => CallHeader::with_bearer(method, token),
            None => CallHeader {
                method,
                authorization: None,
            },
        };
        let call = Message::new(conn.call_id(), MessageType::Call, Some(&header))?;
        conn.send(&call).await?;
        debug!(call = %conn.call_id(), %method, %address, "call opened");
        Ok(conn)
    }
}

/// Races a call against its context. The call goes first so a pump that
/// sees the same deadline gets to fail its session.
async fn bounded<T>(
    ctx: &TransferContext,
    call: impl Future<Output = Result<T, ServiceError>>,
) -> Result<T, ServiceError> {
    tokio::select! {
        biased;
        result = call => result,
        err = ctx.done() => Err(err.into()),
    }
}

/// A write failure usually means the server already answered; prefer its
/// status over the broken pipe.
async fn explain(conn: &mut FramedConnection, err: TransferError) -> ServiceError {
    if err.kind() != ErrorKind::Io {
        return err.into();
    }
    match tokio::time::timeout(STATUS_GRACE, conn.recv_status()).await {
        Ok(Ok(status)) => match check_status(&status) {
            Err(remote) => remote.into(),
            Ok(()) => err.into(),
        },
        _ => err.into(),
    }
}

/// Collects the progress notes a server sends during
/// [`FileClient::upload_and_notify_progress`].
#[derive(Debug, Default)]
pub struct NoteLog {
    notes: Vec<String>,
}

impl NoteLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    pub fn into_notes(self) -> Vec<String> {
        self.notes
    }
}

impl ChunkSink for NoteLog {
    fn write<'a>(&'a mut self, chunk: &'a Chunk) -> IoFuture<'a, ()> {
        if !chunk.is_empty() {
            let note = String::from_utf8_lossy(chunk.payload()).into_owned();
            debug!(%note, "server progress");
            self.notes.push(note);
        }
        Box::pin(async { Ok(()) })
    }

    fn close(&mut self) -> IoFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use filepump_protocol::StatusCode;
    use filepump_transfer::{
        Direction, MemorySink, ProgressReporter, SessionState, checksum_bytes,
    };
    use tokio::task::JoinHandle;

    use super::*;
    use crate::server::{FileServer, ServerConfig};

    const TOKEN: &str = "test-token";

    fn small_chunks() -> TransferConfig {
        TransferConfig {
            chunk_size: 1024,
            ..TransferConfig::default()
        }
    }

    async fn start_server(
        dir: &Path,
        transfer: TransferConfig,
    ) -> (Arc<FileServer>, SocketAddr, JoinHandle<()>) {
        let config = ServerConfig {
            bind_address: "127.0.0.1:0".into(),
            storage_dir: dir.to_path_buf(),
            token: Some(TOKEN.into()),
            transfer,
        };
        let server = FileServer::new(config).unwrap();
        let listener = server.bind().await.unwrap();
        let addr = server.local_addr().unwrap();
        let serving = Arc::clone(&server);
        let handle = tokio::spawn(async move { serving.serve(listener).await.unwrap() });
        (server, addr, handle)
    }

    fn client(addr: SocketAddr, token: Option<&str>) -> FileClient {
        FileClient::new(ClientConfig {
            server_address: addr.to_string(),
            token: token.map(str::to_string),
            transfer: small_chunks(),
            ..ClientConfig::default()
        })
        .unwrap()
    }

    fn session(direction: Direction) -> Mutex<TransferSession> {
        Mutex::new(TransferSession::new(direction))
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    #[tokio::test]
    async fn list_files_returns_sorted_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("zeta.bin"), b"z").unwrap();
        std::fs::write(dir.path().join("alpha.txt"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        let (server, addr, handle) = start_server(dir.path(), small_chunks()).await;

        let names = client(addr, Some(TOKEN))
            .list_files(&TransferContext::new())
            .await
            .unwrap();
        assert_eq!(names, vec!["alpha.txt", "zeta.bin"]);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn download_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let data = pattern(5000);
        std::fs::write(dir.path().join("data.bin"), &data).unwrap();
        let (server, addr, handle) = start_server(dir.path(), small_chunks()).await;

        let session = session(Direction::Download);
        let mut events = ProgressReporter::default()
            .observe(&mut session.lock().unwrap())
            .unwrap();
        let mut sink = MemorySink::new();
        let received = client(addr, Some(TOKEN))
            .download(&TransferContext::new(), "data.bin", &mut sink, &session)
            .await
            .unwrap();

        assert_eq!(received, 5000);
        assert_eq!(sink.data(), &data[..]);
        assert_eq!(sink.chunks(), 5);
        assert_eq!(session.lock().unwrap().state(), SessionState::Completed);

        let mut last = None;
        while let Some(event) = events.recv().await {
            last = Some(event);
        }
        let last = last.unwrap();
        assert_eq!(last.message, "completed");
        assert_eq!(last.bytes_transferred, 5000);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn download_to_file_writes_copy() {
        let server_dir = tempfile::tempdir().unwrap();
        let client_dir = tempfile::tempdir().unwrap();
        let data = pattern(3000);
        std::fs::write(server_dir.path().join("copy.bin"), &data).unwrap();
        let (server, addr, handle) = start_server(server_dir.path(), small_chunks()).await;

        let out = client_dir.path().join("copy.bin");
        client(addr, Some(TOKEN))
            .download_to_file(&TransferContext::new(), "copy.bin", &out, &session(Direction::Download))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), data);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn download_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr, handle) = start_server(dir.path(), small_chunks()).await;

        let session = session(Direction::Download);
        let err = client(addr, Some(TOKEN))
            .download(&TransferContext::new(), "nope.bin", MemorySink::new(), &session)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(matches!(
            err,
            ServiceError::Transfer(TransferError::NotFound(ref m)) if m == "file was not found"
        ));
        let guard = session.lock().unwrap();
        assert_eq!(guard.state(), SessionState::Failed);
        assert_eq!(guard.last_error(), Some(ErrorKind::NotFound));
        drop(guard);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn download_traversal_is_invalid_argument() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr, handle) = start_server(dir.path(), small_chunks()).await;

        let err = client(addr, Some(TOKEN))
            .download(&TransferContext::new(), "../etc/passwd", MemorySink::new(), &session(Direction::Download))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn download_empty_file_completes_with_zero_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("empty.bin"), b"").unwrap();
        let (server, addr, handle) = start_server(dir.path(), small_chunks()).await;

        let session = session(Direction::Download);
        let mut sink = MemorySink::new();
        let received = client(addr, Some(TOKEN))
            .download(&TransferContext::new(), "empty.bin", &mut sink, &session)
            .await
            .unwrap();

        assert_eq!(received, 0);
        assert_eq!(sink.chunks(), 1);
        let guard = session.lock().unwrap();
        assert_eq!(guard.state(), SessionState::Completed);
        assert_eq!(guard.bytes_transferred(), 0);
        drop(guard);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn upload_named_file_is_stored() {
        let server_dir = tempfile::tempdir().unwrap();
        let client_dir = tempfile::tempdir().unwrap();
        let data = pattern(4500);
        let local = client_dir.path().join("local.bin");
        std::fs::write(&local, &data).unwrap();
        let (server, addr, handle) = start_server(server_dir.path(), small_chunks()).await;

        let session = session(Direction::Upload);
        let response = client(addr, Some(TOKEN))
            .upload_file(&TransferContext::new(), &local, Some("stored/remote.bin"), &session)
            .await
            .unwrap();

        assert_eq!(response.size, 4500);
        assert_eq!(response.checksum, checksum_bytes(&data));
        assert_eq!(
            std::fs::read(server_dir.path().join("stored/remote.bin")).unwrap(),
            data
        );
        assert_eq!(session.lock().unwrap().state(), SessionState::Completed);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn upload_without_name_only_counts() {
        let server_dir = tempfile::tempdir().unwrap();
        let client_dir = tempfile::tempdir().unwrap();
        let local = client_dir.path().join("anon.bin");
        std::fs::write(&local, pattern(2048)).unwrap();
        let (server, addr, handle) = start_server(server_dir.path(), small_chunks()).await;

        let response = client(addr, Some(TOKEN))
            .upload_file(&TransferContext::new(), &local, None, &session(Direction::Upload))
            .await
            .unwrap();

        assert_eq!(response.size, 2048);
        assert_eq!(std::fs::read_dir(server_dir.path()).unwrap().count(), 0);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn wrong_token_is_unauthenticated() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr, handle) = start_server(dir.path(), small_chunks()).await;

        let err = client(addr, Some("wrong"))
            .list_files(&TransferContext::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthenticated);

        let err = client(addr, None)
            .list_files(&TransferContext::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthenticated);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn unauthenticated_upload_reports_status() {
        let server_dir = tempfile::tempdir().unwrap();
        let client_dir = tempfile::tempdir().unwrap();
        let local = client_dir.path().join("x.bin");
        std::fs::write(&local, pattern(3000)).unwrap();
        let (server, addr, handle) = start_server(server_dir.path(), small_chunks()).await;

        let err = client(addr, Some("wrong"))
            .upload_file(&TransferContext::new(), &local, Some("x.bin"), &session(Direction::Upload))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthenticated);
        assert!(!server_dir.path().join("x.bin").exists());

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn upload_with_progress_notes_every_chunk() {
        let server_dir = tempfile::tempdir().unwrap();
        let client_dir = tempfile::tempdir().unwrap();
        let data = pattern(3500);
        let local = client_dir.path().join("progress.bin");
        std::fs::write(&local, &data).unwrap();
        let (server, addr, handle) = start_server(server_dir.path(), small_chunks()).await;

        let client = client(addr, Some(TOKEN));
        let source = FileSource::open(&local, 1024).await.unwrap();
        let session = Mutex::new(TransferSession::duplex(Direction::Upload));
        let mut notes = NoteLog::new();
        let report = client
            .upload_and_notify_progress(
                &TransferContext::new(),
                source,
                Some("progress.bin"),
                &mut notes,
                &session,
            )
            .await
            .unwrap();

        assert_eq!(report.sent, 3500);
        assert_eq!(
            notes.notes(),
            [
                "received 1024bytes",
                "received 2048bytes",
                "received 3072bytes",
                "received 3500bytes"
            ]
        );
        assert_eq!(session.lock().unwrap().state(), SessionState::Completed);
        assert_eq!(std::fs::read(server_dir.path().join("progress.bin")).unwrap(), data);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn upload_with_progress_needs_duplex_session() {
        let client = client("127.0.0.1:1".parse().unwrap(), None);
        let err = client
            .upload_and_notify_progress(
                &TransferContext::new(),
                FileSource::open(Path::new("Cargo.toml"), 16).await.unwrap(),
                None,
                NoteLog::new(),
                &session(Direction::Upload),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn chunk_after_final_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr, handle) = start_server(dir.path(), small_chunks()).await;

        let client = client(addr, Some(TOKEN));
        let ctx = TransferContext::new();
        let mut conn = client.open(&ctx, Method::Upload).await.unwrap();
        conn.send_data(&UploadRequest::default()).await.unwrap();
        {
            let mut sink = conn.chunk_sink();
            sink.write(&Chunk::new(0, b"done".to_vec(), true)).await.unwrap();
            sink.write(&Chunk::new(1, b"extra".to_vec(), false)).await.unwrap();
        }
        conn.send_close_send().await.unwrap();

        let status = conn.recv_status().await.unwrap();
        assert_eq!(status.code, StatusCode::Protocol);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn call_timeout_is_deadline_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("slow.bin"), pattern(4096)).unwrap();
        let paced = TransferConfig {
            chunk_delay: Duration::from_millis(300),
            ..small_chunks()
        };
        let (server, addr, handle) = start_server(dir.path(), paced).await;

        let client = FileClient::new(ClientConfig {
            server_address: addr.to_string(),
            token: Some(TOKEN.into()),
            transfer: small_chunks(),
            call_timeout: Some(Duration::from_millis(150)),
            ..ClientConfig::default()
        })
        .unwrap();
        let session = session(Direction::Download);
        let err = client
            .download(&TransferContext::new(), "slow.bin", MemorySink::new(), &session)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
        assert_eq!(session.lock().unwrap().last_error(), Some(ErrorKind::DeadlineExceeded));

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_context_stops_call() {
        let ctx = TransferContext::new();
        ctx.cancel();
        let err = client("127.0.0.1:1".parse().unwrap(), None)
            .list_files(&ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn chunk_size_beyond_frame_rejected_at_construction() {
        let oversized = TransferConfig {
            chunk_size: filepump_protocol::constants::MAX_CHUNK_SIZE + 1,
            ..TransferConfig::default()
        };

        let server = FileServer::new(ServerConfig {
            transfer: oversized.clone(),
            ..ServerConfig::default()
        });
        assert!(matches!(
            server,
            Err(ServiceError::Transfer(TransferError::InvalidArgument(_)))
        ));

        let err = FileClient::new(ClientConfig {
            transfer: oversized,
            ..ClientConfig::default()
        })
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
