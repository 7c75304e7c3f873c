//! File server.
//!
//! Accepts connections until shut down and runs one call per connection in
//! its own task.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use filepump_protocol::constants::CALL_HEADER_TIMEOUT;
use filepump_protocol::{
    CallHeader, DownloadRequest, ListFilesRequest, ListFilesResponse, MessageType, Method, Status,
    UploadRequest, UploadResponse,
};
use filepump_transfer::{
    Chunk, ChunkSink, ChunkStream, DigestSink, Direction, DuplexCoordinator, FileSink, FileSource,
    IoFuture, StreamPump, TransferConfig, TransferContext, TransferError, TransferSession,
    resolve_file_name,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::DRAIN_TIMEOUT;
use crate::error::ServiceError;
use crate::frames::{FramedConnection, Role};
use crate::wire::check_transfer_config;
use crate::interceptor::{CallInfo, InterceptorChain};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on (`host:port`, port 0 = OS-assigned).
    pub bind_address: String,
    /// Directory served by `ListFiles`/`Download` and written by `Upload`.
    pub storage_dir: PathBuf,
    /// Bearer token required from clients; `None` disables auth.
    pub token: Option<String>,
    pub transfer: TransferConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:50051".into(),
            storage_dir: PathBuf::from("files"),
            token: None,
            transfer: TransferConfig::default(),
        }
    }
}

/// The file server.
pub struct FileServer {
    config: ServerConfig,
    interceptors: InterceptorChain,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl FileServer {
    /// Creates a server with the standard interceptor chain.
    pub fn new(config: ServerConfig) -> Result<Arc<Self>, ServiceError> {
        let interceptors = InterceptorChain::standard(config.token.as_deref());
        Self::with_interceptors(config, interceptors)
    }

    pub fn with_interceptors(
        config: ServerConfig,
        interceptors: InterceptorChain,
    ) -> Result<Arc<Self>, ServiceError> {
        check_transfer_config(&config.transfer)?;
        Ok(Arc::new(Self {
            config,
            interceptors,
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        }))
    }

    /// Returns the local address once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .local_addr
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Stops accepting and cancels in-flight calls.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServiceError> {
        let listener = TcpListener::bind(&self.config.bind_address).await?;
        let local_addr = listener.local_addr()?;
        *self
            .local_addr
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(local_addr);
        info!(%local_addr, storage = %self.config.storage_dir.display(), "file server listening");
        Ok(listener)
    }

    /// Binds and serves until [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>) -> Result<(), ServiceError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serves connections from `listener` until [`shutdown`](Self::shutdown).
    ///
    /// Waits for in-flight calls (which observe the shutdown) before returning.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), ServiceError> {
        let mut calls = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("file server shutting down");
                    break;
                }
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        debug!(%peer, "connection accepted");
                        let server = Arc::clone(self);
                        calls.spawn(async move { server.handle_connection(stream, peer).await });
                    }
                    Err(e) => warn!("accept error: {e}"),
                },
                Some(_) = calls.join_next(), if !calls.is_empty() => {}
            }
        }
        while calls.join_next().await.is_some() {}
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let mut conn = FramedConnection::from_tcp(stream, Role::Server);
        let header = match self.read_call_header(&mut conn).await {
            Ok(header) => header,
            Err(e) => {
                warn!(%peer, "rejected connection: {e}");
                if let Err(send_err) = conn.send_status(e.to_status()).await {
                    debug!(%peer, "could not send status: {send_err}");
                }
                return;
            }
        };

        let call = CallInfo {
            call_id: conn.call_id().to_string(),
            method: header.method,
            peer,
        };
        let started = Instant::now();
        let result = match self.interceptors.before(&call, &header) {
            Ok(()) => {
                let ctx = TransferContext::from_token(self.cancel.child_token());
                self.dispatch(&ctx, header.method, &mut conn).await
            }
            Err(e) => Err(e.into()),
        };

        let status = match &result {
            Ok(()) => Status::ok(),
            Err(e) => e.to_status(),
        };
        if let Err(e) = conn.send_status(status.clone()).await {
            debug!(call = %call.call_id, "could not send status: {e}");
        }
        if !status.is_ok() {
            conn.drain(DRAIN_TIMEOUT).await;
        }
        self.interceptors.after(&call, &status, started.elapsed());
    }

    async fn read_call_header(
        &self,
        conn: &mut FramedConnection,
    ) -> Result<CallHeader, ServiceError> {
        let message = tokio::time::timeout(CALL_HEADER_TIMEOUT, conn.recv())
            .await
            .map_err(|_| ServiceError::Timeout)??
            .ok_or_else(|| ServiceError::Protocol("connection closed before call".into()))?;
        if message.msg_type != MessageType::Call {
            return Err(ServiceError::Protocol(format!(
                "expected call frame, got {:?}",
                message.msg_type
            )));
        }
        conn.set_call_id(message.id.clone());
        message
            .parse_payload()?
            .ok_or_else(|| ServiceError::Protocol("call frame without header".into()))
    }

    async fn dispatch(
        &self,
        ctx: &TransferContext,
        method: Method,
        conn: &mut FramedConnection,
    ) -> Result<(), ServiceError> {
        match method {
            Method::ListFiles => self.list_files(conn).await,
            Method::Download => self.download(ctx, conn).await,
            Method::Upload => self.upload(ctx, conn).await,
            Method::UploadAndNotifyProgress => self.upload_and_notify_progress(ctx, conn).await,
        }
    }

    async fn list_files(&self, conn: &mut FramedConnection) -> Result<(), ServiceError> {
        let _request: ListFilesRequest = conn.recv_data().await?;
        conn.expect_close_send().await?;

        let filenames = list_regular_files(&self.config.storage_dir).await?;
        debug!(count = filenames.len(), "listing files");
        conn.send_data(&ListFilesResponse { filenames }).await
    }

    async fn download(
        &self,
        ctx: &TransferContext,
        conn: &mut FramedConnection,
    ) -> Result<(), ServiceError> {
        let request: DownloadRequest = conn.recv_data().await?;
        conn.expect_close_send().await?;

        let path = resolve_file_name(&self.config.storage_dir, &request.filename)?;
        let is_file = tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            return Err(TransferError::NotFound("file was not found".into()).into());
        }

        let source = FileSource::open(&path, self.config.transfer.chunk_size).await?;
        let session = Mutex::new(TransferSession::new(Direction::Upload));
        let sent = StreamPump::new(&self.config.transfer)
            .run(ctx, source, conn.chunk_sink(), &session)
            .await?;
        info!(file = %request.filename, bytes = sent, "download served");
        Ok(())
    }

    async fn upload(
        &self,
        ctx: &TransferContext,
        conn: &mut FramedConnection,
    ) -> Result<(), ServiceError> {
        let request: UploadRequest = conn.recv_data().await?;
        let target = UploadTarget::open(&self.config.storage_dir, request.filename.as_deref()).await?;
        let mut sink = DigestSink::new(target);

        let session = Mutex::new(TransferSession::new(Direction::Download));
        let pumped = StreamPump::new(&self.config.transfer)
            .run_stream(ctx, conn.chunk_stream(), &mut sink, &session)
            .await;
        let result = match pumped {
            Ok(_) => conn.expect_close_send().await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            sink.into_inner().discard().await;
            return Err(e);
        }

        let response = UploadResponse {
            size: sink.bytes(),
            checksum: sink.checksum(),
        };
        info!(file = ?request.filename, bytes = response.size, "upload received");
        conn.send_data(&response).await
    }

    async fn upload_and_notify_progress(
        &self,
        ctx: &TransferContext,
        conn: &mut FramedConnection,
    ) -> Result<(), ServiceError> {
        let request: UploadRequest = conn.recv_data().await?;
        let target = UploadTarget::open(&self.config.storage_dir, request.filename.as_deref()).await?;

        let (notes_tx, notes_rx) = mpsc::channel(self.config.transfer.progress_watermark);
        let mut sink = NotifyingSink {
            inner: target,
            received: 0,
            notes: Some(notes_tx),
        };
        let session = Mutex::new(TransferSession::duplex(Direction::Download));
        let coordinator = DuplexCoordinator::new(self.config.transfer.clone());
        let ran = coordinator
            .run_duplex(ctx, NoteStream::new(notes_rx), conn.duplex(), &mut sink, &session)
            .await;
        let result = match ran {
            Ok(_) => conn.expect_close_send().await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            sink.inner.discard().await;
            return Err(e);
        }
        info!(file = ?request.filename, bytes = sink.received, "upload with progress received");
        Ok(())
    }
}

/// Names of the regular files directly inside `dir`, sorted.
async fn list_regular_files(dir: &Path) -> Result<Vec<String>, ServiceError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

// ---------------------------------------------------------------------------
// Upload targets
// ---------------------------------------------------------------------------

/// Where uploaded bytes go: a file in the storage directory, or nowhere.
enum UploadTarget {
    File(FileSink),
    Discard,
}

impl UploadTarget {
    async fn open(root: &Path, filename: Option<&str>) -> Result<Self, ServiceError> {
        let Some(name) = filename else {
            return Ok(UploadTarget::Discard);
        };
        let path = resolve_file_name(root, name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(UploadTarget::File(FileSink::create(&path).await?))
    }

    /// Removes a partially written file.
    async fn discard(self) {
        if let UploadTarget::File(sink) = self {
            let path = sink.path().to_path_buf();
            drop(sink);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                debug!(path = %path.display(), "could not remove partial upload: {e}");
            }
        }
    }
}

impl ChunkSink for UploadTarget {
    fn write<'a>(&'a mut self, chunk: &'a Chunk) -> IoFuture<'a, ()> {
        match self {
            UploadTarget::File(sink) => sink.write(chunk),
            UploadTarget::Discard => Box::pin(async { Ok(()) }),
        }
    }

    fn close(&mut self) -> IoFuture<'_, ()> {
        match self {
            UploadTarget::File(sink) => sink.close(),
            UploadTarget::Discard => Box::pin(async { Ok(()) }),
        }
    }
}

/// Forwards chunks to the target and queues one progress note per chunk.
///
/// Closing it drops the note sender, which ends the [`NoteStream`].
struct NotifyingSink {
    inner: UploadTarget,
    received: u64,
    notes: Option<mpsc::Sender<Vec<u8>>>,
}

impl NotifyingSink {
    async fn forward(&mut self, chunk: &Chunk) -> Result<(), TransferError> {
        self.inner.write(chunk).await?;
        self.received += chunk.len() as u64;
        if let Some(notes) = &self.notes {
            let note = format!("received {}bytes", self.received);
            notes.send(note.into_bytes()).await.map_err(|_| {
                TransferError::Protocol("progress stream closed early".into())
            })?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), TransferError> {
        self.notes = None;
        self.inner.close().await
    }
}

impl ChunkSink for NotifyingSink {
    fn write<'a>(&'a mut self, chunk: &'a Chunk) -> IoFuture<'a, ()> {
        Box::pin(self.forward(chunk))
    }

    fn close(&mut self) -> IoFuture<'_, ()> {
        Box::pin(self.finish())
    }
}

/// Frames each progress note as its own chunk, then an empty final chunk
/// once the notes run out.
struct NoteStream {
    notes: mpsc::Receiver<Vec<u8>>,
    next_sequence: u64,
    done: bool,
}

impl NoteStream {
    fn new(notes: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            notes,
            next_sequence: 0,
            done: false,
        }
    }

    async fn next_note(&mut self) -> Result<Option<Chunk>, TransferError> {
        if self.done {
            return Ok(None);
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        match self.notes.recv().await {
            Some(note) => Ok(Some(Chunk::new(sequence, note, false))),
            None => {
                self.done = true;
                Ok(Some(Chunk::new(sequence, Vec::new(), true)))
            }
        }
    }
}

impl ChunkStream for NoteStream {
    fn next_chunk(&mut self) -> IoFuture<'_, Option<Chunk>> {
        Box::pin(self.next_note())
    }
}
