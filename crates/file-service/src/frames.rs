//! A framed connection and its chunk-level adapters.
//!
//! [`FrameSink`] and [`FrameStream`] plug the connection into the transfer
//! core's [`ChunkSink`] / [`ChunkStream`] traits, so pumps drive the network
//! exactly like they drive files.

use std::time::Duration;

use filepump_protocol::{ChunkFrame, Message, MessageType, Status};
use filepump_transfer::{Chunk, ChunkSink, ChunkStream, DuplexChannel, IoFuture, TransferError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, trace};

use crate::TCP_BUFFER_SIZE;
use crate::error::{ServiceError, check_status};
use crate::wire::{read_frame, write_frame};

/// Which end of the call this connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// One call's connection: frames tagged with the call id.
pub struct FramedConnection<R = OwnedReadHalf, W = OwnedWriteHalf> {
    reader: BufReader<R>,
    writer: BufWriter<W>,
    role: Role,
    call_id: String,
    peer_closed_send: bool,
    status: Option<Status>,
}

impl FramedConnection {
    pub fn from_tcp(stream: TcpStream, role: Role) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("could not set TCP_NODELAY: {e}");
        }
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer, role)
    }
}

impl<R, W> FramedConnection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, role: Role) -> Self {
        Self {
            reader: BufReader::with_capacity(TCP_BUFFER_SIZE, reader),
            writer: BufWriter::with_capacity(TCP_BUFFER_SIZE, writer),
            role,
            call_id: String::new(),
            peer_closed_send: false,
            status: None,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn set_call_id(&mut self, call_id: impl Into<String>) {
        self.call_id = call_id.into();
    }

    /// Whether the peer has sent `close_send`.
    pub fn peer_closed_send(&self) -> bool {
        self.peer_closed_send
    }

    /// The status received from the server, once read.
    pub fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), ServiceError> {
        write_frame(&mut self.writer, message).await
    }

    pub async fn send_data<T: Serialize>(&mut self, payload: &T) -> Result<(), ServiceError> {
        let message = Message::data(self.call_id.clone(), payload)?;
        self.send(&message).await
    }

    pub async fn send_close_send(&mut self) -> Result<(), ServiceError> {
        self.send(&Message::close_send(self.call_id.clone())).await
    }

    pub async fn send_status(&mut self, status: Status) -> Result<(), ServiceError> {
        self.send(&Message::status(self.call_id.clone(), status)).await
    }

    /// Reads the next frame, remembering `close_send` and `status` frames.
    pub async fn recv(&mut self) -> Result<Option<Message>, ServiceError> {
        let message = read_frame(&mut self.reader).await?;
        if let Some(message) = &message {
            trace!(call = %self.call_id, kind = ?message.msg_type, "frame received");
            match message.msg_type {
                MessageType::CloseSend => self.peer_closed_send = true,
                MessageType::Status => self.status = message.status.clone(),
                _ => {}
            }
        }
        Ok(message)
    }

    /// Reads one `data` frame and parses its payload.
    ///
    /// A non-ok status in its place is returned as the matching error.
    pub async fn recv_data<T: DeserializeOwned>(&mut self) -> Result<T, ServiceError> {
        let message = self
            .recv()
            .await?
            .ok_or_else(|| ServiceError::Protocol("connection closed before payload".into()))?;
        match message.msg_type {
            MessageType::Data => message
                .parse_payload()?
                .ok_or_else(|| ServiceError::Protocol("data frame without payload".into())),
            MessageType::Status => {
                let status = message.status.unwrap_or_else(Status::ok);
                check_status(&status)?;
                Err(ServiceError::Protocol("call ended before payload".into()))
            }
            other => Err(ServiceError::Protocol(format!(
                "expected data frame, got {other:?}"
            ))),
        }
    }

    /// Expects the client's `close_send`. A `data` frame here is a chunk sent
    /// after the final one.
    pub async fn expect_close_send(&mut self) -> Result<(), ServiceError> {
        if self.peer_closed_send {
            return Ok(());
        }
        match self.recv().await? {
            Some(m) if m.msg_type == MessageType::CloseSend => Ok(()),
            Some(m) if m.msg_type == MessageType::Data => Err(TransferError::Protocol(
                "chunk received after the final chunk".into(),
            )
            .into()),
            Some(m) => Err(ServiceError::Protocol(format!(
                "expected close_send, got {:?}",
                m.msg_type
            ))),
            None => Err(ServiceError::Protocol(
                "connection closed before close_send".into(),
            )),
        }
    }

    /// Reads the call's terminating status.
    ///
    /// Any `data` frame before it is a chunk after the final one.
    pub async fn recv_status(&mut self) -> Result<Status, ServiceError> {
        if let Some(status) = &self.status {
            return Ok(status.clone());
        }
        match self.recv().await? {
            Some(m) if m.msg_type == MessageType::Status => {
                Ok(m.status.unwrap_or_else(Status::ok))
            }
            Some(m) if m.msg_type == MessageType::Data => Err(TransferError::Protocol(
                "chunk received after the final chunk".into(),
            )
            .into()),
            Some(m) => Err(ServiceError::Protocol(format!(
                "expected status, got {:?}",
                m.msg_type
            ))),
            None => Err(ServiceError::Protocol(
                "connection closed before status".into(),
            )),
        }
    }

    /// Reads the status and turns a non-ok code into an error.
    pub async fn finish(&mut self) -> Result<(), ServiceError> {
        let status = self.recv_status().await?;
        check_status(&status)?;
        Ok(())
    }

    /// Discards frames until `close_send`, end of stream, an error, or
    /// `limit` elapses. Lets a rejected client finish writing before the
    /// connection closes.
    pub async fn drain(&mut self, limit: Duration) {
        let drain = async {
            while !self.peer_closed_send {
                match self.recv().await {
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => break,
                }
            }
        };
        let _ = tokio::time::timeout(limit, drain).await;
    }

    /// A sink writing chunks as `data` frames.
    pub fn chunk_sink(&mut self) -> FrameSink<'_, W> {
        FrameSink {
            writer: &mut self.writer,
            call_id: &self.call_id,
            role: self.role,
        }
    }

    /// A stream reading chunks from `data` frames.
    pub fn chunk_stream(&mut self) -> FrameStream<'_, R> {
        FrameStream {
            reader: &mut self.reader,
            call_id: &self.call_id,
            peer_closed_send: &mut self.peer_closed_send,
            status: &mut self.status,
        }
    }

    /// Both halves at once, for duplex calls.
    pub fn duplex(&mut self) -> FrameDuplex<'_, R, W> {
        FrameDuplex {
            sink: FrameSink {
                writer: &mut self.writer,
                call_id: &self.call_id,
                role: self.role,
            },
            stream: FrameStream {
                reader: &mut self.reader,
                call_id: &self.call_id,
                peer_closed_send: &mut self.peer_closed_send,
                status: &mut self.status,
            },
        }
    }
}

/// Writing half of a [`FramedConnection`].
///
/// On the client, `close` sends `close_send`.
pub struct FrameSink<'a, W> {
    writer: &'a mut BufWriter<W>,
    call_id: &'a str,
    role: Role,
}

impl<W: AsyncWrite + Unpin + Send> FrameSink<'_, W> {
    async fn send_chunk(&mut self, chunk: &Chunk) -> Result<(), TransferError> {
        let frame = ChunkFrame {
            sequence: chunk.sequence(),
            data: chunk.payload().to_vec(),
            is_final: chunk.is_final(),
        };
        let message = Message::data(self.call_id, &frame)
            .map_err(|e| ServiceError::from(e).into_transfer())?;
        write_frame(&mut *self.writer, &message)
            .await
            .map_err(ServiceError::into_transfer)
    }

    async fn half_close(&mut self) -> Result<(), TransferError> {
        if self.role == Role::Client {
            write_frame(&mut *self.writer, &Message::close_send(self.call_id))
                .await
                .map_err(ServiceError::into_transfer)?;
        }
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin + Send> ChunkSink for FrameSink<'_, W> {
    fn write<'a>(&'a mut self, chunk: &'a Chunk) -> IoFuture<'a, ()> {
        Box::pin(self.send_chunk(chunk))
    }

    fn close(&mut self) -> IoFuture<'_, ()> {
        Box::pin(self.half_close())
    }
}

/// Reading half of a [`FramedConnection`].
///
/// Ends at `close_send` or an ok status; a non-ok status ends it with the
/// matching error.
pub struct FrameStream<'a, R> {
    reader: &'a mut BufReader<R>,
    call_id: &'a str,
    peer_closed_send: &'a mut bool,
    status: &'a mut Option<Status>,
}

impl<R: AsyncRead + Unpin + Send> FrameStream<'_, R> {
    async fn next_frame_chunk(&mut self) -> Result<Option<Chunk>, TransferError> {
        if *self.peer_closed_send || self.status.is_some() {
            return Ok(None);
        }
        let Some(message) = read_frame(&mut *self.reader)
            .await
            .map_err(ServiceError::into_transfer)?
        else {
            return Ok(None);
        };
        match message.msg_type {
            MessageType::Data => {
                let frame: ChunkFrame = message
                    .parse_payload()
                    .map_err(|e| ServiceError::from(e).into_transfer())?
                    .ok_or_else(|| TransferError::Protocol("data frame without payload".into()))?;
                trace!(call = %self.call_id, sequence = frame.sequence, "chunk frame");
                Ok(Some(Chunk::new(frame.sequence, frame.data, frame.is_final)))
            }
            MessageType::CloseSend => {
                *self.peer_closed_send = true;
                Ok(None)
            }
            MessageType::Status => {
                let status = message.status.unwrap_or_else(Status::ok);
                let checked = check_status(&status);
                *self.status = Some(status);
                checked.map(|()| None)
            }
            MessageType::Call => Err(TransferError::Protocol(
                "unexpected call frame mid-stream".into(),
            )),
        }
    }
}

impl<R: AsyncRead + Unpin + Send> ChunkStream for FrameStream<'_, R> {
    fn next_chunk(&mut self) -> IoFuture<'_, Option<Chunk>> {
        Box::pin(self.next_frame_chunk())
    }
}

/// Both halves of a connection, borrowed for one duplex run.
pub struct FrameDuplex<'a, R, W> {
    sink: FrameSink<'a, W>,
    stream: FrameStream<'a, R>,
}

impl<'a, R, W> DuplexChannel for FrameDuplex<'a, R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    type Sink = FrameSink<'a, W>;
    type Stream = FrameStream<'a, R>;

    fn into_split(self) -> (FrameSink<'a, W>, FrameStream<'a, R>) {
        (self.sink, self.stream)
    }
}
