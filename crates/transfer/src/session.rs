//! Per-transfer state machine.
//!
//! ```text
//! Idle ──► Active ──► Completed
//!   │        ├──────► Failed
//!   │        └──────► Cancelled
//!   └──────────────► Failed | Cancelled
//! ```
//!
//! Terminal states are absorbing. The session holds no lock: every mutating
//! call takes `&mut self`, and the coordinator that owns the session
//! serializes access when two pumps share it.

use std::fmt;

use tracing::{debug, trace};

use crate::codec::Chunk;
use crate::error::{ErrorKind, TransferError};
use crate::progress::{ProgressEvent, ProgressPublisher};

/// Opaque session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Which way the file data flows, seen from the endpoint owning the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// This endpoint sends the file (outbound lane carries data).
    Upload,
    /// This endpoint receives the file (inbound lane carries data).
    Download,
}

impl Direction {
    /// The lane carrying file data for this direction.
    pub fn data_lane(self) -> Lane {
        match self {
            Direction::Upload => Lane::Outbound,
            Direction::Download => Lane::Inbound,
        }
    }

    fn verb(self) -> &'static str {
        match self {
            Direction::Upload => "sent",
            Direction::Download => "received",
        }
    }
}

/// One direction of a session's byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Outbound,
    Inbound,
}

/// Lifecycle state of a [`TransferSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    /// Returns `true` for `Completed`, `Failed` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Idle => "idle",
            SessionState::Active => "active",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LaneProgress {
    expected_next: u64,
    bytes: u64,
    /// The final chunk has been counted.
    final_seen: bool,
    /// The final chunk has been delivered; the lane is done.
    finished: bool,
}

/// Point-in-time copy of a session's counters and state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub direction: Direction,
    pub state: SessionState,
    pub bytes_transferred: u64,
    pub outbound_bytes: u64,
    pub inbound_bytes: u64,
    pub last_error: Option<ErrorKind>,
}

/// The stateful record of one logical file transfer.
#[derive(Debug)]
pub struct TransferSession {
    id: SessionId,
    direction: Direction,
    state: SessionState,
    last_error: Option<ErrorKind>,
    failure: Option<String>,
    outbound: LaneProgress,
    inbound: LaneProgress,
    duplex: bool,
    observed: bool,
    publisher: Option<ProgressPublisher>,
}

impl TransferSession {
    /// Creates an idle session whose data lane alone decides completion.
    pub fn new(direction: Direction) -> Self {
        Self {
            id: SessionId::generate(),
            direction,
            state: SessionState::Idle,
            last_error: None,
            failure: None,
            outbound: LaneProgress::default(),
            inbound: LaneProgress::default(),
            duplex: false,
            observed: false,
            publisher: None,
        }
    }

    /// Creates an idle session that completes only once both lanes have
    /// seen their final chunk.
    pub fn duplex(direction: Direction) -> Self {
        Self {
            duplex: true,
            ..Self::new(direction)
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_duplex(&self) -> bool {
        self.duplex
    }

    /// Kind of the error that ended the session, if any.
    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    /// Human-readable reason for a `Failed` session.
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Bytes recorded on the data lane.
    pub fn bytes_transferred(&self) -> u64 {
        self.lane(self.direction.data_lane()).bytes
    }

    /// Bytes recorded on the given lane.
    pub fn lane_bytes(&self, lane: Lane) -> u64 {
        self.lane(lane).bytes
    }

    /// Returns a consistent copy of the session's counters.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            direction: self.direction,
            state: self.state,
            bytes_transferred: self.bytes_transferred(),
            outbound_bytes: self.outbound.bytes,
            inbound_bytes: self.inbound.bytes,
            last_error: self.last_error,
        }
    }

    /// Records a chunk on the data lane. See [`record_on`](Self::record_on).
    pub fn record_chunk(&mut self, chunk: &Chunk) -> Result<SessionState, TransferError> {
        self.record_on(self.direction.data_lane(), chunk)
    }

    /// Records a chunk on `lane` and returns the new state.
    ///
    /// A sequence mismatch (or a chunk following that lane's final chunk)
    /// fails the session with `Protocol`. Chunks reaching a terminal session
    /// are rejected without touching its counters.
    pub fn record_on(&mut self, lane: Lane, chunk: &Chunk) -> Result<SessionState, TransferError> {
        self.admit(lane, chunk)?;
        if chunk.is_final() {
            return self.finish_lane(lane);
        }
        Ok(self.state)
    }

    /// Validates and counts a chunk without closing its lane.
    ///
    /// The final chunk only marks the lane as pending; the lane finishes in
    /// [`finish_lane`](Self::finish_lane) once the chunk has been delivered.
    pub(crate) fn admit(&mut self, lane: Lane, chunk: &Chunk) -> Result<(), TransferError> {
        if self.state.is_terminal() {
            return Err(self.rejection(chunk));
        }

        let progress = self.lane(lane);
        if progress.final_seen {
            let err = TransferError::Protocol(format!(
                "chunk {} arrived after the final chunk",
                chunk.sequence()
            ));
            self.fail(&err);
            return Err(err);
        }
        if chunk.sequence() != progress.expected_next {
            let err = TransferError::OutOfOrder {
                expected: progress.expected_next,
                got: chunk.sequence(),
            };
            self.fail(&err);
            return Err(err);
        }

        let progress = self.lane_mut(lane);
        progress.expected_next += 1;
        progress.bytes += chunk.len() as u64;
        progress.final_seen = chunk.is_final();

        if self.state == SessionState::Idle {
            debug!(session = %self.id, ?lane, "session active");
            self.state = SessionState::Active;
        }
        trace!(
            session = %self.id,
            ?lane,
            sequence = chunk.sequence(),
            len = chunk.len(),
            "chunk recorded"
        );

        if lane == self.direction.data_lane() {
            let bytes = self.bytes_transferred();
            let message = format!("{} {bytes} bytes", self.direction.verb());
            let published = match &self.publisher {
                Some(publisher) => publisher.publish(self.event(message)),
                None => Ok(()),
            };
            if let Err(err) = published {
                self.fail(&err);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Closes a lane whose final chunk was admitted, completing the session
    /// once every lane it waits on is closed.
    pub(crate) fn finish_lane(&mut self, lane: Lane) -> Result<SessionState, TransferError> {
        if self.state.is_terminal() {
            return match self.state {
                SessionState::Cancelled => Err(TransferError::Cancelled),
                SessionState::Completed => Ok(self.state),
                state => Err(TransferError::Protocol(format!("session is {state}"))),
            };
        }
        if !self.lane(lane).final_seen {
            return Err(TransferError::MissingFinal);
        }
        self.lane_mut(lane).finished = true;
        if self.all_lanes_finished() {
            self.finish(SessionState::Completed, None, "completed".into());
        }
        Ok(self.state)
    }

    /// Moves the session to `Cancelled`. No-op once terminal.
    pub fn cancel(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.finish(
            SessionState::Cancelled,
            Some(ErrorKind::Cancelled),
            "cancelled".into(),
        );
    }

    /// Ends the session because of `err`. No-op once terminal.
    ///
    /// A `Cancelled` error leads to the `Cancelled` state; every other kind
    /// (including `DeadlineExceeded`) leads to `Failed`.
    pub fn fail(&mut self, err: &TransferError) {
        if self.state.is_terminal() {
            return;
        }
        if err.kind() == ErrorKind::Cancelled {
            self.cancel();
            return;
        }
        let reason = err.to_string();
        self.failure = Some(reason.clone());
        self.finish(
            SessionState::Failed,
            Some(err.kind()),
            format!("failed: {reason}"),
        );
    }

    pub(crate) fn attach_publisher(
        &mut self,
        publisher: ProgressPublisher,
    ) -> Result<(), TransferError> {
        if self.observed {
            return Err(TransferError::InvalidArgument(format!(
                "session {} is already observed",
                self.id
            )));
        }
        self.observed = true;
        if self.state.is_terminal() {
            publisher.finish(self.event(self.terminal_message()));
        } else {
            self.publisher = Some(publisher);
        }
        Ok(())
    }

    fn finish(&mut self, state: SessionState, error: Option<ErrorKind>, message: String) {
        self.state = state;
        self.last_error = error;
        debug!(session = %self.id, %state, bytes = self.bytes_transferred(), "session terminal");
        if let Some(publisher) = self.publisher.take() {
            publisher.finish(self.event(message));
        }
    }

    fn terminal_message(&self) -> String {
        match self.state {
            SessionState::Completed => "completed".into(),
            SessionState::Cancelled => "cancelled".into(),
            _ => format!("failed: {}", self.failure.as_deref().unwrap_or("unknown")),
        }
    }

    fn event(&self, message: String) -> ProgressEvent {
        ProgressEvent {
            session_id: self.id,
            bytes_transferred: self.bytes_transferred(),
            state: self.state,
            message,
        }
    }

    fn rejection(&self, chunk: &Chunk) -> TransferError {
        match self.state {
            SessionState::Cancelled => TransferError::Cancelled,
            state => TransferError::Protocol(format!(
                "session is {state}; chunk {} rejected",
                chunk.sequence()
            )),
        }
    }

    fn all_lanes_finished(&self) -> bool {
        if self.duplex {
            self.outbound.finished && self.inbound.finished
        } else {
            self.lane(self.direction.data_lane()).finished
        }
    }

    fn lane(&self, lane: Lane) -> &LaneProgress {
        match lane {
            Lane::Outbound => &self.outbound,
            Lane::Inbound => &self.inbound,
        }
    }

    fn lane_mut(&mut self, lane: Lane) -> &mut LaneProgress {
        match lane {
            Lane::Outbound => &mut self.outbound,
            Lane::Inbound => &mut self.inbound,
        }
    }
}
