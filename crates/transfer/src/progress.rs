use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::TransferError;
use crate::session::{SessionId, SessionState, TransferSession};

/// Default number of unread events a feed may hold.
pub const DEFAULT_WATERMARK: usize = 64;

/// One progress notification for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub session_id: SessionId,
    pub bytes_transferred: u64,
    /// Session state at the time the event was produced.
    pub state: SessionState,
    pub message: String,
}

impl ProgressEvent {
    /// Returns `true` for the last event of a session.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Attaches bounded progress feeds to sessions.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    watermark: usize,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self {
            watermark: DEFAULT_WATERMARK,
        }
    }
}

impl ProgressReporter {
    /// Creates a reporter whose feeds hold at most `watermark` unread events.
    pub fn new(watermark: usize) -> Result<Self, TransferError> {
        if watermark == 0 {
            return Err(TransferError::InvalidArgument(
                "progress watermark must be at least 1".into(),
            ));
        }
        Ok(Self { watermark })
    }

    pub fn watermark(&self) -> usize {
        self.watermark
    }

    /// Starts observing `session`.
    ///
    /// The returned feed yields one event per recorded data-lane chunk and
    /// ends after the terminal event. A session can be observed once.
    pub fn observe(&self, session: &mut TransferSession) -> Result<ProgressEvents, TransferError> {
        // One slot beyond the watermark is kept for the terminal event.
        let (tx, rx) = mpsc::channel(self.watermark + 1);
        session.attach_publisher(ProgressPublisher { tx })?;
        Ok(ProgressEvents { rx })
    }
}

/// Producer half of a feed, held by the session. Dropping it closes the feed.
#[derive(Debug)]
pub(crate) struct ProgressPublisher {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressPublisher {
    /// Queues a non-terminal event, refusing once the watermark is reached.
    pub(crate) fn publish(&self, event: ProgressEvent) -> Result<(), TransferError> {
        let watermark = self.tx.max_capacity() - 1;
        if self.tx.capacity() <= 1 {
            return Err(TransferError::Backpressure { watermark });
        }
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            // Nobody is listening any more.
            Err(TrySendError::Closed(_)) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransferError::Backpressure { watermark }),
        }
    }

    /// Queues the terminal event into the reserved slot and closes the feed.
    pub(crate) fn finish(self, event: ProgressEvent) {
        let _ = self.tx.try_send(event);
    }
}

/// Consumer half of a feed. Not restartable: each event is yielded once.
#[derive(Debug)]
pub struct ProgressEvents {
    rx: mpsc::Receiver<ProgressEvent>,
}

impl ProgressEvents {
    /// Waits for the next event. Returns `None` once the feed is drained and
    /// closed.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Returns the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }

    /// Number of events queued and not yet consumed.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Returns `true` once no more events will be queued.
    pub fn is_closed(&self) -> bool {
        self.rx.is_closed()
    }
}
