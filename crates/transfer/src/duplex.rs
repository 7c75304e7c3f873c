//! Runs both directions of a duplex session and joins them.

use std::sync::{Mutex, PoisonError};

use tracing::{debug, info};

use crate::TransferConfig;
use crate::context::TransferContext;
use crate::error::TransferError;
use crate::io::{ChunkSink, ChunkStream, DuplexChannel};
use crate::pump::{StreamPump, lock_session};
use crate::session::{Lane, TransferSession};

/// Bytes moved by each pump of a finished duplex run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DuplexReport {
    pub sent: u64,
    pub received: u64,
}

/// Drives an outbound and an inbound pump over one channel.
#[derive(Debug, Clone, Default)]
pub struct DuplexCoordinator {
    config: TransferConfig,
}

impl DuplexCoordinator {
    pub fn new(config: TransferConfig) -> Self {
        Self { config }
    }

    /// Pumps `outbound` into the channel and the channel into `inbound_sink`
    /// concurrently, returning once both pumps have stopped.
    ///
    /// The first pump to fail cancels the other; its error (by arrival order)
    /// is the one returned. If one side finishes and the other is still
    /// running when `ctx` expires, the run fails with `DeadlineExceeded`.
    pub async fn run_duplex<O, C, K>(
        &self,
        ctx: &TransferContext,
        outbound: O,
        channel: C,
        inbound_sink: K,
        session: &Mutex<TransferSession>,
    ) -> Result<DuplexReport, TransferError>
    where
        O: ChunkStream,
        C: DuplexChannel,
        K: ChunkSink,
    {
        let (net_sink, net_stream) = channel.into_split();
        let scope = ctx.child();
        let first_error: Mutex<Option<TransferError>> = Mutex::new(None);
        let session_id = lock_session(session).id();

        let settle = |result: Result<u64, TransferError>, lane: Lane| match result {
            Ok(bytes) => {
                debug!(session = %session_id, ?lane, bytes, "pump completed");
                bytes
            }
            Err(err) => {
                debug!(session = %session_id, ?lane, error = %err, "pump failed");
                first_error
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get_or_insert(err);
                scope.cancel();
                0
            }
        };

        let send = async {
            let pump = StreamPump::new(&self.config).on_lane(Lane::Outbound);
            let result = pump.run_stream(&scope, outbound, net_sink, session).await;
            settle(result, Lane::Outbound)
        };
        let receive = async {
            let pump = StreamPump::new(&self.config).on_lane(Lane::Inbound);
            let result = pump.run_stream(&scope, net_stream, inbound_sink, session).await;
            settle(result, Lane::Inbound)
        };
        let (sent, received) = tokio::join!(send, receive);

        if let Some(err) = first_error
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
        {
            return Err(err);
        }
        info!(session = %session_id, sent, received, "duplex transfer completed");
        Ok(DuplexReport { sent, received })
    }
}
