//! Per-call hooks run on the call header before dispatch.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use filepump_protocol::{CallHeader, Method, Status};
use filepump_transfer::TransferError;
use tracing::{info, warn};

use crate::token::tokens_match;

/// What an interceptor knows about a call.
#[derive(Debug, Clone)]
pub struct CallInfo {
    pub call_id: String,
    pub method: Method,
    pub peer: SocketAddr,
}

/// A hook around every call.
///
/// `before` may reject the call; the first rejection in a chain wins and is
/// sent to the client as the call's status.
pub trait Interceptor: Send + Sync {
    fn before(&self, call: &CallInfo, header: &CallHeader) -> Result<(), TransferError>;

    /// Runs once the call's status is known, rejected calls included.
    fn after(&self, _call: &CallInfo, _status: &Status, _elapsed: Duration) {}
}

/// Ordered list of interceptors.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logging first, then bearer auth when a token is configured.
    pub fn standard(token: Option<&str>) -> Self {
        let chain = Self::new().with(LoggingInterceptor);
        match token {
            Some(token) => chain.with(BearerAuth::new(token)),
            None => chain,
        }
    }

    /// Appends an interceptor.
    pub fn with(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn before(&self, call: &CallInfo, header: &CallHeader) -> Result<(), TransferError> {
        self.interceptors
            .iter()
            .try_for_each(|i| i.before(call, header))
    }

    /// Runs `after` hooks in reverse order.
    pub fn after(&self, call: &CallInfo, status: &Status, elapsed: Duration) {
        for interceptor in self.interceptors.iter().rev() {
            interceptor.after(call, status, elapsed);
        }
    }
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.interceptors.len())
            .finish()
    }
}

/// Logs every call and its outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingInterceptor;

impl Interceptor for LoggingInterceptor {
    fn before(&self, call: &CallInfo, _header: &CallHeader) -> Result<(), TransferError> {
        info!(call = %call.call_id, method = %call.method, peer = %call.peer, "call started");
        Ok(())
    }

    fn after(&self, call: &CallInfo, status: &Status, elapsed: Duration) {
        if status.is_ok() {
            info!(
                call = %call.call_id,
                method = %call.method,
                elapsed_ms = elapsed.as_millis() as u64,
                "call finished"
            );
        } else {
            warn!(
                call = %call.call_id,
                method = %call.method,
                code = ?status.code,
                message = %status.message,
                elapsed_ms = elapsed.as_millis() as u64,
                "call failed"
            );
        }
    }
}

/// Rejects calls whose `Bearer` token does not match.
pub struct BearerAuth {
    token: String,
}

impl BearerAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Interceptor for BearerAuth {
    fn before(&self, call: &CallInfo, header: &CallHeader) -> Result<(), TransferError> {
        let Some(presented) = header.bearer_token() else {
            warn!(call = %call.call_id, peer = %call.peer, "missing bearer token");
            return Err(TransferError::Unauthenticated(
                "missing bearer token".into(),
            ));
        };
        if !tokens_match(presented, &self.token) {
            warn!(call = %call.call_id, peer = %call.peer, "invalid bearer token");
            return Err(TransferError::Unauthenticated(
                "invalid bearer token".into(),
            ));
        }
        Ok(())
    }
}
