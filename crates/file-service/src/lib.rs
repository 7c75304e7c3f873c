//! Framed TCP file service.
//!
//! One call per connection. The client opens with a call frame naming the
//! method and carrying its bearer token, then both sides exchange data
//! frames until the server closes the call with a status frame.
//!
//! # Wire format
//!
//! See [`wire`] module for the framing.

pub mod client;
pub mod error;
pub mod frames;
pub mod interceptor;
pub mod server;
pub mod token;
pub mod wire;

pub use client::{ClientConfig, FileClient, NoteLog};
pub use error::ServiceError;
pub use frames::{FramedConnection, Role};
pub use interceptor::{BearerAuth, CallInfo, Interceptor, InterceptorChain, LoggingInterceptor};
pub use server::{FileServer, ServerConfig};
pub use token::{generate_token, tokens_match};
pub use wire::check_transfer_config;

use std::time::Duration;

/// TCP read/write buffer size (256 KB).
pub const TCP_BUFFER_SIZE: usize = 256 * 1024;

/// Timeout for the TCP connection attempt.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a server keeps reading after a failed call so the client sees
/// the status instead of a reset.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
