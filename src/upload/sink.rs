/*!
 * Destination abstraction for chunk delivery
 *
 * The orchestrator never interprets where chunks go. Callers hand it a
 * `ChunkSink`; the sink moves the bytes and reports back.
 */

use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::io;
use thiserror::Error;

use super::state::SessionHeader;

/// Failure reported by a sink for one delivery attempt
#[derive(Debug, Error)]
pub enum SinkError {
    /// Local I/O while staging or sending
    #[error("sink I/O error: {0}")]
    Io(#[from] io::Error),

    /// The transport failed; the message is classified for retryability
    #[error("transport error: {0}")]
    Transport(String),

    /// The destination refused the chunk; resending the same bytes cannot help
    #[error("chunk rejected: {0}")]
    Rejected(String),
}

impl SinkError {
    pub fn transport(msg: impl Into<String>) -> Self {
        SinkError::Transport(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        SinkError::Rejected(msg.into())
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, SinkError::Rejected(_))
    }
}

/// Delivers chunk bytes somewhere
///
/// Implementations must tolerate the same chunk being sent more than once: a
/// retry after an ambiguous failure or a resumed session can re-deliver it.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn send_chunk(
        &self,
        data: Bytes,
        index: u32,
        session: &SessionHeader,
    ) -> Result<(), SinkError>;
}

/// Adapter turning an async closure into a [`ChunkSink`]
pub struct FnSink<F> {
    f: F,
}

impl<F> FnSink<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> ChunkSink for FnSink<F>
where
    F: Fn(Bytes, u32, SessionHeader) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SinkError>> + Send + 'static,
{
    async fn send_chunk(
        &self,
        data: Bytes,
        index: u32,
        session: &SessionHeader,
    ) -> Result<(), SinkError> {
        (self.f)(data, index, session.clone()).await
    }
}
