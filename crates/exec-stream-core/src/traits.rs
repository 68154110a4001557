//! Collaborator traits: the transport connection and the process side.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::{ExitStatus, TermSize};

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Transport error: {0}")]
    Other(String),
}

/// Write side of a message-framed connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one binary message.
    async fn send(&mut self, message: Bytes) -> Result<(), TransportError>;

    /// Close the connection.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read side of a message-framed connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next binary message. `None` once the connection is closed.
    async fn recv(&mut self) -> Option<Result<Bytes, TransportError>>;
}

/// A connected duplex channel that delivers whole messages reliably and in
/// order.
pub struct Transport {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

impl Transport {
    #[must_use]
    pub fn new(sink: impl FrameSink + 'static, source: impl FrameSource + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }
}

/// Process error.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Process error: {0}")]
    Other(String),
}

/// Receives terminal geometry changes for the controlled process.
pub trait TerminalResizer: Send + Sync {
    /// Apply a new size.
    ///
    /// # Errors
    /// Returns error if the terminal cannot be resized.
    fn resize(&self, size: TermSize) -> Result<(), ProcessError>;
}

/// Handle on a running process.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Wait for the process to exit.
    async fn wait(&mut self) -> Result<ExitStatus, ProcessError>;

    /// Ask the process to terminate. Does not wait.
    fn kill(&mut self) -> Result<(), ProcessError>;
}
