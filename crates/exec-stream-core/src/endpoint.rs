//! Process-side and caller-side byte endpoints attached to a session.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    StreamId, TermSize,
    traits::{ProcessHandle, TerminalResizer},
};

/// Source of bytes for an outbound stream.
pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

/// Consumer of bytes from an inbound stream.
pub type ByteSink = Box<dyn AsyncWrite + Send + Unpin>;

/// The controlled process: its output pipes, its input pipe, its terminal
/// and its exit status.
pub struct ProcessEndpoint {
    pub process: Box<dyn ProcessHandle>,
    pub stdout: Option<ByteSource>,
    pub stderr: Option<ByteSource>,
    pub stdin: Option<ByteSink>,
    pub resizer: Option<Arc<dyn TerminalResizer>>,
}

impl ProcessEndpoint {
    /// Create an endpoint with no streams attached.
    #[must_use]
    pub fn new(process: impl ProcessHandle + 'static) -> Self {
        Self {
            process: Box::new(process),
            stdout: None,
            stderr: None,
            stdin: None,
            resizer: None,
        }
    }

    #[must_use]
    pub fn stdout(mut self, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdout = Some(Box::new(reader));
        self
    }

    #[must_use]
    pub fn stderr(mut self, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stderr = Some(Box::new(reader));
        self
    }

    #[must_use]
    pub fn stdin(mut self, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(writer));
        self
    }

    #[must_use]
    pub fn resizer(mut self, resizer: Arc<dyn TerminalResizer>) -> Self {
        self.resizer = Some(resizer);
        self
    }

    /// Split into outbound sources and inbound sinks.
    #[must_use]
    pub fn into_streams(self) -> StreamSet {
        let sources = [(StreamId::Stdout, self.stdout), (StreamId::Stderr, self.stderr)]
            .into_iter()
            .filter_map(|(stream, reader)| reader.map(|r| (stream, r)))
            .collect();
        let sinks = self
            .stdin
            .map(|w| vec![(StreamId::Stdin, w)])
            .unwrap_or_default();
        StreamSet {
            sources,
            sinks,
            process: Some(self.process),
            resizer: self.resizer,
            initial_size: None,
        }
    }
}

/// The caller: local input feeding the remote stdin, local outputs receiving
/// the remote stdout and stderr.
#[derive(Default)]
pub struct CallerEndpoint {
    pub stdin: Option<ByteSource>,
    pub stdout: Option<ByteSink>,
    pub stderr: Option<ByteSink>,
    /// Geometry announced to the remote terminal when the session starts.
    pub initial_size: Option<TermSize>,
}

impl CallerEndpoint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn stdin(mut self, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(reader));
        self
    }

    #[must_use]
    pub fn stdout(mut self, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout = Some(Box::new(writer));
        self
    }

    #[must_use]
    pub fn stderr(mut self, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stderr = Some(Box::new(writer));
        self
    }

    #[must_use]
    pub const fn initial_size(mut self, size: TermSize) -> Self {
        self.initial_size = Some(size);
        self
    }

    /// Split into outbound sources and inbound sinks.
    #[must_use]
    pub fn into_streams(self) -> StreamSet {
        let sources = self
            .stdin
            .map(|r| vec![(StreamId::Stdin, r)])
            .unwrap_or_default();
        let sinks = [(StreamId::Stdout, self.stdout), (StreamId::Stderr, self.stderr)]
            .into_iter()
            .filter_map(|(stream, writer)| writer.map(|w| (stream, w)))
            .collect();
        StreamSet {
            sources,
            sinks,
            process: None,
            resizer: None,
            initial_size: self.initial_size,
        }
    }
}

/// Role-neutral view of an endpoint, as consumed by the multiplexer.
pub struct StreamSet {
    pub sources: Vec<(StreamId, ByteSource)>,
    pub sinks: Vec<(StreamId, ByteSink)>,
    pub process: Option<Box<dyn ProcessHandle>>,
    pub resizer: Option<Arc<dyn TerminalResizer>>,
    pub initial_size: Option<TermSize>,
}
