//! Core of the multiplexed exec stream protocol.
//!
//! This crate provides the pieces that carry no I/O of their own:
//! - `Frame` - Binary frame codec
//! - `FlowTable` - Per-direction pause/resume/end state
//! - `Error` - Protocol error taxonomy
//! - `SessionConfig` - Session tunables
//! - Transport and process collaborator traits, plus an in-memory transport

pub mod config;
pub mod endpoint;
pub mod error;
pub mod flow;
pub mod frame;
pub mod memory;
pub mod traits;

pub use config::{ConfigError, SessionConfig};
pub use endpoint::{ByteSink, ByteSource, CallerEndpoint, ProcessEndpoint, StreamSet};
pub use error::Error;
pub use flow::{FlowSignal, FlowState, FlowTable};
pub use frame::{ExitStatus, Frame, FrameError, MessageType, StreamId, TermSize};
pub use traits::{
    FrameSink, FrameSource, ProcessError, ProcessHandle, TerminalResizer, Transport,
    TransportError,
};
