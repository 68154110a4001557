//! Protocol error taxonomy.

use thiserror::Error;

use crate::{
    FlowState, FrameError, StreamId,
    traits::{ProcessError, TransportError},
};

/// Protocol-level error.
#[derive(Debug, Error)]
pub enum Error {
    /// Undecodable or truncated frame. Fatal to the frame only.
    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),
    /// Data on a paused or ended direction. Dropped, never fatal.
    #[error("Flow violation: data on {stream} while {state}")]
    FlowViolation { stream: StreamId, state: FlowState },
    #[error("Transport failure: {0}")]
    TransportFailure(#[from] TransportError),
    #[error("Process failure: {0}")]
    ProcessFailure(#[from] ProcessError),
}

impl Error {
    /// Whether the error ends the session on its own.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::TransportFailure(_) | Self::ProcessFailure(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        assert!(!Error::from(FrameError::Empty).is_fatal());
        assert!(
            !Error::FlowViolation {
                stream: StreamId::Stdout,
                state: FlowState::Paused,
            }
            .is_fatal()
        );
        assert!(Error::from(TransportError::Closed).is_fatal());
        assert!(Error::from(ProcessError::Other("gone".into())).is_fatal());
    }

    #[test]
    fn test_display() {
        let err = Error::FlowViolation {
            stream: StreamId::Stdin,
            state: FlowState::Ended,
        };
        assert_eq!(err.to_string(), "Flow violation: data on stdin while ended");
    }
}
