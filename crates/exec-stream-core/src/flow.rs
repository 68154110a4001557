//! Per-direction flow control state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, StreamId};

/// Flow state of one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    /// Bytes may be forwarded.
    #[default]
    Flowing,
    /// Bytes must be withheld until resumed.
    Paused,
    /// No further bytes will ever be sent. Terminal.
    Ended,
}

impl FlowState {
    /// Apply a signal. `Ended` absorbs everything.
    #[must_use]
    pub const fn apply(self, signal: FlowSignal) -> Self {
        match (self, signal) {
            (Self::Ended, _) | (_, FlowSignal::End) => Self::Ended,
            (_, FlowSignal::Pause) => Self::Paused,
            (_, FlowSignal::Resume) => Self::Flowing,
        }
    }

    #[must_use]
    pub const fn can_send(self) -> bool {
        matches!(self, Self::Flowing)
    }

    #[must_use]
    pub const fn is_ended(self) -> bool {
        matches!(self, Self::Ended)
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Flowing => "flowing",
            Self::Paused => "paused",
            Self::Ended => "ended",
        })
    }
}

/// Control signal that moves a direction between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSignal {
    Pause,
    Resume,
    End,
}

/// Flow state of stdin, stdout and stderr.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowTable {
    states: [FlowState; 3],
}

impl FlowTable {
    /// All directions flowing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn get(&self, stream: StreamId) -> FlowState {
        self.states[stream.index()]
    }

    /// Apply `signal` to `stream`.
    ///
    /// Returns the new state if it changed, `None` for a no-op (including
    /// every signal applied to an ended direction).
    pub fn apply(&mut self, stream: StreamId, signal: FlowSignal) -> Option<FlowState> {
        let slot = &mut self.states[stream.index()];
        let next = slot.apply(signal);
        if next == *slot {
            return None;
        }
        *slot = next;
        Some(next)
    }

    /// Check that a data frame may be sent on `stream`.
    ///
    /// # Errors
    /// Returns `FlowViolation` if the direction is paused or ended.
    pub fn check_send(&self, stream: StreamId) -> Result<(), Error> {
        match self.get(stream) {
            FlowState::Flowing => Ok(()),
            state => Err(Error::FlowViolation { stream, state }),
        }
    }

    /// Whether every direction in `streams` has ended.
    #[must_use]
    pub fn all_ended(&self, streams: &[StreamId]) -> bool {
        streams.iter().all(|s| self.get(*s).is_ended())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_resume_cycle() {
        let mut table = FlowTable::new();
        assert_eq!(table.get(StreamId::Stdout), FlowState::Flowing);

        assert_eq!(
            table.apply(StreamId::Stdout, FlowSignal::Pause),
            Some(FlowState::Paused)
        );
        assert!(table.check_send(StreamId::Stdout).is_err());
        assert!(table.check_send(StreamId::Stderr).is_ok());

        assert_eq!(table.apply(StreamId::Stdout, FlowSignal::Pause), None);
        assert_eq!(
            table.apply(StreamId::Stdout, FlowSignal::Resume),
            Some(FlowState::Flowing)
        );
        assert!(table.check_send(StreamId::Stdout).is_ok());
    }

    #[test]
    fn test_ended_is_terminal() {
        for start in [FlowSignal::Resume, FlowSignal::Pause] {
            let mut table = FlowTable::new();
            table.apply(StreamId::Stdin, start);
            assert_eq!(
                table.apply(StreamId::Stdin, FlowSignal::End),
                Some(FlowState::Ended)
            );
            for signal in [FlowSignal::Pause, FlowSignal::Resume, FlowSignal::End] {
                assert_eq!(table.apply(StreamId::Stdin, signal), None);
                assert_eq!(table.get(StreamId::Stdin), FlowState::Ended);
            }
        }
    }

    #[test]
    fn test_violation_carries_state() {
        let mut table = FlowTable::new();
        table.apply(StreamId::Stderr, FlowSignal::End);
        match table.check_send(StreamId::Stderr) {
            Err(Error::FlowViolation { stream, state }) => {
                assert_eq!(stream, StreamId::Stderr);
                assert_eq!(state, FlowState::Ended);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_all_ended() {
        let mut table = FlowTable::new();
        let outputs = [StreamId::Stdout, StreamId::Stderr];
        table.apply(StreamId::Stdout, FlowSignal::End);
        assert!(!table.all_ended(&outputs));
        table.apply(StreamId::Stderr, FlowSignal::End);
        assert!(table.all_ended(&outputs));
        assert!(!table.all_ended(&StreamId::ALL));
    }
}
