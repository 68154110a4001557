//! Connection roles and the session lifecycle.

use std::fmt;

use exec_stream_core::{ExitStatus, Frame, StreamId};
use serde::{Deserialize, Serialize};

/// Which end of the connection this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Serves a process: sends stdout/stderr and lifecycle frames, receives
    /// stdin and resize.
    Controlled,
    /// Drives a remote process: sends stdin and resize, receives
    /// stdout/stderr and lifecycle frames.
    Controlling,
}

impl Role {
    /// Streams whose data frames this side sends.
    #[must_use]
    pub const fn outbound(self) -> &'static [StreamId] {
        match self {
            Self::Controlled => &[StreamId::Stdout, StreamId::Stderr],
            Self::Controlling => &[StreamId::Stdin],
        }
    }

    /// Streams whose data frames this side receives.
    #[must_use]
    pub const fn inbound(self) -> &'static [StreamId] {
        match self {
            Self::Controlled => &[StreamId::Stdin],
            Self::Controlling => &[StreamId::Stdout, StreamId::Stderr],
        }
    }

    #[must_use]
    pub const fn sends(self, stream: StreamId) -> bool {
        stream.is_process_input() == matches!(self, Self::Controlling)
    }

    #[must_use]
    pub const fn receives(self, stream: StreamId) -> bool {
        !self.sends(stream)
    }

    /// Whether this side announces the session outcome to its peer.
    #[must_use]
    pub const fn emits_lifecycle(self) -> bool {
        matches!(self, Self::Controlled)
    }
}

/// Lifecycle of a session. Every state but `Running` is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Running,
    /// The process exited.
    Stopped(ExitStatus),
    /// The serving side closed the session on purpose.
    Shutdown { reason: Option<String> },
    /// A protocol, transport or process fault ended the session.
    Errored { message: String },
}

impl SessionState {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Frame announcing this state to the peer.
    #[must_use]
    pub fn lifecycle_frame(&self) -> Option<Frame> {
        match self {
            Self::Running => None,
            Self::Stopped(status) => Some(Frame::Stopped(*status)),
            Self::Shutdown { reason } => Some(Frame::shutdown(reason.clone())),
            Self::Errored { message } => Some(Frame::Error {
                message: message.clone(),
            }),
        }
    }

    /// State announced by a lifecycle frame.
    #[must_use]
    pub fn from_lifecycle_frame(frame: Frame) -> Option<Self> {
        match frame {
            Frame::Stopped(status) => Some(Self::Stopped(status)),
            Frame::Shutdown { reason } => Some(Self::Shutdown { reason }),
            Frame::Error { message } => Some(Self::Errored { message }),
            _ => None,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Stopped(status) => write!(f, "stopped ({status})"),
            Self::Shutdown { reason: Some(reason) } => write!(f, "shutdown ({reason})"),
            Self::Shutdown { reason: None } => f.write_str("shutdown"),
            Self::Errored { message } => write!(f, "errored ({message})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_mirror() {
        for stream in StreamId::ALL {
            assert_ne!(Role::Controlled.sends(stream), Role::Controlling.sends(stream));
            assert_eq!(
                Role::Controlled.receives(stream),
                Role::Controlling.sends(stream)
            );
        }
        assert!(Role::Controlled.outbound().iter().all(|s| Role::Controlled.sends(*s)));
        assert!(Role::Controlling.inbound().iter().all(|s| Role::Controlling.receives(*s)));
    }

    #[test]
    fn test_lifecycle_frames_roundtrip() {
        let states = [
            SessionState::Stopped(ExitStatus::from_code(2)),
            SessionState::Shutdown {
                reason: Some("drain".into()),
            },
            SessionState::Errored {
                message: "boom".into(),
            },
        ];
        for state in states {
            let frame = state.lifecycle_frame().unwrap();
            assert!(frame.is_lifecycle());
            assert_eq!(SessionState::from_lifecycle_frame(frame), Some(state));
        }
        assert!(SessionState::Running.lifecycle_frame().is_none());
        assert!(SessionState::from_lifecycle_frame(Frame::Pause).is_none());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SessionState::Running.is_terminal());
        assert!(SessionState::Shutdown { reason: None }.is_terminal());
    }
}
