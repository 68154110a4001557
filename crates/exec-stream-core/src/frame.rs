//! Binary frame codec.
//!
//! Every transport message carries exactly one frame: a one-byte type tag
//! followed by a type-dependent payload.
//!
//! | Tag | Frame    | Payload                              |
//! |-----|----------|--------------------------------------|
//! | 0   | stdin    | raw bytes                            |
//! | 1   | stdout   | raw bytes                            |
//! | 2   | stderr   | raw bytes                            |
//! | 50  | resize   | columns `u16` LE, rows `u16` LE      |
//! | 100 | resume   | empty                                |
//! | 101 | pause    | empty                                |
//! | 102 | end      | empty                                |
//! | 200 | stopped  | exit code `u8`, optional signal `u8` |
//! | 201 | shutdown | optional UTF-8 reason                |
//! | 202 | error    | UTF-8 message                        |
//!
//! Every other tag is reserved and rejected on decode. A data frame with an
//! empty payload marks the end of that stream.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const RESIZE_PAYLOAD_LEN: usize = 4;

/// Logical byte stream multiplexed over the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamId {
    /// Caller to process.
    Stdin,
    /// Process to caller.
    Stdout,
    /// Process to caller.
    Stderr,
}

impl StreamId {
    /// All streams, in tag order.
    pub const ALL: [Self; 3] = [Self::Stdin, Self::Stdout, Self::Stderr];

    /// Dense index, usable for fixed-size per-stream tables.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Stdin => 0,
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }

    /// Whether bytes of this stream travel towards the process.
    #[must_use]
    pub const fn is_process_input(self) -> bool {
        matches!(self, Self::Stdin)
    }

    const fn message_type(self) -> MessageType {
        match self {
            Self::Stdin => MessageType::Stdin,
            Self::Stdout => MessageType::Stdout,
            Self::Stderr => MessageType::Stderr,
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdin => "stdin",
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        })
    }
}

/// Wire type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Caller input for the process.
    Stdin = 0,
    /// Process standard output.
    Stdout = 1,
    /// Process standard error.
    Stderr = 2,
    /// Terminal geometry change.
    Resize = 50,
    /// Sender may resume its outbound streams.
    Resume = 100,
    /// Sender must stop its outbound streams.
    Pause = 101,
    /// Sender will send no more data.
    End = 102,
    /// Process exited.
    Stopped = 200,
    /// Session was shut down.
    Shutdown = 201,
    /// Session failed.
    Error = 202,
}

impl MessageType {
    /// Raw tag byte.
    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Stream carried by a data frame of this type.
    #[must_use]
    pub const fn stream(self) -> Option<StreamId> {
        match self {
            Self::Stdin => Some(StreamId::Stdin),
            Self::Stdout => Some(StreamId::Stdout),
            Self::Stderr => Some(StreamId::Stderr),
            _ => None,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = FrameError;

    fn try_from(tag: u8) -> Result<Self, FrameError> {
        Ok(match tag {
            0 => Self::Stdin,
            1 => Self::Stdout,
            2 => Self::Stderr,
            50 => Self::Resize,
            100 => Self::Resume,
            101 => Self::Pause,
            102 => Self::End,
            200 => Self::Stopped,
            201 => Self::Shutdown,
            202 => Self::Error,
            other => return Err(FrameError::UnknownType(other)),
        })
    }
}

/// Terminal geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    /// Width in character cells.
    pub cols: u16,
    /// Height in character cells.
    pub rows: u16,
}

impl TermSize {
    #[must_use]
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl fmt::Display for TermSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Process exit status as carried by a `stopped` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    /// Exit code, truncated to a byte.
    pub code: u8,
    /// Terminating signal, when the process was signaled.
    pub signal: Option<u8>,
}

impl ExitStatus {
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        Self { code, signal: None }
    }

    /// Status of a process killed by `signal`, using the shell's `128 + n` code.
    #[must_use]
    pub const fn from_signal(signal: u8) -> Self {
        Self {
            code: 128u8.wrapping_add(signal),
            signal: Some(signal),
        }
    }

    #[must_use]
    pub const fn success(&self) -> bool {
        self.code == 0 && self.signal.is_none()
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.signal {
            Some(signal) => write!(f, "exit code {} (signal {signal})", self.code),
            None => write!(f, "exit code {}", self.code),
        }
    }
}

/// Codec error. Every variant is a `MalformedFrame` at the protocol level.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("Empty frame")]
    Empty,
    #[error("Unknown message type: {0}")]
    UnknownType(u8),
    #[error("Truncated {kind:?} frame: expected {expected} payload bytes, got {actual}")]
    Truncated {
        kind: MessageType,
        expected: usize,
        actual: usize,
    },
}

/// One decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Payload bytes of one stream. Empty payload = end of that stream.
    Data { stream: StreamId, payload: Bytes },
    /// New terminal geometry, sent by the controlling side.
    Resize(TermSize),
    Resume,
    Pause,
    /// Every outbound stream of the sender has ended.
    End,
    /// The process exited with this status.
    Stopped(ExitStatus),
    /// An empty reason is not representable on the wire; build with
    /// [`Frame::shutdown`] to keep it `None`.
    Shutdown { reason: Option<String> },
    /// The session failed.
    Error { message: String },
}

impl Frame {
    /// Create a data frame.
    #[must_use]
    pub fn data(stream: StreamId, payload: impl Into<Bytes>) -> Self {
        Self::Data {
            stream,
            payload: payload.into(),
        }
    }

    /// Create a shutdown frame. An empty reason becomes `None`.
    #[must_use]
    pub fn shutdown(reason: Option<String>) -> Self {
        Self::Shutdown {
            reason: reason.filter(|r| !r.is_empty()),
        }
    }

    /// Zero-length data frame closing `stream`.
    #[must_use]
    pub const fn end_of(stream: StreamId) -> Self {
        Self::Data {
            stream,
            payload: Bytes::new(),
        }
    }

    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::Data { stream, .. } => stream.message_type(),
            Self::Resize(_) => MessageType::Resize,
            Self::Resume => MessageType::Resume,
            Self::Pause => MessageType::Pause,
            Self::End => MessageType::End,
            Self::Stopped(_) => MessageType::Stopped,
            Self::Shutdown { .. } => MessageType::Shutdown,
            Self::Error { .. } => MessageType::Error,
        }
    }

    /// Whether this is one of the session-ending frames.
    #[must_use]
    pub const fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::Stopped(_) | Self::Shutdown { .. } | Self::Error { .. }
        )
    }

    /// Encode into a single transport message.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let kind = self.message_type();
        match self {
            Self::Data { payload, .. } => encode_raw(kind, payload),
            Self::Resize(size) => {
                let mut buf = BytesMut::with_capacity(1 + RESIZE_PAYLOAD_LEN);
                buf.put_u8(kind.tag());
                buf.put_u16_le(size.cols);
                buf.put_u16_le(size.rows);
                buf.freeze()
            }
            Self::Resume | Self::Pause | Self::End => encode_raw(kind, &[]),
            Self::Stopped(status) => match status.signal {
                Some(signal) => encode_raw(kind, &[status.code, signal]),
                None => encode_raw(kind, &[status.code]),
            },
            Self::Shutdown { reason } => {
                encode_raw(kind, reason.as_deref().unwrap_or_default().as_bytes())
            }
            Self::Error { message } => encode_raw(kind, message.as_bytes()),
        }
    }

    /// Decode one transport message.
    ///
    /// # Errors
    /// Returns error if the message is empty, has a reserved tag, or a
    /// fixed-size payload is short.
    pub fn decode(message: Bytes) -> Result<Self, FrameError> {
        let (kind, payload) = split_raw(message)?;
        Ok(match kind {
            MessageType::Stdin => Self::data(StreamId::Stdin, payload),
            MessageType::Stdout => Self::data(StreamId::Stdout, payload),
            MessageType::Stderr => Self::data(StreamId::Stderr, payload),
            MessageType::Resize => {
                require_len(kind, &payload, RESIZE_PAYLOAD_LEN)?;
                Self::Resize(TermSize {
                    cols: u16::from_le_bytes([payload[0], payload[1]]),
                    rows: u16::from_le_bytes([payload[2], payload[3]]),
                })
            }
            MessageType::Resume => Self::Resume,
            MessageType::Pause => Self::Pause,
            MessageType::End => Self::End,
            MessageType::Stopped => {
                require_len(kind, &payload, 1)?;
                Self::Stopped(ExitStatus {
                    code: payload[0],
                    signal: payload.get(1).copied(),
                })
            }
            MessageType::Shutdown => Self::Shutdown {
                reason: (!payload.is_empty())
                    .then(|| String::from_utf8_lossy(&payload).into_owned()),
            },
            MessageType::Error => Self::Error {
                message: String::from_utf8_lossy(&payload).into_owned(),
            },
        })
    }
}

/// Encode a tag and an opaque payload.
#[must_use]
pub fn encode_raw(kind: MessageType, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(kind.tag());
    buf.put_slice(payload);
    buf.freeze()
}

/// Split a transport message into its tag and payload without interpreting
/// the payload.
///
/// # Errors
/// Returns error if the message is empty or the tag is reserved.
pub fn split_raw(mut message: Bytes) -> Result<(MessageType, Bytes), FrameError> {
    let Some(&tag) = message.first() else {
        return Err(FrameError::Empty);
    };
    let kind = MessageType::try_from(tag)?;
    let payload = message.split_off(1);
    Ok((kind, payload))
}

fn require_len(kind: MessageType, payload: &[u8], expected: usize) -> Result<(), FrameError> {
    if payload.len() < expected {
        return Err(FrameError::Truncated {
            kind,
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn every_frame(payload: &[u8]) -> Vec<Frame> {
        let text = String::from_utf8_lossy(payload).into_owned();
        vec![
            Frame::data(StreamId::Stdin, payload.to_vec()),
            Frame::data(StreamId::Stdout, payload.to_vec()),
            Frame::data(StreamId::Stderr, payload.to_vec()),
            Frame::Resize(TermSize::new(120, 40)),
            Frame::Resume,
            Frame::Pause,
            Frame::End,
            Frame::Stopped(ExitStatus::from_code(3)),
            Frame::Stopped(ExitStatus::from_signal(9)),
            Frame::Shutdown {
                reason: (!text.is_empty()).then(|| text.clone()),
            },
            Frame::Error { message: text },
        ]
    }

    #[test]
    fn test_roundtrip_all_types() {
        let large = vec![b'x'; 3 * 1024 * 1024 + 17];
        for payload in [&b""[..], &b"a"[..], &large[..]] {
            for frame in every_frame(payload) {
                let decoded = Frame::decode(frame.encode()).unwrap();
                assert_eq!(decoded, frame);
            }
        }
    }

    #[test]
    fn test_raw_roundtrip() {
        let encoded = encode_raw(MessageType::Stdout, b"hello\n");
        let (kind, payload) = split_raw(encoded).unwrap();
        assert_eq!(kind, MessageType::Stdout);
        assert_eq!(&payload[..], b"hello\n");
    }

    #[test]
    fn test_wire_layout() {
        assert_eq!(&Frame::data(StreamId::Stdout, &b"hi"[..]).encode()[..], &[1, b'h', b'i']);
        assert_eq!(
            &Frame::Resize(TermSize::new(120, 40)).encode()[..],
            &[50, 120, 0, 40, 0]
        );
        assert_eq!(&Frame::Pause.encode()[..], &[101]);
        assert_eq!(&Frame::Resume.encode()[..], &[100]);
        assert_eq!(&Frame::End.encode()[..], &[102]);
        assert_eq!(&Frame::Stopped(ExitStatus::from_code(0)).encode()[..], &[200, 0]);
        assert_eq!(&Frame::Shutdown { reason: None }.encode()[..], &[201]);
    }

    #[test]
    fn test_empty_message_is_malformed() {
        assert_eq!(Frame::decode(Bytes::new()), Err(FrameError::Empty));
    }

    #[test]
    fn test_reserved_tags_are_malformed() {
        for tag in [3u8, 49, 51, 99, 103, 199, 203, 255] {
            assert_eq!(
                Frame::decode(Bytes::from(vec![tag, 1, 2, 3, 4])),
                Err(FrameError::UnknownType(tag))
            );
        }
    }

    #[test]
    fn test_truncated_resize() {
        let err = Frame::decode(Bytes::from_static(&[50, 1, 0, 2])).unwrap_err();
        assert_eq!(
            err,
            FrameError::Truncated {
                kind: MessageType::Resize,
                expected: 4,
                actual: 3,
            }
        );
    }

    #[test]
    fn test_empty_stopped_is_malformed() {
        assert!(matches!(
            Frame::decode(Bytes::from_static(&[200])),
            Err(FrameError::Truncated { kind: MessageType::Stopped, .. })
        ));
    }

    #[test]
    fn test_control_frames_ignore_trailing_bytes() {
        assert_eq!(Frame::decode(Bytes::from_static(&[101, 7])).unwrap(), Frame::Pause);
        assert_eq!(
            Frame::decode(Bytes::from_static(&[50, 80, 0, 24, 0, 9])).unwrap(),
            Frame::Resize(TermSize::new(80, 24))
        );
    }

    #[test]
    fn test_empty_shutdown_reason_is_none() {
        let frame = Frame::shutdown(Some(String::new()));
        assert_eq!(frame, Frame::Shutdown { reason: None });
        assert_eq!(Frame::decode(frame.encode()).unwrap(), frame);

        let frame = Frame::shutdown(Some("drain".into()));
        assert_eq!(Frame::decode(frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_end_marker() {
        let frame = Frame::decode(Bytes::from_static(&[0])).unwrap();
        assert_eq!(frame, Frame::end_of(StreamId::Stdin));
    }

    #[test]
    fn test_exit_status() {
        assert!(ExitStatus::from_code(0).success());
        assert!(!ExitStatus::from_code(1).success());
        let killed = ExitStatus::from_signal(15);
        assert_eq!(killed.code, 143);
        assert!(!killed.success());
    }
}
