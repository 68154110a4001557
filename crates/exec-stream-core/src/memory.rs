//! In-memory transport, for tests and in-process bridging.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::traits::{FrameSink, FrameSource, Transport, TransportError};

/// Sending half of an in-memory connection.
pub struct MemorySink {
    tx: Option<mpsc::Sender<Bytes>>,
}

/// Receiving half of an in-memory connection.
pub struct MemorySource {
    rx: mpsc::Receiver<Bytes>,
}

/// Create two connected transports. Each buffers up to `capacity` messages
/// per direction.
#[must_use]
pub fn pair(capacity: usize) -> (Transport, Transport) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        Transport::new(MemorySink { tx: Some(a_tx) }, MemorySource { rx: b_rx }),
        Transport::new(MemorySink { tx: Some(b_tx) }, MemorySource { rx: a_rx }),
    )
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, message: Bytes) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(message).await.map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Option<Result<Bytes, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (mut a, mut b) = pair(4);
        a.sink.send(Bytes::from_static(b"one")).await.unwrap();
        a.sink.send(Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(&b.source.recv().await.unwrap().unwrap()[..], b"one");
        assert_eq!(&b.source.recv().await.unwrap().unwrap()[..], b"two");

        b.sink.send(Bytes::from_static(b"back")).await.unwrap();
        assert_eq!(&a.source.recv().await.unwrap().unwrap()[..], b"back");
    }

    #[tokio::test]
    async fn test_close_ends_peer_stream() {
        let (mut a, mut b) = pair(4);
        a.sink.close().await.unwrap();
        assert!(b.source.recv().await.is_none());
        assert!(matches!(
            a.sink.send(Bytes::from_static(b"late")).await,
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_recv_waits_for_message() {
        let (mut a, mut b) = pair(1);
        let mut recv = tokio_test::task::spawn(b.source.recv());
        tokio_test::assert_pending!(recv.poll());

        tokio_test::block_on(a.sink.send(Bytes::from_static(b"x"))).unwrap();
        assert!(recv.is_woken());
        let message = tokio_test::assert_ready!(recv.poll());
        assert_eq!(&message.unwrap().unwrap()[..], b"x");
    }

    #[tokio::test]
    async fn test_dropped_peer_fails_send() {
        let (mut a, b) = pair(4);
        drop(b);
        assert!(a.sink.send(Bytes::from_static(b"x")).await.is_err());
        assert!(a.source.recv().await.is_none());
    }
}
