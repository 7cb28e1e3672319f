//! In-process paired transport, used by tests and examples.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::transport::{CloseMode, MessageTransport};

const CHANNEL_CAPACITY: usize = 64;

/// One end of an in-memory connected pair.
#[derive(Clone, Debug)]
pub struct MemTransport {
    inner: Arc<MemInner>,
}

#[derive(Debug)]
struct MemInner {
    // `None` once the send half is closed; dropping the sender is what the
    // peer observes as end-of-stream.
    tx: parking_lot::Mutex<Option<mpsc::Sender<Bytes>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    closed: AtomicBool,
}

impl MemTransport {
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);

        let a = Self {
            inner: Arc::new(MemInner {
                tx: parking_lot::Mutex::new(Some(tx_b)),
                rx: tokio::sync::Mutex::new(rx_a),
                closed: AtomicBool::new(false),
            }),
        };
        let b = Self {
            inner: Arc::new(MemInner {
                tx: parking_lot::Mutex::new(Some(tx_a)),
                rx: tokio::sync::Mutex::new(rx_b),
                closed: AtomicBool::new(false),
            }),
        };
        (a, b)
    }
}

impl MessageTransport for MemTransport {
    async fn send_message(&self, msg: Bytes) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let tx = self
            .inner
            .tx
            .lock()
            .clone()
            .ok_or(TransportError::Closed)?;
        tx.send(msg).await.map_err(|_| TransportError::Closed)
    }

    async fn recv_message(&self) -> Result<Option<Bytes>, TransportError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let msg = {
            let mut rx = self.inner.rx.lock().await;
            rx.recv().await
        };
        Ok(msg)
    }

    async fn close(&self, mode: CloseMode) -> Result<(), TransportError> {
        match mode {
            CloseMode::Full => {
                self.inner.closed.store(true, Ordering::Release);
                *self.inner.tx.lock() = None;
            }
            CloseMode::SendHalf => {
                *self.inner.tx.lock() = None;
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_cross_the_pair_in_order() {
        let (a, b) = MemTransport::pair();
        a.send_message(Bytes::from_static(b"one")).await.expect("send");
        a.send_message(Bytes::from_static(b"two")).await.expect("send");
        assert_eq!(b.recv_message().await.expect("recv").expect("msg"), "one");
        assert_eq!(b.recv_message().await.expect("recv").expect("msg"), "two");
    }

    #[tokio::test]
    async fn half_close_delivers_buffered_then_eos() {
        let (a, b) = MemTransport::pair();
        a.send_message(Bytes::from_static(b"last")).await.expect("send");
        a.close(CloseMode::SendHalf).await.expect("close");
        assert_eq!(b.recv_message().await.expect("recv").expect("msg"), "last");
        assert_eq!(b.recv_message().await.expect("recv"), None);
        // The other direction still works.
        b.send_message(Bytes::from_static(b"reply")).await.expect("send");
        assert_eq!(a.recv_message().await.expect("recv").expect("msg"), "reply");
    }

    #[tokio::test]
    async fn full_close_fails_local_operations() {
        let (a, b) = MemTransport::pair();
        a.close(CloseMode::Full).await.expect("close");
        assert!(a.is_closed());
        assert!(matches!(
            a.send_message(Bytes::from_static(b"x")).await,
            Err(TransportError::Closed)
        ));
        assert_eq!(b.recv_message().await.expect("recv"), None);
    }
}
