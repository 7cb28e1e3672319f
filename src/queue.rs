//! Single-waiter async FIFO.
//!
//! Each channel buffers its inbound messages here. The queue allows at most
//! one outstanding asynchronous dequeue; a second concurrent `pop` is a
//! caller error, reported explicitly rather than silently queued.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PopError {
    /// Another `pop` is already waiting.
    Busy,
    /// The queue was dropped while a waiter was parked.
    Disconnected,
}

#[derive(Debug)]
pub(crate) struct SingleWaiterQueue<T> {
    inner: Mutex<Inner<T>>,
}

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    waiter: Option<oneshot::Sender<T>>,
}

impl<T> SingleWaiterQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                waiter: None,
            }),
        }
    }

    /// Append an item, handing it directly to a parked waiter if one exists.
    pub fn push(&self, item: T) {
        let mut inner = self.inner.lock();
        if let Some(waiter) = inner.waiter.take() {
            // A cancelled pop leaves a dead sender behind; fall back to the
            // FIFO in that case.
            if let Err(item) = waiter.send(item) {
                inner.items.push_back(item);
            }
        } else {
            inner.items.push_back(item);
        }
    }

    /// Number of items currently buffered.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Dequeue the next item, suspending until one arrives.
    pub async fn pop(&self) -> Result<T, PopError> {
        let rx = {
            let mut inner = self.inner.lock();
            if let Some(item) = inner.items.pop_front() {
                return Ok(item);
            }
            if inner.waiter.as_ref().is_some_and(|w| !w.is_closed()) {
                return Err(PopError::Busy);
            }
            let (tx, rx) = oneshot::channel();
            inner.waiter = Some(tx);
            rx
        };
        rx.await.map_err(|_| PopError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn pop_preserves_fifo_order() {
        let q = SingleWaiterQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop().await, Ok(1));
        assert_eq!(q.pop().await, Ok(2));
        assert_eq!(q.pop().await, Ok(3));
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn push_wakes_parked_waiter() {
        let q = Arc::new(SingleWaiterQueue::new());
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.push(42);
        assert_eq!(waiter.await.expect("join"), Ok(42));
    }

    #[tokio::test]
    async fn second_concurrent_pop_is_rejected() {
        let q = Arc::new(SingleWaiterQueue::<u32>::new());
        let q2 = q.clone();
        let first = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(q.pop().await, Err(PopError::Busy));
        q.push(7);
        assert_eq!(first.await.expect("join"), Ok(7));
    }

    #[tokio::test]
    async fn cancelled_pop_releases_the_waiter_slot() {
        let q = Arc::new(SingleWaiterQueue::<u32>::new());
        {
            let q2 = q.clone();
            let task = tokio::spawn(async move { q2.pop().await });
            tokio::time::sleep(Duration::from_millis(10)).await;
            task.abort();
            let _ = task.await;
        }
        // The dead waiter must not make the queue unusable.
        q.push(9);
        assert_eq!(q.pop().await, Ok(9));
    }
}
