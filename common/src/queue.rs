//! Bounded FIFO queues linking producers and consumers to logical streams.
//!
//! A full queue suspends the producer; nothing is ever dropped. After
//! [`Queue::close`] producers get [`Error::QueueClosed`] while consumers may
//! still drain whatever was already queued.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::{config::DEFAULT_QUEUE_CAPACITY, error::Error};

/// Queue feeding a stream's send loop
pub type OutboundQueue<T> = Queue<T>;

/// Queue filled by a stream's receive loop
pub type InboundQueue<T> = Queue<T>;

/// Cloneable handle to a bounded FIFO queue
pub struct Queue<T> {
    tx:     mpsc::Sender<T>,
    rx:     Arc<Mutex<mpsc::Receiver<T>>>,
    closed: CancellationToken,
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            tx:     self.tx.clone(),
            rx:     Arc::clone(&self.rx),
            closed: self.closed.clone(),
        }
    }
}

impl<T: Send> Queue<T> {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            closed: CancellationToken::new(),
        }
    }

    /// Appends an item, waiting while the queue is full
    pub async fn push(&self, item: T) -> Result<(), Error> {
        if self.closed.is_cancelled() {
            return Err(Error::QueueClosed);
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::QueueClosed),
            sent = self.tx.send(item) => sent.map_err(|_| Error::QueueClosed),
        }
    }

    /// Appends an item if there is room right now
    pub fn try_push(&self, item: T) -> Result<bool, Error> {
        if self.closed.is_cancelled() {
            return Err(Error::QueueClosed);
        }
        match self.tx.try_send(item) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::QueueClosed),
        }
    }

    /// Takes the oldest item, waiting until one arrives.
    ///
    /// Returns `None` once the queue is closed and drained. Cancel safe.
    pub async fn pop(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            item = rx.recv() => item,
            _ = self.closed.cancelled() => rx.try_recv().ok(),
        }
    }

    /// Takes the oldest item if one is ready and no other consumer is active
    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

impl<T: Send> Default for Queue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn preserves_insertion_order() {
        let queue = Queue::new(8);
        for i in 0..8 {
            queue.push(i).await.unwrap();
        }
        assert_eq!(queue.len(), 8);

        let mut drained = Vec::new();
        for _ in 0..8 {
            drained.push(queue.pop().await.unwrap());
        }
        assert_eq!(drained, (0..8).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_blocks_producer() {
        let queue = Queue::new(1);
        queue.push("first").await.unwrap();
        assert!(!queue.try_push("extra").unwrap());

        let blocked = tokio::time::timeout(Duration::from_secs(1), queue.push("second")).await;
        assert!(blocked.is_err(), "push into a full queue must wait");

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push("second").await })
        };
        assert_eq!(queue.pop().await, Some("first"));
        producer.await.unwrap().unwrap();
        assert_eq!(queue.pop().await, Some("second"));
    }

    #[tokio::test]
    async fn push_after_close_fails_fast() {
        let queue = Queue::new(4);
        queue.push(1).await.unwrap();
        queue.close();

        assert!(matches!(queue.push(2).await, Err(Error::QueueClosed)));
        assert!(matches!(queue.try_push(2), Err(Error::QueueClosed)));
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn close_wakes_waiting_consumer() {
        let queue: Queue<u32> = Queue::new(4);
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert_eq!(consumer.await.unwrap(), None);
    }
}
