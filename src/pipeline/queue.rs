//! Bounded queues between network readers and decode workers
//!
//! `Block` applies backpressure: the reader waits for capacity.
//! `DropOldest` never waits: once the queue is full the oldest queued
//! packet is discarded and the worker is told how many it missed.

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::types::QueuePolicy;

/// The receiving side has gone away
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("decode queue closed")]
pub struct QueueClosed;

enum SenderInner<T> {
    Block(mpsc::Sender<T>),
    DropOldest(broadcast::Sender<T>),
}

enum ReceiverInner<T> {
    Block(mpsc::Receiver<T>),
    DropOldest(broadcast::Receiver<T>),
}

/// Producer half of a decode queue
pub struct PacketSender<T> {
    inner: SenderInner<T>,
}

/// Consumer half of a decode queue
pub struct PacketReceiver<T> {
    inner: ReceiverInner<T>,
    dropped: u64,
}

/// Create a bounded queue with the given overflow policy
#[must_use]
pub fn bounded<T: Clone>(capacity: usize, policy: QueuePolicy) -> (PacketSender<T>, PacketReceiver<T>) {
    let capacity = capacity.max(1);
    let (inner_tx, inner_rx) = match policy {
        QueuePolicy::Block => {
            let (tx, rx) = mpsc::channel(capacity);
            (SenderInner::Block(tx), ReceiverInner::Block(rx))
        }
        QueuePolicy::DropOldest => {
            let (tx, rx) = broadcast::channel(capacity);
            (SenderInner::DropOldest(tx), ReceiverInner::DropOldest(rx))
        }
    };
    (
        PacketSender { inner: inner_tx },
        PacketReceiver {
            inner: inner_rx,
            dropped: 0,
        },
    )
}

impl<T> PacketSender<T> {
    /// Queue one item, waiting for capacity under `Block`
    ///
    /// # Errors
    ///
    /// Returns `QueueClosed` once the receiver is dropped.
    pub async fn send(&self, item: T) -> Result<(), QueueClosed> {
        match &self.inner {
            SenderInner::Block(tx) => tx.send(item).await.map_err(|_| QueueClosed),
            SenderInner::DropOldest(tx) => tx.send(item).map(|_| ()).map_err(|_| QueueClosed),
        }
    }
}

impl<T: Clone> PacketReceiver<T> {
    /// Wait for the next item from a non-async thread
    ///
    /// Returns `None` once every sender is dropped and the queue is empty.
    /// Must not be called from inside a Tokio runtime.
    pub fn blocking_recv(&mut self) -> Option<T> {
        match &mut self.inner {
            ReceiverInner::Block(rx) => rx.blocking_recv(),
            ReceiverInner::DropOldest(rx) => loop {
                match rx.blocking_recv() {
                    Ok(item) => return Some(item),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        self.dropped += n;
                        tracing::debug!(dropped = n, "Decode queue overflow, dropped oldest");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }

    /// Async receive, for use on the runtime
    pub async fn recv(&mut self) -> Option<T> {
        match &mut self.inner {
            ReceiverInner::Block(rx) => rx.recv().await,
            ReceiverInner::DropOldest(rx) => loop {
                match rx.recv().await {
                    Ok(item) => return Some(item),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        self.dropped += n;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }

    /// Items discarded by `DropOldest` so far
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_block_preserves_everything() {
        let (tx, mut rx) = bounded::<u32>(2, QueuePolicy::Block);
        let producer = tokio::spawn(async move {
            for i in 0..5 {
                tx.send(i).await.unwrap();
            }
        });
        let mut got = Vec::new();
        while let Some(i) = rx.recv().await {
            got.push(i);
        }
        producer.await.unwrap();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
        assert_eq!(rx.dropped(), 0);
    }

    #[tokio::test]
    async fn test_drop_oldest_never_waits() {
        let (tx, mut rx) = bounded::<u32>(2, QueuePolicy::DropOldest);
        for i in 0..5 {
            tx.send(i).await.unwrap();
        }
        drop(tx);

        let mut got = Vec::new();
        while let Some(i) = rx.recv().await {
            got.push(i);
        }
        assert_eq!(got, vec![3, 4]);
        assert_eq!(rx.dropped(), 3);
    }

    #[test]
    fn test_blocking_recv_from_thread() {
        let (tx, mut rx) = bounded::<u32>(4, QueuePolicy::Block);
        let worker = std::thread::spawn(move || {
            let mut sum = 0;
            while let Some(i) = rx.blocking_recv() {
                sum += i;
            }
            sum
        });

        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async move {
            for i in 1..=10 {
                tx.send(i).await.unwrap();
            }
        });
        assert_eq!(worker.join().unwrap(), 55);
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped() {
        let (tx, rx) = bounded::<u32>(1, QueuePolicy::Block);
        drop(rx);
        assert_eq!(tx.send(1).await, Err(QueueClosed));
    }
}
