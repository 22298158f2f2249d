//! Callback Registry
//!
//! Pending "wake me when data after T arrives" registrations for one `MessageBuffer`.
//!
//! ## Dispatch
//!
//! After every successful write the buffer calls `dispatch`:
//!
//! 1. Swap the pending list out under the lock (registrations made during dispatch
//!    land in a fresh list)
//! 2. Outside the lock, open a read for each waiter's resume timestamp
//! 3. Deliver the iterator, or re-register the waiter if nothing is visible yet
//!
//! Re-registration happens while the read guard is held, so a concurrent write either
//! is visible to the read or dispatches to the re-registered waiter.

use std::sync::{Mutex, MutexGuard};

use feedhouse_core::Timestamp;

use crate::buffer::{BufferIter, MessageBuffer};

/// Consumer of a buffer read; runs once
pub type BufferCallback = Box<dyn FnOnce(BufferIter) + Send + 'static>;

struct Waiter {
    from: Timestamp,
    callback: BufferCallback,
}

#[derive(Default)]
pub struct CallbackRegistry {
    waiters: Mutex<Vec<Waiter>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for messages strictly after `from`
    pub fn register(&self, from: Timestamp, callback: BufferCallback) {
        self.lock().push(Waiter { from, callback });
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub(crate) async fn dispatch(&self, buffer: &MessageBuffer) {
        let waiters = std::mem::take(&mut *self.lock());
        if waiters.is_empty() {
            return;
        }

        tracing::trace!(waiters = waiters.len(), "Dispatching buffer callbacks");

        for waiter in waiters {
            let mut iter = buffer.messages_after(waiter.from).await;
            if iter.is_exhausted() {
                self.register(waiter.from, waiter.callback);
            } else {
                (waiter.callback)(iter);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Waiter>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;
    use crate::pool::BufferPool;
    use feedhouse_core::{Message, MessageClock};
    use std::sync::Arc;
    use tokio::sync::oneshot;

    fn buffer() -> Arc<MessageBuffer> {
        let pool = Arc::new(BufferPool::new(BufferConfig::default()));
        MessageBuffer::new(pool, Arc::new(MessageClock::new()))
    }

    fn message(id: &str) -> Message {
        Message::new(format!("/f/~~{id}").parse().unwrap(), id.to_string())
    }

    #[tokio::test]
    async fn test_waiter_ahead_of_write_is_reregistered() {
        let buffer = buffer();
        let first = buffer.add_message(message("a")).await.unwrap();

        let (tx, rx) = oneshot::channel();
        buffer.callbacks().register(
            first.timestamp,
            Box::new(move |iter: BufferIter| {
                let _ = tx.send(iter.count());
            }),
        );

        // Dispatch finds nothing after the resume point: waiter stays registered
        buffer.callbacks().dispatch(&buffer).await;
        assert_eq!(buffer.callbacks().len(), 1);

        buffer.add_message(message("b")).await.unwrap();

        let delivered = rx.await.unwrap();
        assert_eq!(delivered, 1);
        assert!(buffer.callbacks().is_empty());
    }

    #[tokio::test]
    async fn test_each_waiter_runs_once() {
        let buffer = buffer();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        for _ in 0..3 {
            let tx = tx.clone();
            buffer.callbacks().register(
                Timestamp::EPOCH,
                Box::new(move |iter: BufferIter| {
                    let _ = tx.send(iter.count());
                }),
            );
        }
        drop(tx);

        buffer.add_message(message("a")).await.unwrap();
        buffer.add_message(message("b")).await.unwrap();

        let mut counts = Vec::new();
        while let Some(count) = rx.recv().await {
            counts.push(count);
        }
        assert_eq!(counts, vec![1, 1, 1]);
    }
}
