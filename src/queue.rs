//! Bounded, overwrite-oldest queues handed to consumers.
//!
//! Producers never block: pushing into a full queue discards the oldest entry first.
//! Consumers pull with [`OverwriteQueue::pop`], which waits for an entry and reports
//! [`QueueClosed`] once the queue has been closed and drained.

use std::sync::Mutex;

use ringbuffer::{AllocRingBuffer, RingBuffer, RingBufferExt, RingBufferRead, RingBufferWrite};
use tokio::sync::Notify;

use crate::errors::QueueClosed;

pub struct OverwriteQueue<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

struct QueueState<T> {
    items: AllocRingBuffer<T>,
    closed: bool,
}

impl<T> OverwriteQueue<T> {
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        // AllocRingBuffer wants a power-of-two backing store; the logical capacity is
        // enforced in `push`.
        let backing = capacity.next_power_of_two().max(2);
        Self {
            capacity,
            state: Mutex::new(QueueState {
                items: AllocRingBuffer::with_capacity(backing),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Inserts `item`, evicting the oldest entry when full. Returns the evicted entry.
    /// Items pushed after [`close`](Self::close) are dropped.
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = {
            let mut state = self.lock();
            if state.closed {
                return None;
            }
            let evicted = if state.items.len() >= self.capacity {
                state.items.dequeue()
            } else {
                None
            };
            state.items.push(item);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    /// Waits for the next entry in insertion order.
    pub async fn pop(&self) -> Result<T, QueueClosed> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(item) = state.items.dequeue() {
                    return Ok(item);
                }
                if state.closed {
                    return Err(QueueClosed);
                }
            }
            notified.await;
        }
    }

    /// Non-blocking pop. `Ok(None)` means the queue is open but empty.
    pub fn try_pop(&self) -> Result<Option<T>, QueueClosed> {
        let mut state = self.lock();
        match state.items.dequeue() {
            Some(item) => Ok(Some(item)),
            None if state.closed => Err(QueueClosed),
            None => Ok(None),
        }
    }

    /// Removes and returns every queued entry, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.lock();
        let mut out = Vec::with_capacity(state.items.len());
        while let Some(item) = state.items.dequeue() {
            out.push(item);
        }
        out
    }

    /// Marks the queue closed and wakes every waiting consumer. Entries already queued
    /// can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState<T>> {
        // The state is always left consistent, so a poisoned lock is still usable.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Clone> OverwriteQueue<T> {
    /// Copies the queued entries without consuming them, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.lock().items.iter().cloned().collect()
    }
}
