//! Per-peer outbound queues and the shared marshalling buffer pool.
//!
//! Protocol frames ride a lossless bounded FIFO — a full queue fails the
//! push and the frame is dropped at the sender with a counter bump.
//! Traffic frames ride a bounded LIFO ring: a push into a full ring evicts
//! the oldest frame, so under overload the freshest traffic wins.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::wire::{Frame, MAX_FRAME_SIZE};

/// Default capacity of each outbound queue.
pub const QUEUE_CAPACITY: usize = 64;

/// Lossless bounded FIFO for protocol frames.
pub(crate) struct FifoQueue {
    inner: Mutex<VecDeque<Frame>>,
    capacity: usize,
    notify: Notify,
}

impl FifoQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Returns false (and leaves the queue untouched) when full.
    pub fn push(&self, frame: Frame) -> bool {
        let mut queue = self.inner.lock().unwrap();
        if queue.len() >= self.capacity {
            return false;
        }
        queue.push_back(frame);
        drop(queue);
        self.notify.notify_one();
        true
    }

    pub fn pop(&self) -> Option<Frame> {
        self.inner.lock().unwrap().pop_front()
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// Bounded LIFO ring for traffic frames: newest out first, oldest evicted
/// on overflow.
pub(crate) struct LifoQueue {
    inner: Mutex<VecDeque<Frame>>,
    capacity: usize,
    notify: Notify,
}

impl LifoQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Push always succeeds; returns true if an older frame was evicted to
    /// make room.
    pub fn push(&self, frame: Frame) -> bool {
        let mut queue = self.inner.lock().unwrap();
        let evicted = if queue.len() >= self.capacity {
            queue.pop_front();
            true
        } else {
            false
        };
        queue.push_back(frame);
        drop(queue);
        self.notify.notify_one();
        evicted
    }

    /// Pop the most recently pushed frame.
    pub fn pop(&self) -> Option<Frame> {
        self.inner.lock().unwrap().pop_back()
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// Free list of marshal buffers shared by all peer writers.
///
/// Never blocks: an empty pool allocates fresh, and the pool holds at most
/// `max_pooled` returned buffers.
pub(crate) struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(max_pooled: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
        }
    }

    pub fn acquire(&self) -> Vec<u8> {
        if let Some(buf) = self.buffers.lock().unwrap().pop() {
            return buf;
        }
        vec![0u8; MAX_FRAME_SIZE]
    }

    pub fn release(&self, buf: Vec<u8>) {
        if buf.len() != MAX_FRAME_SIZE {
            return;
        }
        let mut pool = self.buffers.lock().unwrap();
        if pool.len() < self.max_pooled {
            pool.push(buf);
        }
    }
}
