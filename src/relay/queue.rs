use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

/// Outcome of pushing a packet onto a [`PacketQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Queued,
    /// The queue stayed full; the packet was discarded.
    Dropped,
    Closed,
}

/// Returned by [`PacketQueue::pop_timeout`] once the queue is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("packet queue is closed")]
pub struct Closed;

/// Bounded multi-producer, multi-consumer FIFO of byte buffers.
///
/// Pushing never waits longer than the caller allows and popping returns
/// `Ok(None)` on timeout, so loops built on it can re-check their own exit
/// condition at a bounded interval.
pub struct PacketQueue {
    capacity: usize,
    state: Mutex<State>,
    readable: Notify,
    writable: Notify,
}

struct State {
    packets: VecDeque<Bytes>,
    closed: bool,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(State {
                packets: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Append `packet` if there is room, otherwise drop it.
    pub fn try_push(&self, packet: Bytes) -> Push {
        let mut state = self.lock();
        if state.closed {
            return Push::Closed;
        }
        if state.packets.len() >= self.capacity {
            return Push::Dropped;
        }
        state.packets.push_back(packet);
        drop(state);

        self.readable.notify_one();
        Push::Queued
    }

    /// Append `packet`, waiting up to `wait` for room before dropping it.
    pub async fn push_timeout(&self, packet: Bytes, wait: Duration) -> Push {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return Push::Closed;
                }
                if state.packets.len() < self.capacity {
                    state.packets.push_back(packet);
                    drop(state);
                    self.readable.notify_one();
                    return Push::Queued;
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Push::Dropped;
            }
        }
    }

    /// Remove the head of the queue, waiting up to `wait` for one to arrive.
    pub async fn pop_timeout(&self, wait: Duration) -> Result<Option<Bytes>, Closed> {
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return Err(Closed);
                }
                if let Some(packet) = state.packets.pop_front() {
                    drop(state);
                    self.writable.notify_one();
                    return Ok(Some(packet));
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Close the queue, discarding anything still buffered and waking every
    /// waiter. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        state.packets.clear();
        drop(state);

        self.readable.notify_waiters();
        self.writable.notify_waiters();
        true
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
