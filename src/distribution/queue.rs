//! Bounded single-producer single-consumer round queue with drop-oldest
//! overflow.
//!
//! `tokio::sync::mpsc` can only reject the newest item when full. Consumers
//! here want the most recent rounds, so items live in a crossbeam
//! `ArrayQueue` whose `force_push` evicts the oldest entry, with a `Notify`
//! waking the async receiver.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use tokio::sync::Notify;

use crate::acquisition::SharedRound;

/// Result of pushing one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    /// Queued without loss.
    Delivered,
    /// Queued after evicting the oldest waiting round.
    DisplacedOldest,
    /// The receiver is gone; nothing was queued.
    Disconnected,
}

#[derive(Debug)]
pub(crate) struct SinkQueue {
    items: ArrayQueue<SharedRound>,
    closed: AtomicBool,
    receiver_alive: AtomicBool,
    notify: Notify,
    delivered: AtomicU64,
}

impl SinkQueue {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            items: ArrayQueue::new(capacity.max(1)),
            closed: AtomicBool::new(false),
            receiver_alive: AtomicBool::new(true),
            notify: Notify::new(),
            delivered: AtomicU64::new(0),
        })
    }

    pub(crate) fn push(&self, round: SharedRound) -> PushOutcome {
        if !self.receiver_alive.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire) {
            return PushOutcome::Disconnected;
        }
        let outcome = match self.items.force_push(round) {
            Some(_evicted) => PushOutcome::DisplacedOldest,
            None => PushOutcome::Delivered,
        };
        self.notify.notify_one();
        outcome
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.items.capacity()
    }

    pub(crate) fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn pop(&self) -> Popped {
        let round = match self.items.pop() {
            Some(round) => round,
            None if self.is_closed() => match self.items.pop() {
                // A push may land between the first pop and the close check.
                Some(round) => round,
                None => return Popped::Closed,
            },
            None => return Popped::Empty,
        };
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Popped::Round(round)
    }

    fn disconnect(&self) {
        self.receiver_alive.store(false, Ordering::Release);
        while self.items.pop().is_some() {}
    }
}

enum Popped {
    Round(SharedRound),
    Empty,
    Closed,
}

/// Receiving end of one sink's queue.
///
/// Dropping the receiver disconnects the sink; the distributor removes it on
/// the next publish.
#[derive(Debug)]
pub struct SinkReceiver {
    queue: Arc<SinkQueue>,
}

impl SinkReceiver {
    pub(crate) fn new(queue: Arc<SinkQueue>) -> Self {
        Self { queue }
    }

    /// Wait for the next round.
    ///
    /// Returns `None` once the distributor has shut down and the queue is
    /// drained.
    pub async fn recv(&mut self) -> Option<SharedRound> {
        loop {
            let notified = self.queue.notify.notified();
            match self.queue.pop() {
                Popped::Round(round) => return Some(round),
                Popped::Closed => return None,
                Popped::Empty => notified.await,
            }
        }
    }

    /// Take the next round if one is waiting.
    pub fn try_recv(&self) -> Option<SharedRound> {
        match self.queue.pop() {
            Popped::Round(round) => Some(round),
            Popped::Empty | Popped::Closed => None,
        }
    }

    /// Rounds currently waiting.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if no round is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the distributor has closed this queue.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

impl Drop for SinkReceiver {
    fn drop(&mut self) {
        self.queue.disconnect();
    }
}
