//! In-memory FIFO of undelivered messages plus a bounded dead-letter list.
//!
//! Not thread-safe on its own; the outbox keeps it behind a mutex and never
//! holds that mutex across an await point.

use std::collections::VecDeque;

/// An undelivered request. `attempts` counts failed delivery attempts so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelivery {
    pub chat_id: String,
    pub text: String,
    pub attempts: u32,
}

impl PendingDelivery {
    pub fn new(chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            text: text.into(),
            attempts: 0,
        }
    }
}

/// A delivery that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub delivery: PendingDelivery,
    pub reason: String,
}

pub struct DeliveryQueue {
    pending: VecDeque<PendingDelivery>,
    dead: VecDeque<DeadLetter>,
    dead_capacity: usize,
}

impl DeliveryQueue {
    pub fn new(dead_capacity: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            dead: VecDeque::new(),
            dead_capacity: dead_capacity.max(1),
        }
    }

    pub fn push(&mut self, delivery: PendingDelivery) {
        self.pending.push_back(delivery);
    }

    /// Put a delivery back at the head, ahead of everything queued after it.
    pub fn push_front(&mut self, delivery: PendingDelivery) {
        self.pending.push_front(delivery);
    }

    pub fn pop(&mut self) -> Option<PendingDelivery> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn snapshot(&self) -> Vec<PendingDelivery> {
        self.pending.iter().cloned().collect()
    }

    /// Record a dead letter, evicting the oldest one past capacity.
    /// Returns the evicted letter, if any.
    pub fn bury(&mut self, letter: DeadLetter) -> Option<DeadLetter> {
        let evicted = if self.dead.len() >= self.dead_capacity {
            self.dead.pop_front()
        } else {
            None
        };
        self.dead.push_back(letter);
        evicted
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead.iter().cloned().collect()
    }
}
