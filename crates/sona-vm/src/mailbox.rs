//! Per-process message mailboxes
//!
//! A mailbox is an unbounded FIFO of envelopes owned by the receiving
//! process. Any thread may enqueue; only the owner dequeues. Messages from
//! one sender arrive in send order because each send completes its enqueue
//! atomically; no order is guaranteed between distinct senders.

use crate::message::Envelope;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// The FIFO of messages waiting for a process
pub struct Mailbox {
    messages: Mutex<VecDeque<Envelope>>,
}

impl Mailbox {
    /// Create an empty mailbox
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(VecDeque::new()),
        }
    }

    /// Enqueue a message; callable from any thread
    pub fn send(&self, message: Envelope) {
        self.messages.lock().push_back(message);
    }

    /// Dequeue the oldest message; called only by the owning process
    pub fn receive(&self) -> Option<Envelope> {
        self.messages.lock().pop_front()
    }

    /// The number of queued messages
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    /// Whether the mailbox is empty
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}
