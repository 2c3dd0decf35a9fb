// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 jobfab contributors

//! The shared message inbox.
//!
//! I/O threads (one per peer socket) produce [`Message`]s; exactly one
//! dispatch thread consumes them. The queue is a plain FIFO behind a
//! mutex with a condvar for the idle wait and an atomic flag for
//! out-of-band wakes (peer errors), so producers never block on a
//! sleeping consumer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// One fully received, framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Rank of the peer the bytes came from.
    pub source_rank: usize,
    /// The exact byte sequence the sender framed. Byte 0 is the packet
    /// kind.
    pub bytes: Vec<u8>,
}

impl Message {
    /// Packet kind, when the payload is non-empty.
    pub fn kind(&self) -> Option<u8> {
        self.bytes.first().copied()
    }

    /// Control sub-kind (byte 1), when present.
    pub fn sub_kind(&self) -> Option<u8> {
        self.bytes.get(1).copied()
    }
}

/// Outcome of one blocking pop.
#[derive(Debug, PartialEq, Eq)]
pub enum PopOutcome {
    /// Head of the queue.
    Message(Message),
    /// Woken by [`Inbox::interrupt`] with nothing queued - the caller
    /// should service whatever raised the interrupt and retry.
    Interrupted,
    /// Deadline passed with nothing queued.
    TimedOut,
}

/// FIFO inbox shared between the socket reader threads and the dispatch
/// thread.
#[derive(Debug, Default)]
pub struct Inbox {
    queue: Mutex<VecDeque<Message>>,
    available: Condvar,
    interrupted: AtomicBool,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one message and wake the dispatch thread.
    pub fn push(&self, msg: Message) {
        self.queue.lock().push_back(msg);
        self.available.notify_one();
    }

    /// Reinsert messages at the queue head, preserving their order.
    ///
    /// Used when a grouped envelope is expanded: its sub-messages must
    /// land exactly where the envelope sat, ahead of everything queued
    /// after it.
    pub fn push_front_all(&self, msgs: Vec<Message>) {
        let mut queue = self.queue.lock();
        for msg in msgs.into_iter().rev() {
            queue.push_front(msg);
        }
    }

    /// Wake a blocked [`pop_until`](Self::pop_until) without queueing a
    /// message. Used by I/O threads after recording a peer error.
    pub fn interrupt(&self) {
        // The store must happen under the queue lock: the consumer checks
        // the flag and starts waiting while holding it, so storing
        // lock-free could slip between its check and its wait and the
        // notify would be lost until the timeout.
        let guard = self.queue.lock();
        self.interrupted.store(true, Ordering::Release);
        drop(guard);
        self.available.notify_one();
    }

    /// Number of queued messages right now.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Block until a message, an interrupt, or the deadline - whichever
    /// comes first. Interrupts win over queued messages so peer errors
    /// are serviced promptly.
    pub fn pop_until(&self, deadline: Instant) -> PopOutcome {
        let mut queue = self.queue.lock();
        loop {
            if self.interrupted.swap(false, Ordering::AcqRel) {
                return PopOutcome::Interrupted;
            }
            if let Some(msg) = queue.pop_front() {
                return PopOutcome::Message(msg);
            }
            if self.available.wait_until(&mut queue, deadline).timed_out() {
                // One last look: a producer may have slipped in between
                // the timeout firing and us reacquiring the lock.
                if self.interrupted.swap(false, Ordering::AcqRel) {
                    return PopOutcome::Interrupted;
                }
                return match queue.pop_front() {
                    Some(msg) => PopOutcome::Message(msg),
                    None => PopOutcome::TimedOut,
                };
            }
        }
    }

    /// Drop everything still queued (teardown).
    pub fn clear(&self) {
        self.queue.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn msg(rank: usize, bytes: &[u8]) -> Message {
        Message {
            source_rank: rank,
            bytes: bytes.to_vec(),
        }
    }

    fn deadline_in(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn fifo_order() {
        let inbox = Inbox::new();
        inbox.push(msg(1, b"a"));
        inbox.push(msg(2, b"b"));

        assert_eq!(inbox.pop_until(deadline_in(10)), PopOutcome::Message(msg(1, b"a")));
        assert_eq!(inbox.pop_until(deadline_in(10)), PopOutcome::Message(msg(2, b"b")));
    }

    #[test]
    fn front_push_lands_ahead_of_later_traffic() {
        let inbox = Inbox::new();
        inbox.push(msg(2, b"later"));
        inbox.push_front_all(vec![msg(1, b"sub1"), msg(1, b"sub2")]);

        assert_eq!(inbox.pop_until(deadline_in(10)), PopOutcome::Message(msg(1, b"sub1")));
        assert_eq!(inbox.pop_until(deadline_in(10)), PopOutcome::Message(msg(1, b"sub2")));
        assert_eq!(inbox.pop_until(deadline_in(10)), PopOutcome::Message(msg(2, b"later")));
    }

    #[test]
    fn empty_pop_times_out() {
        let inbox = Inbox::new();
        let start = Instant::now();
        assert_eq!(inbox.pop_until(deadline_in(30)), PopOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn push_wakes_a_blocked_consumer() {
        let inbox = Arc::new(Inbox::new());
        let producer = Arc::clone(&inbox);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(msg(3, b"late arrival"));
        });

        let outcome = inbox.pop_until(deadline_in(2000));
        assert_eq!(outcome, PopOutcome::Message(msg(3, b"late arrival")));
        handle.join().unwrap();
    }

    #[test]
    fn interrupt_wins_over_waiting() {
        let inbox = Arc::new(Inbox::new());
        let signaler = Arc::clone(&inbox);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaler.interrupt();
        });

        assert_eq!(inbox.pop_until(deadline_in(2000)), PopOutcome::Interrupted);
        handle.join().unwrap();
    }
}
