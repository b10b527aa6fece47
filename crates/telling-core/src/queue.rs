//! Send and receive queues shared by every driver (spec §4.3).
//!
//! `SendQueue` is single-flight: at most one item is "in the AIO" at
//! a time, tracked by a `busy` bit, so producers can pipeline without
//! the queue growing past what's actually outstanding with the
//! transport. `RecvQueue` is a plain FIFO; nothing about receiving
//! needs the single-flight discipline since each arrival is already
//! its own unit of work.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Single-flight outbound queue: `produce` enqueues and, if nothing
/// is currently being sent, hands the item straight back so the
/// caller can start sending it immediately. `consume` is called once
/// a send completes, and returns the next item to send (if any),
/// leaving `busy` set only when it does.
pub struct SendQueue<T> {
    inner: Mutex<SendQueueState<T>>,
}

struct SendQueueState<T> {
    pending: VecDeque<T>,
    busy: bool,
}

/// Outcome of [`SendQueue::produce`].
pub enum Produced<T> {
    /// Nothing else was in flight; the caller must start sending `T`
    /// itself.
    StartSending(T),
    /// Something else was already in flight; `T` was queued.
    Queued,
}

impl<T> SendQueue<T> {
    pub fn new() -> Self {
        SendQueue { inner: Mutex::new(SendQueueState { pending: VecDeque::new(), busy: false }) }
    }

    pub fn produce(&self, item: T) -> Produced<T> {
        let mut state = self.inner.lock().unwrap();
        if state.busy {
            state.pending.push_back(item);
            Produced::Queued
        } else {
            state.busy = true;
            Produced::StartSending(item)
        }
    }

    /// Called once the in-flight send finishes. Returns the next item
    /// to send, if the queue is non-empty; otherwise clears `busy` and
    /// returns `None`.
    pub fn consume(&self) -> Option<T> {
        let mut state = self.inner.lock().unwrap();
        match state.pending.pop_front() {
            Some(item) => Some(item),
            None => {
                state.busy = false;
                None
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.inner.lock().unwrap().busy
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for SendQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Plain mutex-guarded FIFO for inbound items awaiting a consumer.
/// Pairs the FIFO with a [`tokio::sync::Notify`] so `recv` can park a
/// caller until an item arrives instead of the caller having to poll
/// [`RecvQueue::pull`] itself; this is what `Pull` and `Subscribe`
/// hand an `AsyncRecv::on_recv` callback's arrivals into, so `recv`
/// can be awaited from the communicator's public API.
pub struct RecvQueue<T> {
    inner: Mutex<VecDeque<T>>,
    notify: tokio::sync::Notify,
    closed: std::sync::atomic::AtomicBool,
}

impl<T> RecvQueue<T> {
    pub fn new() -> Self {
        RecvQueue {
            inner: Mutex::new(VecDeque::new()),
            notify: tokio::sync::Notify::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn push(&self, item: T) {
        self.inner.lock().unwrap().push_back(item);
        self.notify.notify_one();
    }

    pub fn pull(&self) -> Option<T> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Mark the queue closed: queued items already waiting to be
    /// pulled are still delivered, but once drained, `recv` returns
    /// `None` forever instead of parking. Called once a driver's
    /// recv-loop stops (peer disconnect or fatal error).
    pub fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::Release);
        self.notify.notify_one();
    }

    /// Wait for and return the next item, pulling immediately if one
    /// is already queued; returns `None` once the queue is both
    /// closed and empty.
    pub async fn recv(&self) -> Option<T> {
        loop {
            if let Some(item) = self.pull() {
                return Some(item);
            }
            if self.closed.load(std::sync::atomic::Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

impl<T> Default for RecvQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn first_produce_starts_sending_immediately() {
        let q: SendQueue<i32> = SendQueue::new();
        match q.produce(1) {
            Produced::StartSending(v) => assert_eq!(v, 1),
            Produced::Queued => panic!("first produce should start sending"),
        }
        assert!(q.is_busy());
    }

    #[test]
    fn subsequent_produce_while_busy_is_queued_then_drained_by_consume() {
        let q: SendQueue<i32> = SendQueue::new();
        let _ = q.produce(1);
        match q.produce(2) {
            Produced::Queued => {}
            Produced::StartSending(_) => panic!("second produce should queue while busy"),
        }
        assert_eq!(q.consume(), Some(2));
        assert_eq!(q.consume(), None);
        assert!(!q.is_busy());
    }

    #[test]
    fn recv_queue_is_fifo() {
        let q: RecvQueue<i32> = RecvQueue::new();
        q.push(1);
        q.push(2);
        assert_eq!(q.pull(), Some(1));
        assert_eq!(q.pull(), Some(2));
        assert_eq!(q.pull(), None);
    }

    #[tokio::test]
    async fn recv_waits_for_a_push_that_hasnt_happened_yet() {
        let q: Arc<RecvQueue<i32>> = Arc::new(RecvQueue::new());
        let waiter = q.clone();
        let handle = tokio::spawn(async move { waiter.recv().await });
        tokio::task::yield_now().await;
        q.push(42);
        assert_eq!(handle.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn recv_returns_none_once_closed_and_drained() {
        let q: RecvQueue<i32> = RecvQueue::new();
        q.push(1);
        q.close();
        assert_eq!(q.recv().await, Some(1));
        assert_eq!(q.recv().await, None);
    }
}
