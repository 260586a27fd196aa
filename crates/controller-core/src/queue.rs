//! Rate-limited event queue.
//!
//! Holds typed change notifications keyed by object key. Repeated enqueues
//! of the same key are delayed with per-key Fibonacci backoff and collapsed
//! into a single pending item whose payload is the most recent one; a
//! successful handler pass calls [`EventQueue::forget`] to reset the key's
//! backoff.

use crate::backoff::FibonacciBackoff;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, hash_map::Entry};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Default per-key backoff floor: a fresh key is dispatched near-immediately.
const BASE_DELAY: Duration = Duration::from_millis(5);
/// Default per-key backoff ceiling.
const MAX_DELAY: Duration = Duration::from_secs(10);

/// A change notification for an object of type `T`.
///
/// Closed union: worker dispatch is a total match, a malformed item is
/// unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<T> {
    Added(T),
    Updated(T),
    Deleted(T),
}

impl<T> Event<T> {
    /// The object carried by the event.
    pub fn object(&self) -> &T {
        match self {
            Event::Added(obj) | Event::Updated(obj) | Event::Deleted(obj) => obj,
        }
    }
}

/// The unit of work placed on the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem<T> {
    pub key: String,
    pub event: Event<T>,
}

impl<T> WorkItem<T> {
    pub fn new(key: impl Into<String>, event: Event<T>) -> Self {
        Self {
            key: key.into(),
            event,
        }
    }
}

struct PendingItem<T> {
    item: WorkItem<T>,
    ready_at: Instant,
    seq: u64,
}

/// Heap entry; stale entries (seq no longer pending) are skipped on pop.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Scheduled {
    ready_at: Instant,
    seq: u64,
    key: String,
}

struct QueueState<T> {
    pending: HashMap<String, PendingItem<T>>,
    schedule: BinaryHeap<Reverse<Scheduled>>,
    limiters: HashMap<String, FibonacciBackoff>,
    next_seq: u64,
    shutdown: bool,
}

enum Next<T> {
    Item(WorkItem<T>),
    Wait(Duration),
    Idle,
    Closed,
}

/// Rate-limited, delay-capable work queue.
pub struct EventQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        Self::with_backoff(BASE_DELAY, MAX_DELAY)
    }

    pub fn with_backoff(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: HashMap::new(),
                schedule: BinaryHeap::new(),
                limiters: HashMap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            notify: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds an item, rate-limited per key. If the key is already pending the
    /// payload is replaced (most recent object wins) without extending its
    /// ready time.
    pub fn enqueue(&self, item: WorkItem<T>) {
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            if state.shutdown {
                return;
            }
            let delay = state
                .limiters
                .entry(item.key.clone())
                .or_insert_with(|| FibonacciBackoff::new(self.base_delay, self.max_delay))
                .next_delay();
            match state.pending.entry(item.key.clone()) {
                Entry::Occupied(mut existing) => {
                    existing.get_mut().item = item;
                }
                Entry::Vacant(slot) => {
                    state.next_seq += 1;
                    let scheduled = Scheduled {
                        ready_at: Instant::now() + delay,
                        seq: state.next_seq,
                        key: item.key.clone(),
                    };
                    slot.insert(PendingItem {
                        item,
                        ready_at: scheduled.ready_at,
                        seq: scheduled.seq,
                    });
                    state.schedule.push(Reverse(scheduled));
                }
            }
        }
        self.notify.notify_waiters();
    }

    /// Resets the key's backoff after a fully successful handler pass.
    pub fn forget(&self, key: &str) {
        self.lock().limiters.remove(key);
    }

    /// Stops the queue: `dispatch` returns `None`, further enqueues are
    /// dropped. Pending items are discarded; passes are recomputed from
    /// platform state, so nothing is lost across a restart.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    /// Number of items currently pending.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poll_next(&self) -> Next<T> {
        let mut guard = self.lock();
        let state = &mut *guard;
        if state.shutdown {
            return Next::Closed;
        }
        let now = Instant::now();
        loop {
            let head = match state.schedule.peek() {
                Some(Reverse(head)) => head.clone(),
                None => return Next::Idle,
            };
            match state.pending.get(&head.key) {
                // stale heap entry, the key was re-queued under a newer seq
                Some(pending) if pending.seq == head.seq => {
                    if pending.ready_at <= now {
                        state.schedule.pop();
                        if let Some(pending) = state.pending.remove(&head.key) {
                            return Next::Item(pending.item);
                        }
                    } else {
                        return Next::Wait(pending.ready_at - now);
                    }
                }
                _ => {
                    state.schedule.pop();
                }
            }
        }
    }

    /// Pulls the next ready item, waiting until one becomes ready or the
    /// queue shuts down (`None`).
    pub async fn dispatch(&self) -> Option<WorkItem<T>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before inspecting state so a concurrent enqueue or
            // shutdown cannot slip between the check and the wait
            notified.as_mut().enable();

            match self.poll_next() {
                Next::Item(item) => return Some(item),
                Next::Closed => return None,
                Next::Wait(delay) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Next::Idle => notified.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(key: &str, payload: &str) -> WorkItem<String> {
        WorkItem::new(key, Event::Updated(payload.to_string()))
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_enqueued_items() {
        let queue = EventQueue::new();
        queue.enqueue(item("default/a", "v1"));

        let dispatched = queue.dispatch().await.unwrap();
        assert_eq!(dispatched.key, "default/a");
        assert_eq!(dispatched.event, Event::Updated("v1".to_string()));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_key_collapses_to_most_recent_payload() {
        let queue = EventQueue::new();
        queue.enqueue(item("default/a", "v1"));
        queue.enqueue(item("default/a", "v2"));
        queue.enqueue(item("default/a", "v3"));
        assert_eq!(queue.len(), 1);

        let dispatched = queue.dispatch().await.unwrap();
        assert_eq!(dispatched.event, Event::Updated("v3".to_string()));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_enqueues_back_off() {
        let queue = EventQueue::with_backoff(Duration::from_millis(5), Duration::from_secs(10));

        // first and second delays are the floor, third doubles
        for expected in [5u64, 5, 10] {
            let start = Instant::now();
            queue.enqueue(item("default/a", "v"));
            queue.dispatch().await.unwrap();
            assert_eq!(start.elapsed(), Duration::from_millis(expected));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn forget_resets_the_backoff() {
        let queue = EventQueue::with_backoff(Duration::from_millis(5), Duration::from_secs(10));

        for _ in 0..4 {
            queue.enqueue(item("default/a", "v"));
            queue.dispatch().await.unwrap();
        }
        queue.forget("default/a");

        let start = Instant::now();
        queue.enqueue(item("default/a", "v"));
        queue.dispatch().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_rate_limited_independently() {
        let queue = EventQueue::with_backoff(Duration::from_millis(5), Duration::from_secs(10));

        // drive one key far up its backoff curve
        for _ in 0..5 {
            queue.enqueue(item("default/hot", "v"));
            queue.dispatch().await.unwrap();
        }

        let start = Instant::now();
        queue.enqueue(item("default/cold", "v"));
        let dispatched = queue.dispatch().await.unwrap();
        assert_eq!(dispatched.key, "default/cold");
        assert_eq!(start.elapsed(), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_unblocks_dispatch() {
        let queue = std::sync::Arc::new(EventQueue::<String>::new());

        let waiter = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.dispatch().await })
        };
        tokio::task::yield_now().await;
        queue.shutdown();

        assert_eq!(waiter.await.unwrap(), None);
        // enqueues after shutdown are dropped
        queue.enqueue(item("default/a", "v"));
        assert!(queue.is_empty());
    }
}
