//! Per-subscriber bounded event queue.
//!
//! The hub is the only producer and the owning stream session the only
//! consumer. Pushes never block; pops suspend until an event arrives, the
//! queue is closed, or the caller cancels.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::models::{Event, OverflowPolicy, Topic};
use crate::sync::lock;

/// Opaque identifier of a subscriber queue, unique per hub.
pub type SubscriberId = u64;

/// Outcome of [`SubscriberQueue::pop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Popped {
    Event(Arc<Event>),
    /// The queue was unsubscribed or the hub shut down.
    Closed,
    /// The caller's cancellation token fired.
    Cancelled,
}

#[derive(Default)]
struct QueueState {
    buffer: VecDeque<Arc<Event>>,
    closed: bool,
}

pub struct SubscriberQueue {
    id: SubscriberId,
    topic: Topic,
    capacity: usize,
    policy: OverflowPolicy,
    state: Mutex<QueueState>,
    dropped: AtomicU64,
    notify: Notify,
}

impl SubscriberQueue {
    /// Create an open queue. `capacity` must be at least 1; the hub checks it.
    pub fn new(id: SubscriberId, topic: Topic, capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            id,
            topic,
            capacity,
            policy,
            state: Mutex::new(QueueState {
                buffer: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Number of events lost to overflow so far.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        lock(&self.state).buffer.len()
    }

    /// Push an event without blocking. Returns `true` if an event was lost
    /// to overflow (the evicted oldest one, or the incoming one under
    /// [`OverflowPolicy::DropNewest`]). Pushing to a closed queue is a no-op.
    pub fn try_push(&self, event: Arc<Event>) -> bool {
        let evicted = {
            let mut state = lock(&self.state);
            if state.closed {
                return false;
            }
            if state.buffer.len() >= self.capacity {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        state.buffer.pop_front();
                        state.buffer.push_back(event);
                    }
                    OverflowPolicy::DropNewest => return true,
                }
                true
            } else {
                state.buffer.push_back(event);
                false
            }
        };
        self.notify.notify_one();
        evicted
    }

    /// Wait for the next event.
    ///
    /// Cancellation takes priority over buffered events. Once closed, every
    /// call returns [`Popped::Closed`].
    pub async fn pop(&self, cancel: &CancellationToken) -> Popped {
        loop {
            if cancel.is_cancelled() {
                return Popped::Cancelled;
            }
            {
                let mut state = lock(&self.state);
                if state.closed {
                    return Popped::Closed;
                }
                if let Some(event) = state.buffer.pop_front() {
                    return Popped::Event(event);
                }
            }
            // notify_one stores a permit, so a push landing between the
            // check above and this await still wakes us.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Popped::Cancelled,
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Close the queue, discarding undelivered events. Returns how many were
    /// discarded; closing twice returns 0.
    pub fn close(&self) -> usize {
        let discarded = {
            let mut state = lock(&self.state);
            if state.closed {
                return 0;
            }
            state.closed = true;
            let n = state.buffer.len();
            state.buffer.clear();
            n
        };
        self.notify.notify_one();
        discarded
    }
}

impl std::fmt::Debug for SubscriberQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberQueue")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("dropped", &self.dropped_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn queue(capacity: usize, policy: OverflowPolicy) -> SubscriberQueue {
        SubscriberQueue::new(1, Topic::parse("events").unwrap(), capacity, policy)
    }

    fn event(payload: &str, sequence: u64) -> Arc<Event> {
        Arc::new(Event::new(
            Topic::parse("events").unwrap(),
            payload.as_bytes().to_vec(),
            sequence,
        ))
    }

    async fn pop_payload(q: &SubscriberQueue) -> String {
        match q.pop(&CancellationToken::new()).await {
            Popped::Event(e) => e.payload_text().into_owned(),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_most_recent() {
        let q = queue(2, OverflowPolicy::DropOldest);
        assert!(!q.try_push(event("A", 1)));
        assert!(!q.try_push(event("B", 2)));
        assert!(q.try_push(event("C", 3)));

        assert_eq!(q.dropped_count(), 1);
        assert_eq!(q.len(), 2);
        assert_eq!(pop_payload(&q).await, "B");
        assert_eq!(pop_payload(&q).await, "C");
    }

    #[tokio::test]
    async fn test_drop_newest_keeps_oldest() {
        let q = queue(2, OverflowPolicy::DropNewest);
        q.try_push(event("A", 1));
        q.try_push(event("B", 2));
        assert!(q.try_push(event("C", 3)));

        assert_eq!(q.dropped_count(), 1);
        assert_eq!(pop_payload(&q).await, "A");
        assert_eq!(pop_payload(&q).await, "B");
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let q = Arc::new(queue(4, OverflowPolicy::DropOldest));
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { pop_payload(&q).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        q.try_push(event("late", 1));
        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, "late");
    }

    #[tokio::test]
    async fn test_cancel_unblocks_pop() {
        let q = Arc::new(queue(4, OverflowPolicy::DropOldest));
        let cancel = CancellationToken::new();
        let consumer = {
            let q = q.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { q.pop(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Popped::Cancelled);
    }

    #[tokio::test]
    async fn test_close_discards_and_wakes() {
        let q = Arc::new(queue(4, OverflowPolicy::DropOldest));
        q.try_push(event("A", 1));
        q.try_push(event("B", 2));
        assert_eq!(q.close(), 2);
        assert_eq!(q.close(), 0);

        assert_eq!(q.pop(&CancellationToken::new()).await, Popped::Closed);
        assert_eq!(q.pop(&CancellationToken::new()).await, Popped::Closed);
        assert!(!q.try_push(event("C", 3)));
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_pending_pop() {
        let q = Arc::new(queue(1, OverflowPolicy::DropOldest));
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.pop(&CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();
        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Popped::Closed);
    }
}
