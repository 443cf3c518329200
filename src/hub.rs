//! Broadcast hub: the topic registry and publish fan-out.
//!
//! Lock order is registry, then topic entry. The registry `RwLock` is held
//! only for lookups, inserts, and removals; fan-out runs under the topic's
//! own mutex, so publishes to different topics never contend.
//!
//! Topics with no subscribers stay registered so their sequence keeps
//! counting, up to `max_idle_topics` of them. Creating a topic past that
//! point sweeps every idle entry out of the registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::HubError;
use crate::models::{Event, HubStats, OverflowPolicy, Topic, TopicStats};
use crate::queue::{Popped, SubscriberId, SubscriberQueue};
use crate::sync::{lock, read, write};

/// Idle topics kept before a sweep, unless configured otherwise.
pub const DEFAULT_MAX_IDLE_TOPICS: usize = 1024;

type Registry = HashMap<Topic, Arc<TopicEntry>>;

#[derive(Default)]
struct TopicState {
    /// Last assigned sequence number.
    sequence: u64,
    subscribers: BTreeMap<SubscriberId, Arc<SubscriberQueue>>,
    /// Set once the entry has left the registry. Callers holding a stale
    /// `Arc` must look the topic up again.
    retired: bool,
}

#[derive(Default)]
struct TopicEntry {
    state: Mutex<TopicState>,
}

struct HubInner {
    topics: RwLock<Registry>,
    next_id: AtomicU64,
    policy: OverflowPolicy,
    shutting_down: AtomicBool,
    max_idle_topics: usize,
    /// Registry size at which the next topic creation sweeps idle entries.
    sweep_at: AtomicUsize,
}

/// Owned, cloneable handle to a broadcast hub.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Create a new hub applying `policy` to every subscriber queue and
    /// keeping at most `max_idle_topics` subscriber-less topics.
    pub fn new(policy: OverflowPolicy, max_idle_topics: usize) -> Self {
        let max_idle_topics = max_idle_topics.max(1);
        info!(
            "Broadcast hub initialised (overflow policy: {}, max idle topics: {})",
            policy, max_idle_topics
        );
        Self {
            inner: Arc::new(HubInner {
                topics: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                policy,
                shutting_down: AtomicBool::new(false),
                max_idle_topics,
                sweep_at: AtomicUsize::new(max_idle_topics),
            }),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Publish `payload` to every subscriber of `topic`.
    ///
    /// Never waits on consumers. Returns the sequence number assigned to the
    /// event; with no subscribers the counter still advances until the idle
    /// topic is swept.
    pub fn publish(&self, topic: &Topic, payload: impl Into<Vec<u8>>) -> Result<u64, HubError> {
        if self.is_shutting_down() {
            return Err(HubError::ShuttingDown);
        }
        let payload = payload.into();

        loop {
            let entry = self.inner.entry(topic, HubError::ShuttingDown)?;
            let mut state = lock(&entry.state);
            if state.retired {
                continue;
            }
            if self.is_shutting_down() {
                return Err(HubError::ShuttingDown);
            }

            state.sequence += 1;
            let sequence = state.sequence;
            let event = Arc::new(Event::new(topic.clone(), payload, sequence));

            let mut evicted = 0usize;
            for queue in state.subscribers.values() {
                if queue.try_push(event.clone()) {
                    evicted += 1;
                }
            }
            if evicted > 0 {
                debug!(
                    "Topic {} seq {}: {} of {} subscribers overflowed",
                    topic,
                    sequence,
                    evicted,
                    state.subscribers.len()
                );
            }
            return Ok(sequence);
        }
    }

    /// Register a new subscriber queue on `topic`.
    pub fn subscribe(&self, topic: &Topic, capacity: usize) -> Result<Subscription, HubError> {
        if capacity == 0 {
            return Err(HubError::InvalidCapacity);
        }
        if self.is_shutting_down() {
            return Err(HubError::SubscribeAfterShutdown);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new(
            id,
            topic.clone(),
            capacity,
            self.inner.policy,
        ));

        loop {
            let entry = self.inner.entry(topic, HubError::SubscribeAfterShutdown)?;
            let mut state = lock(&entry.state);
            if state.retired {
                continue;
            }
            if self.is_shutting_down() {
                return Err(HubError::SubscribeAfterShutdown);
            }
            state.subscribers.insert(id, queue.clone());
            debug!(
                "Subscriber {} joined topic {} (capacity {}, {} total)",
                id,
                topic,
                capacity,
                state.subscribers.len()
            );
            break;
        }

        Ok(Subscription {
            hub: self.clone(),
            queue,
            unsubscribed: AtomicBool::new(false),
        })
    }

    /// Remove a subscription's queue from the registry and close it.
    ///
    /// Idempotent: returns `true` only for the call that removed it.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        if subscription.unsubscribed.swap(true, Ordering::AcqRel) {
            return false;
        }
        subscription.hub.inner.remove(&subscription.queue);
        true
    }

    /// Stop accepting publishes and subscribes, close every queue, and
    /// clear the registry. Pending pops wake with [`Popped::Closed`].
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let drained: Vec<_> = write(&self.inner.topics).drain().collect();
        let mut closed = 0usize;
        for (_, entry) in &drained {
            let mut state = lock(&entry.state);
            state.retired = true;
            for queue in std::mem::take(&mut state.subscribers).into_values() {
                queue.close();
                closed += 1;
            }
        }
        info!(
            "Broadcast hub shut down: {} topics, {} subscribers closed",
            drained.len(),
            closed
        );
    }

    /// Number of topics currently in the registry.
    pub fn topic_count(&self) -> usize {
        read(&self.inner.topics).len()
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        read(&self.inner.topics)
            .get(topic)
            .map(|entry| lock(&entry.state).subscribers.len())
            .unwrap_or(0)
    }

    /// Snapshot of every topic, sorted by name.
    pub fn stats(&self) -> HubStats {
        let entries: Vec<(Topic, Arc<TopicEntry>)> = read(&self.inner.topics)
            .iter()
            .map(|(topic, entry)| (topic.clone(), entry.clone()))
            .collect();

        let mut topics: Vec<TopicStats> = entries
            .into_iter()
            .map(|(topic, entry)| {
                let state = lock(&entry.state);
                TopicStats {
                    topic,
                    subscribers: state.subscribers.len(),
                    last_sequence: state.sequence,
                    dropped: state.subscribers.values().map(|q| q.dropped_count()).sum(),
                }
            })
            .collect();
        topics.sort_by(|a, b| a.topic.cmp(&b.topic));

        HubStats {
            total_subscribers: topics.iter().map(|t| t.subscribers).sum(),
            topics,
            shutting_down: self.is_shutting_down(),
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(OverflowPolicy::default(), DEFAULT_MAX_IDLE_TOPICS)
    }
}

impl HubInner {
    /// Look up the entry for `topic`, creating it if absent. Creation is
    /// refused with `refusal` once shutdown has begun.
    fn entry(&self, topic: &Topic, refusal: HubError) -> Result<Arc<TopicEntry>, HubError> {
        if let Some(entry) = read(&self.topics).get(topic) {
            return Ok(entry.clone());
        }
        let mut topics = write(&self.topics);
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(refusal);
        }
        if let Some(entry) = topics.get(topic) {
            return Ok(entry.clone());
        }
        if topics.len() >= self.sweep_at.load(Ordering::Relaxed) {
            self.sweep_idle(&mut topics);
        }
        let entry = Arc::new(TopicEntry::default());
        topics.insert(topic.clone(), entry.clone());
        debug!("Topic {} created", topic);
        Ok(entry)
    }

    /// Retire and drop every entry without subscribers. Runs under the
    /// registry write lock.
    fn sweep_idle(&self, topics: &mut Registry) {
        let before = topics.len();
        topics.retain(|_, entry| {
            let mut state = lock(&entry.state);
            if state.subscribers.is_empty() {
                state.retired = true;
                false
            } else {
                true
            }
        });
        self.sweep_at
            .store(topics.len() + self.max_idle_topics, Ordering::Relaxed);
        debug!(
            "Swept {} idle topics ({} with subscribers remain)",
            before - topics.len(),
            topics.len()
        );
    }

    fn remove(&self, queue: &Arc<SubscriberQueue>) {
        let topic = queue.topic();
        let entry = read(&self.topics).get(topic).cloned();

        if let Some(entry) = entry {
            let now_empty = {
                let mut state = lock(&entry.state);
                let removed = state.subscribers.remove(&queue.id()).is_some();
                removed && state.subscribers.is_empty() && !state.retired
            };
            if now_empty {
                self.collect_topic(topic, &entry);
            }
        }

        // Removed from the registry above, so no publish can reach it now.
        let discarded = queue.close();
        debug!(
            "Subscriber {} left topic {} ({} undelivered, {} dropped)",
            queue.id(),
            topic,
            discarded,
            queue.dropped_count()
        );
    }

    /// Drop `entry` from the registry if it is still current and empty.
    fn collect_topic(&self, topic: &Topic, entry: &Arc<TopicEntry>) {
        let mut topics = write(&self.topics);
        let Some(current) = topics.get(topic) else {
            return;
        };
        if !Arc::ptr_eq(current, entry) {
            return;
        }
        let mut state = lock(&entry.state);
        if state.subscribers.is_empty() && !state.retired {
            state.retired = true;
            drop(state);
            topics.remove(topic);
            debug!("Topic {} removed (no subscribers)", topic);
        }
    }
}

/// A registered subscriber queue. Owned by exactly one stream session;
/// dropping it unsubscribes.
pub struct Subscription {
    hub: Hub,
    queue: Arc<SubscriberQueue>,
    unsubscribed: AtomicBool,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.queue.id()
    }

    pub fn dropped_count(&self) -> u64 {
        self.queue.dropped_count()
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.unsubscribed.load(Ordering::Acquire)
    }

    /// Wait for the next event, closure, or cancellation.
    pub async fn pop(&self, cancel: &CancellationToken) -> Popped {
        self.queue.pop(cancel).await
    }

    /// Same as [`Hub::unsubscribe`] on this subscription.
    pub fn unsubscribe(&self) -> bool {
        self.hub.unsubscribe(self)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("queue", &self.queue)
            .field("unsubscribed", &self.is_unsubscribed())
            .finish()
    }
}
