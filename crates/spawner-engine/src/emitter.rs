//! Hierarchical topic pub/sub with deferred dispatch.
//!
//! Publishing a topic delivers to every subscription on any prefix of it,
//! plus all wildcard (empty-topic) subscribers; the listener always sees
//! the full published topic. Deliveries are queued and only invoked on the
//! next [`EventEmitter::dispatch_pending`] tick, so publishing never
//! re-enters listeners and publishes issued inside a listener land on the
//! following tick.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use spawner_core::{Event, Topic};

/// Identifies one subscription for later removal.
pub type ListenerId = u64;

/// A subscribed callback. Errors are logged and evict the listener.
pub type Listener = Box<dyn FnMut(&Topic, &Event) -> anyhow::Result<()> + Send>;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-wide unique listener id.
pub(crate) fn next_listener_id() -> ListenerId {
    NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed)
}

struct Subscription {
    id: ListenerId,
    once: bool,
    listener: Listener,
}

#[derive(Default)]
struct Queues {
    /// Specific deliveries: one entry per matched prefix, carrying the
    /// full published topic.
    queue: VecDeque<(Topic, Topic, Event)>,
    /// Wildcard deliveries: one entry per publish.
    wqueue: VecDeque<(Topic, Event)>,
}

/// A cheap, thread-safe handle that can only enqueue publications.
///
/// Listeners (and other threads) publish through this without touching
/// the subscription tables; the owning loop drains the queues on its next
/// tick.
#[derive(Clone)]
pub struct Publisher {
    queues: Arc<Mutex<Queues>>,
}

impl Publisher {
    pub fn publish(&self, topic: Topic, event: Event) {
        let mut queues = self.queues.lock().unwrap();
        for prefix in topic.prefixes() {
            queues.queue.push_back((prefix, topic.clone(), event.clone()));
        }
        queues.wqueue.push_back((topic, event));
    }
}

/// The pub/sub hub for one manager loop.
pub struct EventEmitter {
    queues: Arc<Mutex<Queues>>,
    events: HashMap<Topic, Vec<Subscription>>,
    wildcards: Vec<Subscription>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        EventEmitter::new()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        EventEmitter {
            queues: Arc::new(Mutex::new(Queues::default())),
            events: HashMap::new(),
            wildcards: Vec::new(),
        }
    }

    /// A handle for enqueueing publications from listeners or other threads.
    pub fn publisher(&self) -> Publisher {
        Publisher {
            queues: Arc::clone(&self.queues),
        }
    }

    /// Enqueue an event; it is delivered on the next dispatch tick.
    pub fn publish(&self, topic: Topic, event: Event) {
        self.publisher().publish(topic, event);
    }

    /// Subscribe a listener; the empty topic subscribes to everything.
    pub fn subscribe<F>(&mut self, topic: Topic, listener: F) -> ListenerId
    where
        F: FnMut(&Topic, &Event) -> anyhow::Result<()> + Send + 'static,
    {
        let id = next_listener_id();
        self.insert(topic, id, false, Box::new(listener));
        id
    }

    /// Subscribe a listener that is removed after its first delivery.
    pub fn subscribe_once<F>(&mut self, topic: Topic, listener: F) -> ListenerId
    where
        F: FnMut(&Topic, &Event) -> anyhow::Result<()> + Send + 'static,
    {
        let id = next_listener_id();
        self.insert(topic, id, true, Box::new(listener));
        id
    }

    pub(crate) fn insert(&mut self, topic: Topic, id: ListenerId, once: bool, listener: Listener) {
        let subscription = Subscription { id, once, listener };
        if topic.is_wildcard() {
            self.wildcards.push(subscription);
        } else {
            self.events.entry(topic).or_default().push(subscription);
        }
    }

    /// Remove one subscription; an unknown id is tolerated silently.
    pub fn unsubscribe(&mut self, topic: &Topic, id: ListenerId) {
        if topic.is_wildcard() {
            self.wildcards.retain(|sub| sub.id != id);
            return;
        }
        if let Some(subs) = self.events.get_mut(topic) {
            subs.retain(|sub| sub.id != id);
            if subs.is_empty() {
                self.events.remove(topic);
            }
        }
    }

    /// Drop every subscription on each of the given topics; the empty
    /// topic clears the wildcard set.
    pub fn unsubscribe_all(&mut self, topics: &[Topic]) {
        for topic in topics {
            if topic.is_wildcard() {
                self.wildcards.clear();
            } else {
                self.events.remove(topic);
            }
        }
    }

    /// Whether any queued deliveries are waiting for the next tick.
    pub fn has_pending(&self) -> bool {
        let queues = self.queues.lock().unwrap();
        !queues.queue.is_empty() || !queues.wqueue.is_empty()
    }

    /// Deliver everything queued so far: one tick.
    ///
    /// Queue lengths are snapshotted first, so publishes issued by
    /// listeners during this tick are deferred to the next one. Wildcard
    /// deliveries run before specific deliveries. A listener returning
    /// `Err` is logged and removed; `once` listeners are removed after
    /// their invocation either way.
    pub fn dispatch_pending(&mut self) {
        let (wbatch, batch) = {
            let mut queues = self.queues.lock().unwrap();
            let wlen = queues.wqueue.len();
            let len = queues.queue.len();
            let wbatch: Vec<_> = queues.wqueue.drain(..wlen).collect();
            let batch: Vec<_> = queues.queue.drain(..len).collect();
            (wbatch, batch)
        };

        for (topic, event) in wbatch {
            Self::deliver(&mut self.wildcards, &topic, &event);
        }

        for (pattern, topic, event) in batch {
            let emptied = match self.events.get_mut(&pattern) {
                Some(subs) => {
                    Self::deliver(subs, &topic, &event);
                    subs.is_empty()
                }
                None => false,
            };
            if emptied {
                self.events.remove(&pattern);
            }
        }
    }

    fn deliver(subs: &mut Vec<Subscription>, topic: &Topic, event: &Event) {
        let mut evict: Vec<ListenerId> = Vec::new();
        for sub in subs.iter_mut() {
            if let Err(err) = (sub.listener)(topic, event) {
                log::error!("listener on topic `{topic}` failed: {err:#}; removing it");
                evict.push(sub.id);
            } else if sub.once {
                evict.push(sub.id);
            }
        }
        if !evict.is_empty() {
            subs.retain(|sub| !evict.contains(&sub.id));
        }
    }

    /// Drop all queued deliveries and subscriptions.
    pub fn stop(&mut self) {
        {
            let mut queues = self.queues.lock().unwrap();
            queues.queue.clear();
            queues.wqueue.clear();
        }
        self.events.clear();
        self.wildcards.clear();
    }
}
