//! Bounded event bus
//!
//! Single in-memory queue between the capture sites and the uplink. All
//! operations serialize through one mutex; subscriber callbacks run after
//! the lock is released so a subscriber can safely call back into the bus.

use crate::models::DebugEvent;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// What to do when an enqueue would overflow the buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DropPolicy {
    /// Evict the head, append the new event
    DropOldest,
    /// Discard the new event
    DropNewest,
    /// Keep the new event with the given probability, evicting the head if full
    Sample(f64),
}

pub type SubscriberId = u64;

type Subscriber = Arc<dyn Fn(&DebugEvent) + Send + Sync>;

struct BusInner {
    queue: VecDeque<DebugEvent>,
    max_buffer_size: usize,
    policy: DropPolicy,
    subscribers: HashMap<SubscriberId, Subscriber>,
    next_subscriber: SubscriberId,
}

pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new(max_buffer_size: usize, policy: DropPolicy) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                queue: VecDeque::with_capacity(max_buffer_size.min(1024)),
                max_buffer_size: max_buffer_size.max(1),
                policy,
                subscribers: HashMap::new(),
                next_subscriber: 0,
            }),
        }
    }

    /// Enqueue one event. Never blocks; overflow applies the drop policy.
    pub fn enqueue(&self, event: DebugEvent) {
        self.enqueue_batch(vec![event]);
    }

    /// Enqueue a batch of events in order.
    pub fn enqueue_batch(&self, events: Vec<DebugEvent>) {
        if events.is_empty() {
            return;
        }
        let mut accepted = Vec::with_capacity(events.len());
        let subscribers: Vec<Subscriber> = {
            let mut inner = self.inner.lock().expect("bus mutex poisoned");
            for event in events {
                if inner.admit(&event) {
                    accepted.push(event);
                }
            }
            if accepted.is_empty() {
                Vec::new()
            } else {
                inner.subscribers.values().cloned().collect()
            }
        };
        for event in &accepted {
            for subscriber in &subscribers {
                subscriber(event);
            }
        }
    }

    /// Snapshot of the first `n` events without removal.
    pub fn peek(&self, n: usize) -> Vec<DebugEvent> {
        let inner = self.inner.lock().expect("bus mutex poisoned");
        inner.queue.iter().take(n).cloned().collect()
    }

    /// Drop up to `n` head elements; returns how many were removed.
    pub fn remove_first(&self, n: usize) -> usize {
        let mut inner = self.inner.lock().expect("bus mutex poisoned");
        let count = n.min(inner.queue.len());
        inner.queue.drain(..count);
        count
    }

    /// Atomic take-and-clear.
    pub fn dequeue_all(&self) -> Vec<DebugEvent> {
        let mut inner = self.inner.lock().expect("bus mutex poisoned");
        inner.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("bus mutex poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shrinks take effect on the next overflow check.
    pub fn set_max_buffer_size(&self, max: usize) {
        let mut inner = self.inner.lock().expect("bus mutex poisoned");
        inner.max_buffer_size = max.max(1);
    }

    pub fn set_drop_policy(&self, policy: DropPolicy) {
        let mut inner = self.inner.lock().expect("bus mutex poisoned");
        inner.policy = policy;
    }

    /// Register a local observer; fires for every admitted event.
    pub fn subscribe(&self, handler: impl Fn(&DebugEvent) + Send + Sync + 'static) -> SubscriberId {
        let mut inner = self.inner.lock().expect("bus mutex poisoned");
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.insert(id, Arc::new(handler));
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut inner = self.inner.lock().expect("bus mutex poisoned");
        inner.subscribers.remove(&id).is_some()
    }
}

impl BusInner {
    /// Apply the drop policy; true when the event was appended.
    fn admit(&mut self, event: &DebugEvent) -> bool {
        if self.queue.len() < self.max_buffer_size {
            self.queue.push_back(event.clone());
            return true;
        }
        match self.policy {
            DropPolicy::DropOldest => {
                self.evict_to(self.max_buffer_size.saturating_sub(1));
                self.queue.push_back(event.clone());
                true
            }
            DropPolicy::DropNewest => false,
            DropPolicy::Sample(rate) => {
                if rand::thread_rng().gen::<f64>() > rate {
                    false
                } else {
                    self.evict_to(self.max_buffer_size.saturating_sub(1));
                    self.queue.push_back(event.clone());
                    true
                }
            }
        }
    }

    fn evict_to(&mut self, len: usize) {
        while self.queue.len() > len {
            self.queue.pop_front();
        }
    }
}
