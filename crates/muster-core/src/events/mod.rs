//! Progress Publisher: pushes task state transitions to observers.
//!
//! Delivery is best-effort: every observer owns a bounded queue. Publishing
//! never waits on an observer; when a queue is full the oldest unread event
//! is dropped and that observer's `dropped_events` counter is incremented.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::Notify;
use tokio_stream::Stream;

use crate::models::plan::PlanStatus;
use crate::models::task::TaskStatus;

pub const DEFAULT_OBSERVER_CAPACITY: usize = 256;

/// Emitted on every successful task status change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub plan_id: String,
    pub task_id: String,
    pub old_status: TaskStatus,
    pub new_status: TaskStatus,
    /// Plan status after the transition was applied.
    pub plan_status: PlanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub timestamp: DateTime<Utc>,
}

struct ObserverQueue {
    name: String,
    capacity: usize,
    events: Mutex<VecDeque<ProgressEvent>>,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl ObserverQueue {
    fn push(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            if events.len() >= self.capacity {
                events.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(
                    "[Progress] Observer '{}' is lagging, dropped {} event(s) so far",
                    self.name,
                    dropped
                );
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<ProgressEvent> {
        self.events.lock().ok().and_then(|mut events| events.pop_front())
    }
}

struct PublisherInner {
    observers: HashMap<String, Arc<ObserverQueue>>,
    default_capacity: usize,
}

/// Thread-safe fan-out of [`ProgressEvent`]s.
#[derive(Clone)]
pub struct ProgressPublisher {
    inner: Arc<RwLock<PublisherInner>>,
}

impl Default for ProgressPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_OBSERVER_CAPACITY)
    }
}

impl ProgressPublisher {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(PublisherInner {
                observers: HashMap::new(),
                default_capacity: default_capacity.max(1),
            })),
        }
    }

    /// Register an observer with the default queue capacity.
    pub fn subscribe(&self, name: &str) -> ProgressSubscription {
        let capacity = self
            .inner
            .read()
            .map(|inner| inner.default_capacity)
            .unwrap_or(DEFAULT_OBSERVER_CAPACITY);
        self.subscribe_with_capacity(name, capacity)
    }

    /// Register an observer whose queue holds at most `capacity` events.
    pub fn subscribe_with_capacity(&self, name: &str, capacity: usize) -> ProgressSubscription {
        let id = uuid::Uuid::new_v4().to_string();
        let queue = Arc::new(ObserverQueue {
            name: name.to_string(),
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        });
        if let Ok(mut inner) = self.inner.write() {
            inner.observers.insert(id.clone(), queue.clone());
        }
        tracing::debug!("[Progress] Observer '{}' subscribed ({})", name, id);
        ProgressSubscription {
            id,
            queue,
            publisher: Arc::downgrade(&self.inner),
        }
    }

    /// Remove an observer; its pending events are discarded.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        Self::remove(&self.inner, subscription_id)
    }

    fn remove(inner: &RwLock<PublisherInner>, subscription_id: &str) -> bool {
        let removed = inner
            .write()
            .ok()
            .and_then(|mut inner| inner.observers.remove(subscription_id));
        match removed {
            Some(queue) => {
                queue.closed.store(true, Ordering::Release);
                queue.notify.notify_one();
                true
            }
            None => false,
        }
    }

    /// Deliver an event to every observer. Never blocks on a slow reader.
    pub fn publish(&self, event: ProgressEvent) {
        tracing::debug!(
            "[Progress] {} {}: {} -> {} (plan {})",
            event.plan_id,
            event.task_id,
            event.old_status,
            event.new_status,
            event.plan_status
        );
        let observers: Vec<Arc<ObserverQueue>> = match self.inner.read() {
            Ok(inner) => inner.observers.values().cloned().collect(),
            Err(_) => return,
        };
        for observer in observers {
            observer.push(event.clone());
        }
    }

    pub fn observer_count(&self) -> usize {
        self.inner.read().map(|inner| inner.observers.len()).unwrap_or(0)
    }

    /// Close every subscription; pending events can still be drained.
    pub fn close(&self) {
        if let Ok(mut inner) = self.inner.write() {
            for (_, queue) in inner.observers.drain() {
                queue.closed.store(true, Ordering::Release);
                queue.notify.notify_one();
            }
        }
    }
}

/// Receiving side of one observer. Dropping it unsubscribes.
pub struct ProgressSubscription {
    id: String,
    queue: Arc<ObserverQueue>,
    publisher: Weak<RwLock<PublisherInner>>,
}

impl ProgressSubscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of events discarded because this observer fell behind.
    pub fn dropped_events(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn try_recv(&self) -> Option<ProgressEvent> {
        self.queue.pop()
    }

    /// Wait for the next event; `None` once the subscription is closed and
    /// drained.
    pub async fn recv(&self) -> Option<ProgressEvent> {
        loop {
            if let Some(event) = self.queue.pop() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Consume the subscription as a stream of events.
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> {
        async_stream::stream! {
            while let Some(event) = self.recv().await {
                yield event;
            }
        }
    }
}

impl Drop for ProgressSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.publisher.upgrade() {
            ProgressPublisher::remove(&inner, &self.id);
        }
    }
}
