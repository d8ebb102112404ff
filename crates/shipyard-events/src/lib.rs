//! Event bus for observing build progress.
//!
//! Every state change in the orchestrator, executor and phase machinery is
//! published here as an [`Event`]. The bus keeps a capped, newest-last history
//! per project and fans each event out to three audiences: subscribers of the
//! event's type, subscribers of the event's project, and global subscribers.
//!
//! # Main types
//!
//! - [`EventBus`]: Shared pub/sub hub, constructed once per process.
//! - [`Event`] / [`EventType`]: The published record and its closed type set.
//! - [`EventSubscriber`]: Async consumer contract.
//! - [`CallbackSubscriber`] / [`ChannelSubscriber`]: Ready-made consumers.

/// Event and event type definitions.
pub mod event;
/// Subscriber contract and built-in subscribers.
pub mod subscriber;

pub use event::{Event, EventType};
pub use subscriber::{CallbackSubscriber, ChannelSubscriber, EventSubscriber};

use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default number of events retained per project.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Handle returned by the `subscribe_*` methods, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    subscriber: Arc<dyn EventSubscriber>,
}

/// Typed pub/sub fan-out with bounded per-project history.
///
/// Construct one bus per process and share it as `Arc<EventBus>`; dropping the
/// last handle tears it down along with its history.
pub struct EventBus {
    history_capacity: usize,
    history: RwLock<HashMap<String, VecDeque<Event>>>,
    by_type: RwLock<HashMap<EventType, Vec<Subscription>>>,
    by_project: RwLock<HashMap<String, Vec<Subscription>>>,
    global: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Create a bus retaining at most `history_capacity` events per project.
    pub fn with_capacity(history_capacity: usize) -> Self {
        Self {
            history_capacity: history_capacity.max(1),
            history: RwLock::new(HashMap::new()),
            by_type: RwLock::new(HashMap::new()),
            by_project: RwLock::new(HashMap::new()),
            global: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_subscription(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Receive every event of one type, across projects.
    pub fn subscribe_type(
        &self,
        event_type: EventType,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> SubscriptionId {
        let id = self.next_subscription();
        self.by_type
            .write()
            .entry(event_type)
            .or_default()
            .push(Subscription { id, subscriber });
        id
    }

    /// Receive every event of one project.
    pub fn subscribe_project(
        &self,
        project_id: impl Into<String>,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> SubscriptionId {
        let id = self.next_subscription();
        self.by_project
            .write()
            .entry(project_id.into())
            .or_default()
            .push(Subscription { id, subscriber });
        id
    }

    /// Receive every event published on this bus.
    pub fn subscribe_all(&self, subscriber: Arc<dyn EventSubscriber>) -> SubscriptionId {
        let id = self.next_subscription();
        self.global.write().push(Subscription { id, subscriber });
        id
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        for subs in self.by_type.write().values_mut() {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            removed |= subs.len() != before;
        }
        for subs in self.by_project.write().values_mut() {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            removed |= subs.len() != before;
        }
        let mut global = self.global.write();
        let before = global.len();
        global.retain(|s| s.id != id);
        removed | (global.len() != before)
    }

    /// Total number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let typed: usize = self.by_type.read().values().map(Vec::len).sum();
        let project: usize = self.by_project.read().values().map(Vec::len).sum();
        typed + project + self.global.read().len()
    }

    /// Record `event` in its project's history and deliver it to all matching
    /// subscribers concurrently.
    ///
    /// Subscriber failures are logged and never reach the publisher. Returns the
    /// number of subscribers that accepted the event.
    pub async fn publish(&self, event: Event) -> usize {
        self.record(&event);

        let targets = self.targets_for(&event);
        if targets.is_empty() {
            return 0;
        }

        let deliveries = targets
            .iter()
            .map(|subscriber| AssertUnwindSafe(subscriber.on_event(&event)).catch_unwind());
        let results = join_all(deliveries).await;

        let mut delivered = 0;
        for result in results {
            match result {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(
                    event_type = %event.event_type,
                    project_id = %event.project_id,
                    error = %e,
                    "Event subscriber failed"
                ),
                Err(_) => warn!(
                    event_type = %event.event_type,
                    project_id = %event.project_id,
                    "Event subscriber panicked"
                ),
            }
        }
        debug!(
            event_type = %event.event_type,
            project_id = %event.project_id,
            delivered,
            "Event published"
        );
        delivered
    }

    fn record(&self, event: &Event) {
        let mut history = self.history.write();
        let buffer = history.entry(event.project_id.clone()).or_default();
        if buffer.len() >= self.history_capacity {
            buffer.pop_front();
        }
        buffer.push_back(event.clone());
    }

    fn targets_for(&self, event: &Event) -> Vec<Arc<dyn EventSubscriber>> {
        let mut targets = Vec::new();
        if let Some(subs) = self.by_type.read().get(&event.event_type) {
            targets.extend(subs.iter().map(|s| s.subscriber.clone()));
        }
        if let Some(subs) = self.by_project.read().get(&event.project_id) {
            targets.extend(subs.iter().map(|s| s.subscriber.clone()));
        }
        targets.extend(self.global.read().iter().map(|s| s.subscriber.clone()));
        targets
    }

    /// Recent events of a project, newest first, optionally filtered by type.
    pub fn get_history(
        &self,
        project_id: &str,
        event_type: Option<EventType>,
        limit: usize,
    ) -> Vec<Event> {
        let history = self.history.read();
        let Some(buffer) = history.get(project_id) else {
            return Vec::new();
        };
        buffer
            .iter()
            .rev()
            .filter(|e| event_type.map_or(true, |t| e.event_type == t))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Drop a project's history.
    pub fn clear_history(&self, project_id: &str) {
        self.history.write().remove(project_id);
    }

    pub fn history_capacity(&self) -> usize {
        self.history_capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
