//! Event subscription bus.
//!
//! Domain-record lifecycle events flow in as [`RecordSnapshot`]s tagged with
//! a [`RecordEvent`]. Each record class gets one lazily created proxy that
//! fans events out to every subscription registered against the class. A
//! subscription declares its capabilities explicitly; an event with no
//! matching handler is a silent no-op.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::engine::CacheEngine;
use crate::lock::{rw_read, rw_write};

/// A domain record's state at the moment of a lifecycle event. The bus never
/// sees live records, only snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSnapshot {
    pub record_type: String,
    pub id: Uuid,
    #[serde(default)]
    pub fields: serde_json::Map<String, Value>,
}

impl RecordSnapshot {
    pub fn new(record_type: impl Into<String>, id: Uuid) -> Self {
        Self {
            record_type: record_type.into(),
            id,
            fields: serde_json::Map::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Which lifecycle transition happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEvent {
    Created,
    /// `changed` lists the updated field names; an update that changed
    /// nothing is not published.
    Updated { changed: Vec<String> },
    Destroyed,
}

pub type CreateHandler = Arc<dyn Fn(&CacheEngine, &RecordSnapshot) + Send + Sync>;
pub type UpdateHandler = Arc<dyn Fn(&CacheEngine, &RecordSnapshot, &[String]) + Send + Sync>;
pub type DestroyHandler = Arc<dyn Fn(&CacheEngine, &RecordSnapshot) + Send + Sync>;

/// A subscription's declared capabilities, one optional handler per event.
#[derive(Clone, Default)]
pub struct EventHandlers {
    on_create: Option<CreateHandler>,
    on_update: Option<UpdateHandler>,
    on_destroy: Option<DestroyHandler>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_create(
        mut self,
        handler: impl Fn(&CacheEngine, &RecordSnapshot) + Send + Sync + 'static,
    ) -> Self {
        self.on_create = Some(Arc::new(handler));
        self
    }

    pub fn on_update(
        mut self,
        handler: impl Fn(&CacheEngine, &RecordSnapshot, &[String]) + Send + Sync + 'static,
    ) -> Self {
        self.on_update = Some(Arc::new(handler));
        self
    }

    pub fn on_destroy(
        mut self,
        handler: impl Fn(&CacheEngine, &RecordSnapshot) + Send + Sync + 'static,
    ) -> Self {
        self.on_destroy = Some(Arc::new(handler));
        self
    }
}

/// Binds one variant to one record class.
///
/// Besides the capability handlers, a subscription carries an ordered
/// after-destroy chain that always runs after the class handler; cleanup
/// like orphaned-fragment purging hangs off it.
pub struct Subscription {
    variant: String,
    record_type: String,
    handlers: EventHandlers,
    after_destroy: Vec<DestroyHandler>,
}

impl Subscription {
    pub fn new(
        variant: impl Into<String>,
        record_type: impl Into<String>,
        handlers: EventHandlers,
    ) -> Self {
        Self {
            variant: variant.into(),
            record_type: record_type.into(),
            handlers,
            after_destroy: Vec::new(),
        }
    }

    pub fn after_destroy(
        mut self,
        handler: impl Fn(&CacheEngine, &RecordSnapshot) + Send + Sync + 'static,
    ) -> Self {
        self.after_destroy.push(Arc::new(handler));
        self
    }

    pub fn variant(&self) -> &str {
        &self.variant
    }

    pub fn record_type(&self) -> &str {
        &self.record_type
    }

    fn deliver(&self, engine: &CacheEngine, snapshot: &RecordSnapshot, event: &RecordEvent) {
        match event {
            RecordEvent::Created => {
                if let Some(handler) = &self.handlers.on_create {
                    handler(engine, snapshot);
                }
            }
            RecordEvent::Updated { changed } => {
                if let Some(handler) = &self.handlers.on_update {
                    handler(engine, snapshot, changed);
                }
            }
            RecordEvent::Destroyed => {
                if let Some(handler) = &self.handlers.on_destroy {
                    handler(engine, snapshot);
                }
                for handler in &self.after_destroy {
                    handler(engine, snapshot);
                }
            }
        }
    }
}

/// Fan-out point for one record class.
pub struct PublisherProxy {
    record_type: String,
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
}

impl PublisherProxy {
    fn new(record_type: impl Into<String>) -> Self {
        Self {
            record_type: record_type.into(),
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    pub fn record_type(&self) -> &str {
        &self.record_type
    }

    pub fn add(&self, subscription: Arc<Subscription>) {
        rw_write(&self.subscriptions, "bus.add").push(subscription);
    }

    pub fn subscription_count(&self) -> usize {
        rw_read(&self.subscriptions, "bus.subscription_count").len()
    }

    fn broadcast(&self, engine: &CacheEngine, snapshot: &RecordSnapshot, event: &RecordEvent) {
        let subscriptions: Vec<Arc<Subscription>> =
            rw_read(&self.subscriptions, "bus.broadcast")
                .iter()
                .cloned()
                .collect();
        debug!(
            target: "tessella::bus",
            record_type = %self.record_type,
            record_id = %snapshot.id,
            event = ?event,
            subscriptions = subscriptions.len(),
            "record event dispatched"
        );
        for subscription in subscriptions {
            subscription.deliver(engine, snapshot, event);
        }
    }
}

/// Record-class → proxy catalog.
pub struct SubscriberRegistry {
    proxies: RwLock<HashMap<String, Arc<PublisherProxy>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            proxies: RwLock::new(HashMap::new()),
        }
    }

    /// The proxy for a record class, created on first subscription.
    pub fn proxy_for(&self, record_type: &str) -> Arc<PublisherProxy> {
        if let Some(proxy) = rw_read(&self.proxies, "bus.proxy_for").get(record_type) {
            return proxy.clone();
        }
        let mut proxies = rw_write(&self.proxies, "bus.proxy_for");
        proxies
            .entry(record_type.to_string())
            .or_insert_with(|| Arc::new(PublisherProxy::new(record_type)))
            .clone()
    }

    pub fn subscribe(&self, subscription: Subscription) -> Arc<Subscription> {
        let subscription = Arc::new(subscription);
        self.proxy_for(subscription.record_type())
            .add(subscription.clone());
        subscription
    }

    /// Deliver a record event to every subscription for its class. A class
    /// with no subscribers, or an update that changed nothing, is a no-op.
    pub fn publish(&self, engine: &CacheEngine, snapshot: &RecordSnapshot, event: &RecordEvent) {
        if let RecordEvent::Updated { changed } = event {
            if changed.is_empty() {
                debug!(
                    target: "tessella::bus",
                    record_type = %snapshot.record_type,
                    record_id = %snapshot.id,
                    "no-change update suppressed"
                );
                return;
            }
        }
        let proxy = rw_read(&self.proxies, "bus.publish")
            .get(&snapshot.record_type)
            .cloned();
        match proxy {
            Some(proxy) => proxy.broadcast(engine, snapshot, event),
            None => debug!(
                target: "tessella::bus",
                record_type = %snapshot.record_type,
                "record event with no subscribers"
            ),
        }
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}
