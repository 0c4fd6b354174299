//! Deferred invalidation handlers.
//!
//! Some subscriptions defer their work instead of touching fragments
//! mid-event: they queue a handler, and the dispatcher runs the queue once
//! at the end of the unit of work. Handlers carry a coalescing key so a
//! burst of equivalent invalidations collapses into one.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::CacheEngine;
use crate::error::CacheError;
use crate::lock::mutex_lock;
use crate::replay::SendOptions;

pub trait InvalidationHandler: Send + Sync {
    fn call(&self, engine: &CacheEngine);

    /// Queue entries with equal keys collapse to one.
    fn coalesce_key(&self) -> Option<String> {
        None
    }
}

/// Touches every fragment of one variant tied to one record. The coalescing
/// handler behind deferred list-membership subscriptions.
pub struct TouchRecordFragments {
    variant: String,
    record_id: Uuid,
}

impl TouchRecordFragments {
    pub fn new(variant: impl Into<String>, record_id: Uuid) -> Self {
        Self {
            variant: variant.into(),
            record_id,
        }
    }
}

impl InvalidationHandler for TouchRecordFragments {
    fn call(&self, engine: &CacheEngine) {
        if let Err(err) = engine.touch_fragments_for_record(self.record_id, Some(&self.variant)) {
            warn!(
                target: "tessella::handler",
                variant = %self.variant,
                record_id = %self.record_id,
                error = %err,
                "deferred touch failed"
            );
        }
    }

    fn coalesce_key(&self) -> Option<String> {
        Some(format!("touch:{}:{}", self.variant, self.record_id))
    }
}

/// Ordered process-wide handler queue, consumed exactly once per dispatch.
pub struct HandlerQueue {
    handlers: Mutex<Vec<Arc<dyn InvalidationHandler>>>,
}

impl HandlerQueue {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Append a handler. Returns false when an equal-keyed handler is
    /// already queued.
    pub fn push(&self, handler: Arc<dyn InvalidationHandler>) -> bool {
        let mut handlers = mutex_lock(&self.handlers, "handlers.push");
        if let Some(key) = handler.coalesce_key() {
            if handlers
                .iter()
                .any(|queued| queued.coalesce_key().as_deref() == Some(key.as_str()))
            {
                debug!(target: "tessella::handler", key, "handler coalesced");
                return false;
            }
        }
        handlers.push(handler);
        true
    }

    pub fn drain(&self) -> Vec<Arc<dyn InvalidationHandler>> {
        mutex_lock(&self.handlers, "handlers.drain").drain(..).collect()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.handlers, "handlers.len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandlerQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// End-of-unit-of-work hook: runs queued handlers in order, then starts
/// every request queue.
pub struct Dispatcher;

impl Dispatcher {
    pub async fn dispatch(engine: &CacheEngine, options: SendOptions) -> Result<(), CacheError> {
        let handlers = engine.handlers().drain();
        if !handlers.is_empty() {
            info!(
                target: "tessella::handler",
                count = handlers.len(),
                "running deferred handlers"
            );
        }
        for handler in handlers {
            handler.call(engine);
        }
        engine.start_all_queues(options).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::engine::EngineDeps;

    struct CountingHandler {
        key: Option<String>,
        count: Arc<AtomicUsize>,
    }

    impl InvalidationHandler for CountingHandler {
        fn call(&self, _engine: &CacheEngine) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }

        fn coalesce_key(&self) -> Option<String> {
            self.key.clone()
        }
    }

    #[test]
    fn equal_keys_coalesce() {
        let queue = HandlerQueue::new();
        let count = Arc::new(AtomicUsize::new(0));

        let record_id = Uuid::new_v4();
        assert!(queue.push(Arc::new(TouchRecordFragments::new("list", record_id))));
        assert!(!queue.push(Arc::new(TouchRecordFragments::new("list", record_id))));
        assert!(queue.push(Arc::new(TouchRecordFragments::new("list", Uuid::new_v4()))));
        assert_eq!(queue.len(), 2);

        // Keyless handlers never coalesce.
        for _ in 0..2 {
            queue.push(Arc::new(CountingHandler {
                key: None,
                count: count.clone(),
            }));
        }
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn drain_empties_the_queue() {
        let queue = HandlerQueue::new();
        let count = Arc::new(AtomicUsize::new(0));
        queue.push(Arc::new(CountingHandler {
            key: None,
            count: count.clone(),
        }));

        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }

    #[tokio::test]
    async fn dispatch_runs_handlers_once() {
        let engine = CacheEngine::new(EngineDeps::default());
        let count = Arc::new(AtomicUsize::new(0));
        engine.handlers().push(Arc::new(CountingHandler {
            key: None,
            count: count.clone(),
        }));

        Dispatcher::dispatch(&engine, SendOptions::immediate())
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        Dispatcher::dispatch(&engine, SendOptions::immediate())
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
