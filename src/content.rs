//! Content store seam.
//!
//! The engine does not own the rendered-content cache; it drives an external
//! key/value store through [`ContentStore`]. Eviction is entirely explicit —
//! entries disappear only through `delete`/`delete_matching` issued by the
//! invalidation engine.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;

use crate::lock::{rw_read, rw_write};

/// External key/value store holding rendered fragment content.
///
/// Keys are composed by the engine as `{variant}/{fragment_id}-{epoch}`;
/// `delete_matching` receives the `{variant}/{fragment_id}` prefix so stale
/// epoch-suffixed entries can be removed together.
pub trait ContentStore: Send + Sync {
    fn read(&self, key: &str) -> Option<Bytes>;
    fn write(&self, key: &str, value: Bytes);
    fn delete(&self, key: &str);
    fn delete_matching(&self, prefix: &str);
    fn exists(&self, key: &str) -> bool;
}

/// In-memory [`ContentStore`] used by tests and by embedders without an
/// external cache.
pub struct MemoryContentStore {
    entries: RwLock<HashMap<String, Bytes>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, "content.len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryContentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentStore for MemoryContentStore {
    fn read(&self, key: &str) -> Option<Bytes> {
        rw_read(&self.entries, "content.read").get(key).cloned()
    }

    fn write(&self, key: &str, value: Bytes) {
        rw_write(&self.entries, "content.write").insert(key.to_string(), value);
    }

    fn delete(&self, key: &str) {
        rw_write(&self.entries, "content.delete").remove(key);
    }

    fn delete_matching(&self, prefix: &str) {
        rw_write(&self.entries, "content.delete_matching")
            .retain(|key, _| !key.starts_with(prefix));
    }

    fn exists(&self, key: &str) -> bool {
        rw_read(&self.entries, "content.exists").contains_key(key)
    }
}
