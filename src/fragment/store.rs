//! Fragment rows and tree storage.
//!
//! Stand-in for the transactional record store backing the fragment tree.
//! Uniqueness is enforced under a single write lock: find-or-create for the
//! same identity tuple can never produce two rows, no matter how requests
//! interleave.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::fragment::ChildSearchKey;
use crate::lock::{rw_read, rw_write};

/// Row id of a stored fragment.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FragmentId(u64);

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The composite the uniqueness invariant ranges over. Fields that do not
/// apply to a variant are `None` and two fragments differing only in an
/// inapplicable field are the same fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Identity {
    pub variant: String,
    pub parent_id: Option<FragmentId>,
    pub record_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub user_type: Option<String>,
    pub key: Option<String>,
}

/// A node in the cached-content forest.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub id: FragmentId,
    pub variant: String,
    pub parent_id: Option<FragmentId>,
    pub root_id: Option<FragmentId>,
    pub record_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub user_type: Option<String>,
    pub key: Option<String>,
    /// Logical timestamp; advances on every touch and invalidates the
    /// previous cache key.
    pub epoch: u64,
    pub touched_at: OffsetDateTime,
}

impl Fragment {
    /// Current content-store key for this fragment.
    pub fn cache_key(&self) -> String {
        format!("{}/{}-{}", self.variant, self.id, self.epoch)
    }

    /// Prefix matching every epoch's key for this fragment.
    pub fn cache_key_prefix(&self) -> String {
        format!("{}/{}-", self.variant, self.id)
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    fn search_value(&self, key: ChildSearchKey) -> Option<String> {
        match key {
            ChildSearchKey::RecordId => self.record_id.map(|id| id.to_string()),
            ChildSearchKey::Key => self.key.clone(),
        }
    }
}

/// Attributes of a row about to be created.
#[derive(Debug, Clone)]
pub(crate) struct NewFragment {
    pub variant: String,
    pub parent_id: Option<FragmentId>,
    pub root_id: Option<FragmentId>,
    pub record_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub user_type: Option<String>,
    pub key: Option<String>,
}

struct ChildIndex {
    key: ChildSearchKey,
    by_value: HashMap<String, Vec<FragmentId>>,
}

#[derive(Default)]
struct Tables {
    rows: HashMap<FragmentId, Fragment>,
    identities: HashMap<Identity, FragmentId>,
    identity_of: HashMap<FragmentId, Identity>,
    children: HashMap<FragmentId, Vec<FragmentId>>,
    indexes: HashMap<FragmentId, ChildIndex>,
}

/// Storage for the fragment forest.
pub struct FragmentStore {
    tables: RwLock<Tables>,
    next_id: AtomicU64,
    epoch: AtomicU64,
}

impl FragmentStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            next_id: AtomicU64::new(1),
            epoch: AtomicU64::new(0),
        }
    }

    fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst)
    }

    /// Find the unique row for `identity`, creating it from `new` when
    /// absent. Returns the row and whether it was created.
    pub(crate) fn find_or_create(&self, identity: Identity, new: NewFragment) -> (Fragment, bool) {
        let mut tables = rw_write(&self.tables, "fragments.find_or_create");
        if let Some(id) = tables.identities.get(&identity) {
            return (tables.rows[id].clone(), false);
        }

        let id = FragmentId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let row = Fragment {
            id,
            variant: new.variant,
            parent_id: new.parent_id,
            root_id: new.root_id,
            record_id: new.record_id,
            user_id: new.user_id,
            user_type: new.user_type,
            key: new.key,
            epoch: self.next_epoch(),
            touched_at: OffsetDateTime::now_utc(),
        };

        if let Some(parent_id) = row.parent_id {
            tables.children.entry(parent_id).or_default().push(id);
            // Keep an existing child index coherent with the new row.
            if let Some(index) = tables.indexes.get_mut(&parent_id) {
                if let Some(value) = row.search_value(index.key) {
                    index.by_value.entry(value).or_default().push(id);
                }
            }
        }

        tables.identities.insert(identity.clone(), id);
        tables.identity_of.insert(id, identity);
        tables.rows.insert(id, row.clone());
        (row, true)
    }

    pub(crate) fn find(&self, identity: &Identity) -> Option<Fragment> {
        let tables = rw_read(&self.tables, "fragments.find");
        tables
            .identities
            .get(identity)
            .map(|id| tables.rows[id].clone())
    }

    pub fn get(&self, id: FragmentId) -> Option<Fragment> {
        rw_read(&self.tables, "fragments.get").rows.get(&id).cloned()
    }

    pub fn children_of(&self, id: FragmentId) -> Vec<Fragment> {
        let tables = rw_read(&self.tables, "fragments.children_of");
        tables
            .children
            .get(&id)
            .map(|ids| ids.iter().map(|child| tables.rows[child].clone()).collect())
            .unwrap_or_default()
    }

    /// Advance the row's logical timestamp. Returns the updated row.
    pub fn bump_epoch(&self, id: FragmentId) -> Option<Fragment> {
        let epoch = self.next_epoch();
        let mut tables = rw_write(&self.tables, "fragments.bump_epoch");
        let row = tables.rows.get_mut(&id)?;
        row.epoch = epoch;
        row.touched_at = OffsetDateTime::now_utc();
        Some(row.clone())
    }

    /// Delete the row and every descendant. Returns the removed rows.
    pub fn remove_subtree(&self, id: FragmentId) -> Vec<Fragment> {
        let mut tables = rw_write(&self.tables, "fragments.remove_subtree");
        if !tables.rows.contains_key(&id) {
            return Vec::new();
        }

        let mut doomed = vec![id];
        let mut cursor = 0;
        while cursor < doomed.len() {
            if let Some(kids) = tables.children.get(&doomed[cursor]) {
                doomed.extend(kids.iter().copied());
            }
            cursor += 1;
        }

        // Detach the subtree root from its parent before dropping rows.
        if let Some(parent_id) = tables.rows[&id].parent_id {
            if let Some(siblings) = tables.children.get_mut(&parent_id) {
                siblings.retain(|sibling| *sibling != id);
            }
            if let Some(index) = tables.indexes.get_mut(&parent_id) {
                for ids in index.by_value.values_mut() {
                    ids.retain(|entry| *entry != id);
                }
            }
        }

        let mut removed = Vec::with_capacity(doomed.len());
        for id in doomed {
            if let Some(row) = tables.rows.remove(&id) {
                removed.push(row);
            }
            if let Some(identity) = tables.identity_of.remove(&id) {
                tables.identities.remove(&identity);
            }
            tables.children.remove(&id);
            tables.indexes.remove(&id);
        }
        removed
    }

    /// All fragments whose `record_id` matches, optionally restricted to one
    /// variant.
    pub fn fragments_for_record(&self, record_id: Uuid, variant: Option<&str>) -> Vec<Fragment> {
        let tables = rw_read(&self.tables, "fragments.fragments_for_record");
        let mut rows: Vec<Fragment> = tables
            .rows
            .values()
            .filter(|row| row.record_id == Some(record_id))
            .filter(|row| variant.is_none_or(|v| row.variant == v))
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.id);
        rows
    }

    /// Build the keyed child index for `parent`, replacing any previous one.
    pub fn index_children(&self, parent: FragmentId, key: ChildSearchKey) {
        let mut tables = rw_write(&self.tables, "fragments.index_children");
        let mut by_value: HashMap<String, Vec<FragmentId>> = HashMap::new();
        if let Some(kids) = tables.children.get(&parent) {
            for child_id in kids {
                if let Some(value) = tables.rows[child_id].search_value(key) {
                    by_value.entry(value).or_default().push(*child_id);
                }
            }
        }
        tables.indexes.insert(parent, ChildIndex { key, by_value });
    }

    /// Children of `parent` sharing the indexed key value. `None` when no
    /// index has been built for the parent.
    pub fn indexed_children(&self, parent: FragmentId, value: &str) -> Option<Vec<Fragment>> {
        let tables = rw_read(&self.tables, "fragments.indexed_children");
        let index = tables.indexes.get(&parent)?;
        Some(
            index
                .by_value
                .get(value)
                .map(|ids| ids.iter().map(|id| tables.rows[id].clone()).collect())
                .unwrap_or_default(),
        )
    }

    pub fn len(&self) -> usize {
        rw_read(&self.tables, "fragments.len").rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FragmentStore {
    fn default() -> Self {
        Self::new()
    }
}
