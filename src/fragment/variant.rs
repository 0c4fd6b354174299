//! Variant catalog.
//!
//! A variant is a fragment's type tag: it declares which identity attributes
//! the fragment requires, how its children are indexed, which user types it
//! is rendered for, and how to build the request that regenerates it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::bus::RecordSnapshot;
use crate::config::Config;
use crate::error::CacheError;
use crate::fragment::Fragment;
use crate::lock::{rw_read, rw_write};
use crate::replay::{Request, RequestMethod, RequestOptions};

/// Which child attribute a parent indexes its children by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSearchKey {
    RecordId,
    Key,
}

/// Inputs available to a request-path builder.
///
/// A path is built either from a stored fragment or, for create-event
/// re-priming, from a bare record id.
#[derive(Debug, Clone, Default)]
pub struct PathParams {
    pub record_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub key: Option<String>,
}

impl PathParams {
    pub fn for_record(record_id: Uuid) -> Self {
        Self {
            record_id: Some(record_id),
            ..Default::default()
        }
    }
}

impl From<&Fragment> for PathParams {
    fn from(fragment: &Fragment) -> Self {
        Self {
            record_id: fragment.record_id,
            user_id: fragment.user_id,
            key: fragment.key.clone(),
        }
    }
}

pub type PathFn = Arc<dyn Fn(&PathParams) -> String + Send + Sync>;

/// How a variant's content is regenerated: the request replayed after the
/// fragment is touched.
#[derive(Clone)]
pub struct RequestTemplate {
    pub method: RequestMethod,
    pub path: PathFn,
    pub parameters: Vec<(String, String)>,
    pub xhr: bool,
}

impl RequestTemplate {
    pub fn get(path: impl Fn(&PathParams) -> String + Send + Sync + 'static) -> Self {
        Self {
            method: RequestMethod::Get,
            path: Arc::new(path),
            parameters: Vec::new(),
            xhr: false,
        }
    }

    pub fn xhr(mut self) -> Self {
        self.xhr = true;
        self
    }

    pub fn with_parameters(mut self, parameters: Vec<(String, String)>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn build(&self, params: &PathParams) -> Request {
        Request::new(
            self.method,
            (self.path)(params),
            self.parameters.clone(),
            RequestOptions { xhr: self.xhr },
        )
    }
}

/// Derives the owning list's record id from a membership record.
#[derive(Clone)]
pub enum ListRecordAccessor {
    /// Read a field off the membership snapshot (must hold a UUID string).
    Field(String),
    /// Arbitrary derivation.
    Fn(Arc<dyn Fn(&RecordSnapshot) -> Option<Uuid> + Send + Sync>),
}

impl ListRecordAccessor {
    pub fn list_record_id(&self, record: &RecordSnapshot) -> Option<Uuid> {
        match self {
            Self::Field(name) => record
                .fields
                .get(name)
                .and_then(|value| value.as_str())
                .and_then(|s| Uuid::parse_str(s).ok()),
            Self::Fn(f) => f(record),
        }
    }
}

/// Configures a list-style variant: its items are created by membership
/// records of another class, and a membership creation touches the list.
#[derive(Clone)]
pub struct ListMembership {
    /// Record class whose creations define list membership.
    pub membership_type: String,
    /// How a membership record identifies the owning list's record id.
    pub list_record: ListRecordAccessor,
    /// Queue the touch as a deferred handler so many creations within one
    /// unit of work coalesce into a single touch per record.
    pub deferred: bool,
}

/// A fragment variant: identity requirements plus behavior.
#[derive(Clone)]
pub struct Variant {
    name: String,
    needs_record_id: bool,
    record_type: Option<String>,
    needs_user_id: bool,
    needs_user_type: bool,
    user_types: Option<Vec<String>>,
    needs_key: bool,
    key_name: Option<String>,
    child_search_key: Option<ChildSearchKey>,
    request: Option<RequestTemplate>,
    list_membership: Option<ListMembership>,
}

impl Variant {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            needs_record_id: false,
            record_type: None,
            needs_user_id: false,
            needs_user_type: false,
            user_types: None,
            needs_key: false,
            key_name: None,
            child_search_key: None,
            request: None,
            list_membership: None,
        }
    }

    /// Require an explicit record id, referring to the given record class.
    ///
    /// Without this, a child inherits its record id from its parent.
    pub fn needs_record_id(mut self, record_type: impl Into<String>) -> Self {
        self.needs_record_id = true;
        self.record_type = Some(record_type.into());
        self
    }

    pub fn needs_user_id(mut self) -> Self {
        self.needs_user_id = true;
        self
    }

    /// Require a user type, and restrict request fan-out to the given types.
    pub fn needs_user_type(mut self, user_types: Vec<String>) -> Self {
        self.needs_user_type = true;
        self.user_types = Some(user_types);
        self
    }

    pub fn needs_key(mut self) -> Self {
        self.needs_key = true;
        self
    }

    /// Like [`needs_key`](Self::needs_key), but names the key for error
    /// messages (e.g. a `section` variant keyed by `heading`).
    pub fn needs_key_named(mut self, key_name: impl Into<String>) -> Self {
        self.needs_key = true;
        self.key_name = Some(key_name.into());
        self
    }

    pub fn child_search_key(mut self, key: ChildSearchKey) -> Self {
        self.child_search_key = Some(key);
        self
    }

    pub fn request(mut self, template: RequestTemplate) -> Self {
        self.request = Some(template);
        self
    }

    /// Declare this a list variant whose items track membership records.
    /// Implies children are searched by record id.
    pub fn list_membership(mut self, membership: ListMembership) -> Self {
        self.list_membership = Some(membership);
        self.child_search_key = Some(ChildSearchKey::RecordId);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn requires_record_id(&self) -> bool {
        self.needs_record_id
    }

    pub fn requires_user_id(&self) -> bool {
        self.needs_user_id
    }

    pub fn requires_user_type(&self) -> bool {
        self.needs_user_type
    }

    pub fn requires_key(&self) -> bool {
        self.needs_key
    }

    /// Attribute name reported when the key is missing.
    pub fn key_attribute(&self) -> &str {
        self.key_name.as_deref().unwrap_or("key")
    }

    pub fn record_type(&self) -> Option<&str> {
        self.record_type.as_deref()
    }

    pub fn search_key(&self) -> Option<ChildSearchKey> {
        self.child_search_key
    }

    pub fn request_template(&self) -> Option<&RequestTemplate> {
        self.request.as_ref()
    }

    pub fn requestable(&self) -> bool {
        self.request.is_some()
    }

    pub fn membership(&self) -> Option<&ListMembership> {
        self.list_membership.as_ref()
    }

    /// User types this variant's requests fan out to.
    pub fn user_types(&self, config: &Config) -> Vec<String> {
        self.user_types
            .clone()
            .unwrap_or_else(|| config.default_user_types.clone())
    }
}

impl fmt::Debug for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variant")
            .field("name", &self.name)
            .field("needs_record_id", &self.needs_record_id)
            .field("record_type", &self.record_type)
            .field("needs_user_id", &self.needs_user_id)
            .field("needs_user_type", &self.needs_user_type)
            .field("needs_key", &self.needs_key)
            .field("child_search_key", &self.child_search_key)
            .field("requestable", &self.request.is_some())
            .finish_non_exhaustive()
    }
}

/// Catalog of registered variants, keyed by name.
pub struct Variants {
    variants: RwLock<HashMap<String, Arc<Variant>>>,
}

impl Variants {
    pub fn new() -> Self {
        Self {
            variants: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, variant: Variant) -> Arc<Variant> {
        let variant = Arc::new(variant);
        rw_write(&self.variants, "variants.insert")
            .insert(variant.name().to_string(), variant.clone());
        variant
    }

    pub fn get(&self, name: &str) -> Result<Arc<Variant>, CacheError> {
        rw_read(&self.variants, "variants.get")
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::UnknownVariant(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        rw_read(&self.variants, "variants.names").keys().cloned().collect()
    }
}

impl Default for Variants {
    fn default() -> Self {
        Self::new()
    }
}
