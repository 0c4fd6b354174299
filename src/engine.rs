//! The invalidation engine.
//!
//! `CacheEngine` is the explicit context object the whole system hangs off:
//! variant catalog, fragment tree, content store, request queues, session
//! users, subscriber registry, handler queue and job scheduler. There is no
//! ambient global state; embedders construct an engine and pass it where it
//! is needed.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{EventHandlers, RecordEvent, RecordSnapshot, SubscriberRegistry, Subscription};
use crate::config::{Config, UserRef};
use crate::content::{ContentStore, MemoryContentStore};
use crate::error::CacheError;
use crate::fragment::{
    Fragment, FragmentId, FragmentStore, Identity, NewFragment, PathParams, Variant, Variants,
};
use crate::handler::{HandlerQueue, TouchRecordFragments};
use crate::replay::{
    AppDriver, ExternalSession, InternalSession, QueueSet, ReplaySession, RequestQueue,
    SendOptions, Sender, SessionFactory, Target,
};
use crate::schedule::{JobScheduler, MemoryScheduler};
use crate::session_user::{SessionUser, SessionUsers};

/// Identity attributes supplied when finding or creating a fragment. Which
/// ones must be present is decided by the variant. User-scoped attributes
/// can be given directly or derived from a [`UserRef`] via the configured
/// user-type mapping.
#[derive(Debug, Clone, Default)]
pub struct FragmentOptions {
    variant: String,
    record_id: Option<Uuid>,
    user_id: Option<Uuid>,
    user_type: Option<String>,
    key: Option<String>,
    user: Option<UserRef>,
}

impl FragmentOptions {
    pub fn new(variant: impl Into<String>) -> Self {
        Self {
            variant: variant.into(),
            ..Self::default()
        }
    }

    pub fn record_id(mut self, record_id: Uuid) -> Self {
        self.record_id = Some(record_id);
        self
    }

    pub fn user_id(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn user_type(mut self, user_type: impl Into<String>) -> Self {
        self.user_type = Some(user_type.into());
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Derive `user_type` (and `user_id` where required) from the user the
    /// fragment is rendered for. An explicit `user_type`/`user_id` wins.
    pub fn for_user(mut self, user: UserRef) -> Self {
        self.user = Some(user);
        self
    }
}

/// Collaborators the engine is assembled from.
pub struct EngineDeps {
    pub config: Config,
    pub content: Arc<dyn ContentStore>,
    pub scheduler: Arc<dyn JobScheduler>,
    pub sessions: SessionFactory,
}

impl Default for EngineDeps {
    fn default() -> Self {
        Self {
            config: Config::default(),
            content: Arc::new(MemoryContentStore::new()),
            scheduler: Arc::new(MemoryScheduler::new()),
            sessions: Arc::new(|_, _| {
                Err(CacheError::driver("no session transport configured"))
            }),
        }
    }
}

pub struct CacheEngine {
    config: Arc<Config>,
    variants: Variants,
    fragments: FragmentStore,
    content: Arc<dyn ContentStore>,
    queues: QueueSet,
    users: SessionUsers,
    subscribers: SubscriberRegistry,
    handlers: HandlerQueue,
    scheduler: Arc<dyn JobScheduler>,
    sessions: SessionFactory,
}

impl CacheEngine {
    pub fn new(deps: EngineDeps) -> Self {
        Self::assemble(
            Arc::new(deps.config),
            deps.content,
            deps.scheduler,
            deps.sessions,
        )
    }

    /// Engine whose internal queues replay through the given in-process
    /// driver, with in-memory content store and scheduler. Remote targets
    /// configured via `remote_hosts` get real HTTP sessions.
    pub fn in_process(config: Config, driver: Arc<dyn AppDriver>) -> Self {
        let config = Arc::new(config);
        let session_config = config.clone();
        let sessions: SessionFactory = Arc::new(move |user, target| {
            let session: Box<dyn ReplaySession> = match target {
                Target::Internal => Box::new(InternalSession::new(
                    driver.clone(),
                    session_config.clone(),
                    user.clone(),
                )),
                Target::Remote(url) => Box::new(ExternalSession::new(
                    url.clone(),
                    session_config.clone(),
                    user.clone(),
                )?),
            };
            Ok(session)
        });
        Self::assemble(
            config,
            Arc::new(MemoryContentStore::new()),
            Arc::new(MemoryScheduler::new()),
            sessions,
        )
    }

    fn assemble(
        config: Arc<Config>,
        content: Arc<dyn ContentStore>,
        scheduler: Arc<dyn JobScheduler>,
        sessions: SessionFactory,
    ) -> Self {
        Self {
            config,
            variants: Variants::new(),
            fragments: FragmentStore::new(),
            content,
            queues: QueueSet::new(),
            users: SessionUsers::new(),
            subscribers: SubscriberRegistry::new(),
            handlers: HandlerQueue::new(),
            scheduler,
            sessions,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn variants(&self) -> &Variants {
        &self.variants
    }

    pub fn fragments(&self) -> &FragmentStore {
        &self.fragments
    }

    pub fn content(&self) -> &Arc<dyn ContentStore> {
        &self.content
    }

    pub fn queues(&self) -> &QueueSet {
        &self.queues
    }

    pub fn users(&self) -> &SessionUsers {
        &self.users
    }

    pub fn subscribers(&self) -> &SubscriberRegistry {
        &self.subscribers
    }

    pub fn handlers(&self) -> &HandlerQueue {
        &self.handlers
    }

    pub fn scheduler(&self) -> &Arc<dyn JobScheduler> {
        &self.scheduler
    }

    /// Register a variant and wire its implied subscriptions: orphan purge
    /// for record-typed variants, first-request priming for requestable
    /// record-bound variants, and list-membership create handling.
    pub fn register_variant(&self, variant: Variant) -> Arc<Variant> {
        let variant = self.variants.insert(variant);

        if let Some(record_type) = variant.record_type() {
            let mut handlers = EventHandlers::new();
            if variant.requestable() && variant.requires_record_id() {
                let primed = variant.clone();
                handlers = handlers.on_create(move |engine, snapshot| {
                    engine.enqueue_record_request(&primed, snapshot.id);
                });
            }
            let purge_variant = variant.name().to_string();
            let subscription = Subscription::new(variant.name(), record_type, handlers)
                .after_destroy(move |engine, snapshot| {
                    if let Err(err) =
                        engine.remove_fragments_for_record(snapshot.id, Some(&purge_variant))
                    {
                        warn!(
                            target: "tessella::engine",
                            variant = %purge_variant,
                            record_id = %snapshot.id,
                            error = %err,
                            "orphan purge failed"
                        );
                    }
                });
            self.subscribers.subscribe(subscription);
        }

        if let Some(membership) = variant.membership() {
            let accessor = membership.list_record.clone();
            let deferred = membership.deferred;
            let list_variant = variant.name().to_string();
            let subscription = Subscription::new(
                variant.name(),
                membership.membership_type.clone(),
                EventHandlers::new().on_create(move |engine, snapshot| {
                    let Some(list_record_id) = accessor.list_record_id(snapshot) else {
                        warn!(
                            target: "tessella::engine",
                            variant = %list_variant,
                            record_type = %snapshot.record_type,
                            record_id = %snapshot.id,
                            "membership record does not name its list record"
                        );
                        return;
                    };
                    if deferred {
                        engine.handlers().push(Arc::new(TouchRecordFragments::new(
                            list_variant.clone(),
                            list_record_id,
                        )));
                    } else if let Err(err) =
                        engine.touch_fragments_for_record(list_record_id, Some(&list_variant))
                    {
                        warn!(
                            target: "tessella::engine",
                            variant = %list_variant,
                            record_id = %list_record_id,
                            error = %err,
                            "list membership touch failed"
                        );
                    }
                }),
            );
            self.subscribers.subscribe(subscription);
        }

        variant
    }

    pub fn subscribe(&self, subscription: Subscription) -> Arc<Subscription> {
        self.subscribers.subscribe(subscription)
    }

    /// Feed a record lifecycle event into the bus.
    pub fn publish(&self, snapshot: &RecordSnapshot, event: &RecordEvent) {
        self.subscribers.publish(self, snapshot, event);
    }

    fn identity_for(
        &self,
        variant: &Variant,
        options: &FragmentOptions,
        parent: Option<&Fragment>,
    ) -> Result<(Identity, NewFragment), CacheError> {
        let record_id = if variant.requires_record_id() {
            Some(options.record_id.ok_or_else(|| {
                CacheError::missing_attribute(variant.name(), "record_id")
            })?)
        } else {
            None
        };
        let user_id = if variant.requires_user_id() {
            Some(
                options
                    .user_id
                    .or_else(|| options.user.as_ref().and_then(|user| user.id))
                    .ok_or_else(|| CacheError::missing_attribute(variant.name(), "user_id"))?,
            )
        } else {
            None
        };
        let user_type = if variant.requires_user_type() {
            Some(
                options
                    .user_type
                    .clone()
                    .or_else(|| {
                        options
                            .user
                            .as_ref()
                            .map(|user| self.config.user_type(Some(user)))
                    })
                    .ok_or_else(|| CacheError::missing_attribute(variant.name(), "user_type"))?,
            )
        } else {
            None
        };
        let key = if variant.requires_key() {
            Some(options.key.clone().ok_or_else(|| {
                CacheError::missing_attribute(variant.name(), variant.key_attribute())
            })?)
        } else {
            None
        };

        let identity = Identity {
            variant: variant.name().to_string(),
            parent_id: parent.map(|p| p.id),
            record_id,
            user_id,
            user_type: user_type.clone(),
            key: key.clone(),
        };
        let new = NewFragment {
            variant: variant.name().to_string(),
            parent_id: parent.map(|p| p.id),
            root_id: parent.map(|p| p.root_id.unwrap_or(p.id)),
            // A child without its own record requirement carries its
            // parent's record.
            record_id: record_id.or_else(|| parent.and_then(|p| p.record_id)),
            user_id,
            user_type,
            key,
        };
        Ok((identity, new))
    }

    fn index_ahead(&self, variant: &Variant, fragment: &Fragment) {
        if let Some(key) = variant.search_key() {
            self.fragments.index_children(fragment.id, key);
        }
    }

    /// Find or create the unique root fragment for the options.
    pub fn root(&self, options: &FragmentOptions) -> Result<Fragment, CacheError> {
        let variant = self.variants.get(&options.variant)?;
        let (identity, new) = self.identity_for(&variant, options, None)?;
        let (fragment, created) = self.fragments.find_or_create(identity, new);
        if created {
            debug!(
                target: "tessella::engine",
                variant = variant.name(),
                fragment = %fragment.id,
                "root fragment created"
            );
        }
        self.index_ahead(&variant, &fragment);
        Ok(fragment)
    }

    /// Lookup-only counterpart of [`root`](Self::root).
    pub fn existing(&self, options: &FragmentOptions) -> Result<Option<Fragment>, CacheError> {
        let variant = self.variants.get(&options.variant)?;
        let (identity, _) = self.identity_for(&variant, options, None)?;
        let found = self.fragments.find(&identity);
        if let Some(fragment) = &found {
            self.index_ahead(&variant, fragment);
        }
        Ok(found)
    }

    /// Find or create a child under `parent_id`. Creation attaches the
    /// child but never touches the parent; a bare child-count change is not
    /// a content change.
    pub fn child(
        &self,
        parent_id: FragmentId,
        options: &FragmentOptions,
    ) -> Result<Fragment, CacheError> {
        let parent = self
            .fragments
            .get(parent_id)
            .ok_or(CacheError::UnknownFragment(parent_id))?;
        let variant = self.variants.get(&options.variant)?;
        self.check_record_consistency(&variant, options, &parent)?;
        let (identity, new) = self.identity_for(&variant, options, Some(&parent))?;
        let (fragment, created) = self.fragments.find_or_create(identity, new);
        if created {
            debug!(
                target: "tessella::engine",
                variant = variant.name(),
                fragment = %fragment.id,
                parent = %parent_id,
                "child fragment created"
            );
        }
        self.index_ahead(&variant, &fragment);
        Ok(fragment)
    }

    /// Lookup-only counterpart of [`child`](Self::child).
    pub fn existing_child(
        &self,
        parent_id: FragmentId,
        options: &FragmentOptions,
    ) -> Result<Option<Fragment>, CacheError> {
        let parent = self
            .fragments
            .get(parent_id)
            .ok_or(CacheError::UnknownFragment(parent_id))?;
        let variant = self.variants.get(&options.variant)?;
        self.check_record_consistency(&variant, options, &parent)?;
        let (identity, _) = self.identity_for(&variant, options, Some(&parent))?;
        let found = self.fragments.find(&identity);
        if let Some(fragment) = &found {
            self.index_ahead(&variant, fragment);
        }
        Ok(found)
    }

    /// A child that inherits its record must not claim a different record
    /// than the parent carries.
    fn check_record_consistency(
        &self,
        variant: &Variant,
        options: &FragmentOptions,
        parent: &Fragment,
    ) -> Result<(), CacheError> {
        if variant.requires_record_id() {
            return Ok(());
        }
        if let (Some(claimed), Some(inherited)) = (options.record_id, parent.record_id) {
            if claimed != inherited {
                return Err(CacheError::identity_mismatch(
                    parent.id,
                    format!("record {claimed} is not the parent's record {inherited}"),
                ));
            }
        }
        Ok(())
    }

    /// Touch: bump the fragment's epoch, queue its re-priming request, and
    /// propagate up the ancestor chain.
    pub fn touch(&self, id: FragmentId) -> Result<(), CacheError> {
        self.touch_inner(id, true)
    }

    /// Touch without queueing this fragment's own request. Ancestors still
    /// queue theirs; queue dedup keeps the fan-out bounded.
    pub fn touch_no_request(&self, id: FragmentId) -> Result<(), CacheError> {
        self.touch_inner(id, false)
    }

    fn touch_inner(&self, id: FragmentId, own_request: bool) -> Result<(), CacheError> {
        let row = self
            .fragments
            .bump_epoch(id)
            .ok_or(CacheError::UnknownFragment(id))?;
        debug!(
            target: "tessella::engine",
            fragment = %id,
            variant = %row.variant,
            epoch = row.epoch,
            "fragment touched"
        );
        if own_request {
            self.enqueue_request_for(&row)?;
        }
        if let Some(parent_id) = row.parent_id {
            self.touch_inner(parent_id, true)?;
        }
        Ok(())
    }

    fn enqueue_request_for(&self, row: &Fragment) -> Result<(), CacheError> {
        let variant = self.variants.get(&row.variant)?;
        let Some(template) = variant.request_template() else {
            return Ok(());
        };
        let request = template.build(&PathParams::from(row));
        let user_types = match &row.user_type {
            Some(user_type) => vec![user_type.clone()],
            None => variant.user_types(&self.config),
        };
        for user_type in &user_types {
            for target in self.targets() {
                self.queues.fetch(user_type, &target).push(request.clone());
            }
        }
        Ok(())
    }

    fn enqueue_record_request(&self, variant: &Variant, record_id: Uuid) {
        let Some(template) = variant.request_template() else {
            return;
        };
        let request = template.build(&PathParams::for_record(record_id));
        for user_type in variant.user_types(&self.config) {
            for target in self.targets() {
                self.queues.fetch(&user_type, &target).push(request.clone());
            }
        }
    }

    fn targets(&self) -> Vec<Target> {
        let mut targets = vec![Target::Internal];
        targets.extend(self.config.remote_hosts.iter().cloned().map(Target::Remote));
        targets
    }

    /// Destroy the fragment and its subtree: cache entries first (exact key
    /// for this fragment unless `delete_matches`, prefix for descendants),
    /// then the rows, then a propagating touch of the former parent.
    pub fn destroy(&self, id: FragmentId, delete_matches: bool) -> Result<(), CacheError> {
        let removed = self.fragments.remove_subtree(id);
        let Some(first) = removed.first() else {
            return Err(CacheError::UnknownFragment(id));
        };
        let parent_id = first.parent_id;
        for row in &removed {
            if row.id == id && !delete_matches {
                self.content.delete(&row.cache_key());
            } else {
                self.content.delete_matching(&row.cache_key_prefix());
            }
        }
        info!(
            target: "tessella::engine",
            fragment = %id,
            removed = removed.len(),
            "fragment subtree destroyed"
        );
        if let Some(parent_id) = parent_id {
            self.touch_inner(parent_id, true)?;
        }
        Ok(())
    }

    /// Touch every leaf of the subtree; propagation covers internal nodes.
    pub fn touch_tree(&self, id: FragmentId) -> Result<(), CacheError> {
        let children = self.fragments.children_of(id);
        if children.is_empty() {
            return self.touch(id);
        }
        for child in children {
            self.touch_tree(child.id)?;
        }
        Ok(())
    }

    /// Prune the subtree against the content store. The store is
    /// authoritative: a fragment with no current cache entry is destroyed
    /// with its descendants, even if it was simply never rendered. Callers
    /// creating fragments outside rendering should write content before
    /// pruning runs.
    pub fn touch_or_destroy(&self, id: FragmentId) -> Result<(), CacheError> {
        let row = self
            .fragments
            .get(id)
            .ok_or(CacheError::UnknownFragment(id))?;
        if self.content.exists(&row.cache_key()) {
            let children = self.fragments.children_of(id);
            if children.is_empty() {
                return self.touch_no_request(id);
            }
            for child in children {
                self.touch_or_destroy(child.id)?;
            }
            Ok(())
        } else {
            debug!(
                target: "tessella::engine",
                fragment = %id,
                variant = %row.variant,
                "cache entry absent; pruning subtree"
            );
            self.destroy(id, false)
        }
    }

    /// Touch every fragment tied to a record, optionally one variant only.
    pub fn touch_fragments_for_record(
        &self,
        record_id: Uuid,
        variant: Option<&str>,
    ) -> Result<(), CacheError> {
        for row in self.fragments.fragments_for_record(record_id, variant) {
            // An earlier touch cannot remove rows, but destroy-driven
            // callers share this loop shape; stay tolerant of vanished rows.
            if self.fragments.get(row.id).is_some() {
                self.touch(row.id)?;
            }
        }
        Ok(())
    }

    /// Destroy every fragment tied to a record, optionally one variant only.
    pub fn remove_fragments_for_record(
        &self,
        record_id: Uuid,
        variant: Option<&str>,
    ) -> Result<(), CacheError> {
        for row in self.fragments.fragments_for_record(record_id, variant) {
            // A fragment listed earlier may sit inside a subtree already
            // removed by this loop.
            if self.fragments.get(row.id).is_some() {
                self.destroy(row.id, false)?;
            }
        }
        Ok(())
    }

    /// Pull queued requests for a path from every queue of the user type.
    /// Used when the fragment that generated them is invalidated before
    /// replay. Returns how many were removed.
    pub fn remove_queued_request(&self, user_type: &str, path: &str) -> usize {
        self.queues
            .for_user_type(user_type)
            .iter()
            .map(|queue| queue.remove_path(path))
            .sum()
    }

    /// The sender for one queue, signed in as the queue's session user or
    /// anonymously when none is registered.
    pub fn sender_for(&self, queue: &Arc<RequestQueue>) -> Sender {
        let user = self
            .users
            .fetch(queue.user_type())
            .unwrap_or_else(|| SessionUser::anonymous(queue.user_type()));
        Sender::new(
            queue.clone(),
            user,
            self.sessions.clone(),
            self.scheduler.clone(),
        )
    }

    pub async fn start_queue(
        &self,
        queue: &Arc<RequestQueue>,
        options: SendOptions,
    ) -> Result<(), CacheError> {
        self.sender_for(queue).start(options).await
    }

    pub async fn start_all_queues(&self, options: SendOptions) -> Result<(), CacheError> {
        for queue in self.queues.all() {
            self.start_queue(&queue, options).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::fragment::{ChildSearchKey, ListMembership, ListRecordAccessor, RequestTemplate};

    fn engine() -> CacheEngine {
        let engine = CacheEngine::new(EngineDeps::default());
        engine.register_variant(
            Variant::new("page")
                .needs_record_id("Article")
                .child_search_key(ChildSearchKey::Key)
                .request(RequestTemplate::get(|params| {
                    format!(
                        "/articles/{}",
                        params.record_id.map(|id| id.to_string()).unwrap_or_default()
                    )
                })),
        );
        engine.register_variant(Variant::new("section").needs_key());
        engine.register_variant(Variant::new("item").needs_key());
        engine
    }

    fn page_options(record_id: Uuid) -> FragmentOptions {
        FragmentOptions::new("page").record_id(record_id)
    }

    #[test]
    fn root_is_unique_per_identity() {
        let engine = engine();
        let record = Uuid::new_v4();
        let a = engine.root(&page_options(record)).unwrap();
        let b = engine.root(&page_options(record)).unwrap();
        assert_eq!(a.id, b.id);

        let other = engine.root(&page_options(Uuid::new_v4())).unwrap();
        assert_ne!(a.id, other.id);
    }

    #[test]
    fn missing_attribute_names_the_field() {
        let engine = engine();
        let err = engine
            .root(&FragmentOptions::new("page"))
            .expect_err("record id required");
        assert!(
            matches!(err, CacheError::MissingAttribute { ref attribute, .. } if attribute == "record_id")
        );

        let root = engine.root(&page_options(Uuid::new_v4())).unwrap();
        let err = engine
            .child(root.id, &FragmentOptions::new("section"))
            .expect_err("key required");
        assert!(
            matches!(err, CacheError::MissingAttribute { ref attribute, .. } if attribute == "key")
        );
    }

    #[test]
    fn user_classification_goes_through_the_config_mapping() {
        let config = Config {
            user_type_mapping: Arc::new(|user| {
                match user {
                    Some(user) if user.admin => "admin",
                    Some(user) if user.id.is_some() => "signed_in",
                    _ => "signed_out",
                }
                .to_string()
            }),
            ..Config::default()
        };
        let engine = CacheEngine::new(EngineDeps {
            config,
            ..EngineDeps::default()
        });
        engine.register_variant(
            Variant::new("panel")
                .needs_user_id()
                .needs_user_type(vec!["signed_in".to_string(), "admin".to_string()]),
        );

        let admin_id = Uuid::new_v4();
        let admin = UserRef {
            id: Some(admin_id),
            admin: true,
        };
        let fragment = engine
            .root(&FragmentOptions::new("panel").for_user(admin))
            .unwrap();
        assert_eq!(fragment.user_type.as_deref(), Some("admin"));
        assert_eq!(fragment.user_id, Some(admin_id));

        let member = engine
            .root(&FragmentOptions::new("panel").for_user(UserRef::signed_in(Uuid::new_v4())))
            .unwrap();
        assert_eq!(member.user_type.as_deref(), Some("signed_in"));

        // An explicit user_type overrides the derived one.
        let pinned = engine
            .root(
                &FragmentOptions::new("panel")
                    .user_type("signed_in")
                    .for_user(UserRef {
                        id: Some(Uuid::new_v4()),
                        admin: true,
                    }),
            )
            .unwrap();
        assert_eq!(pinned.user_type.as_deref(), Some("signed_in"));
    }

    #[test]
    fn unknown_variant_is_rejected() {
        let engine = engine();
        let err = engine
            .root(&FragmentOptions::new("missing"))
            .expect_err("unregistered variant");
        assert!(matches!(err, CacheError::UnknownVariant(_)));
    }

    #[test]
    fn existing_never_creates() {
        let engine = engine();
        let record = Uuid::new_v4();
        assert!(engine.existing(&page_options(record)).unwrap().is_none());

        engine.root(&page_options(record)).unwrap();
        assert!(engine.existing(&page_options(record)).unwrap().is_some());
    }

    #[test]
    fn child_inherits_record_and_root() {
        let engine = engine();
        let record = Uuid::new_v4();
        let root = engine.root(&page_options(record)).unwrap();
        let child = engine
            .child(root.id, &FragmentOptions::new("section").key("a"))
            .unwrap();
        assert_eq!(child.record_id, Some(record));
        assert_eq!(child.root_id, Some(root.id));

        let grandchild = engine
            .child(child.id, &FragmentOptions::new("item").key("x"))
            .unwrap();
        assert_eq!(grandchild.root_id, Some(root.id));
        assert_eq!(grandchild.record_id, Some(record));
    }

    #[test]
    fn claiming_a_foreign_record_is_an_identity_mismatch() {
        let engine = engine();
        let root = engine.root(&page_options(Uuid::new_v4())).unwrap();
        let err = engine
            .child(
                root.id,
                &FragmentOptions::new("section")
                    .key("a")
                    .record_id(Uuid::new_v4()),
            )
            .expect_err("foreign record id");
        assert!(matches!(err, CacheError::IdentityMismatch { .. }));
    }

    #[test]
    fn touch_propagates_to_ancestors_once() {
        let engine = engine();
        let record = Uuid::new_v4();
        let root = engine.root(&page_options(record)).unwrap();
        let child = engine
            .child(root.id, &FragmentOptions::new("section").key("a"))
            .unwrap();
        let sibling = engine
            .child(root.id, &FragmentOptions::new("section").key("b"))
            .unwrap();
        let grandchild = engine
            .child(child.id, &FragmentOptions::new("item").key("x"))
            .unwrap();

        let root_epoch = engine.fragments().get(root.id).unwrap().epoch;
        let sibling_epoch = engine.fragments().get(sibling.id).unwrap().epoch;

        engine.touch(grandchild.id).unwrap();

        // Whole ancestor chain advanced, untouched branch did not.
        assert!(engine.fragments().get(grandchild.id).unwrap().epoch > grandchild.epoch);
        assert!(engine.fragments().get(child.id).unwrap().epoch > child.epoch);
        assert!(engine.fragments().get(root.id).unwrap().epoch > root_epoch);
        assert_eq!(engine.fragments().get(sibling.id).unwrap().epoch, sibling_epoch);

        // Exactly one request, despite three touch events along the chain.
        let queue = engine.queues().fetch("signed_in", &Target::Internal);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.requests()[0].path, format!("/articles/{record}"));
    }

    #[test]
    fn child_creation_does_not_touch_the_parent() {
        let engine = engine();
        let root = engine.root(&page_options(Uuid::new_v4())).unwrap();
        engine
            .child(root.id, &FragmentOptions::new("section").key("a"))
            .unwrap();

        assert_eq!(engine.fragments().get(root.id).unwrap().epoch, root.epoch);
        assert!(engine.queues().is_empty());
    }

    #[test]
    fn destroy_cascades_rows_and_cache_entries() {
        let engine = engine();
        let root = engine.root(&page_options(Uuid::new_v4())).unwrap();
        let child = engine
            .child(root.id, &FragmentOptions::new("section").key("a"))
            .unwrap();
        let grandchild = engine
            .child(child.id, &FragmentOptions::new("item").key("x"))
            .unwrap();

        for fragment in [&child, &grandchild] {
            engine
                .content()
                .write(&fragment.cache_key(), Bytes::from("rendered"));
        }

        engine.destroy(child.id, false).unwrap();

        assert!(engine.fragments().get(child.id).is_none());
        assert!(engine.fragments().get(grandchild.id).is_none());
        assert!(!engine.content().exists(&child.cache_key()));
        assert!(!engine.content().exists(&grandchild.cache_key()));

        // The destroyed node's parent was touched, with its request queued.
        assert!(engine.fragments().get(root.id).unwrap().epoch > root.epoch);
        assert_eq!(
            engine.queues().fetch("signed_in", &Target::Internal).len(),
            1
        );
    }

    #[test]
    fn touch_tree_touches_leaves_and_lets_propagation_cover_parents() {
        let engine = engine();
        let root = engine.root(&page_options(Uuid::new_v4())).unwrap();
        let child = engine
            .child(root.id, &FragmentOptions::new("section").key("a"))
            .unwrap();
        let leaf_a = engine
            .child(child.id, &FragmentOptions::new("item").key("x"))
            .unwrap();
        let leaf_b = engine
            .child(child.id, &FragmentOptions::new("item").key("y"))
            .unwrap();

        engine.touch_tree(root.id).unwrap();

        for fragment in [&root, &child, &leaf_a, &leaf_b] {
            assert!(engine.fragments().get(fragment.id).unwrap().epoch > fragment.epoch);
        }
    }

    #[test]
    fn touch_or_destroy_prunes_by_store_authority() {
        let engine = engine();
        let root = engine.root(&page_options(Uuid::new_v4())).unwrap();
        let child = engine
            .child(root.id, &FragmentOptions::new("section").key("a"))
            .unwrap();
        let grandchild = engine
            .child(child.id, &FragmentOptions::new("item").key("x"))
            .unwrap();

        // Parent entry absent, child entries present: store wins, subtree
        // goes away wholesale.
        engine
            .content()
            .write(&grandchild.cache_key(), Bytes::from("rendered"));
        engine
            .content()
            .write(&root.cache_key(), Bytes::from("rendered"));

        engine.touch_or_destroy(root.id).unwrap();

        assert!(engine.fragments().get(root.id).is_some());
        assert!(engine.fragments().get(child.id).is_none());
        assert!(engine.fragments().get(grandchild.id).is_none());
        assert!(!engine.content().exists(&grandchild.cache_key()));
    }

    #[test]
    fn touch_or_destroy_touches_present_leaves_without_requests() {
        let engine = engine();
        let record = Uuid::new_v4();
        let root = engine.root(&page_options(record)).unwrap();
        engine
            .content()
            .write(&root.cache_key(), Bytes::from("rendered"));

        engine.touch_or_destroy(root.id).unwrap();

        assert!(engine.fragments().get(root.id).unwrap().epoch > root.epoch);
        assert!(engine.queues().is_empty());
    }

    #[test]
    fn requests_fan_out_per_user_type_and_target() {
        let mut config = Config::default();
        config.default_user_types = vec!["signed_in".to_string(), "admin".to_string()];
        config.remote_hosts = vec!["https://mirror.example.com".parse().unwrap()];
        let engine = CacheEngine::new(EngineDeps {
            config,
            ..EngineDeps::default()
        });
        engine.register_variant(
            Variant::new("page")
                .needs_record_id("Article")
                .request(RequestTemplate::get(|params| {
                    format!(
                        "/articles/{}",
                        params.record_id.map(|id| id.to_string()).unwrap_or_default()
                    )
                })),
        );

        let root = engine.root(&page_options(Uuid::new_v4())).unwrap();
        engine.touch(root.id).unwrap();

        // Two user types times two targets.
        assert_eq!(engine.queues().len(), 4);
        for queue in engine.queues().all() {
            assert_eq!(queue.len(), 1);
        }
    }

    #[test]
    fn record_creation_primes_the_request_queue() {
        let engine = engine();
        let record = Uuid::new_v4();
        engine.publish(
            &RecordSnapshot::new("Article", record),
            &RecordEvent::Created,
        );

        let queue = engine.queues().fetch("signed_in", &Target::Internal);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.requests()[0].path, format!("/articles/{record}"));
    }

    #[test]
    fn record_destruction_purges_orphaned_fragments() {
        let engine = engine();
        let record = Uuid::new_v4();
        let root = engine.root(&page_options(record)).unwrap();
        engine
            .child(root.id, &FragmentOptions::new("section").key("a"))
            .unwrap();

        engine.publish(
            &RecordSnapshot::new("Article", record),
            &RecordEvent::Destroyed,
        );

        assert!(engine.fragments().is_empty());
    }

    #[test]
    fn list_membership_creation_touches_the_list() {
        let engine = CacheEngine::new(EngineDeps::default());
        engine.register_variant(
            Variant::new("comment_list")
                .needs_record_id("Article")
                .list_membership(ListMembership {
                    membership_type: "Comment".to_string(),
                    list_record: ListRecordAccessor::Field("article_id".to_string()),
                    deferred: false,
                }),
        );

        let article = Uuid::new_v4();
        let list = engine
            .root(&FragmentOptions::new("comment_list").record_id(article))
            .unwrap();

        let comment = RecordSnapshot::new("Comment", Uuid::new_v4())
            .with_field("article_id", serde_json::json!(article.to_string()));
        engine.publish(&comment, &RecordEvent::Created);

        assert!(engine.fragments().get(list.id).unwrap().epoch > list.epoch);
    }

    #[test]
    fn deferred_list_membership_coalesces_into_one_handler() {
        let engine = CacheEngine::new(EngineDeps::default());
        engine.register_variant(
            Variant::new("comment_list")
                .needs_record_id("Article")
                .list_membership(ListMembership {
                    membership_type: "Comment".to_string(),
                    list_record: ListRecordAccessor::Field("article_id".to_string()),
                    deferred: true,
                }),
        );

        let article = Uuid::new_v4();
        let list = engine
            .root(&FragmentOptions::new("comment_list").record_id(article))
            .unwrap();

        for _ in 0..3 {
            let comment = RecordSnapshot::new("Comment", Uuid::new_v4())
                .with_field("article_id", serde_json::json!(article.to_string()));
            engine.publish(&comment, &RecordEvent::Created);
        }

        assert_eq!(engine.handlers().len(), 1);
        assert_eq!(engine.fragments().get(list.id).unwrap().epoch, list.epoch);

        for handler in engine.handlers().drain() {
            handler.call(&engine);
        }
        assert!(engine.fragments().get(list.id).unwrap().epoch > list.epoch);
    }

    #[test]
    fn remove_queued_request_pulls_from_every_matching_queue() {
        let engine = engine();
        let record = Uuid::new_v4();
        let root = engine.root(&page_options(record)).unwrap();
        engine.touch(root.id).unwrap();

        let path = format!("/articles/{record}");
        assert_eq!(engine.remove_queued_request("signed_in", &path), 1);
        assert!(
            engine
                .queues()
                .fetch("signed_in", &Target::Internal)
                .is_empty()
        );
    }
}
