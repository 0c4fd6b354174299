//! Fragment-tree cache invalidation and re-priming.
//!
//! Rendered page fragments are tracked as a forest of [`Fragment`] rows:
//! each node pairs a content-store key with a tree position, and touching a
//! node bumps its epoch (invalidating the old key), queues a request that
//! regenerates the content, and propagates up the ancestor chain. Domain
//! record changes enter through the [`bus`], which fans lifecycle events out
//! to per-variant subscriptions; queued requests are replayed by the
//! [`replay`] layer as signed-in users, either in-process or over HTTP.
//!
//! Everything hangs off an explicit [`CacheEngine`]; there is no global
//! state. External collaborators plug in behind seams: the rendered-content
//! cache ([`ContentStore`]), the deferred-job backend
//! ([`schedule::JobScheduler`]) and the application itself
//! ([`replay::AppDriver`]).

pub mod bus;
pub mod config;
pub mod content;
pub mod engine;
pub mod error;
pub mod fragment;
pub mod handler;
mod lock;
pub mod replay;
pub mod schedule;
pub mod session_user;

pub use bus::{EventHandlers, RecordEvent, RecordSnapshot, Subscription};
pub use config::{Config, UserRef};
pub use content::{ContentStore, MemoryContentStore};
pub use engine::{CacheEngine, EngineDeps, FragmentOptions};
pub use error::CacheError;
pub use fragment::{
    ChildSearchKey, Fragment, FragmentId, ListMembership, ListRecordAccessor, RequestTemplate,
    Variant,
};
pub use handler::Dispatcher;
pub use replay::{
    AppDriver, DriverResponse, Request, RequestMethod, RequestOptions, SendOptions, Target,
};
pub use schedule::{JobScheduler, MemoryScheduler};
pub use session_user::{Credentials, SessionUser};
