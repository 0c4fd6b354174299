//! Request replay: queued re-priming requests, per-user queues, sessions
//! that deliver them, and the sender that drains queues.

mod queue;
mod request;
mod sender;
mod session;

pub use queue::{QueueKey, QueueSet, RequestQueue, Target};
pub use request::{Request, RequestMethod, RequestOptions};
pub use sender::{SendOptions, Sender, SessionFactory};
pub use session::{
    AppDriver, DriverResponse, ExternalSession, InternalSession, ReplaySession,
    extract_csrf_token,
};
