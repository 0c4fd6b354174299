//! Session user catalog.
//!
//! Replay sessions authenticate as a representative user of each user type.
//! The catalog maps user-type labels to sign-in credentials; credentials are
//! either a static parameter set or a function evaluated when the session is
//! opened, so rotating test-user passwords are read at send time.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::CacheError;
use crate::lock::{rw_read, rw_write};

/// Sign-in form parameters for one user class.
#[derive(Clone)]
pub enum Credentials {
    /// Fixed parameter pairs posted to the sign-in path.
    Static(Vec<(String, String)>),
    /// Evaluated when a session signs in.
    Deferred(Arc<dyn Fn() -> Vec<(String, String)> + Send + Sync>),
}

impl Credentials {
    pub fn resolve(&self) -> Vec<(String, String)> {
        match self {
            Self::Static(params) => params.clone(),
            Self::Deferred(f) => f(),
        }
    }

    /// Whether a redefinition with `other` is the same registration.
    ///
    /// Deferred credentials compare by function identity; two distinct
    /// closures are treated as conflicting even if they would produce the
    /// same parameters.
    fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Static(a), Self::Static(b)) => a == b,
            (Self::Deferred(a), Self::Deferred(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// One user class and how its replay session signs in.
///
/// A `None` credential set describes an unauthenticated class (e.g.
/// `signed_out`): sessions for it skip the sign-in handshake.
#[derive(Clone)]
pub struct SessionUser {
    user_type: String,
    credentials: Option<Credentials>,
}

impl SessionUser {
    pub fn new(user_type: impl Into<String>, credentials: Option<Credentials>) -> Self {
        Self {
            user_type: user_type.into(),
            credentials,
        }
    }

    pub fn anonymous(user_type: impl Into<String>) -> Self {
        Self::new(user_type, None)
    }

    pub fn user_type(&self) -> &str {
        &self.user_type
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    fn same_as(&self, other: &Self) -> bool {
        match (&self.credentials, &other.credentials) {
            (None, None) => true,
            (Some(a), Some(b)) => a.same_as(b),
            _ => false,
        }
    }
}

/// Process-wide catalog of session users, keyed by user type.
pub struct SessionUsers {
    users: RwLock<HashMap<String, SessionUser>>,
}

impl SessionUsers {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Register a session user.
    ///
    /// Re-registering an identical user is a no-op; redefining an existing
    /// user type with different credentials is a configuration error.
    pub fn register(&self, user: SessionUser) -> Result<(), CacheError> {
        let mut users = rw_write(&self.users, "users.register");
        if let Some(existing) = users.get(user.user_type()) {
            if existing.same_as(&user) {
                return Ok(());
            }
            return Err(CacheError::DuplicateRegistration(
                user.user_type().to_string(),
            ));
        }
        users.insert(user.user_type().to_string(), user);
        Ok(())
    }

    pub fn fetch(&self, user_type: &str) -> Option<SessionUser> {
        rw_read(&self.users, "users.fetch").get(user_type).cloned()
    }

    pub fn user_types(&self) -> Vec<String> {
        rw_read(&self.users, "users.user_types")
            .keys()
            .cloned()
            .collect()
    }
}

impl Default for SessionUsers {
    fn default() -> Self {
        Self::new()
    }
}
