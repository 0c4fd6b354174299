//! Engine configuration.
//!
//! Controls the sign-in request shape used by replay sessions, the set of
//! remote application instances whose caches are re-primed, and how users
//! are classified into user types.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use url::Url;
use uuid::Uuid;

const DEFAULT_SIGN_IN_PATH: &str = "/users/sign_in";
const DEFAULT_SIGN_OUT_PATH: &str = "/users/sign_out";
const DEFAULT_USER_TYPES: &[&str] = &["signed_in"];

/// A minimal view of the user a fragment is rendered for.
///
/// The engine never touches the host application's user model; this carries
/// just enough to derive a user type and a user id.
#[derive(Debug, Clone, Default)]
pub struct UserRef {
    pub id: Option<Uuid>,
    pub admin: bool,
}

impl UserRef {
    pub fn signed_in(id: Uuid) -> Self {
        Self {
            id: Some(id),
            admin: false,
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }
}

/// Classifies a user into a user-type label.
pub type UserTypeMapping = Arc<dyn Fn(Option<&UserRef>) -> String + Send + Sync>;

fn default_user_type_mapping() -> UserTypeMapping {
    Arc::new(|user| {
        match user {
            Some(user) if user.id.is_some() => "signed_in",
            _ => "signed_out",
        }
        .to_string()
    })
}

/// Engine configuration.
///
/// Data fields deserialize from the host's config file; the user-type
/// mapping is code and is installed programmatically.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// GET path that serves the sign-in form (fetched for the CSRF token).
    pub sign_in_path: String,
    /// POST path that receives the credentials.
    pub sign_in_post_path: String,
    /// Path used to end an authenticated session.
    pub sign_out_path: String,
    /// Remote application instances whose queues receive replayed requests.
    pub remote_hosts: Vec<Url>,
    /// User types a requestable fragment fans out to when its variant does
    /// not declare its own set.
    pub default_user_types: Vec<String>,
    /// How a [`UserRef`] maps to a user-type label.
    #[serde(skip, default = "default_user_type_mapping")]
    pub user_type_mapping: UserTypeMapping,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sign_in_path: DEFAULT_SIGN_IN_PATH.to_string(),
            sign_in_post_path: DEFAULT_SIGN_IN_PATH.to_string(),
            sign_out_path: DEFAULT_SIGN_OUT_PATH.to_string(),
            remote_hosts: Vec::new(),
            default_user_types: DEFAULT_USER_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            user_type_mapping: default_user_type_mapping(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("sign_in_path", &self.sign_in_path)
            .field("sign_in_post_path", &self.sign_in_post_path)
            .field("sign_out_path", &self.sign_out_path)
            .field("remote_hosts", &self.remote_hosts)
            .field("default_user_types", &self.default_user_types)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Classify a user with the configured mapping.
    pub fn user_type(&self, user: Option<&UserRef>) -> String {
        (self.user_type_mapping)(user)
    }
}
