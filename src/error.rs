//! Error taxonomy for the invalidation engine.
//!
//! Identity and attribute errors are raised synchronously to the caller;
//! replay failures surface to the deferred-job layer instead of being
//! retried here.

use thiserror::Error;

use crate::fragment::FragmentId;

#[derive(Debug, Error)]
pub enum CacheError {
    /// A required identity field was absent when creating or looking up a
    /// fragment.
    #[error("fragment variant `{variant}` needs a `{attribute}` attribute")]
    MissingAttribute { variant: String, attribute: String },

    /// A supplied fragment does not occupy the tree position the caller
    /// claimed for it.
    #[error("fragment {fragment} is not where the caller claims: {detail}")]
    IdentityMismatch {
        fragment: FragmentId,
        detail: String,
    },

    /// The variant name is not registered in the variant catalog.
    #[error("unknown fragment variant `{0}`")]
    UnknownVariant(String),

    /// The fragment id does not resolve to a stored row.
    #[error("fragment {0} does not exist")]
    UnknownFragment(FragmentId),

    /// A session user was redefined with different credentials.
    #[error("session user `{0}` is already registered with different options")]
    DuplicateRegistration(String),

    /// The replay session's login handshake did not redirect as expected.
    #[error("sign in failed for user type `{user_type}`: {detail}")]
    SignInFailure { user_type: String, detail: String },

    /// HTTP transport failure from an external replay session.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The in-process application driver rejected a replayed request.
    #[error("application driver error: {0}")]
    Driver(String),
}

impl CacheError {
    pub fn missing_attribute(variant: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self::MissingAttribute {
            variant: variant.into(),
            attribute: attribute.into(),
        }
    }

    pub fn identity_mismatch(fragment: FragmentId, detail: impl Into<String>) -> Self {
        Self::IdentityMismatch {
            fragment,
            detail: detail.into(),
        }
    }

    pub fn sign_in_failure(user_type: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::SignInFailure {
            user_type: user_type.into(),
            detail: detail.into(),
        }
    }

    pub fn driver(detail: impl Into<String>) -> Self {
        Self::Driver(detail.into())
    }
}
