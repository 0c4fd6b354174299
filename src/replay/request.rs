//! Request values.
//!
//! A request is pure data: enough to replay an application request through a
//! session, and a structural-equality key for queue deduplication.

use std::fmt;

use serde::{Deserialize, Serialize};

pub(crate) const XHR_HEADER: (&str, &str) = ("x-requested-with", "XMLHttpRequest");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl RequestMethod {
    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Patch => reqwest::Method::PATCH,
            Self::Delete => reqwest::Method::DELETE,
        }
    }
}

impl fmt::Display for RequestMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// Delivery flavor flags. `xhr` marks the request as an AJAX-style call so
/// the application renders the fragment body rather than a full page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestOptions {
    #[serde(default)]
    pub xhr: bool,
}

/// One replayable application request.
///
/// Equality is structural over all four fields; queues rely on this to drop
/// duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Request {
    pub method: RequestMethod,
    pub path: String,
    pub parameters: Vec<(String, String)>,
    pub options: RequestOptions,
}

impl Request {
    pub fn new(
        method: RequestMethod,
        path: impl Into<String>,
        parameters: Vec<(String, String)>,
        options: RequestOptions,
    ) -> Self {
        Self {
            method,
            path: path.into(),
            parameters,
            options,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(RequestMethod::Get, path, Vec::new(), RequestOptions::default())
    }

    /// Extra headers implied by the options.
    pub fn headers(&self) -> Vec<(String, String)> {
        if self.options.xhr {
            vec![(XHR_HEADER.0.to_string(), XHR_HEADER.1.to_string())]
        } else {
            Vec::new()
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}
