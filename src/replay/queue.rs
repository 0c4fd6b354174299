//! Per-user request queues.
//!
//! One queue exists per (user type, target) pair, created lazily the first
//! time a request is bound for it. Queues are ordered and deduplicate on
//! insert, so a burst of touches against the same fragment yields a single
//! replay.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tracing::debug;
use url::Url;

use crate::lock::mutex_lock;
use crate::replay::Request;

/// Where a queue's requests are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// The application instance this process belongs to, driven in-process.
    Internal,
    /// A remote application instance reached over HTTP.
    Remote(Url),
}

impl Target {
    /// Processing-affinity name for deferred jobs draining this queue. This
    /// names the worker pool, not the destination.
    pub fn job_queue_name(&self) -> String {
        match self {
            Self::Internal => "replay".to_string(),
            Self::Remote(url) => match url.host_str() {
                Some(host) => format!("replay:{host}"),
                None => "replay:remote".to_string(),
            },
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal => f.write_str("internal"),
            Self::Remote(url) => url.fmt(f),
        }
    }
}

/// Identity of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub user_type: String,
    pub target: Target,
}

/// Ordered, dedup-on-insert FIFO of pending replay requests.
pub struct RequestQueue {
    key: QueueKey,
    requests: Mutex<VecDeque<Request>>,
}

impl RequestQueue {
    pub fn new(user_type: impl Into<String>, target: Target) -> Self {
        Self {
            key: QueueKey {
                user_type: user_type.into(),
                target,
            },
            requests: Mutex::new(VecDeque::new()),
        }
    }

    pub fn user_type(&self) -> &str {
        &self.key.user_type
    }

    pub fn target(&self) -> &Target {
        &self.key.target
    }

    pub fn key(&self) -> &QueueKey {
        &self.key
    }

    /// Tag identifying this queue's booked replay jobs, for replacement.
    pub fn job_tag(&self) -> String {
        format!("replay:{}:{}", self.key.user_type, self.key.target)
    }

    pub fn job_queue_name(&self) -> String {
        self.key.target.job_queue_name()
    }

    /// Append a request unless an equal one is already queued. Returns
    /// whether the queue grew.
    pub fn push(&self, request: Request) -> bool {
        let mut requests = mutex_lock(&self.requests, "queue.push");
        if requests.contains(&request) {
            debug!(
                target: "tessella::replay",
                user_type = %self.key.user_type,
                request = %request,
                "duplicate request dropped"
            );
            return false;
        }
        requests.push_back(request);
        true
    }

    /// Pop the oldest pending request.
    pub fn next_request(&self) -> Option<Request> {
        mutex_lock(&self.requests, "queue.next_request").pop_front()
    }

    /// Put a popped request back at the head of the queue, ahead of anything
    /// queued while it was in flight, so a retry stays in arrival order.
    pub fn restore(&self, request: Request) {
        let mut requests = mutex_lock(&self.requests, "queue.restore");
        if requests.contains(&request) {
            return;
        }
        requests.push_front(request);
    }

    /// Drop every queued request for the given path. Returns how many were
    /// removed.
    pub fn remove_path(&self, path: &str) -> usize {
        let mut requests = mutex_lock(&self.requests, "queue.remove_path");
        let before = requests.len();
        requests.retain(|request| request.path != path);
        before - requests.len()
    }

    /// Take every pending request, leaving the queue empty.
    pub fn take_all(&self) -> Vec<Request> {
        mutex_lock(&self.requests, "queue.take_all")
            .drain(..)
            .collect()
    }

    pub fn requests(&self) -> Vec<Request> {
        mutex_lock(&self.requests, "queue.requests")
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.requests, "queue.len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        mutex_lock(&self.requests, "queue.clear").clear();
    }
}

/// Lazily populated set of all live queues.
pub struct QueueSet {
    queues: DashMap<QueueKey, Arc<RequestQueue>>,
}

impl QueueSet {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }

    /// The queue for (user_type, target), created on first use.
    pub fn fetch(&self, user_type: &str, target: &Target) -> Arc<RequestQueue> {
        let key = QueueKey {
            user_type: user_type.to_string(),
            target: target.clone(),
        };
        self.queues
            .entry(key)
            .or_insert_with(|| {
                debug!(
                    target: "tessella::replay",
                    user_type,
                    %target,
                    "request queue created"
                );
                Arc::new(RequestQueue::new(user_type, target.clone()))
            })
            .clone()
    }

    pub fn all(&self) -> Vec<Arc<RequestQueue>> {
        self.queues.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn for_user_type(&self, user_type: &str) -> Vec<Arc<RequestQueue>> {
        self.queues
            .iter()
            .filter(|entry| entry.key().user_type == user_type)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

impl Default for QueueSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_deduplicates_equal_requests() {
        let queue = RequestQueue::new("signed_in", Target::Internal);
        assert!(queue.push(Request::get("/articles/42")));
        assert!(!queue.push(Request::get("/articles/42")));
        assert_eq!(queue.len(), 1);

        assert!(queue.push(Request::get("/articles/43")));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn next_request_is_fifo() {
        let queue = RequestQueue::new("signed_in", Target::Internal);
        queue.push(Request::get("/a"));
        queue.push(Request::get("/b"));
        queue.push(Request::get("/c"));

        assert_eq!(queue.next_request().map(|r| r.path), Some("/a".to_string()));
        assert_eq!(queue.next_request().map(|r| r.path), Some("/b".to_string()));
        assert_eq!(queue.next_request().map(|r| r.path), Some("/c".to_string()));
        assert!(queue.next_request().is_none());
    }

    #[test]
    fn remove_path_drops_only_matching_requests() {
        let queue = RequestQueue::new("signed_in", Target::Internal);
        queue.push(Request::get("/a"));
        queue.push(Request::get("/b"));
        queue.push(Request::new(
            crate::replay::RequestMethod::Post,
            "/a",
            Vec::new(),
            Default::default(),
        ));

        assert_eq!(queue.remove_path("/a"), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.requests()[0].path, "/b");
    }

    #[test]
    fn restore_puts_a_request_back_at_the_head() {
        let queue = RequestQueue::new("signed_in", Target::Internal);
        queue.push(Request::get("/a"));
        queue.push(Request::get("/b"));

        let in_flight = queue.next_request().unwrap();
        queue.push(Request::get("/c"));
        queue.restore(in_flight);

        let paths: Vec<String> = queue.requests().into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["/a", "/b", "/c"]);
    }

    #[test]
    fn take_all_snapshots_and_clears() {
        let queue = RequestQueue::new("signed_in", Target::Internal);
        queue.push(Request::get("/a"));
        queue.push(Request::get("/b"));

        let taken = queue.take_all();
        assert_eq!(taken.len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn queue_set_is_lazy_and_keyed() {
        let set = QueueSet::new();
        assert!(set.is_empty());

        let a = set.fetch("signed_in", &Target::Internal);
        let b = set.fetch("signed_in", &Target::Internal);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(set.len(), 1);

        set.fetch("admin", &Target::Internal);
        assert_eq!(set.len(), 2);
        assert_eq!(set.for_user_type("signed_in").len(), 1);
    }

    #[test]
    fn remote_target_names_its_job_queue_by_host() {
        let url: Url = "https://app.example.com".parse().unwrap();
        assert_eq!(Target::Remote(url).job_queue_name(), "replay:app.example.com");
        assert_eq!(Target::Internal.job_queue_name(), "replay");
    }
}
