//! Queue drainer.
//!
//! A sender delivers one queue's pending requests through a session, either
//! right away or via jobs booked on the scheduler. Booking replaces any job
//! previously booked for the same queue.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tracing::{info, warn};

use crate::error::CacheError;
use crate::replay::queue::{RequestQueue, Target};
use crate::replay::session::ReplaySession;
use crate::schedule::{JobScheduler, JobSpec, JobTask};
use crate::session_user::SessionUser;

/// Opens a signed-out session for a user against a target. The sender signs
/// it in before the first delivery.
pub type SessionFactory = Arc<
    dyn Fn(&SessionUser, &Target) -> Result<Box<dyn ReplaySession>, CacheError> + Send + Sync,
>;

/// How a queue should be drained.
///
/// - neither `delay` nor `between`: drain synchronously, FIFO;
/// - `delay`: book one job that replays everything queued so far;
/// - `between`: book a self-rescheduling job sending one request per run,
///   the first run immediate and later runs spaced by the wait.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub delay: Option<Duration>,
    pub between: Option<Duration>,
    pub priority: i32,
}

impl SendOptions {
    pub fn immediate() -> Self {
        Self::default()
    }

    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn throttled(between: Duration) -> Self {
        Self {
            between: Some(between),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Drains one request queue as one user.
#[derive(Clone)]
pub struct Sender {
    queue: Arc<RequestQueue>,
    user: SessionUser,
    sessions: SessionFactory,
    scheduler: Arc<dyn JobScheduler>,
    // Session reused across throttled runs so the handshake happens once.
    session: Arc<AsyncMutex<Option<Box<dyn ReplaySession>>>>,
}

impl Sender {
    pub fn new(
        queue: Arc<RequestQueue>,
        user: SessionUser,
        sessions: SessionFactory,
        scheduler: Arc<dyn JobScheduler>,
    ) -> Self {
        Self {
            queue,
            user,
            sessions,
            scheduler,
            session: Arc::new(AsyncMutex::new(None)),
        }
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    /// Process the queue per the options. A sign-in failure surfaces before
    /// anything is popped, so the queue survives for a later retry.
    pub async fn start(&self, options: SendOptions) -> Result<(), CacheError> {
        if self.queue.is_empty() {
            return Ok(());
        }
        info!(
            target: "tessella::replay",
            user_type = self.queue.user_type(),
            queue_target = %self.queue.target(),
            pending = self.queue.len(),
            "processing request queue"
        );
        if let Some(delay) = options.delay {
            self.book_batch(delay, options.priority);
            Ok(())
        } else if let Some(between) = options.between {
            // First run immediate, later runs spaced by the wait.
            self.scheduler.cancel_matching(&self.queue.job_tag());
            self.book_throttled(Duration::ZERO, between, options.priority);
            Ok(())
        } else {
            self.send_all().await
        }
    }

    /// The signed-in session, opened on first use.
    async fn session_guard(
        &self,
    ) -> Result<MutexGuard<'_, Option<Box<dyn ReplaySession>>>, CacheError> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            let mut session = (self.sessions)(&self.user, self.queue.target())?;
            session.sign_in().await?;
            *guard = Some(session);
        }
        Ok(guard)
    }

    async fn send_all(&self) -> Result<(), CacheError> {
        let mut guard = self.session_guard().await?;
        let Some(session) = guard.as_mut() else {
            return Ok(());
        };
        let mut sent = 0usize;
        while let Some(request) = self.queue.next_request() {
            if let Err(err) = session.send(&request).await {
                // The in-flight request goes back to the head so a retry
                // keeps arrival order.
                self.queue.restore(request);
                return Err(err);
            }
            sent += 1;
        }
        info!(
            target: "tessella::replay",
            user_type = self.queue.user_type(),
            sent,
            "request queue drained"
        );
        Ok(())
    }

    /// Book a one-shot job replaying everything queued so far. The live
    /// queue is cleared; the job owns the snapshot.
    fn book_batch(&self, delay: Duration, priority: i32) {
        let snapshot = self.queue.take_all();
        if snapshot.is_empty() {
            return;
        }
        let tag = self.queue.job_tag();
        self.scheduler.cancel_matching(&tag);
        let run_at = OffsetDateTime::now_utc() + delay;
        info!(
            target: "tessella::replay",
            user_type = self.queue.user_type(),
            requests = snapshot.len(),
            %run_at,
            "queue replay booked"
        );
        let sender = self.clone();
        let task: JobTask = Arc::new(move || {
            let sender = sender.clone();
            let snapshot = snapshot.clone();
            Box::pin(async move {
                sender.replay_batch(snapshot).await;
            })
        });
        self.scheduler.enqueue(
            JobSpec::new(tag, self.queue.job_queue_name(), run_at, task).with_priority(priority),
        );
    }

    async fn replay_batch(&self, snapshot: Vec<crate::replay::Request>) {
        let mut pending = snapshot.into_iter();
        let result = async {
            let mut guard = self.session_guard().await.map_err(|err| (err, None))?;
            let Some(session) = guard.as_mut() else {
                return Ok(());
            };
            for request in pending.by_ref() {
                if let Err(err) = session.send(&request).await {
                    return Err((err, Some(request)));
                }
            }
            Ok::<_, (CacheError, Option<crate::replay::Request>)>(())
        }
        .await;
        if let Err((err, failed)) = result {
            warn!(
                target: "tessella::replay",
                user_type = self.queue.user_type(),
                error = %err,
                "deferred replay failed; remainder requeued"
            );
            // Unsent requests return to the head of the live queue in their
            // original order, ahead of anything queued since.
            for request in failed.into_iter().chain(pending).rev() {
                self.queue.restore(request);
            }
        }
    }

    /// Book the next throttled run. Reschedules itself from inside the job
    /// while the live queue stays non-empty.
    fn book_throttled(&self, wait: Duration, between: Duration, priority: i32) {
        let run_at = OffsetDateTime::now_utc() + wait;
        let sender = self.clone();
        let task: JobTask = Arc::new(move || {
            let sender = sender.clone();
            Box::pin(async move {
                sender.replay_one(between, priority).await;
            })
        });
        self.scheduler.enqueue(
            JobSpec::new(
                self.queue.job_tag(),
                self.queue.job_queue_name(),
                run_at,
                task,
            )
            .with_priority(priority),
        );
    }

    async fn replay_one(&self, between: Duration, priority: i32) {
        if let Some(request) = self.queue.next_request() {
            let result = async {
                let mut guard = self.session_guard().await?;
                let Some(session) = guard.as_mut() else {
                    return Ok(());
                };
                session.send(&request).await
            }
            .await;
            if let Err(err) = result {
                warn!(
                    target: "tessella::replay",
                    user_type = self.queue.user_type(),
                    request = %request,
                    error = %err,
                    "throttled replay failed; request requeued"
                );
                self.queue.restore(request);
            }
        }
        if !self.queue.is_empty() {
            self.book_throttled(between, between, priority);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::replay::Request;
    use crate::schedule::MemoryScheduler;

    #[derive(Default)]
    struct SessionLog {
        sent: Mutex<Vec<String>>,
        sign_ins: Mutex<usize>,
        fail_sign_in: bool,
        fail_sends: bool,
    }

    struct FakeSession {
        log: Arc<SessionLog>,
    }

    #[async_trait]
    impl ReplaySession for FakeSession {
        async fn sign_in(&mut self) -> Result<(), CacheError> {
            *self.log.sign_ins.lock().unwrap() += 1;
            if self.log.fail_sign_in {
                return Err(CacheError::sign_in_failure("signed_in", "bad credentials"));
            }
            Ok(())
        }

        async fn send(&mut self, request: &Request) -> Result<(), CacheError> {
            if self.log.fail_sends {
                return Err(CacheError::driver("send refused"));
            }
            self.log.sent.lock().unwrap().push(request.path.clone());
            Ok(())
        }

        async fn sign_out(&mut self) -> Result<(), CacheError> {
            Ok(())
        }
    }

    fn factory(log: Arc<SessionLog>) -> SessionFactory {
        Arc::new(move |_, _| {
            Ok(Box::new(FakeSession { log: log.clone() }) as Box<dyn ReplaySession>)
        })
    }

    fn sender_with(
        log: Arc<SessionLog>,
        scheduler: Arc<MemoryScheduler>,
    ) -> (Sender, Arc<RequestQueue>) {
        let queue = Arc::new(RequestQueue::new("signed_in", Target::Internal));
        let sender = Sender::new(
            queue.clone(),
            SessionUser::anonymous("signed_in"),
            factory(log),
            scheduler,
        );
        (sender, queue)
    }

    #[tokio::test]
    async fn synchronous_drain_is_fifo() {
        let log = Arc::new(SessionLog::default());
        let (sender, queue) = sender_with(log.clone(), Arc::new(MemoryScheduler::new()));
        queue.push(Request::get("/a"));
        queue.push(Request::get("/b"));
        queue.push(Request::get("/c"));

        sender.start(SendOptions::immediate()).await.unwrap();

        assert_eq!(*log.sent.lock().unwrap(), vec!["/a", "/b", "/c"]);
        assert!(queue.is_empty());
        assert_eq!(*log.sign_ins.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn sign_in_failure_leaves_the_queue_intact() {
        let log = Arc::new(SessionLog {
            fail_sign_in: true,
            ..Default::default()
        });
        let (sender, queue) = sender_with(log.clone(), Arc::new(MemoryScheduler::new()));
        queue.push(Request::get("/a"));
        queue.push(Request::get("/b"));

        let err = sender
            .start(SendOptions::immediate())
            .await
            .expect_err("sign-in should fail");
        assert!(matches!(err, CacheError::SignInFailure { .. }));
        assert_eq!(queue.len(), 2);
        assert!(log.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_send_keeps_the_retry_order() {
        let log = Arc::new(SessionLog {
            fail_sends: true,
            ..Default::default()
        });
        let (sender, queue) = sender_with(log.clone(), Arc::new(MemoryScheduler::new()));
        queue.push(Request::get("/a"));
        queue.push(Request::get("/b"));

        sender
            .start(SendOptions::immediate())
            .await
            .expect_err("send should fail");

        // The failed request sits at the head again, not behind /b.
        let paths: Vec<String> = queue.requests().into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["/a", "/b"]);
    }

    #[tokio::test]
    async fn failed_deferred_replay_requeues_in_order() {
        let log = Arc::new(SessionLog {
            fail_sends: true,
            ..Default::default()
        });
        let scheduler = Arc::new(MemoryScheduler::new());
        let (sender, queue) = sender_with(log.clone(), scheduler.clone());
        queue.push(Request::get("/a"));
        queue.push(Request::get("/b"));

        sender
            .start(SendOptions::delayed(Duration::minutes(5)))
            .await
            .unwrap();
        // A fresh request lands on the live queue before the job runs.
        queue.push(Request::get("/c"));

        scheduler
            .run_due(OffsetDateTime::now_utc() + Duration::minutes(6))
            .await;

        let paths: Vec<String> = queue.requests().into_iter().map(|r| r.path).collect();
        assert_eq!(paths, vec!["/a", "/b", "/c"]);
    }

    #[tokio::test]
    async fn delayed_start_books_one_job_and_clears_the_queue() {
        let log = Arc::new(SessionLog::default());
        let scheduler = Arc::new(MemoryScheduler::new());
        let (sender, queue) = sender_with(log.clone(), scheduler.clone());
        queue.push(Request::get("/a"));
        queue.push(Request::get("/b"));

        sender
            .start(SendOptions::delayed(Duration::minutes(5)))
            .await
            .unwrap();

        assert!(queue.is_empty());
        assert_eq!(scheduler.len(), 1);
        assert!(log.sent.lock().unwrap().is_empty());

        let later = OffsetDateTime::now_utc() + Duration::minutes(6);
        scheduler.run_due(later).await;
        assert_eq!(*log.sent.lock().unwrap(), vec!["/a", "/b"]);
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn rebooking_replaces_the_previous_job() {
        let log = Arc::new(SessionLog::default());
        let scheduler = Arc::new(MemoryScheduler::new());
        let (sender, queue) = sender_with(log.clone(), scheduler.clone());

        queue.push(Request::get("/a"));
        sender
            .start(SendOptions::delayed(Duration::minutes(5)))
            .await
            .unwrap();
        queue.push(Request::get("/b"));
        sender
            .start(SendOptions::delayed(Duration::minutes(5)))
            .await
            .unwrap();

        assert_eq!(scheduler.len(), 1);
    }

    #[tokio::test]
    async fn throttled_start_sends_one_request_per_run() {
        let log = Arc::new(SessionLog::default());
        let scheduler = Arc::new(MemoryScheduler::new());
        let (sender, queue) = sender_with(log.clone(), scheduler.clone());
        queue.push(Request::get("/a"));
        queue.push(Request::get("/b"));

        sender
            .start(SendOptions::throttled(Duration::seconds(30)))
            .await
            .unwrap();

        // First run is immediate.
        scheduler.run_due(OffsetDateTime::now_utc()).await;
        assert_eq!(*log.sent.lock().unwrap(), vec!["/a"]);
        assert_eq!(queue.len(), 1);
        assert_eq!(scheduler.len(), 1);

        scheduler
            .run_due(OffsetDateTime::now_utc() + Duration::minutes(1))
            .await;
        assert_eq!(*log.sent.lock().unwrap(), vec!["/a", "/b"]);
        assert!(scheduler.is_empty());

        // One session served both runs.
        assert_eq!(*log.sign_ins.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_queue_is_a_no_op() {
        let log = Arc::new(SessionLog::default());
        let scheduler = Arc::new(MemoryScheduler::new());
        let (sender, _queue) = sender_with(log.clone(), scheduler.clone());

        sender
            .start(SendOptions::delayed(Duration::minutes(5)))
            .await
            .unwrap();
        assert!(scheduler.is_empty());
        assert_eq!(*log.sign_ins.lock().unwrap(), 0);
    }
}
