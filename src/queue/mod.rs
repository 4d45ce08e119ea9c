//! Three logical delivery queues (§4.6): translate-out (chat→fed), translate-in (fed→chat), and
//! deliver (signed HTTP POST to a remote inbox). Workers are idempotent since the broker backing
//! a durable deployment of this queue can redeliver (§4.6).
//!
//! An `mpsc::unbounded_channel` feeds a dispatcher task that spawns one task per job into a
//! `JoinSet`, backpressured by awaiting `join_next()` once `worker_count` tasks are in flight.
//! A fast/retry-path split is collapsed here into a single retrying task per job
//! (`queue::retry::retry_with_backoff`), since every job already carries everything it needs to
//! retry in place rather than re-entering a second channel.
//!
//! [`Queues`] is constructed against a [`std::sync::Weak`] handle to [`crate::config::AppState`]
//! rather than an owned one: `AppState` holds `Queues` as a field, so workers upgrade the weak
//! handle per job instead of requiring a cyclic `Arc`. A dropped state (shutdown) makes `upgrade`
//! return `None` and the job is silently abandoned rather than panicking.
//!
//! Translate-out jobs for the same room take a shared [`RoomLocks`] lane, acquired by the
//! dispatcher loop itself before a job's task is spawned, so two events from the same room run
//! strictly in the order they were received even though the dispatcher spawns both concurrently;
//! cross-room ordering is unconstrained (§5 "Ordering").
//!
//! Each dispatcher also throttles through a [`QueueRateLimiter`], capped independently of worker
//! concurrency (§4.6: "per-queue rate limiter (default 100 jobs/second)").

pub mod circuit_breaker;
pub mod fanout;
pub mod retry;

use crate::{
    config::{AppState, Data},
    core::signatures::{self, SignRequestInput},
    error::Error,
    protocol::activities::InboxActivity,
    transformer::chat_to_fed::ChatEvent,
};
use chrono::Utc;
use retry::{Attempt, RetryStrategy};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, Weak,
    },
    time::{Duration, Instant},
};
use tokio::{sync::mpsc, task::JoinSet};
use url::Url;

/// Default number of jobs processed concurrently per queue (§4.6: "worker concurrency default
/// 10/queue").
pub const DEFAULT_WORKER_CONCURRENCY: usize = 10;

/// Default per-queue dispatch rate (§4.6: "per-queue rate limiter (default 100 jobs/second)"),
/// independent of worker concurrency.
pub const DEFAULT_QUEUE_RATE_LIMIT: u32 = 100;

/// A chat event ready to be translated into a fed `Create(Note)` and delivered. `room_id`/
/// `sender_id` and the resolved `followers` list are supplied by the caller (`bridge::intake`)
/// so the translate-out worker never needs to re-resolve them from the chat side.
pub struct TranslateOutJob {
    pub chat_event: ChatEvent,
    pub room_id: i64,
    pub sender_id: i64,
    pub followers: Vec<fanout::FollowerInbox>,
}

/// A verified, deduped inbound activity ready to be dispatched and translated into chat.
pub struct TranslateInJob {
    pub activity: InboxActivity,
}

/// A single signed-delivery attempt target: one already-serialized activity body bound for one
/// inbox (possibly shared across several followers, §4.6 fan-out).
pub struct DeliverJob {
    pub activity_json: Vec<u8>,
    pub inbox: Url,
    pub key_id: String,
    pub private_key_pem: String,
}

/// Atomic counters exposed for admin/ops visibility rather than used internally for
/// backpressure.
#[derive(Default)]
pub struct Stats {
    pending: AtomicUsize,
    running: AtomicUsize,
    retries: AtomicUsize,
    dead_last_hour: AtomicUsize,
    completed_last_hour: AtomicUsize,
}

impl std::fmt::Debug for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stats")
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("retries", &self.retries.load(Ordering::Relaxed))
            .field("dead_last_hour", &self.dead_last_hour.load(Ordering::Relaxed))
            .field("completed_last_hour", &self.completed_last_hour.load(Ordering::Relaxed))
            .finish()
    }
}

impl Stats {
    fn reset_hourly(&self) {
        self.dead_last_hour.store(0, Ordering::Relaxed);
        self.completed_last_hour.store(0, Ordering::Relaxed);
    }
}

/// Per-room serial lanes for the translate-out queue: two jobs with the same `room_id` acquire
/// the same lane and so run strictly one after the other, preserving the relative order chat
/// events arrived in (§5 "Ordering"). Jobs for different rooms take different lanes and run
/// concurrently as usual.
#[derive(Default)]
struct RoomLocks {
    lanes: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl RoomLocks {
    async fn acquire(&self, room_id: i64) -> tokio::sync::OwnedMutexGuard<()> {
        let lane = {
            let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
            lanes
                .entry(room_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lane.lock_owned().await
    }
}

/// Caps how fast a single dispatcher spawns jobs, independent of worker concurrency (§4.6:
/// "per-queue rate limiter (default 100 jobs/second)"). A plain token bucket refilled on every
/// `acquire`, since the dispatcher is the only caller.
struct QueueRateLimiter {
    jobs_per_sec: f64,
    state: Mutex<(f64, Instant)>,
}

impl QueueRateLimiter {
    fn new(jobs_per_sec: u32) -> Self {
        let capacity = f64::from(jobs_per_sec.max(1));
        QueueRateLimiter {
            jobs_per_sec: capacity,
            state: Mutex::new((capacity, Instant::now())),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();
                let elapsed = now.duration_since(state.1).as_secs_f64();
                state.0 = (state.0 + elapsed * self.jobs_per_sec).min(self.jobs_per_sec);
                state.1 = now;
                if state.0 >= 1.0 {
                    state.0 -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - state.0) / self.jobs_per_sec))
                }
            };
            match wait {
                None => return,
                Some(duration) => tokio::time::sleep(duration).await,
            }
        }
    }
}

/// Handles to the three in-process job queues (§4.6).
pub struct Queues {
    translate_out_tx: mpsc::UnboundedSender<TranslateOutJob>,
    translate_in_tx: mpsc::UnboundedSender<TranslateInJob>,
    deliver_tx: mpsc::UnboundedSender<DeliverJob>,
    pub stats: Arc<Stats>,
}

impl Queues {
    /// Spawns the dispatcher/worker tasks for all three queues against a not-yet-fully-built
    /// `AppState`, and the hourly stats-reset task.
    pub fn spawn_all(state: Weak<AppState>, worker_count: usize) -> Self {
        let stats = Arc::new(Stats::default());

        let (translate_out_tx, translate_out_rx) = mpsc::unbounded_channel();
        spawn_translate_out_dispatcher(
            translate_out_rx,
            worker_count,
            DEFAULT_QUEUE_RATE_LIMIT,
            stats.clone(),
            state.clone(),
        );

        let (translate_in_tx, translate_in_rx) = mpsc::unbounded_channel();
        spawn_dispatcher(translate_in_rx, worker_count, DEFAULT_QUEUE_RATE_LIMIT, stats.clone(), {
            let state = state.clone();
            move |job: TranslateInJob| handle_translate_in(state.clone(), job)
        });

        let (deliver_tx, deliver_rx) = mpsc::unbounded_channel();
        spawn_dispatcher(deliver_rx, worker_count, DEFAULT_QUEUE_RATE_LIMIT, stats.clone(), {
            let state = state.clone();
            move |job: DeliverJob| handle_deliver(state.clone(), job)
        });

        tokio::spawn({
            let stats = stats.clone();
            async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60 * 60));
                loop {
                    interval.tick().await;
                    stats.reset_hourly();
                }
            }
        });

        Queues {
            translate_out_tx,
            translate_in_tx,
            deliver_tx,
            stats,
        }
    }

    pub fn enqueue_translate_out(&self, job: TranslateOutJob) {
        self.stats.pending.fetch_add(1, Ordering::Relaxed);
        let _ = self.translate_out_tx.send(job);
    }

    pub fn enqueue_translate_in(&self, job: TranslateInJob) {
        self.stats.pending.fetch_add(1, Ordering::Relaxed);
        let _ = self.translate_in_tx.send(job);
    }

    pub fn enqueue_deliver(&self, job: DeliverJob) {
        self.stats.pending.fetch_add(1, Ordering::Relaxed);
        let _ = self.deliver_tx.send(job);
    }
}

/// Generic unbounded-channel-to-bounded-`JoinSet` dispatcher loop, the shape every queue shares.
fn spawn_dispatcher<J, Fut>(
    mut rx: mpsc::UnboundedReceiver<J>,
    worker_count: usize,
    jobs_per_sec: u32,
    stats: Arc<Stats>,
    handler: impl Fn(J) -> Fut + Send + Sync + 'static,
) where
    J: Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let handler = Arc::new(handler);
    let rate_limiter = QueueRateLimiter::new(jobs_per_sec);
    tokio::spawn(async move {
        let mut join_set: JoinSet<()> = JoinSet::new();
        while let Some(job) = rx.recv().await {
            rate_limiter.acquire().await;
            stats.pending.fetch_sub(1, Ordering::Relaxed);
            stats.running.fetch_add(1, Ordering::Relaxed);
            while join_set.len() >= worker_count {
                join_set.join_next().await;
            }
            let handler = handler.clone();
            let stats = stats.clone();
            join_set.spawn(async move {
                handler(job).await;
                stats.running.fetch_sub(1, Ordering::Relaxed);
                stats.completed_last_hour.fetch_add(1, Ordering::Relaxed);
            });
        }
        while join_set.join_next().await.is_some() {}
    });
}

/// Dispatcher for the translate-out queue. Identical in shape to [`spawn_dispatcher`] except that
/// it acquires a job's room lane itself, synchronously in the receive loop, before spawning the
/// job's task — so same-room jobs are serialized in the order they were *received*, not in
/// whatever order their concurrently-spawned tasks happen to get polled. Acquiring the lane
/// inside the spawned task (as the generic dispatcher's handler would) does not preserve arrival
/// order under a multi-threaded runtime, since two freshly spawned tasks race for the same lane.
fn spawn_translate_out_dispatcher(
    mut rx: mpsc::UnboundedReceiver<TranslateOutJob>,
    worker_count: usize,
    jobs_per_sec: u32,
    stats: Arc<Stats>,
    state: Weak<AppState>,
) {
    let rate_limiter = QueueRateLimiter::new(jobs_per_sec);
    let room_locks = Arc::new(RoomLocks::default());
    tokio::spawn(async move {
        let mut join_set: JoinSet<()> = JoinSet::new();
        while let Some(job) = rx.recv().await {
            rate_limiter.acquire().await;
            stats.pending.fetch_sub(1, Ordering::Relaxed);
            stats.running.fetch_add(1, Ordering::Relaxed);
            while join_set.len() >= worker_count {
                join_set.join_next().await;
            }
            let lane = room_locks.acquire(job.room_id).await;
            let state = state.clone();
            let stats = stats.clone();
            join_set.spawn(async move {
                handle_translate_out(state, job).await;
                drop(lane);
                stats.running.fetch_sub(1, Ordering::Relaxed);
                stats.completed_last_hour.fetch_add(1, Ordering::Relaxed);
            });
        }
        while join_set.join_next().await.is_some() {}
    });
}

async fn handle_translate_out(state: Weak<AppState>, job: TranslateOutJob) {
    let Some(state) = state.upgrade() else { return };
    let data = Data::new(state);
    if let Err(error) = crate::bridge::coordinator::process_translate_out(&data, job).await {
        tracing::error!(%error, "translate-out job failed");
    }
}

async fn handle_translate_in(state: Weak<AppState>, job: TranslateInJob) {
    let Some(state) = state.upgrade() else { return };
    let data = Data::new(state);
    if let Err(error) = crate::bridge::coordinator::process_translate_in(&data, job).await {
        tracing::error!(%error, "translate-in job failed");
    }
}

async fn handle_deliver(state: Weak<AppState>, job: DeliverJob) {
    let Some(state) = state.upgrade() else { return };
    let data = Data::new(state);
    let host = job.inbox.host_str().unwrap_or_default().to_string();

    let job_ref = &job;
    let result = retry::retry_with_backoff(
        |attempt| {
            let data = data.clone();
            let host = host.clone();
            let job = job_ref;
            async move { attempt_delivery(&data, job, &host, attempt).await }
        },
        RetryStrategy::default(),
    )
    .await;

    match result {
        Ok(()) => data.circuit_breakers.record_success(&host),
        Err(error) => {
            data.queues.stats.dead_last_hour.fetch_add(1, Ordering::Relaxed);
            tracing::error!(%error, inbox = %host, "delivery exhausted all attempts, dead-lettering");
        }
    }
}

async fn attempt_delivery(
    data: &Data,
    job: &DeliverJob,
    host: &str,
    attempt: u32,
) -> Attempt<(), Error> {
    if attempt > 1 {
        data.queues.stats.retries.fetch_add(1, Ordering::Relaxed);
    }

    let now = Utc::now();
    if !data.circuit_breakers.is_allowed(host, now) {
        return Attempt::Retryable(Error::CircuitOpen {
            opens_until_unix_secs: now.timestamp(),
        });
    }

    let path_and_query = job.inbox.path().to_string();
    let signed = match signatures::sign_request(
        SignRequestInput {
            method: "POST",
            path_and_query: &path_and_query,
            host,
            body: Some(&job.activity_json),
            key_id: &job.key_id,
            private_key_pem: &job.private_key_pem,
        },
        now,
    ) {
        Ok(signed) => signed,
        Err(error) => return Attempt::Permanent(error),
    };

    let mut request = data
        .client
        .post(job.inbox.clone())
        .header("Content-Type", "application/activity+json")
        .header("Date", &signed.date)
        .header("Signature", &signed.signature)
        .body(job.activity_json.clone());
    if let Some(digest) = &signed.digest {
        request = request.header("Digest", digest);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(error) => {
            data.circuit_breakers.record_failure(host, now);
            return Attempt::Retryable(Error::other(error));
        }
    };

    let status = response.status();
    if status.is_success() {
        return Attempt::Done(());
    }

    if status.as_u16() == 429 || status.as_u16() == 408 {
        let retry_after_secs = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        return Attempt::Retryable(Error::RateLimited { retry_after_secs });
    }

    if status.is_client_error() {
        return Attempt::Permanent(Error::Federation(format!(
            "delivery to {} rejected with {status}",
            job.inbox
        )));
    }

    data.circuit_breakers.record_failure(host, now);
    Attempt::Retryable(Error::Federation(format!(
        "delivery to {} failed with {status}",
        job.inbox
    )))
}

#[cfg(test)]
mod tests {
    use super::{QueueRateLimiter, RoomLocks};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_throttles_beyond_capacity() {
        let limiter = QueueRateLimiter::new(2);
        limiter.acquire().await;
        limiter.acquire().await;

        let third = tokio::time::timeout(std::time::Duration::from_millis(10), limiter.acquire()).await;
        assert!(third.is_err(), "third acquire should not complete instantly");

        tokio::time::advance(std::time::Duration::from_secs(1)).await;
        limiter.acquire().await;
    }

    #[tokio::test]
    async fn same_room_jobs_run_in_arrival_order() {
        let locks = Arc::new(RoomLocks::default());
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        // Mirrors the real dispatcher: the lane is acquired here, sequentially, before each
        // job's task is spawned, so task i+1 cannot start pushing until task i's lane is
        // dropped — regardless of how the runtime happens to schedule the spawned tasks.
        let mut handles = Vec::new();
        for i in 0..5 {
            let lane = locks.acquire(1).await;
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                order.lock().await.push(i);
                drop(lane);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn different_rooms_do_not_share_a_lane() {
        let locks = Arc::new(RoomLocks::default());
        // Holding room 1's lane must not block acquiring room 2's.
        let _room_1 = locks.acquire(1).await;
        let room_2 = tokio::time::timeout(std::time::Duration::from_millis(200), locks.acquire(2)).await;
        assert!(room_2.is_ok());
    }
}
