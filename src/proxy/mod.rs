//! Proxy dispatch through a fixed pool of backend workers.
//!
//! Each worker owns a bounded inbound queue of requests and a bounded
//! outbound queue of results. A worker handles one request at a time, in
//! the order requests were queued, and never exits while its pool is alive.
//!
//! ```text
//!  submit ──► inbound (C) ──► worker task ──► outbound (C) ──► collector ──► caller
//! ```
//!
//! Callers wait on a per-request ticket, so two callers sharing a worker can
//! never receive each other's responses. When either queue of the chosen
//! worker holds more than `C - margin` items the request is refused with
//! [`DispatchError::Backpressure`] instead of being queued.

pub mod transport;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::cache::unix_now;
use crate::http::Request;

pub use transport::{
    BackendAddr, BackendRequest, BackendResponse, HttpTransport, Transport, TransportError,
    TransportFuture,
};

/// Default per-queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 20_000;

/// Default headroom kept free in each queue before requests are refused.
pub const DEFAULT_BACKPRESSURE_MARGIN: usize = 1_000;

/// Failure to obtain a backend response.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no request key found in the request")]
    MissingKey,

    #[error("worker {worker} busy, canceling request")]
    Backpressure { worker: usize },

    #[error("backend transport failed: {0}")]
    Transport(#[from] TransportError),

    #[error("proxy call panicked on worker {worker}")]
    Panicked { worker: usize },

    #[error("worker {worker} stopped before answering")]
    WorkerGone { worker: usize },
}

/// Pool sizing and request shaping.
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub workers: usize,
    pub queue_capacity: usize,
    pub backpressure_margin: usize,
    /// Scheme placed in front of the forwarded `Authorization` value.
    pub auth_scheme: String,
    /// Form value that carries the request-key.
    pub key_param: String,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            workers: default_worker_count(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            backpressure_margin: DEFAULT_BACKPRESSURE_MARGIN,
            auth_scheme: "X-HTTPCACHE-AUTH".to_owned(),
            key_param: "uuid".to_owned(),
        }
    }
}

/// Three workers per available core.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 3
}

/// Picks the worker for a request arriving at `now_secs`.
///
/// Every request within the same wall-clock second lands on the same worker.
pub fn worker_index(now_secs: i64, workers: usize) -> usize {
    (now_secs.rem_euclid(workers.max(1) as i64)) as usize
}

type DispatchResult = Result<BackendResponse, DispatchError>;
type Waiters = Arc<Mutex<HashMap<u64, oneshot::Sender<DispatchResult>>>>;

struct Job {
    ticket: u64,
    request: Request,
}

struct Completion {
    ticket: u64,
    result: DispatchResult,
}

/// Caller-side handle of one worker.
struct WorkerHandle {
    inbound: mpsc::Sender<Job>,
    outbound: mpsc::Sender<Completion>,
    waiters: Waiters,
    next_ticket: AtomicU64,
}

impl WorkerHandle {
    fn inbound_len(&self) -> usize {
        self.inbound.max_capacity() - self.inbound.capacity()
    }

    fn outbound_len(&self) -> usize {
        self.outbound.max_capacity() - self.outbound.capacity()
    }
}

fn lock_waiters(waiters: &Waiters) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<DispatchResult>>> {
    waiters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A request that has been queued on a worker.
#[derive(Debug)]
#[must_use = "the response is only delivered if the pending request is awaited"]
pub struct PendingResponse {
    worker: usize,
    rx: oneshot::Receiver<DispatchResult>,
}

impl PendingResponse {
    /// Index of the worker the request was queued on.
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Waits for the worker to produce this request's result.
    pub async fn wait(self) -> DispatchResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::WorkerGone {
                worker: self.worker,
            }),
        }
    }
}

/// The worker pool.
///
/// Dropping the dispatcher closes every inbound queue, which lets the
/// workers and collectors drain and exit.
pub struct Dispatcher {
    workers: Vec<WorkerHandle>,
    threshold: usize,
    key_param: String,
}

impl Dispatcher {
    /// Spawns the workers on the current Tokio runtime.
    pub fn start(options: DispatcherOptions, transport: Arc<dyn Transport>) -> Self {
        let count = options.workers.max(1);
        let capacity = options.queue_capacity.max(1);
        let auth_scheme: Arc<str> = Arc::from(options.auth_scheme.as_str());

        let workers = (0..count)
            .map(|id| {
                let (in_tx, in_rx) = mpsc::channel(capacity);
                let (out_tx, out_rx) = mpsc::channel(capacity);
                let waiters: Waiters = Arc::default();

                tokio::spawn(run_worker(
                    id,
                    in_rx,
                    out_tx.clone(),
                    Arc::clone(&transport),
                    Arc::clone(&auth_scheme),
                ));
                tokio::spawn(run_collector(id, out_rx, Arc::clone(&waiters)));

                WorkerHandle {
                    inbound: in_tx,
                    outbound: out_tx,
                    waiters,
                    next_ticket: AtomicU64::new(0),
                }
            })
            .collect();

        info!(workers = count, queue_capacity = capacity, "proxy workers started");

        Self {
            workers,
            threshold: capacity.saturating_sub(options.backpressure_margin),
            key_param: options.key_param,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Current `(inbound, outbound)` queue lengths of `worker`.
    pub fn queue_depth(&self, worker: usize) -> Option<(usize, usize)> {
        self.workers
            .get(worker)
            .map(|w| (w.inbound_len(), w.outbound_len()))
    }

    /// Proxies `request` and waits for the backend's answer.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::MissingKey`] when the request carries no request-key.
    /// - [`DispatchError::Backpressure`] when the selected worker is saturated.
    /// - [`DispatchError::Transport`] when the backend could not be reached or
    ///   answered with something unparseable.
    /// - [`DispatchError::Panicked`] when the call panicked; the worker keeps
    ///   serving.
    pub async fn send(&self, request: Request) -> DispatchResult {
        self.submit(request)?.wait().await
    }

    /// Queues `request` on the worker for the current second without waiting.
    pub fn submit(&self, request: Request) -> Result<PendingResponse, DispatchError> {
        match request.form_value(&self.key_param) {
            Some(key) if !key.is_empty() => {}
            _ => return Err(DispatchError::MissingKey),
        }

        let index = worker_index(unix_now(), self.workers.len());
        let worker = &self.workers[index];

        if worker.inbound_len() > self.threshold || worker.outbound_len() > self.threshold {
            warn!(worker = index, "worker busy, canceling request");
            return Err(DispatchError::Backpressure { worker: index });
        }

        let ticket = worker.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock_waiters(&worker.waiters).insert(ticket, tx);

        if let Err(err) = worker.inbound.try_send(Job { ticket, request }) {
            lock_waiters(&worker.waiters).remove(&ticket);
            return Err(match err {
                mpsc::error::TrySendError::Full(_) => DispatchError::Backpressure { worker: index },
                mpsc::error::TrySendError::Closed(_) => DispatchError::WorkerGone { worker: index },
            });
        }

        debug!(worker = index, ticket, "request queued");
        Ok(PendingResponse { worker: index, rx })
    }
}

async fn run_worker(
    id: usize,
    mut inbound: mpsc::Receiver<Job>,
    outbound: mpsc::Sender<Completion>,
    transport: Arc<dyn Transport>,
    auth_scheme: Arc<str>,
) {
    debug!(worker = id, "starting worker");

    while let Some(Job { ticket, request }) = inbound.recv().await {
        let transport = Arc::clone(&transport);
        let auth_scheme = Arc::clone(&auth_scheme);

        // Each call runs in its own task so a panic surfaces as a JoinError
        // here instead of unwinding through the worker loop.
        let call = tokio::spawn(async move {
            let backend_request = BackendRequest::forward(&request, &auth_scheme);
            transport.round_trip(backend_request).await
        });

        let result = match call.await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                warn!(worker = id, error = %err, "backend call failed");
                Err(DispatchError::Transport(err))
            }
            Err(join) => {
                error!(worker = id, error = %join, "recovered while sending request");
                Err(DispatchError::Panicked { worker: id })
            }
        };

        if outbound.send(Completion { ticket, result }).await.is_err() {
            break;
        }
    }

    debug!(worker = id, "worker stopped");
}

async fn run_collector(id: usize, mut outbound: mpsc::Receiver<Completion>, waiters: Waiters) {
    while let Some(Completion { ticket, result }) = outbound.recv().await {
        let waiter = lock_waiters(&waiters).remove(&ticket);
        match waiter {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(worker = id, ticket, "caller went away before the response"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::{Notify, Semaphore};

    fn request(path: &str) -> Request {
        let raw = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        Request::parse(raw.as_bytes()).unwrap().0
    }

    fn options(workers: usize, capacity: usize, margin: usize) -> DispatcherOptions {
        DispatcherOptions {
            workers,
            queue_capacity: capacity,
            backpressure_margin: margin,
            auth_scheme: "AUTH".into(),
            key_param: "uuid".into(),
        }
    }

    /// Echoes the target back, holding each call until the gate lets it through.
    struct GatedEcho {
        entered: Arc<Notify>,
        gate: Arc<Semaphore>,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl GatedEcho {
        fn new() -> Self {
            Self {
                entered: Arc::new(Notify::new()),
                gate: Arc::new(Semaphore::new(0)),
                seen: Arc::default(),
            }
        }
    }

    impl Transport for GatedEcho {
        fn round_trip(&self, request: BackendRequest) -> TransportFuture {
            let entered = Arc::clone(&self.entered);
            let gate = Arc::clone(&self.gate);
            let seen = Arc::clone(&self.seen);
            Box::pin(async move {
                seen.lock().unwrap().push(request.target().to_owned());
                entered.notify_one();
                gate.acquire().await.unwrap().forget();
                Ok(BackendResponse::new(200, request.target().to_owned()))
            })
        }
    }

    struct Scripted;

    impl Transport for Scripted {
        fn round_trip(&self, request: BackendRequest) -> TransportFuture {
            Box::pin(async move {
                match request.target() {
                    t if t.starts_with("/panic") => panic!("malformed request"),
                    t if t.starts_with("/down") => Err(TransportError::UnexpectedEof),
                    t if t.starts_with("/error") => Ok(BackendResponse::new(500, "boom")),
                    t => Ok(BackendResponse::new(200, t.to_owned())),
                }
            })
        }
    }

    #[test]
    fn worker_index_follows_the_clock() {
        assert_eq!(worker_index(1_700_000_000, 4), 0);
        assert_eq!(worker_index(1_700_000_001, 4), 1);
        assert_eq!(worker_index(1_700_000_007, 4), 3);
        assert_eq!(worker_index(42, 1), 0);
        assert_eq!(worker_index(42, 0), 0);
    }

    #[tokio::test]
    async fn missing_key_is_rejected_before_queueing() {
        let pool = Dispatcher::start(options(1, 16, 4), Arc::new(Scripted));
        let err = pool.send(request("/api/v1/x")).await.unwrap_err();
        assert!(matches!(err, DispatchError::MissingKey));
        let err = pool.send(request("/api/v1/x?uuid=")).await.unwrap_err();
        assert!(matches!(err, DispatchError::MissingKey));
    }

    #[tokio::test]
    async fn success_and_status_are_passed_through() {
        let pool = Dispatcher::start(options(2, 16, 4), Arc::new(Scripted));
        let ok = pool.send(request("/ok?uuid=k")).await.unwrap();
        assert_eq!(ok.status(), 200);
        assert_eq!(ok.body().as_ref(), b"/ok?uuid=k");

        let failed = pool.send(request("/error?uuid=k")).await.unwrap();
        assert_eq!(failed.status(), 500);
    }

    #[tokio::test]
    async fn transport_failure_is_distinct_from_bad_status() {
        let pool = Dispatcher::start(options(1, 16, 4), Arc::new(Scripted));
        let err = pool.send(request("/down?uuid=k")).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Transport(TransportError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn panic_is_recovered_and_worker_survives() {
        let pool = Dispatcher::start(options(1, 16, 4), Arc::new(Scripted));
        let err = pool.send(request("/panic?uuid=k")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Panicked { worker: 0 }));

        let ok = pool.send(request("/after?uuid=k")).await.unwrap();
        assert_eq!(ok.body().as_ref(), b"/after?uuid=k");
    }

    #[tokio::test]
    async fn saturated_worker_refuses_and_queue_stays_fifo() {
        // capacity 8, margin 4: refuse once a queue holds more than 4 items.
        let echo = GatedEcho::new();
        let entered = Arc::clone(&echo.entered);
        let gate = Arc::clone(&echo.gate);
        let seen = Arc::clone(&echo.seen);
        let pool = Dispatcher::start(options(1, 8, 4), Arc::new(echo));

        let mut pending = vec![pool.submit(request("/r0?uuid=k")).unwrap()];
        entered.notified().await;

        for i in 1..=5 {
            pending.push(pool.submit(request(&format!("/r{i}?uuid=k"))).unwrap());
        }
        assert_eq!(pool.queue_depth(0), Some((5, 0)));

        for _ in 0..3 {
            let err = pool.submit(request("/over?uuid=k")).unwrap_err();
            assert!(matches!(err, DispatchError::Backpressure { worker: 0 }));
        }

        gate.add_permits(64);
        let mut bodies = Vec::new();
        for p in pending {
            let resp = tokio::time::timeout(Duration::from_secs(5), p.wait())
                .await
                .unwrap()
                .unwrap();
            bodies.push(String::from_utf8(resp.into_body().to_vec()).unwrap());
        }

        let expected: Vec<String> = (0..=5).map(|i| format!("/r{i}?uuid=k")).collect();
        assert_eq!(bodies, expected);
        assert_eq!(*seen.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn concurrent_callers_get_their_own_responses() {
        let pool = Arc::new(Dispatcher::start(options(1, 64, 8), Arc::new(Scripted)));
        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    let path = format!("/item/{i}?uuid=k");
                    let resp = pool.send(request(&path)).await.unwrap();
                    assert_eq!(resp.body().as_ref(), path.as_bytes());
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }
    }
}
