//! The request orchestrator.
//!
//! [`HttpCache`] decides, for every inbound request, whether it is answered
//! from the cache, by a local handler, or by the backend:
//!
//! ```text
//! key? ──no──► MissingKey
//!  │
//! skip-listed? ──yes─────────────────┐
//!  │no                               │
//! valid entry? ──yes──► HIT          │
//!  │no                               ▼
//! local handler? ──yes──► handler output (cache untouched)
//!  │no
//! proxy ──err/non-200──► backend failure (cache untouched)
//!  │200
//! add to cache, return body
//! ```
//!
//! The decision list is linear: once a branch is taken the others are not
//! tried, and nothing is retried.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{CacheError, CacheStore};
use crate::config::Config;
use crate::middleware::LoggerMiddleware;
use crate::proxy::{
    BackendAddr, DispatchError, Dispatcher, DispatcherOptions, HttpTransport, Transport,
};
use crate::router::Router;
use crate::stats::{Event, Stats};
use crate::{Method, Request, Response, StatusCode};

/// Route that invalidates every cached API of a request-key.
pub const INVALIDATE_PATH: &str = "/httpCache/invalidate";

/// Route that serves the JSON stats snapshot.
pub const STATS_PATH: &str = "/httpCache/stats";

/// Error a local handler may fail with.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type LocalFuture = Pin<Box<dyn Future<Output = Result<Bytes, HandlerError>> + Send>>;

/// Type-erased local handler, registered for one exact API path.
pub type LocalHandler = Arc<dyn Fn(Request) -> LocalFuture + Send + Sync + 'static>;

/// Conversion trait for async local handler functions.
pub trait IntoLocalHandler: Send + Sync + 'static {
    fn call(&self, req: Request) -> LocalFuture;
}

impl<T, F> IntoLocalHandler for T
where
    T: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
{
    fn call(&self, req: Request) -> LocalFuture {
        Box::pin((self)(req))
    }
}

/// Why a request could not be answered.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no request key found in the request")]
    MissingKey,

    #[error(transparent)]
    NotFound(#[from] CacheError),

    #[error("worker {worker} busy, canceling request")]
    Backpressure { worker: usize },

    #[error(transparent)]
    Dispatch(DispatchError),

    #[error("backend answered with status {status}")]
    BackendStatus { status: u16 },

    #[error("local handler for {api} failed: {source}")]
    Handler {
        api: String,
        #[source]
        source: HandlerError,
    },
}

impl From<DispatchError> for ServiceError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::MissingKey => ServiceError::MissingKey,
            DispatchError::Backpressure { worker } => ServiceError::Backpressure { worker },
            other => ServiceError::Dispatch(other),
        }
    }
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::MissingKey => StatusCode::BadRequest,
            ServiceError::NotFound(_) => StatusCode::NotFound,
            ServiceError::Backpressure { .. } => StatusCode::ServiceUnavailable,
            ServiceError::Dispatch(_) | ServiceError::BackendStatus { .. } => {
                StatusCode::BadGateway
            }
            ServiceError::Handler { .. } => StatusCode::InternalServerError,
        }
    }

    /// `{"status":"failure","error":"..."}` with the mapped status code.
    pub fn into_response(self) -> Response {
        let body = json!({ "status": "failure", "error": self.to_string() });
        Response::json(self.status_code(), body.to_string())
    }
}

/// The caching proxy: cache, worker pool, skip-set and local handlers.
///
/// Build one with [`HttpCache::builder`] inside a Tokio runtime; the
/// dispatcher spawns its workers on construction.
pub struct HttpCache {
    cache: CacheStore,
    dispatcher: Dispatcher,
    skip: HashSet<String>,
    local: HashMap<String, LocalHandler>,
    stats: Arc<Stats>,
    key_param: String,
    diagnose: AtomicBool,
}

impl HttpCache {
    pub fn builder(config: &Config) -> HttpCacheBuilder {
        HttpCacheBuilder {
            options: config.dispatcher_options(),
            skip: config.skip_set(),
            diagnose: config.server.diagnose,
            transport: None,
            backend: config.backend_addr(),
            local: HashMap::new(),
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn is_skipped(&self, api: &str) -> bool {
        self.skip.contains(api)
    }

    pub fn diagnose(&self) -> bool {
        self.diagnose.load(Ordering::Relaxed)
    }

    pub fn set_diagnose(&self, on: bool) {
        let was = self.diagnose.swap(on, Ordering::Relaxed);
        if was != on {
            info!(diagnose = on, "diagnose mode changed");
        }
    }

    /// Answers one request through the skip → hit → local → proxy decision list.
    ///
    /// # Errors
    ///
    /// - [`ServiceError::MissingKey`] when the request carries no request-key.
    /// - [`ServiceError::Handler`] when a local handler fails.
    /// - [`ServiceError::Backpressure`] when the selected worker is saturated.
    /// - [`ServiceError::Dispatch`] when the backend could not be reached.
    /// - [`ServiceError::BackendStatus`] when the backend answered non-200.
    pub async fn process_request(&self, request: Request) -> Result<Bytes, ServiceError> {
        self.stats.record_request();

        let key = request
            .form_value(&self.key_param)
            .filter(|k| !k.is_empty())
            .ok_or(ServiceError::MissingKey)?;
        let api = request.path().to_owned();

        if self.is_skipped(&api) {
            self.stats.record(&key, &api, Event::Skipped);
        } else if let Some(payload) = self.cache.lookup(&key, &api) {
            self.stats.record(&key, &api, Event::Hit);
            debug!(key = %key, api = %api, "cache hit");
            return Ok(payload);
        } else {
            self.stats.record(&key, &api, Event::Miss);
        }

        if let Some(handler) = self.local.get(&api) {
            self.stats.record(&key, &api, Event::LocalHandled);
            debug!(key = %key, api = %api, "handled locally");
            return handler(request)
                .await
                .map_err(|source| ServiceError::Handler { api, source });
        }

        self.stats.record(&key, &api, Event::Proxied);
        let response = match self.dispatcher.send(request).await {
            Ok(response) => response,
            Err(err) => {
                if matches!(err, DispatchError::Backpressure { .. }) {
                    self.stats.record_rejected();
                } else {
                    self.stats.record(&key, &api, Event::BackendFailed);
                }
                return Err(err.into());
            }
        };

        if !response.is_ok() {
            self.stats.record(&key, &api, Event::BackendFailed);
            warn!(key = %key, api = %api, status = response.status(), "backend failure");
            return Err(ServiceError::BackendStatus {
                status: response.status(),
            });
        }

        let body = response.into_body();
        self.cache.add(&key, &api, body.clone());
        self.stats.record(&key, &api, Event::CacheAdded);
        Ok(body)
    }

    /// Marks every cached API of `key` stale.
    pub fn invalidate(&self, key: &str) -> Result<(), ServiceError> {
        self.stats.record_invalidation(key);
        self.cache.invalidate(key)?;
        Ok(())
    }

    async fn serve(&self, request: Request) -> Response {
        match self.process_request(request).await {
            Ok(body) => Response::json(StatusCode::Ok, body),
            Err(err) => {
                warn!(error = %err, "request failed");
                err.into_response()
            }
        }
    }

    fn serve_invalidate(&self, request: &Request) -> Response {
        let result = match request.form_value(&self.key_param) {
            Some(key) if !key.is_empty() => self.invalidate(&key),
            _ => Err(ServiceError::MissingKey),
        };

        match result {
            Ok(()) => Response::json(StatusCode::Ok, json!({ "status": "success" }).to_string()),
            Err(err) => {
                warn!(error = %err, "invalidation failed");
                err.into_response()
            }
        }
    }

    fn serve_stats(&self) -> Response {
        match serde_json::to_vec(&self.stats.snapshot()) {
            Ok(body) => Response::json(StatusCode::Ok, body),
            Err(err) => {
                warn!(error = %err, "failed to serialise stats");
                Response::new(StatusCode::InternalServerError)
            }
        }
    }

    /// The service's routes, wrapped in request logging.
    pub fn router(self: &Arc<Self>) -> Router {
        let mut router = Router::new();
        router.layer(LoggerMiddleware);

        let svc = Arc::clone(self);
        router.any(INVALIDATE_PATH, move |req: Request| {
            let svc = Arc::clone(&svc);
            async move { svc.serve_invalidate(&req) }
        });

        let svc = Arc::clone(self);
        router.on(Method::Get, STATS_PATH, move |_req: Request| {
            let svc = Arc::clone(&svc);
            async move { svc.serve_stats() }
        });

        let svc = Arc::clone(self);
        router.any("/*", move |req: Request| {
            let svc = Arc::clone(&svc);
            async move { svc.serve(req).await }
        });

        router
    }

    /// Logs load figures every `period` while diagnose mode is on. Never returns.
    pub async fn monitor(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        let mut last = self.stats.totals().requests;

        loop {
            ticker.tick().await;
            let requests = self.stats.totals().requests;
            if self.diagnose() {
                let rps = requests.saturating_sub(last) as f64 / period.as_secs_f64();
                info!(
                    tracked_keys = self.stats.tracked_keys(),
                    cached_keys = self.cache.bucket_count(),
                    requests,
                    rps,
                    "monitor"
                );
            }
            last = requests;
        }
    }
}

/// Builder for [`HttpCache`].
#[must_use]
pub struct HttpCacheBuilder {
    options: DispatcherOptions,
    skip: HashSet<String>,
    diagnose: bool,
    transport: Option<Arc<dyn Transport>>,
    backend: BackendAddr,
    local: HashMap<String, LocalHandler>,
}

impl HttpCacheBuilder {
    /// Replaces the backend transport. Defaults to [`HttpTransport`] dialing
    /// the configured backend.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Answers requests for exactly `api` with `handler` instead of the
    /// backend. Their responses are not cached.
    pub fn local_handler(mut self, api: impl Into<String>, handler: impl IntoLocalHandler) -> Self {
        let handler: LocalHandler = Arc::new(move |req| handler.call(req));
        self.local.insert(api.into(), handler);
        self
    }

    pub fn build(self) -> HttpCache {
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::new(self.backend)));
        let key_param = self.options.key_param.clone();

        info!(
            skip_apis = self.skip.len(),
            local_handlers = self.local.len(),
            "http cache ready"
        );

        HttpCache {
            cache: CacheStore::new(),
            dispatcher: Dispatcher::start(self.options, transport),
            skip: self.skip,
            local: self.local,
            stats: Arc::new(Stats::new()),
            key_param,
            diagnose: AtomicBool::new(self.diagnose),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{BackendRequest, BackendResponse, TransportError, TransportFuture};
    use std::sync::Mutex;

    /// Backend double: answers from a path → (status, body) table and counts calls.
    #[derive(Default)]
    struct FakeBackend {
        routes: Mutex<HashMap<String, (u16, &'static str)>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeBackend {
        fn with(self, path: &str, status: u16, body: &'static str) -> Self {
            self.routes.lock().unwrap().insert(path.to_owned(), (status, body));
            self
        }

        fn set(&self, path: &str, status: u16, body: &'static str) {
            self.routes.lock().unwrap().insert(path.to_owned(), (status, body));
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    struct Shared(Arc<FakeBackend>);

    impl Transport for Shared {
        fn round_trip(&self, request: BackendRequest) -> TransportFuture {
            let backend = Arc::clone(&self.0);
            Box::pin(async move {
                let path = request
                    .target()
                    .split_once('?')
                    .map_or(request.target(), |(p, _)| p)
                    .to_owned();
                backend.calls.lock().unwrap().push(path.clone());
                match backend.routes.lock().unwrap().get(&path) {
                    Some(&(status, body)) => Ok(BackendResponse::new(status, body)),
                    None => Err(TransportError::UnexpectedEof),
                }
            })
        }
    }

    fn config() -> Config {
        Config::from_json(
            r#"{"proxy": {"no_of_workers": 2, "queue_capacity": 64, "backpressure_margin": 8},
                "skip_cache_apis": ["login/"]}"#,
        )
        .unwrap()
    }

    fn service(backend: &Arc<FakeBackend>) -> Arc<HttpCache> {
        Arc::new(
            HttpCache::builder(&config())
                .transport(Arc::new(Shared(Arc::clone(backend))))
                .local_handler("/api/v1/local", |req: Request| async move {
                    let key = req.form_value("uuid").unwrap_or_default();
                    Ok::<_, HandlerError>(Bytes::from(format!("local:{key}")))
                })
                .local_handler("/api/v1/broken", |_req: Request| async {
                    Err::<Bytes, HandlerError>("disk on fire".into())
                })
                .build(),
        )
    }

    fn get(path: &str) -> Request {
        let raw = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        Request::parse(raw.as_bytes()).unwrap().0
    }

    #[tokio::test]
    async fn missing_key_is_a_client_error() {
        let backend = Arc::new(FakeBackend::default());
        let svc = service(&backend);

        let err = svc.process_request(get("/api/v1/devices")).await.unwrap_err();
        assert!(matches!(err, ServiceError::MissingKey));
        assert_eq!(err.status_code(), StatusCode::BadRequest);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn ok_response_is_cached_and_served_as_hit() {
        let backend = Arc::new(FakeBackend::default().with("/api/v1/devices", 200, "[1,2]"));
        let svc = service(&backend);

        let first = svc.process_request(get("/api/v1/devices?uuid=cp1")).await.unwrap();
        assert_eq!(first.as_ref(), b"[1,2]");
        assert_eq!(backend.calls(), 1);

        backend.set("/api/v1/devices", 200, "[changed]");
        let second = svc.process_request(get("/api/v1/devices?uuid=cp1")).await.unwrap();
        assert_eq!(second.as_ref(), b"[1,2]");
        assert_eq!(backend.calls(), 1, "hit must not reach the backend");

        let totals = svc.stats().totals();
        assert_eq!(totals.hits, 1);
        assert_eq!(totals.misses, 1);
        assert_eq!(totals.cache_added, 1);
    }

    #[tokio::test]
    async fn invalidation_forces_a_refetch() {
        let backend = Arc::new(FakeBackend::default().with("/api/v1/devices", 200, "old"));
        let svc = service(&backend);

        svc.process_request(get("/api/v1/devices?uuid=cp1")).await.unwrap();
        backend.set("/api/v1/devices", 200, "new");
        svc.invalidate("cp1").unwrap();

        let body = svc.process_request(get("/api/v1/devices?uuid=cp1")).await.unwrap();
        assert_eq!(body.as_ref(), b"new");
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn backend_failure_leaves_cache_untouched() {
        let backend = Arc::new(FakeBackend::default().with("/api/v1/devices", 500, "boom"));
        let svc = service(&backend);

        let err = svc.process_request(get("/api/v1/devices?uuid=cp1")).await.unwrap_err();
        assert!(matches!(err, ServiceError::BackendStatus { status: 500 }));
        assert_eq!(err.status_code(), StatusCode::BadGateway);
        assert!(!svc.cache().is_valid("cp1", "/api/v1/devices"));
        assert_eq!(svc.cache().get("cp1", "/api/v1/devices"), None);
        assert_eq!(svc.stats().totals().backend_failed, 1);
    }

    #[tokio::test]
    async fn transport_failure_is_a_dispatch_error() {
        let backend = Arc::new(FakeBackend::default());
        let svc = service(&backend);

        let err = svc.process_request(get("/api/v1/gone?uuid=cp1")).await.unwrap_err();
        assert!(matches!(err, ServiceError::Dispatch(DispatchError::Transport(_))));
        assert_eq!(svc.cache().bucket_count(), 0);
    }

    #[tokio::test]
    async fn skip_listed_api_is_always_proxied() {
        let backend = Arc::new(FakeBackend::default().with("/api/v2/login/", 200, "fresh"));
        let svc = service(&backend);
        svc.cache().add("cp1", "/api/v2/login/", Bytes::from_static(b"cached"));

        for _ in 0..2 {
            let body = svc.process_request(get("/api/v2/login/?uuid=cp1")).await.unwrap();
            assert_eq!(body.as_ref(), b"fresh");
        }
        assert_eq!(backend.calls(), 2);
        assert_eq!(svc.stats().totals().skipped, 2);
        assert_eq!(svc.stats().totals().hits, 0);
    }

    #[tokio::test]
    async fn local_handler_short_circuits_without_caching() {
        let backend = Arc::new(FakeBackend::default());
        let svc = service(&backend);

        let body = svc.process_request(get("/api/v1/local?uuid=cp9")).await.unwrap();
        assert_eq!(body.as_ref(), b"local:cp9");
        assert_eq!(backend.calls(), 0);
        assert!(!svc.cache().is_valid("cp9", "/api/v1/local"));
        assert!(!svc.cache().contains_key("cp9"));

        let err = svc.process_request(get("/api/v1/broken?uuid=cp9")).await.unwrap_err();
        assert!(matches!(err, ServiceError::Handler { .. }));
        assert_eq!(err.status_code(), StatusCode::InternalServerError);
    }

    #[tokio::test]
    async fn invalidating_unknown_key_is_not_found() {
        let backend = Arc::new(FakeBackend::default());
        let svc = service(&backend);

        let err = svc.invalidate("nobody").unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        assert_eq!(err.status_code(), StatusCode::NotFound);
        assert!(!svc.cache().contains_key("nobody"));
    }

    #[tokio::test]
    async fn routes_map_outcomes_to_statuses() {
        let backend = Arc::new(FakeBackend::default().with("/api/v1/devices", 200, "[1]"));
        let svc = service(&backend);
        let router = svc.router();

        let res = router.route(get("/api/v1/devices?uuid=cp1")).await;
        assert_eq!(res.status(), StatusCode::Ok);
        assert_eq!(res.body_bytes().as_ref(), b"[1]");

        let res = router.route(get("/api/v1/devices")).await;
        assert_eq!(res.status(), StatusCode::BadRequest);

        let res = router.route(get("/httpCache/invalidate?uuid=cp1")).await;
        assert_eq!(res.status(), StatusCode::Ok);
        assert_eq!(res.body_bytes().as_ref(), br#"{"status":"success"}"#);

        let res = router.route(get("/httpCache/invalidate?uuid=unknown")).await;
        assert_eq!(res.status(), StatusCode::NotFound);
        let body: serde_json::Value = serde_json::from_slice(res.body_bytes()).unwrap();
        assert_eq!(body["status"], "failure");

        let res = router.route(get(STATS_PATH)).await;
        assert_eq!(res.status(), StatusCode::Ok);
        let body: serde_json::Value = serde_json::from_slice(res.body_bytes()).unwrap();
        assert_eq!(body["totals"]["invalidations"], 2);
    }

    #[tokio::test]
    async fn diagnose_toggles() {
        let backend = Arc::new(FakeBackend::default());
        let svc = service(&backend);
        assert!(!svc.diagnose());
        svc.set_diagnose(true);
        assert!(svc.diagnose());
    }
}
