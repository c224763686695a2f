//! Request routing: map URL patterns and methods to handler functions.
//!
//! | Pattern     | Example match               |
//! |-------------|-----------------------------|
//! | `/stats`    | `/stats`, `/stats/`         |
//! | `/files/*`  | `/files/docs/readme.txt`    |
//! | `/*`        | every path                  |
//!
//! Trailing slashes are normalized on exact patterns and incoming paths.
//! Routes are matched in registration order; the first route whose method
//! filter and pattern both match wins. Every matched request runs through the
//! router's middleware layers before reaching its handler.

use std::pin::Pin;
use std::sync::Arc;

use crate::middleware::{Middleware, MiddlewareHandler, Next, from_middleware};
use crate::{Method, Request, Response, StatusCode};

/// Type-erased, heap-allocated async handler.
pub type Handler =
    Arc<dyn Fn(Request) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Request) -> impl Future<Output = Response> + Send` that is also
/// `Send + Sync + 'static` implements this trait through the blanket impl.
pub trait IntoHandler: Send + Sync + 'static {
    fn call(&self, req: Request) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

impl<T, F> IntoHandler for T
where
    T: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    fn call(&self, req: Request) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin((self)(req))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    // One exact path, e.g. `/httpCache/invalidate`.
    Exact(String),
    // Any path starting with the prefix, e.g. `/files/*`. `/*` has an empty prefix.
    Prefix(String),
}

impl Pattern {
    fn parse(pattern: &str) -> Self {
        if let Some(prefix) = pattern.strip_suffix("/*") {
            return Pattern::Prefix(prefix.to_owned());
        }
        Pattern::Exact(trim_trailing_slash(pattern).to_owned())
    }

    fn matches(&self, path: &str) -> bool {
        match self {
            Pattern::Exact(p) => p == trim_trailing_slash(path),
            Pattern::Prefix(prefix) => path.starts_with(prefix.as_str()),
        }
    }
}

fn trim_trailing_slash(path: &str) -> &str {
    if path != "/" && path.ends_with('/') {
        &path[..path.len() - 1]
    } else {
        path
    }
}

struct Route {
    // `None` accepts every method.
    method: Option<Method>,
    pattern: Pattern,
    handler: Handler,
}

impl Route {
    fn matches(&self, method: &Method, path: &str) -> bool {
        self.method.as_ref().is_none_or(|m| m == method) && self.pattern.matches(path)
    }
}

/// HTTP request router.
///
/// When no route matches, a `404 Not Found` response is returned.
///
/// # Examples
///
/// ```rust,no_run
/// use httpcache::{Method, Request, Response, StatusCode, router::Router};
/// use httpcache::middleware::LoggerMiddleware;
///
/// let mut router = Router::new();
/// router.layer(LoggerMiddleware);
/// router.on(Method::Get, "/ping", |_req: Request| async { Response::new(StatusCode::Ok) });
/// router.any("/*", |_req: Request| async { Response::new(StatusCode::NotFound) });
/// ```
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
    middlewares: Vec<MiddlewareHandler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `method` requests matching `path`.
    pub fn on(&mut self, method: Method, path: &str, handler: impl IntoHandler) {
        self.add_route(Some(method), path, handler);
    }

    /// Registers `handler` for requests of any method matching `path`.
    pub fn any(&mut self, path: &str, handler: impl IntoHandler) {
        self.add_route(None, path, handler);
    }

    /// Appends a middleware layer. Layers run in the order they were added.
    pub fn layer<M: Middleware + 'static>(&mut self, middleware: M) {
        self.middlewares.push(from_middleware(Arc::new(middleware)));
    }

    fn add_route(&mut self, method: Option<Method>, path: &str, handler: impl IntoHandler) {
        let handler: Handler = Arc::new(move |req| handler.call(req));
        self.routes.push(Route {
            method,
            pattern: Pattern::parse(path),
            handler,
        });
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Dispatches `request` through the middleware layers to the first
    /// matching route.
    pub async fn route(&self, request: Request) -> Response {
        let Some(route) = self
            .routes
            .iter()
            .find(|r| r.matches(request.method(), request.path()))
        else {
            return Response::new(StatusCode::NotFound);
        };

        let handler = Arc::clone(&route.handler);
        let terminal: MiddlewareHandler = Arc::new(move |req: Request, _next: Next| handler(req));

        let mut chain = self.middlewares.clone();
        chain.push(terminal);
        Next::new(chain).run(request).await
    }
}
