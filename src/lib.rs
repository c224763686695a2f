//! # httpcache
//!
//! A caching reverse proxy. Responses from a backend are cached per
//! request-key and API path, invalidated per request-key, and fetched through
//! a fixed pool of backend workers that refuse work when saturated.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use httpcache::config::Config;
//! use httpcache::server::Server;
//! use httpcache::service::HttpCache;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("/etc/httpcache/apis.json")?;
//!     let service = Arc::new(HttpCache::builder(&config).build());
//!     let router = Arc::new(service.router());
//!
//!     let server = Server::bind("127.0.0.1:8098").await?;
//!     server
//!         .run(move |req| {
//!             let router = Arc::clone(&router);
//!             async move { router.route(req).await }
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
#[cfg(unix)]
pub mod command;
pub mod config;
pub mod http;
pub mod middleware;
pub mod proxy;
pub mod router;
pub mod server;
pub mod service;
pub mod stats;

pub use cache::{CacheError, CacheStore};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use proxy::{DispatchError, Dispatcher};
pub use server::{Server, ServerError};
pub use service::{HttpCache, ServiceError};
