//! Async listener using Tokio.
//!
//! Accepts connections on a TCP address or a Unix domain socket and
//! dispatches HTTP/1.1 requests to a handler function. Connections are
//! persistent by default.
//!
//! Two deadlines bound each connection: an idle read timeout, after which the
//! connection is closed, and a per-request handler deadline, after which the
//! client gets `504 Gateway Timeout`.

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::http::{
    StatusCode,
    request::{Request, RequestError},
    response::Response,
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

#[derive(Debug, Clone, Copy)]
struct Deadlines {
    read: Duration,
    request: Duration,
}

/// The HTTP listener.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use httpcache::server::Server;
/// use httpcache::http::{Request, Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080")
///         .await?
///         .request_timeout(Duration::from_secs(5));
///     server.run(|_req: Request| async {
///         Response::new(StatusCode::Ok).body("Hello!")
///     }).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: Listener,
    deadlines: Deadlines,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        Ok(Self::with_listener(Listener::Tcp(listener)))
    }

    /// Binds the server to a Unix domain socket at `path`, replacing a stale
    /// socket file left behind by a previous run.
    #[cfg(unix)]
    pub async fn bind_unix(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let bind_err = |source| ServerError::Bind {
            addr: path.display().to_string(),
            source,
        };

        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(bind_err(e)),
        }

        let listener = UnixListener::bind(path).map_err(bind_err)?;
        Ok(Self::with_listener(Listener::Unix(listener, path.to_owned())))
    }

    fn with_listener(listener: Listener) -> Self {
        Self {
            listener,
            deadlines: Deadlines {
                read: DEFAULT_TIMEOUT,
                request: DEFAULT_TIMEOUT,
            },
        }
    }

    /// Idle time after which a connection with no incoming data is closed.
    #[must_use]
    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.deadlines.read = read_timeout;
        self
    }

    /// Time a handler may take before the client is answered with 504.
    #[must_use]
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.deadlines.request = request_timeout;
        self
    }

    /// The bound TCP address, `None` for a Unix socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            Listener::Tcp(l) => l.local_addr().ok(),
            #[cfg(unix)]
            Listener::Unix(..) => None,
        }
    }

    /// Starts accepting connections and dispatching requests to `handler`.
    ///
    /// Runs until the process is terminated.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the listener itself fails.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let deadlines = self.deadlines;

        match self.listener {
            Listener::Tcp(listener) => {
                info!(address = %listener.local_addr()?, "httpcache listening");
                loop {
                    let (stream, peer_addr) = match listener.accept().await {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };
                    debug!(peer = %peer_addr, "connection accepted");
                    spawn_connection(stream, Some(peer_addr.to_string()), &handler, deadlines);
                }
            }
            #[cfg(unix)]
            Listener::Unix(listener, path) => {
                info!(socket = %path.display(), "httpcache listening");
                loop {
                    let (stream, _) = match listener.accept().await {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };
                    spawn_connection(stream, None, &handler, deadlines);
                }
            }
        }
    }
}

fn spawn_connection<S, H, F>(stream: S, peer: Option<String>, handler: &Arc<H>, deadlines: Deadlines)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let handler = Arc::clone(handler);
    tokio::spawn(async move {
        if let Err(e) = handle_connection(stream, peer.as_deref(), handler, deadlines).await {
            warn!(peer = peer.as_deref().unwrap_or("unix"), error = %e, "connection closed with error");
        }
    });
}

enum Frame {
    Request(Request),
    Reject(Response),
    Closed,
}

/// Reads until one complete request (headers and body) is buffered, then
/// removes it from `buf`. Bytes of a pipelined follow-up request stay in `buf`.
async fn next_request<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    read_timeout: Duration,
) -> Result<Frame, std::io::Error>
where
    S: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty() {
            match Request::parse(&buf[..]) {
                Ok((request, body_offset)) => {
                    let total_needed = body_offset.saturating_add(request.content_length().unwrap_or(0));
                    if total_needed > MAX_REQUEST_SIZE {
                        return Ok(Frame::Reject(too_large()));
                    }
                    if buf.len() >= total_needed {
                        buf.advance(total_needed);
                        return Ok(Frame::Request(request));
                    }
                }
                Err(RequestError::Incomplete) if buf.len() > MAX_REQUEST_SIZE => {
                    return Ok(Frame::Reject(too_large()));
                }
                Err(RequestError::Incomplete) => {}
                Err(e) => {
                    warn!(error = %e, "bad request, sending 400");
                    return Ok(Frame::Reject(
                        Response::new(StatusCode::BadRequest).body(format!("Bad Request: {e}")),
                    ));
                }
            }
        }

        match timeout(read_timeout, stream.read_buf(buf)).await {
            Ok(Ok(0)) => return Ok(Frame::Closed),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!("idle read timeout, closing connection");
                return Ok(Frame::Closed);
            }
        }
    }
}

fn too_large() -> Response {
    warn!("request too large, sending 413");
    Response::new(StatusCode::PayloadTooLarge).body("Request entity too large")
}

/// Handles a single connection over its lifetime.
async fn handle_connection<S, H, F>(
    mut stream: S,
    peer: Option<&str>,
    handler: Arc<H>,
    deadlines: Deadlines,
) -> Result<(), std::io::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let request = match next_request(&mut stream, &mut buf, deadlines.read).await? {
            Frame::Request(request) => request,
            Frame::Reject(response) => {
                stream.write_all(&response.keep_alive(false).into_bytes()).await?;
                break;
            }
            Frame::Closed => {
                debug!(peer = peer.unwrap_or("unix"), "connection closed");
                break;
            }
        };

        let request = match peer {
            Some(addr) => request.with_remote_addr(addr),
            None => request,
        };
        let keep_alive = request.is_keep_alive();

        debug!(
            peer = peer.unwrap_or("unix"),
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let response = match timeout(deadlines.request, handler(request)).await {
            Ok(response) => response.keep_alive(keep_alive),
            Err(_) => {
                warn!(peer = peer.unwrap_or("unix"), "handler deadline exceeded, sending 504");
                Response::json(StatusCode::GatewayTimeout, r#"{"status":"failure"}"#)
                    .keep_alive(keep_alive)
            }
        };

        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;

        if !keep_alive {
            debug!(peer = peer.unwrap_or("unix"), "Connection: close, shutting down");
            break;
        }
    }

    Ok(())
}
