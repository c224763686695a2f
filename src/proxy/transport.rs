//! Backend transport: one HTTP/1.1 round trip per call.
//!
//! [`HttpTransport`] dials the backend for every request (Unix socket or
//! TCP), writes the forwarded request with `Connection: close` and reads the
//! response back with [`httparse`]. Tests swap in their own [`Transport`].

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::http::{Headers, Method, Request};

/// Largest backend response we are willing to buffer (64 MiB).
const MAX_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

const INITIAL_BUF_SIZE: usize = 8 * 1024;

const MAX_HEADERS: usize = 64;

/// Header names the forwarder derives itself instead of copying.
const DERIVED_HEADERS: &[&str] = &[
    "host",
    "authorization",
    "x-forwarded-for",
    "content-length",
    "transfer-encoding",
    "connection",
];

/// Failure to complete a round trip with the backend.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed backend response: {0}")]
    Parse(#[from] httparse::Error),

    #[error("malformed chunked body from backend")]
    InvalidChunk,

    #[error("invalid Content-Length from backend")]
    InvalidContentLength,

    #[error("backend closed the connection before the response was complete")]
    UnexpectedEof,

    #[error("backend response exceeds {max_bytes} bytes")]
    TooLarge { max_bytes: usize },

    #[error("unix socket backends are not supported on this platform")]
    Unsupported,
}

/// Boxed future returned by [`Transport::round_trip`].
pub type TransportFuture =
    Pin<Box<dyn Future<Output = Result<BackendResponse, TransportError>> + Send>>;

/// Performs a single request against the backend.
///
/// The returned future must not borrow `self`: workers run each call in its
/// own task so that a panic inside the transport stays contained.
pub trait Transport: Send + Sync + 'static {
    fn round_trip(&self, request: BackendRequest) -> TransportFuture;
}

/// Where the backend listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendAddr {
    Unix(PathBuf),
    Tcp(String),
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

/// A request as it will be sent to the backend.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    method: Method,
    target: String,
    headers: Headers,
    body: Bytes,
}

impl BackendRequest {
    /// Builds the backend request for an inbound `original`.
    ///
    /// Method, target and body are copied. `Host` comes from the original
    /// request, `X-Forwarded-For` from its remote address and `Authorization`
    /// becomes `<auth_scheme> sessionid=<original Authorization>`. Every other
    /// header is copied as-is.
    pub fn forward(original: &Request, auth_scheme: &str) -> Self {
        let target = match original.query_string() {
            Some(query) => format!("{}?{}", original.path(), query),
            None => original.path().to_owned(),
        };

        let mut headers = Headers::with_capacity(original.headers().len() + 3);
        headers.insert(
            "Host",
            original.headers().get("host").unwrap_or("localhost"),
        );
        if let Some(remote) = original.remote_addr() {
            headers.insert("X-Forwarded-For", remote);
        }
        headers.insert(
            "Authorization",
            format!(
                "{auth_scheme} sessionid={}",
                original.headers().get("authorization").unwrap_or_default()
            ),
        );
        for (name, value) in original.headers().iter() {
            if !DERIVED_HEADERS.iter().any(|d| name.eq_ignore_ascii_case(d)) {
                headers.insert(name, value);
            }
        }

        Self {
            method: original.method().clone(),
            target,
            headers,
            body: original.body().clone(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Serialises the request for a fresh connection.
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(256 + self.headers.len() * 64 + self.body.len());
        buf.put(format!("{} {} HTTP/1.1\r\n", self.method, self.target).as_bytes());
        buf.put(self.headers.to_string().as_bytes());
        buf.put(
            format!(
                "Content-Length: {}\r\nConnection: close\r\n\r\n",
                self.body.len()
            )
            .as_bytes(),
        );
        buf.put(self.body.clone());
        buf
    }
}

/// A complete response read from the backend.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    status: u16,
    headers: Headers,
    body: Bytes,
}

impl BackendResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: body.into(),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Tries to parse a full response from `buf`.
    ///
    /// Returns `Ok(None)` while more bytes are needed. `eof` tells the parser
    /// the peer has closed, which completes a body that has no explicit
    /// framing. `expect_body` is `false` for responses to `HEAD`.
    pub fn parse(buf: &[u8], eof: bool, expect_body: bool) -> Result<Option<Self>, TransportError> {
        ResponseDecoder::new(expect_body).decode(buf, eof)
    }
}

/// How the body of a backend response is delimited.
#[derive(Debug)]
enum Framing {
    Empty,
    Length(usize),
    Chunked(ChunkedDecoder),
    UntilEof,
}

/// Status line and headers of a backend response, once fully received.
#[derive(Debug)]
struct Head {
    status: u16,
    headers: Headers,
    body_offset: usize,
    framing: Framing,
}

impl Head {
    fn parse(buf: &[u8], expect_body: bool) -> Result<Option<Self>, TransportError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut raw = httparse::Response::new(&mut headers);

        let body_offset = match raw.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Ok(None),
        };
        let status = raw.code.unwrap_or_default();

        let mut header_map = Headers::with_capacity(raw.headers.len());
        for header in raw.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let bodiless = !expect_body || (100..200).contains(&status) || status == 204 || status == 304;
        let framing = if bodiless {
            Framing::Empty
        } else if header_map
            .get("transfer-encoding")
            .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"))
        {
            Framing::Chunked(ChunkedDecoder::default())
        } else if let Some(len) = header_map.get("content-length") {
            let len = len
                .trim()
                .parse()
                .map_err(|_| TransportError::InvalidContentLength)?;
            Framing::Length(len)
        } else {
            Framing::UntilEof
        };

        Ok(Some(Self {
            status,
            headers: header_map,
            body_offset,
            framing,
        }))
    }
}

/// Incremental response parser fed with a growing buffer.
///
/// The head is parsed once and chunked bodies are decoded as chunks arrive,
/// so each byte is copied a bounded number of times however many reads the
/// response takes.
#[derive(Debug)]
struct ResponseDecoder {
    expect_body: bool,
    head: Option<Head>,
}

impl ResponseDecoder {
    fn new(expect_body: bool) -> Self {
        Self {
            expect_body,
            head: None,
        }
    }

    /// `buf` must hold everything received so far, starting at the status line.
    fn decode(&mut self, buf: &[u8], eof: bool) -> Result<Option<BackendResponse>, TransportError> {
        if self.head.is_none() {
            self.head = Head::parse(buf, self.expect_body)?;
        }
        let Some(head) = self.head.as_mut() else {
            return Ok(None);
        };

        let rest = &buf[head.body_offset..];
        let body = match &mut head.framing {
            Framing::Empty => Some(Bytes::new()),
            Framing::Length(len) => (rest.len() >= *len).then(|| Bytes::copy_from_slice(&rest[..*len])),
            Framing::Chunked(chunks) => chunks.feed(rest)?,
            Framing::UntilEof => eof.then(|| Bytes::copy_from_slice(rest)),
        };

        Ok(body.and_then(|body| {
            self.head.take().map(|head| BackendResponse {
                status: head.status,
                headers: head.headers,
                body,
            })
        }))
    }
}

/// Decodes a chunked body across reads.
#[derive(Debug, Default)]
struct ChunkedDecoder {
    // Offset into the body bytes of the first chunk not yet decoded.
    pos: usize,
    body: BytesMut,
}

impl ChunkedDecoder {
    /// Consumes every complete chunk in `buf` past the ones already decoded.
    ///
    /// Returns the body once the last chunk and its trailers have arrived.
    fn feed(&mut self, buf: &[u8]) -> Result<Option<Bytes>, TransportError> {
        loop {
            let rest = &buf[self.pos..];
            let (consumed, size) = match httparse::parse_chunk_size(rest) {
                Ok(httparse::Status::Complete(pair)) => pair,
                Ok(httparse::Status::Partial) => return Ok(None),
                Err(_) => return Err(TransportError::InvalidChunk),
            };

            if size == 0 {
                // Trailers are dropped; we only need to see where they end.
                let trailers = &rest[consumed..];
                let done = trailers.starts_with(b"\r\n") || trailers.windows(4).any(|w| w == b"\r\n\r\n");
                return Ok(done.then(|| std::mem::take(&mut self.body).freeze()));
            }

            let data_end = usize::try_from(size)
                .ok()
                .and_then(|size| consumed.checked_add(size))
                .ok_or(TransportError::InvalidChunk)?;
            let chunk_end = data_end.checked_add(2).ok_or(TransportError::InvalidChunk)?;
            if rest.len() < chunk_end {
                return Ok(None);
            }
            if &rest[data_end..chunk_end] != b"\r\n" {
                return Err(TransportError::InvalidChunk);
            }
            self.body.put(&rest[consumed..data_end]);
            self.pos += chunk_end;
        }
    }
}

/// The production transport: a fresh connection to [`BackendAddr`] per call.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    addr: BackendAddr,
}

impl HttpTransport {
    pub fn new(addr: BackendAddr) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> &BackendAddr {
        &self.addr
    }
}

impl Transport for HttpTransport {
    fn round_trip(&self, request: BackendRequest) -> TransportFuture {
        let addr = self.addr.clone();
        Box::pin(async move {
            trace!(backend = %addr, method = %request.method(), target = request.target(), "dialing backend");
            match addr {
                BackendAddr::Tcp(addr) => exchange(TcpStream::connect(addr).await?, &request).await,
                #[cfg(unix)]
                BackendAddr::Unix(path) => {
                    exchange(tokio::net::UnixStream::connect(path).await?, &request).await
                }
                #[cfg(not(unix))]
                BackendAddr::Unix(_) => Err(TransportError::Unsupported),
            }
        })
    }
}

async fn exchange<S>(mut stream: S, request: &BackendRequest) -> Result<BackendResponse, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&request.to_bytes()).await?;
    stream.flush().await?;

    let mut decoder = ResponseDecoder::new(request.method() != &Method::Head);
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);
    loop {
        let eof = stream.read_buf(&mut buf).await? == 0;
        if buf.len() > MAX_RESPONSE_SIZE {
            return Err(TransportError::TooLarge {
                max_bytes: MAX_RESPONSE_SIZE,
            });
        }
        match decoder.decode(&buf, eof)? {
            Some(response) => return Ok(response),
            None if eof => return Err(TransportError::UnexpectedEof),
            None => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(raw: &str) -> Request {
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        req
    }

    #[test]
    fn forward_derives_identity_headers() {
        let req = inbound(
            "POST /api/v2/login?uuid=cp-9 HTTP/1.1\r\nHost: portal.local\r\n\
Authorization: s3ss10n\r\nX-Trace: abc\r\nContent-Length: 2\r\n\r\nhi",
        )
        .with_remote_addr("10.0.0.7:41000");

        let fwd = BackendRequest::forward(&req, "X-SVC-AUTH");

        assert_eq!(fwd.method(), &Method::Post);
        assert_eq!(fwd.target(), "/api/v2/login?uuid=cp-9");
        assert_eq!(fwd.body().as_ref(), b"hi");
        assert_eq!(fwd.headers().get("host"), Some("portal.local"));
        assert_eq!(fwd.headers().get("x-forwarded-for"), Some("10.0.0.7:41000"));
        assert_eq!(
            fwd.headers().get("authorization"),
            Some("X-SVC-AUTH sessionid=s3ss10n")
        );
        assert_eq!(fwd.headers().get("x-trace"), Some("abc"));
        assert!(!fwd.headers().contains("content-length"));
    }

    #[test]
    fn forward_without_host_or_peer() {
        let req = inbound("GET /x HTTP/1.1\r\n\r\n");
        let fwd = BackendRequest::forward(&req, "AUTH");
        assert_eq!(fwd.headers().get("host"), Some("localhost"));
        assert!(!fwd.headers().contains("x-forwarded-for"));
        assert_eq!(fwd.headers().get("authorization"), Some("AUTH sessionid="));
    }

    #[test]
    fn serialised_request_is_framed() {
        let req = inbound("PUT /a HTTP/1.1\r\nHost: h\r\nContent-Length: 3\r\n\r\nabc");
        let wire = BackendRequest::forward(&req, "A").to_bytes();
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.starts_with("PUT /a HTTP/1.1\r\nHost: h\r\n"));
        assert!(text.contains("Content-Length: 3\r\nConnection: close\r\n\r\nabc"));
    }

    #[test]
    fn parse_content_length_response() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let resp = BackendResponse::parse(raw, false, true).unwrap().unwrap();
        assert!(resp.is_ok());
        assert_eq!(resp.body().as_ref(), b"hello");

        let partial = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhel";
        assert!(BackendResponse::parse(partial, false, true).unwrap().is_none());
    }

    #[test]
    fn parse_chunked_response() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\n\r\n";
        let resp = BackendResponse::parse(raw, false, true).unwrap().unwrap();
        assert_eq!(resp.body().as_ref(), b"Wikipedia");

        let partial = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWi";
        assert!(BackendResponse::parse(partial, false, true).unwrap().is_none());

        let bad = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
        assert!(matches!(
            BackendResponse::parse(bad, false, true),
            Err(TransportError::InvalidChunk)
        ));

        let huge = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nabc";
        assert!(matches!(
            BackendResponse::parse(huge, false, true),
            Err(TransportError::InvalidChunk)
        ));
    }

    #[test]
    fn chunked_body_is_decoded_as_it_arrives() {
        let mut raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        let mut expected = Vec::new();
        for i in 0..50u8 {
            let chunk = vec![b'a' + i % 26; 100 + usize::from(i)];
            raw.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            raw.extend_from_slice(&chunk);
            raw.extend_from_slice(b"\r\n");
            expected.extend_from_slice(&chunk);
        }
        raw.extend_from_slice(b"0\r\nX-Trailer: 1\r\n\r\n");

        let mut decoder = ResponseDecoder::new(true);
        let mut seen = 0;
        let mut decoded_so_far = 0;
        let response = loop {
            seen = (seen + 7).min(raw.len());
            if let Some(response) = decoder.decode(&raw[..seen], false).unwrap() {
                break response;
            }
            assert!(seen < raw.len(), "complete body was not recognised");
            if let Some(Framing::Chunked(chunks)) = decoder.head.as_ref().map(|h| &h.framing) {
                assert!(chunks.body.len() >= decoded_so_far);
                decoded_so_far = chunks.body.len();
            }
        };
        assert!(decoded_so_far > 0);
        assert_eq!(response.body().as_ref(), expected.as_slice());
    }

    #[test]
    fn parse_read_to_eof_response() {
        let raw = b"HTTP/1.1 500 Internal Server Error\r\n\r\noops";
        assert!(BackendResponse::parse(raw, false, true).unwrap().is_none());
        let resp = BackendResponse::parse(raw, true, true).unwrap().unwrap();
        assert_eq!(resp.status(), 500);
        assert!(!resp.is_ok());
        assert_eq!(resp.body().as_ref(), b"oops");
    }

    #[test]
    fn head_and_no_content_have_no_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n";
        let resp = BackendResponse::parse(raw, false, false).unwrap().unwrap();
        assert!(resp.body().is_empty());

        let raw = b"HTTP/1.1 204 No Content\r\n\r\n";
        let resp = BackendResponse::parse(raw, false, true).unwrap().unwrap();
        assert_eq!(resp.status(), 204);
    }

    #[tokio::test]
    async fn round_trip_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let backend = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();
            loop {
                sock.read_buf(&mut buf).await.unwrap();
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            sock.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            String::from_utf8(buf.to_vec()).unwrap()
        });

        let transport = HttpTransport::new(BackendAddr::Tcp(addr.to_string()));
        let req = inbound("GET /ping?uuid=k HTTP/1.1\r\nHost: front\r\n\r\n");
        let resp = transport
            .round_trip(BackendRequest::forward(&req, "AUTH"))
            .await
            .unwrap();
        assert_eq!(resp.body().as_ref(), b"ok");

        let seen = backend.await.unwrap();
        assert!(seen.starts_with("GET /ping?uuid=k HTTP/1.1\r\n"));
        assert!(seen.contains("Authorization: AUTH sessionid=\r\n"));
    }

    #[tokio::test]
    async fn chunked_response_survives_small_reads() {
        let (client, mut backend) = tokio::io::duplex(16);

        let server = tokio::spawn(async move {
            let mut buf = BytesMut::new();
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                backend.read_buf(&mut buf).await.unwrap();
            }
            let mut raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
            for word in ["alpha", "beta", "gamma", "delta"] {
                raw.extend_from_slice(format!("{:x}\r\n{word}\r\n", word.len()).as_bytes());
            }
            raw.extend_from_slice(b"0\r\n\r\n");
            backend.write_all(&raw).await.unwrap();
        });

        let req = inbound("GET /words?uuid=k HTTP/1.1\r\nHost: front\r\n\r\n");
        let resp = exchange(client, &BackendRequest::forward(&req, "AUTH"))
            .await
            .unwrap();
        assert_eq!(resp.body().as_ref(), b"alphabetagammadelta");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(BackendAddr::Tcp(addr.to_string()));
        let req = inbound("GET / HTTP/1.1\r\n\r\n");
        let err = transport
            .round_trip(BackendRequest::forward(&req, "AUTH"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Io(_)));
    }
}
