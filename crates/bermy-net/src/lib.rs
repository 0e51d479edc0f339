//! # Bermy Net
//!
//! HTTP fetching for the Bermy offline agent.
//!
//! ## Design Goals
//!
//! 1. **Async HTTP**: Non-blocking network requests behind the [`Fetcher`] trait
//! 2. **Streaming bodies**: Response bodies are single-consumption streams
//! 3. **Duplication**: [`Response::duplicate`] yields two independent readers
//! 4. **Origins**: Same-origin checks for the request interceptor

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::StreamExt;
use http::header::ACCEPT_LANGUAGE;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::Client;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use url::Url;

pub mod memory;
pub mod origin;

pub use memory::StaticFetcher;
pub use origin::Origin;

/// Chunks buffered between the socket reader task and the body consumer.
const BODY_CHANNEL_CAPACITY: usize = 16;

/// Transport-level networking errors.
///
/// HTTP error statuses are not errors here: a 404 or 503 is a successful
/// fetch that produced a [`Response`].
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unavailable: {0}")]
    Offline(String),

    #[error("Body stream interrupted: {0}")]
    BodyInterrupted(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP request issued by a page.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a request with the given method.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Parse a URL and create a GET request for it.
    pub fn parse_get(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(format!("{}: {}", url, e)))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Attach a body.
    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Origin of the request URL.
    pub fn origin(&self) -> Origin {
        Origin::from_url(&self.url)
    }
}

/// HTTP response.
#[derive(Debug)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: ResponseBody,
}

/// Response body variants.
#[derive(Debug)]
enum ResponseBody {
    /// Full body already loaded.
    Full(Bytes),
    /// Streaming body, readable once.
    Stream(mpsc::Receiver<Result<Bytes, NetError>>),
    /// Empty.
    Empty,
}

impl Response {
    /// Create a response with a fully loaded body.
    pub fn new(url: Url, status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        let body = if body.is_empty() {
            ResponseBody::Empty
        } else {
            ResponseBody::Full(body)
        };
        Self {
            url,
            status,
            headers,
            body,
        }
    }

    /// Create a response whose body arrives on a channel.
    pub fn streaming(
        url: Url,
        status: StatusCode,
        headers: HeaderMap,
        chunks: mpsc::Receiver<Result<Bytes, NetError>>,
    ) -> Self {
        Self {
            url,
            status,
            headers,
            body: ResponseBody::Stream(chunks),
        }
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Whether the body is still an unread stream.
    pub fn is_streaming(&self) -> bool {
        matches!(self.body, ResponseBody::Stream(_))
    }

    /// Reason phrase for the status code.
    pub fn status_text(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or("")
    }

    /// Get the body as bytes.
    pub async fn bytes(self) -> Result<Bytes, NetError> {
        read_body(self.body).await
    }

    /// Get the body as text.
    pub async fn text(self) -> Result<String, NetError> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Split this response into two independent readable responses.
    ///
    /// A streaming body is drained once into memory; both copies then hold the
    /// same bytes and can be consumed separately.
    pub async fn duplicate(self) -> Result<(Response, Response), NetError> {
        let Response {
            url,
            status,
            headers,
            body,
        } = self;
        let bytes = read_body(body).await?;
        trace!(url = %url, body_len = bytes.len(), "Response duplicated");

        let copy = Response::new(url.clone(), status, headers.clone(), bytes.clone());
        Ok((Response::new(url, status, headers, bytes), copy))
    }
}

async fn read_body(body: ResponseBody) -> Result<Bytes, NetError> {
    match body {
        ResponseBody::Full(b) => Ok(b),
        ResponseBody::Stream(mut rx) => {
            let mut buf = BytesMut::new();
            while let Some(chunk) = rx.recv().await {
                buf.extend_from_slice(&chunk?);
            }
            Ok(buf.freeze())
        }
        ResponseBody::Empty => Ok(Bytes::new()),
    }
}

/// Anything that can perform a network fetch.
///
/// Only transport failures are errors; every HTTP status is a response.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>>;
}

/// HTTP fetcher configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Default timeout. `None` leaves timing out to the network stack.
    pub default_timeout: Option<Duration>,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("bermy-offline/{}", env!("CARGO_PKG_VERSION")),
            accept_language: "en-US,en;q=0.9".to_string(),
            default_timeout: None,
            max_redirects: 10,
        }
    }
}

/// Fetcher backed by a real HTTP client.
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
}

impl HttpFetcher {
    /// Create a new HTTP fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let mut builder = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects));
        if let Some(timeout) = config.default_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpFetcher initialized");

        Ok(Self { client, config })
    }

    async fn execute(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        if !request.headers.contains_key(ACCEPT_LANGUAGE) {
            req_builder = req_builder.header(ACCEPT_LANGUAGE, &self.config.accept_language);
        }

        if let Some(body) = request.body {
            req_builder = req_builder.body(body);
        }

        if let Some(timeout) = request.timeout {
            req_builder = req_builder.timeout(timeout);
        }

        let response = req_builder.send().await.map_err(|e| {
            warn!(url = %request.url, error = %e, "Transport failure");
            match (e.is_timeout(), request.timeout.or(self.config.default_timeout)) {
                (true, Some(timeout)) => NetError::Timeout(timeout),
                _ => NetError::HttpError(e),
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();

        trace!(url = %url, status = %status, "Response headers received");

        let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let mut stream = response.bytes_stream();
        tokio::spawn(async move {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| NetError::BodyInterrupted(e.to_string()));
                let failed = chunk.is_err();
                if tx.send(chunk).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(Response::streaming(url, status, headers, rx))
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
        Box::pin(self.execute(request))
    }
}
