//! # Slipstream Fetch
//!
//! Request/response model and network clients for the Slipstream offline
//! delivery layer.
//!
//! ## Features
//!
//! - **Request model**: method, headers, credentials, one-shot bodies
//! - **Body materialization**: streamed bodies are buffered exactly once
//! - **NetworkClient**: object-safe async seam over the transport
//! - **HttpClient**: reqwest-backed implementation
//! - **MemoryNetwork**: programmable in-memory transport with an offline
//!   toggle, used by every test that needs a network

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use url::Url;

// ==================== Errors ====================

/// Errors that can occur while issuing a request.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unreachable")]
    Offline,

    #[error("Body stream aborted: {0}")]
    BodyAborted(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

// ==================== Types ====================

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

/// Credentials mode for requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialsMode {
    /// Never send cookies.
    Omit,
    /// Send cookies only for same-origin requests.
    #[default]
    SameOrigin,
    /// Always send cookies.
    Include,
}

/// Request mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    #[default]
    Cors,
    NoCors,
    SameOrigin,
    Navigate,
}

// ==================== Request body ====================

/// A request body that can be read at most once.
///
/// A streamed body cannot be replayed, so callers that need the bytes more
/// than once (queueing, retries) must materialize it first.
#[derive(Debug, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// Full body already buffered.
    Buffered(Bytes),
    /// Live stream of chunks; consumed by materialization.
    Stream(mpsc::Receiver<Result<Bytes, FetchError>>),
}

impl RequestBody {
    /// Drain this body into an immutable buffer.
    pub async fn materialize(self) -> Result<Bytes, FetchError> {
        match self {
            RequestBody::Empty => Ok(Bytes::new()),
            RequestBody::Buffered(b) => Ok(b),
            RequestBody::Stream(mut rx) => {
                let mut chunks = Vec::new();
                while let Some(chunk) = rx.recv().await {
                    chunks.push(chunk?);
                }
                Ok(chunks.into_iter().flatten().collect())
            }
        }
    }

    /// Whether this body is a live stream.
    pub fn is_stream(&self) -> bool {
        matches!(self, RequestBody::Stream(_))
    }
}

// ==================== Request ====================

/// An intercepted or outgoing HTTP request.
#[derive(Debug)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: RequestBody,
    pub credentials: CredentialsMode,
    pub mode: RequestMode,
    /// Marked by the embedder when a non-mutating request should still be
    /// queued for replay instead of failing while offline.
    pub retry_eligible: bool,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            credentials: CredentialsMode::SameOrigin,
            mode: RequestMode::Cors,
            retry_eligible: false,
        }
    }

    /// Create a POST request with a buffered body.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::POST,
            headers: HeaderMap::new(),
            body: RequestBody::Buffered(body),
            credentials: CredentialsMode::SameOrigin,
            mode: RequestMode::Cors,
            retry_eligible: false,
        }
    }

    /// Create a request with an explicit method and streamed body.
    pub fn streaming(
        url: Url,
        method: Method,
        rx: mpsc::Receiver<Result<Bytes, FetchError>>,
    ) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method,
            headers: HeaderMap::new(),
            body: RequestBody::Stream(rx),
            credentials: CredentialsMode::SameOrigin,
            mode: RequestMode::Cors,
            retry_eligible: false,
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the credentials mode.
    pub fn credentials(mut self, credentials: CredentialsMode) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set the request mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Mark this request as retry-eligible.
    pub fn retry_eligible(mut self, eligible: bool) -> Self {
        self.retry_eligible = eligible;
        self
    }

    /// Whether the method mutates server state.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self.method,
            Method::POST | Method::PUT | Method::DELETE | Method::PATCH
        )
    }

    /// Replace a streamed body with its buffered contents.
    ///
    /// The stream is fully drained before this returns; the request never
    /// holds a live stream handle across a later suspension point.
    pub async fn materialize_body(&mut self) -> Result<&Bytes, FetchError> {
        let body = std::mem::take(&mut self.body);
        let bytes = body.materialize().await?;
        self.body = RequestBody::Buffered(bytes);
        match &self.body {
            RequestBody::Buffered(b) => Ok(b),
            _ => unreachable!("body was just buffered"),
        }
    }

    /// Clone this request if its body is not a live stream.
    pub fn try_clone(&self) -> Option<Self> {
        let body = match &self.body {
            RequestBody::Empty => RequestBody::Empty,
            RequestBody::Buffered(b) => RequestBody::Buffered(b.clone()),
            RequestBody::Stream(_) => return None,
        };
        Some(Self {
            id: self.id,
            url: self.url.clone(),
            method: self.method.clone(),
            headers: self.headers.clone(),
            body,
            credentials: self.credentials,
            mode: self.mode,
            retry_eligible: self.retry_eligible,
        })
    }
}

// ==================== Response ====================

/// A fetched response with a fully buffered body.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    /// Final URL (after redirects).
    pub url: String,
    /// Status code; 0 marks an opaque null response.
    pub status: u16,
    /// Response headers as a plain mapping.
    pub headers: HashMap<String, String>,
    /// Response body.
    pub body: Bytes,
    /// Whether the response resulted from a redirect.
    pub redirected: bool,
}

impl FetchedResponse {
    /// Create a response with the given status and empty body.
    pub fn new(url: impl Into<String>, status: u16) -> Self {
        Self {
            url: url.into(),
            status,
            headers: HashMap::new(),
            body: Bytes::new(),
            redirected: false,
        }
    }

    /// Create an opaque null response (resolved, but carrying nothing).
    pub fn network_error() -> Self {
        Self {
            url: String::new(),
            status: 0,
            headers: HashMap::new(),
            body: Bytes::new(),
            redirected: false,
        }
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Set a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Mark the response as redirected.
    pub fn with_redirected(mut self, redirected: bool) -> Self {
        self.redirected = redirected;
        self
    }

    /// Check if the response is a success (2xx).
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Check if this is an opaque null response rather than a real answer.
    pub fn is_null(&self) -> bool {
        self.status == 0
    }

    /// Get a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|s| s.as_str())
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body.to_vec())
    }
}

// ==================== NetworkClient ====================

/// Object-safe async seam over the transport.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Issue the request and buffer the full response.
    async fn fetch(&self, request: Request) -> Result<FetchedResponse, FetchError>;
}

// ==================== HttpClient ====================

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// User agent string.
    pub user_agent: String,
    /// Default request timeout.
    pub timeout: Duration,
    /// Maximum number of redirects to follow.
    pub max_redirects: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("Slipstream/{}", env!("CARGO_PKG_VERSION")),
            timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// reqwest-backed network client.
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    /// Create a client with default configuration.
    pub fn new() -> Result<Self, FetchError> {
        Self::with_config(HttpConfig::default())
    }

    /// Create a client with custom configuration.
    pub fn with_config(config: HttpConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| FetchError::RequestFailed(e.to_string()))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl NetworkClient for HttpClient {
    async fn fetch(&self, mut request: Request) -> Result<FetchedResponse, FetchError> {
        debug!(url = %request.url, method = %request.method, "issuing network request");

        let body = request.materialize_body().await?.clone();

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }

        if !body.is_empty() {
            builder = builder.body(body);
        }

        let response = builder.send().await?;

        let status = response.status().as_u16();
        let final_url = response.url().clone();
        let redirected = final_url != request.url;

        let mut headers = HashMap::new();
        for (name, value) in response.headers().iter() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_string(), v.to_string());
            }
        }

        let body = response.bytes().await?;

        trace!(
            url = %final_url,
            status,
            redirected,
            body_len = body.len(),
            "network response received"
        );

        Ok(FetchedResponse {
            url: final_url.to_string(),
            status,
            headers,
            body,
            redirected,
        })
    }
}

// ==================== MemoryNetwork ====================

/// A request observed by [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

/// Programmable in-memory transport.
///
/// Routes are keyed by method and URL; unknown routes answer 404. The
/// offline toggle makes every fetch fail the way an unreachable network
/// would.
#[derive(Default)]
pub struct MemoryNetwork {
    routes: RwLock<HashMap<String, FetchedResponse>>,
    offline: AtomicBool,
    recorded: Mutex<Vec<RecordedRequest>>,
}

fn route_key(method: &Method, url: &str) -> String {
    format!("{} {}", method, url)
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Program a response for a method + URL pair.
    pub fn insert(&self, method: Method, url: &str, response: FetchedResponse) {
        self.routes
            .write()
            .expect("route table poisoned")
            .insert(route_key(&method, url), response);
    }

    /// Program a GET route.
    pub fn route(&self, url: &str, response: FetchedResponse) {
        self.insert(Method::GET, url, response);
    }

    /// Remove a programmed GET route.
    pub fn remove_route(&self, url: &str) {
        self.routes
            .write()
            .expect("route table poisoned")
            .remove(&route_key(&Method::GET, url));
    }

    /// Toggle network reachability.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// All requests seen so far, in arrival order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.recorded.lock().expect("request log poisoned").clone()
    }
}

#[async_trait]
impl NetworkClient for MemoryNetwork {
    async fn fetch(&self, mut request: Request) -> Result<FetchedResponse, FetchError> {
        let body = request.materialize_body().await?.clone();

        let mut headers = HashMap::new();
        for (name, value) in request.headers.iter() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_string(), v.to_string());
            }
        }

        self.recorded
            .lock()
            .expect("request log poisoned")
            .push(RecordedRequest {
                url: request.url.to_string(),
                method: request.method.to_string(),
                headers,
                body,
            });

        if self.is_offline() {
            warn!(url = %request.url, "memory network is offline");
            return Err(FetchError::Offline);
        }

        let key = route_key(&request.method, request.url.as_str());
        let routes = self.routes.read().expect("route table poisoned");
        match routes.get(&key) {
            Some(response) => Ok(response.clone()),
            None => Ok(FetchedResponse::new(request.url.to_string(), 404)),
        }
    }
}
