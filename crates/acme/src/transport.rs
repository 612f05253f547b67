//! Pluggable HTTP transport
//!
//! Every request the ACME engine (and the relay client) makes goes through a
//! [`TransportHandle`]. The handle owns the active [`HttpTransport`] and lets a
//! [`CaptureSession`] temporarily put a [`CaptureTransport`] in front of it.
//! `instant-acme` reaches the handle through [`AcmeHttpClient`].
//!
//! # Capture
//!
//! While a session is active, a request whose URL is *exactly* the session's
//! target URL is never transmitted. It is returned, complete, inside
//! [`TransportError::Captured`]. All other requests pass through to the
//! previous transport unchanged. Dropping the session restores the previous
//! transport, including when the future driving it is cancelled.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use instant_acme::{BytesResponse, HttpClient};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::errors::{CaptureError, TransportError};

/// Media type of every signed ACME request
pub const JOSE_CONTENT_TYPE: &str = "application/jose+json";

/// An outgoing HTTP request
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A request intercepted by a capture session
pub type CapturedRequest = TransportRequest;

impl TransportRequest {
    /// Request with an empty body
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// POST with the given body and content type
    pub fn post(url: impl Into<String>, content_type: &'static str, body: impl Into<Bytes>) -> Self {
        let mut request = Self::new(Method::POST, url);
        request
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        request.body = body.into();
        request
    }

    /// Set a header, replacing any previous value
    pub fn with_header(mut self, name: http::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// The `Content-Type` header, if present and valid UTF-8
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }
}

/// A received HTTP response, fully buffered
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    /// Header value as a string, if present and valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// `Retry-After` given in seconds
    pub fn retry_after(&self) -> Option<Duration> {
        self.header(RETRY_AFTER.as_str())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

/// Sends HTTP requests
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send a request and buffer the response
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// Production transport backed by `reqwest`
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Create a transport with a per-request timeout and user agent
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }

    /// Wrap an existing client
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        trace!(method = %request.method, url = %request.url, "Sending HTTP request");

        let response = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}

/// Transport decorator that captures requests to one URL
pub struct CaptureTransport {
    inner: Arc<dyn HttpTransport>,
    target_url: String,
}

impl CaptureTransport {
    /// Capture requests to `target_url`, forwarding everything else to `inner`
    pub fn new(inner: Arc<dyn HttpTransport>, target_url: impl Into<String>) -> Self {
        Self {
            inner,
            target_url: target_url.into(),
        }
    }

    /// URL being captured
    pub fn target_url(&self) -> &str {
        &self.target_url
    }
}

#[async_trait]
impl HttpTransport for CaptureTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        if request.url != self.target_url {
            debug!(
                url = %request.url,
                target = %self.target_url,
                "Skipping capture"
            );
            return self.inner.send(request).await;
        }

        debug!(method = %request.method, url = %request.url, "Captured request");
        Err(TransportError::Captured(Box::new(request)))
    }
}

struct HandleState {
    active: RwLock<Arc<dyn HttpTransport>>,
    capturing: AtomicBool,
}

/// Shared, swappable reference to the active transport
///
/// Clones share the same active transport. Capture sessions are not safe to
/// run concurrently on one handle; each handle belongs to one in-flight
/// operation at a time.
#[derive(Clone)]
pub struct TransportHandle {
    state: Arc<HandleState>,
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("capturing", &self.is_capturing())
            .finish()
    }
}

impl TransportHandle {
    /// Create a handle around `transport`
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            state: Arc::new(HandleState {
                active: RwLock::new(transport),
                capturing: AtomicBool::new(false),
            }),
        }
    }

    /// Handle around the production `reqwest` transport
    pub fn reqwest(timeout: Duration, user_agent: &str) -> Result<Self, TransportError> {
        Ok(Self::new(Arc::new(ReqwestTransport::new(timeout, user_agent)?)))
    }

    /// The currently active transport
    pub fn current(&self) -> Arc<dyn HttpTransport> {
        self.state.active.read().clone()
    }

    /// Whether a capture session is active
    pub fn is_capturing(&self) -> bool {
        self.state.capturing.load(Ordering::Acquire)
    }

    /// Send a request through the currently active transport
    pub async fn send(
        &self,
        mut request: TransportRequest,
        user_agent: &str,
    ) -> Result<TransportResponse, TransportError> {
        if !request.headers.contains_key(USER_AGENT) {
            if let Ok(value) = HeaderValue::from_str(user_agent) {
                request.headers.insert(USER_AGENT, value);
            }
        }
        let transport = self.current();
        transport.send(request).await
    }

    /// Start capturing requests to `target_url`
    ///
    /// The returned session restores the previous transport when ended or
    /// dropped.
    pub fn begin_capture(
        &self,
        target_url: impl Into<String>,
    ) -> Result<CaptureSession, CaptureError> {
        if self
            .state
            .capturing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::SessionActive);
        }

        let target_url = target_url.into();
        let mut active = self.state.active.write();
        let previous: Arc<dyn HttpTransport> = active.clone();
        *active = Arc::new(CaptureTransport::new(
            Arc::clone(&previous),
            target_url.clone(),
        ));
        drop(active);

        trace!(target = %target_url, "Capture session started");

        Ok(CaptureSession {
            handle: self.clone(),
            target_url,
            previous: Some(previous),
        })
    }
}

/// Scoped capture of one URL on a [`TransportHandle`]
///
/// Single use. The previous transport is restored on [`CaptureSession::end`]
/// or on drop, whichever comes first.
pub struct CaptureSession {
    handle: TransportHandle,
    target_url: String,
    previous: Option<Arc<dyn HttpTransport>>,
}

impl CaptureSession {
    /// URL being captured
    pub fn target_url(&self) -> &str {
        &self.target_url
    }

    /// End the session, restoring the previous transport
    pub fn end(mut self) {
        self.restore();
    }

    fn restore(&mut self) {
        if let Some(previous) = self.previous.take() {
            *self.handle.state.active.write() = previous;
            self.handle.state.capturing.store(false, Ordering::Release);
            trace!(target = %self.target_url, "Capture session ended");
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.restore();
    }
}

impl std::fmt::Debug for CaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSession")
            .field("target_url", &self.target_url)
            .field("active", &self.previous.is_some())
            .finish()
    }
}

/// [`TransportHandle`] as the HTTP client of an `instant-acme` account
///
/// Requests are sent through whatever transport is active on the handle, so
/// a capture session sees them like any other. A captured request surfaces
/// from `instant-acme` as `Error::Other` wrapping the [`TransportError`].
///
/// `instant-acme` does not expose response headers, so the `Retry-After` of
/// the latest response is kept for the engine's order polling.
#[derive(Clone)]
pub struct AcmeHttpClient {
    handle: TransportHandle,
    user_agent: String,
    retry_after: Arc<Mutex<Option<Duration>>>,
}

impl AcmeHttpClient {
    pub fn new(handle: TransportHandle, user_agent: impl Into<String>) -> Self {
        Self {
            handle,
            user_agent: user_agent.into(),
            retry_after: Arc::new(Mutex::new(None)),
        }
    }

    /// Take the `Retry-After` of the latest response, if it had one
    pub fn take_retry_after(&self) -> Option<Duration> {
        self.retry_after.lock().take()
    }

    async fn send(self, request: http::Request<Full<Bytes>>) -> Result<BytesResponse, instant_acme::Error> {
        let (parts, body) = request.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(never) => match never {},
        };

        let request = TransportRequest {
            method: parts.method,
            url: parts.uri.to_string(),
            headers: parts.headers,
            body,
        };
        let response = self
            .handle
            .send(request, &self.user_agent)
            .await
            .map_err(|e| instant_acme::Error::Other(Box::new(e)))?;

        *self.retry_after.lock() = response.retry_after();

        let mut reply = http::Response::new(Full::new(response.body));
        *reply.status_mut() = response.status;
        *reply.headers_mut() = response.headers;
        Ok(BytesResponse::from(reply))
    }
}

impl HttpClient for AcmeHttpClient {
    fn request(
        &self,
        req: http::Request<Full<Bytes>>,
    ) -> Pin<Box<dyn Future<Output = Result<BytesResponse, instant_acme::Error>> + Send>> {
        Box::pin(self.clone().send(req))
    }
}

impl std::fmt::Debug for AcmeHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeHttpClient")
            .field("handle", &self.handle)
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}
