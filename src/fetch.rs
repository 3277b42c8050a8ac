//! Request/response model and the network seam.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};

use crate::error::{Error, Result};

/// What the page intends to do with a response, as reported by `Sec-Fetch-Dest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
    /// Top-level navigation.
    Document,
    /// `<audio>` element.
    Audio,
    /// `<video>` element.
    Video,
    /// Anything else (scripts, images, `fetch()`, ...).
    #[default]
    Other,
}

impl Destination {
    /// Maps a `Sec-Fetch-Dest` header value onto a destination.
    #[must_use]
    pub fn from_fetch_dest(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "document" => Self::Document,
            "audio" => Self::Audio,
            "video" => Self::Video,
            _ => Self::Other,
        }
    }

    /// Returns true for audio and video destinations.
    #[must_use]
    pub const fn is_media(self) -> bool {
        matches!(self, Self::Audio | Self::Video)
    }
}

/// An intercepted resource request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute request URL.
    pub url: Url,
    /// Request headers (only `Range` and cache directives matter to the worker).
    pub headers: HeaderMap,
    /// Declared destination.
    pub destination: Destination,
}

impl FetchRequest {
    /// Creates a GET request for `url`.
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            destination: Destination::Other,
        }
    }

    /// Sets the destination.
    #[must_use]
    pub const fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    /// Sets the HTTP method.
    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Adds a header; invalid values are ignored.
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Adds a `Range` header.
    #[must_use]
    pub fn with_range(self, range: &str) -> Self {
        self.with_header(header::RANGE, range)
    }

    /// Marks the request to bypass any intermediate HTTP caches.
    #[must_use]
    pub fn no_cache(self) -> Self {
        self.with_header(header::CACHE_CONTROL, "no-cache")
            .with_header(header::PRAGMA, "no-cache")
    }

    /// Returns the raw `Range` header, if present.
    #[must_use]
    pub fn range(&self) -> Option<&str> {
        self.headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
    }

    /// Returns true for top-level document requests.
    #[must_use]
    pub fn is_navigation(&self) -> bool {
        self.destination == Destination::Document
    }
}

/// Whether a response body and status are readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseKind {
    /// Same-origin or CORS response.
    #[default]
    Basic,
    /// Cross-origin `no-cors` response.
    Opaque,
}

/// A response produced by the network, the cache or the range slicer.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// HTTP status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Full response body.
    pub body: Bytes,
    /// Response kind.
    pub kind: ResponseKind,
}

impl FetchResponse {
    /// Creates a basic response with the given status and body.
    #[must_use]
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            kind: ResponseKind::Basic,
        }
    }

    /// Creates a 200 response with a `Content-Type`.
    #[must_use]
    pub fn ok(body: impl Into<Bytes>, content_type: &str) -> Self {
        Self::new(StatusCode::OK, body).with_header(header::CONTENT_TYPE, content_type)
    }

    /// Adds a header; invalid values are ignored.
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Sets the response kind.
    #[must_use]
    pub const fn with_kind(mut self, kind: ResponseKind) -> Self {
        self.kind = kind;
        self
    }

    /// Returns a header value as a string, if present and valid UTF-8.
    #[must_use]
    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns true for opaque responses.
    #[must_use]
    pub fn is_opaque(&self) -> bool {
        self.kind == ResponseKind::Opaque
    }
}

/// Abstraction over the network for testability.
#[async_trait]
pub trait Network: Send + Sync {
    /// Performs the request. Transport failures are [`Error::Network`];
    /// any HTTP status, including errors, is a successful fetch.
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse>;
}

/// Builds a configured HTTP client for origin requests.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialised.
pub fn build_http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(15))
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(8)
        .tcp_keepalive(Duration::from_secs(30))
        .build()
}

/// Network implementation backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    client: reqwest::Client,
}

impl HttpNetwork {
    /// Wraps an existing client.
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Creates a network with the default client settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be built.
    pub fn with_defaults() -> Result<Self> {
        Ok(Self::new(build_http_client()?))
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        let response = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .send()
            .await
            .map_err(|e| Error::Network(format!("{}: {e}", request.url)))?;

        let status = response.status();
        // The body is buffered whole, so framing headers no longer apply.
        let mut headers = response.headers().clone();
        headers.remove(header::TRANSFER_ENCODING);
        headers.remove(header::CONNECTION);
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Network(format!("{}: {e}", request.url)))?;

        Ok(FetchResponse {
            status,
            headers,
            body,
            kind: ResponseKind::Basic,
        })
    }
}
