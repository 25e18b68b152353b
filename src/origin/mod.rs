//! Origin providers: where tile bytes come from.
//!
//! The core treats an origin as an opaque capability. Given a tile address it
//! hands out a connection that can execute a request and return a fully read
//! response. URL construction and projection math stay behind this trait.
//!
//! ```text
//! ┌────────────────┐  open_connection(addr)  ┌──────────────────┐
//! │ TileDownloader │ ──────────────────────▶ │  OriginProvider  │
//! │                │ ◀── OriginConnection ── │ (HTTP / archive) │
//! └────────────────┘                         └──────────────────┘
//! ```
//!
//! # Implementations
//!
//! - [`HttpOrigin`]: remote tile server addressed by a `{z}/{x}/{y}` URL template
//! - [`LocalArchiveOrigin`]: directory tree of `{z}/{x}/{y}.{ext}` image files

mod remote;
mod local;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, LAST_MODIFIED};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};

use crate::error::DownloadError;
use crate::tile::TileAddress;

pub use remote::HttpOrigin;
pub use local::LocalArchiveOrigin;

/// Default connect timeout for origin requests.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default read timeout for origin requests.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Update Strategy
// =============================================================================

/// How an origin lets us check whether an expired tile changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateStrategy {
    /// No validators; expired tiles are always re-fetched
    #[default]
    None,
    /// HEAD request, compare the ETag with the stored one
    ETag,
    /// HEAD request, compare Last-Modified with the stored timestamp
    LastModified,
    /// Conditional GET carrying `If-None-Match`
    IfNoneMatch,
    /// Conditional GET carrying `If-Modified-Since`
    IfModifiedSince,
}

impl UpdateStrategy {
    pub const fn name(&self) -> &'static str {
        match self {
            UpdateStrategy::None => "none",
            UpdateStrategy::ETag => "etag",
            UpdateStrategy::LastModified => "last-modified",
            UpdateStrategy::IfNoneMatch => "if-none-match",
            UpdateStrategy::IfModifiedSince => "if-modified-since",
        }
    }
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for UpdateStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(UpdateStrategy::None),
            "etag" => Ok(UpdateStrategy::ETag),
            "last-modified" | "lastmodified" => Ok(UpdateStrategy::LastModified),
            "if-none-match" | "ifnonematch" => Ok(UpdateStrategy::IfNoneMatch),
            "if-modified-since" | "ifmodifiedsince" => Ok(UpdateStrategy::IfModifiedSince),
            other => Err(format!("unknown update strategy: {}", other)),
        }
    }
}

// =============================================================================
// Request / Response
// =============================================================================

/// A request about to be executed against an origin connection.
#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl OriginRequest {
    pub fn get() -> Self {
        Self::with_method(Method::GET)
    }

    pub fn head() -> Self {
        Self::with_method(Method::HEAD)
    }

    fn with_method(method: Method) -> Self {
        Self {
            method,
            headers: HeaderMap::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Set a header, silently skipping values that are not valid header text.
    pub fn set_header(&mut self, name: HeaderName, value: &str) {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
    }

    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }
}

/// A fully read origin response.
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OriginResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(&CONTENT_TYPE)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header(&CONTENT_LENGTH)
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn etag(&self) -> Option<&str> {
        self.header(&ETAG)
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.header(&LAST_MODIFIED).and_then(parse_http_date)
    }
}

// =============================================================================
// Provider Traits
// =============================================================================

/// An open connection to an origin for one tile.
pub trait OriginConnection: Send {
    /// Execute the request and read the whole response body.
    ///
    /// Connection failures and timeouts must be reported as
    /// [`DownloadError::Transient`]. Non-success statuses are returned as
    /// responses, not errors.
    fn execute(&mut self, request: &OriginRequest) -> Result<OriginResponse, DownloadError>;
}

/// A named source of tiles with its own store namespace.
pub trait OriginProvider: Send + Sync {
    /// Origin name, also used as the persistent store namespace.
    fn name(&self) -> &str;

    /// Strategy used to revalidate expired tiles.
    fn update_strategy(&self) -> UpdateStrategy {
        UpdateStrategy::None
    }

    /// Open a connection for `address`, or `None` if the origin has no source for it.
    fn open_connection(
        &self,
        address: TileAddress,
    ) -> Result<Option<Box<dyn OriginConnection>>, DownloadError>;

    /// Hook to adjust headers or timeouts before a request is executed.
    fn prepare_request(&self, _request: &mut OriginRequest) {}
}

// =============================================================================
// HTTP Dates
// =============================================================================

/// Parse an RFC 7231 HTTP date (`Sun, 06 Nov 1994 08:49:37 GMT`).
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Format a timestamp as an HTTP date.
pub fn format_http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
