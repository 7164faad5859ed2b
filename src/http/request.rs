//! Request descriptors, acceptance policy and response metadata

use crate::config::TransferConfig;
use crate::error::{Error, Result};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Version};
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::{Arc, OnceLock};
use url::Url;

/// A fully-formed HTTP request: method, absolute URL, headers and body
#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Build a request for `url`
    ///
    /// The URL must be absolute, use `http` or `https`, and name a host.
    pub fn new(method: Method, url: &str) -> Result<Self> {
        Self::from_url(method, Url::parse(url)?)
    }

    /// Build a request from an already-parsed URL
    pub fn from_url(method: Method, url: Url) -> Result<Self> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidRequest(format!(
                "unsupported scheme '{}' in {url}",
                url.scheme()
            )));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(Error::InvalidRequest(format!("no host in {url}")));
        }
        Ok(Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        })
    }

    /// A GET request carrying the headers common to every request
    /// (currently the configured User-Agent)
    pub fn get(url: &str, transfer: &TransferConfig) -> Result<Self> {
        let value = HeaderValue::from_str(&transfer.user_agent)
            .map_err(|e| Error::config(format!("invalid user agent: {e}"), "transfer.user_agent"))?;
        Ok(Self::new(Method::GET, url)?.with_header(header::USER_AGENT, value))
    }

    /// Add or replace a header
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Add or replace a header given as strings
    pub fn header(self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::InvalidRequest(format!("bad header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::InvalidRequest(format!("bad value for header '{name}': {e}")))?;
        Ok(self.with_header(name, value))
    }

    /// Attach a request body
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Request method
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Target URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Request headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Request body, if any
    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Host the request targets
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub(crate) fn to_builder(&self, client: &reqwest::Client) -> reqwest::RequestBuilder {
        let mut builder = client
            .request(self.method.clone(), self.url.clone())
            .headers(self.headers.clone());
        if let Some(body) = &self.body {
            builder = builder.body(body.clone());
        }
        builder
    }
}

/// Set of acceptable HTTP status codes (default 200–299)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSet {
    ranges: Vec<RangeInclusive<u16>>,
}

impl Default for StatusSet {
    fn default() -> Self {
        Self {
            ranges: vec![200..=299],
        }
    }
}

impl StatusSet {
    /// A set made of the given ranges
    pub fn from_ranges(ranges: impl IntoIterator<Item = RangeInclusive<u16>>) -> Self {
        Self {
            ranges: ranges.into_iter().collect(),
        }
    }

    /// A set made of individual codes
    pub fn from_codes(codes: impl IntoIterator<Item = u16>) -> Self {
        Self::from_ranges(codes.into_iter().map(|c| c..=c))
    }

    /// True if `code` is in the set
    pub fn contains(&self, code: u16) -> bool {
        self.ranges.iter().any(|r| r.contains(&code))
    }
}

/// What a finished transfer must look like to count as a success
#[derive(Debug, Clone, Default)]
pub struct ResponsePolicy {
    /// Acceptable status codes
    pub statuses: StatusSet,
    /// Acceptable MIME types (lower-case, no parameters); `None` accepts anything
    pub content_types: Option<HashSet<String>>,
}

impl ResponsePolicy {
    /// True if the final status is acceptable
    pub fn status_acceptable(&self, status: StatusCode) -> bool {
        self.statuses.contains(status.as_u16())
    }

    /// True if the MIME type is acceptable; an unset policy accepts anything
    pub fn content_type_acceptable(&self, mime_type: Option<&str>) -> bool {
        match (&self.content_types, mime_type) {
            (None, _) => true,
            (Some(accepted), Some(mime)) => accepted.contains(&mime.to_ascii_lowercase()),
            (Some(_), None) => false,
        }
    }

    /// Check a finished response, status first, then content type
    pub fn check(&self, metadata: &ResponseMetadata) -> Result<()> {
        if !self.status_acceptable(metadata.status) {
            return Err(Error::Status {
                code: metadata.status.as_u16(),
            });
        }
        if !self.content_type_acceptable(metadata.mime_type.as_deref()) {
            return Err(Error::BadContentType {
                content_type: metadata.mime_type.clone(),
            });
        }
        Ok(())
    }
}

/// Response status line and headers, plus the URL after redirects
#[derive(Debug, Clone)]
pub struct ResponseMetadata {
    /// Final URL, after any redirects
    pub url: Url,
    /// Final status
    pub status: StatusCode,
    /// HTTP version of the final response
    pub version: Version,
    /// Response headers
    pub headers: HeaderMap,
    /// MIME type from `Content-Type`, lower-cased, parameters stripped
    pub mime_type: Option<String>,
    /// Declared `Content-Length`
    pub content_length: Option<u64>,
}

impl ResponseMetadata {
    pub(crate) fn from_response(response: &reqwest::Response) -> Self {
        let headers = response.headers().clone();
        Self {
            url: response.url().clone(),
            status: response.status(),
            version: response.version(),
            mime_type: mime_type(&headers),
            content_length: response.content_length(),
            headers,
        }
    }
}

/// Extract `type/subtype` from a `Content-Type` header
pub(crate) fn mime_type(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
    let mime = raw.split(';').next()?.trim();
    if mime.is_empty() {
        None
    } else {
        Some(mime.to_ascii_lowercase())
    }
}

/// Write-once slot holding the metadata of one attempt
///
/// Filled when the final response headers arrive; readable from any thread,
/// and stays readable after the task finished with an error.
#[derive(Debug, Clone, Default)]
pub struct ResponseSlot {
    inner: Arc<OnceLock<ResponseMetadata>>,
}

impl ResponseSlot {
    /// Captured metadata, if headers were received
    pub fn get(&self) -> Option<&ResponseMetadata> {
        self.inner.get()
    }

    pub(crate) fn capture(&self, metadata: ResponseMetadata) -> bool {
        self.inner.set(metadata).is_ok()
    }
}
