//! Host fetch contract for `esi:include` sub-requests.
//!
//! The crate never talks to the network itself; the host supplies a
//! dispatcher callback that takes a fragment request and resolves to a
//! response. Responses carry their whole body; streaming bodies are fed
//! back through a recursive ESI stream by the include machinery.

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, Method, StatusCode};
use url::Url;

use crate::error::Result;

/// A sub-request for one include candidate.
#[derive(Debug, Clone)]
pub struct FragmentRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
}

impl FragmentRequest {
    pub fn get(url: Url, headers: HeaderMap) -> Self {
        Self {
            url,
            method: Method::GET,
            headers,
        }
    }
}

/// The host's answer for one include candidate.
#[derive(Debug)]
pub struct FragmentResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: Bytes,
}

impl FragmentResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: http::header::HeaderName, value: &str) -> Self {
        if let Ok(value) = value.parse() {
            self.headers.insert(name, value);
        }
        self
    }

    /// Whether the status falls in the 200–299 window an include accepts.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Body as UTF-8 text.
    pub fn text(self) -> Result<String> {
        Ok(String::from_utf8(self.body.to_vec())?)
    }
}

/// Future type produced by a fragment dispatcher.
pub type FetchFuture = BoxFuture<'static, Result<FragmentResponse>>;

/// Host-provided fetch implementation for `esi:include`.
pub type FragmentDispatcher = dyn Fn(FragmentRequest) -> FetchFuture + Send + Sync;

/// Context handed to a configured include-response processor.
pub struct IncludeResponseContext {
    pub url: Url,
    pub headers: HeaderMap,
    pub response: FragmentResponse,
}

/// Replaces the default recursive-ESI handling of successful includes.
pub type IncludeResponseProcessor =
    dyn Fn(IncludeResponseContext) -> BoxFuture<'static, Result<String>> + Send + Sync;

/// Context handed to a configured include-error handler after every
/// candidate failed.
pub struct IncludeErrorContext<'a> {
    /// The last candidate URL that was attempted.
    pub url: &'a str,
    pub headers: &'a HeaderMap,
    pub element: &'a crate::document::Element,
}

/// May produce a replacement string for a failed include, overriding the
/// `onerror` / `IncludeError` behavior.
pub type IncludeErrorHandler = dyn Fn(&IncludeErrorContext<'_>) -> Option<String> + Send + Sync;
