use std::fmt;

use http::{HeaderMap, HeaderName, HeaderValue, Method};

use crate::error::Cause;
use crate::options::FetchOptions;
use crate::response::FetchResponse;

/// A request whose method, URL and headers were fixed up front.
///
/// Prepared requests are sent as-is: base URL and query options are not
/// applied to them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
}

impl PreparedRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }
}

/// Request target: a URL string or a prepared request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchRequest {
    Url(String),
    Prepared(PreparedRequest),
}

impl FetchRequest {
    pub fn url(&self) -> &str {
        match self {
            Self::Url(url) => url,
            Self::Prepared(prepared) => &prepared.url,
        }
    }

    /// Method carried by a prepared request.
    pub fn method(&self) -> Option<&Method> {
        match self {
            Self::Url(_) => None,
            Self::Prepared(prepared) => Some(&prepared.method),
        }
    }
}

impl fmt::Display for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url())
    }
}

impl From<&str> for FetchRequest {
    fn from(value: &str) -> Self {
        Self::Url(value.to_owned())
    }
}

impl From<String> for FetchRequest {
    fn from(value: String) -> Self {
        Self::Url(value)
    }
}

impl From<&String> for FetchRequest {
    fn from(value: &String) -> Self {
        Self::Url(value.clone())
    }
}

impl From<url::Url> for FetchRequest {
    fn from(value: url::Url) -> Self {
        Self::Url(value.into())
    }
}

impl From<PreparedRequest> for FetchRequest {
    fn from(value: PreparedRequest) -> Self {
        Self::Prepared(value)
    }
}

/// State of a single attempt, handed to every hook.
#[derive(Debug)]
pub struct FetchContext {
    pub request: FetchRequest,
    /// Resolved options for this attempt.
    pub options: FetchOptions,
    pub response: Option<FetchResponse>,
    pub error: Option<Cause>,
}

impl FetchContext {
    pub fn new(request: FetchRequest, options: FetchOptions) -> Self {
        Self {
            request,
            options,
            response: None,
            error: None,
        }
    }
}
