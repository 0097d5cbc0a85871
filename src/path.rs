//! Fluent path builder.
//!
//! Enabled with the `path-client` feature.
//!
//! ```no_run
//! # async fn run() -> hookfetch::Result<()> {
//! use hookfetch::{Fetch, FetchOptions, PathClient};
//!
//! let api = PathClient::new(Fetch::new(), FetchOptions::new().base_url("https://api.test"));
//! let user = api.segment("users").segment(42).get(None, FetchOptions::new()).await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;

use http::Method;
use serde_json::Value as JsonValue;

use crate::body::is_payload_method;
use crate::url::{join_url, with_query, QueryParams};
use crate::{Fetch, FetchOptions, RequestBody, ResponseData, Result};

const VERBS: [&str; 5] = ["GET", "POST", "PUT", "DELETE", "PATCH"];

/// A node in the path tree. Each node owns its URL; children extend it.
#[derive(Clone, Debug)]
pub struct PathClient {
    fetch: Fetch,
    options: FetchOptions,
    url: String,
}

/// What a name resolves to under a [`PathClient`].
#[derive(Clone, Debug)]
pub enum PathEntry {
    Verb(Endpoint),
    Node(PathClient),
}

impl PathClient {
    /// Root node at `options.base_url`, or `/` without one.
    pub fn new(fetch: Fetch, options: FetchOptions) -> Self {
        let url = options
            .base_url
            .clone()
            .unwrap_or_else(|| "/".to_owned());
        Self {
            fetch,
            options,
            url,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Child node one segment deeper.
    pub fn segment(&self, segment: impl fmt::Display) -> Self {
        let segment = segment.to_string();
        let url = if self.url == "/" {
            format!("/{}", segment.trim_start_matches('/'))
        } else {
            join_url(&self.url, &segment)
        };
        Self {
            fetch: self.fetch.clone(),
            options: self.options.clone(),
            url,
        }
    }

    pub fn segments<I>(&self, segments: I) -> Self
    where
        I: IntoIterator,
        I::Item: fmt::Display,
    {
        segments
            .into_iter()
            .fold(self.clone(), |node, segment| node.segment(segment))
    }

    /// Resolves `name` case-insensitively: HTTP verbs become endpoints,
    /// anything else a child node.
    pub fn entry(&self, name: &str) -> PathEntry {
        let upper = name.to_ascii_uppercase();
        if VERBS.contains(&upper.as_str()) {
            if let Ok(method) = Method::from_bytes(upper.as_bytes()) {
                return PathEntry::Verb(self.endpoint(method));
            }
        }
        PathEntry::Node(self.segment(name))
    }

    pub fn endpoint(&self, method: Method) -> Endpoint {
        Endpoint {
            node: self.clone(),
            method,
        }
    }

    pub async fn get(&self, data: Option<RequestBody>, options: FetchOptions) -> Result<Option<ResponseData>> {
        self.endpoint(Method::GET).call(data, options).await
    }

    pub async fn post(&self, data: Option<RequestBody>, options: FetchOptions) -> Result<Option<ResponseData>> {
        self.endpoint(Method::POST).call(data, options).await
    }

    pub async fn put(&self, data: Option<RequestBody>, options: FetchOptions) -> Result<Option<ResponseData>> {
        self.endpoint(Method::PUT).call(data, options).await
    }

    pub async fn delete(&self, data: Option<RequestBody>, options: FetchOptions) -> Result<Option<ResponseData>> {
        self.endpoint(Method::DELETE).call(data, options).await
    }

    pub async fn patch(&self, data: Option<RequestBody>, options: FetchOptions) -> Result<Option<ResponseData>> {
        self.endpoint(Method::PATCH).call(data, options).await
    }
}

/// A verb bound to a path.
#[derive(Clone, Debug)]
pub struct Endpoint {
    node: PathClient,
    method: Method,
}

impl Endpoint {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.node.url
    }

    /// Sends the request. On payload methods `data` is the body. On GET only
    /// a JSON object is accepted: its entries become query parameters, and
    /// any other `data` is ignored. Other methods ignore `data`.
    pub async fn call(&self, data: Option<RequestBody>, options: FetchOptions) -> Result<Option<ResponseData>> {
        let mut url = self.node.url.clone();
        let mut options = self.node.options.clone().merged_with(options);
        options.method = Some(self.method.clone());

        match data {
            Some(RequestBody::Json(JsonValue::Object(map))) if self.method == Method::GET => {
                url = with_query(&url, &QueryParams::from(map));
            }
            Some(body) if is_payload_method(&self.method) => options.body = Some(body),
            _ => {}
        }

        self.node.fetch.request(url, options).await
    }
}
