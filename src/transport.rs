//! Transport capability.
//!
//! The orchestrator never opens connections itself; it hands a prepared
//! [`TransportRequest`] to a [`Transport`]. [`ReqwestTransport`] is the
//! default, and any `Fn(TransportRequest) -> impl Future` closure works too.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::TryStreamExt;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use url::form_urlencoded;

use crate::body::{Duplex, TransportBody};
use crate::response::ResponseBody;
use crate::BoxError;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded;charset=UTF-8";

/// Fully prepared request handed to a transport.
#[derive(Debug)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<TransportBody>,
    /// Fires on caller cancellation or timeout.
    pub signal: CancellationToken,
    pub duplex: Option<Duplex>,
    pub timeout: Option<Duration>,
    /// Options the orchestrator does not interpret.
    pub extra: BTreeMap<String, JsonValue>,
}

/// What a transport returns for a completed exchange.
#[derive(Debug)]
pub struct TransportResponse {
    pub url: String,
    pub status: StatusCode,
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl TransportResponse {
    /// Creates an empty response with the canonical reason phrase.
    pub fn new(status: StatusCode) -> Self {
        Self {
            url: String::new(),
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
            headers: HeaderMap::new(),
            body: ResponseBody::empty(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: ResponseBody) -> Self {
        self.body = body;
        self
    }
}

/// Asynchronous request primitive the orchestrator rides on.
pub trait Transport: Send + Sync {
    fn send(&self, request: TransportRequest) -> BoxFuture<'_, Result<TransportResponse, BoxError>>;
}

impl<F, Fut> Transport for F
where
    F: Fn(TransportRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TransportResponse, BoxError>> + Send + 'static,
{
    fn send(&self, request: TransportRequest) -> BoxFuture<'_, Result<TransportResponse, BoxError>> {
        Box::pin((self)(request))
    }
}

/// Transport backed by a shared `reqwest::Client`.
#[derive(Clone, Default)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqwestTransport").finish_non_exhaustive()
    }
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    /// Uses a preconfigured client (proxies, TLS roots, pools, ...).
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, BoxError> {
        let TransportRequest {
            method,
            url,
            mut headers,
            body,
            ..
        } = request;

        let body = match body {
            None => None,
            Some(TransportBody::Text(text)) => Some(reqwest::Body::from(text)),
            Some(TransportBody::Bytes(bytes)) => Some(reqwest::Body::from(bytes)),
            Some(TransportBody::Form(pairs)) => {
                if !headers.contains_key(header::CONTENT_TYPE) {
                    headers.insert(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static(FORM_CONTENT_TYPE),
                    );
                }
                let encoded = form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(&pairs)
                    .finish();
                Some(reqwest::Body::from(encoded))
            }
            Some(TransportBody::Stream(stream)) => Some(reqwest::Body::wrap_stream(stream)),
        };

        let mut builder = self.http.request(method, url.as_str()).headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();

        Ok(TransportResponse {
            url: response.url().to_string(),
            status,
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
            headers: response.headers().clone(),
            body: ResponseBody::new(response.bytes_stream().map_err(BoxError::from)),
        })
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: TransportRequest) -> BoxFuture<'_, Result<TransportResponse, BoxError>> {
        Box::pin(self.execute(request))
    }
}
