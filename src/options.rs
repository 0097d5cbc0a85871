//! Request options and the two-layer merge (instance defaults + call site).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::body::{is_payload_method, Duplex, RequestBody};
use crate::context::{FetchContext, FetchRequest};
use crate::decode::ResponseType;
use crate::hooks::{Hook, HookPhase, Hooks};
use crate::url::{QueryParams, QueryValue};

/// Custom body parser. Replaces the lossy JSON parse.
pub type ParseResponse = Arc<dyn Fn(&str) -> JsonValue + Send + Sync>;
pub type RetryPredicate = Arc<dyn Fn(&FetchContext, u32) -> bool + Send + Sync>;
pub type RetryDelayFn = Arc<dyn Fn(&FetchContext, u32) -> Duration + Send + Sync>;

/// Statuses retried when no override is configured.
pub const DEFAULT_RETRY_STATUS_CODES: [u16; 8] = [408, 409, 425, 429, 500, 502, 503, 504];

/// Retry policy.
#[derive(Clone)]
pub enum Retry {
    Disabled,
    /// Remaining retries after the current attempt.
    Count(u32),
    /// Decides per failure, given the failed attempt's context and the
    /// zero-based attempt counter. Status codes are not consulted.
    When(RetryPredicate),
}

impl Retry {
    pub fn when<F>(predicate: F) -> Self
    where
        F: Fn(&FetchContext, u32) -> bool + Send + Sync + 'static,
    {
        Self::When(Arc::new(predicate))
    }
}

impl From<u32> for Retry {
    fn from(value: u32) -> Self {
        Self::Count(value)
    }
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("Disabled"),
            Self::Count(count) => f.debug_tuple("Count").field(count).finish(),
            Self::When(_) => f.write_str("When(..)"),
        }
    }
}

/// Wait before the next attempt.
#[derive(Clone)]
pub enum RetryDelay {
    Fixed(Duration),
    /// `base * 2^attempt`, capped at `max`.
    Exponential { base: Duration, max: Duration },
    With(RetryDelayFn),
}

impl RetryDelay {
    pub fn with<F>(delay: F) -> Self
    where
        F: Fn(&FetchContext, u32) -> Duration + Send + Sync + 'static,
    {
        Self::With(Arc::new(delay))
    }

    pub fn delay(&self, ctx: &FetchContext, attempt: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential { base, max } => {
                let multiplier = 1u32 << attempt.min(16);
                base.saturating_mul(multiplier).min(*max)
            }
            Self::With(delay) => delay(ctx, attempt),
        }
    }
}

impl From<Duration> for RetryDelay {
    fn from(value: Duration) -> Self {
        Self::Fixed(value)
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Self::Exponential { base, max } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("max", max)
                .finish(),
            Self::With(_) => f.write_str("With(..)"),
        }
    }
}

/// Options for a request, or defaults for a [`Fetch`](crate::Fetch)
/// instance.
///
/// Unset fields fall back to the instance defaults. `headers`, `query` and
/// `params` are merged key by key instead.
#[derive(Clone, Default)]
pub struct FetchOptions {
    pub method: Option<Method>,
    pub base_url: Option<String>,
    pub body: Option<RequestBody>,
    pub query: QueryParams,
    /// Alias of `query`; `query` wins on conflicting keys.
    pub params: QueryParams,
    pub headers: HeaderMap,
    pub response_type: Option<ResponseType>,
    pub parse_response: Option<ParseResponse>,
    pub ignore_response_error: Option<bool>,
    pub timeout: Option<Duration>,
    pub retry: Option<Retry>,
    pub retry_delay: Option<RetryDelay>,
    pub retry_status_codes: Option<BTreeSet<u16>>,
    pub signal: Option<CancellationToken>,
    pub duplex: Option<Duplex>,
    pub hooks: Hooks,
    /// Passed to the transport untouched.
    pub extra: BTreeMap<String, JsonValue>,
}

impl fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOptions")
            .field("method", &self.method)
            .field("base_url", &self.base_url)
            .field("body", &self.body)
            .field("query", &self.query)
            .field("params", &self.params)
            .field("headers", &self.headers)
            .field("response_type", &self.response_type)
            .field("parse_response", &self.parse_response.as_ref().map(|_| ".."))
            .field("ignore_response_error", &self.ignore_response_error)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("retry_status_codes", &self.retry_status_codes)
            .field("signal", &self.signal)
            .field("duplex", &self.duplex)
            .field("hooks", &self.hooks)
            .field("extra", &self.extra)
            .finish()
    }
}

#[derive(Clone, Copy)]
enum HookMerge {
    Replace,
    Concat,
}

impl FetchOptions {
    /// Empty options: every field falls back to the client defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds instance defaults from the environment.
    ///
    /// Reads:
    /// - `HOOKFETCH_BASE_URL`
    /// - `HOOKFETCH_TIMEOUT_MS`, in milliseconds
    /// - `HOOKFETCH_RETRY`, a retry count or `false`
    ///
    /// Unset variables leave the option unset.
    pub fn from_env() -> Result<Self, String> {
        let mut options = Self::new();

        if let Some(base_url) = env_var("HOOKFETCH_BASE_URL")? {
            options.base_url = Some(base_url);
        }
        if let Some(timeout) = env_var("HOOKFETCH_TIMEOUT_MS")? {
            let millis = timeout
                .parse::<u64>()
                .map_err(|_| format!("HOOKFETCH_TIMEOUT_MS is not a number of milliseconds: {timeout}"))?;
            options.timeout = Some(Duration::from_millis(millis));
        }
        if let Some(retry) = env_var("HOOKFETCH_RETRY")? {
            options.retry = Some(parse_retry(&retry)?);
        }

        Ok(options)
    }

    /// HTTP method. Lowercase names are uppercased before sending.
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Prefix for string targets, applied idempotently.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Request body. JSON-capable bodies on payload methods are sent as
    /// JSON with default `content-type` and `accept` headers.
    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serializes `value` into a JSON body.
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self, serde_json::Error> {
        Ok(self.body(RequestBody::json(value)?))
    }

    /// Sets one query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        self.query.set(key, value);
        self
    }

    /// Overlays a whole parameter set onto `query`.
    pub fn query_params(mut self, query: impl Into<QueryParams>) -> Self {
        self.query.merge(&query.into());
        self
    }

    /// Sets one parameter. `query` entries win over `params` with the same key.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        self.params.set(key, value);
        self
    }

    /// Sets a header, replacing earlier values of the same name.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Like [`header`](Self::header), parsing name and value.
    pub fn try_header(self, name: &str, value: &str) -> Result<Self, http::Error> {
        let name = HeaderName::try_from(name)?;
        let value = HeaderValue::try_from(value)?;
        Ok(self.header(name, value))
    }

    /// Merges `headers` in; names present in `headers` replace existing ones.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        merge_headers(&mut self.headers, headers);
        self
    }

    /// Forces a decoder instead of sniffing `content-type`.
    pub fn response_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = Some(response_type);
        self
    }

    /// Custom JSON parser; implies [`ResponseType::Json`].
    pub fn parse_response<F>(mut self, parse: F) -> Self
    where
        F: Fn(&str) -> JsonValue + Send + Sync + 'static,
    {
        self.parse_response = Some(Arc::new(parse));
        self
    }

    /// Return 4xx/5xx responses as successes.
    pub fn ignore_response_error(mut self, ignore: bool) -> Self {
        self.ignore_response_error = Some(ignore);
        self
    }

    /// Per-attempt timeout. Ignored when a [`signal`](Self::signal) is set.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Retry policy. Accepts a count, e.g. `.retry(2)`.
    pub fn retry(mut self, retry: impl Into<Retry>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    /// Never retry, whatever the method or status.
    pub fn no_retry(self) -> Self {
        self.retry(Retry::Disabled)
    }

    /// Lets `predicate` decide each retry. It gets the failed context
    /// and the zero-based attempt counter.
    pub fn retry_when<F>(self, predicate: F) -> Self
    where
        F: Fn(&FetchContext, u32) -> bool + Send + Sync + 'static,
    {
        self.retry(Retry::when(predicate))
    }

    /// Wait between attempts: a fixed `Duration` or a [`RetryDelay`].
    pub fn retry_delay(mut self, delay: impl Into<RetryDelay>) -> Self {
        self.retry_delay = Some(delay.into());
        self
    }

    /// Replaces [`DEFAULT_RETRY_STATUS_CODES`].
    pub fn retry_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retry_status_codes = Some(codes.into_iter().collect());
        self
    }

    /// Caller cancellation. Setting a signal disables `timeout`.
    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Streaming mode passed to the transport.
    pub fn duplex(mut self, duplex: Duplex) -> Self {
        self.duplex = Some(duplex);
        self
    }

    /// Replaces every hook list.
    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Runs before the request is composed. A failure ends the attempt
    /// without calling the transport.
    pub fn on_request(mut self, hook: Hook) -> Self {
        self.hooks.push(HookPhase::Request, hook);
        self
    }

    /// Runs after a transport failure, timeout or abort.
    pub fn on_request_error(mut self, hook: Hook) -> Self {
        self.hooks.push(HookPhase::RequestError, hook);
        self
    }

    /// Runs after a response is decoded.
    pub fn on_response(mut self, hook: Hook) -> Self {
        self.hooks.push(HookPhase::Response, hook);
        self
    }

    /// Runs for 4xx/5xx responses unless they are ignored.
    pub fn on_response_error(mut self, hook: Hook) -> Self {
        self.hooks.push(HookPhase::ResponseError, hook);
        self
    }

    /// Transport-specific option, forwarded untouched.
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Statuses eligible for retry.
    pub fn retry_codes(&self) -> BTreeSet<u16> {
        self.retry_status_codes
            .clone()
            .unwrap_or_else(|| DEFAULT_RETRY_STATUS_CODES.into_iter().collect())
    }

    /// Retries allowed when `retry` is unset: none for payload methods.
    pub(crate) fn default_retry_budget(&self) -> u32 {
        match &self.method {
            Some(method) if is_payload_method(method) => 0,
            _ => 1,
        }
    }

    /// Call-site merge: `overlay` wins field by field, hook phases set on the
    /// overlay replace the defaults' list for that phase.
    pub(crate) fn merged_with(self, overlay: FetchOptions) -> Self {
        self.merge(overlay, HookMerge::Replace)
    }

    /// Defaults merge for derived instances: hooks run parent-first.
    pub(crate) fn extended_with(self, overlay: FetchOptions) -> Self {
        self.merge(overlay, HookMerge::Concat)
    }

    fn merge(mut self, overlay: FetchOptions, hook_merge: HookMerge) -> Self {
        let FetchOptions {
            method,
            base_url,
            body,
            query,
            params,
            headers,
            response_type,
            parse_response,
            ignore_response_error,
            timeout,
            retry,
            retry_delay,
            retry_status_codes,
            signal,
            duplex,
            hooks,
            extra,
        } = overlay;

        self.method = method.or(self.method);
        self.base_url = base_url.or(self.base_url);
        self.body = body.or(self.body);
        self.query.merge(&query);
        self.params.merge(&params);
        merge_headers(&mut self.headers, headers);
        self.response_type = response_type.or(self.response_type);
        self.parse_response = parse_response.or(self.parse_response);
        self.ignore_response_error = ignore_response_error.or(self.ignore_response_error);
        self.timeout = timeout.or(self.timeout);
        self.retry = retry.or(self.retry);
        self.retry_delay = retry_delay.or(self.retry_delay);
        self.retry_status_codes = retry_status_codes.or(self.retry_status_codes);
        self.signal = signal.or(self.signal);
        self.duplex = duplex.or(self.duplex);
        match hook_merge {
            HookMerge::Replace => self.hooks.override_with(hooks),
            HookMerge::Concat => self.hooks.extend(hooks),
        }
        self.extra.extend(extra);
        self
    }

    /// Final per-attempt fixups: method adopted from a prepared request or
    /// defaulted to GET, uppercased, hooks sorted.
    pub(crate) fn resolve(mut self, request: &FetchRequest) -> Self {
        let method = self
            .method
            .take()
            .or_else(|| request.method().cloned())
            .unwrap_or(Method::GET);
        self.method = Some(normalize_method(method));
        self.hooks.normalize();
        self
    }

    /// Query parameters to apply: `params` overlaid with `query`.
    pub(crate) fn effective_query(&self) -> QueryParams {
        let mut merged = self.params.clone();
        merged.merge(&self.query);
        merged
    }
}

/// Inserts every header of `overlay`, replacing same-named headers of `base`
/// and keeping multi-valued overlay headers intact.
pub(crate) fn merge_headers(base: &mut HeaderMap, overlay: HeaderMap) {
    let mut current: Option<HeaderName> = None;
    for (name, value) in overlay {
        match name {
            Some(name) => {
                base.insert(name.clone(), value);
                current = Some(name);
            }
            None => {
                if let Some(name) = &current {
                    base.append(name.clone(), value);
                }
            }
        }
    }
}

fn normalize_method(method: Method) -> Method {
    let upper = method.as_str().to_ascii_uppercase();
    if upper == method.as_str() {
        return method;
    }
    Method::from_bytes(upper.as_bytes()).unwrap_or(method)
}

fn env_var(name: &str) -> Result<Option<String>, String> {
    match std::env::var(name) {
        Ok(value) if value.trim().is_empty() => Err(format!("{name} is set but empty")),
        Ok(value) => Ok(Some(value.trim().to_owned())),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(format!("{name} is not valid unicode")),
    }
}

fn parse_retry(value: &str) -> Result<Retry, String> {
    match value.to_ascii_lowercase().as_str() {
        "false" | "off" => Ok(Retry::Disabled),
        count => count
            .parse::<u32>()
            .map(Retry::Count)
            .map_err(|_| format!("HOOKFETCH_RETRY must be a retry count or `false`, got: {value}")),
    }
}
