use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, Method};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    body::{duplex_for, encode_json_body, RequestBody},
    context::{FetchContext, FetchRequest},
    decode::{decode_body, has_body, resolve_response_type, ResponseData},
    error::Cause,
    hooks::{run_hooks, HookPhase},
    options::{merge_headers, FetchOptions, Retry},
    response::FetchResponse,
    transport::{ReqwestTransport, Transport, TransportRequest},
    url::{with_base, with_query},
    FetchError, Result,
};

/// Fetch client: shared defaults over a pluggable [`Transport`].
///
/// Cloning is cheap; clones share the transport and the defaults.
#[derive(Clone)]
pub struct Fetch {
    transport: Arc<dyn Transport>,
    defaults: Arc<FetchOptions>,
}

impl fmt::Debug for Fetch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fetch")
            .field("transport", &"<dyn Transport>")
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl Default for Fetch {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetch {
    /// Creates a client backed by a fresh [`ReqwestTransport`].
    pub fn new() -> Self {
        Self::with_transport(ReqwestTransport::new())
    }

    /// Creates a client over a custom transport, e.g. a closure
    /// `Fn(TransportRequest) -> impl Future<Output = Result<TransportResponse, BoxError>>`.
    pub fn with_transport(transport: impl Transport + 'static) -> Self {
        Self {
            transport: Arc::new(transport),
            defaults: Arc::new(FetchOptions::default()),
        }
    }

    /// Creates a reqwest-backed client with defaults read from the
    /// environment. See [`FetchOptions::from_env`].
    ///
    /// # Example
    ///
    /// ```no_run
    /// use hookfetch::Fetch;
    ///
    /// let fetch = Fetch::from_env().expect("malformed HOOKFETCH_* env vars");
    /// ```
    pub fn from_env() -> std::result::Result<Self, String> {
        Ok(Self::new().with_defaults(FetchOptions::from_env()?))
    }

    /// Options merged under every request of this client.
    pub fn defaults(&self) -> &FetchOptions {
        &self.defaults
    }

    /// The underlying transport.
    pub fn native(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Derives a client whose defaults are these defaults merged with
    /// `overrides`. Hooks of both run, parent hooks first.
    pub fn with_defaults(&self, overrides: FetchOptions) -> Self {
        let defaults = self.defaults.as_ref().clone().extended_with(overrides);
        Self {
            transport: Arc::clone(&self.transport),
            defaults: Arc::new(defaults),
        }
    }

    /// Sends a request and returns the decoded body.
    pub async fn request(
        &self,
        request: impl Into<FetchRequest>,
        options: FetchOptions,
    ) -> Result<Option<ResponseData>> {
        self.request_raw(request, options)
            .await
            .map(FetchResponse::into_data)
    }

    /// Sends a request and returns the full response.
    pub async fn request_raw(
        &self,
        request: impl Into<FetchRequest>,
        options: FetchOptions,
    ) -> Result<FetchResponse> {
        let mut request = request.into();
        let mut options = self.defaults.as_ref().clone().merged_with(options);
        let mut attempt = 0u32;

        loop {
            let ctx = match self.run_attempt(request, options).await {
                Ok(response) => return Ok(response),
                Err(ctx) => ctx,
            };

            let Some((delay, retry)) = next_retry(&ctx, attempt) else {
                let err = FetchError::from_context(ctx);
                #[cfg(feature = "tracing")]
                tracing::debug!(attempt, error = %err, "request failed");
                return Err(err);
            };

            #[cfg(feature = "tracing")]
            tracing::debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                url = %ctx.request,
                "retrying request"
            );

            // Retry with the composed request and the attempt's options.
            request = ctx.request;
            options = ctx.options;
            options.retry = Some(retry);
            if !delay.is_zero() {
                sleep(delay).await;
            }
            attempt += 1;
        }
    }

    async fn run_attempt(
        &self,
        request: FetchRequest,
        options: FetchOptions,
    ) -> std::result::Result<FetchResponse, FetchContext> {
        let options = options.resolve(&request);
        let mut ctx = FetchContext::new(request, options);

        if let Err(cause) = run_hooks(HookPhase::Request, &mut ctx).await {
            ctx.error = Some(cause);
            return Err(ctx);
        }

        if let FetchRequest::Url(url) = &ctx.request {
            let mut url = match &ctx.options.base_url {
                Some(base) => with_base(url, base),
                None => url.clone(),
            };
            let query = ctx.options.effective_query();
            if !query.is_empty() {
                url = with_query(&url, &query);
            }
            ctx.request = FetchRequest::Url(url);
        }

        let method = ctx.options.method.clone().unwrap_or(Method::GET);
        let preset = match &ctx.request {
            FetchRequest::Prepared(prepared) => prepared.headers.clone(),
            FetchRequest::Url(_) => HeaderMap::new(),
        };
        encode_json_body(&method, &mut ctx.options.body, &mut ctx.options.headers, &preset);
        ctx.options.duplex = duplex_for(ctx.options.body.as_ref(), ctx.options.duplex);

        let signal = AttemptSignal::new(ctx.options.signal.clone(), ctx.options.timeout);

        let mut headers = preset;
        merge_headers(&mut headers, ctx.options.headers.clone());
        let body = match ctx.options.body.as_ref().map(RequestBody::to_transport).transpose() {
            Ok(body) => body,
            Err(err) => {
                ctx.error = Some(Cause::Transport { source: err.into() });
                return Err(request_failed(ctx).await);
            }
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(method = %method, url = %ctx.request, "sending request");

        let transport_request = TransportRequest {
            method: method.clone(),
            url: ctx.request.url().to_owned(),
            headers,
            body,
            signal: signal.token.clone(),
            duplex: ctx.options.duplex,
            timeout: ctx.options.timeout,
            extra: ctx.options.extra.clone(),
        };

        let response = match signal.guard(self.transport.send(transport_request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(source)) => {
                ctx.error = Some(Cause::Transport { source });
                return Err(request_failed(ctx).await);
            }
            Err(cause) => {
                ctx.error = Some(cause);
                return Err(request_failed(ctx).await);
            }
        };

        let mut response = FetchResponse::from_transport(response);
        if has_body(response.status, &method) {
            let response_type = resolve_response_type(&ctx.options, response.content_type());
            let content_type = response.content_type().map(str::to_owned);
            if let Some(body) = response.take_body() {
                let parse = ctx.options.parse_response.clone();
                let decoded = signal
                    .guard(decode_body(body, response_type, content_type, parse))
                    .await;
                match decoded {
                    Ok(Ok(data)) => response.data = Some(data),
                    Ok(Err(source)) => {
                        ctx.response = Some(response);
                        ctx.error = Some(Cause::Body { source });
                        return Err(ctx);
                    }
                    Err(cause) => {
                        ctx.response = Some(response);
                        ctx.error = Some(cause);
                        return Err(ctx);
                    }
                }
            }
        }
        drop(signal);

        ctx.response = Some(response);
        if let Err(cause) = run_hooks(HookPhase::Response, &mut ctx).await {
            ctx.error = Some(cause);
            return Err(ctx);
        }

        let http_failure = ctx
            .response
            .as_ref()
            .is_some_and(|response| (400..600).contains(&response.status.as_u16()));
        if http_failure && !ctx.options.ignore_response_error.unwrap_or(false) {
            if let Err(cause) = run_hooks(HookPhase::ResponseError, &mut ctx).await {
                ctx.error = Some(cause);
            }
            return Err(ctx);
        }

        let response = ctx.response.take();
        response.ok_or(ctx)
    }
}

/// Runs `on_request_error` hooks. A failing hook replaces the cause, except
/// an abort or timeout, which stays the cause of the attempt.
async fn request_failed(mut ctx: FetchContext) -> FetchContext {
    if let Err(hook_error) = run_hooks(HookPhase::RequestError, &mut ctx).await {
        let cancelled = ctx
            .error
            .as_ref()
            .is_some_and(|cause| cause.is_abort() || cause.is_timeout());
        if cancelled {
            #[cfg(feature = "tracing")]
            tracing::debug!(error = %hook_error, "on_request_error hook failed after cancellation");
            #[cfg(not(feature = "tracing"))]
            drop(hook_error);
        } else {
            ctx.error = Some(hook_error);
        }
    }
    ctx
}

/// Delay and remaining policy for the next attempt, or `None` when the
/// failure is final.
fn next_retry(ctx: &FetchContext, attempt: u32) -> Option<(Duration, Retry)> {
    let options = &ctx.options;
    if ctx.error.as_ref().is_some_and(Cause::is_abort) {
        return None;
    }
    // A stream body cannot be replayed.
    if options.body.as_ref().is_some_and(RequestBody::is_stream) {
        return None;
    }

    let next = match &options.retry {
        Some(Retry::Disabled) => return None,
        Some(Retry::When(predicate)) => {
            if !predicate(ctx, attempt) {
                return None;
            }
            Retry::When(Arc::clone(predicate))
        }
        Some(Retry::Count(budget)) => next_budget(ctx, *budget)?,
        None => next_budget(ctx, options.default_retry_budget())?,
    };

    let delay = options
        .retry_delay
        .as_ref()
        .map(|delay| delay.delay(ctx, attempt))
        .unwrap_or_default();
    Some((delay, next))
}

fn next_budget(ctx: &FetchContext, budget: u32) -> Option<Retry> {
    if budget == 0 || !ctx.options.retry_codes().contains(&retry_status(ctx)) {
        return None;
    }
    Some(Retry::Count(budget - 1))
}

/// Status a failure is judged by. Failures without a usable response count
/// as 500.
fn retry_status(ctx: &FetchContext) -> u16 {
    match (&ctx.error, &ctx.response) {
        (Some(cause), _) if cause.is_transport_class() => 500,
        (_, Some(response)) => response.status.as_u16(),
        _ => 500,
    }
}

/// Cancellation for one attempt: the caller's token, or an internal token
/// fired by a timer when only a timeout is configured. The timer is aborted
/// on drop.
struct AttemptSignal {
    token: CancellationToken,
    timeout: Option<Duration>,
    timer: Option<JoinHandle<()>>,
}

impl AttemptSignal {
    fn new(caller: Option<CancellationToken>, timeout: Option<Duration>) -> Self {
        match (caller, timeout) {
            (Some(token), _) => Self {
                token,
                timeout: None,
                timer: None,
            },
            (None, Some(after)) => {
                let token = CancellationToken::new();
                let timer = tokio::spawn({
                    let token = token.clone();
                    async move {
                        sleep(after).await;
                        token.cancel();
                    }
                });
                Self {
                    token,
                    timeout: Some(after),
                    timer: Some(timer),
                }
            }
            (None, None) => Self {
                token: CancellationToken::new(),
                timeout: None,
                timer: None,
            },
        }
    }

    fn cause(&self) -> Cause {
        match self.timeout {
            Some(after) => Cause::Timeout(after),
            None => Cause::Aborted,
        }
    }

    async fn guard<T>(&self, future: impl Future<Output = T>) -> std::result::Result<T, Cause> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.cause()),
            output = future => Ok(output),
        }
    }
}

impl Drop for AttemptSignal {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use bytes::Bytes;
    use http::{header, HeaderValue, Method, StatusCode};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::Fetch;
    use crate::body::TransportBody;
    use crate::context::PreparedRequest;
    use crate::error::Cause;
    use crate::hooks::{Hook, HookPhase};
    use crate::options::{FetchOptions, RetryDelay};
    use crate::response::ResponseBody;
    use crate::transport::{TransportRequest, TransportResponse};
    use crate::{BoxError, RequestBody, ResponseData, ResponseType};

    type Seen = Arc<Mutex<Vec<TransportRequest>>>;

    /// Client over an in-memory transport that records every request.
    fn mock<F>(handler: F) -> (Fetch, Seen)
    where
        F: Fn(&TransportRequest) -> Result<TransportResponse, BoxError> + Send + Sync + 'static,
    {
        let seen: Seen = Arc::default();
        let log = Arc::clone(&seen);
        let fetch = Fetch::with_transport(move |request: TransportRequest| {
            let result = handler(&request);
            log.lock().expect("log lock").push(request);
            async move { result }
        });
        (fetch, seen)
    }

    fn json_response(status: u16, body: &str) -> Result<TransportResponse, BoxError> {
        Ok(TransportResponse::new(StatusCode::from_u16(status)?)
            .with_header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            )
            .with_body(ResponseBody::from_bytes(body.to_owned())))
    }

    fn hits(seen: &Seen) -> usize {
        seen.lock().expect("log lock").len()
    }

    #[tokio::test]
    async fn decodes_json_and_text() {
        let (fetch, _) = mock(|request| match request.url.as_str() {
            "/json" => json_response(200, r#"{"num":42}"#),
            _ => Ok(TransportResponse::new(StatusCode::OK)
                .with_header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))
                .with_body(ResponseBody::from_bytes("ok"))),
        });

        let data = fetch
            .request("/json", FetchOptions::new())
            .await
            .expect("request must succeed");
        assert_eq!(data.as_ref().and_then(ResponseData::as_json), Some(&json!({ "num": 42 })));

        let data = fetch
            .request("/text", FetchOptions::new())
            .await
            .expect("request must succeed");
        assert_eq!(data.as_ref().and_then(ResponseData::as_text), Some("ok"));
    }

    #[tokio::test]
    async fn default_retry_budget_depends_on_method() {
        let (fetch, seen) = mock(|_| json_response(503, "{}"));
        let err = fetch
            .request("/503", FetchOptions::new())
            .await
            .expect_err("503 must fail");
        assert_eq!(err.status_code(), Some(503));
        assert_eq!(hits(&seen), 2);

        let (fetch, seen) = mock(|_| json_response(503, "{}"));
        fetch
            .request("/503", FetchOptions::new().method(Method::POST))
            .await
            .expect_err("503 must fail");
        assert_eq!(hits(&seen), 1);
    }

    #[tokio::test]
    async fn explicit_count_and_status_override() {
        let (fetch, seen) = mock(|_| json_response(503, "{}"));
        fetch
            .request("/503", FetchOptions::new().method(Method::POST).retry(3))
            .await
            .expect_err("503 must fail");
        assert_eq!(hits(&seen), 4);

        let (fetch, seen) = mock(|_| json_response(404, "{}"));
        fetch
            .request("/404", FetchOptions::new().retry(2))
            .await
            .expect_err("404 must fail");
        assert_eq!(hits(&seen), 1);

        let (fetch, seen) = mock(|_| json_response(404, "{}"));
        fetch
            .request(
                "/404",
                FetchOptions::new().retry(2).retry_status_codes([404]),
            )
            .await
            .expect_err("404 must fail");
        assert_eq!(hits(&seen), 3);
    }

    #[tokio::test]
    async fn retry_reuses_the_composed_request() {
        let (fetch, seen) = mock(|_| json_response(500, "{}"));
        fetch
            .request(
                "/items",
                FetchOptions::new()
                    .base_url("http://api.test/v1/")
                    .query("page", 2)
                    .retry(1),
            )
            .await
            .expect_err("500 must fail");

        let seen = seen.lock().expect("log lock");
        let urls: Vec<_> = seen.iter().map(|request| request.url.as_str()).collect();
        assert_eq!(urls, ["http://api.test/v1/items?page=2"; 2]);
    }

    #[tokio::test]
    async fn predicate_and_delay_see_attempt_counter() {
        let delays = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&delays);
        let (fetch, seen) = mock(|_| json_response(404, "{}"));
        fetch
            .request(
                "/404",
                FetchOptions::new()
                    .retry_when(|ctx, attempt| {
                        ctx.response
                            .as_ref()
                            .is_some_and(|response| response.status == StatusCode::NOT_FOUND)
                            && attempt < 2
                    })
                    .retry_delay(RetryDelay::with(move |_, attempt| {
                        recorded.lock().expect("delay lock").push(attempt);
                        Duration::ZERO
                    })),
            )
            .await
            .expect_err("404 must fail");

        assert_eq!(hits(&seen), 3);
        assert_eq!(*delays.lock().expect("delay lock"), vec![0, 1]);
    }

    #[tokio::test]
    async fn transport_errors_count_as_server_errors() {
        let (fetch, seen) = mock(|_| Err("connection refused".into()));
        let err = fetch
            .request("http://down.test/x", FetchOptions::new())
            .await
            .expect_err("request must fail");

        assert_eq!(hits(&seen), 2);
        assert_eq!(
            err.message(),
            r#"[GET] "http://down.test/x": <no response> connection refused"#
        );
        assert!(matches!(err.cause(), Some(Cause::Transport { .. })));
    }

    #[tokio::test]
    async fn caller_abort_is_not_retried() {
        let signal = CancellationToken::new();
        signal.cancel();
        let (fetch, seen) = mock(|_| json_response(200, "{}"));
        let err = fetch
            .request(
                "/",
                FetchOptions::new()
                    .retry(3)
                    .timeout(Duration::from_millis(10))
                    .signal(signal),
            )
            .await
            .expect_err("aborted request must fail");

        assert!(err.is_aborted());
        assert!(!err.is_timeout());
        assert!(hits(&seen) <= 1);
    }

    #[tokio::test]
    async fn abort_stays_the_cause_when_request_error_hook_fails() {
        let signal = CancellationToken::new();
        signal.cancel();
        let (fetch, seen) = mock(|_| json_response(200, "{}"));
        let err = fetch
            .request(
                "/x",
                FetchOptions::new()
                    .retry(3)
                    .signal(signal)
                    .on_request_error(Hook::sync(|_| Err("log sink down".into()))),
            )
            .await
            .expect_err("aborted request must fail");

        assert_eq!(hits(&seen), 1);
        assert!(err.is_aborted());
        assert_eq!(err.message(), r#"[GET] "/x": <no response> This operation was aborted"#);
    }

    #[tokio::test]
    async fn timeout_stays_the_cause_when_request_error_hook_fails() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let fetch = Fetch::with_transport(move |_request: TransportRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                json_response(200, "{}")
            }
        });

        let err = fetch
            .request(
                "/slow",
                FetchOptions::new()
                    .timeout(Duration::from_millis(20))
                    .retry(1)
                    .on_request_error(Hook::sync(|_| Err("log sink down".into()))),
            )
            .await
            .expect_err("slow request must time out");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(err.is_timeout());
        assert!(!err.is_aborted());
    }

    #[tokio::test]
    async fn failing_request_error_hook_replaces_transport_cause() {
        let (fetch, seen) = mock(|_| Err("connection refused".into()));
        let err = fetch
            .request(
                "/x",
                FetchOptions::new()
                    .retry(0)
                    .on_request_error(Hook::sync(|_| Err("log sink down".into()))),
            )
            .await
            .expect_err("request must fail");

        assert_eq!(hits(&seen), 1);
        assert!(matches!(
            err.cause(),
            Some(Cause::Hook { phase: HookPhase::RequestError, .. })
        ));
    }

    #[tokio::test]
    async fn timeout_fails_fast_with_timeout_cause() {
        let fetch = Fetch::with_transport(|_request: TransportRequest| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            json_response(200, "{}")
        });

        let started = tokio::time::Instant::now();
        let err = fetch
            .request(
                "/slow",
                FetchOptions::new().timeout(Duration::from_millis(50)).retry(0),
            )
            .await
            .expect_err("slow request must time out");

        assert!(err.is_timeout());
        assert!(err.status().is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn json_body_on_post_gets_json_headers() {
        let (fetch, seen) = mock(|_| json_response(200, "{}"));
        fetch
            .request(
                "/echo",
                FetchOptions::new()
                    .method(Method::POST)
                    .body(json!({ "num": 42 }))
                    .extra("cache", "no-store"),
            )
            .await
            .expect("request must succeed");

        let seen = seen.lock().expect("log lock");
        let request = &seen[0];
        assert_eq!(request.headers[header::CONTENT_TYPE], "application/json");
        assert_eq!(request.headers[header::ACCEPT], "application/json");
        assert!(matches!(&request.body, Some(TransportBody::Text(text)) if text == r#"{"num":42}"#));
        assert_eq!(request.extra.get("cache"), Some(&json!("no-store")));
    }

    #[tokio::test]
    async fn stream_body_is_half_duplex_and_not_retried() {
        let (fetch, seen) = mock(|_| json_response(503, "{}"));
        let chunks = vec![Ok::<_, BoxError>(Bytes::from_static(b"chunk"))];
        fetch
            .request(
                "/upload",
                FetchOptions::new()
                    .method(Method::PUT)
                    .retry(3)
                    .body(RequestBody::stream(futures::stream::iter(chunks))),
            )
            .await
            .expect_err("503 must fail");

        let seen = seen.lock().expect("log lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].duplex, Some(crate::Duplex::Half));
    }

    #[tokio::test]
    async fn no_body_for_head_and_204() {
        let (fetch, _) = mock(|request| {
            if request.method == Method::HEAD {
                json_response(200, r#"{"ignored":true}"#)
            } else {
                Ok(TransportResponse::new(StatusCode::NO_CONTENT))
            }
        });

        let data = fetch
            .request("/", FetchOptions::new().method(Method::HEAD))
            .await
            .expect("HEAD must succeed");
        assert!(data.is_none());

        let data = fetch
            .request("/204", FetchOptions::new())
            .await
            .expect("204 must succeed");
        assert!(data.is_none());
    }

    #[tokio::test]
    async fn decoding_overrides() {
        let (fetch, _) = mock(|_| json_response(200, r#"{"num":42}"#));

        let data = fetch
            .request("/", FetchOptions::new().response_type(ResponseType::Text))
            .await
            .expect("request must succeed");
        assert!(matches!(data, Some(ResponseData::Text(ref text)) if text == r#"{"num":42}"#));

        let data = fetch
            .request(
                "/",
                FetchOptions::new().parse_response(|text| json!({ "raw": text })),
            )
            .await
            .expect("request must succeed");
        assert_eq!(
            data.as_ref().and_then(ResponseData::as_json),
            Some(&json!({ "raw": r#"{"num":42}"# }))
        );
    }

    #[tokio::test]
    async fn hooks_run_per_phase() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let hook = |name: &'static str| {
            let calls = Arc::clone(&calls);
            Hook::sync(move |_| {
                calls.lock().expect("calls lock").push(name);
                Ok(())
            })
        };

        let (fetch, _) = mock(|_| json_response(404, r#"{"error":"missing"}"#));
        let err = fetch
            .request(
                "/404",
                FetchOptions::new()
                    .on_request(hook("request"))
                    .on_request_error(hook("request_error"))
                    .on_response(hook("response"))
                    .on_response_error(hook("response_error")),
            )
            .await
            .expect_err("404 must fail");

        assert_eq!(
            *calls.lock().expect("calls lock"),
            vec!["request", "response", "response_error"]
        );
        assert_eq!(err.message(), r#"[GET] "/404": 404 Not Found"#);
        assert_eq!(
            err.data().and_then(ResponseData::as_json),
            Some(&json!({ "error": "missing" }))
        );
    }

    #[tokio::test]
    async fn failing_request_hook_skips_transport() {
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        let (fetch, seen) = mock(|_| json_response(200, "{}"));
        let err = fetch
            .request(
                "/",
                FetchOptions::new()
                    .retry(0)
                    .on_request(Hook::sync(|_| Err("denied".into())))
                    .on_request_error(Hook::sync(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })),
            )
            .await
            .expect_err("request must fail");

        assert_eq!(hits(&seen), 0);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
        assert!(matches!(
            err.cause(),
            Some(Cause::Hook { phase: HookPhase::Request, .. })
        ));
    }

    #[tokio::test]
    async fn failing_response_hook_keeps_response() {
        let (fetch, _) = mock(|_| json_response(200, r#"{"num":42}"#));
        let err = fetch
            .request(
                "/",
                FetchOptions::new().on_response(Hook::sync(|_| Err("rejected".into()))),
            )
            .await
            .expect_err("request must fail");

        assert_eq!(err.status_code(), Some(200));
        assert_eq!(
            err.data().and_then(ResponseData::as_json),
            Some(&json!({ "num": 42 }))
        );
        assert!(err.message().ends_with("200 OK on_response hook failed: rejected"));
    }

    #[tokio::test]
    async fn request_hook_can_rewrite_options() {
        let (fetch, seen) = mock(|_| json_response(200, "{}"));
        fetch
            .request(
                "/search",
                FetchOptions::new().on_request(Hook::sync(|ctx| {
                    ctx.options.query.set("q", "rust");
                    ctx.options.headers.insert("x-hook", HeaderValue::from_static("1"));
                    Ok(())
                })),
            )
            .await
            .expect("request must succeed");

        let seen = seen.lock().expect("log lock");
        assert_eq!(seen[0].url, "/search?q=rust");
        assert_eq!(seen[0].headers["x-hook"], "1");
    }

    #[tokio::test]
    async fn ignore_response_error_returns_response() {
        let (fetch, _) = mock(|_| json_response(403, r#"{"denied":true}"#));
        let response = fetch
            .request_raw("/403", FetchOptions::new().ignore_response_error(true))
            .await
            .expect("ignored error must succeed");
        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert!(!response.ok());
    }

    #[tokio::test]
    async fn derived_defaults_do_not_leak() {
        let (fetch, seen) = mock(|_| json_response(200, "{}"));
        let first = fetch.with_defaults(
            FetchOptions::new()
                .try_header("x-instance", "first")
                .expect("valid header"),
        );
        let second = fetch.with_defaults(FetchOptions::new().base_url("http://second.test"));

        first
            .request("/a", FetchOptions::new())
            .await
            .expect("request must succeed");
        second
            .request("/b", FetchOptions::new())
            .await
            .expect("request must succeed");

        let seen = seen.lock().expect("log lock");
        assert_eq!(seen[0].url, "/a");
        assert_eq!(seen[0].headers["x-instance"], "first");
        assert_eq!(seen[1].url, "http://second.test/b");
        assert!(seen[1].headers.get("x-instance").is_none());
        assert!(fetch.defaults().headers.is_empty());
    }

    #[tokio::test]
    async fn prepared_request_keeps_method_and_headers() {
        let (fetch, seen) = mock(|_| json_response(200, "{}"));
        let prepared = PreparedRequest::new(Method::DELETE, "http://api.test/items/1")
            .header(header::AUTHORIZATION, HeaderValue::from_static("Bearer a"))
            .header(header::ACCEPT, HeaderValue::from_static("text/plain"));
        fetch
            .request(
                prepared,
                FetchOptions::new()
                    .base_url("http://ignored.test")
                    .header(header::ACCEPT, HeaderValue::from_static("application/json")),
            )
            .await
            .expect("request must succeed");

        let seen = seen.lock().expect("log lock");
        assert_eq!(seen[0].method, Method::DELETE);
        assert_eq!(seen[0].url, "http://api.test/items/1");
        assert_eq!(seen[0].headers[header::AUTHORIZATION], "Bearer a");
        assert_eq!(seen[0].headers[header::ACCEPT], "application/json");
    }

    #[tokio::test]
    async fn prepared_request_content_type_survives_json_encoding() {
        let (fetch, seen) = mock(|_| json_response(200, "{}"));
        let prepared = PreparedRequest::new(Method::POST, "http://api.test/notes")
            .header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        fetch
            .request(prepared, FetchOptions::new().body("hello"))
            .await
            .expect("request must succeed");

        let seen = seen.lock().expect("log lock");
        let values: Vec<_> = seen[0].headers.get_all(header::CONTENT_TYPE).iter().collect();
        assert_eq!(values, ["text/plain"]);
        assert_eq!(seen[0].headers[header::ACCEPT], "application/json");
        assert!(matches!(&seen[0].body, Some(TransportBody::Text(text)) if text == "hello"));
    }

    #[tokio::test]
    async fn empty_overrides_behave_like_the_parent() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&calls);
        let (fetch, seen) = mock(|_| json_response(503, "{}"));
        let parent = fetch.with_defaults(
            FetchOptions::new()
                .base_url("http://api.test")
                .header(header::AUTHORIZATION, HeaderValue::from_static("Bearer a"))
                .query("v", 2)
                .retry(2)
                .on_request(Hook::sync(move |ctx| {
                    log.lock().expect("calls lock").push(ctx.request.to_string());
                    Ok(())
                })),
        );
        let derived = parent.with_defaults(FetchOptions::new());

        let run = |client: Fetch| async move {
            client
                .request("/items", FetchOptions::new().query("page", 1))
                .await
                .expect_err("503 must fail")
                .message()
                .to_owned()
        };
        let parent_message = run(parent).await;
        let parent_calls = std::mem::take(&mut *calls.lock().expect("calls lock"));
        let parent_seen = std::mem::take(&mut *seen.lock().expect("log lock"));
        let derived_message = run(derived).await;
        let derived_calls = calls.lock().expect("calls lock").clone();
        let derived_seen = seen.lock().expect("log lock");

        let summary = |requests: &[TransportRequest]| {
            requests
                .iter()
                .map(|request| (request.method.clone(), request.url.clone(), request.headers.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(parent_seen.len(), 3);
        assert_eq!(summary(&parent_seen), summary(&derived_seen));
        assert_eq!(parent_calls.len(), 3);
        assert_eq!(parent_calls, derived_calls);
        assert_eq!(parent_message, derived_message);
    }

    #[tokio::test]
    async fn body_read_failure_is_retried_as_server_error() {
        let (fetch, seen) = mock(|_| {
            let chunks = vec![
                Ok::<_, BoxError>(Bytes::from_static(b"{\"partial\"")),
                Err("connection reset".into()),
            ];
            Ok(TransportResponse::new(StatusCode::OK)
                .with_body(ResponseBody::new(futures::stream::iter(chunks))))
        });
        let err = fetch
            .request("/flaky", FetchOptions::new())
            .await
            .expect_err("read must fail");

        assert_eq!(hits(&seen), 2);
        assert!(matches!(err.cause(), Some(Cause::Body { .. })));
        assert_eq!(err.status_code(), Some(200));
    }
}
