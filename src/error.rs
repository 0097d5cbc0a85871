use std::time::Duration;

use http::{Method, StatusCode};

use crate::context::{FetchContext, FetchRequest};
use crate::decode::ResponseData;
use crate::hooks::HookPhase;
use crate::options::FetchOptions;
use crate::response::FetchResponse;

/// Error type used by transports and hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Why an attempt failed.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Cause {
    /// The transport could not complete the exchange.
    #[error("{source}")]
    Transport {
        #[source]
        source: BoxError,
    },
    /// Reading the response body failed.
    #[error("failed to read response body: {source}")]
    Body {
        #[source]
        source: BoxError,
    },
    /// The caller's cancellation token fired.
    #[error("This operation was aborted")]
    Aborted,
    /// The request-scoped timeout elapsed.
    #[error("The operation was aborted due to timeout ({}ms)", .0.as_millis())]
    Timeout(Duration),
    /// A lifecycle hook returned an error.
    #[error("{phase} hook failed: {source}")]
    Hook {
        phase: HookPhase,
        #[source]
        source: BoxError,
    },
}

impl Cause {
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Failures that happen before a usable response exists. These count as
    /// status 500 for retry decisions.
    pub(crate) fn is_transport_class(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::Body { .. }
                | Self::Timeout(_)
                | Self::Hook {
                    phase: HookPhase::Request | HookPhase::RequestError,
                    ..
                }
        )
    }
}

/// Normalized error returned by [`Fetch`](crate::Fetch) once retries are
/// exhausted or not applicable.
///
/// The request, resolved options, response (with decoded data) and cause are
/// captured when the error is raised.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct FetchError {
    message: String,
    request: FetchRequest,
    options: FetchOptions,
    response: Option<FetchResponse>,
    #[source]
    cause: Option<Cause>,
}

impl FetchError {
    /// Snapshots a failed attempt.
    pub fn from_context(ctx: FetchContext) -> Self {
        let FetchContext {
            request,
            options,
            response,
            error,
        } = ctx;

        let method = request
            .method()
            .or(options.method.as_ref())
            .unwrap_or(&Method::GET)
            .clone();
        let url = match request.url() {
            "" => "/",
            url => url,
        };
        let quoted = serde_json::to_string(url).unwrap_or_else(|_| format!("\"{url}\""));

        let mut message = format!("[{method}] {quoted}: ");
        match &response {
            Some(response) => {
                message.push_str(response.status.as_str());
                message.push(' ');
                message.push_str(&response.status_text);
            }
            None => message.push_str("<no response>"),
        }
        if let Some(cause) = &error {
            message.push(' ');
            message.push_str(&cause.to_string());
        }

        Self {
            message,
            request,
            options,
            response,
            cause: error,
        }
    }

    /// `[METHOD] "URL": STATUS TEXT` followed by the cause, if any.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Target of the failing attempt, composed when it got that far.
    pub fn request(&self) -> &FetchRequest {
        &self.request
    }

    /// Options the failing attempt ran with.
    pub fn options(&self) -> &FetchOptions {
        &self.options
    }

    /// Response of the failing attempt, if the transport returned one.
    pub fn response(&self) -> Option<&FetchResponse> {
        self.response.as_ref()
    }

    pub fn into_response(self) -> Option<FetchResponse> {
        self.response
    }

    /// Decoded body of the failing response.
    pub fn data(&self) -> Option<&ResponseData> {
        self.response.as_ref().and_then(FetchResponse::data)
    }

    /// Response status; `None` when no response was received.
    pub fn status(&self) -> Option<StatusCode> {
        self.response.as_ref().map(|response| response.status)
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status().map(|status| status.as_u16())
    }

    /// Reason phrase of the response.
    pub fn status_text(&self) -> Option<&str> {
        self.response
            .as_ref()
            .map(|response| response.status_text.as_str())
    }

    /// Alias of [`status_text`](Self::status_text).
    pub fn status_message(&self) -> Option<&str> {
        self.status_text()
    }

    /// Why the last attempt failed. Also the error's `source()`.
    pub fn cause(&self) -> Option<&Cause> {
        self.cause.as_ref()
    }

    /// Whether the last attempt hit its timeout.
    pub fn is_timeout(&self) -> bool {
        self.cause.as_ref().is_some_and(Cause::is_timeout)
    }

    /// Whether the caller's signal cancelled the request.
    pub fn is_aborted(&self) -> bool {
        self.cause.as_ref().is_some_and(Cause::is_abort)
    }
}
