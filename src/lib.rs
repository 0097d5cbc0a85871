//! `hookfetch` is an async fetch layer over a pluggable HTTP transport.
//!
//! On top of a bare `transport(request) -> response` primitive it adds:
//! - base URL and query composition ([`with_base`], [`with_query`])
//! - JSON request bodies and content-type driven response decoding
//! - retry with configurable budget, status codes and delay
//! - timeouts and caller cancellation
//! - lifecycle hooks ([`Hook`])
//! - normalized errors ([`FetchError`])
//!
//! The entry point is [`Fetch::request`].

mod body;
mod client;
mod context;
mod decode;
mod error;
mod hooks;
mod options;
mod response;
mod transport;
mod url;

#[cfg(feature = "path-client")]
pub mod path;

pub use body::{is_payload_method, ByteStream, Duplex, RequestBody, StreamBody, TransportBody};
pub use client::Fetch;
pub use context::{FetchContext, FetchRequest, PreparedRequest};
pub use decode::{detect_response_type, parse_json_lossy, Blob, ResponseData, ResponseType};
pub use error::{BoxError, Cause, FetchError};
pub use hooks::{Hook, HookOrder, HookPhase, HookResult, Hooks};
pub use options::{
    FetchOptions, ParseResponse, Retry, RetryDelay, RetryDelayFn, RetryPredicate,
    DEFAULT_RETRY_STATUS_CODES,
};
pub use response::{FetchResponse, ResponseBody};
pub use transport::{ReqwestTransport, Transport, TransportRequest, TransportResponse};
pub use crate::url::{join_url, with_base, with_query, QueryParams, QueryValue};

#[cfg(feature = "path-client")]
pub use path::{Endpoint, PathClient, PathEntry};

pub type Result<T> = std::result::Result<T, FetchError>;
