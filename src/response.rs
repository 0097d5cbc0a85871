//! Response model.
//!
//! A [`FetchResponse`] is what the transport returned plus the decoded `data`
//! slot filled in by the response decoder. Header lookup is
//! case-insensitive (`http::HeaderMap`).

use std::fmt;
use std::sync::{Mutex, PoisonError};

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use http::{header, HeaderMap, StatusCode};

use crate::body::ByteStream;
use crate::decode::ResponseData;
use crate::transport::TransportResponse;
use crate::BoxError;

/// Raw response body. Every consuming method takes `self`, so a body is
/// read at most once.
pub struct ResponseBody {
    stream: Mutex<ByteStream>,
}

impl ResponseBody {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
    {
        Self {
            stream: Mutex::new(stream.boxed()),
        }
    }

    pub fn empty() -> Self {
        Self::new(stream::empty())
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self::new(stream::once(async move { Ok(bytes) }))
    }

    /// Reads the whole body.
    pub async fn bytes(self) -> Result<Bytes, BoxError> {
        let mut stream = self.into_stream();
        let mut buffer = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }

    /// Reads the whole body as UTF-8, replacing invalid sequences.
    pub async fn text(self) -> Result<String, BoxError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn into_stream(self) -> ByteStream {
        self.stream
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResponseBody(..)")
    }
}

/// Response of one successful attempt.
#[derive(Debug)]
pub struct FetchResponse {
    /// Final URL reported by the transport.
    pub url: String,
    pub status: StatusCode,
    /// Reason phrase, e.g. `"Not Found"`.
    pub status_text: String,
    pub headers: HeaderMap,
    /// Decoded body. `None` for responses without a body (204, HEAD, ...).
    pub data: Option<ResponseData>,
    pub(crate) body: Option<ResponseBody>,
}

impl FetchResponse {
    pub(crate) fn from_transport(response: TransportResponse) -> Self {
        Self {
            url: response.url,
            status: response.status,
            status_text: response.status_text,
            headers: response.headers,
            data: None,
            body: Some(response.body),
        }
    }

    /// True for 2xx statuses.
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    pub fn data(&self) -> Option<&ResponseData> {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Option<ResponseData> {
        self.data
    }

    /// Body left unread by the decoder, if any.
    pub fn take_body(&mut self) -> Option<ResponseBody> {
        self.body.take()
    }
}
