use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use http::{header, HeaderMap, HeaderValue, Method};
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::BoxError;

/// Boxed stream of body chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, BoxError>>;

/// Request body that can be consumed once.
///
/// Clones share the same underlying stream.
#[derive(Clone)]
pub struct StreamBody(Arc<Mutex<Option<ByteStream>>>);

impl StreamBody {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
    {
        Self(Arc::new(Mutex::new(Some(stream.boxed()))))
    }

    /// Returns true once the stream has been handed to a transport.
    pub fn is_consumed(&self) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    pub(crate) fn take(&self) -> Option<ByteStream> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl fmt::Debug for StreamBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamBody")
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

/// Request body as supplied by the caller.
#[derive(Clone, Debug)]
pub enum RequestBody {
    /// Structured value, serialized to JSON text before sending.
    Json(JsonValue),
    /// Text sent as-is. Treated as already-serialized JSON on payload methods.
    Text(String),
    /// Raw bytes, passed through.
    Bytes(Bytes),
    /// `application/x-www-form-urlencoded` pairs, passed through.
    Form(Vec<(String, String)>),
    /// Streamed body, sent half-duplex.
    Stream(StreamBody),
}

impl RequestBody {
    /// Serializes any `Serialize` value into a JSON body.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Self::Json)
    }

    pub fn form<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::Form(
            pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
    {
        Self::Stream(StreamBody::new(stream))
    }

    /// Whether the body gets the JSON treatment on payload methods.
    pub fn is_json_serializable(&self) -> bool {
        matches!(self, Self::Json(_) | Self::Text(_))
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    pub(crate) fn to_transport(&self) -> Result<TransportBody, BodyConsumed> {
        Ok(match self {
            Self::Json(value) => TransportBody::Text(value.to_string()),
            Self::Text(text) => TransportBody::Text(text.clone()),
            Self::Bytes(bytes) => TransportBody::Bytes(bytes.clone()),
            Self::Form(pairs) => TransportBody::Form(pairs.clone()),
            Self::Stream(stream) => TransportBody::Stream(stream.take().ok_or(BodyConsumed)?),
        })
    }
}

impl From<JsonValue> for RequestBody {
    fn from(value: JsonValue) -> Self {
        Self::Json(value)
    }
}

impl From<String> for RequestBody {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for RequestBody {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<Bytes> for RequestBody {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value.into())
    }
}

/// A stream body was sent once already and cannot be replayed.
#[derive(Debug, thiserror::Error)]
#[error("request body stream was already consumed")]
pub struct BodyConsumed;

/// Body handed to the transport after encoding.
pub enum TransportBody {
    Text(String),
    Bytes(Bytes),
    Form(Vec<(String, String)>),
    Stream(ByteStream),
}

impl fmt::Debug for TransportBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(bytes).finish(),
            Self::Form(pairs) => f.debug_tuple("Form").field(pairs).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Request duplex mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Duplex {
    Half,
}

/// True for methods that conventionally carry a body.
pub fn is_payload_method(method: &Method) -> bool {
    matches!(method.as_str(), "POST" | "PUT" | "PATCH" | "DELETE")
}

/// Stringifies JSON bodies on payload methods and fills in JSON
/// `content-type` / `accept` headers when neither `headers` nor `preset`
/// (headers already attached to the request) carries them.
pub(crate) fn encode_json_body(
    method: &Method,
    body: &mut Option<RequestBody>,
    headers: &mut HeaderMap,
    preset: &HeaderMap,
) {
    let Some(current) = body.as_mut() else {
        return;
    };
    if !is_payload_method(method) || !current.is_json_serializable() {
        return;
    }

    if let RequestBody::Json(value) = current {
        *current = RequestBody::Text(value.to_string());
    }

    let json = HeaderValue::from_static("application/json");
    for name in [header::CONTENT_TYPE, header::ACCEPT] {
        if !headers.contains_key(&name) && !preset.contains_key(&name) {
            headers.insert(name, json.clone());
        }
    }
}

/// Stream bodies default to half-duplex.
pub(crate) fn duplex_for(body: Option<&RequestBody>, requested: Option<Duplex>) -> Option<Duplex> {
    requested.or_else(|| body.filter(|body| body.is_stream()).map(|_| Duplex::Half))
}
