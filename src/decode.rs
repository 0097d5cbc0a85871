use bytes::Bytes;
use http::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::options::{FetchOptions, ParseResponse};
use crate::response::ResponseBody;
use crate::BoxError;

/// How a response body is decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResponseType {
    Json,
    Text,
    Blob,
    ArrayBuffer,
    Stream,
}

const TEXT_TYPES: [&str; 4] = [
    "image/svg",
    "application/xml",
    "application/xhtml",
    "application/html",
];

/// Picks a decode strategy from a `content-type` header value.
///
/// Missing or empty content types decode as JSON.
pub fn detect_response_type(content_type: &str) -> ResponseType {
    if content_type.is_empty() {
        return ResponseType::Json;
    }

    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if is_json_media_type(&essence) {
        ResponseType::Json
    } else if essence.starts_with("text/") || TEXT_TYPES.contains(&essence.as_str()) {
        ResponseType::Text
    } else {
        ResponseType::Blob
    }
}

/// `application/json` or `application/<suffix>+json`.
fn is_json_media_type(essence: &str) -> bool {
    let Some(subtype) = essence.strip_prefix("application/") else {
        return false;
    };
    if subtype == "json" {
        return true;
    }
    subtype.strip_suffix("+json").is_some_and(|prefix| {
        prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_!#$%&*`-.^~".contains(c))
    })
}

/// Statuses that never carry a body, plus `HEAD` requests.
pub(crate) fn has_body(status: StatusCode, method: &Method) -> bool {
    !matches!(status.as_u16(), 101 | 204 | 205 | 304) && method != Method::HEAD
}

/// Parses JSON, falling back to the raw text as a JSON string.
pub fn parse_json_lossy(text: &str) -> JsonValue {
    serde_json::from_str(text).unwrap_or_else(|_| JsonValue::String(text.to_owned()))
}

/// Binary body together with its declared media type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

/// Decoded response body.
#[derive(Debug)]
pub enum ResponseData {
    Json(JsonValue),
    Text(String),
    Blob(Blob),
    Bytes(Bytes),
    /// Unconsumed body handle.
    Stream(ResponseBody),
}

impl ResponseData {
    pub fn response_type(&self) -> ResponseType {
        match self {
            Self::Json(_) => ResponseType::Json,
            Self::Text(_) => ResponseType::Text,
            Self::Blob(_) => ResponseType::Blob,
            Self::Bytes(_) => ResponseType::ArrayBuffer,
            Self::Stream(_) => ResponseType::Stream,
        }
    }

    pub fn as_json(&self) -> Option<&JsonValue> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Text bodies, and JSON bodies that decoded to a plain string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) | Self::Json(JsonValue::String(text)) => Some(text),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Blob> {
        match self {
            Self::Blob(blob) => Some(blob),
            _ => None,
        }
    }

    /// Raw bytes of `Bytes` and `Blob` data.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            Self::Blob(blob) => Some(&blob.bytes),
            _ => None,
        }
    }

    pub fn into_stream(self) -> Option<ResponseBody> {
        match self {
            Self::Stream(body) => Some(body),
            _ => None,
        }
    }

    /// Deserializes JSON data, or text data holding JSON.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self {
            Self::Json(value) => T::deserialize(value),
            Self::Text(text) => serde_json::from_str(text),
            Self::Blob(Blob { bytes, .. }) | Self::Bytes(bytes) => serde_json::from_slice(bytes),
            Self::Stream(_) => Err(serde::de::Error::custom(
                "stream data must be read before deserializing",
            )),
        }
    }
}

/// Strategy for this response: `parse_response` forces JSON, an explicit
/// `response_type` beats sniffing.
pub(crate) fn resolve_response_type(options: &FetchOptions, content_type: Option<&str>) -> ResponseType {
    if options.parse_response.is_some() {
        return ResponseType::Json;
    }
    options
        .response_type
        .unwrap_or_else(|| detect_response_type(content_type.unwrap_or_default()))
}

pub(crate) async fn decode_body(
    body: ResponseBody,
    response_type: ResponseType,
    content_type: Option<String>,
    parse: Option<ParseResponse>,
) -> Result<ResponseData, BoxError> {
    Ok(match response_type {
        ResponseType::Json => {
            let text = body.text().await?;
            let value = match parse {
                Some(parse) => parse(&text),
                None => parse_json_lossy(&text),
            };
            ResponseData::Json(value)
        }
        ResponseType::Text => ResponseData::Text(body.text().await?),
        ResponseType::Blob => ResponseData::Blob(Blob {
            content_type,
            bytes: body.bytes().await?,
        }),
        ResponseType::ArrayBuffer => ResponseData::Bytes(body.bytes().await?),
        ResponseType::Stream => ResponseData::Stream(body),
    })
}
