//! URL composition: base + path joining and query-string merging.

use serde_json::{Map, Number, Value as JsonValue};
use url::form_urlencoded;

/// A single query parameter value.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryValue {
    /// Removes the key from the URL.
    Unset,
    /// Sets the key with an empty value.
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    /// Replaces the key with one entry per item.
    Array(Vec<JsonValue>),
    /// Serialized as a JSON string.
    Object(Map<String, JsonValue>),
}

fn number_to_string(value: &Number) -> String {
    // Integral floats render without a fraction, so `1.0` and `1` agree.
    match value.as_f64() {
        Some(float) if value.is_f64() && float.fract() == 0.0 && float.abs() < 1e15 => {
            (float as i64).to_string()
        }
        _ => value.to_string(),
    }
}

fn item_to_string(item: &JsonValue) -> String {
    match item {
        JsonValue::Null => String::new(),
        JsonValue::String(value) => value.clone(),
        JsonValue::Number(value) => number_to_string(value),
        other => other.to_string(),
    }
}

impl From<JsonValue> for QueryValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(value) => Self::Bool(value),
            JsonValue::Number(value) => Self::Number(value),
            JsonValue::String(value) => Self::String(value),
            JsonValue::Array(items) => Self::Array(items),
            JsonValue::Object(map) => Self::Object(map),
        }
    }
}

impl From<&str> for QueryValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for QueryValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for QueryValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

macro_rules! query_value_from_integer {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for QueryValue {
                fn from(value: $ty) -> Self {
                    Self::Number(value.into())
                }
            }
        )*
    };
}

query_value_from_integer!(i32, i64, u32, u64, usize);

impl From<f64> for QueryValue {
    fn from(value: f64) -> Self {
        Number::from_f64(value).map_or(Self::Null, Self::Number)
    }
}

impl<T: Into<JsonValue>> From<Vec<T>> for QueryValue {
    fn from(items: Vec<T>) -> Self {
        Self::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<QueryValue>> From<Option<T>> for QueryValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Unset, Into::into)
    }
}

/// Ordered query parameters with "set" semantics: a key appears once and
/// keeps its first insertion position.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryParams {
    entries: Vec<(String, QueryValue)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key`, replacing an existing value in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<QueryValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Chained variant of [`QueryParams::set`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&QueryValue> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn remove(&mut self, key: &str) -> Option<QueryValue> {
        let index = self.entries.iter().position(|(existing, _)| existing == key)?;
        Some(self.entries.remove(index).1)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &QueryValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Overlays `other` onto `self`; keys in `other` win.
    pub fn merge(&mut self, other: &QueryParams) {
        for (key, value) in &other.entries {
            self.set(key.clone(), value.clone());
        }
    }
}

impl<K, V> FromIterator<(K, V)> for QueryParams
where
    K: Into<String>,
    V: Into<QueryValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (key, value) in iter {
            params.set(key, value);
        }
        params
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for QueryParams
where
    K: Into<String>,
    V: Into<QueryValue>,
{
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl From<Map<String, JsonValue>> for QueryParams {
    fn from(map: Map<String, JsonValue>) -> Self {
        map.into_iter().collect()
    }
}

/// Joins `base` and `path` with exactly one slash between them.
///
/// Either side being empty or `/` yields the other side.
pub fn join_url(base: &str, path: &str) -> String {
    if base.is_empty() || base == "/" {
        return if path.is_empty() {
            "/".to_owned()
        } else {
            path.to_owned()
        };
    }
    if path.is_empty() || path == "/" {
        return base.to_owned();
    }

    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

/// Prefixes `input` with `base` unless it already starts with it.
pub fn with_base(input: &str, base: &str) -> String {
    if base.is_empty() || base == "/" {
        return input.to_owned();
    }

    let base = base.strip_suffix('/').unwrap_or(base);
    if input.starts_with(base) {
        return input.to_owned();
    }

    join_url(base, input)
}

/// Merges `query` into the query string of `input`.
///
/// Existing keys keep their position; new keys are appended in insertion
/// order. Applying the same params twice yields the same URL.
pub fn with_query(input: &str, query: &QueryParams) -> String {
    if query.is_empty() {
        return input.to_owned();
    }

    let (without_fragment, fragment) = match input.find('#') {
        Some(index) => input.split_at(index),
        None => (input, ""),
    };
    let (path, search) = match without_fragment.find('?') {
        Some(index) => (&without_fragment[..index], &without_fragment[index + 1..]),
        None => (without_fragment, ""),
    };

    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(search.as_bytes())
        .into_owned()
        .collect();

    for (key, value) in query.iter() {
        match value {
            QueryValue::Unset => pairs.retain(|(existing, _)| existing != key),
            QueryValue::Null => set_pair(&mut pairs, key, String::new()),
            QueryValue::Bool(value) => set_pair(&mut pairs, key, value.to_string()),
            QueryValue::Number(value) => set_pair(&mut pairs, key, number_to_string(value)),
            QueryValue::String(value) => set_pair(&mut pairs, key, value.clone()),
            QueryValue::Object(map) => {
                set_pair(&mut pairs, key, JsonValue::Object(map.clone()).to_string())
            }
            QueryValue::Array(items) => {
                let at = pairs
                    .iter()
                    .position(|(existing, _)| existing == key)
                    .unwrap_or(pairs.len());
                pairs.retain(|(existing, _)| existing != key);
                let at = at.min(pairs.len());
                let tail = pairs.split_off(at);
                pairs.extend(items.iter().map(|item| (key.to_owned(), item_to_string(item))));
                pairs.extend(tail);
            }
        }
    }

    let search = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(&pairs)
        .finish();

    if search.is_empty() {
        format!("{path}{fragment}")
    } else {
        format!("{path}?{search}{fragment}")
    }
}

fn set_pair(pairs: &mut Vec<(String, String)>, key: &str, value: String) {
    match pairs.iter().position(|(existing, _)| existing == key) {
        Some(first) => {
            pairs[first].1 = value;
            let mut index = 0;
            pairs.retain(|(existing, _)| {
                let keep = index <= first || existing != key;
                index += 1;
                keep
            });
        }
        None => pairs.push((key.to_owned(), value)),
    }
}
