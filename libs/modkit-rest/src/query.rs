//! Query-string and form-body encoding.
//!
//! A [`QueryNormalizer`] turns a [`Params`] tree into a URL-encoded string. Two
//! built-in strategies exist:
//!
//! - [`QueryNormalizer::Rails`] (default): `tags[]=a&tags[]=b`, nested maps as
//!   `user[name]=bob`, nil values as `key=`.
//! - [`QueryNormalizer::Flat`]: `tags=a&tags=b`, nil values as a bare `key`.
//!
//! Keys are emitted in sorted order. Values are percent-encoded with everything
//! except RFC 3986 unreserved characters escaped, so spaces become `%20` and
//! `&` inside a value becomes `%26`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

/// Ordered parameter map used for query strings and form bodies.
pub type Params = BTreeMap<String, ParamValue>;

/// A single parameter value: scalar, nil, list, or nested map.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "serde_json::Value")]
pub enum ParamValue {
    Null,
    Scalar(String),
    List(Vec<ParamValue>),
    Map(Params),
}

impl From<serde_json::Value> for ParamValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ParamValue::Null,
            serde_json::Value::Bool(b) => ParamValue::Scalar(b.to_string()),
            serde_json::Value::Number(n) => ParamValue::Scalar(n.to_string()),
            serde_json::Value::String(s) => ParamValue::Scalar(s),
            serde_json::Value::Array(items) => {
                ParamValue::List(items.into_iter().map(ParamValue::from).collect())
            }
            serde_json::Value::Object(map) => ParamValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, ParamValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Scalar(value.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Scalar(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Scalar(value.to_string())
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Scalar(value.to_string())
    }
}

impl<T: Into<ParamValue>> From<Vec<T>> for ParamValue {
    fn from(values: Vec<T>) -> Self {
        ParamValue::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(ParamValue::Null, Into::into)
    }
}

impl From<Params> for ParamValue {
    fn from(value: Params) -> Self {
        ParamValue::Map(value)
    }
}

/// Build a [`Params`] map from `(key, value)` pairs.
#[must_use]
pub fn params<K, V, I>(pairs: I) -> Params
where
    K: Into<String>,
    V: Into<ParamValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Signature of a caller-supplied normalizer.
pub type NormalizerFn = dyn Fn(&Params) -> String + Send + Sync;

/// Strategy converting a [`Params`] tree into a URL-encoded string.
#[derive(Clone, Default)]
pub enum QueryNormalizer {
    /// Bracketed array and nested-map syntax (`key[]=v`, `key[sub]=v`)
    #[default]
    Rails,
    /// Repeated keys without brackets (`key=v1&key=v2`), bare `key` for nil
    Flat,
    /// Caller-supplied function
    Custom(Arc<NormalizerFn>),
}

impl QueryNormalizer {
    /// Wrap a closure as a custom normalizer.
    #[must_use]
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Params) -> String + Send + Sync + 'static,
    {
        QueryNormalizer::Custom(Arc::new(f))
    }

    /// Encode `params` with this strategy.
    #[must_use]
    pub fn normalize(&self, params: &Params) -> String {
        match self {
            QueryNormalizer::Rails => to_params(params),
            QueryNormalizer::Flat => flat_params(params),
            QueryNormalizer::Custom(f) => f(params),
        }
    }
}

impl fmt::Debug for QueryNormalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryNormalizer::Rails => f.write_str("Rails"),
            QueryNormalizer::Flat => f.write_str("Flat"),
            QueryNormalizer::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Encode `params` using `normalizer`.
#[must_use]
pub fn encode_query(params: &Params, normalizer: &QueryNormalizer) -> String {
    normalizer.normalize(params)
}

fn encode(s: &str) -> std::borrow::Cow<'_, str> {
    urlencoding::encode(s)
}

fn to_params(params: &Params) -> String {
    let mut pairs = Vec::new();
    for (key, value) in params {
        normalize_param(&encode(key), value, &mut pairs);
    }
    pairs.join("&")
}

/// Push `key=value` pairs for one (possibly nested) parameter. `key` is already encoded.
fn normalize_param(key: &str, value: &ParamValue, pairs: &mut Vec<String>) {
    match value {
        ParamValue::Null => pairs.push(format!("{key}=")),
        ParamValue::Scalar(s) => pairs.push(format!("{key}={}", encode(s))),
        ParamValue::Map(map) => {
            for (sub, v) in map {
                normalize_param(&format!("{key}[{}]", encode(sub)), v, pairs);
            }
        }
        ParamValue::List(items) => {
            for item in items {
                match item {
                    ParamValue::Map(map) => {
                        for (sub, v) in map {
                            normalize_param(&format!("{key}[][{}]", encode(sub)), v, pairs);
                        }
                    }
                    ParamValue::List(_) => normalize_param(&format!("{key}[]"), item, pairs),
                    ParamValue::Null => pairs.push(format!("{key}[]=")),
                    ParamValue::Scalar(s) => pairs.push(format!("{key}[]={}", encode(s))),
                }
            }
        }
    }
}

fn flat_params(params: &Params) -> String {
    let mut pairs = Vec::new();
    for (key, value) in params {
        let k = encode(key);
        match value {
            ParamValue::Null => pairs.push(k.into_owned()),
            ParamValue::Scalar(s) => pairs.push(format!("{k}={}", encode(s))),
            ParamValue::List(items) => {
                for item in items {
                    match item {
                        ParamValue::Scalar(s) => pairs.push(format!("{k}={}", encode(s))),
                        ParamValue::Null => pairs.push(format!("{k}=")),
                        nested => normalize_param(&k, nested, &mut pairs),
                    }
                }
            }
            ParamValue::Map(_) => normalize_param(&k, value, &mut pairs),
        }
    }
    pairs.join("&")
}
