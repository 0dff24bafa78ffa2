use std::borrow::Cow;
use std::ops::Index;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, LOCATION};
use http::{HeaderMap, StatusCode};
use serde_json::Value;
use url::Url;

use crate::error::HttpError;
use crate::request::HopState;

/// Maximum body preview carried by `HttpError::HttpStatus` (8KB).
pub const ERROR_BODY_PREVIEW_LIMIT: usize = 8 * 1024;

static NULL: Value = Value::Null;

/// A collected transport response, before decompression and parsing.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RawResponse {
    #[must_use]
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    #[must_use]
    pub fn location(&self) -> Option<&str> {
        self.headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .filter(|l| !l.trim().is_empty())
    }

    /// 3xx other than 304 Not Modified.
    #[must_use]
    pub fn is_redirect(&self) -> bool {
        self.status.is_redirection() && self.status != StatusCode::NOT_MODIFIED
    }
}

/// Result of [`crate::Request::perform`]: response metadata plus the parsed payload.
///
/// Compares equal to its parsed payload. A response without payload (204, 304, empty
/// body, literal `null`) is nil-equivalent: it equals `Value::Null` and `None`, while
/// `code()`, `body()` and `headers()` stay available.
#[derive(Debug, Clone)]
pub struct Response {
    request: HopState,
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    parsed: Option<Value>,
}

impl Response {
    pub(crate) fn new(request: HopState, raw: RawResponse, parsed: Option<Value>) -> Self {
        Self {
            request,
            status: raw.status,
            headers: raw.headers,
            body: raw.body,
            parsed,
        }
    }

    /// Numeric status code
    #[must_use]
    pub fn code(&self) -> u16 {
        self.status.as_u16()
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response body after decompression
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body as UTF-8, with invalid sequences replaced
    #[must_use]
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of `name`, if it is valid visible ASCII
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Every value of `name`, in received order
    #[must_use]
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header(CONTENT_TYPE.as_str())
    }

    #[must_use]
    pub fn parsed_response(&self) -> Option<&Value> {
        self.parsed.as_ref()
    }

    #[must_use]
    pub fn into_parsed_response(self) -> Option<Value> {
        self.parsed
    }

    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.parsed.is_none()
    }

    /// Look up `key` in an object payload
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.parsed.as_ref().and_then(|v| v.get(key))
    }

    /// Hop state that produced this response
    #[must_use]
    pub fn request(&self) -> &HopState {
        &self.request
    }

    /// Final URI after redirects
    #[must_use]
    pub fn uri(&self) -> &Url {
        &self.request.uri
    }

    #[must_use]
    pub fn is_informational(&self) -> bool {
        self.status.is_informational()
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    #[must_use]
    pub fn is_redirection(&self) -> bool {
        self.status.is_redirection()
    }

    #[must_use]
    pub fn is_client_error(&self) -> bool {
        self.status.is_client_error()
    }

    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.status.is_server_error()
    }

    /// Return `self` for 2xx, otherwise an error carrying a body preview.
    ///
    /// # Errors
    /// Returns `HttpError::HttpStatus` if the status is not 2xx.
    pub fn error_for_status(self) -> Result<Self, HttpError> {
        if self.status.is_success() {
            return Ok(self);
        }
        let preview = &self.body[..self.body.len().min(ERROR_BODY_PREVIEW_LIMIT)];
        Err(HttpError::HttpStatus {
            status: self.status,
            body_preview: String::from_utf8_lossy(preview).into_owned(),
            content_type: self.content_type().map(str::to_owned),
        })
    }
}

impl PartialEq<Value> for Response {
    fn eq(&self, other: &Value) -> bool {
        self.parsed.as_ref().unwrap_or(&NULL) == other
    }
}

impl PartialEq<Option<Value>> for Response {
    fn eq(&self, other: &Option<Value>) -> bool {
        match (&self.parsed, other) {
            (None, None | Some(Value::Null)) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl Index<&str> for Response {
    type Output = Value;

    fn index(&self, key: &str) -> &Value {
        self.get(key).unwrap_or(&NULL)
    }
}

impl Index<usize> for Response {
    type Output = Value;

    fn index(&self, idx: usize) -> &Value {
        self.parsed
            .as_ref()
            .and_then(|v| v.get(idx))
            .unwrap_or(&NULL)
    }
}
