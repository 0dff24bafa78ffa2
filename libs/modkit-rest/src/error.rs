use crate::parser::Format;
use std::time::Duration;
use thiserror::Error;

/// Classification of URL validation failures.
///
/// Provides programmatic matching for different failure modes without
/// relying on unstable error message strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidUriKind {
    /// URL could not be parsed (malformed syntax)
    ParseError,
    /// URL is missing required host/authority component
    MissingAuthority,
    /// URL is missing required scheme (http/https)
    MissingScheme,
    /// A redirect `Location` header could not be resolved against the current URI
    BadLocation,
}

/// REST client error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    /// Invalid option combination, detected before any network activity
    #[error("Invalid request options: {0}")]
    Configuration(String),

    /// Redirect chain exceeded the configured hop bound
    #[error("HTTP redirects too deep: more than {limit} hops (last status {status}, location '{location}')")]
    RedirectionTooDeep {
        /// Configured maximum number of redirects
        limit: usize,
        /// Status of the last redirect response received
        status: http::StatusCode,
        /// `Location` of the last redirect response received
        location: String,
    },

    /// Request building failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    /// Invalid header name
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Invalid header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// Connect or read timeout elapsed
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Transport error (network, connection, proxy tunnel, etc)
    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// TLS error (certificate material, root store, handshake setup)
    #[error("TLS error: {0}")]
    Tls(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Response body exceeded size limit
    #[error("Response body too large: limit {limit} bytes")]
    BodyTooLarge { limit: usize },

    /// Compressed body could not be inflated
    #[error("Failed to decompress '{encoding}' response body: {source}")]
    Decompression {
        encoding: String,
        #[source]
        source: std::io::Error,
    },

    /// Body is malformed for the resolved format (`None` for a custom parser)
    #[error(
        "Failed to parse response body as {}: {source}",
        .format.map_or("custom", Format::as_str)
    )]
    Parse {
        format: Option<Format>,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// HTTP non-2xx status, raised only by `Response::error_for_status`
    #[error("HTTP {status}: {body_preview}")]
    HttpStatus {
        status: http::StatusCode,
        body_preview: String,
        content_type: Option<String>,
    },

    /// Invalid URL (failed to parse)
    ///
    /// Use the `kind` field for programmatic matching. The `reason` field contains
    /// a diagnostic message intended for logging only.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUri {
        /// The URL that failed to parse
        url: String,
        /// Structured failure classification for programmatic matching
        kind: InvalidUriKind,
        /// Diagnostic message (unstable format, for logging only)
        reason: String,
    },

    /// URL scheme other than http/https
    #[error("URL scheme '{scheme}' not allowed: {reason}")]
    InvalidScheme {
        /// The URL scheme that was rejected
        scheme: String,
        /// Reason the scheme was rejected
        reason: String,
    },
}

impl HttpError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        HttpError::Configuration(message.into())
    }

    /// True for caller mistakes detected before any network activity.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, HttpError::Configuration(_))
    }
}

impl From<hyper::Error> for HttpError {
    fn from(err: hyper::Error) -> Self {
        HttpError::Transport(Box::new(err))
    }
}

impl From<hyper_util::client::legacy::Error> for HttpError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        HttpError::Transport(Box::new(err))
    }
}
