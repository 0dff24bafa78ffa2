use std::io::Read;

use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use http::header::CONTENT_ENCODING;

use crate::error::HttpError;
use crate::response::RawResponse;

/// Inflates gzip and deflate response bodies before parsing.
///
/// Only the exact tokens `gzip`, `x-gzip` and `deflate` are recognised. Any other
/// `Content-Encoding` leaves the response untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeflationHandler {
    max_body_size: Option<usize>,
}

impl DeflationHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the size of inflated output.
    #[must_use]
    pub fn with_max_body_size(mut self, limit: usize) -> Self {
        self.max_body_size = Some(limit);
        self
    }

    /// Decode `response.body` in place and return the decoded bytes.
    ///
    /// On success `Content-Encoding` is removed from the response headers.
    ///
    /// # Errors
    /// Returns `HttpError::Decompression` for a corrupt stream and
    /// `HttpError::BodyTooLarge` if the inflated body exceeds the configured limit.
    pub fn decode(&self, response: &mut RawResponse) -> Result<Bytes, HttpError> {
        let Some(encoding) = response
            .headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
        else {
            return Ok(response.body.clone());
        };

        if !matches!(encoding.as_str(), "gzip" | "x-gzip" | "deflate") {
            return Ok(response.body.clone());
        }
        if response.body.is_empty() {
            response.headers.remove(CONTENT_ENCODING);
            return Ok(Bytes::new());
        }

        let decoded = if encoding == "deflate" {
            self.inflate(&encoding, ZlibDecoder::new(response.body.as_ref()))
                .or_else(|_| {
                    tracing::trace!("zlib header missing, retrying as raw deflate");
                    self.inflate(&encoding, DeflateDecoder::new(response.body.as_ref()))
                })?
        } else {
            self.inflate(&encoding, GzDecoder::new(response.body.as_ref()))?
        };

        tracing::debug!(
            encoding = %encoding,
            compressed = response.body.len(),
            decompressed = decoded.len(),
            "decompressed response body"
        );

        response.headers.remove(CONTENT_ENCODING);
        response.body = decoded;
        Ok(response.body.clone())
    }

    fn inflate<R: Read>(&self, encoding: &str, reader: R) -> Result<Bytes, HttpError> {
        let mut out = Vec::new();
        match self.max_body_size {
            Some(limit) => {
                let read = reader
                    .take(u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1))
                    .read_to_end(&mut out)
                    .map_err(|source| decompression_error(encoding, source))?;
                if read > limit {
                    return Err(HttpError::BodyTooLarge { limit });
                }
            }
            None => {
                let mut reader = reader;
                reader
                    .read_to_end(&mut out)
                    .map_err(|source| decompression_error(encoding, source))?;
            }
        }
        Ok(Bytes::from(out))
    }
}

fn decompression_error(encoding: &str, source: std::io::Error) -> HttpError {
    HttpError::Decompression {
        encoding: encoding.to_owned(),
        source,
    }
}
