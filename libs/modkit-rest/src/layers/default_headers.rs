use crate::error::HttpError;
use http::header::{ACCEPT_ENCODING, USER_AGENT};
use http::{HeaderValue, Request};
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Encodings the deflation step understands.
pub const DEFAULT_ACCEPT_ENCODING: &str = "gzip, deflate";

/// Tower layer filling in `User-Agent` and `Accept-Encoding` when the caller left them unset
#[derive(Clone)]
pub struct DefaultHeadersLayer {
    user_agent: HeaderValue,
    accept_encoding: HeaderValue,
}

impl DefaultHeadersLayer {
    /// Create a layer sending `user_agent` by default
    ///
    /// # Errors
    /// Returns `HttpError::InvalidHeaderValue` if the user agent string is not valid
    pub fn try_new(user_agent: impl AsRef<str>) -> Result<Self, HttpError> {
        Ok(Self {
            user_agent: HeaderValue::from_str(user_agent.as_ref())?,
            accept_encoding: HeaderValue::from_static(DEFAULT_ACCEPT_ENCODING),
        })
    }
}

impl<S> Layer<S> for DefaultHeadersLayer {
    type Service = DefaultHeadersService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DefaultHeadersService {
            inner,
            user_agent: self.user_agent.clone(),
            accept_encoding: self.accept_encoding.clone(),
        }
    }
}

#[derive(Clone)]
pub struct DefaultHeadersService<S> {
    inner: S,
    user_agent: HeaderValue,
    accept_encoding: HeaderValue,
}

impl<S, ReqBody> Service<Request<ReqBody>> for DefaultHeadersService<S>
where
    S: Service<Request<ReqBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let headers = req.headers_mut();
        headers
            .entry(USER_AGENT)
            .or_insert_with(|| self.user_agent.clone());
        headers
            .entry(ACCEPT_ENCODING)
            .or_insert_with(|| self.accept_encoding.clone());
        self.inner.call(req)
    }
}
