use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use http::{HeaderMap, Request, Version};
use tower::{Layer, Service};

use crate::config::DebugSink;
use crate::response::RawResponse;

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

fn write_headers(sink: &DebugSink, arrow: &str, headers: &HeaderMap) {
    for (name, value) in headers {
        if value.is_sensitive() {
            sink.line(&format!("{arrow} \"{name}: [REDACTED]\""));
        } else {
            let value = String::from_utf8_lossy(value.as_bytes());
            sink.line(&format!("{arrow} \"{name}: {value}\""));
        }
    }
}

/// Tower layer copying each request/response head into the `debug_output` sink.
///
/// Outgoing lines start with `->`, incoming with `<-`. Sensitive header values
/// (credentials) are redacted. With no sink the layer is a pass-through.
#[derive(Clone, Default)]
pub struct DebugOutputLayer {
    sink: Option<DebugSink>,
}

impl DebugOutputLayer {
    #[must_use]
    pub fn new(sink: Option<DebugSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for DebugOutputLayer {
    type Service = DebugOutputService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DebugOutputService {
            inner,
            sink: self.sink.clone(),
        }
    }
}

#[derive(Clone)]
pub struct DebugOutputService<S> {
    inner: S,
    sink: Option<DebugSink>,
}

impl<S, ReqBody> Service<Request<ReqBody>> for DebugOutputService<S>
where
    S: Service<Request<ReqBody>, Response = RawResponse>,
    S::Future: Send + 'static,
{
    type Response = RawResponse;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<RawResponse, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let Some(sink) = self.sink.clone() else {
            return Box::pin(self.inner.call(req));
        };

        let target = req
            .uri()
            .path_and_query()
            .map_or("/", http::uri::PathAndQuery::as_str);
        sink.line(&format!(
            "-> \"{} {target} {}\"",
            req.method(),
            version_str(req.version())
        ));
        write_headers(&sink, "->", req.headers());

        let future = self.inner.call(req);
        Box::pin(async move {
            let response = future.await?;
            let reason = response.status.canonical_reason().unwrap_or_default();
            sink.line(&format!(
                "<- \"HTTP/1.1 {} {reason}\"",
                response.status.as_u16()
            ));
            write_headers(&sink, "<-", &response.headers);
            sink.line(&format!("<- {} bytes", response.body.len()));
            Ok(response)
        })
    }
}
