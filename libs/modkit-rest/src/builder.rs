use crate::config::{Body, Credentials, DebugSink, ProxyConfig, Query, RequestOptions, TlsRootConfig};
use crate::connection::Connect;
use crate::error::HttpError;
use crate::parser::{Format, Parser};
use crate::query::QueryNormalizer;
use crate::request::Request;
use crate::response::Response;
use http::Method;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;

/// Fluent construction of a [`Request`] over [`RequestOptions`].
pub struct RequestBuilder {
    method: Method,
    path: String,
    options: RequestOptions,
    connector: Option<Arc<dyn Connect>>,
}

impl RequestBuilder {
    /// Create a builder for `method` on `path` with default options
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            options: RequestOptions::default(),
            connector: None,
        }
    }

    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    #[must_use]
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    #[must_use]
    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    #[must_use]
    pub fn head(path: impl Into<String>) -> Self {
        Self::new(Method::HEAD, path)
    }

    #[must_use]
    pub fn options(path: impl Into<String>) -> Self {
        Self::new(Method::OPTIONS, path)
    }

    /// Replace all options, e.g. ones loaded with [`RequestOptions::from_yaml`]
    #[must_use]
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the prefix for a relative path
    #[must_use]
    pub fn base_uri(mut self, base_uri: impl Into<String>) -> Self {
        self.options.base_uri = Some(base_uri.into());
        self
    }

    /// Force the body format instead of sniffing the content type
    #[must_use]
    pub fn format(mut self, format: Format) -> Self {
        self.options.format = Some(format);
        self
    }

    /// Replace the built-in parsers
    ///
    /// A custom parser disables content-type sniffing: it receives the explicit
    /// `format` option or `None`.
    #[must_use]
    pub fn parser(mut self, parser: Parser) -> Self {
        self.options.parser = parser;
        self
    }

    #[must_use]
    pub fn query(mut self, query: impl Into<Query>) -> Self {
        self.options.query = Some(query.into());
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.options.body = Some(body.into());
        self
    }

    /// Add a request header; a later call with the same name replaces the value
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.options.basic_auth = Some(Credentials::new(username, password));
        self
    }

    /// Answer a digest challenge; costs one extra `HEAD` round-trip per hop
    #[must_use]
    pub fn digest_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.options.digest_auth = Some(Credentials::new(username, password));
        self
    }

    /// Client certificate and key in PEM form, with an optional key password
    ///
    /// Only used on `https` hops.
    #[must_use]
    pub fn pem(mut self, pem: impl Into<String>, password: Option<String>) -> Self {
        self.options.pem = Some(pem.into());
        self.options.pem_password = password.map(SecretString::from);
        self
    }

    /// Verify the server certificate chain (default: true)
    #[must_use]
    pub fn verify(mut self, verify: bool) -> Self {
        self.options.verify = verify;
        self
    }

    #[must_use]
    pub fn tls_roots(mut self, roots: TlsRootConfig) -> Self {
        self.options.tls_roots = roots;
        self
    }

    /// Set the connect and read timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.options.proxy = Some(proxy);
        self
    }

    /// Write a wire transcript of every hop to `sink`
    #[must_use]
    pub fn debug_output(mut self, sink: DebugSink) -> Self {
        self.options.debug_output = Some(sink);
        self
    }

    /// Follow 3xx responses carrying a `Location` header (default: true)
    #[must_use]
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.options.redirects.follow_redirects = follow;
        self
    }

    /// Set the redirect hop bound (default: 5)
    #[must_use]
    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.options.redirects.max_redirects = max_redirects;
        self
    }

    /// Keep the original verb when following 301/302
    #[must_use]
    pub fn maintain_method_across_redirects(mut self, maintain: bool) -> Self {
        self.options.redirects.maintain_method_across_redirects = maintain;
        self
    }

    /// Together with `maintain_method_across_redirects`, keep the verb on 303 too
    #[must_use]
    pub fn resend_on_redirect(mut self, resend: bool) -> Self {
        self.options.redirects.resend_on_redirect = resend;
        self
    }

    #[must_use]
    pub fn query_string_normalizer(mut self, normalizer: QueryNormalizer) -> Self {
        self.options.query_string_normalizer = normalizer;
        self
    }

    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.options.user_agent = user_agent.into();
        self
    }

    /// Set the maximum response body size, after decompression
    #[must_use]
    pub fn max_body_size(mut self, size: usize) -> Self {
        self.options.max_body_size = size;
        self
    }

    /// Use a custom transport for every hop
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connect>) -> Self {
        self.connector = Some(connector);
        self
    }

    #[must_use]
    pub fn build(self) -> Request {
        let request = Request::new(self.method, self.path, self.options);
        match self.connector {
            Some(connector) => request.with_connector(connector),
            None => request,
        }
    }

    /// Build and execute the request
    ///
    /// # Errors
    /// Returns any error from [`Request::perform`]
    pub async fn perform(self) -> Result<Response, HttpError> {
        self.build().perform().await
    }
}
