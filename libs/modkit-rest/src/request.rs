//! Request execution.
//!
//! [`Request::perform`] runs an explicit hop loop. Each iteration carries an owned
//! [`HopState`] (uri, verb, headers, body); a redirect produces the next state with
//! [`HopState::follow`] instead of mutating shared request data. Every hop gets its
//! own [`Connection`] from the configured [`Connect`] implementation, released when
//! the iteration ends.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{
    AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HeaderName, SET_COOKIE,
};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use url::Url;

use crate::auth::AuthInjector;
use crate::builder::RequestBuilder;
use crate::config::{Body, Query, RedirectPolicy, RequestOptions};
use crate::connection::{Connect, TransportConnector, build_raw_request};
use crate::cookies::merge_cookies;
use crate::deflate::DeflationHandler;
use crate::error::{HttpError, InvalidUriKind};
use crate::parser::Format;
use crate::response::{RawResponse, Response};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// One hop of a request: what is sent, and how many redirects led here.
#[derive(Debug, Clone)]
pub struct HopState {
    pub method: Method,
    pub uri: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Redirects followed before this hop
    pub hops: usize,
}

impl HopState {
    #[must_use]
    pub fn new(method: Method, uri: Url) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: None,
            hops: 0,
        }
    }

    /// First hop: headers from the options and the encoded body.
    ///
    /// # Errors
    /// Returns `HttpError::InvalidHeaderName`/`InvalidHeaderValue` for unusable headers.
    pub fn initial(method: Method, uri: Url, options: &RequestOptions) -> Result<Self, HttpError> {
        let mut headers = header_map(&options.headers)?;
        let body = match &options.body {
            Some(Body::Params(params)) => {
                if !headers.contains_key(CONTENT_TYPE) {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE));
                }
                Some(Bytes::from(options.query_string_normalizer.normalize(params)))
            }
            Some(Body::Raw(raw)) => Some(Bytes::from(raw.clone())),
            None => None,
        };

        Ok(Self {
            method,
            uri,
            headers,
            body,
            hops: 0,
        })
    }

    /// Next hop after a redirect `response` pointing at `location`.
    ///
    /// `Set-Cookie` values are merged into `Cookie`. 307 and 308 keep verb and body.
    /// 303 switches to GET unless `maintain_method_across_redirects` and
    /// `resend_on_redirect` are both set; any other 3xx switches to GET unless
    /// `maintain_method_across_redirects` is set. HEAD is never rewritten.
    ///
    /// # Errors
    /// Returns `HttpError::InvalidUri` (`BadLocation`) if `location` does not resolve and
    /// `HttpError::InvalidScheme` if it resolves to anything but http or https.
    pub fn follow(
        &self,
        response: &RawResponse,
        location: &str,
        policy: &RedirectPolicy,
    ) -> Result<Self, HttpError> {
        let uri = self.uri.join(location).map_err(|e| HttpError::InvalidUri {
            url: location.to_owned(),
            kind: InvalidUriKind::BadLocation,
            reason: e.to_string(),
        })?;
        check_scheme(&uri)?;

        let mut headers = self.headers.clone();
        let merged = merge_cookies(
            headers.get(COOKIE).and_then(|v| v.to_str().ok()),
            response
                .headers
                .get_all(SET_COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok()),
        );
        if let Some(cookie) = merged {
            tracing::trace!(cookie_count = cookie.split("; ").count(), "merged redirect cookies");
            headers.insert(COOKIE, HeaderValue::from_str(&cookie)?);
        }

        let keep_method = match response.status {
            StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => true,
            StatusCode::SEE_OTHER => {
                policy.maintain_method_across_redirects && policy.resend_on_redirect
            }
            _ => policy.maintain_method_across_redirects,
        };

        let (method, body) = if keep_method || self.method == Method::HEAD {
            (self.method.clone(), self.body.clone())
        } else {
            headers.remove(CONTENT_TYPE);
            headers.remove(CONTENT_LENGTH);
            (Method::GET, None)
        };

        tracing::debug!(
            status = %response.status,
            from = %self.uri,
            to = %uri,
            method = %method,
            "following redirect"
        );

        Ok(Self {
            method,
            uri,
            headers,
            body,
            hops: self.hops + 1,
        })
    }
}

/// A request to one endpoint, executed with [`Request::perform`].
pub struct Request {
    http_method: Method,
    path: String,
    options: RequestOptions,
    connector: Arc<dyn Connect>,
    last_response: Option<RawResponse>,
}

impl Request {
    /// Create a request for `path`, resolved against `options.base_uri` when relative.
    #[must_use]
    pub fn new(http_method: Method, path: impl Into<String>, options: RequestOptions) -> Self {
        Self {
            http_method,
            path: path.into(),
            options,
            connector: Arc::new(TransportConnector),
            last_response: None,
        }
    }

    /// Start a fluent builder.
    #[must_use]
    pub fn builder(http_method: Method, path: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(http_method, path)
    }

    /// Replace the transport used for every hop.
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connect>) -> Self {
        self.connector = connector;
        self
    }

    #[must_use]
    pub fn http_method(&self) -> &Method {
        &self.http_method
    }

    pub fn set_http_method(&mut self, method: Method) {
        self.http_method = method;
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    /// Raw response of the most recent hop, including redirects.
    #[must_use]
    pub fn last_response(&self) -> Option<&RawResponse> {
        self.last_response.as_ref()
    }

    pub fn set_last_response(&mut self, response: RawResponse) {
        self.last_response = Some(response);
    }

    /// Target URI before execution, with the `query` option appended.
    ///
    /// An absolute path ignores `base_uri`. A `base_uri` without a scheme gets `http://`,
    /// or `https://` when its port is 443.
    ///
    /// # Errors
    /// Returns `HttpError::InvalidUri` if no absolute URI can be formed and
    /// `HttpError::InvalidScheme` for schemes other than http and https.
    pub fn uri(&self) -> Result<Url, HttpError> {
        let mut uri = match Url::parse(&self.path) {
            Ok(uri) if uri.has_host() => uri,
            _ => {
                let Some(base) = self.options.base_uri.as_deref() else {
                    return Err(HttpError::InvalidUri {
                        url: self.path.clone(),
                        kind: InvalidUriKind::MissingAuthority,
                        reason: "relative path without base_uri".to_owned(),
                    });
                };
                let joined = join_base(&normalize_base_uri(base), &self.path);
                Url::parse(&joined).map_err(|e| HttpError::InvalidUri {
                    url: joined.clone(),
                    kind: InvalidUriKind::ParseError,
                    reason: e.to_string(),
                })?
            }
        };
        check_scheme(&uri)?;

        let query = match &self.options.query {
            Some(Query::Params(params)) => self.options.query_string_normalizer.normalize(params),
            Some(Query::Raw(raw)) => raw.clone(),
            None => String::new(),
        };
        if !query.is_empty() {
            let combined = match uri.query() {
                Some(existing) if !existing.is_empty() => format!("{existing}&{query}"),
                _ => query,
            };
            uri.set_query(Some(&combined));
        }
        Ok(uri)
    }

    /// Explicit `format` option, else sniffed from the last response's content type.
    ///
    /// Sniffing is skipped entirely when a custom parser is set.
    #[must_use]
    pub fn format(&self) -> Option<Format> {
        self.options.format.or_else(|| {
            self.last_response
                .as_ref()
                .and_then(RawResponse::content_type)
                .and_then(|ct| self.options.parser.format_from_mimetype(ct))
        })
    }

    /// Execute the request, following redirects, and parse the terminal response.
    ///
    /// # Errors
    /// - `HttpError::Configuration` for invalid options, before any network activity
    /// - `HttpError::RedirectionTooDeep` when the redirect chain exceeds `max_redirects`
    /// - transport, TLS, timeout, decompression and parse errors as they occur
    pub async fn perform(&mut self) -> Result<Response, HttpError> {
        self.options.validate(&self.http_method)?;
        let auth = AuthInjector::from_options(&self.options);
        let uri = self.uri()?;
        let origin = uri.origin();
        let mut hop = HopState::initial(self.http_method.clone(), uri, &self.options)?;

        loop {
            let connection = self.connector.connection_for(&hop.uri, &self.options)?;

            let mut headers = hop.headers.clone();
            if hop.uri.origin() == origin {
                auth.apply(&connection, &hop.method, &hop.uri, &mut headers)
                    .await?;
            } else {
                headers.remove(AUTHORIZATION);
            }

            let request = build_raw_request(&hop.method, &hop.uri, headers, hop.body.clone())?;
            let raw = connection.send(request).await?;
            tracing::debug!(
                method = %hop.method,
                uri = %hop.uri,
                status = %raw.status,
                hop = hop.hops,
                "received response"
            );
            self.last_response = Some(raw.clone());

            if !self.options.redirects.follow_redirects || !raw.is_redirect() {
                return self.finish(hop, raw);
            }
            let Some(location) = raw.location() else {
                return Ok(Response::new(hop, raw, None));
            };

            let limit = self.options.redirects.max_redirects;
            if hop.hops >= limit {
                tracing::warn!(limit, location, "redirect limit reached");
                return Err(HttpError::RedirectionTooDeep {
                    limit,
                    status: raw.status,
                    location: location.to_owned(),
                });
            }
            hop = hop.follow(&raw, location, &self.options.redirects)?;
            self.http_method = hop.method.clone();
        }
    }

    fn finish(&self, hop: HopState, mut raw: RawResponse) -> Result<Response, HttpError> {
        if matches!(raw.status, StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED)
            || raw.body.is_empty()
        {
            return Ok(Response::new(hop, raw, None));
        }

        let body = DeflationHandler::new()
            .with_max_body_size(self.options.max_body_size)
            .decode(&mut raw)?;
        raw.body = body;
        let format = self.format();
        let parsed = self
            .options
            .parser
            .parse(&String::from_utf8_lossy(&raw.body), format)?;
        Ok(Response::new(hop, raw, parsed))
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("http_method", &self.http_method)
            .field("path", &self.path)
            .field("options", &self.options)
            .field("last_response", &self.last_response)
            .finish_non_exhaustive()
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, HttpError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        map.insert(
            HeaderName::from_bytes(name.as_bytes())?,
            HeaderValue::from_str(value)?,
        );
    }
    Ok(map)
}

fn check_scheme(uri: &Url) -> Result<(), HttpError> {
    match uri.scheme() {
        "http" | "https" => Ok(()),
        other => Err(HttpError::InvalidScheme {
            scheme: other.to_owned(),
            reason: "only http and https are supported".to_owned(),
        }),
    }
}

fn normalize_base_uri(base: &str) -> String {
    let base = base.trim();
    if base.contains("://") {
        return base.to_owned();
    }
    let authority = base.split('/').next().unwrap_or_default();
    if authority.ends_with(":443") {
        format!("https://{base}")
    } else {
        format!("http://{base}")
    }
}

fn join_base(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{path}", base.trim_end_matches('/')),
        (false, false) if !path.is_empty() && !path.starts_with('?') => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::config::{Credentials, ProxyConfig};
    use crate::connection::{Connection, ConnectionSettings};
    use crate::parser::Parser;
    use crate::query::{ParamValue, QueryNormalizer, params};
    use flate2::Compression;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use http::header::{LOCATION, WWW_AUTHENTICATE};
    use http_body_util::Full;
    use httpmock::{Method as MockMethod, MockServer};
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use std::io::Write;

    #[derive(Debug, Clone)]
    struct Sent {
        method: Method,
        uri: String,
        headers: HeaderMap,
        body: Bytes,
    }

    type Route = dyn Fn(&Method, &Url) -> RawResponse + Send + Sync;

    /// Answers every hop from a routing function and records what was sent.
    #[derive(Clone)]
    struct Scripted {
        route: Arc<Route>,
        sent: Arc<Mutex<Vec<Sent>>>,
    }

    impl Scripted {
        fn new(route: impl Fn(&Method, &Url) -> RawResponse + Send + Sync + 'static) -> Self {
            Self {
                route: Arc::new(route),
                sent: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn sent(&self) -> Vec<Sent> {
            self.sent.lock().clone()
        }
    }

    impl Connect for Scripted {
        fn connection_for(
            &self,
            uri: &Url,
            options: &RequestOptions,
        ) -> Result<Connection, HttpError> {
            let route = self.route.clone();
            let sent = self.sent.clone();
            let service = tower::service_fn(move |req: http::Request<Full<Bytes>>| {
                let route = route.clone();
                let sent = sent.clone();
                async move {
                    let (parts, body) = req.into_parts();
                    let body = http_body_util::BodyExt::collect(body)
                        .await
                        .map(http_body_util::Collected::to_bytes)
                        .unwrap_or_default();
                    let uri = Url::parse(&parts.uri.to_string()).unwrap();
                    sent.lock().push(Sent {
                        method: parts.method.clone(),
                        uri: uri.to_string(),
                        headers: parts.headers,
                        body,
                    });
                    Ok::<_, HttpError>(route(&parts.method, &uri))
                }
            });
            Connection::with_service(ConnectionSettings::resolve(uri, options), service)
        }
    }

    fn respond(status: u16, headers: &[(&'static str, &'static str)], body: &str) -> RawResponse {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(*name, HeaderValue::from_static(*value));
        }
        RawResponse::new(
            StatusCode::from_u16(status).unwrap(),
            map,
            Bytes::from(body.to_owned()),
        )
    }

    fn request(method: Method, path: &str, options: RequestOptions, script: &Scripted) -> Request {
        Request::new(method, path, options).with_connector(Arc::new(script.clone()))
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_relative_location_keeps_host() {
        let script = Scripted::new(|_, uri| match uri.path() {
            "/v1" => respond(300, &[("location", "/foo/bar")], ""),
            _ => respond(200, &[("content-type", "application/json")], r#"{"ok":true}"#),
        });
        let mut req = request(
            Method::GET,
            "http://api.foo.com/v1",
            RequestOptions::default(),
            &script,
        );

        let resp = req.perform().await.unwrap();

        assert_eq!(resp.uri().as_str(), "http://api.foo.com/foo/bar");
        assert!(resp == json!({"ok": true}));
        assert_eq!(script.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_redirect_chain_across_hosts_to_xml() {
        let script = Scripted::new(|_, uri| match (uri.host_str(), uri.path()) {
            (Some("test.com"), "/redirect") => {
                respond(300, &[("location", "http://api.foo.com/v2")], "")
            }
            (Some("api.foo.com"), "/v2") => respond(300, &[("location", "/v3")], ""),
            _ => respond(
                200,
                &[("content-type", "text/xml")],
                "<hash><foo>bar</foo></hash>",
            ),
        });
        let mut req = request(
            Method::GET,
            "http://test.com/redirect",
            RequestOptions::default(),
            &script,
        );

        let resp = req.perform().await.unwrap();

        assert!(resp == json!({"hash": {"foo": "bar"}}));
        assert_eq!(resp.uri().as_str(), "http://api.foo.com/v3");
        assert_eq!(req.format(), Some(Format::Xml));
        assert_eq!(req.last_response().map(|r| r.status), Some(StatusCode::OK));
    }

    #[tokio::test]
    async fn test_redirect_loop_stops_after_bound() {
        let script = Scripted::new(|_, _| respond(300, &[("location", "/again")], ""));
        let mut req = request(
            Method::GET,
            "http://api.foo.com/start",
            RequestOptions::default(),
            &script,
        );

        let err = req.perform().await.unwrap_err();

        assert!(matches!(
            err,
            HttpError::RedirectionTooDeep { limit: 5, status, ref location }
                if status == StatusCode::MULTIPLE_CHOICES && location == "/again"
        ));
        assert_eq!(script.sent().len(), 6);
    }

    #[tokio::test]
    async fn test_configurable_redirect_bound() {
        let script = Scripted::new(|_, _| respond(302, &[("location", "/again")], ""));
        let mut options = RequestOptions::default();
        options.redirects.max_redirects = 1;
        let mut req = request(Method::GET, "http://api.foo.com/", options, &script);

        assert!(matches!(
            req.perform().await.unwrap_err(),
            HttpError::RedirectionTooDeep { limit: 1, .. }
        ));
        assert_eq!(script.sent().len(), 2);
    }

    fn delete_redirect() -> Scripted {
        Scripted::new(|_, uri| match uri.path() {
            "/item" => respond(302, &[("location", "/moved")], ""),
            _ => respond(200, &[], "done"),
        })
    }

    #[tokio::test]
    async fn test_302_rewrites_delete_to_get() {
        let script = delete_redirect();
        let mut req = request(
            Method::DELETE,
            "http://api.foo.com/item",
            RequestOptions::default(),
            &script,
        );

        req.perform().await.unwrap();

        let sent = script.sent();
        assert_eq!(sent[0].method, Method::DELETE);
        assert_eq!(sent[1].method, Method::GET);
        assert_eq!(req.http_method(), Method::GET);
    }

    #[tokio::test]
    async fn test_302_maintains_delete_when_configured() {
        let script = delete_redirect();
        let mut options = RequestOptions::default();
        options.redirects.maintain_method_across_redirects = true;
        let mut req = request(Method::DELETE, "http://api.foo.com/item", options, &script);

        req.perform().await.unwrap();

        assert_eq!(script.sent()[1].method, Method::DELETE);
        assert_eq!(req.http_method(), Method::DELETE);
    }

    #[tokio::test]
    async fn test_307_keeps_post_and_body() {
        let script = Scripted::new(|_, uri| match uri.path() {
            "/submit" => respond(307, &[("location", "/submit2")], ""),
            _ => respond(201, &[], "created"),
        });
        let options = RequestOptions {
            body: Some(Body::Params(params([("name", "bob")]))),
            ..RequestOptions::default()
        };
        let mut req = request(Method::POST, "http://api.foo.com/submit", options, &script);

        let resp = req.perform().await.unwrap();

        let sent = script.sent();
        assert_eq!(sent[1].method, Method::POST);
        assert_eq!(sent[1].body.as_ref(), b"name=bob");
        assert_eq!(sent[1].headers[CONTENT_TYPE], FORM_CONTENT_TYPE);
        assert_eq!(resp.code(), 201);
    }

    #[tokio::test]
    async fn test_303_switches_post_to_get_and_drops_body() {
        let script = Scripted::new(|_, uri| match uri.path() {
            "/submit" => respond(303, &[("location", "/result")], ""),
            _ => respond(200, &[], "ok"),
        });
        let mut options = RequestOptions {
            body: Some(Body::Raw("payload".to_owned())),
            ..RequestOptions::default()
        };
        options.headers.insert("Content-Type".to_owned(), "text/plain".to_owned());
        options.redirects.maintain_method_across_redirects = true;
        let mut req = request(Method::POST, "http://api.foo.com/submit", options, &script);

        req.perform().await.unwrap();

        let sent = script.sent();
        assert_eq!(sent[0].body.as_ref(), b"payload");
        assert_eq!(sent[1].method, Method::GET);
        assert!(sent[1].body.is_empty());
        assert!(!sent[1].headers.contains_key(CONTENT_TYPE));
    }

    #[tokio::test]
    async fn test_303_resends_when_fully_configured() {
        let script = Scripted::new(|_, uri| match uri.path() {
            "/submit" => respond(303, &[("location", "/result")], ""),
            _ => respond(200, &[], "ok"),
        });
        let mut options = RequestOptions::default();
        options.redirects.maintain_method_across_redirects = true;
        options.redirects.resend_on_redirect = true;
        let mut req = request(Method::PUT, "http://api.foo.com/submit", options, &script);

        req.perform().await.unwrap();

        assert_eq!(script.sent()[1].method, Method::PUT);
    }

    #[tokio::test]
    async fn test_no_content_and_not_modified_are_nil() {
        for status in [204, 304] {
            let script = Scripted::new(move |_, _| {
                respond(status, &[("content-type", "application/json")], "")
            });
            let mut req = request(
                Method::GET,
                "http://api.foo.com/",
                RequestOptions::default(),
                &script,
            );

            let resp = req.perform().await.unwrap();

            assert!(resp.is_nil());
            assert!(resp == Value::Null);
            assert!(resp == None::<Value>);
            assert_eq!(resp.code(), status);
            assert!(resp.body().is_empty());
            assert_eq!(script.sent().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_redirect_without_location_is_terminal_and_unparsed() {
        let script = Scripted::new(|_, _| {
            respond(302, &[("content-type", "application/json")], r#"{"a":1}"#)
        });
        let mut req = request(
            Method::GET,
            "http://api.foo.com/",
            RequestOptions::default(),
            &script,
        );

        let resp = req.perform().await.unwrap();

        assert_eq!(resp.code(), 302);
        assert!(resp.is_nil());
        assert_eq!(resp.text(), r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_follow_redirects_disabled_parses_3xx() {
        let script = Scripted::new(|_, _| {
            respond(
                301,
                &[("content-type", "application/json"), ("location", "/next")],
                r#"{"moved":true}"#,
            )
        });
        let mut options = RequestOptions::default();
        options.redirects.follow_redirects = false;
        let mut req = request(Method::GET, "http://api.foo.com/", options, &script);

        let resp = req.perform().await.unwrap();

        assert_eq!(resp.code(), 301);
        assert!(resp == json!({"moved": true}));
        assert_eq!(script.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_cookies_accumulate_across_hops() {
        let script = Scripted::new(|_, uri| match uri.path() {
            "/login" => respond(
                302,
                &[
                    ("location", "/step"),
                    ("set-cookie", "session=abc; Path=/; HttpOnly"),
                ],
                "",
            ),
            "/step" => respond(
                302,
                &[
                    ("location", "/home"),
                    ("set-cookie", "theme=dark; Expires=Wed, 21 Oct 2026 07:28:00 GMT"),
                    ("set-cookie", "session=xyz"),
                ],
                "",
            ),
            _ => respond(200, &[], "home"),
        });
        let mut options = RequestOptions::default();
        options.headers.insert("Cookie".to_owned(), "lang=en".to_owned());
        let mut req = request(Method::GET, "http://api.foo.com/login", options, &script);

        let resp = req.perform().await.unwrap();

        let sent = script.sent();
        assert_eq!(sent[0].headers[COOKIE], "lang=en");
        assert_eq!(sent[1].headers[COOKIE], "lang=en; session=abc");
        assert_eq!(sent[2].headers[COOKIE], "lang=en; session=xyz; theme=dark");
        assert_eq!(resp.request().headers[COOKIE], "lang=en; session=xyz; theme=dark");
    }

    #[tokio::test]
    async fn test_conflicting_auth_fails_before_network() {
        let script = Scripted::new(|_, _| respond(200, &[], "unreachable"));
        let options = RequestOptions {
            basic_auth: Some(Credentials::new("user", "pass")),
            digest_auth: Some(Credentials::new("user", "pass")),
            ..RequestOptions::default()
        };
        let mut req = request(Method::GET, "http://api.foo.com/", options, &script);

        let err = req.perform().await.unwrap_err();

        assert!(err.is_configuration());
        assert!(err.to_string().contains("basic_auth or digest_auth"));
        assert!(script.sent().is_empty());
    }

    #[tokio::test]
    async fn test_raw_query_on_post_fails_before_network() {
        let script = Scripted::new(|_, _| respond(200, &[], "unreachable"));
        let options = RequestOptions {
            query: Some(Query::Raw("a=1".to_owned())),
            ..RequestOptions::default()
        };
        let mut req = request(Method::POST, "http://api.foo.com/", options, &script);

        assert!(req.perform().await.unwrap_err().is_configuration());
        assert!(script.sent().is_empty());
    }

    #[tokio::test]
    async fn test_basic_auth_not_forwarded_to_other_host() {
        let script = Scripted::new(|_, uri| match uri.host_str() {
            Some("api.foo.com") => respond(302, &[("location", "http://cdn.other.com/f")], ""),
            _ => respond(200, &[], "file"),
        });
        let options = RequestOptions {
            basic_auth: Some(Credentials::new("user", "pass")),
            ..RequestOptions::default()
        };
        let mut req = request(Method::GET, "http://api.foo.com/f", options, &script);

        req.perform().await.unwrap();

        let sent = script.sent();
        assert_eq!(sent[0].headers[AUTHORIZATION], "Basic dXNlcjpwYXNz");
        assert!(!sent[1].headers.contains_key(AUTHORIZATION));
    }

    #[tokio::test]
    async fn test_explicit_format_overrides_content_type() {
        let script = Scripted::new(|_, _| respond(200, &[("content-type", "text/plain")], "[1,2]"));
        let options = RequestOptions {
            format: Some(Format::Json),
            ..RequestOptions::default()
        };
        let mut req = request(Method::GET, "http://api.foo.com/", options, &script);

        let resp = req.perform().await.unwrap();

        assert!(resp == json!([1, 2]));
        assert_eq!(resp[1], json!(2));
    }

    #[tokio::test]
    async fn test_custom_parser_skips_sniffing() {
        let script = Scripted::new(|_, _| {
            respond(200, &[("content-type", "application/json")], "not json")
        });
        let options = RequestOptions {
            parser: Parser::custom(|body, format| {
                Ok(Some(json!({ "body": body, "format": format.map(Format::as_str) })))
            }),
            ..RequestOptions::default()
        };
        let mut req = request(Method::GET, "http://api.foo.com/", options, &script);

        let resp = req.perform().await.unwrap();

        assert!(resp == json!({"body": "not json", "format": null}));
        assert_eq!(req.format(), None);
    }

    #[tokio::test]
    async fn test_malformed_body_is_parse_error() {
        let script = Scripted::new(|_, _| {
            respond(200, &[("content-type", "application/json")], "{broken")
        });
        let mut req = request(
            Method::GET,
            "http://api.foo.com/",
            RequestOptions::default(),
            &script,
        );

        let err = req.perform().await.unwrap_err();

        assert!(matches!(err, HttpError::Parse { format: Some(Format::Json), .. }));
    }

    #[test]
    fn test_format_from_injected_last_response() {
        let mut req = Request::new(Method::GET, "http://api.foo.com/", RequestOptions::default());
        assert_eq!(req.format(), None);

        req.set_last_response(respond(200, &[("content-type", "text/json; charset=utf-8")], ""));
        assert_eq!(req.format(), Some(Format::Json));

        req.set_http_method(Method::HEAD);
        assert_eq!(req.http_method(), Method::HEAD);
    }

    #[test]
    fn test_uri_composition() {
        let options = RequestOptions {
            base_uri: Some("api.foo.com".to_owned()),
            query: Some(Query::Params(params([
                ("page", ParamValue::from(2_i64)),
                ("tags", ParamValue::from(vec!["a", "b"])),
            ]))),
            ..RequestOptions::default()
        };
        let req = Request::new(Method::GET, "/v1?x=1", options);
        assert_eq!(
            req.uri().unwrap().as_str(),
            "http://api.foo.com/v1?x=1&page=2&tags[]=a&tags[]=b"
        );
    }

    #[test]
    fn test_uri_base_rules() {
        let with_base = |base: &str, path: &str| {
            let options = RequestOptions {
                base_uri: Some(base.to_owned()),
                ..RequestOptions::default()
            };
            Request::new(Method::GET, path, options).uri()
        };

        assert_eq!(
            with_base("api.foo.com:443", "/v1").unwrap().as_str(),
            "https://api.foo.com/v1"
        );
        assert_eq!(
            with_base("http://api.foo.com/", "/v1").unwrap().as_str(),
            "http://api.foo.com/v1"
        );
        assert_eq!(
            with_base("http://api.foo.com/api", "v1").unwrap().as_str(),
            "http://api.foo.com/api/v1"
        );
        assert_eq!(
            with_base("http://ignored.com", "https://api.foo.com/x").unwrap().as_str(),
            "https://api.foo.com/x"
        );
        assert!(matches!(
            with_base("http://api.foo.com", "ftp://files.foo.com/x"),
            Err(HttpError::InvalidScheme { .. })
        ));

        let no_base = Request::new(Method::GET, "/v1", RequestOptions::default());
        assert!(matches!(
            no_base.uri(),
            Err(HttpError::InvalidUri { kind: InvalidUriKind::MissingAuthority, .. })
        ));
    }

    #[test]
    fn test_flat_normalizer_and_raw_query() {
        let options = RequestOptions {
            query: Some(Query::Params(params([("id", vec!["1", "2"])]))),
            query_string_normalizer: QueryNormalizer::Flat,
            ..RequestOptions::default()
        };
        let req = Request::new(Method::GET, "http://api.foo.com/items", options);
        assert_eq!(req.uri().unwrap().query(), Some("id=1&id=2"));

        let options = RequestOptions {
            query: Some(Query::Raw("a=b%20c".to_owned())),
            ..RequestOptions::default()
        };
        let req = Request::new(Method::GET, "http://api.foo.com/items?z=0", options);
        assert_eq!(req.uri().unwrap().query(), Some("z=0&a=b%20c"));
    }

    #[test]
    fn test_follow_rejects_unusable_location() {
        let hop = HopState::new(Method::GET, url("http://api.foo.com/a"));
        let raw = respond(302, &[], "");
        let policy = RedirectPolicy::default();

        assert!(matches!(
            hop.follow(&raw, "http://[bad", &policy),
            Err(HttpError::InvalidUri { kind: InvalidUriKind::BadLocation, .. })
        ));
        assert!(matches!(
            hop.follow(&raw, "ftp://files.foo.com/", &policy),
            Err(HttpError::InvalidScheme { .. })
        ));

        let head = HopState::new(Method::HEAD, url("http://api.foo.com/a"));
        let next = head.follow(&raw, "/b", &policy).unwrap();
        assert_eq!(next.method, Method::HEAD);
        assert_eq!(next.hops, 1);
        assert_eq!(next.uri.as_str(), "http://api.foo.com/b");
    }

    #[tokio::test]
    async fn test_perform_against_server_with_query_and_redirect() {
        let server = MockServer::start();
        let old = server.mock(|when, then| {
            when.method(MockMethod::GET).path("/old").query_param("page", "2");
            then.status(301).header(LOCATION.as_str(), "/new");
        });
        let new = server.mock(|when, then| {
            when.method(MockMethod::GET).path("/new");
            then.status(200)
                .header("content-type", "application/json; charset=utf-8")
                .body(r#"{"items":[{"id":1},{"id":2}]}"#);
        });

        let options = RequestOptions {
            base_uri: Some(server.base_url()),
            query: Some(Query::Params(params([("page", 2_i64)]))),
            ..RequestOptions::default()
        };
        let mut req = Request::new(Method::GET, "/old", options);
        let resp = req.perform().await.unwrap();

        old.assert();
        new.assert();
        assert_eq!(resp["items"][1]["id"], json!(2));
        assert_eq!(resp.uri().path(), "/new");
        assert_eq!(resp.uri().query(), None);
    }

    #[tokio::test]
    async fn test_gzip_response_is_inflated() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(br#"{"zipped":true}"#).unwrap();
        let gz = encoder.finish().unwrap();

        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(MockMethod::GET).path("/gz");
            then.status(200)
                .header("content-type", "application/json")
                .header("content-encoding", "gzip")
                .body(gz);
        });

        let mut req = Request::new(Method::GET, server.url("/gz"), RequestOptions::default());
        let resp = req.perform().await.unwrap();

        assert!(resp == json!({"zipped": true}));
        assert!(resp.header("content-encoding").is_none());
    }

    #[tokio::test]
    async fn test_deflate_response_is_inflated() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"plain text").unwrap();
        let deflated = encoder.finish().unwrap();

        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(MockMethod::GET).path("/deflate");
            then.status(200)
                .header("content-type", "text/plain")
                .header("content-encoding", "deflate")
                .body(deflated);
        });

        let mut req = Request::new(Method::GET, server.url("/deflate"), RequestOptions::default());
        let resp = req.perform().await.unwrap();

        assert!(resp == json!("plain text"));
    }

    #[tokio::test]
    async fn test_basic_auth_header_sent() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(MockMethod::GET)
                .path("/private")
                .header("authorization", "Basic dXNlcjpwYXNz");
            then.status(200).body("secret");
        });

        let options = RequestOptions {
            basic_auth: Some(Credentials::new("user", "pass")),
            ..RequestOptions::default()
        };
        let mut req = Request::new(Method::GET, server.url("/private"), options);
        let resp = req.perform().await.unwrap();

        mock.assert();
        assert_eq!(resp.text(), "secret");
    }

    #[tokio::test]
    async fn test_digest_auth_challenges_with_head() {
        let server = MockServer::start();
        let challenge = server.mock(|when, then| {
            when.method(MockMethod::HEAD).path("/dir/index.html");
            then.status(401).header(
                WWW_AUTHENTICATE.as_str(),
                r#"Digest realm="testrealm@host.com", qop="auth", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", opaque="5ccc069c403ebaf9f0171e9517f40e41""#,
            );
        });
        let answer = server.mock(|when, then| {
            when.method(MockMethod::GET)
                .path("/dir/index.html")
                .header_exists("authorization");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"authorized":true}"#);
        });

        let options = RequestOptions {
            digest_auth: Some(Credentials::new("Mufasa", "Circle Of Life")),
            ..RequestOptions::default()
        };
        let mut req = Request::new(Method::GET, server.url("/dir/index.html"), options);
        let resp = req.perform().await.unwrap();

        challenge.assert();
        answer.assert();
        assert!(resp == json!({"authorized": true}));
    }

    #[tokio::test]
    async fn test_form_body_posted() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(MockMethod::POST)
                .path("/users")
                .header("content-type", FORM_CONTENT_TYPE)
                .body("name=Jane%20Doe&roles[]=admin");
            then.status(201)
                .header("content-type", "application/json")
                .body(r#"{"id":7}"#);
        });

        let options = RequestOptions {
            body: Some(Body::Params(params([
                ("name", ParamValue::from("Jane Doe")),
                ("roles", ParamValue::from(vec!["admin"])),
            ]))),
            ..RequestOptions::default()
        };
        let mut req = Request::new(Method::POST, server.url("/users"), options);
        let resp = req.perform().await.unwrap();

        mock.assert();
        assert_eq!(resp.code(), 201);
        assert_eq!(resp["id"], json!(7));
    }

    #[tokio::test]
    async fn test_perform_plain_http_through_forwarding_proxy() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let proxy = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut chunk = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0);
                head.extend_from_slice(&chunk[..n]);
            }
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 11\r\n\r\n{\"ok\":true}",
                )
                .await
                .unwrap();
            String::from_utf8(head).unwrap()
        });

        let options = RequestOptions {
            proxy: Some(ProxyConfig::new("127.0.0.1", port)),
            ..RequestOptions::default()
        };
        let mut req = Request::new(Method::GET, "http://api.example.test/x", options);
        let resp = req.perform().await.unwrap();

        assert_eq!(resp.code(), 200);
        assert_eq!(resp["ok"], json!(true));
        let head = proxy.await.unwrap();
        assert_eq!(head.lines().next(), Some("GET http://api.example.test/x HTTP/1.1"));
    }
}
