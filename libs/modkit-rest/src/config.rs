use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};

use crate::error::HttpError;
use crate::parser::{Format, Parser};
use crate::query::{Params, QueryNormalizer};

/// Default User-Agent string for HTTP requests
pub const DEFAULT_USER_AGENT: &str = concat!("modkit-rest/", env!("CARGO_PKG_VERSION"));

/// Default number of redirect hops followed before giving up
pub const DEFAULT_MAX_REDIRECTS: usize = 5;

/// Default maximum response body size (10 MiB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Verbs accepted by [`RequestOptions::validate`].
pub const SUPPORTED_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS", "MOVE", "COPY", "MKCOL", "LOCK",
    "UNLOCK",
];

/// Verbs whose `query` option must be a mapping.
fn carries_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// TLS root certificate source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsRootConfig {
    /// Mozilla root certificates bundled at compile time
    #[default]
    WebPki,
    /// Root certificates from the OS store, loaded once and cached
    Native,
}

/// Query option: a parameter map run through the normalizer, or a raw pre-encoded string.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Query {
    Params(Params),
    Raw(String),
}

impl From<Params> for Query {
    fn from(params: Params) -> Self {
        Query::Params(params)
    }
}

impl From<&str> for Query {
    fn from(raw: &str) -> Self {
        Query::Raw(raw.to_owned())
    }
}

/// Request body: a form-encoded parameter map, or raw text sent as-is.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Body {
    Params(Params),
    Raw(String),
}

impl From<Params> for Body {
    fn from(params: Params) -> Self {
        Body::Params(params)
    }
}

impl From<&str> for Body {
    fn from(raw: &str) -> Self {
        Body::Raw(raw.to_owned())
    }
}

impl From<String> for Body {
    fn from(raw: String) -> Self {
        Body::Raw(raw)
    }
}

/// Username/password pair for basic or digest authentication.
///
/// Deserializes only from a mapping with `username` and `password` keys.
#[derive(Clone, Deserialize)]
#[serde(try_from = "serde_json::Value")]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    pub(crate) fn password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl TryFrom<serde_json::Value> for Credentials {
    type Error = String;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        let serde_json::Value::Object(map) = value else {
            return Err("credentials must be a mapping of username and password".to_owned());
        };
        let field = |name: &str| match map.get(name) {
            Some(serde_json::Value::String(s)) => Ok(s.clone()),
            Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
            _ => Err(format!("credentials are missing '{name}'")),
        };
        Ok(Credentials::new(field("username")?, field("password")?))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Forward proxy used through an HTTP CONNECT tunnel.
#[derive(Clone, Deserialize)]
pub struct ProxyConfig {
    pub addr: String,
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default, deserialize_with = "optional_secret")]
    pub pass: Option<SecretString>,
}

impl ProxyConfig {
    #[must_use]
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
            user: None,
            pass: None,
        }
    }

    #[must_use]
    pub fn with_credentials(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.pass = Some(SecretString::from(pass.into()));
        self
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("addr", &self.addr)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("pass", &self.pass.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Caller-provided sink receiving a wire transcript of every hop.
#[derive(Clone)]
pub struct DebugSink(Arc<Mutex<dyn Write + Send>>);

impl DebugSink {
    #[must_use]
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self(Arc::new(Mutex::new(writer)))
    }

    /// Share a writer the caller keeps a handle to (e.g. an in-memory buffer).
    #[must_use]
    pub fn shared<W: Write + Send + 'static>(writer: Arc<Mutex<W>>) -> Self {
        Self(writer)
    }

    /// Write one transcript line. Sink failures never fail the request.
    pub(crate) fn line(&self, line: &str) {
        let mut out = self.0.lock();
        if let Err(e) = writeln!(out, "{line}") {
            tracing::debug!(error = %e, "debug_output sink rejected write");
        }
    }
}

impl fmt::Debug for DebugSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DebugSink(..)")
    }
}

/// How 3xx responses are followed.
///
/// Flattened into [`RequestOptions`], so the keys sit at the top level of a
/// deserialized options document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RedirectPolicy {
    /// Follow 3xx responses carrying a `Location` header (default: true)
    pub follow_redirects: bool,

    /// Redirect hop bound (default: 5)
    pub max_redirects: usize,

    /// Keep the original verb on 301/302 (and 303 with `resend_on_redirect`)
    pub maintain_method_across_redirects: bool,

    pub resend_on_redirect: bool,
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self {
            follow_redirects: true,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            maintain_method_across_redirects: false,
            resend_on_redirect: false,
        }
    }
}

/// Everything that shapes one request: target, body, auth, TLS, transport and
/// redirect behaviour.
///
/// Options are merged by the caller before they reach [`crate::Request`]; nothing here
/// reads global state. Non-data fields (custom parser, custom normalizer, debug sink) are
/// skipped when deserializing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    /// Prefix for relative request paths
    pub base_uri: Option<String>,

    /// Explicit body format; disables content-type sniffing when set
    pub format: Option<Format>,

    #[serde(skip)]
    pub parser: Parser,

    pub query: Option<Query>,

    pub body: Option<Body>,

    /// Request headers; the `Cookie` entry accumulates across redirect hops
    pub headers: BTreeMap<String, String>,

    pub basic_auth: Option<Credentials>,

    pub digest_auth: Option<Credentials>,

    /// PEM client certificate and private key, used on `https` hops only
    pub pem: Option<String>,

    #[serde(deserialize_with = "optional_secret")]
    pub pem_password: Option<SecretString>,

    /// Verify the server certificate chain (default: true)
    pub verify: bool,

    pub tls_roots: TlsRootConfig,

    /// Connect and read timeout. Non-numeric input deserializes to `None`.
    #[serde(deserialize_with = "lenient_timeout")]
    pub timeout: Option<Duration>,

    pub proxy: Option<ProxyConfig>,

    #[serde(skip)]
    pub debug_output: Option<DebugSink>,

    #[serde(flatten)]
    pub redirects: RedirectPolicy,

    #[serde(skip)]
    pub query_string_normalizer: QueryNormalizer,

    pub user_agent: String,

    /// Maximum collected response body size (default: 10 MiB)
    pub max_body_size: usize,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            base_uri: None,
            format: None,
            parser: Parser::default(),
            query: None,
            body: None,
            headers: BTreeMap::new(),
            basic_auth: None,
            digest_auth: None,
            pem: None,
            pem_password: None,
            verify: true,
            tls_roots: TlsRootConfig::default(),
            timeout: None,
            proxy: None,
            debug_output: None,
            redirects: RedirectPolicy::default(),
            query_string_normalizer: QueryNormalizer::default(),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl RequestOptions {
    /// Load options from a YAML document.
    ///
    /// # Errors
    /// Returns `HttpError::Configuration` if the document does not describe valid options.
    pub fn from_yaml(yaml: &str) -> Result<Self, HttpError> {
        serde_saphyr::from_str(yaml).map_err(|e| HttpError::configuration(e.to_string()))
    }

    /// Check option combinations for `method` before any network activity.
    ///
    /// # Errors
    /// Returns `HttpError::Configuration` for an unsupported verb, both auth methods set,
    /// or a non-mapping `query` on a body-bearing verb.
    pub fn validate(&self, method: &Method) -> Result<(), HttpError> {
        if !SUPPORTED_METHODS.contains(&method.as_str()) {
            return Err(HttpError::configuration(format!(
                "unsupported HTTP method '{method}'"
            )));
        }
        if self.basic_auth.is_some() && self.digest_auth.is_some() {
            return Err(HttpError::configuration(
                "only one authentication method, basic_auth or digest_auth may be used at a time",
            ));
        }
        if carries_body(method) && matches!(self.query, Some(Query::Raw(_))) {
            return Err(HttpError::configuration(format!(
                "query must be a mapping for {method} requests"
            )));
        }
        Ok(())
    }
}

fn optional_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.map(SecretString::from))
}

fn lenient_timeout<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let timeout = value
        .as_f64()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
    if timeout.is_none() && !value.is_null() {
        tracing::debug!(value = %value, "ignoring non-numeric timeout option");
    }
    Ok(timeout)
}
