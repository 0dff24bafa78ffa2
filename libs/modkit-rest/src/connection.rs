//! Per-hop transport.
//!
//! [`Connect::connection_for`] turns a hop URI plus [`RequestOptions`] into a
//! [`Connection`]: a boxed tower service over a hyper client, configured for that
//! hop only. TLS is enabled iff the scheme is `https`; PEM material is neither parsed
//! nor attached for any other scheme.
//!
//! Service stack (outer to inner):
//!
//! ```text
//! Timeout? -> DefaultHeaders -> DebugOutput -> hyper client [-> CONNECT tunnel] [-> rustls]
//! ```
//!
//! Through a proxy, `https` hops tunnel with `CONNECT` while plain hops are
//! forwarded to the proxy in absolute form.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose;
use bytes::Bytes;
use http::header::PROXY_AUTHORIZATION;
use http::{HeaderMap, HeaderValue, Method};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::legacy::connect::{Connected, Connection as ConnectionInfo, HttpConnector};
use hyper_util::rt::{TokioExecutor, TokioIo};
use secrecy::{ExposeSecret, SecretString};
use tower::timeout::TimeoutLayer;
use tower::util::BoxCloneSyncService;
use tower::{BoxError, Service, ServiceBuilder, ServiceExt};
use url::Url;
use zeroize::Zeroizing;

use crate::config::{DebugSink, ProxyConfig, RequestOptions, TlsRootConfig};
use crate::error::{HttpError, InvalidUriKind};
use crate::layers::{DebugOutputLayer, DefaultHeadersLayer};
use crate::response::RawResponse;
use crate::tls::{self, ClientIdentity};

/// Type-erased hop service.
pub type HopService = BoxCloneSyncService<http::Request<Full<Bytes>>, RawResponse, HttpError>;

/// Source of per-hop connections. Swap it to script responses in tests.
pub trait Connect: Send + Sync {
    /// Configure a connection for `uri`.
    ///
    /// # Errors
    /// Returns `HttpError::Tls` for unusable certificate material and
    /// `HttpError::InvalidUri` for an unusable proxy address.
    fn connection_for(&self, uri: &Url, options: &RequestOptions)
    -> Result<Connection, HttpError>;
}

/// Connector backed by hyper and rustls.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportConnector;

impl Connect for TransportConnector {
    fn connection_for(
        &self,
        uri: &Url,
        options: &RequestOptions,
    ) -> Result<Connection, HttpError> {
        let settings = ConnectionSettings::resolve(uri, options);
        if let Some(sink) = &settings.debug_output {
            let host = uri.host_str().unwrap_or_default();
            let port = uri.port_or_known_default().unwrap_or_default();
            sink.line(&format!("opening connection to {host}:{port}..."));
        }
        Connection::open(settings)
    }
}

/// Transport configuration derived from one hop URI and the request options.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub use_tls: bool,
    pub verify_peer: bool,
    pub tls_roots: TlsRootConfig,
    pub pem: Option<String>,
    pub pem_password: Option<SecretString>,
    pub proxy: Option<ProxyConfig>,
    pub timeout: Option<Duration>,
    pub debug_output: Option<DebugSink>,
    pub user_agent: String,
    pub max_body_size: usize,
}

impl ConnectionSettings {
    /// Port plays no part in the TLS decision: `http://host:443` stays plain.
    #[must_use]
    pub fn resolve(uri: &Url, options: &RequestOptions) -> Self {
        let use_tls = uri.scheme().eq_ignore_ascii_case("https");
        Self {
            use_tls,
            verify_peer: use_tls && options.verify,
            tls_roots: options.tls_roots,
            pem: options.pem.clone().filter(|_| use_tls),
            pem_password: options.pem_password.clone().filter(|_| use_tls),
            proxy: options.proxy.clone(),
            timeout: options.timeout,
            debug_output: options.debug_output.clone(),
            user_agent: options.user_agent.clone(),
            max_body_size: options.max_body_size,
        }
    }
}

/// A configured transport for one hop. Dropping it releases pooled sockets.
#[derive(Clone)]
pub struct Connection {
    settings: ConnectionSettings,
    service: HopService,
}

impl Connection {
    /// Build the hyper-backed transport for `settings`.
    ///
    /// # Errors
    /// Returns `HttpError::Tls` if PEM material or the root store is unusable.
    pub fn open(settings: ConnectionSettings) -> Result<Self, HttpError> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(settings.timeout);

        let max = settings.max_body_size;
        let inner = match (&settings.proxy, settings.use_tls) {
            (None, false) => client_service(http, max),
            (None, true) => client_service(https_connector(&settings, http)?, max),
            (Some(proxy), false) => forward_service(proxy, http, max)?,
            (Some(proxy), true) => {
                let tunnel = tunnel(proxy, http)?;
                client_service(https_connector(&settings, tunnel)?, max)
            }
        };

        tracing::debug!(
            tls = settings.use_tls,
            verify_peer = settings.verify_peer,
            client_cert = settings.pem.is_some(),
            proxy = settings.proxy.is_some(),
            "configured connection"
        );
        Self::with_service(settings, inner)
    }

    /// Wrap an arbitrary transport service in the standard layer stack.
    ///
    /// # Errors
    /// Returns `HttpError::InvalidHeaderValue` if the user agent is not a valid header.
    pub fn with_service<S>(settings: ConnectionSettings, inner: S) -> Result<Self, HttpError>
    where
        S: Service<http::Request<Full<Bytes>>, Response = RawResponse, Error = HttpError>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let layered = ServiceBuilder::new()
            .layer(DefaultHeadersLayer::try_new(&settings.user_agent)?)
            .layer(DebugOutputLayer::new(settings.debug_output.clone()))
            .service(inner);

        let service = match settings.timeout {
            Some(timeout) => BoxCloneSyncService::new(
                ServiceBuilder::new()
                    .layer(TimeoutLayer::new(timeout))
                    .service(layered)
                    .map_err(move |e: BoxError| map_tower_error(e, timeout)),
            ),
            None => BoxCloneSyncService::new(layered),
        };

        Ok(Self { settings, service })
    }

    #[must_use]
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Send one request and collect the response.
    ///
    /// # Errors
    /// Returns transport, timeout, and body-size errors.
    pub async fn send(
        &self,
        request: http::Request<Full<Bytes>>,
    ) -> Result<RawResponse, HttpError> {
        let mut service = self.service.clone();
        service.ready().await?.call(request).await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Build an outgoing request for `uri`. The fragment is never sent.
///
/// # Errors
/// Returns `HttpError::InvalidUri` if `uri` is not a valid request target.
pub fn build_raw_request(
    method: &Method,
    uri: &Url,
    headers: HeaderMap,
    body: Option<Bytes>,
) -> Result<http::Request<Full<Bytes>>, HttpError> {
    let mut target = uri.clone();
    target.set_fragment(None);
    let target: http::Uri = target.as_str().parse().map_err(|e: http::uri::InvalidUri| {
        HttpError::InvalidUri {
            url: uri.to_string(),
            kind: InvalidUriKind::ParseError,
            reason: e.to_string(),
        }
    })?;

    let mut request = http::Request::builder()
        .method(method.clone())
        .uri(target)
        .body(Full::new(body.unwrap_or_default()))?;
    *request.headers_mut() = headers;
    Ok(request)
}

fn client_service<C>(connector: C, max_body_size: usize) -> HopService
where
    C: hyper_util::client::legacy::connect::Connect + Clone + Send + Sync + 'static,
{
    let client = Client::builder(TokioExecutor::new()).build::<_, Full<Bytes>>(connector);
    BoxCloneSyncService::new(tower::service_fn(move |req: http::Request<Full<Bytes>>| {
        let client = client.clone();
        async move {
            let response = client.request(req).await?;
            collect_response(response, max_body_size).await
        }
    }))
}

async fn collect_response(
    response: http::Response<hyper::body::Incoming>,
    limit: usize,
) -> Result<RawResponse, HttpError> {
    let (parts, body) = response.into_parts();
    let body = Limited::new(body, limit)
        .collect()
        .await
        .map_err(|e| {
            if e.is::<LengthLimitError>() {
                HttpError::BodyTooLarge { limit }
            } else {
                HttpError::Transport(e)
            }
        })?
        .to_bytes();
    Ok(RawResponse::new(parts.status, parts.headers, body))
}

fn https_connector<C>(
    settings: &ConnectionSettings,
    connector: C,
) -> Result<hyper_rustls::HttpsConnector<C>, HttpError> {
    let identity = settings
        .pem
        .as_deref()
        .map(|pem| {
            let password = settings.pem_password.as_ref().map(ExposeSecret::expose_secret);
            ClientIdentity::from_pem(pem, password)
        })
        .transpose()?;
    let config = tls::client_config(settings.tls_roots, settings.verify_peer, identity)?;
    Ok(hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(config)
        .https_only()
        .enable_all_versions()
        .wrap_connector(connector))
}

fn proxy_uri(proxy: &ProxyConfig) -> Result<http::Uri, HttpError> {
    let raw = format!("http://{}:{}", proxy.addr, proxy.port);
    raw.parse().map_err(|e: http::uri::InvalidUri| HttpError::InvalidUri {
        url: raw.clone(),
        kind: InvalidUriKind::ParseError,
        reason: e.to_string(),
    })
}

/// `Basic` credentials for the proxy, if a proxy user is configured.
fn proxy_authorization(proxy: &ProxyConfig) -> Result<Option<HeaderValue>, HttpError> {
    let Some(user) = &proxy.user else {
        return Ok(None);
    };
    let pass = proxy.pass.as_ref().map_or("", ExposeSecret::expose_secret);
    let plain = Zeroizing::new(format!("{user}:{pass}"));
    let encoded = Zeroizing::new(general_purpose::STANDARD.encode(plain.as_bytes()));
    let mut value = HeaderValue::from_str(&format!("Basic {}", &*encoded))?;
    value.set_sensitive(true);
    Ok(Some(value))
}

fn tunnel(proxy: &ProxyConfig, http: HttpConnector) -> Result<Tunnel<HttpConnector>, HttpError> {
    let tunnel = Tunnel::new(proxy_uri(proxy)?, http);
    Ok(match proxy_authorization(proxy)? {
        Some(value) => tunnel.with_auth(value),
        None => tunnel,
    })
}

/// Plain-http hop through a forwarding proxy. Credentials travel on every request.
fn forward_service(
    proxy: &ProxyConfig,
    http: HttpConnector,
    max_body_size: usize,
) -> Result<HopService, HttpError> {
    let connector = ForwardProxy {
        http,
        proxy_uri: proxy_uri(proxy)?,
    };
    let inner = client_service(connector, max_body_size);
    let Some(value) = proxy_authorization(proxy)? else {
        return Ok(inner);
    };
    let authorized = ServiceBuilder::new()
        .map_request(move |mut req: http::Request<Full<Bytes>>| {
            req.headers_mut().insert(PROXY_AUTHORIZATION, value.clone());
            req
        })
        .service(inner);
    Ok(BoxCloneSyncService::new(authorized))
}

/// Dials the proxy whatever the destination is.
#[derive(Clone)]
struct ForwardProxy {
    http: HttpConnector,
    proxy_uri: http::Uri,
}

impl Service<http::Uri> for ForwardProxy {
    type Response = ProxiedStream;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<ProxiedStream, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.http.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, _dst: http::Uri) -> Self::Future {
        let connecting = self.http.call(self.proxy_uri.clone());
        Box::pin(async move { Ok(ProxiedStream(connecting.await?)) })
    }
}

/// Socket to a forwarding proxy. Marked as proxied so hyper keeps absolute-form targets.
struct ProxiedStream(TokioIo<tokio::net::TcpStream>);

impl ConnectionInfo for ProxiedStream {
    fn connected(&self) -> Connected {
        self.0.connected().proxy(true)
    }
}

impl hyper::rt::Read for ProxiedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        hyper::rt::Read::poll_read(Pin::new(&mut self.0), cx, buf)
    }
}

impl hyper::rt::Write for ProxiedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        hyper::rt::Write::poll_write(Pin::new(&mut self.0), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_flush(Pin::new(&mut self.0), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_shutdown(Pin::new(&mut self.0), cx)
    }
}

/// Map tower errors to `HttpError` with the configured timeout
fn map_tower_error(err: BoxError, timeout: Duration) -> HttpError {
    if err.is::<tower::timeout::error::Elapsed>() {
        return HttpError::Timeout(timeout);
    }
    match err.downcast::<HttpError>() {
        Ok(http_err) => *http_err,
        Err(other) => HttpError::Transport(other),
    }
}
