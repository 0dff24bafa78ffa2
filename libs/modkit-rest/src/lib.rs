#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! REST client layer for `ModKit`
//!
//! Sits on a hyper/rustls transport and returns structured data instead of bytes:
//! - Content negotiation: the body format comes from the `format` option or the
//!   response `Content-Type` (XML, JSON, YAML, plain)
//! - Pluggable parsing via [`Parser::Custom`]
//! - Bounded redirect following with verb rewriting and cookie accumulation
//! - Basic and digest authentication
//! - Transparent gzip/deflate decompression
//! - Per-hop TLS with optional PEM client identity, proxies and timeouts
//!
//! # Example
//!
//! ```ignore
//! use modkit_rest::{Format, RequestBuilder};
//!
//! let response = RequestBuilder::get("/v1/users")
//!     .base_uri("https://api.example.com")
//!     .basic_auth("user", "secret")
//!     .perform()
//!     .await?;
//!
//! assert_eq!(response.code(), 200);
//! let first = &response[0]["name"];
//! ```

mod auth;
mod builder;
mod config;
mod connection;
mod cookies;
mod deflate;
mod error;
pub mod layers;
mod parser;
mod query;
mod request;
mod response;
mod tls;

pub use auth::{AuthInjector, DigestChallenge};
pub use builder::RequestBuilder;
pub use config::{
    Body, Credentials, DEFAULT_MAX_BODY_SIZE, DEFAULT_MAX_REDIRECTS, DEFAULT_USER_AGENT,
    DebugSink, ProxyConfig, Query, RedirectPolicy, RequestOptions, SUPPORTED_METHODS,
    TlsRootConfig,
};
pub use connection::{
    Connect, Connection, ConnectionSettings, HopService, TransportConnector, build_raw_request,
};
pub use cookies::merge_cookies;
pub use deflate::DeflationHandler;
pub use error::{HttpError, InvalidUriKind};
pub use parser::{Format, Parser, ParserFn, XML_CONTENT_KEY, format_from_mimetype, parse_body};
pub use query::{NormalizerFn, ParamValue, Params, QueryNormalizer, encode_query, params};
pub use request::{HopState, Request};
pub use response::{ERROR_BODY_PREVIEW_LIMIT, RawResponse, Response};
pub use tls::ClientIdentity;
