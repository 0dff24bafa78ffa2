//! Authorization header injection.
//!
//! Basic credentials are encoded straight into the header. Digest credentials need
//! the server's challenge first, so [`AuthInjector::apply`] sends a `HEAD` request to
//! the same URI over the hop's connection, reads `WWW-Authenticate`, and answers it.

use base64::Engine;
use base64::engine::general_purpose;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, WWW_AUTHENTICATE};
use http::{HeaderMap, HeaderValue, Method};
use md5::{Digest, Md5};
use url::Url;
use zeroize::Zeroizing;

use crate::config::{Credentials, RequestOptions};
use crate::connection::{Connection, build_raw_request};
use crate::error::HttpError;

/// Nonce count sent with every digest answer; each challenge is answered once.
const NONCE_COUNT: &str = "00000001";

/// Authentication attached to every hop of a request.
#[derive(Debug, Clone, Default)]
pub enum AuthInjector {
    #[default]
    None,
    Basic(Credentials),
    Digest(Credentials),
}

impl AuthInjector {
    /// Select the injector for `options`, which must already have passed
    /// [`RequestOptions::validate`]. Basic wins if both are somehow set.
    #[must_use]
    pub fn from_options(options: &RequestOptions) -> Self {
        match (&options.basic_auth, &options.digest_auth) {
            (Some(creds), _) => AuthInjector::Basic(creds.clone()),
            (None, Some(creds)) => AuthInjector::Digest(creds.clone()),
            (None, None) => AuthInjector::None,
        }
    }

    /// Set `Authorization` on `headers` for a `method` request to `uri`.
    ///
    /// Digest sends one extra `HEAD` round-trip. If that response carries no digest
    /// challenge the request goes out unauthenticated.
    ///
    /// # Errors
    /// Returns transport errors from the `HEAD` round-trip, or
    /// `HttpError::InvalidHeaderValue` if the credentials cannot be carried in a header.
    pub async fn apply(
        &self,
        connection: &Connection,
        method: &Method,
        uri: &Url,
        headers: &mut HeaderMap,
    ) -> Result<(), HttpError> {
        match self {
            AuthInjector::None => Ok(()),
            AuthInjector::Basic(creds) => {
                headers.insert(AUTHORIZATION, basic_header(creds)?);
                Ok(())
            }
            AuthInjector::Digest(creds) => {
                let mut challenge_headers = headers.clone();
                challenge_headers.remove(CONTENT_TYPE);
                challenge_headers.remove(CONTENT_LENGTH);
                challenge_headers.remove(AUTHORIZATION);
                let head = build_raw_request(&Method::HEAD, uri, challenge_headers, None)?;
                let response = connection.send(head).await?;

                let challenge = response
                    .headers
                    .get_all(WWW_AUTHENTICATE)
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .find_map(DigestChallenge::parse);

                let Some(challenge) = challenge else {
                    tracing::debug!(
                        status = %response.status,
                        "digest HEAD returned no challenge; sending request without credentials"
                    );
                    return Ok(());
                };

                tracing::debug!(
                    realm = %challenge.realm,
                    qop = ?challenge.qop,
                    algorithm = ?challenge.algorithm,
                    "answering digest challenge"
                );
                let cnonce = format!("{:016x}", rand::random::<u64>());
                let value = challenge.authorization(creds, method, &request_target(uri), &cnonce);
                let mut value = HeaderValue::from_str(&value)?;
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
                Ok(())
            }
        }
    }
}

fn basic_header(creds: &Credentials) -> Result<HeaderValue, HttpError> {
    let plain = Zeroizing::new(format!("{}:{}", creds.username, creds.password()));
    let encoded = Zeroizing::new(general_purpose::STANDARD.encode(plain.as_bytes()));
    let header = Zeroizing::new(format!("Basic {}", &*encoded));
    let mut value = HeaderValue::from_str(&header)?;
    value.set_sensitive(true);
    Ok(value)
}

/// Path plus query, as sent on the request line.
fn request_target(uri: &Url) -> String {
    match uri.query() {
        Some(q) => format!("{}?{q}", uri.path()),
        None => uri.path().to_owned(),
    }
}

fn md5_hex(data: &str) -> String {
    hex::encode(Md5::digest(data.as_bytes()))
}

/// Parameters of a `WWW-Authenticate: Digest ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: Option<String>,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
}

impl DigestChallenge {
    /// Parse a challenge header value. Non-digest schemes yield `None`.
    #[must_use]
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(char::is_whitespace)?;
        if !scheme.eq_ignore_ascii_case("digest") {
            return None;
        }

        let mut realm = None;
        let mut nonce = None;
        let mut qop = None;
        let mut opaque = None;
        let mut algorithm = None;
        for (key, value) in challenge_params(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "qop" => qop = Some(value),
                "opaque" => opaque = Some(value),
                "algorithm" => algorithm = Some(value),
                _ => {}
            }
        }

        Some(Self {
            realm: realm.unwrap_or_default(),
            nonce: nonce?,
            qop,
            opaque,
            algorithm,
        })
    }

    fn is_session(&self) -> bool {
        self.algorithm
            .as_deref()
            .is_some_and(|a| a.eq_ignore_ascii_case("md5-sess"))
    }

    fn offers_auth_qop(&self) -> bool {
        self.qop
            .as_deref()
            .is_some_and(|q| q.split(',').any(|t| t.trim().eq_ignore_ascii_case("auth")))
    }

    /// Build the `Authorization` value answering this challenge.
    #[must_use]
    pub fn authorization(
        &self,
        creds: &Credentials,
        method: &Method,
        target: &str,
        cnonce: &str,
    ) -> String {
        let secret = Zeroizing::new(format!(
            "{}:{}:{}",
            creds.username,
            self.realm,
            creds.password()
        ));
        let mut ha1 = md5_hex(&secret);
        if self.is_session() {
            ha1 = md5_hex(&format!("{ha1}:{}:{cnonce}", self.nonce));
        }
        let ha2 = md5_hex(&format!("{method}:{target}"));

        let qop = self.offers_auth_qop();
        let response = if qop {
            md5_hex(&format!(
                "{ha1}:{}:{NONCE_COUNT}:{cnonce}:auth:{ha2}",
                self.nonce
            ))
        } else {
            md5_hex(&format!("{ha1}:{}:{ha2}", self.nonce))
        };

        let mut parts = vec![
            format!("username=\"{}\"", creds.username),
            format!("realm=\"{}\"", self.realm),
            format!("nonce=\"{}\"", self.nonce),
            format!("uri=\"{target}\""),
        ];
        if qop {
            parts.push(format!("cnonce=\"{cnonce}\""));
            parts.push(format!("nc={NONCE_COUNT}"));
            parts.push("qop=auth".to_owned());
        }
        parts.push(format!("response=\"{response}\""));
        if let Some(opaque) = &self.opaque {
            parts.push(format!("opaque=\"{opaque}\""));
        }
        if let Some(algorithm) = &self.algorithm {
            parts.push(format!("algorithm={algorithm}"));
        }
        format!("Digest {}", parts.join(", "))
    }
}

/// Split `k=v, k="v, with comma"` into pairs.
fn challenge_params(input: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_owned();
        let after = after.trim_start();
        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (quoted[..end].to_owned(), &quoted[end + 1..]),
                None => (quoted.to_owned(), ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (after[..end].trim().to_owned(), &after[end..]),
                None => (after.trim().to_owned(), ""),
            }
        };
        pairs.push((key, value));
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }
    pairs
}
