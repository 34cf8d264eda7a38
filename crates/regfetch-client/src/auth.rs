//! Registry authentication: challenge discovery, token exchange and a
//! TTL-bound token cache.
//!
//! The anonymous probe (`GET /v2/`) tells whether a registry wants
//! credentials at all. A `401` carries a `WWW-Authenticate` challenge that
//! names the token realm. Tokens are cached per registry host, scope and
//! principal until their lifetime runs out or the origin rejects them.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use regfetch_config::registry::Credentials;
use serde::Deserialize;
use tracing::{debug, warn};
use ureq::http::{
    header::{AUTHORIZATION, WWW_AUTHENTICATE},
    HeaderValue,
};
use url::Url;

use crate::{
    error::{AuthKind, ClientError, ParseKind, Result},
    http::{HttpExecutor, HttpRequest, HttpResponse},
};

const TOKEN_EXPIRES_HEADER: &str = "docker-token-expires-in";
const MAX_TOKEN_RESPONSE: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Basic,
    Bearer,
}

/// A parsed `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: AuthScheme,
    params: HashMap<String, String>,
}

impl Challenge {
    /// Parses `Bearer realm="...",service="...",scope="..."` or `Basic realm="..."`.
    ///
    /// Parameter names are case-insensitive. Quoted values may contain commas.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, rest) = header.split_once(char::is_whitespace).unwrap_or((header, ""));
        let scheme = if scheme.eq_ignore_ascii_case("bearer") {
            AuthScheme::Bearer
        } else if scheme.eq_ignore_ascii_case("basic") {
            AuthScheme::Basic
        } else {
            return None;
        };

        let params = parse_params(rest);
        if scheme == AuthScheme::Bearer && !params.contains_key("realm") {
            return None;
        }

        Some(Self {
            scheme,
            params,
        })
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn realm(&self) -> Option<&str> {
        self.param("realm")
    }

    pub fn service(&self) -> Option<&str> {
        self.param("service")
    }

    pub fn scope(&self) -> Option<&str> {
        self.param("scope")
    }

    /// The same challenge without its resource scope, safe to reuse for
    /// other repositories on the host.
    pub fn without_scope(&self) -> Self {
        let mut challenge = self.clone();
        challenge.params.remove("scope");
        challenge
    }
}

fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut rest = input.trim_start();

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else {
            break;
        };
        let key = rest[..eq].trim().to_ascii_lowercase();
        rest = rest[eq + 1..].trim_start();

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let mut value = String::new();
            let mut chars = quoted.char_indices();
            let mut consumed = quoted.len();
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => {
                        if let Some((_, escaped)) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        consumed = i + 1;
                        break;
                    }
                    c => value.push(c),
                }
            }
            rest = &quoted[consumed..];
            value
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = rest[..end].trim().to_string();
            rest = &rest[end..];
            value
        };

        if !key.is_empty() {
            params.insert(key, value);
        }
        rest = rest.trim_start().trim_start_matches(',').trim_start();
    }

    params
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

struct CachedToken {
    value: HeaderValue,
    expires_at: Instant,
}

/// Obtains and caches `Authorization` header values for registry requests.
pub struct AuthService {
    executor: HttpExecutor,
    default_ttl: Duration,
    tokens: Mutex<HashMap<String, CachedToken>>,
    challenges: Mutex<HashMap<String, Option<Challenge>>>,
}

impl AuthService {
    pub fn new(executor: HttpExecutor, default_ttl: Duration) -> Self {
        Self {
            executor,
            default_ttl,
            tokens: Mutex::new(HashMap::new()),
            challenges: Mutex::new(HashMap::new()),
        }
    }

    /// `Authorization` value to attach for `scope` on `base`, or `None` when
    /// the registry serves anonymous requests.
    pub fn authorize(
        &self,
        base: &Url,
        scope: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Option<HeaderValue>> {
        let key = cache_key(base, scope, credentials);
        if let Some(value) = self.cached(&key) {
            return Ok(Some(value));
        }

        match self.challenge_for(base)? {
            Some(challenge) => self.token_for(&challenge, &key, scope, credentials).map(Some),
            None => Ok(None),
        }
    }

    /// Handles a `401` from a resource request: forgets the rejected token
    /// and acquires a new one from the challenge in `response`.
    pub fn reauthorize(
        &self,
        base: &Url,
        scope: &str,
        credentials: Option<&Credentials>,
        response: &HttpResponse,
    ) -> Result<HeaderValue> {
        let key = cache_key(base, scope, credentials);
        self.invalidate(&key);

        let challenge = response
            .header(WWW_AUTHENTICATE)
            .and_then(Challenge::parse)
            .ok_or_else(|| {
                ClientError::auth(
                    AuthKind::MissingChallenge,
                    Some(response.status),
                    format!("{base} answered 401 without a usable WWW-Authenticate challenge"),
                )
            })?;

        self.challenges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host_key(base), Some(challenge.without_scope()));

        self.token_for(&challenge, &key, scope, credentials)
    }

    fn invalidate(&self, key: &str) {
        if self
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
        {
            debug!("dropped cached token for {}", key);
        }
    }

    fn cached(&self, key: &str) -> Option<HeaderValue> {
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        match tokens.get(key) {
            Some(token) if token.expires_at > Instant::now() => Some(token.value.clone()),
            Some(_) => {
                tokens.remove(key);
                None
            }
            None => None,
        }
    }

    /// The challenge presented by the anonymous probe, remembered per host.
    fn challenge_for(&self, base: &Url) -> Result<Option<Challenge>> {
        let host = host_key(base);
        if let Some(known) = self
            .challenges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&host)
        {
            return Ok(known.clone());
        }

        let challenge = self.ping(base)?.map(|c| c.without_scope());
        self.challenges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host, challenge.clone());
        Ok(challenge)
    }

    fn ping(&self, base: &Url) -> Result<Option<Challenge>> {
        let url = base.join("/v2/").map_err(|source| {
            ClientError::InvalidUrl {
                url: base.to_string(),
                source,
            }
        })?;

        let response = self.executor.execute(&HttpRequest::get(url.clone()))?;
        match response.status {
            200 => {
                debug!("{} accepts anonymous requests", url);
                Ok(None)
            }
            401 => {
                response
                    .header(WWW_AUTHENTICATE)
                    .and_then(Challenge::parse)
                    .map(Some)
                    .ok_or_else(|| {
                        ClientError::auth(
                            AuthKind::MissingChallenge,
                            Some(401),
                            format!("{url} answered 401 without a usable WWW-Authenticate challenge"),
                        )
                    })
            }
            status => {
                Err(ClientError::auth(
                    AuthKind::UnexpectedPingStatus,
                    Some(status),
                    format!("probe of {url} returned HTTP {status}"),
                ))
            }
        }
    }

    fn token_for(
        &self,
        challenge: &Challenge,
        key: &str,
        scope: &str,
        credentials: Option<&Credentials>,
    ) -> Result<HeaderValue> {
        match challenge.scheme {
            AuthScheme::Basic => {
                match credentials {
                    Some(Credentials::Basic {
                        username,
                        password,
                    }) => sensitive(&basic_value(username, password)),
                    _ => {
                        Err(ClientError::auth(
                            AuthKind::NoToken,
                            None,
                            "registry requires basic credentials but none are configured",
                        ))
                    }
                }
            }
            AuthScheme::Bearer => {
                let (token, ttl) = self.fetch_token(challenge, scope, credentials)?;
                let value = sensitive(&format!("Bearer {token}"))?;
                self.tokens
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(
                        key.to_string(),
                        CachedToken {
                            value: value.clone(),
                            expires_at: Instant::now() + ttl,
                        },
                    );
                Ok(value)
            }
        }
    }

    /// Single-attempt token exchange against the challenge realm.
    fn fetch_token(
        &self,
        challenge: &Challenge,
        scope: &str,
        credentials: Option<&Credentials>,
    ) -> Result<(String, Duration)> {
        let realm = challenge.realm().ok_or_else(|| {
            ClientError::auth(AuthKind::MissingChallenge, None, "bearer challenge has no realm")
        })?;
        let mut url = Url::parse(realm).map_err(|source| {
            ClientError::InvalidUrl {
                url: realm.to_string(),
                source,
            }
        })?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = challenge.service() {
                query.append_pair("service", service);
            }
            let scope = challenge.scope().unwrap_or(scope);
            if !scope.is_empty() {
                query.append_pair("scope", scope);
            }
        }

        let mut request = HttpRequest::get(url.clone()).retry(false);
        match credentials {
            Some(Credentials::Basic {
                username,
                password,
            }) => {
                request = request.header(AUTHORIZATION, sensitive(&basic_value(username, password))?);
            }
            Some(Credentials::IdentityToken(token)) => {
                request = request.header(AUTHORIZATION, sensitive(&format!("Bearer {token}"))?);
            }
            None => {}
        }

        debug!("requesting token from {}", url);
        let response = self.executor.send_once(&request).map_err(|err| {
            ClientError::auth(
                AuthKind::TokenFailed,
                None,
                format!("token request to {url} failed: {err}"),
            )
        })?;

        if response.status != 200 {
            return Err(ClientError::auth(
                AuthKind::TokenFailed,
                Some(response.status),
                format!("token endpoint {url} returned HTTP {}", response.status),
            ));
        }

        let header_ttl = response
            .header(TOKEN_EXPIRES_HEADER)
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response.read_body(MAX_TOKEN_RESPONSE).map_err(|err| {
            ClientError::auth(
                AuthKind::TokenFailed,
                Some(200),
                format!("reading token response from {url} failed: {err}"),
            )
        })?;

        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|err| ClientError::parse(ParseKind::Token, err.to_string()))?;

        let token = parsed
            .token
            .or(parsed.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                ClientError::auth(
                    AuthKind::NoToken,
                    Some(200),
                    format!("token endpoint {url} returned no token"),
                )
            })?;

        let ttl = match parsed.expires_in.or(header_ttl).filter(|s| *s > 0) {
            Some(secs) => Duration::from_secs(secs),
            None => {
                warn!(
                    "token from {} carries no lifetime, assuming {:?}",
                    url, self.default_ttl
                );
                self.default_ttl
            }
        };

        Ok((token, ttl))
    }
}

fn basic_value(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
}

fn sensitive(value: &str) -> Result<HeaderValue> {
    let mut value = HeaderValue::from_str(value).map_err(|_| {
        ClientError::parse(ParseKind::Token, "credential contains characters not allowed in a header")
    })?;
    value.set_sensitive(true);
    Ok(value)
}

fn host_key(base: &Url) -> String {
    format!(
        "{}:{}",
        base.host_str().unwrap_or_default(),
        base.port_or_known_default().unwrap_or_default()
    )
}

fn cache_key(base: &Url, scope: &str, credentials: Option<&Credentials>) -> String {
    format!(
        "{}|{}|{}",
        host_key(base),
        scope,
        credentials.map(Credentials::principal).unwrap_or_default()
    )
}
