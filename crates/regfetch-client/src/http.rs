use std::{
    fmt,
    io::{self, Read},
    sync::Arc,
    thread,
    time::Duration,
};

use rand::Rng;
use regfetch_config::http::HttpClientConfig;
use tracing::{debug, warn};
use ureq::http::{
    header::{AsHeaderName, CONTENT_LENGTH, RETRY_AFTER},
    HeaderMap, HeaderName, HeaderValue, Method,
};
use url::Url;

use crate::{
    error::{is_transient_status, ClientError, HttpKind, Result, TransportError},
    http_client::Transport,
};

/// A request as handed to a [`Transport`].
#[derive(Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
    /// Whether the executor may repeat this request. Defaults to the
    /// method's idempotency.
    pub retry: bool,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        let retry = method.is_idempotent();
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            retry,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn head(url: Url) -> Self {
        Self::new(Method::HEAD, url)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    pub fn is_idempotent(&self) -> bool {
        self.method.is_idempotent()
    }
}

impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Status, headers and a streaming body.
pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Box<dyn Read + Send>,
}

impl HttpResponse {
    pub fn new(status: u16, headers: HeaderMap, body: impl Read + Send + 'static) -> Self {
        Self {
            status,
            headers,
            body: Box::new(body),
        }
    }

    pub fn header(&self, name: impl AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header(CONTENT_LENGTH)?.trim().parse().ok()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Fails with `BAD_STATUS` unless the status is 2xx.
    pub fn expect_success(self, context: impl fmt::Display) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ClientError::bad_status(self.status, context))
        }
    }

    /// Reads the whole body, refusing bodies longer than `limit`.
    pub fn read_body(self, limit: u64) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.body.take(limit + 1).read_to_end(&mut buf)?;
        if buf.len() as u64 > limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("response body exceeds {limit} bytes"),
            ));
        }
        Ok(buf)
    }

    pub fn into_reader(self) -> Box<dyn Read + Send> {
        self.body
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Runs requests through a [`Transport`] with retry and backoff.
///
/// Only transient statuses (429, 500, 502, 503, 504) and transient I/O
/// failures are retried, at most `max_retries` times after the first
/// attempt. Every other answer is returned to the caller as-is; callers
/// decide what a 404 means.
#[derive(Clone)]
pub struct HttpExecutor {
    transport: Arc<dyn Transport>,
    config: HttpClientConfig,
}

impl HttpExecutor {
    pub fn new(transport: Arc<dyn Transport>, config: HttpClientConfig) -> Self {
        Self {
            transport,
            config,
        }
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    fn check_idempotency(&self, idempotent: bool) -> Result<()> {
        if self.config.idempotent_only && !idempotent {
            return Err(ClientError::Config(
                "retries are limited to idempotent requests by configuration".into(),
            ));
        }
        Ok(())
    }

    /// Whether a response with `status` should be retried after `attempt`
    /// earlier retries.
    ///
    /// Asking about a non-idempotent request under `idempotent_only` is a
    /// usage error, whatever the status or attempt.
    pub fn should_retry(&self, status: u16, attempt: u32, idempotent: bool) -> Result<bool> {
        self.check_idempotency(idempotent)?;
        Ok(attempt < self.config.max_retries && is_transient_status(status))
    }

    /// Same as [`should_retry`](Self::should_retry) for a failed exchange.
    pub fn should_retry_io(&self, attempt: u32, idempotent: bool) -> Result<bool> {
        self.check_idempotency(idempotent)?;
        Ok(attempt < self.config.max_retries)
    }

    /// Delay before retry number `attempt + 1`.
    ///
    /// Grows as `initial * 2^attempt` plus up to `initial` of jitter, never
    /// above `max_backoff`. A server-supplied `Retry-After` replaces the
    /// computed delay, still capped at `max_backoff`.
    pub fn backoff_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let max = self.config.max_backoff;
        if let Some(delay) = retry_after {
            return delay.min(max);
        }

        let base = self.config.initial_backoff;
        let expo = base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        let base_ms = base.as_millis().max(1) as u64;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..base_ms));
        expo.saturating_add(jitter).min(max)
    }

    pub(crate) fn pause(&self, attempt: u32, retry_after: Option<Duration>) {
        let delay = self.backoff_delay(attempt, retry_after);
        debug!("backing off for {:?} before retry {}", delay, attempt + 1);
        thread::sleep(delay);
    }

    /// Sends `request`, retrying transient failures when the request allows it.
    ///
    /// Non-transient statuses are returned, not turned into errors. Running
    /// out of retries on a transient status or I/O failure yields
    /// `RETRY_EXHAUSTED`; a non-transient I/O failure yields `NETWORK`.
    pub fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let idempotent = request.is_idempotent();
        if request.retry {
            self.check_idempotency(idempotent)?;
        }

        let mut attempt = 0;
        loop {
            debug!(
                "{} {} (attempt {})",
                request.method,
                request.url,
                attempt + 1
            );

            match self.transport.send(request) {
                Ok(response) => {
                    if !is_transient_status(response.status) || !request.retry {
                        return Ok(response);
                    }
                    if !self.should_retry(response.status, attempt, idempotent)? {
                        return Err(ClientError::http(
                            HttpKind::RetryExhausted,
                            Some(response.status),
                            format!(
                                "{} {} still failing with HTTP {} after {} attempts",
                                request.method,
                                request.url,
                                response.status,
                                attempt + 1
                            ),
                        ));
                    }
                    warn!(
                        "{} {} returned HTTP {}, retrying",
                        request.method, request.url, response.status
                    );
                    let retry_after = retry_after(&response);
                    self.pause(attempt, retry_after);
                }
                Err(err) => {
                    if !err.is_transient() || !request.retry {
                        return Err(network_error(request, err));
                    }
                    if !self.should_retry_io(attempt, idempotent)? {
                        return Err(ClientError::Http {
                            kind: HttpKind::RetryExhausted,
                            status: None,
                            message: format!(
                                "{} {} failed after {} attempts",
                                request.method,
                                request.url,
                                attempt + 1
                            ),
                            source: Some(err),
                        });
                    }
                    warn!("{} {} failed: {}, retrying", request.method, request.url, err);
                    self.pause(attempt, None);
                }
            }

            attempt += 1;
        }
    }

    /// A single exchange with no retries. Used for token requests.
    pub fn send_once(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.transport
            .send(request)
            .map_err(|err| network_error(request, err))
    }
}

fn network_error(request: &HttpRequest, err: TransportError) -> ClientError {
    ClientError::Http {
        kind: HttpKind::Network,
        status: None,
        message: format!("{} {} failed: {}", request.method, request.url, err),
        source: Some(err),
    }
}

/// `Retry-After` in its delta-seconds form. HTTP dates are ignored.
pub fn retry_after(response: &HttpResponse) -> Option<Duration> {
    response
        .header(RETRY_AFTER)?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// `Range` header value for `start..=end`, or `start..` when `end` is `None`.
pub fn build_range_header(start: u64, end: Option<u64>) -> Result<String> {
    match end {
        Some(end) if end < start => {
            Err(ClientError::Config(format!(
                "range end {end} is before start {start}"
            )))
        }
        Some(end) => Ok(format!("bytes={start}-{end}")),
        None => Ok(format!("bytes={start}-")),
    }
}

/// Assembles an absolute URL. `port` of `None` means the scheme's default,
/// and a missing leading `/` on `path` is added.
///
/// `host` must be a bare host name or address; anything that would parse
/// into a different host is rejected.
pub fn build_request_uri(
    scheme: &str,
    host: &str,
    port: Option<u16>,
    path: &str,
    query: Option<&str>,
) -> Result<Url> {
    let host = host.trim();
    if host.is_empty() {
        return Err(ClientError::Config("request host is blank".to_string()));
    }

    let authority = match port {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let slash = if path.starts_with('/') { "" } else { "/" };
    let mut raw = format!("{scheme}://{authority}{slash}{path}");
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        raw.push('?');
        raw.push_str(query);
    }

    let url = Url::parse(&raw).map_err(|source| {
        ClientError::InvalidUrl {
            url: raw.clone(),
            source,
        }
    })?;

    if !url
        .host_str()
        .is_some_and(|parsed| parsed.eq_ignore_ascii_case(host))
    {
        return Err(ClientError::Config(format!(
            "`{host}` is not a plain host name (parsed {raw} as host {:?})",
            url.host_str().unwrap_or_default()
        )));
    }
    Ok(url)
}
