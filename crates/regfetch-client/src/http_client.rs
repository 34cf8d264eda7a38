use regfetch_config::http::HttpClientConfig;
use ureq::{
    http::{self, Uri},
    Agent,
};

use crate::{
    error::TransportError,
    http::{HttpRequest, HttpResponse},
};

/// A single HTTP exchange. Retries, auth and caching sit above this seam.
pub trait Transport: Send + Sync {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// [`Transport`] backed by a blocking `ureq` agent.
///
/// Error statuses come back as plain responses so the executor can see
/// them. With redirects disabled, 3xx answers are returned untouched.
pub struct UreqTransport {
    agent: Agent,
}

impl UreqTransport {
    pub fn new(config: &HttpClientConfig) -> Self {
        let mut builder = Agent::config_builder()
            .timeout_connect(Some(config.connect_timeout))
            .timeout_global(Some(config.request_timeout))
            .user_agent(&config.user_agent)
            .http_status_as_error(false);

        if !config.follow_redirects {
            builder = builder.max_redirects(0).max_redirects_will_error(false);
        }

        Self {
            agent: builder.build().into(),
        }
    }
}

impl Transport for UreqTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let uri: Uri = request
            .url
            .as_str()
            .parse()
            .map_err(|err: http::uri::InvalidUri| TransportError::InvalidRequest(err.to_string()))?;

        let mut builder = http::Request::builder()
            .method(request.method.clone())
            .uri(uri);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = match &request.body {
            Some(body) => {
                let req = builder
                    .body(body.as_slice())
                    .map_err(|err| TransportError::InvalidRequest(err.to_string()))?;
                self.agent.run(req)?
            }
            None => {
                let req = builder
                    .body(())
                    .map_err(|err| TransportError::InvalidRequest(err.to_string()))?;
                self.agent.run(req)?
            }
        };

        let (parts, body) = response.into_parts();
        Ok(HttpResponse::new(
            parts.status.as_u16(),
            parts.headers,
            body.into_reader(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use url::Url;

    use super::*;

    #[test]
    fn test_transport_builds_from_config() {
        let config = HttpClientConfig::builder()
            .connect_timeout(Duration::from_secs(1))
            .follow_redirects(false)
            .build()
            .unwrap();
        let _ = UreqTransport::new(&config);
    }

    #[test]
    fn test_unreachable_host_is_transport_error() {
        let config = HttpClientConfig::builder()
            .connect_timeout(Duration::from_millis(200))
            .request_timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        let transport = UreqTransport::new(&config);

        // Port 9 on loopback is the discard service and is never served in CI.
        let url = Url::parse("http://127.0.0.1:9/v2/").unwrap();
        let result = transport.send(&HttpRequest::get(url));
        assert!(result.is_err());
    }
}
