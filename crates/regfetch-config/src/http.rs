use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    error::{ConfigError, Result},
    utils::duration_str,
};

pub const DEFAULT_USER_AGENT: &str = concat!("regfetch/", env!("CARGO_PKG_VERSION"));

/// Transport policy shared by every request the client makes.
///
/// Timeouts apply per attempt. Retries only ever happen for transient
/// statuses and I/O failures, and with `idempotent_only` set only for
/// requests that are safe to repeat.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// Time allowed to establish a connection.
    /// Default: 5s
    #[serde(with = "duration_str")]
    pub connect_timeout: Duration,

    /// Time allowed for a whole request, body included.
    /// Default: 30s
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,

    /// Retries after the first attempt.
    /// Default: 2
    pub max_retries: u32,

    /// Default: 200ms
    #[serde(with = "duration_str")]
    pub initial_backoff: Duration,

    /// Default: 2s
    #[serde(with = "duration_str")]
    pub max_backoff: Duration,

    /// Refuse to retry requests that are not idempotent.
    /// Default: true
    pub idempotent_only: bool,

    pub user_agent: String,

    /// Default: true
    pub follow_redirects: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            max_retries: 2,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            idempotent_only: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            follow_redirects: true,
        }
    }
}

impl HttpClientConfig {
    pub fn builder() -> HttpClientConfigBuilder {
        HttpClientConfigBuilder::default()
    }

    /// Rejects settings that contradict each other or make every request fail.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(ConfigError::InvalidHttpConfig(msg.to_string()));

        if self.connect_timeout.is_zero() {
            return invalid("connect_timeout must be greater than zero");
        }
        if self.request_timeout.is_zero() {
            return invalid("request_timeout must be greater than zero");
        }
        if self.initial_backoff.is_zero() || self.max_backoff.is_zero() {
            return invalid("backoff durations must be greater than zero");
        }
        if self.initial_backoff > self.max_backoff {
            return invalid("initial_backoff must not exceed max_backoff");
        }
        if self.user_agent.trim().is_empty() {
            return invalid("user_agent must not be blank");
        }

        Ok(())
    }
}

#[derive(Default)]
pub struct HttpClientConfigBuilder {
    config: HttpClientConfig,
}

impl HttpClientConfigBuilder {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.config.initial_backoff = backoff;
        self
    }

    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.config.max_backoff = backoff;
        self
    }

    pub fn idempotent_only(mut self, enabled: bool) -> Self {
        self.config.idempotent_only = enabled;
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.config.user_agent = agent.into();
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = follow;
        self
    }

    pub fn build(self) -> Result<HttpClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HttpClientConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.initial_backoff, Duration::from_millis(200));
        assert_eq!(config.max_backoff, Duration::from_secs(2));
        assert!(config.idempotent_only);
        assert!(config.follow_redirects);
        assert!(config.user_agent.starts_with("regfetch/"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_overrides() {
        let config = HttpClientConfig::builder()
            .max_retries(5)
            .initial_backoff(Duration::from_millis(1))
            .max_backoff(Duration::from_millis(10))
            .idempotent_only(false)
            .follow_redirects(false)
            .user_agent("custom/1.0")
            .build()
            .unwrap();

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.initial_backoff, Duration::from_millis(1));
        assert!(!config.idempotent_only);
        assert!(!config.follow_redirects);
        assert_eq!(config.user_agent, "custom/1.0");
    }

    #[test]
    fn test_builder_rejects_contradictions() {
        let inverted = HttpClientConfig::builder()
            .initial_backoff(Duration::from_secs(5))
            .max_backoff(Duration::from_secs(1))
            .build();
        assert!(matches!(inverted, Err(ConfigError::InvalidHttpConfig(_))));

        let zero_timeout = HttpClientConfig::builder()
            .connect_timeout(Duration::ZERO)
            .build();
        assert!(matches!(
            zero_timeout,
            Err(ConfigError::InvalidHttpConfig(_))
        ));

        let blank_agent = HttpClientConfig::builder().user_agent("  ").build();
        assert!(matches!(blank_agent, Err(ConfigError::InvalidHttpConfig(_))));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: HttpClientConfig =
            toml::from_str("max_retries = 4\ninitial_backoff = \"50ms\"").unwrap();
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.initial_backoff, Duration::from_millis(50));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }
}
