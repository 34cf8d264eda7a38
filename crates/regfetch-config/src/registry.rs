use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ConfigError, Result};

/// A registry endpoint the client can pull from.
#[derive(Clone, Deserialize, Serialize)]
pub struct Registry {
    /// Unique name used to select the registry.
    pub name: String,

    /// Base URL of the registry, e.g. `https://registry-1.docker.io`.
    pub url: String,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Refresh token issued by `docker login`, used instead of a password.
    pub identity_token: Option<String>,
}

/// Credentials presented to a token realm.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Credentials {
    Basic { username: String, password: String },
    IdentityToken(String),
}

impl Credentials {
    /// Stable identifier used in cache keys without exposing the secret.
    pub fn principal(&self) -> &str {
        match self {
            Credentials::Basic { username, .. } => username,
            Credentials::IdentityToken(_) => "<identity-token>",
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Basic { username, .. } => {
                f.debug_struct("Basic")
                    .field("username", username)
                    .field("password", &"<redacted>")
                    .finish()
            }
            Credentials::IdentityToken(_) => f.write_str("IdentityToken(<redacted>)"),
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("credentials", &self.credentials())
            .finish()
    }
}

impl Registry {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            username: None,
            password: None,
            identity_token: None,
        }
    }

    /// Parsed base URL. Only absolute `http`/`https` URLs with a host are accepted.
    pub fn base_url(&self) -> Result<Url> {
        let invalid = || {
            ConfigError::InvalidRegistryUrl {
                name: self.name.clone(),
                url: self.url.clone(),
            }
        };

        let url = Url::parse(self.url.trim()).map_err(|_| invalid())?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(invalid());
        }
        Ok(url)
    }

    /// Identity token wins over username/password.
    pub fn credentials(&self) -> Option<Credentials> {
        if let Some(token) = self.identity_token.as_ref().filter(|t| !t.is_empty()) {
            return Some(Credentials::IdentityToken(token.clone()));
        }

        match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                Some(Credentials::Basic {
                    username: username.clone(),
                    password: password.clone(),
                })
            }
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.base_url()?;
        if self.username.is_some() && self.password.is_none() && self.identity_token.is_none() {
            return Err(ConfigError::IncompleteCredentials(self.name.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_validation() {
        let ok = Registry::new("hub", "https://registry-1.docker.io");
        assert_eq!(ok.base_url().unwrap().host_str(), Some("registry-1.docker.io"));

        let local = Registry::new("local", "http://localhost:5000");
        assert_eq!(local.base_url().unwrap().port(), Some(5000));

        for bad in ["registry-1.docker.io", "ftp://example.com", "https://", ""] {
            let registry = Registry::new("bad", bad);
            assert!(
                matches!(
                    registry.base_url(),
                    Err(ConfigError::InvalidRegistryUrl { .. })
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_credentials_precedence() {
        let mut registry = Registry::new("hub", "https://example.com");
        assert!(registry.credentials().is_none());

        registry.username = Some("alice".into());
        assert!(registry.credentials().is_none());
        assert!(matches!(
            registry.validate(),
            Err(ConfigError::IncompleteCredentials(_))
        ));

        registry.password = Some("secret".into());
        assert_eq!(
            registry.credentials(),
            Some(Credentials::Basic {
                username: "alice".into(),
                password: "secret".into()
            })
        );

        registry.identity_token = Some("refresh".into());
        assert_eq!(
            registry.credentials(),
            Some(Credentials::IdentityToken("refresh".into()))
        );
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut registry = Registry::new("hub", "https://example.com");
        registry.username = Some("alice".into());
        registry.password = Some("hunter2".into());

        let debug = format!("{registry:?}");
        assert!(debug.contains("alice"));
        assert!(!debug.contains("hunter2"));
    }
}
