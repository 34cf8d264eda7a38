use std::{fmt, io};

use miette::Diagnostic;
use regfetch_config::error::ConfigError;
use thiserror::Error;

/// Statuses that indicate a temporary condition on the origin.
pub const TRANSIENT_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

pub fn is_transient_status(status: u16) -> bool {
    TRANSIENT_STATUSES.contains(&status)
}

macro_rules! kind_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

kind_enum!(
    /// Why authentication against a registry failed.
    AuthKind {
        UnexpectedPingStatus => "UNEXPECTED_PING_STATUS",
        MissingChallenge => "MISSING_CHALLENGE",
        TokenFailed => "TOKEN_FAILED",
        NoToken => "NO_TOKEN",
    }
);

kind_enum!(
    /// Why an HTTP exchange failed.
    HttpKind {
        RetryExhausted => "RETRY_EXHAUSTED",
        BadStatus => "BAD_STATUS",
        Network => "NETWORK",
    }
);

kind_enum!(
    /// Which document could not be parsed.
    ParseKind {
        Manifest => "MANIFEST",
        Token => "TOKEN",
        Config => "CONFIG",
    }
);

kind_enum!(
    IntegrityKind {
        DigestMismatch => "DIGEST_MISMATCH",
        SizeMismatch => "SIZE_MISMATCH",
    }
);

kind_enum!(
    ErrorCategory {
        Auth => "AUTH",
        Http => "HTTP",
        Parse => "PARSE",
        Integrity => "INTEGRITY",
        Cache => "CACHE",
        Usage => "USAGE",
    }
);

/// Failure of a single transport exchange, before any retry policy applies.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Network(Box<ureq::Error>),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<ureq::Error> for TransportError {
    fn from(e: ureq::Error) -> Self {
        match e {
            ureq::Error::Io(err) => Self::Io(err),
            other => Self::Network(Box::new(other)),
        }
    }
}

impl TransportError {
    /// Whether repeating the exchange has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Io(err) => is_transient_io(err),
            TransportError::Network(err) => {
                matches!(
                    err.as_ref(),
                    ureq::Error::Timeout(_) | ureq::Error::ConnectionFailed
                )
            }
            TransportError::InvalidRequest(_) => false,
        }
    }
}

pub(crate) fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::Interrupted
    )
}

/// Invalid repository coordinates.
#[derive(Error, Diagnostic, Debug, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("Repository must not be blank")]
    #[diagnostic(code(regfetch_client::blank_repository))]
    BlankRepository,

    #[error("Either a tag or a digest is required")]
    #[diagnostic(
        code(regfetch_client::missing_reference),
        help("Use repository:tag or repository@sha256:<hex>")
    )]
    MissingTagOrDigest,

    #[error("Invalid repository name: {0}")]
    #[diagnostic(
        code(regfetch_client::invalid_repository),
        help("Repository names use lowercase letters, digits and . _ - / separators")
    )]
    InvalidRepository(String),

    #[error("Invalid tag: {0}")]
    #[diagnostic(code(regfetch_client::invalid_tag))]
    InvalidTag(String),

    #[error("Invalid digest `{digest}`: {reason}")]
    #[diagnostic(
        code(regfetch_client::invalid_digest),
        help("Digests look like sha256:<64 lowercase hex characters>")
    )]
    InvalidDigest { digest: String, reason: String },
}

/// The single failure type returned by every client operation.
#[derive(Error, Diagnostic, Debug)]
pub enum ClientError {
    #[error("Authentication failed [{kind}]: {message}")]
    #[diagnostic(
        code(regfetch_client::auth),
        help("Check the registry credentials in your config file")
    )]
    Auth {
        kind: AuthKind,
        status: Option<u16>,
        message: String,
    },

    #[error("HTTP request failed [{kind}]: {message}")]
    #[diagnostic(code(regfetch_client::http))]
    Http {
        kind: HttpKind,
        status: Option<u16>,
        message: String,
        #[source]
        source: Option<TransportError>,
    },

    #[error("Failed to parse {kind}: {message}")]
    #[diagnostic(code(regfetch_client::parse))]
    Parse { kind: ParseKind, message: String },

    #[error("Integrity check failed [{kind}]: expected {expected}, got {actual}")]
    #[diagnostic(
        code(regfetch_client::integrity),
        help("The content received does not match what was requested")
    )]
    Integrity {
        kind: IntegrityKind,
        expected: String,
        actual: String,
    },

    #[error("Cache error: {message}")]
    #[diagnostic(
        code(regfetch_client::cache),
        help("Check permissions and free space of the cache directory")
    )]
    Cache {
        message: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("Invalid client usage: {0}")]
    #[diagnostic(code(regfetch_client::config))]
    Config(String),

    #[error("Invalid URL: {url}")]
    #[diagnostic(code(regfetch_client::invalid_url))]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Reference(#[from] ReferenceError),
}

impl ClientError {
    pub fn auth(kind: AuthKind, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Auth {
            kind,
            status,
            message: message.into(),
        }
    }

    pub fn http(kind: HttpKind, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Http {
            kind,
            status,
            message: message.into(),
            source: None,
        }
    }

    pub fn bad_status(status: u16, context: impl fmt::Display) -> Self {
        Self::http(
            HttpKind::BadStatus,
            Some(status),
            format!("{context} returned HTTP {status}"),
        )
    }

    pub fn parse(kind: ParseKind, message: impl Into<String>) -> Self {
        Self::Parse {
            kind,
            message: message.into(),
        }
    }

    pub fn cache(message: impl Into<String>, source: Option<io::Error>) -> Self {
        Self::Cache {
            message: message.into(),
            source,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ClientError::Auth { .. } => ErrorCategory::Auth,
            ClientError::Http { .. } => ErrorCategory::Http,
            ClientError::Parse { .. } => ErrorCategory::Parse,
            ClientError::Integrity { .. } => ErrorCategory::Integrity,
            ClientError::Cache { .. } => ErrorCategory::Cache,
            ClientError::Config(_) | ClientError::InvalidUrl { .. } | ClientError::Reference(_) => {
                ErrorCategory::Usage
            }
        }
    }

    /// HTTP status attached to the failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Auth { status, .. } | ClientError::Http { status, .. } => *status,
            _ => None,
        }
    }

    /// Whether a caller may reasonably repeat the whole operation later.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Http { kind, status, .. } => {
                match kind {
                    HttpKind::RetryExhausted | HttpKind::Network => true,
                    HttpKind::BadStatus => status.is_some_and(is_transient_status),
                }
            }
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Http { kind: HttpKind::BadStatus, status: Some(404), .. })
    }
}

impl From<ConfigError> for ClientError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_display() {
        assert_eq!(AuthKind::MissingChallenge.to_string(), "MISSING_CHALLENGE");
        assert_eq!(HttpKind::RetryExhausted.to_string(), "RETRY_EXHAUSTED");
        assert_eq!(ParseKind::Manifest.to_string(), "MANIFEST");
        assert_eq!(IntegrityKind::SizeMismatch.to_string(), "SIZE_MISMATCH");
    }

    #[test]
    fn test_category_is_unique_per_variant() {
        let cases = [
            (
                ClientError::auth(AuthKind::NoToken, Some(401), "x"),
                ErrorCategory::Auth,
            ),
            (ClientError::bad_status(404, "GET /v2/"), ErrorCategory::Http),
            (
                ClientError::parse(ParseKind::Token, "x"),
                ErrorCategory::Parse,
            ),
            (ClientError::cache("disk full", None), ErrorCategory::Cache),
            (ClientError::Config("bad".into()), ErrorCategory::Usage),
            (
                ClientError::from(ReferenceError::BlankRepository),
                ErrorCategory::Usage,
            ),
        ];

        for (err, category) in cases {
            assert_eq!(err.category(), category, "{err}");
        }
    }

    #[test]
    fn test_status_and_message() {
        let err = ClientError::bad_status(404, "GET https://example.com/v2/");
        assert_eq!(err.status(), Some(404));
        assert!(err.is_not_found());
        let msg = err.to_string();
        assert!(msg.contains("BAD_STATUS"));
        assert!(msg.contains("HTTP 404"));

        let parse = ClientError::parse(ParseKind::Manifest, "not JSON");
        assert_eq!(parse.status(), None);
        assert_eq!(parse.to_string(), "Failed to parse MANIFEST: not JSON");
    }

    #[test]
    fn test_retryability() {
        assert!(ClientError::http(HttpKind::RetryExhausted, Some(503), "x").is_retryable());
        assert!(ClientError::http(HttpKind::Network, None, "x").is_retryable());
        assert!(ClientError::bad_status(503, "x").is_retryable());
        assert!(!ClientError::bad_status(404, "x").is_retryable());
        assert!(!ClientError::auth(AuthKind::TokenFailed, Some(401), "x").is_retryable());
        assert!(!ClientError::parse(ParseKind::Manifest, "x").is_retryable());
        assert!(!ClientError::Integrity {
            kind: IntegrityKind::DigestMismatch,
            expected: "a".into(),
            actual: "b".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_transport_error_transience() {
        let reset = TransportError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(reset.is_transient());

        let denied = TransportError::from(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!denied.is_transient());

        let failed = TransportError::from(ureq::Error::ConnectionFailed);
        assert!(matches!(failed, TransportError::Network(_)));
        assert!(failed.is_transient());

        let wrapped = TransportError::from(ureq::Error::Io(io::Error::from(
            io::ErrorKind::TimedOut,
        )));
        assert!(matches!(wrapped, TransportError::Io(_)));
        assert!(wrapped.is_transient());

        assert!(!TransportError::InvalidRequest("bad uri".into()).is_transient());
    }

    #[test]
    fn test_error_source_chain() {
        let err = ClientError::Http {
            kind: HttpKind::Network,
            status: None,
            message: "connection reset".into(),
            source: Some(TransportError::Io(io::Error::from(
                io::ErrorKind::ConnectionReset,
            ))),
        };
        assert!(std::error::Error::source(&err).is_some());
    }
}
