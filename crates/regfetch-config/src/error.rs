use miette::Diagnostic;
use regfetch_utils::error::{BytesError, FileSystemError, PathError, UtilsError};
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum ConfigError {
    #[error("TOML serialization error: {0}")]
    #[diagnostic(
        code(regfetch_config::toml_serialize),
        help("Check your configuration structure for invalid values")
    )]
    TomlSerError(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    #[diagnostic(
        code(regfetch_config::toml_deserialize),
        help("Check your config.toml syntax and structure")
    )]
    TomlDeError(#[from] toml::de::Error),

    #[error("Configuration file already exists")]
    #[diagnostic(
        code(regfetch_config::already_exists),
        help("Remove the existing config file or use a different location")
    )]
    ConfigAlreadyExists,

    #[error("Invalid HTTP client configuration: {0}")]
    #[diagnostic(
        code(regfetch_config::invalid_http),
        help("Timeouts and backoffs must be non-zero and initial_backoff must not exceed max_backoff")
    )]
    InvalidHttpConfig(String),

    #[error("No registries configured")]
    #[diagnostic(
        code(regfetch_config::no_registries),
        help("Add at least one [[registries]] entry to your config file")
    )]
    NoRegistries,

    #[error("Duplicate registry name: {0}")]
    #[diagnostic(
        code(regfetch_config::duplicate_registry),
        help("Each registry must have a unique name")
    )]
    DuplicateRegistryName(String),

    #[error("Missing default registry: {0}")]
    #[diagnostic(
        code(regfetch_config::missing_default_registry),
        help("Ensure the default_registry field references an existing registry")
    )]
    MissingDefaultRegistry(String),

    #[error("Unknown registry: {0}")]
    #[diagnostic(code(regfetch_config::unknown_registry))]
    UnknownRegistry(String),

    #[error("Invalid URL `{url}` for registry `{name}`")]
    #[diagnostic(
        code(regfetch_config::invalid_registry_url),
        help("Registry URLs must be absolute http:// or https:// URLs")
    )]
    InvalidRegistryUrl { name: String, url: String },

    #[error("Registry `{0}` has a username without a password")]
    #[diagnostic(
        code(regfetch_config::incomplete_credentials),
        help("Set both username and password, or use identity_token instead")
    )]
    IncompleteCredentials(String),

    #[error("auth.default_token_ttl must be greater than zero")]
    #[diagnostic(code(regfetch_config::invalid_token_ttl))]
    InvalidTokenTtl,

    #[error("P2P is enabled but no shared directory is configured")]
    #[diagnostic(
        code(regfetch_config::missing_shared_dir),
        help("Set p2p.shared_dir or disable p2p")
    )]
    MissingSharedDir,

    #[error("IO error: {0}")]
    #[diagnostic(code(regfetch_config::io))]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    #[diagnostic(code(regfetch_config::utils))]
    Utils(#[from] UtilsError),
}

impl From<PathError> for ConfigError {
    fn from(err: PathError) -> Self {
        Self::Utils(UtilsError::Path(err))
    }
}

impl From<BytesError> for ConfigError {
    fn from(err: BytesError) -> Self {
        Self::Utils(UtilsError::Bytes(err))
    }
}

impl From<FileSystemError> for ConfigError {
    fn from(err: FileSystemError) -> Self {
        Self::Utils(UtilsError::FileSystem(err))
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
