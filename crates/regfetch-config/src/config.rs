use std::{
    collections::HashSet,
    fs,
    path::PathBuf,
    sync::{LazyLock, PoisonError, RwLock},
    time::Duration,
};

use regfetch_utils::path::{resolve_path, xdg_cache_home, xdg_config_home};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    error::{ConfigError, Result},
    http::HttpClientConfig,
    registry::Registry,
    utils::{byte_size, duration_str},
};

pub const DEFAULT_MAX_MANIFEST_SIZE: u64 = 4 * 1024 * 1024;

/// Application's configuration
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    /// Name of the registry used when a reference does not name one.
    pub default_registry: String,

    /// Path to the content-addressed blob cache.
    /// Default: $XDG_CACHE_HOME/regfetch
    pub cache_path: Option<String>,

    /// Manifests larger than this are rejected before parsing.
    /// Default: 4MiB
    #[serde(default = "default_max_manifest_size", with = "byte_size")]
    pub max_manifest_size: u64,

    #[serde(default)]
    pub platform: PlatformConfig,

    #[serde(default)]
    pub http: HttpClientConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub p2p: P2pConfig,

    /// Configured registries.
    pub registries: Vec<Registry>,
}

/// Platform picked from multi-platform image indexes.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            os: "linux".into(),
            architecture: "amd64".into(),
            variant: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Lifetime assumed for bearer tokens that carry no expiry.
    /// Default: 5m
    #[serde(with = "duration_str")]
    pub default_token_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            default_token_ttl: Duration::from_secs(300),
        }
    }
}

/// Directory-backed peer sharing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct P2pConfig {
    pub enabled: bool,
    pub shared_dir: Option<String>,
}

fn default_max_manifest_size() -> u64 {
    DEFAULT_MAX_MANIFEST_SIZE
}

pub static CONFIG: LazyLock<RwLock<Option<Config>>> = LazyLock::new(|| RwLock::new(None));

pub static CONFIG_PATH: LazyLock<RwLock<PathBuf>> = LazyLock::new(|| {
    RwLock::new(match std::env::var("REGFETCH_CONFIG") {
        Ok(path_str) => PathBuf::from(path_str),
        Err(_) => xdg_config_home().join("regfetch").join("config.toml"),
    })
});

pub fn config_path() -> PathBuf {
    CONFIG_PATH
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .to_path_buf()
}

pub fn set_config_path(path: PathBuf) {
    *CONFIG_PATH.write().unwrap_or_else(PoisonError::into_inner) = path;
}

pub fn init() -> Result<()> {
    let config = Config::new()?;
    *CONFIG.write().unwrap_or_else(PoisonError::into_inner) = Some(config);
    Ok(())
}

/// Returns the loaded configuration, falling back to the defaults when
/// [`init`] was never called.
pub fn get_config() -> Config {
    if let Some(config) = CONFIG
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
    {
        return config.clone();
    }

    let mut guard = CONFIG.write().unwrap_or_else(PoisonError::into_inner);
    guard.get_or_insert_with(Config::default_config).clone()
}

impl Config {
    pub fn default_config() -> Self {
        Self {
            default_registry: "docker".to_string(),
            cache_path: None,
            max_manifest_size: DEFAULT_MAX_MANIFEST_SIZE,
            platform: PlatformConfig::default(),
            http: HttpClientConfig::default(),
            auth: AuthConfig::default(),
            p2p: P2pConfig::default(),
            registries: vec![
                Registry::new("docker", "https://registry-1.docker.io"),
                Registry::new("ghcr", "https://ghcr.io"),
            ],
        }
    }

    /// Loads the configuration file, or the defaults if there is none.
    pub fn new() -> Result<Self> {
        let path = config_path();

        let config = match fs::read_to_string(&path) {
            Ok(content) => {
                debug!("loading configuration from {}", path.display());
                toml::from_str(&content)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default_config(),
            Err(err) => return Err(ConfigError::IoError(err)),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.registries.is_empty() {
            return Err(ConfigError::NoRegistries);
        }

        let mut seen = HashSet::new();
        for registry in &self.registries {
            if !seen.insert(registry.name.as_str()) {
                return Err(ConfigError::DuplicateRegistryName(registry.name.clone()));
            }
            registry.validate()?;
        }

        if !seen.contains(self.default_registry.as_str()) {
            return Err(ConfigError::MissingDefaultRegistry(
                self.default_registry.clone(),
            ));
        }

        self.http.validate()?;

        if self.auth.default_token_ttl.is_zero() {
            return Err(ConfigError::InvalidTokenTtl);
        }

        let has_shared_dir =
            matches!(self.p2p.shared_dir.as_deref(), Some(dir) if !dir.trim().is_empty());
        if self.p2p.enabled && !has_shared_dir {
            return Err(ConfigError::MissingSharedDir);
        }

        Ok(())
    }

    pub fn get_registry(&self, name: &str) -> Result<&Registry> {
        self.registries
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| ConfigError::UnknownRegistry(name.to_string()))
    }

    pub fn default_registry(&self) -> Result<&Registry> {
        self.registries
            .iter()
            .find(|r| r.name == self.default_registry)
            .ok_or_else(|| ConfigError::MissingDefaultRegistry(self.default_registry.clone()))
    }

    pub fn get_cache_path(&self) -> Result<PathBuf> {
        if let Ok(env_path) = std::env::var("REGFETCH_CACHE") {
            return Ok(resolve_path(&env_path)?);
        }
        if let Some(cache_path) = &self.cache_path {
            return Ok(resolve_path(cache_path)?);
        }
        Ok(xdg_cache_home().join("regfetch"))
    }

    /// Shared peer directory, `None` when P2P is disabled.
    pub fn get_shared_dir(&self) -> Result<Option<PathBuf>> {
        if !self.p2p.enabled {
            return Ok(None);
        }
        match &self.p2p.shared_dir {
            Some(dir) => Ok(Some(resolve_path(dir)?)),
            None => Err(ConfigError::MissingSharedDir),
        }
    }
}

/// Writes the default configuration to [`CONFIG_PATH`]. Never overwrites.
pub fn generate_default_config() -> Result<PathBuf> {
    let path = config_path();

    if path.exists() {
        return Err(ConfigError::ConfigAlreadyExists);
    }

    let body = toml::to_string_pretty(&Config::default_config())?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(
        &path,
        format!("# regfetch configuration\n# Durations accept ms/s/m/h/d suffixes, sizes accept KiB/MiB/GiB.\n\n{body}"),
    )?;
    info!("Default configuration file generated at: {}", path.display());
    Ok(path)
}
