//! Runtime configuration.
//!
//! The build version is the single lever for invalidating everything at
//! once: cache namespaces and session record keys are both derived from it.
//!
//! Configuration is stored at `~/.config/offgrid/config.json`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "offgrid";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Default session record lifetime.
/// Short enough that a long-running session picks up backend edits.
const DEFAULT_SESSION_TTL_SECS: u64 = 300;

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionTtlConfig {
    pub default_secs: u64,
    /// Per logical endpoint overrides, e.g. `"announcements": 60`
    pub endpoints: HashMap<String, u64>,
}

impl Default for SessionTtlConfig {
    fn default() -> Self {
        Self {
            default_secs: DEFAULT_SESSION_TTL_SECS,
            endpoints: HashMap::new(),
        }
    }
}

impl SessionTtlConfig {
    /// TTL for a logical endpoint. An exact match wins, then the part of
    /// the name before the first `:` (so `standings:U9` uses `standings`).
    pub fn ttl_for(&self, endpoint: &str) -> Duration {
        let secs = self
            .endpoints
            .get(endpoint)
            .or_else(|| {
                endpoint
                    .split_once(':')
                    .and_then(|(family, _)| self.endpoints.get(family))
            })
            .copied()
            .unwrap_or(self.default_secs);
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app_id: String,
    pub build_version: String,
    pub base_url: String,
    /// Path of the JSON envelope endpoint, relative to `base_url`
    pub api_path: String,
    /// Core asset paths fetched at install time
    pub precache: Vec<String>,
    /// Route prefix of the immutable, content-hashed asset namespace
    pub asset_prefix: String,
    /// Document served to navigations when offline with nothing cached
    pub shell_path: String,
    pub request_timeout_secs: u64,
    pub session_ttl: SessionTtlConfig,
    pub cache_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_id: APP_NAME.to_string(),
            build_version: env!("CARGO_PKG_VERSION").to_string(),
            base_url: "http://localhost:8080/".to_string(),
            api_path: "/api".to_string(),
            precache: vec!["/".to_string(), "/index.html".to_string()],
            asset_prefix: "/assets/".to_string(),
            shell_path: "/index.html".to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            session_ttl: SessionTtlConfig::default(),
            cache_dir: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply `OFFGRID_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(version) = std::env::var("OFFGRID_BUILD_VERSION") {
            self.build_version = version;
        }
        if let Ok(url) = std::env::var("OFFGRID_BASE_URL") {
            self.base_url = url;
        }
        if let Ok(dir) = std::env::var("OFFGRID_CACHE_DIR") {
            self.cache_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_id.trim().is_empty() {
            return Err(ConfigError::Invalid("app_id must not be empty".into()));
        }
        if self.build_version.trim().is_empty() {
            return Err(ConfigError::Invalid("build_version must not be empty".into()));
        }
        for (field, value) in [("app_id", &self.app_id), ("build_version", &self.build_version)] {
            if value.contains(['/', '\\']) || value == "." || value == ".." {
                return Err(ConfigError::Invalid(format!(
                    "{} must not contain path separators: {:?}",
                    field, value
                )));
            }
        }
        if !self.asset_prefix.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "asset_prefix must start with '/': {:?}",
                self.asset_prefix
            )));
        }
        self.base_url()?;
        Ok(())
    }

    /// `<app_id>-cache-<build_version>`
    pub fn namespace(&self) -> String {
        namespace_name(&self.app_id, &self.build_version)
    }

    /// Prefix shared by every namespace this application owns.
    pub fn namespace_prefix(&self) -> String {
        format!("{}-cache-", self.app_id)
    }

    pub fn base_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.base_url).map_err(|e| ConfigError::InvalidUrl {
            value: self.base_url.clone(),
            reason: e.to_string(),
        })
    }

    /// Resolve a site-relative path (manifest entry, shell) against `base_url`.
    pub fn resolve(&self, path: &str) -> Result<Url, ConfigError> {
        self.base_url()?
            .join(path)
            .map_err(|e| ConfigError::InvalidUrl {
                value: path.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn api_url(&self) -> Result<Url, ConfigError> {
        self.resolve(&self.api_path)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.cache_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME).join(&self.app_id))
    }
}

pub fn namespace_name(app_id: &str, build_version: &str) -> String {
    format!("{}-cache-{}", app_id, build_version)
}
