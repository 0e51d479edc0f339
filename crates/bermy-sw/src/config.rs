//! Agent configuration.
//!
//! The precache list and the cache version are the whole deployment surface:
//! bump `cache_version` whenever any precached resource changes, otherwise
//! clients keep serving the old copy.

use std::collections::HashSet;
use std::path::Path;

use bermy_net::Origin;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Resources of the schedules site that must always be available offline.
pub const DEFAULT_PRECACHE_URLS: &[&str] = &[
    "/",
    "/ferry-schedules/",
    "/bus-schedules/",
    "/bus-schedules/1-grotto-bay/",
    "/bus-schedules/3-grotto-bay/",
    "/bus-schedules/1-st-georges/",
    "/bus-schedules/3-st-georges/",
    "/bus-schedules/6-st-georges/",
    "/bus-schedules/10-st-georges/",
    "/bus-schedules/11-st-georges/",
    "/bus-schedules/4-spanish-point/",
    "/bus-schedules/5-pond-hill/",
    "/bus-schedules/9-prospect/",
    "/bus-schedules/2-ord-road/",
    "/bus-schedules/7-barnes-corner/",
    "/bus-schedules/7-dockyard/",
    "/bus-schedules/8-dockyard/",
    "/bus-schedules/8-somerset/",
    "/bus-schedules/8-cedar-hill/",
    "/css/tachyons.min.css",
    "/img/bermy-logo@1x.png",
    "/img/bermy-logo@2x.png",
    "/img/bermy-logo@3x.png",
];

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Offline agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Origin the agent serves. Requests to any other origin pass through.
    pub origin: Url,

    /// Version tag of the precache.
    #[serde(default = "default_cache_version")]
    pub cache_version: String,

    /// Prefix of the precache name (`{prefix}-{version}`).
    #[serde(default = "default_precache_prefix")]
    pub precache_prefix: String,

    /// Name of the runtime cache.
    #[serde(default = "default_runtime_cache")]
    pub runtime_cache: String,

    /// Absolute same-origin paths fetched at install time.
    #[serde(default = "default_precache_urls")]
    pub precache_urls: Vec<String>,

    /// Write 4xx/5xx responses into the runtime cache.
    #[serde(default)]
    pub cache_error_responses: bool,
}

fn default_cache_version() -> String {
    "v1".to_string()
}

fn default_precache_prefix() -> String {
    "precache".to_string()
}

fn default_runtime_cache() -> String {
    "runtime".to_string()
}

fn default_precache_urls() -> Vec<String> {
    DEFAULT_PRECACHE_URLS.iter().map(|s| s.to_string()).collect()
}

impl AgentConfig {
    /// Configuration with the default site list for `origin`.
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            cache_version: default_cache_version(),
            precache_prefix: default_precache_prefix(),
            runtime_cache: default_runtime_cache(),
            precache_urls: default_precache_urls(),
            cache_error_responses: false,
        }
    }

    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the cache version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.cache_version = version.into();
        self
    }

    /// Replace the precache list.
    pub fn with_precache_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.precache_urls = urls.into_iter().map(Into::into).collect();
        self
    }

    /// Cache (or stop caching) HTTP error responses on write-through.
    pub fn with_cache_error_responses(mut self, enabled: bool) -> Self {
        self.cache_error_responses = enabled;
        self
    }

    /// Version-tagged precache name, e.g. `precache-v1`.
    pub fn precache_name(&self) -> String {
        format!("{}-{}", self.precache_prefix, self.cache_version)
    }

    /// The cache name registry: every cache not listed here is stale.
    pub fn current_caches(&self) -> [String; 2] {
        [self.precache_name(), self.runtime_cache.clone()]
    }

    /// Check whether `name` belongs to this version.
    pub fn is_current_cache(&self, name: &str) -> bool {
        self.current_caches().iter().any(|c| c == name)
    }

    /// Origin of the agent.
    pub fn agent_origin(&self) -> Origin {
        Origin::from_url(&self.origin)
    }

    /// Resolve the precache list against the origin, in list order.
    pub fn precache_requests(&self) -> Result<Vec<Url>, ConfigError> {
        let origin = self.agent_origin();
        self.precache_urls
            .iter()
            .map(|path| {
                if !path.starts_with('/') || path.starts_with("//") {
                    return Err(ConfigError::Invalid(format!(
                        "precache entry '{}' is not an absolute path",
                        path
                    )));
                }
                let url = self.origin.join(path).map_err(|e| {
                    ConfigError::Invalid(format!("precache entry '{}': {}", path, e))
                })?;
                if !origin.contains(&url) {
                    return Err(ConfigError::Invalid(format!(
                        "precache entry '{}' leaves origin {}",
                        path, origin
                    )));
                }
                Ok(url)
            })
            .collect()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent_origin().is_opaque() || self.origin.host_str().is_none() {
            return Err(ConfigError::Invalid(format!(
                "origin '{}' is not an http(s) origin",
                self.origin
            )));
        }
        if self.cache_version.trim().is_empty() {
            return Err(ConfigError::Invalid("cache_version is empty".into()));
        }
        if self.precache_prefix.trim().is_empty() || self.runtime_cache.trim().is_empty() {
            return Err(ConfigError::Invalid("cache names must not be empty".into()));
        }
        if self.precache_name() == self.runtime_cache {
            return Err(ConfigError::Invalid(format!(
                "precache and runtime cache share the name '{}'",
                self.runtime_cache
            )));
        }

        let mut seen = HashSet::new();
        for url in self.precache_requests()? {
            if !seen.insert(url.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "precache entry '{}' is listed twice",
                    url.path()
                )));
            }
        }
        Ok(())
    }
}
