//! # Bermy Offline Agent
//!
//! Offline cache agent for the Bermy schedules site.
//!
//! ## Features
//!
//! - **Install**: precache a fixed, version-tagged list of resources, all or nothing
//! - **Activate**: delete every cache that is not current
//! - **Fetch**: cache-first for same-origin requests, network fallback, write-through
//! - **Storage**: in-memory and SQLite cache stores behind [`CacheStorage`]
//! - **Host**: [`ServiceWorkerContainer`] drives registration, clients and fetch dispatch
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer
//!     ├── Registration
//!     │       ├── installing / waiting / active (AgentWorker)
//!     │       └── scope
//!     └── Clients
//!
//! OfflineAgent
//!     ├── LifecycleManager  (install, activate)
//!     └── RequestInterceptor (fetch)
//!             │
//!             ├── CacheStorage: precache-{version}, runtime
//!             └── Fetcher
//! ```

use std::sync::Arc;

use bermy_common::BermyError;
use bermy_net::{Fetcher, NetError};
use thiserror::Error;
use tracing::debug;

pub mod cache;
pub mod config;
pub mod container;
pub mod intercept;
pub mod lifecycle;
pub mod registration;
pub mod sqlite;

pub use cache::{CacheEntry, CacheError, CacheStorage, MemoryCacheStorage, RequestKey};
pub use config::{AgentConfig, ConfigError, DEFAULT_PRECACHE_URLS};
pub use container::{ContainerEvent, ServiceWorkerContainer};
pub use intercept::{FetchEvent, FetchOutcome, RequestInterceptor, ResponseSource};
pub use lifecycle::{ActivateOutcome, InstallOutcome, LifecycleManager};
pub use registration::{ClientId, WorkerId, WorkerState};
pub use sqlite::SqliteCacheStorage;

// ==================== Errors ====================

/// Errors raised by the agent's event handlers.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Precache resource unavailable: {url}: {reason}")]
    PrecacheResourceUnavailable { url: String, reason: String },

    #[error("Failed to delete stale cache '{name}': {source}")]
    StaleCacheDeletion {
        name: String,
        #[source]
        source: CacheError,
    },

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("State error: {0}")]
    State(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<AgentError> for BermyError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::PrecacheResourceUnavailable { url, reason } => {
                BermyError::Precache { url, message: reason }
            }
            AgentError::StaleCacheDeletion { name, source } => BermyError::lifecycle_with_source(
                format!("failed to delete stale cache '{}'", name),
                source,
            ),
            AgentError::Network(e) => BermyError::network_with_source("fetch failed", e),
            AgentError::Cache(e) => BermyError::cache_with_source("cache operation failed", e),
            AgentError::Config(e) => BermyError::config_with_source("invalid agent config", e),
            AgentError::State(message) => BermyError::lifecycle(message),
            AgentError::NotFound(what) => BermyError::NotFound(what),
        }
    }
}

// ==================== Agent ====================

/// One version of the offline agent: its configuration and event handlers.
///
/// Holds no state of its own between events; everything durable lives in
/// the named caches of the storage.
pub struct OfflineAgent<S, F> {
    config: Arc<AgentConfig>,
    lifecycle: LifecycleManager<S, F>,
    interceptor: RequestInterceptor<S, F>,
}

impl<S: CacheStorage, F: Fetcher> OfflineAgent<S, F> {
    /// Validate `config` and build the agent.
    pub fn new(config: AgentConfig, storage: Arc<S>, fetcher: Arc<F>) -> Result<Self, AgentError> {
        config.validate()?;
        let config = Arc::new(config);
        debug!(
            origin = %config.origin,
            precache = %config.precache_name(),
            runtime = %config.runtime_cache,
            "Created offline agent"
        );

        Ok(Self {
            lifecycle: LifecycleManager::new(config.clone(), storage.clone(), fetcher.clone()),
            interceptor: RequestInterceptor::new(config.clone(), storage, fetcher),
            config,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Install event.
    pub async fn on_install(&self) -> Result<InstallOutcome, AgentError> {
        self.lifecycle.install().await
    }

    /// Activate event.
    pub async fn on_activate(&self) -> Result<ActivateOutcome, AgentError> {
        self.lifecycle.activate().await
    }

    /// Fetch event.
    pub async fn on_fetch(&self, event: FetchEvent) -> Result<FetchOutcome, AgentError> {
        self.interceptor.handle_fetch(event).await
    }

    pub fn lifecycle(&self) -> &LifecycleManager<S, F> {
        &self.lifecycle
    }

    pub fn interceptor(&self) -> &RequestInterceptor<S, F> {
        &self.interceptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bermy_net::StaticFetcher;
    use url::Url;

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = AgentConfig::new(Url::parse("https://bermy.example/").unwrap())
            .with_precache_urls(["/", "/"]);
        let result = OfflineAgent::new(
            config,
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(StaticFetcher::new()),
        );
        assert!(matches!(result, Err(AgentError::Config(ConfigError::Invalid(_)))));
    }

    #[test]
    fn test_error_conversion() {
        let err: BermyError = AgentError::PrecacheResourceUnavailable {
            url: "https://bermy.example/".into(),
            reason: "HTTP 404 Not Found".into(),
        }
        .into();
        assert!(err.is_retryable());
        assert_eq!(err.category(), "precache");

        let err: BermyError = AgentError::Network(NetError::Offline("airplane mode".into())).into();
        assert!(err.is_retryable());

        let err: BermyError = AgentError::State("install in progress".into()).into();
        assert!(!err.is_retryable());
    }
}
