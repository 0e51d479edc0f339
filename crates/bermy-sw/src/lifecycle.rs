//! Install and activate transitions.

use std::sync::Arc;

use bermy_net::{Fetcher, Request};
use futures::future::try_join_all;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheStorage, RequestKey};
use crate::config::AgentConfig;
use crate::AgentError;

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    /// Precache that was populated.
    pub cache_name: String,
    /// Number of resources stored.
    pub precached: usize,
    /// The version asks to activate without waiting for old pages to close.
    pub skip_waiting: bool,
}

/// Result of a successful activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateOutcome {
    /// Stale caches that were removed.
    pub deleted: Vec<String>,
    /// The version asks to take control of already open pages.
    pub claim_clients: bool,
}

/// Precaches resources on install and removes stale caches on activate.
pub struct LifecycleManager<S, F> {
    config: Arc<AgentConfig>,
    storage: Arc<S>,
    fetcher: Arc<F>,
}

impl<S: CacheStorage, F: Fetcher> LifecycleManager<S, F> {
    pub fn new(config: Arc<AgentConfig>, storage: Arc<S>, fetcher: Arc<F>) -> Self {
        Self {
            config,
            storage,
            fetcher,
        }
    }

    /// Fetch every precache URL and store them all in the precache.
    ///
    /// Fetches run concurrently. Nothing is written unless every resource
    /// arrived with a 2xx status; the precache is then written in one batch.
    pub async fn install(&self) -> Result<InstallOutcome, AgentError> {
        let cache_name = self.config.precache_name();
        let urls = self.config.precache_requests()?;
        info!(cache = %cache_name, resources = urls.len(), "Installing precache");

        let entries = try_join_all(urls.into_iter().map(|url| self.fetch_precache_entry(url)))
            .await
            .map_err(|e| {
                warn!(cache = %cache_name, error = %e, "Install failed");
                e
            })?;

        let precached = entries.len();
        self.storage.put_all(&cache_name, entries).await?;

        info!(cache = %cache_name, precached, "Precache ready");
        Ok(InstallOutcome {
            cache_name,
            precached,
            skip_waiting: true,
        })
    }

    async fn fetch_precache_entry(&self, url: Url) -> Result<CacheEntry, AgentError> {
        let unavailable = |reason: String| AgentError::PrecacheResourceUnavailable {
            url: url.to_string(),
            reason,
        };

        let request = Request::get(url.clone());
        let key = RequestKey::from_request(&request);
        let response = self
            .fetcher
            .fetch(request)
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        if !response.ok() {
            return Err(unavailable(format!("HTTP {}", response.status)));
        }

        let entry = CacheEntry::from_response(key, response)
            .await
            .map_err(|e| unavailable(e.to_string()))?;
        debug!(url = %url, bytes = entry.body.len(), "Fetched precache resource");
        Ok(entry)
    }

    /// Delete every cache that is not in the current cache name registry.
    ///
    /// Deletions run concurrently; the first failure fails the activation.
    pub async fn activate(&self) -> Result<ActivateOutcome, AgentError> {
        let stale: Vec<String> = self
            .storage
            .keys()
            .await?
            .into_iter()
            .filter(|name| !self.config.is_current_cache(name))
            .collect();

        info!(stale = ?stale, "Activating, removing stale caches");

        try_join_all(stale.iter().map(|name| async move {
            let existed = self.storage.delete(name).await.map_err(|source| {
                warn!(cache = %name, error = %source, "Stale cache deletion failed");
                AgentError::StaleCacheDeletion {
                    name: name.clone(),
                    source,
                }
            })?;
            if !existed {
                debug!(cache = %name, "Stale cache already gone");
            }
            Ok::<_, AgentError>(())
        }))
        .await?;

        Ok(ActivateOutcome {
            deleted: stale,
            claim_clients: true,
        })
    }
}
