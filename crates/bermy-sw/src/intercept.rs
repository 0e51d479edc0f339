//! Fetch interception: cache-first, network fallback, write-through.

use std::sync::Arc;

use bermy_net::{Fetcher, Origin, Request, Response};
use http::Method;
use tracing::{debug, trace};

use crate::cache::{CacheEntry, CacheStorage, RequestKey};
use crate::config::AgentConfig;
use crate::registration::ClientId;
use crate::AgentError;

/// A request delivered to the agent.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    /// The page's request.
    pub request: Request,
    /// Page that issued it, if known.
    pub client_id: Option<ClientId>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            client_id: None,
        }
    }
}

/// Where a response came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseSource {
    /// Hit in the named cache.
    Cache(String),
    /// Fetched from the network.
    Network,
}

/// What the interceptor did with a request.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The agent answered the request.
    Respond {
        response: Response,
        source: ResponseSource,
    },
    /// Not handled; the host performs its default networking.
    Passthrough,
}

impl FetchOutcome {
    /// The response, if the agent produced one.
    pub fn into_response(self) -> Option<Response> {
        match self {
            FetchOutcome::Respond { response, .. } => Some(response),
            FetchOutcome::Passthrough => None,
        }
    }

    /// Source of the response, if the agent produced one.
    pub fn source(&self) -> Option<&ResponseSource> {
        match self {
            FetchOutcome::Respond { source, .. } => Some(source),
            FetchOutcome::Passthrough => None,
        }
    }
}

/// Serves same-origin requests from the caches, falling back to the network.
pub struct RequestInterceptor<S, F> {
    config: Arc<AgentConfig>,
    origin: Origin,
    storage: Arc<S>,
    fetcher: Arc<F>,
}

impl<S: CacheStorage, F: Fetcher> RequestInterceptor<S, F> {
    pub fn new(config: Arc<AgentConfig>, storage: Arc<S>, fetcher: Arc<F>) -> Self {
        Self {
            origin: config.agent_origin(),
            config,
            storage,
            fetcher,
        }
    }

    /// Whether the request belongs to the agent's origin.
    pub fn in_scope(&self, request: &Request) -> bool {
        self.origin.contains(&request.url)
    }

    /// Handle one intercepted request.
    ///
    /// Lookup order is the precache, then the runtime cache. On a miss the
    /// network is contacted exactly once and the response is written to the
    /// runtime cache before it is returned.
    pub async fn handle_fetch(&self, event: FetchEvent) -> Result<FetchOutcome, AgentError> {
        let request = event.request;

        if !self.in_scope(&request) {
            trace!(url = %request.url, "Cross-origin request, not intercepted");
            return Ok(FetchOutcome::Passthrough);
        }

        if request.method != Method::GET {
            debug!(url = %request.url, method = %request.method, "Forwarding uncacheable request");
            let response = self.fetcher.fetch(request).await?;
            return Ok(FetchOutcome::Respond {
                response,
                source: ResponseSource::Network,
            });
        }

        let key = RequestKey::from_request(&request);
        if let Some((cache_name, entry)) = self.lookup(&key).await? {
            debug!(key = %key, cache = %cache_name, "Cache hit");
            return Ok(FetchOutcome::Respond {
                response: entry.to_response(),
                source: ResponseSource::Cache(cache_name),
            });
        }

        let runtime = &self.config.runtime_cache;
        self.storage.open(runtime).await?;

        trace!(key = %key, "Cache miss, fetching");
        let response = self.fetcher.fetch(request).await?;

        if !response.ok() && !self.config.cache_error_responses {
            debug!(key = %key, status = %response.status, "Not caching error response");
            return Ok(FetchOutcome::Respond {
                response,
                source: ResponseSource::Network,
            });
        }

        let (response, copy) = response.duplicate().await?;
        let entry = CacheEntry::from_response(key, copy).await?;
        debug!(key = %entry.key, cache = %runtime, bytes = entry.body.len(), "Caching response");
        self.storage.put(runtime, entry).await?;

        Ok(FetchOutcome::Respond {
            response,
            source: ResponseSource::Network,
        })
    }

    async fn lookup(&self, key: &RequestKey) -> Result<Option<(String, CacheEntry)>, AgentError> {
        for cache_name in self.config.current_caches() {
            if let Some(entry) = self.storage.match_in(&cache_name, key).await? {
                return Ok(Some((cache_name, entry)));
            }
        }
        Ok(None)
    }
}
