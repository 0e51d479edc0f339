//! Named caches.
//!
//! ```text
//! CacheStorage
//!     ├── precache-v1   (written once at install)
//!     └── runtime       (write-through on miss)
//!             └── RequestKey → CacheEntry
//! ```
//!
//! Storage is injected into the lifecycle manager and the interceptor through
//! the [`CacheStorage`] trait. [`MemoryCacheStorage`] keeps everything in
//! process; [`crate::sqlite::SqliteCacheStorage`] persists across runs.

use std::sync::atomic::{AtomicU64, Ordering};

use bermy_net::{NetError, Request, Response};
use bytes::Bytes;
use futures::future::BoxFuture;
use hashbrown::{HashMap, HashSet};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use url::Url;

// ==================== Errors ====================

/// Errors raised by cache storage backends.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache '{0}' is locked")]
    Locked(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage task failed: {0}")]
    Task(String),
}

// ==================== Keys and entries ====================

/// Key of a cached request: method plus URL, fragment removed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: Url,
}

impl RequestKey {
    /// Key for `method url`.
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_string(),
            url,
        }
    }

    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    /// Key of an intercepted request.
    pub fn from_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }
}

impl std::fmt::Display for RequestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request key.
    pub key: RequestKey,

    /// Response status.
    pub status: u16,

    /// Response headers, in order, repeated names kept. Values are raw bytes
    /// since they need not be UTF-8.
    pub headers: Vec<(String, Vec<u8>)>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Read a response into a cache entry. Consumes the body.
    pub async fn from_response(key: RequestKey, response: Response) -> Result<Self, NetError> {
        let status = response.status.as_u16();
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();
        let body = response.bytes().await?;

        Ok(Self {
            key,
            status,
            headers,
            body: body.to_vec(),
            cached_at: now_millis(),
        })
    }

    /// Build a fresh, unread response from this entry.
    pub fn to_response(&self) -> Response {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value),
            ) {
                headers.append(name, value);
            }
        }
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        Response::new(
            self.key.url.clone(),
            status,
            headers,
            Bytes::copy_from_slice(&self.body),
        )
    }
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ==================== Storage trait ====================

/// Asynchronous store of named caches.
///
/// Individual writes are atomic; `put_all` is atomic as a whole. Writing to a
/// cache that does not exist creates it.
pub trait CacheStorage: Send + Sync {
    /// Create the cache if absent.
    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Check whether a cache exists.
    fn has<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, CacheError>>;

    /// Names of all caches, oldest first.
    fn keys(&self) -> BoxFuture<'_, Result<Vec<String>, CacheError>>;

    /// Delete a cache. Returns false if it did not exist.
    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, CacheError>>;

    /// Store one entry, replacing any entry with the same key.
    fn put<'a>(&'a self, name: &'a str, entry: CacheEntry)
        -> BoxFuture<'a, Result<(), CacheError>>;

    /// Store a batch of entries: all of them or none.
    fn put_all<'a>(
        &'a self,
        name: &'a str,
        entries: Vec<CacheEntry>,
    ) -> BoxFuture<'a, Result<(), CacheError>>;

    /// Look a request up in one cache.
    fn match_in<'a>(
        &'a self,
        name: &'a str,
        key: &'a RequestKey,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>, CacheError>>;

    /// Request keys stored in one cache. Empty if the cache does not exist.
    fn entry_keys<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<RequestKey>, CacheError>>;
}

// ==================== In-memory storage ====================

/// A single named cache held in memory.
#[derive(Debug, Default)]
struct NamedCache {
    created_seq: u64,
    entries: HashMap<RequestKey, CacheEntry>,
    order: Vec<RequestKey>,
}

impl NamedCache {
    fn new(created_seq: u64) -> Self {
        Self {
            created_seq,
            ..Default::default()
        }
    }

    fn put(&mut self, entry: CacheEntry) {
        if self.entries.insert(entry.key.clone(), entry.clone()).is_none() {
            self.order.push(entry.key);
        }
    }
}

/// Cache storage kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, NamedCache>>,
    locked: RwLock<HashSet<String>>,
    next_seq: AtomicU64,
}

impl MemoryCacheStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make writes and deletes on `name` fail until unlocked.
    pub async fn lock(&self, name: &str) {
        self.locked.write().await.insert(name.to_string());
    }

    /// Undo [`MemoryCacheStorage::lock`].
    pub async fn unlock(&self, name: &str) {
        self.locked.write().await.remove(name);
    }

    /// Number of entries in a cache.
    pub async fn len(&self, name: &str) -> usize {
        self.caches
            .read()
            .await
            .get(name)
            .map(|c| c.entries.len())
            .unwrap_or(0)
    }

    async fn check_unlocked(&self, name: &str) -> Result<(), CacheError> {
        if self.locked.read().await.contains(name) {
            return Err(CacheError::Locked(name.to_string()));
        }
        Ok(())
    }

    fn seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }
}

impl CacheStorage for MemoryCacheStorage {
    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let mut caches = self.caches.write().await;
            if !caches.contains_key(name) {
                caches.insert(name.to_string(), NamedCache::new(self.seq()));
            }
            Ok(())
        })
    }

    fn has<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, CacheError>> {
        Box::pin(async move { Ok(self.caches.read().await.contains_key(name)) })
    }

    fn keys(&self) -> BoxFuture<'_, Result<Vec<String>, CacheError>> {
        Box::pin(async move {
            let caches = self.caches.read().await;
            let mut names: Vec<(&String, u64)> =
                caches.iter().map(|(n, c)| (n, c.created_seq)).collect();
            names.sort_by_key(|(_, seq)| *seq);
            Ok(names.into_iter().map(|(n, _)| n.clone()).collect())
        })
    }

    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, CacheError>> {
        Box::pin(async move {
            self.check_unlocked(name).await?;
            Ok(self.caches.write().await.remove(name).is_some())
        })
    }

    fn put<'a>(
        &'a self,
        name: &'a str,
        entry: CacheEntry,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.check_unlocked(name).await?;
            let mut caches = self.caches.write().await;
            if !caches.contains_key(name) {
                caches.insert(name.to_string(), NamedCache::new(self.seq()));
            }
            if let Some(cache) = caches.get_mut(name) {
                cache.put(entry);
            }
            Ok(())
        })
    }

    fn put_all<'a>(
        &'a self,
        name: &'a str,
        entries: Vec<CacheEntry>,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.check_unlocked(name).await?;
            let mut caches = self.caches.write().await;
            if !caches.contains_key(name) {
                caches.insert(name.to_string(), NamedCache::new(self.seq()));
            }
            if let Some(cache) = caches.get_mut(name) {
                for entry in entries {
                    cache.put(entry);
                }
            }
            Ok(())
        })
    }

    fn match_in<'a>(
        &'a self,
        name: &'a str,
        key: &'a RequestKey,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>, CacheError>> {
        Box::pin(async move {
            Ok(self
                .caches
                .read()
                .await
                .get(name)
                .and_then(|c| c.entries.get(key))
                .cloned())
        })
    }

    fn entry_keys<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<RequestKey>, CacheError>> {
        Box::pin(async move {
            Ok(self
                .caches
                .read()
                .await
                .get(name)
                .map(|c| c.order.clone())
                .unwrap_or_default())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(url: &str, body: &str) -> CacheEntry {
        CacheEntry {
            key: RequestKey::get(&Url::parse(url).unwrap()),
            status: 200,
            headers: vec![("content-type".into(), b"text/html".to_vec())],
            body: body.as_bytes().to_vec(),
            cached_at: 0,
        }
    }

    #[test]
    fn test_request_key_ignores_fragment() {
        let a = RequestKey::get(&Url::parse("https://bermy.example/bus-schedules/#route-7").unwrap());
        let b = RequestKey::get(&Url::parse("https://bermy.example/bus-schedules/").unwrap());
        assert_eq!(a, b);
        assert_eq!(b.to_string(), "GET https://bermy.example/bus-schedules/");
    }

    #[test]
    fn test_request_key_includes_method() {
        let url = Url::parse("https://bermy.example/").unwrap();
        assert_ne!(RequestKey::get(&url), RequestKey::new(&Method::HEAD, &url));
    }

    #[tokio::test]
    async fn test_entry_round_trips_through_response() {
        let original = entry("https://bermy.example/ferry-schedules/", "ferries");
        let response = original.to_response();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers["content-type"], "text/html");

        let restored = CacheEntry::from_response(original.key.clone(), response)
            .await
            .unwrap();
        assert_eq!(restored.body, original.body);
        assert_eq!(restored.headers, original.headers);
    }

    #[tokio::test]
    async fn test_entry_keeps_non_utf8_header_bytes() {
        let mut original = entry("https://bermy.example/", "home");
        original.headers.push(("x-station".into(), b"caf\xe9".to_vec()));

        let response = original.to_response();
        assert_eq!(response.headers["x-station"].as_bytes(), b"caf\xe9");

        let restored = CacheEntry::from_response(original.key.clone(), response)
            .await
            .unwrap();
        assert_eq!(restored.headers, original.headers);
    }

    #[tokio::test]
    async fn test_open_has_delete() {
        let storage = MemoryCacheStorage::new();
        assert!(!storage.has("precache-v1").await.unwrap());

        storage.open("precache-v1").await.unwrap();
        assert!(storage.has("precache-v1").await.unwrap());

        assert!(storage.delete("precache-v1").await.unwrap());
        assert!(!storage.delete("precache-v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_in_creation_order() {
        let storage = MemoryCacheStorage::new();
        for name in ["precache-v1", "runtime", "legacy-cache"] {
            storage.open(name).await.unwrap();
        }
        storage.open("runtime").await.unwrap();
        assert_eq!(
            storage.keys().await.unwrap(),
            vec!["precache-v1", "runtime", "legacy-cache"]
        );
    }

    #[tokio::test]
    async fn test_put_replaces_same_key() {
        let storage = MemoryCacheStorage::new();
        storage.put("runtime", entry("https://bermy.example/a", "one")).await.unwrap();
        storage.put("runtime", entry("https://bermy.example/a", "two")).await.unwrap();

        assert_eq!(storage.len("runtime").await, 1);
        let key = RequestKey::get(&Url::parse("https://bermy.example/a").unwrap());
        let hit = storage.match_in("runtime", &key).await.unwrap().unwrap();
        assert_eq!(hit.body, b"two");
    }

    #[tokio::test]
    async fn test_match_in_missing_cache() {
        let storage = MemoryCacheStorage::new();
        let key = RequestKey::get(&Url::parse("https://bermy.example/").unwrap());
        assert!(storage.match_in("runtime", &key).await.unwrap().is_none());
        assert!(storage.entry_keys("runtime").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_locked_cache_rejects_writes() {
        let storage = MemoryCacheStorage::new();
        storage.lock("precache-v1").await;

        let result = storage
            .put_all("precache-v1", vec![entry("https://bermy.example/", "home")])
            .await;
        assert!(matches!(result, Err(CacheError::Locked(_))));
        assert!(!storage.has("precache-v1").await.unwrap());

        storage.unlock("precache-v1").await;
        storage
            .put_all("precache-v1", vec![entry("https://bermy.example/", "home")])
            .await
            .unwrap();
        assert_eq!(storage.len("precache-v1").await, 1);
    }
}
