//! End-to-end behaviour of the offline agent against in-memory storage and a
//! canned network.

use std::sync::Arc;

use bermy_net::memory::StaticRoute;
use bermy_net::{NetError, Request, StaticFetcher};
use bermy_sw::{
    AgentConfig, AgentError, CacheStorage, FetchEvent, FetchOutcome, MemoryCacheStorage, OfflineAgent,
    RequestKey, ResponseSource, SqliteCacheStorage, DEFAULT_PRECACHE_URLS,
};
use http::StatusCode;
use url::Url;

const ORIGIN: &str = "https://bermy.example";

fn url(path: &str) -> Url {
    Url::parse(&format!("{}{}", ORIGIN, path)).unwrap()
}

/// A network that serves every default precache URL.
fn full_site() -> StaticFetcher {
    DEFAULT_PRECACHE_URLS.iter().fold(StaticFetcher::new(), |fetcher, path| {
        fetcher.with_route(url(path).as_str(), StaticRoute::ok(format!("page {}", path)))
    })
}

fn agent_config(version: &str) -> AgentConfig {
    AgentConfig::new(url("/")).with_version(version)
}

fn agent<S: CacheStorage>(
    version: &str,
    storage: &Arc<S>,
    fetcher: &Arc<StaticFetcher>,
) -> OfflineAgent<S, StaticFetcher> {
    OfflineAgent::new(agent_config(version), storage.clone(), fetcher.clone()).unwrap()
}

fn get(path: &str) -> FetchEvent {
    FetchEvent::new(Request::get(url(path)))
}

#[tokio::test]
async fn install_is_idempotent() {
    let storage = Arc::new(MemoryCacheStorage::new());
    let fetcher = Arc::new(full_site());
    let agent = agent("v1", &storage, &fetcher);

    agent.on_install().await.unwrap();
    let first = storage.entry_keys("precache-v1").await.unwrap();
    agent.on_install().await.unwrap();
    let second = storage.entry_keys("precache-v1").await.unwrap();

    assert_eq!(first.len(), DEFAULT_PRECACHE_URLS.len());
    assert_eq!(first, second);
}

#[tokio::test]
async fn install_is_atomic() {
    let storage = Arc::new(MemoryCacheStorage::new());
    let fetcher = Arc::new(full_site());
    fetcher.set_unreachable(url("/img/bermy-logo@3x.png").as_str()).await;
    let agent = agent("v1", &storage, &fetcher);

    let err = agent.on_install().await.unwrap_err();
    assert!(matches!(err, AgentError::PrecacheResourceUnavailable { .. }));
    assert!(!storage.has("precache-v1").await.unwrap());
}

#[tokio::test]
async fn install_failure_on_error_status() {
    let storage = Arc::new(MemoryCacheStorage::new());
    let fetcher = Arc::new(full_site());
    fetcher
        .set_route(
            url("/ferry-schedules/").as_str(),
            StaticRoute::with_status(StatusCode::INTERNAL_SERVER_ERROR, "oops"),
        )
        .await;

    let result = agent("v1", &storage, &fetcher).on_install().await;
    match result {
        Err(AgentError::PrecacheResourceUnavailable { url, .. }) => {
            assert_eq!(url, "https://bermy.example/ferry-schedules/")
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(storage.keys().await.unwrap().is_empty());
}

#[tokio::test]
async fn activate_removes_stale_caches_only() {
    let storage = Arc::new(MemoryCacheStorage::new());
    for name in ["precache-v1", "precache-v2", "runtime", "legacy-cache"] {
        storage.open(name).await.unwrap();
    }
    let fetcher = Arc::new(full_site());

    let outcome = agent("v2", &storage, &fetcher).on_activate().await.unwrap();
    assert_eq!(outcome.deleted, vec!["precache-v1", "legacy-cache"]);
    assert_eq!(storage.keys().await.unwrap(), vec!["precache-v2", "runtime"]);
}

#[tokio::test]
async fn cached_request_is_served_without_network() {
    let storage = Arc::new(MemoryCacheStorage::new());
    let fetcher = Arc::new(full_site());
    let agent = agent("v1", &storage, &fetcher);
    agent.on_install().await.unwrap();
    let calls = fetcher.calls();

    let outcome = agent.on_fetch(get("/ferry-schedules/")).await.unwrap();
    assert_eq!(outcome.source(), Some(&ResponseSource::Cache("precache-v1".into())));
    let body = outcome.into_response().unwrap().text().await.unwrap();
    assert_eq!(body, "page /ferry-schedules/");
    assert_eq!(fetcher.calls(), calls);
}

#[tokio::test]
async fn miss_writes_through_once() {
    let storage = Arc::new(MemoryCacheStorage::new());
    let fetcher = Arc::new(full_site());
    fetcher
        .set_route(url("/about/").as_str(), StaticRoute::ok("about bermy"))
        .await;
    let agent = agent("v1", &storage, &fetcher);

    let response = agent
        .on_fetch(get("/about/"))
        .await
        .unwrap()
        .into_response()
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "about bermy");

    assert_eq!(fetcher.calls(), 1);
    assert_eq!(storage.len("runtime").await, 1);
    let stored = storage
        .match_in("runtime", &RequestKey::get(&url("/about/")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, 200);
    assert_eq!(stored.body, b"about bermy");
}

#[tokio::test]
async fn cross_origin_requests_pass_through() {
    let storage = Arc::new(MemoryCacheStorage::new());
    let fetcher = Arc::new(full_site());
    let agent = agent("v1", &storage, &fetcher);

    for target in [
        "https://fonts.example/inter.woff2",
        "http://bermy.example/",
        "https://bermy.example.evil.test/",
        "https://bermy.example:8443/",
    ] {
        let event = FetchEvent::new(Request::parse_get(target).unwrap());
        let outcome = agent.on_fetch(event).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Passthrough), "{target} was intercepted");
    }
    assert_eq!(fetcher.calls(), 0);
    assert!(storage.keys().await.unwrap().is_empty());
}

#[tokio::test]
async fn offline_serves_precache_and_rejects_unknown() {
    let storage = Arc::new(MemoryCacheStorage::new());
    let fetcher = Arc::new(full_site());
    let agent = agent("v1", &storage, &fetcher);
    agent.on_install().await.unwrap();
    agent.on_activate().await.unwrap();

    fetcher.set_offline(true);

    let response = agent
        .on_fetch(get("/bus-schedules/"))
        .await
        .unwrap()
        .into_response()
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "page /bus-schedules/");

    let result = agent.on_fetch(get("/not-cached/")).await;
    assert!(matches!(result, Err(AgentError::Network(NetError::Offline(_)))));
    assert_eq!(storage.len("runtime").await, 0);
}

#[tokio::test]
async fn version_bump_refreshes_precache() {
    let storage = Arc::new(MemoryCacheStorage::new());
    let fetcher = Arc::new(full_site());
    let v1 = agent("v1", &storage, &fetcher);
    v1.on_install().await.unwrap();
    v1.on_activate().await.unwrap();
    v1.on_fetch(get("/visited/")).await.unwrap();

    fetcher
        .set_route(url("/").as_str(), StaticRoute::ok("new home"))
        .await;
    let v2 = agent("v2", &storage, &fetcher);
    v2.on_install().await.unwrap();
    v2.on_activate().await.unwrap();

    assert_eq!(storage.keys().await.unwrap(), vec!["runtime", "precache-v2"]);
    let home = v2.on_fetch(get("/")).await.unwrap().into_response().unwrap();
    assert_eq!(home.text().await.unwrap(), "new home");
}

#[tokio::test]
async fn sqlite_storage_backs_the_agent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("caches.db");
    let fetcher = Arc::new(full_site());

    {
        let storage = Arc::new(SqliteCacheStorage::open_path(&path).unwrap());
        let agent = agent("v1", &storage, &fetcher);
        agent.on_install().await.unwrap();
        agent.on_activate().await.unwrap();
    }

    fetcher.set_offline(true);
    let storage = Arc::new(SqliteCacheStorage::open_path(&path).unwrap());
    let agent = agent("v1", &storage, &fetcher);
    let outcome = agent.on_fetch(get("/css/tachyons.min.css")).await.unwrap();
    assert_eq!(outcome.source(), Some(&ResponseSource::Cache("precache-v1".into())));
}
