//! In-memory fetcher serving canned responses.
//!
//! Used to drive the agent without a network: tests, demos, and simulated
//! offline conditions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderValue, StatusCode};
use tokio::sync::{mpsc, RwLock};
use tracing::trace;

use crate::{Fetcher, NetError, Request, Response};

/// A canned response for one URL.
#[derive(Debug, Clone)]
pub struct StaticRoute {
    pub status: StatusCode,
    pub content_type: Option<&'static str>,
    pub body: Bytes,
}

impl StaticRoute {
    /// A 200 response with the given body.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: None,
            body: body.into(),
        }
    }

    /// A response with an arbitrary status.
    pub fn with_status(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: None,
            body: body.into(),
        }
    }
}

/// Fetcher that answers from a URL → response table.
///
/// Unknown URLs get a 404. Bodies are delivered as streams, so consumers have
/// to duplicate a response before reading it twice.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    routes: RwLock<HashMap<String, StaticRoute>>,
    unreachable: RwLock<HashSet<String>>,
    offline: AtomicBool,
    calls: AtomicUsize,
    requested: RwLock<Vec<String>>,
}

impl StaticFetcher {
    /// Create an empty fetcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route (builder style).
    pub fn with_route(mut self, url: &str, route: StaticRoute) -> Self {
        self.routes.get_mut().insert(url.to_string(), route);
        self
    }

    /// Add or replace a route.
    pub async fn set_route(&self, url: &str, route: StaticRoute) {
        self.routes.write().await.insert(url.to_string(), route);
    }

    /// Make one URL fail at the transport level.
    pub async fn set_unreachable(&self, url: &str) {
        self.unreachable.write().await.insert(url.to_string());
    }

    /// Simulate losing (or regaining) the network.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of fetches attempted.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// URLs requested, in order.
    pub async fn requested(&self) -> Vec<String> {
        self.requested.read().await.clone()
    }

    async fn respond(&self, request: Request) -> Result<Response, NetError> {
        let url = request.url.to_string();
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested.write().await.push(url.clone());

        if self.offline.load(Ordering::SeqCst) {
            trace!(url = %url, "Offline, failing fetch");
            return Err(NetError::Offline(url));
        }
        if self.unreachable.read().await.contains(&url) {
            return Err(NetError::RequestFailed(format!("connection refused: {}", url)));
        }

        let route = self
            .routes
            .read()
            .await
            .get(&url)
            .cloned()
            .unwrap_or_else(|| StaticRoute::with_status(StatusCode::NOT_FOUND, "Not Found"));

        let mut headers = HeaderMap::new();
        if let Some(content_type) = route.content_type {
            headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        }

        let (tx, rx) = mpsc::channel(1);
        // Capacity 1 holds the whole body, so this never waits.
        let _ = tx.try_send(Ok(route.body));
        Ok(Response::streaming(request.url, route.status, headers, rx))
    }
}

impl Fetcher for StaticFetcher {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
        Box::pin(self.respond(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_known_route() {
        let fetcher = StaticFetcher::new().with_route(
            "https://bermy.example/bus-schedules/",
            StaticRoute::ok("buses"),
        );
        let request = Request::parse_get("https://bermy.example/bus-schedules/").unwrap();
        let response = fetcher.fetch(request).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "buses");
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let fetcher = StaticFetcher::new();
        let request = Request::parse_get("https://bermy.example/nope").unwrap();
        let response = fetcher.fetch(request).await.unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_offline_fails() {
        let fetcher = StaticFetcher::new().with_route("https://bermy.example/", StaticRoute::ok("home"));
        fetcher.set_offline(true);
        let request = Request::parse_get("https://bermy.example/").unwrap();
        assert!(matches!(
            fetcher.fetch(request).await,
            Err(NetError::Offline(_))
        ));
        assert_eq!(fetcher.requested().await, vec!["https://bermy.example/"]);
    }

    #[tokio::test]
    async fn test_unreachable_url() {
        let fetcher = StaticFetcher::new();
        fetcher.set_unreachable("https://bermy.example/img/bermy-logo@3x.png").await;
        let request = Request::parse_get("https://bermy.example/img/bermy-logo@3x.png").unwrap();
        assert!(matches!(
            fetcher.fetch(request).await,
            Err(NetError::RequestFailed(_))
        ));
    }
}
