//! Versions of the agent and the pages they control.
//!
//! ```text
//! Registration (scope)
//!     ├── installing (AgentWorker)
//!     ├── waiting    (AgentWorker)
//!     └── active     (AgentWorker) ── controls ──> Clients
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::OfflineAgent;

// ==================== Workers ====================

/// Unique identifier for one installed version of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(u64);

impl WorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Lifecycle state of one agent version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Install running.
    Installing,
    /// Installed, waiting for the previous version to let go.
    Installed,
    /// Activate running.
    Activating,
    /// Controlling pages.
    Activated,
    /// Replaced, or install/activate failed.
    Redundant,
}

impl WorkerState {
    /// Fetch events are only delivered to an activating or active version.
    pub fn can_intercept_fetch(&self) -> bool {
        matches!(self, WorkerState::Activating | WorkerState::Activated)
    }
}

/// One version of the agent as seen by the host.
pub struct AgentWorker<S, F> {
    pub id: WorkerId,
    pub state: WorkerState,
    pub agent: Arc<OfflineAgent<S, F>>,
    /// Set by a successful install.
    pub skip_waiting: bool,
    pub state_changed_at: Instant,
}

impl<S, F> AgentWorker<S, F> {
    pub fn new(agent: Arc<OfflineAgent<S, F>>) -> Self {
        Self {
            id: WorkerId::new(),
            state: WorkerState::Installing,
            agent,
            skip_waiting: false,
            state_changed_at: Instant::now(),
        }
    }

    pub fn set_state(&mut self, state: WorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    pub fn is_active(&self) -> bool {
        self.state == WorkerState::Activated
    }
}

impl<S, F> fmt::Debug for AgentWorker<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentWorker")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("skip_waiting", &self.skip_waiting)
            .finish()
    }
}

// ==================== Registration ====================

/// The versions registered for one scope.
#[derive(Debug)]
pub struct Registration<S, F> {
    pub scope: Url,
    pub installing: Option<AgentWorker<S, F>>,
    pub waiting: Option<AgentWorker<S, F>>,
    pub active: Option<AgentWorker<S, F>>,
}

impl<S, F> Registration<S, F> {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    /// Whether `url` falls under this registration.
    pub fn in_scope(&self, url: &Url) -> bool {
        scope_contains(&self.scope, url)
    }

    pub fn active_id(&self) -> Option<WorkerId> {
        self.active.as_ref().map(|w| w.id)
    }

    pub fn waiting_id(&self) -> Option<WorkerId> {
        self.waiting.as_ref().map(|w| w.id)
    }
}

/// Same origin as `scope`, and a path under it.
pub fn scope_contains(scope: &Url, url: &Url) -> bool {
    url.scheme() == scope.scheme()
        && url.host_str() == scope.host_str()
        && url.port_or_known_default() == scope.port_or_known_default()
        && url.path().starts_with(scope.path())
}

// ==================== Clients ====================

/// Identifier of an open page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// An open page.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    /// Version whose interceptor sees this page's requests.
    pub controller: Option<WorkerId>,
}

/// Open pages.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<ClientId, Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly opened page.
    pub fn open(&mut self, url: Url, controller: Option<WorkerId>) -> Client {
        let client = Client {
            id: ClientId::new(),
            url,
            controller,
        };
        self.clients.insert(client.id, client.clone());
        client
    }

    /// Forget a closed page.
    pub fn close(&mut self, id: ClientId) -> Option<Client> {
        self.clients.remove(&id)
    }

    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Pages controlled by `worker`, in opening order.
    pub fn controlled_by(&self, worker: WorkerId) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self
            .clients
            .values()
            .filter(|c| c.controller == Some(worker))
            .map(|c| c.id)
            .collect();
        ids.sort();
        ids
    }

    /// Make `worker` the controller of every page matching `filter`.
    ///
    /// Returns the pages whose controller changed, in opening order.
    pub fn claim(&mut self, worker: WorkerId, filter: impl Fn(&Client) -> bool) -> Vec<ClientId> {
        let mut changed: Vec<ClientId> = self
            .clients
            .values_mut()
            .filter(|c| c.controller != Some(worker) && filter(c))
            .map(|c| {
                c.controller = Some(worker);
                c.id
            })
            .collect();
        changed.sort();
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_worker_ids_are_unique() {
        let a = WorkerId::new();
        let b = WorkerId::new();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("worker-"));
    }

    #[test]
    fn test_fetch_interception_states() {
        assert!(!WorkerState::Installing.can_intercept_fetch());
        assert!(!WorkerState::Installed.can_intercept_fetch());
        assert!(WorkerState::Activating.can_intercept_fetch());
        assert!(WorkerState::Activated.can_intercept_fetch());
        assert!(!WorkerState::Redundant.can_intercept_fetch());
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&WorkerState::Activated).unwrap(), "\"activated\"");
    }

    #[test]
    fn test_scope_matching() {
        let registration: Registration<(), ()> = Registration::new(url("https://bermy.example/"));
        assert!(registration.in_scope(&url("https://bermy.example/bus-schedules/")));
        assert!(!registration.in_scope(&url("http://bermy.example/")));
        assert!(!registration.in_scope(&url("https://bermy.example.evil.test/")));

        let nested: Registration<(), ()> = Registration::new(url("https://bermy.example/bus-schedules/"));
        assert!(!nested.in_scope(&url("https://bermy.example/ferry-schedules/")));
    }

    #[test]
    fn test_clients_claim() {
        let mut clients = Clients::new();
        let old = WorkerId::new();
        let new = WorkerId::new();
        let a = clients.open(url("https://bermy.example/"), Some(old));
        let b = clients.open(url("https://bermy.example/bus-schedules/"), None);
        let c = clients.open(url("https://bermy.example/ferry-schedules/"), Some(new));

        assert_eq!(clients.controlled_by(old), vec![a.id]);

        let changed = clients.claim(new, |_| true);
        assert_eq!(changed, vec![a.id, b.id]);
        assert_eq!(clients.controlled_by(new), vec![a.id, b.id, c.id]);
        assert!(clients.controlled_by(old).is_empty());
    }

    #[test]
    fn test_clients_close() {
        let mut clients = Clients::new();
        let client = clients.open(url("https://bermy.example/"), None);
        assert_eq!(clients.len(), 1);
        assert!(clients.close(client.id).is_some());
        assert!(clients.close(client.id).is_none());
        assert!(clients.is_empty());
    }
}
