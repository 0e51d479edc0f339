//! In-process host for the agent: registration, activation, page control
//! and fetch dispatch.

use std::sync::Arc;

use bermy_net::{Fetcher, Request, Response};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::intercept::{FetchEvent, FetchOutcome};
use crate::lifecycle::ActivateOutcome;
use crate::registration::{
    scope_contains, AgentWorker, Client, ClientId, Clients, Registration, WorkerId, WorkerState,
};
use crate::{AgentError, OfflineAgent};

/// Events reported by the container.
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerEvent {
    /// A new version started installing.
    UpdateFound { scope: String },
    /// A version changed state.
    StateChange {
        worker_id: WorkerId,
        new_state: WorkerState,
    },
    /// Install failed; the version is redundant.
    InstallFailed { worker_id: WorkerId, error: String },
    /// Activate failed; the version is redundant.
    ActivateFailed { worker_id: WorkerId, error: String },
    /// A page switched to a new controller.
    ControllerChange {
        client_id: ClientId,
        worker_id: WorkerId,
    },
}

/// Hosts the agent versions registered for one scope.
pub struct ServiceWorkerContainer<S, F> {
    registration: RwLock<Registration<S, F>>,
    /// Held for a whole install or activate, so jobs run one at a time.
    job: Mutex<()>,
    clients: RwLock<Clients>,
    network: Arc<F>,
    event_tx: mpsc::UnboundedSender<ContainerEvent>,
}

impl<S: CacheStorage, F: Fetcher> ServiceWorkerContainer<S, F> {
    /// Create a container for `scope`. `network` serves requests no agent handles.
    pub fn new(scope: Url, network: Arc<F>) -> (Self, mpsc::UnboundedReceiver<ContainerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registration: RwLock::new(Registration::new(scope)),
                job: Mutex::new(()),
                clients: RwLock::new(Clients::new()),
                network,
                event_tx,
            },
            event_rx,
        )
    }

    fn emit(&self, event: ContainerEvent) {
        // The receiver may have been dropped by a host that does not listen.
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, worker: &AgentWorker<S, F>) {
        self.emit(ContainerEvent::StateChange {
            worker_id: worker.id,
            new_state: worker.state,
        });
    }

    /// Install a new version of the agent.
    ///
    /// On failure the version becomes redundant and the active version keeps
    /// control. On success it waits, and activates right away when it asked
    /// to skip waiting or no page is held by the active version.
    ///
    /// A register issued while another install or activate is running waits
    /// for it to finish.
    pub async fn register(&self, agent: OfflineAgent<S, F>) -> Result<WorkerId, AgentError> {
        let _job = self.job.lock().await;
        let agent = Arc::new(agent);
        let worker_id = {
            let mut registration = self.registration.write().await;
            if registration.installing.is_some() {
                return Err(AgentError::State("an install is already in progress".into()));
            }
            let worker = AgentWorker::new(agent.clone());
            let id = worker.id;
            self.emit(ContainerEvent::UpdateFound {
                scope: registration.scope.to_string(),
            });
            self.emit_state(&worker);
            registration.installing = Some(worker);
            id
        };

        info!(worker = %worker_id, "Installing agent version");
        let result = agent.on_install().await;

        let skip_waiting = {
            let mut registration = self.registration.write().await;
            let mut worker = registration
                .installing
                .take()
                .ok_or_else(|| AgentError::State("installing version vanished".into()))?;

            match result {
                Err(e) => {
                    warn!(worker = %worker_id, error = %e, "Install failed");
                    worker.set_state(WorkerState::Redundant);
                    self.emit_state(&worker);
                    self.emit(ContainerEvent::InstallFailed {
                        worker_id,
                        error: e.to_string(),
                    });
                    return Err(e);
                }
                Ok(outcome) => {
                    worker.skip_waiting = outcome.skip_waiting;
                    worker.set_state(WorkerState::Installed);
                    self.emit_state(&worker);
                    if let Some(mut replaced) = registration.waiting.take() {
                        replaced.set_state(WorkerState::Redundant);
                        self.emit_state(&replaced);
                    }
                    registration.waiting = Some(worker);
                    outcome.skip_waiting
                }
            }
        };

        if skip_waiting || !self.active_has_clients().await {
            self.activate_waiting_locked().await?;
        } else {
            debug!(worker = %worker_id, "Waiting for pages of the active version to close");
        }

        Ok(worker_id)
    }

    async fn active_has_clients(&self) -> bool {
        let active = self.registration.read().await.active_id();
        match active {
            Some(id) => !self.clients.read().await.controlled_by(id).is_empty(),
            None => false,
        }
    }

    /// Activate the waiting version.
    ///
    /// On success the previous active version becomes redundant and pages it
    /// controlled move to the new one; a claim also takes over uncontrolled
    /// pages in scope. On failure the previous active version keeps control.
    pub async fn activate_waiting(&self) -> Result<ActivateOutcome, AgentError> {
        let _job = self.job.lock().await;
        self.activate_waiting_locked().await
    }

    /// Caller holds `job`.
    async fn activate_waiting_locked(&self) -> Result<ActivateOutcome, AgentError> {
        let (mut worker, agent) = {
            let mut registration = self.registration.write().await;
            let mut worker = registration
                .waiting
                .take()
                .ok_or_else(|| AgentError::NotFound("no waiting version".into()))?;
            worker.set_state(WorkerState::Activating);
            self.emit_state(&worker);
            let agent = worker.agent.clone();
            (worker, agent)
        };

        info!(worker = %worker.id, "Activating agent version");
        let outcome = match agent.on_activate().await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(worker = %worker.id, error = %e, "Activate failed");
                worker.set_state(WorkerState::Redundant);
                self.emit_state(&worker);
                self.emit(ContainerEvent::ActivateFailed {
                    worker_id: worker.id,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let new_id = worker.id;
        let (old_id, scope) = {
            let mut registration = self.registration.write().await;
            let old_id = registration.active.take().map(|mut old| {
                old.set_state(WorkerState::Redundant);
                self.emit_state(&old);
                old.id
            });
            worker.set_state(WorkerState::Activated);
            self.emit_state(&worker);
            registration.active = Some(worker);
            (old_id, registration.scope.clone())
        };

        let claim = outcome.claim_clients;
        let changed = self.clients.write().await.claim(new_id, |client| {
            let was_old = old_id.is_some() && client.controller == old_id;
            was_old || (claim && client.controller.is_none() && scope_contains(&scope, &client.url))
        });
        for client_id in changed {
            self.emit(ContainerEvent::ControllerChange {
                client_id,
                worker_id: new_id,
            });
        }

        info!(worker = %new_id, deleted = outcome.deleted.len(), "Agent version active");
        Ok(outcome)
    }

    /// Open a page. Pages in scope are controlled by the active version.
    pub async fn open_client(&self, url: Url) -> Client {
        let controller = {
            let registration = self.registration.read().await;
            if registration.in_scope(&url) {
                registration.active_id()
            } else {
                None
            }
        };
        let client = self.clients.write().await.open(url, controller);
        debug!(client = %client.id, controller = ?client.controller, "Opened client");
        client
    }

    /// Close a page. Closing the last page of the active version lets a
    /// waiting version activate.
    pub async fn close_client(&self, id: ClientId) -> Result<(), AgentError> {
        self.clients
            .write()
            .await
            .close(id)
            .ok_or_else(|| AgentError::NotFound(id.to_string()))?;
        debug!(client = %id, "Closed client");

        let _job = self.job.lock().await;
        let has_waiting = self.registration.read().await.waiting.is_some();
        if has_waiting && !self.active_has_clients().await {
            self.activate_waiting_locked().await?;
        }
        Ok(())
    }

    /// Route a page's request through its controller, or to the network.
    pub async fn dispatch_fetch(&self, client_id: ClientId, request: Request) -> Result<Response, AgentError> {
        let controller = self
            .clients
            .read()
            .await
            .get(client_id)
            .ok_or_else(|| AgentError::NotFound(client_id.to_string()))?
            .controller;

        let agent = match controller {
            Some(id) => {
                let registration = self.registration.read().await;
                registration
                    .active
                    .as_ref()
                    .filter(|w| w.id == id && w.state.can_intercept_fetch())
                    .map(|w| w.agent.clone())
            }
            None => None,
        };

        let Some(agent) = agent else {
            return Ok(self.network.fetch(request).await?);
        };

        let event = FetchEvent {
            request: request.clone(),
            client_id: Some(client_id),
        };
        match agent.on_fetch(event).await? {
            FetchOutcome::Respond { response, .. } => Ok(response),
            FetchOutcome::Passthrough => Ok(self.network.fetch(request).await?),
        }
    }

    pub async fn active_worker(&self) -> Option<(WorkerId, WorkerState)> {
        self.registration
            .read()
            .await
            .active
            .as_ref()
            .map(|w| (w.id, w.state))
    }

    pub async fn waiting_worker(&self) -> Option<(WorkerId, WorkerState)> {
        self.registration
            .read()
            .await
            .waiting
            .as_ref()
            .map(|w| (w.id, w.state))
    }

    /// Controller of a page.
    pub async fn controller(&self, client_id: ClientId) -> Option<WorkerId> {
        self.clients.read().await.get(client_id).and_then(|c| c.controller)
    }

    /// The agent of the active version.
    pub async fn active_agent(&self) -> Option<Arc<OfflineAgent<S, F>>> {
        self.registration
            .read()
            .await
            .active
            .as_ref()
            .map(|w| w.agent.clone())
    }
}
