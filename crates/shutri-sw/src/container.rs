//! Service worker host model: registration slots, worker states, clients.
//!
//! The container drives the lifecycle events of [`OfflineAssetCache`]
//! versions. Install runs while the previous version keeps serving; the
//! activate step holds the registration lock so no fetch reaches a worker
//! that has not finished activating.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use shutri_net::{Fetcher, Request};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::config::WorkerConfig;
use crate::worker::{FetchResponse, OfflineAssetCache};
use crate::ServiceWorkerError;

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, not yet installing.
    #[default]
    Parsed,
    /// Install handler running.
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activate handler running.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced, unregistered, or install failed.
    Redundant,
}

// ==================== Service Worker ====================

/// A service worker version and its handlers.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Time of last state change.
    pub state_changed_at: Instant,

    script: Arc<OfflineAssetCache>,
}

impl ServiceWorker {
    fn new(script: Arc<OfflineAssetCache>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            state: ServiceWorkerState::Parsed,
            state_changed_at: Instant::now(),
            script,
        }
    }

    fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Name of the bucket this version owns.
    pub fn cache_name(&self) -> &str {
        self.script.cache_name()
    }

    /// The worker's handlers.
    pub fn script(&self) -> &Arc<OfflineAssetCache> {
        &self.script
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

// ==================== Registration ====================

/// Installing / waiting / active slots for one scope.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }
}

// ==================== Clients ====================

/// A client (open page).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Worker controlling this page, if any.
    pub controller: Option<ServiceWorkerId>,
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// All clients, optionally only those controlled by `controller`.
    pub fn match_all(&self, controller: Option<ServiceWorkerId>) -> Vec<&Client> {
        self.clients
            .values()
            .filter(|c| controller.is_none() || c.controller == controller)
            .collect()
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    /// Make `worker` the controller of every client. Returns the IDs whose
    /// controller changed.
    pub fn claim(&mut self, worker: ServiceWorkerId) -> Vec<String> {
        let mut changed = Vec::new();
        for client in self.clients.values_mut() {
            if client.controller != Some(worker) {
                client.controller = Some(worker);
                changed.push(client.id.clone());
            }
        }
        changed.sort();
        changed
    }

    fn release_all(&mut self) {
        for client in self.clients.values_mut() {
            client.controller = None;
        }
    }
}

// ==================== Events ====================

/// Service worker events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A new version started installing.
    UpdateFound { scope: String },
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        cache_name: String,
        new_state: ServiceWorkerState,
    },
    /// A client got a new controller.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
}

// ==================== Service Worker Container ====================

/// Host runtime for the offline cache worker of one scope.
pub struct ServiceWorkerContainer {
    registration: RwLock<ServiceWorkerRegistration>,

    /// Cache storage shared by every version.
    storage: Arc<dyn CacheStorage>,

    /// Network used by the workers and by uncontrolled requests.
    fetcher: Arc<dyn Fetcher>,

    /// Open pages.
    clients: RwLock<Clients>,

    /// Serializes register/activate/unregister.
    lifecycle: Mutex<()>,

    /// Event sender for state changes.
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a new container.
    pub fn new(
        scope: Url,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registration: RwLock::new(ServiceWorkerRegistration::new(scope)),
                storage,
                fetcher,
                clients: RwLock::new(Clients::new()),
                lifecycle: Mutex::new(()),
                event_tx,
            },
            event_rx,
        )
    }

    /// Shared cache storage.
    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }

    /// Register a worker version: install it and, if it asks to skip
    /// waiting, activate it.
    ///
    /// On install failure the new worker becomes redundant and the previous
    /// active worker keeps serving.
    pub async fn register(&self, config: WorkerConfig) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let _lifecycle = self.lifecycle.lock().await;

        let script = Arc::new(OfflineAssetCache::new(
            config,
            Arc::clone(&self.storage),
            Arc::clone(&self.fetcher),
        )?);
        let mut worker = ServiceWorker::new(script);
        let id = worker.id;

        {
            let mut registration = self.registration.write().await;
            if let Some(mut old) = registration.installing.take() {
                self.transition(&mut old, ServiceWorkerState::Redundant);
            }
            let _ = self.event_tx.send(ServiceWorkerEvent::UpdateFound {
                scope: registration.scope.to_string(),
            });
            self.transition(&mut worker, ServiceWorkerState::Installing);
            registration.installing = Some(worker.clone());
        }

        let outcome = worker.script.install().await;

        let skip_waiting = {
            let mut registration = self.registration.write().await;
            let Some(mut worker) = registration.installing.take() else {
                return Err(ServiceWorkerError::StateError(
                    "installing worker vanished".to_string(),
                ));
            };

            match outcome {
                Ok(outcome) => {
                    self.transition(&mut worker, ServiceWorkerState::Installed);
                    if let Some(mut old) = registration.waiting.replace(worker) {
                        self.transition(&mut old, ServiceWorkerState::Redundant);
                    }
                    outcome.skip_waiting
                }
                Err(e) => {
                    warn!(cache = worker.cache_name(), error = %e, "Install failed");
                    self.transition(&mut worker, ServiceWorkerState::Redundant);
                    return Err(e);
                }
            }
        };

        if skip_waiting {
            self.activate_waiting().await?;
        }

        Ok(id)
    }

    /// Activate the waiting worker.
    pub async fn activate(&self) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.activate_waiting().await
    }

    async fn activate_waiting(&self) -> Result<ServiceWorkerId, ServiceWorkerError> {
        // Held across the activate handler: fetches wait until it finishes.
        let mut registration = self.registration.write().await;
        let mut worker = registration
            .waiting
            .take()
            .ok_or_else(|| ServiceWorkerError::NotFound("waiting worker".to_string()))?;

        self.transition(&mut worker, ServiceWorkerState::Activating);

        let claim = match worker.script.activate().await {
            Ok(outcome) => outcome.claim_clients,
            Err(e) => {
                // Activation goes ahead; stale buckets just stay around.
                warn!(cache = worker.cache_name(), error = %e, "Activate handler failed");
                false
            }
        };

        if let Some(mut old) = registration.active.take() {
            self.transition(&mut old, ServiceWorkerState::Redundant);
        }
        self.transition(&mut worker, ServiceWorkerState::Activated);
        let id = worker.id;
        info!(cache = worker.cache_name(), "Worker activated");
        registration.active = Some(worker);

        if claim {
            self.claim(id).await;
        }

        Ok(id)
    }

    /// Restart an already-installed version without reinstalling.
    ///
    /// Models a host restart: the registration survives in the host and the
    /// bucket survives in storage. Fails with `NotFound` if the bucket is gone.
    pub async fn resume(&self, config: WorkerConfig) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let _lifecycle = self.lifecycle.lock().await;

        if !self.storage.has(&config.cache_name).await? {
            return Err(ServiceWorkerError::NotFound(config.cache_name));
        }

        let script = Arc::new(OfflineAssetCache::new(
            config,
            Arc::clone(&self.storage),
            Arc::clone(&self.fetcher),
        )?);
        let mut worker = ServiceWorker::new(script);
        let id = worker.id;

        let mut registration = self.registration.write().await;
        if let Some(mut old) = registration.active.take() {
            self.transition(&mut old, ServiceWorkerState::Redundant);
        }
        self.transition(&mut worker, ServiceWorkerState::Activated);
        registration.active = Some(worker);
        drop(registration);

        self.claim(id).await;
        Ok(id)
    }

    async fn claim(&self, worker_id: ServiceWorkerId) {
        let changed = self.clients.write().await.claim(worker_id);
        for client_id in changed {
            debug!(client = %client_id, "Client claimed");
            let _ = self
                .event_tx
                .send(ServiceWorkerEvent::ControllerChange { client_id, worker_id });
        }
    }

    fn transition(&self, worker: &mut ServiceWorker, state: ServiceWorkerState) {
        worker.set_state(state);
        let _ = self.event_tx.send(ServiceWorkerEvent::StateChange {
            worker_id: worker.id,
            cache_name: worker.cache_name().to_string(),
            new_state: state,
        });
    }

    /// Open a page. It is controlled by the active worker, if there is one.
    pub async fn add_client(&self, id: &str, url: Url) -> Client {
        let controller = self
            .registration
            .read()
            .await
            .active
            .as_ref()
            .map(|w| w.id);
        let client = Client {
            id: id.to_string(),
            url,
            controller,
        };
        self.clients.write().await.add(client.clone());
        client
    }

    /// Close a page.
    pub async fn remove_client(&self, id: &str) -> Option<Client> {
        self.clients.write().await.remove(id)
    }

    /// Look up a page.
    pub async fn client(&self, id: &str) -> Option<Client> {
        self.clients.read().await.get(id).cloned()
    }

    /// Every open page, ordered by ID.
    pub async fn clients(&self) -> Vec<Client> {
        let mut clients: Vec<Client> = self
            .clients
            .read()
            .await
            .match_all(None)
            .into_iter()
            .cloned()
            .collect();
        clients.sort_by(|a, b| a.id.cmp(&b.id));
        clients
    }

    /// Dispatch a fetch from `client_id` (or a navigation, when `None`).
    ///
    /// Requests from pages the active worker does not control, and every
    /// request while no worker is active, go straight to the network.
    pub async fn handle_fetch(
        &self,
        request: Request,
        client_id: Option<&str>,
    ) -> Result<FetchResponse, ServiceWorkerError> {
        let active = self
            .registration
            .read()
            .await
            .active
            .as_ref()
            .map(|w| (w.id, Arc::clone(&w.script)));

        let script = match (active, client_id) {
            (Some((_, script)), None) => Some(script),
            (Some((id, script)), Some(client_id)) => {
                let clients = self.clients.read().await;
                match clients.get(client_id) {
                    Some(client) if client.controller == Some(id) => Some(script),
                    _ => None,
                }
            }
            (None, _) => None,
        };

        match script {
            Some(script) => script.handle_fetch(request).await,
            None => {
                debug!(url = %request.url, "Uncontrolled request");
                let response = self.fetcher.fetch(request).await?;
                Ok(FetchResponse::network(response))
            }
        }
    }

    /// Wait for the active worker's background revalidations.
    pub async fn settle(&self) {
        let script = self
            .registration
            .read()
            .await
            .active
            .as_ref()
            .map(|w| Arc::clone(&w.script));
        if let Some(script) = script {
            script.settle().await;
        }
    }

    pub async fn installing(&self) -> Option<ServiceWorker> {
        self.registration.read().await.installing.clone()
    }

    pub async fn waiting(&self) -> Option<ServiceWorker> {
        self.registration.read().await.waiting.clone()
    }

    pub async fn active(&self) -> Option<ServiceWorker> {
        self.registration.read().await.active.clone()
    }

    /// Unregister: every worker becomes redundant and pages lose their
    /// controller. Buckets are left in storage. Returns whether any worker
    /// was registered.
    pub async fn unregister(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().await;
        let mut guard = self.registration.write().await;
        let registration = &mut *guard;

        let mut found = false;
        for slot in [
            &mut registration.active,
            &mut registration.waiting,
            &mut registration.installing,
        ] {
            if let Some(mut worker) = slot.take() {
                self.transition(&mut worker, ServiceWorkerState::Redundant);
                found = true;
            }
        }

        self.clients.write().await.release_all();
        found
    }
}
