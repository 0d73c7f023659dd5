//! The offline asset cache worker: install, activate and fetch handlers.

use std::fmt;
use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use http::Method;
use shutri_net::{CredentialsMode, Fetcher, Request, Response};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheStorage};
use crate::config::{FetchStrategy, WorkerConfig};
use crate::ServiceWorkerError;

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    /// Entries stored in the current bucket.
    pub stored: usize,
    /// The worker asked to activate without waiting for pages to close.
    pub skip_waiting: bool,
}

/// Result of the activate handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateOutcome {
    /// Buckets that were deleted.
    pub deleted: Vec<String>,
    /// The worker asked to take control of already-open pages.
    pub claim_clients: bool,
}

/// Where a fetch answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
}

/// Answer to a fetch event.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub response: Response,
    pub source: ResponseSource,
}

impl FetchResponse {
    fn cached(response: Response) -> Self {
        Self {
            response,
            source: ResponseSource::Cache,
        }
    }

    pub(crate) fn network(response: Response) -> Self {
        Self {
            response,
            source: ResponseSource::Network,
        }
    }

    /// Whether the answer was served from the bucket.
    pub fn from_cache(&self) -> bool {
        self.source == ResponseSource::Cache
    }
}

type Revalidation = JoinHandle<Result<Response, ServiceWorkerError>>;

/// Offline asset cache worker.
///
/// One instance per worker version. The bucket it owns is
/// `config.cache_name`; storage is shared with every other version.
pub struct OfflineAssetCache {
    config: WorkerConfig,
    manifest: Vec<Url>,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    revalidations: Mutex<Vec<Revalidation>>,
}

impl fmt::Debug for OfflineAssetCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineAssetCache")
            .field("cache_name", &self.config.cache_name)
            .field("strategy", &self.config.strategy)
            .field("manifest", &self.manifest.len())
            .finish()
    }
}

impl OfflineAssetCache {
    /// Create a worker. Fails if a manifest entry doesn't resolve.
    pub fn new(
        config: WorkerConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ServiceWorkerError> {
        let manifest = config.resolved_manifest()?;
        Ok(Self {
            config,
            manifest,
            storage,
            fetcher,
            revalidations: Mutex::new(Vec::new()),
        })
    }

    pub fn cache_name(&self) -> &str {
        &self.config.cache_name
    }

    pub fn strategy(&self) -> FetchStrategy {
        self.config.strategy
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Resolved manifest URLs.
    pub fn manifest(&self) -> &[Url] {
        &self.manifest
    }

    // ==================== Install ====================

    /// Install handler: populate the current bucket from the manifest.
    ///
    /// All manifest fetches must succeed with a 2xx status; otherwise nothing
    /// is stored and the install fails. A bucket created by a failed install
    /// is deleted again, so only completed installs leave a bucket behind.
    pub async fn install(&self) -> Result<InstallOutcome, ServiceWorkerError> {
        let name = self.cache_name();
        let created = !self.storage.has(name).await?;
        self.storage.open(name).await?;
        info!(cache = name, "Opened cache");

        let fetches = self.manifest.iter().map(|url| {
            let request = Request::get(url.clone()).credentials(CredentialsMode::Omit);
            let fetcher = Arc::clone(&self.fetcher);
            async move {
                let response = fetcher.fetch(request.clone()).await?;
                if !response.ok() {
                    return Err(ServiceWorkerError::BadStatus {
                        url: request.url,
                        status: response.status,
                    });
                }
                trace!(url = %request.url, bytes = response.body().len(), "Precached");
                Ok(CacheEntry::from_response(&request, &response))
            }
        });

        let entries = match try_join_all(fetches).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(cache = name, error = %e, "Precache failed");
                if created {
                    if let Err(cleanup) = self.storage.delete(name).await {
                        warn!(cache = name, error = %cleanup, "Failed to drop partial cache");
                    }
                }
                return Err(ServiceWorkerError::InstallFailed {
                    cache: name.to_string(),
                    source: Box::new(e),
                });
            }
        };

        let stored = entries.len();
        self.storage.put_all(name, entries).await?;
        info!(cache = name, stored, "Install complete");

        Ok(InstallOutcome {
            stored,
            skip_waiting: self.config.skip_waiting,
        })
    }

    // ==================== Activate ====================

    /// Activate handler: delete every bucket except the current one.
    ///
    /// Individual delete failures are logged and skipped.
    pub async fn activate(&self) -> Result<ActivateOutcome, ServiceWorkerError> {
        let current = self.cache_name();
        let stale: Vec<String> = self
            .storage
            .keys()
            .await?
            .into_iter()
            .filter(|name| name != current)
            .collect();

        let results = join_all(stale.iter().map(|name| self.storage.delete(name))).await;

        let mut deleted = Vec::new();
        for (name, result) in stale.into_iter().zip(results) {
            match result {
                Ok(true) => {
                    info!(cache = %name, "Deleted stale cache");
                    deleted.push(name);
                }
                Ok(false) => {}
                Err(e) => warn!(cache = %name, error = %e, "Failed to delete stale cache"),
            }
        }

        Ok(ActivateOutcome {
            deleted,
            claim_clients: true,
        })
    }

    // ==================== Fetch ====================

    /// Fetch handler.
    ///
    /// Non-GET requests are never cached and go straight to the network.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchResponse, ServiceWorkerError> {
        if request.method != Method::GET {
            debug!(url = %request.url, method = %request.method, "Bypassing cache");
            return Ok(FetchResponse::network(self.fetcher.fetch(request).await?));
        }

        match self.config.strategy {
            FetchStrategy::CacheFirst => self.cache_first(request).await,
            FetchStrategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
        }
    }

    async fn cache_first(&self, request: Request) -> Result<FetchResponse, ServiceWorkerError> {
        if let Some(entry) = self
            .storage
            .match_request(self.cache_name(), &request)
            .await?
        {
            trace!(url = %request.url, "Cache hit");
            return Ok(FetchResponse::cached(entry.to_response()?));
        }

        debug!(url = %request.url, "Cache miss, fetching");
        let response = self.fetcher.fetch(request).await?;
        Ok(FetchResponse::network(response))
    }

    async fn stale_while_revalidate(
        &self,
        request: Request,
    ) -> Result<FetchResponse, ServiceWorkerError> {
        let network = tokio::spawn(revalidate(
            Arc::clone(&self.storage),
            Arc::clone(&self.fetcher),
            self.config.cache_name.clone(),
            request.clone(),
        ));

        let cached = match self
            .storage
            .match_request(self.cache_name(), &request)
            .await
        {
            Ok(hit) => hit,
            Err(e) => {
                warn!(url = %request.url, error = %e, "Cache lookup failed");
                None
            }
        };

        match cached.map(|entry| entry.to_response()).transpose() {
            Ok(Some(response)) => {
                trace!(url = %request.url, "Serving stale, revalidating");
                self.track(network).await;
                Ok(FetchResponse::cached(response))
            }
            Ok(None) => {
                debug!(url = %request.url, "Cache miss, waiting for network");
                let response = network.await.map_err(|e| {
                    ServiceWorkerError::StateError(format!("network task failed: {e}"))
                })??;
                Ok(FetchResponse::network(response))
            }
            Err(e) => {
                network.abort();
                Err(e)
            }
        }
    }

    async fn track(&self, handle: Revalidation) {
        let mut pending = self.revalidations.lock().await;
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Wait for every background revalidation started so far.
    pub async fn settle(&self) {
        let pending: Vec<Revalidation> = std::mem::take(&mut *self.revalidations.lock().await);
        for handle in pending {
            // Failures were already logged by the task.
            let _ = handle.await;
        }
    }
}

/// Fetch `request` and store a copy of a 2xx answer in `cache_name`.
///
/// Store failures are logged and never fail the fetch.
async fn revalidate(
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    cache_name: String,
    request: Request,
) -> Result<Response, ServiceWorkerError> {
    let response = match fetcher.fetch(request.clone()).await {
        Ok(response) => response,
        Err(e) => {
            debug!(url = %request.url, error = %e, "Revalidation fetch failed");
            return Err(e.into());
        }
    };

    if response.ok() {
        let entry = CacheEntry::from_response(&request, &response);
        match storage.put(&cache_name, entry).await {
            Ok(()) => trace!(url = %request.url, cache = %cache_name, "Revalidated"),
            Err(e) => debug!(url = %request.url, error = %e, "Revalidation store skipped"),
        }
    } else {
        debug!(url = %request.url, status = %response.status, "Not caching error status");
    }

    Ok(response)
}
