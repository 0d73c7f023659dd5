//! # Shutri Service Worker
//!
//! Offline asset cache for the Sruti Gita page, modelled as a service worker.
//!
//! ## Features
//!
//! - **Install**: pre-cache a fixed manifest into a version-named bucket,
//!   all-or-nothing, then request skip-waiting
//! - **Activate**: delete every bucket that is not the current version's and
//!   claim open pages
//! - **Fetch**: cache-first or stale-while-revalidate, picked per version
//! - **Cache storage**: in-memory and file-backed bucket stores
//! - **Host model**: registration slots, worker states, clients
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (host runtime)
//!     │
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing ─┐
//!     │       ├── waiting     ├── ServiceWorker ── OfflineAssetCache
//!     │       └── active     ─┘                        │
//!     └── Clients                                      ├── CacheStorage
//!                                                      │       └── Cache (bucket)
//!                                                      │               └── Request → CacheEntry
//!                                                      └── Fetcher (network)
//! ```

use http::StatusCode;
use shutri_common::ShutriError;
use shutri_net::NetError;
use thiserror::Error;
use url::Url;

pub mod cache;
pub mod config;
pub mod container;
pub mod file_store;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheKey, CacheStorage, MemoryCacheStorage};
pub use config::{FetchStrategy, WorkerConfig};
pub use container::{
    Client, Clients, ServiceWorker, ServiceWorkerContainer, ServiceWorkerEvent, ServiceWorkerId,
    ServiceWorkerRegistration, ServiceWorkerState,
};
pub use file_store::FileCacheStorage;
pub use worker::{ActivateOutcome, FetchResponse, InstallOutcome, OfflineAssetCache, ResponseSource};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install of {cache} failed: {source}")]
    InstallFailed {
        cache: String,
        #[source]
        source: Box<ServiceWorkerError>,
    },

    #[error("Bad response status {status} for {url}")]
    BadStatus { url: Url, status: StatusCode },

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ServiceWorkerError> for ShutriError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::Network(e) => ShutriError::network_with_source("fetch failed", e),
            err @ ServiceWorkerError::BadStatus { .. } => ShutriError::network(err.to_string()),
            ServiceWorkerError::CacheError(message) => ShutriError::cache(message),
            ServiceWorkerError::Config(message) => ShutriError::config(message),
            ServiceWorkerError::NotFound(what) => ShutriError::NotFound(what),
            ServiceWorkerError::Io(e) => ShutriError::Io(e),
            err @ (ServiceWorkerError::InstallFailed { .. } | ServiceWorkerError::StateError(_)) => {
                ShutriError::lifecycle_with_source("service worker lifecycle", err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_failure_keeps_cause() {
        let url = Url::parse("https://example.com/bg01.mp3").unwrap();
        let err = ServiceWorkerError::InstallFailed {
            cache: "sruti-gita-v1".into(),
            source: Box::new(ServiceWorkerError::BadStatus {
                url,
                status: StatusCode::NOT_FOUND,
            }),
        };
        let msg = err.to_string();
        assert!(msg.contains("sruti-gita-v1"));
        assert!(msg.contains("404"));
    }

    #[test]
    fn test_into_shutri_error_categories() {
        let err: ShutriError = ServiceWorkerError::Config("bad manifest".into()).into();
        assert_eq!(err.category(), "config");

        let err: ShutriError = ServiceWorkerError::StateError("no worker".into()).into();
        assert_eq!(err.category(), "lifecycle");

        let err: ShutriError =
            ServiceWorkerError::Network(NetError::RequestFailed("reset".into())).into();
        assert_eq!(err.category(), "network");
    }
}
