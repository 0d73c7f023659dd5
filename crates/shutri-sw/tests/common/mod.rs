//! Shared fixtures for the lifecycle tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use http::StatusCode;
use shutri_net::{Fetcher, NetError, Request, Response};
use shutri_sw::WorkerConfig;
use tokio::sync::Notify;
use url::Url;

pub const ORIGIN: &str = "https://gita.example/";

/// What the scripted network answers for a path.
#[derive(Debug, Clone)]
pub enum Route {
    Body(String),
    Status(u16),
    Fail,
}

/// Network double: answers by URL path, counts calls and can hold the
/// answers for a path until released.
#[derive(Default)]
pub struct ScriptedFetcher {
    routes: Mutex<HashMap<String, Route>>,
    calls: AtomicUsize,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, path: &str, body: &str) {
        self.route(path, Route::Body(body.to_string()));
    }

    pub fn route(&self, path: &str, route: Route) {
        self.routes.lock().unwrap().insert(path.to_string(), route);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Hold answers for `path`. Each `notify_one` on the returned gate lets
    /// one held request through.
    pub fn hold(&self, path: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(path.to_string(), Arc::clone(&notify));
        notify
    }

    /// Stop holding new requests for `path`.
    pub fn unhold(&self, path: &str) {
        self.gates.lock().unwrap().remove(path);
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.gates.lock().unwrap().get(request.url.path()).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let route = self.routes.lock().unwrap().get(request.url.path()).cloned();
        match route {
            Some(Route::Body(body)) => Ok(Response::new(request.url, StatusCode::OK, body)),
            Some(Route::Status(code)) => {
                let status = StatusCode::from_u16(code).unwrap();
                Ok(Response::new(request.url, status, Vec::new()))
            }
            Some(Route::Fail) => Err(NetError::RequestFailed("connection reset".into())),
            None => Ok(Response::new(request.url, StatusCode::NOT_FOUND, Vec::new())),
        }
    }
}

pub fn origin() -> Url {
    Url::parse(ORIGIN).unwrap()
}

pub fn get(path: &str) -> Request {
    Request::get(origin().join(path).unwrap())
}

/// Local-only config for bucket `sruti-gita-v<version>`.
pub fn config(version: u32, manifest: &[&str]) -> WorkerConfig {
    WorkerConfig::versioned("sruti-gita", version)
        .with_origin(origin())
        .with_manifest(manifest.iter().copied())
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("shutri_sw=debug")
        .with_test_writer()
        .try_init();
}
