//! Mock network for exercising the worker without sockets.
//!
//! Responses are keyed by URL path. A path can be made to fail or to stall
//! for a while, and the whole network can be taken offline.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::error::{Error, Result};
use crate::fetch::{FetchRequest, FetchResponse, Network};

/// Canned-response network.
#[derive(Debug, Default)]
pub struct MockNetwork {
    responses: Mutex<HashMap<String, FetchResponse>>,
    failing: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    requests: Mutex<Vec<FetchRequest>>,
    offline: AtomicBool,
    calls: AtomicUsize,
}

impl MockNetwork {
    /// Creates an online network that answers 404 to everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `response` for requests to `path`.
    pub fn serve(&self, path: &str, response: FetchResponse) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.insert(path.to_string(), response);
        }
    }

    /// Serves a 200 with the given body and content type.
    pub fn serve_ok(&self, path: &str, body: impl Into<bytes::Bytes>, content_type: &str) {
        self.serve(path, FetchResponse::ok(body, content_type));
    }

    /// Makes every request to `path` fail with a network error.
    pub fn fail(&self, path: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(path.to_string());
        }
    }

    /// Delays responses for `path`.
    pub fn delay(&self, path: &str, delay: Duration) {
        if let Ok(mut delays) = self.delays.lock() {
            delays.insert(path.to_string(), delay);
        }
    }

    /// Takes the network offline or back online.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of fetches attempted.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request seen so far.
    #[must_use]
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Network for MockNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let path = request.url.path().to_string();

        let delay = self
            .delays
            .lock()
            .ok()
            .and_then(|delays| delays.get(&path).copied());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Network(format!("{}: offline", request.url)));
        }
        if self.failing.lock().is_ok_and(|failing| failing.contains(&path)) {
            return Err(Error::Network(format!("{}: connection reset", request.url)));
        }

        Ok(self
            .responses
            .lock()
            .ok()
            .and_then(|responses| responses.get(&path).cloned())
            .unwrap_or_else(|| FetchResponse::new(StatusCode::NOT_FOUND, "not found")))
    }
}
