//! Fetch interception: range slice, cache hit, network fallback, offline shell.

use std::sync::Arc;

use reqwest::{Method, StatusCode, Url};

use crate::config::CacheConfig;
use crate::entry::CacheEntry;
use crate::error::Result;
use crate::fetch::{FetchRequest, FetchResponse, Network};
use crate::key::CacheKey;
use crate::range;
use crate::store::Generation;

/// Which path produced a response. Exposed for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Served {
    /// Sliced from a cached entry.
    RangeSlice,
    /// Ranged request passed through to the network.
    RangeNetwork,
    /// Returned verbatim from the cache.
    CacheHit,
    /// Fetched from the network.
    Network,
    /// App shell served in place of a failed navigation.
    OfflineShell,
}

/// Services intercepted requests against one cache generation.
pub struct FetchInterceptor {
    generation: Generation,
    network: Arc<dyn Network>,
    config: Arc<CacheConfig>,
    origin: Url,
}

impl FetchInterceptor {
    /// Creates an interceptor over `generation`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured origin is invalid.
    pub fn new(
        generation: Generation,
        network: Arc<dyn Network>,
        config: Arc<CacheConfig>,
    ) -> Result<Self> {
        let origin = config.origin_url()?;
        Ok(Self {
            generation,
            network,
            config,
            origin,
        })
    }

    /// Returns the canonical key for a URL.
    #[must_use]
    pub fn key_for(&self, url: &Url) -> CacheKey {
        CacheKey::canonical(url, &self.origin)
    }

    /// Returns true if the request targets media that may be cached on the fly.
    #[must_use]
    pub fn is_cacheable_media(&self, request: &FetchRequest) -> bool {
        request.destination.is_media() || self.config.is_media_path(request.url.path())
    }

    /// Produces a response for `request`.
    ///
    /// # Errors
    ///
    /// Propagates the network error when the network is unreachable and no
    /// cached fallback applies.
    pub async fn handle(&self, request: &FetchRequest) -> Result<FetchResponse> {
        self.handle_with_source(request).await.map(|(response, _)| response)
    }

    /// Like [`handle`](Self::handle), also reporting which path served the request.
    ///
    /// # Errors
    ///
    /// Propagates the network error when no cached fallback applies.
    pub async fn handle_with_source(
        &self,
        request: &FetchRequest,
    ) -> Result<(FetchResponse, Served)> {
        // Only GET responses are ever stored.
        if request.method != Method::GET {
            return Ok((self.network.fetch(request).await?, Served::Network));
        }

        let key = self.key_for(&request.url);

        if let Some(range_header) = request.range() {
            return match self.lookup(&key).await {
                Some(entry) => {
                    let response = range::slice(&entry, range_header);
                    log::debug!(
                        "Range {range_header} for {key} served from cache ({})",
                        response.status.as_u16()
                    );
                    Ok((response, Served::RangeSlice))
                }
                None => {
                    log::debug!("Range {range_header} for {key} not cached, passing through");
                    Ok((self.network.fetch(request).await?, Served::RangeNetwork))
                }
            };
        }

        if let Some(entry) = self.lookup(&key).await {
            log::debug!("Cache hit for {key}");
            return Ok((entry.to_response(), Served::CacheHit));
        }

        match self.network.fetch(request).await {
            Ok(response) => {
                if self.should_store(request, &response) {
                    self.store_best_effort(key, &response).await;
                }
                Ok((response, Served::Network))
            }
            Err(e) if request.is_navigation() => match self.app_shell().await {
                Some(shell) => {
                    log::info!("Network unavailable for {key}, serving app shell: {e}");
                    Ok((shell.to_response(), Served::OfflineShell))
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    fn should_store(&self, request: &FetchRequest, response: &FetchResponse) -> bool {
        let complete = if response.is_opaque() {
            self.config.cache_opaque_responses
        } else {
            response.status == StatusCode::OK
        };
        complete && self.is_cacheable_media(request)
    }

    async fn store_best_effort(&self, key: CacheKey, response: &FetchResponse) {
        let entry = match CacheEntry::from_response(key, response) {
            Ok(entry) => entry,
            Err(e) => {
                log::debug!("Not caching response: {e}");
                return;
            }
        };
        let key = entry.key.clone();
        match self.generation.put(entry).await {
            Ok(()) => log::info!("Cached {key} in {}", self.generation.id()),
            Err(e) => log::warn!("Failed to cache {key}: {e}"),
        }
    }

    /// Store read failures are treated as misses.
    async fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        match self.generation.get(key).await {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Cache read for {key} failed, treating as miss: {e}");
                None
            }
        }
    }

    async fn app_shell(&self) -> Option<CacheEntry> {
        let candidates = [self.config.app_shell.as_str(), "./"];
        for candidate in candidates {
            match CacheKey::resolve(candidate, &self.origin) {
                Ok(key) => {
                    if let Some(entry) = self.lookup(&key).await {
                        return Some(entry);
                    }
                }
                Err(e) => log::warn!("Invalid app shell {candidate:?}: {e}"),
            }
        }
        None
    }
}

impl std::fmt::Debug for FetchInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchInterceptor")
            .field("generation", &self.generation.id())
            .field("origin", &self.origin.as_str())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{Destination, ResponseKind};
    use crate::store::{CacheStore, MemoryStore};
    use crate::testing::MockNetwork;
    use reqwest::header;

    const ORIGIN: &str = "https://hymns.example/";

    struct Fixture {
        store: Arc<dyn CacheStore>,
        network: Arc<MockNetwork>,
        interceptor: FetchInterceptor,
    }

    async fn fixture(config: CacheConfig) -> Fixture {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let network = Arc::new(MockNetwork::new());
        let generation = Generation::open(Arc::clone(&store), "v1").await.unwrap();
        let interceptor = FetchInterceptor::new(
            generation,
            Arc::clone(&network) as Arc<dyn Network>,
            Arc::new(config.with_origin(ORIGIN)),
        )
        .unwrap();
        Fixture {
            store,
            network,
            interceptor,
        }
    }

    fn url(path: &str) -> Url {
        Url::parse(ORIGIN).unwrap().join(path).unwrap()
    }

    fn key(path: &str) -> CacheKey {
        CacheKey::resolve(path, &Url::parse(ORIGIN).unwrap()).unwrap()
    }

    async fn seed(f: &Fixture, path: &str, body: Vec<u8>, content_type: &str) {
        f.store
            .put("v1", CacheEntry::new(key(path), body, Some(content_type)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cache_hit_skips_network() {
        let f = fixture(CacheConfig::default()).await;
        seed(&f, "/index.html", b"<html>".to_vec(), "text/html").await;

        let (resp, served) = f
            .interceptor
            .handle_with_source(&FetchRequest::get(url("./index.html")))
            .await
            .unwrap();
        assert_eq!(served, Served::CacheHit);
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(&resp.body[..], b"<html>");
        assert_eq!(f.network.calls(), 0);
    }

    #[tokio::test]
    async fn range_request_sliced_from_cache() {
        let f = fixture(CacheConfig::default()).await;
        seed(&f, "/song.mp3", vec![9u8; 5000], "audio/mpeg").await;

        let req = FetchRequest::get(url("/song.mp3")).with_range("bytes=1000-1999");
        let (resp, served) = f.interceptor.handle_with_source(&req).await.unwrap();
        assert_eq!(served, Served::RangeSlice);
        assert_eq!(resp.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.header(&header::CONTENT_RANGE), Some("bytes 1000-1999/5000"));
        assert_eq!(resp.header(&header::CONTENT_LENGTH), Some("1000"));
        assert_eq!(f.network.calls(), 0);
    }

    #[tokio::test]
    async fn uncached_range_passes_through_and_is_not_stored() {
        let f = fixture(CacheConfig::default()).await;
        f.network.serve(
            "/song.mp3",
            FetchResponse::new(StatusCode::PARTIAL_CONTENT, vec![1u8; 10])
                .with_header(header::CONTENT_RANGE, "bytes 0-9/5000"),
        );

        let req = FetchRequest::get(url("/song.mp3"))
            .with_destination(Destination::Audio)
            .with_range("bytes=0-9");
        let (resp, served) = f.interceptor.handle_with_source(&req).await.unwrap();
        assert_eq!(served, Served::RangeNetwork);
        assert_eq!(resp.status, StatusCode::PARTIAL_CONTENT);
        assert!(f.store.get("v1", &key("/song.mp3")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn partial_network_response_never_stored() {
        let f = fixture(CacheConfig::default()).await;
        f.network.serve(
            "/song.mp3",
            FetchResponse::new(StatusCode::PARTIAL_CONTENT, vec![1u8; 10]),
        );

        let req = FetchRequest::get(url("/song.mp3")).with_destination(Destination::Audio);
        let resp = f.interceptor.handle(&req).await.unwrap();
        assert_eq!(resp.status, StatusCode::PARTIAL_CONTENT);
        assert!(f.store.get("v1", &key("/song.mp3")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn media_fetched_from_network_is_cached() {
        let f = fixture(CacheConfig::default()).await;
        f.network
            .serve("/hymns/a.mp3", FetchResponse::ok(vec![3u8; 64], "audio/mpeg"));

        let req = FetchRequest::get(url("/hymns/a.mp3"));
        let (resp, served) = f.interceptor.handle_with_source(&req).await.unwrap();
        assert_eq!(served, Served::Network);
        assert_eq!(resp.body.len(), 64);

        let stored = f.store.get("v1", &key("/hymns/a.mp3")).await.unwrap().unwrap();
        assert_eq!(stored.body.len(), 64);

        // Second request is a hit.
        let (_, served) = f.interceptor.handle_with_source(&req).await.unwrap();
        assert_eq!(served, Served::CacheHit);
        assert_eq!(f.network.calls(), 1);
    }

    #[tokio::test]
    async fn audio_destination_is_cached_without_extension() {
        let f = fixture(CacheConfig::default()).await;
        f.network
            .serve("/stream/42", FetchResponse::ok(vec![1u8; 8], "audio/ogg"));
        let req = FetchRequest::get(url("/stream/42")).with_destination(Destination::Audio);
        f.interceptor.handle(&req).await.unwrap();
        assert!(f.store.get("v1", &key("/stream/42")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn non_media_is_not_cached() {
        let f = fixture(CacheConfig::default()).await;
        f.network.serve("/app.js", FetchResponse::ok("js", "text/javascript"));
        f.interceptor
            .handle(&FetchRequest::get(url("/app.js")))
            .await
            .unwrap();
        assert!(f.store.get("v1", &key("/app.js")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn error_status_is_returned_but_not_cached() {
        let f = fixture(CacheConfig::default()).await;
        let resp = f
            .interceptor
            .handle(&FetchRequest::get(url("/missing.mp3")))
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::NOT_FOUND);
        assert!(f.store.get("v1", &key("/missing.mp3")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn opaque_responses_cached_only_when_accepted() {
        let opaque =
            FetchResponse::new(StatusCode::OK, vec![5u8; 4]).with_kind(ResponseKind::Opaque);

        let f = fixture(CacheConfig::default()).await;
        f.network.serve("/x.mp3", opaque.clone());
        f.interceptor.handle(&FetchRequest::get(url("/x.mp3"))).await.unwrap();
        assert!(f.store.get("v1", &key("/x.mp3")).await.unwrap().is_none());

        let f = fixture(CacheConfig::default().with_cache_opaque_responses(true)).await;
        f.network.serve("/x.mp3", opaque);
        f.interceptor.handle(&FetchRequest::get(url("/x.mp3"))).await.unwrap();
        assert!(f.store.get("v1", &key("/x.mp3")).await.unwrap().unwrap().opaque);
    }

    #[tokio::test]
    async fn storage_failure_does_not_affect_response() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::with_quota(8));
        let network = Arc::new(MockNetwork::new());
        network.serve("/big.mp3", FetchResponse::ok(vec![0u8; 64], "audio/mpeg"));
        let generation = Generation::open(Arc::clone(&store), "v1").await.unwrap();
        let interceptor = FetchInterceptor::new(
            generation,
            Arc::clone(&network) as Arc<dyn Network>,
            Arc::new(CacheConfig::default().with_origin(ORIGIN)),
        )
        .unwrap();

        let resp = interceptor
            .handle(&FetchRequest::get(url("/big.mp3")))
            .await
            .unwrap();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body.len(), 64);
        assert!(store.get("v1", &key("/big.mp3")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn offline_navigation_falls_back_to_shell() {
        let f = fixture(CacheConfig::default()).await;
        seed(&f, "/index.html", b"<shell>".to_vec(), "text/html").await;
        f.network.set_offline(true);

        let req = FetchRequest::get(url("/songs/list")).with_destination(Destination::Document);
        let (resp, served) = f.interceptor.handle_with_source(&req).await.unwrap();
        assert_eq!(served, Served::OfflineShell);
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(&resp.body[..], b"<shell>");
    }

    #[tokio::test]
    async fn shell_fallback_stays_under_origin_path() {
        let origin = Url::parse("https://host.example/index/hymns/").unwrap();
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let network = Arc::new(MockNetwork::new());
        network.set_offline(true);
        let generation = Generation::open(Arc::clone(&store), "v1").await.unwrap();
        let config = CacheConfig::default()
            .with_origin(origin.as_str())
            .with_app_shell("./missing.html");
        let interceptor = FetchInterceptor::new(
            generation.clone(),
            network as Arc<dyn Network>,
            Arc::new(config),
        )
        .unwrap();
        let home = CacheKey::resolve("./", &origin).unwrap();
        assert_eq!(home.as_str(), "/index/hymns/");
        generation
            .put(CacheEntry::new(home, "<home>", Some("text/html")))
            .await
            .unwrap();

        let req = FetchRequest::get(origin.join("songs/1").unwrap())
            .with_destination(Destination::Document);
        let (resp, served) = interceptor.handle_with_source(&req).await.unwrap();
        assert_eq!(served, Served::OfflineShell);
        assert_eq!(&resp.body[..], b"<home>");
    }

    #[tokio::test]
    async fn offline_non_document_propagates_error() {
        let f = fixture(CacheConfig::default()).await;
        seed(&f, "/index.html", b"<shell>".to_vec(), "text/html").await;
        f.network.set_offline(true);

        let err = f
            .interceptor
            .handle(&FetchRequest::get(url("/never.mp3")))
            .await
            .unwrap_err();
        assert!(err.is_network());
    }

    #[tokio::test]
    async fn offline_navigation_without_shell_propagates_error() {
        let f = fixture(CacheConfig::default()).await;
        f.network.set_offline(true);
        let req = FetchRequest::get(url("/")).with_destination(Destination::Document);
        assert!(f.interceptor.handle(&req).await.is_err());
    }

    #[tokio::test]
    async fn non_get_bypasses_cache() {
        let f = fixture(CacheConfig::default()).await;
        seed(&f, "/a.mp3", vec![1u8; 4], "audio/mpeg").await;
        let req = FetchRequest::get(url("/a.mp3")).with_method(Method::POST);
        let (resp, served) = f.interceptor.handle_with_source(&req).await.unwrap();
        assert_eq!(served, Served::Network);
        assert_eq!(resp.status, StatusCode::NOT_FOUND);
    }
}
