//! Bulk fetch-and-store of explicit media lists.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::{StreamExt, stream};
use reqwest::{StatusCode, Url};
use tokio_util::sync::CancellationToken;

use crate::clients::{ClientId, Clients};
use crate::config::CacheConfig;
use crate::entry::CacheEntry;
use crate::error::{Error, Result};
use crate::fetch::{FetchRequest, Network};
use crate::key::{self, CacheKey};
use crate::message::{Message, Song};
use crate::report::{ItemOutcome, ItemResult, JobReport, JobReportBuilder, SkipReason};
use crate::store::Generation;

/// Trait for receiving bulk job progress.
///
/// All methods have default no-op implementations.
pub trait JobProgress: Send + Sync {
    /// Called once before any item is fetched.
    fn on_job_start(&self, _total: usize) {}

    /// Called when an item's fetch starts.
    fn on_item_start(&self, _song: &Song) {}

    /// Called each time an item resolves. `done` counts resolved items.
    fn on_item_done(&self, _result: &ItemResult, _done: usize, _total: usize) {}

    /// Called once with the final report.
    fn on_job_complete(&self, _report: &JobReport) {}
}

/// A null progress implementation that ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl JobProgress for NoProgress {}

/// Posts `CACHE_PROGRESS` to the client that submitted the job.
#[derive(Debug, Clone)]
pub struct ClientProgress {
    clients: Clients,
    client: ClientId,
}

impl ClientProgress {
    /// Creates a reporter for `client`.
    #[must_use]
    pub const fn new(clients: Clients, client: ClientId) -> Self {
        Self { clients, client }
    }
}

impl JobProgress for ClientProgress {
    fn on_item_done(&self, _result: &ItemResult, done: usize, total: usize) {
        if !self
            .clients
            .post(self.client, Message::CacheProgress { done, total })
        {
            log::debug!("Client {} went away, dropping progress", self.client);
        }
    }
}

/// What to do with one submitted item.
enum Planned {
    Fetch { url: Url },
    Resolved(ItemOutcome),
}

/// Downloads explicit song lists into the current generation.
pub struct BulkDownloader {
    generation: Generation,
    network: Arc<dyn Network>,
    origin: Url,
    concurrency: usize,
}

impl BulkDownloader {
    /// Creates a downloader storing into `generation`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured origin is invalid.
    pub fn new(
        generation: Generation,
        network: Arc<dyn Network>,
        config: &CacheConfig,
    ) -> Result<Self> {
        Ok(Self {
            generation,
            network,
            origin: config.origin_url()?,
            concurrency: config.concurrent_downloads.max(1),
        })
    }

    /// Maximum number of items fetched at once.
    #[must_use]
    pub const fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Runs a job for `client` and broadcasts `CACHE_COMPLETE` to every
    /// client when it finishes. A cancelled job sends no completion.
    pub async fn run_for_client(
        &self,
        songs: &[Song],
        clients: &Clients,
        client: ClientId,
        cancellation_token: Option<CancellationToken>,
    ) -> JobReport {
        let progress: Arc<dyn JobProgress> = Arc::new(ClientProgress::new(clients.clone(), client));
        let report = self.run(songs, &progress, cancellation_token).await;

        if report.cancelled {
            log::info!("Bulk job cancelled, not announcing completion");
        } else {
            let reached = clients.broadcast(&Message::CacheComplete {
                count: Some(report.stored()),
            });
            log::debug!("Completion broadcast to {reached} client(s)");
        }
        report
    }

    /// Fetches and stores every song, at most `concurrency` at a time.
    ///
    /// Failures are recorded per item and never abort the job. Items not
    /// started when the token fires are reported as cancelled.
    pub async fn run(
        &self,
        songs: &[Song],
        progress: &Arc<dyn JobProgress>,
        cancellation_token: Option<CancellationToken>,
    ) -> JobReport {
        let total = songs.len();
        let items: Vec<(String, String)> = songs
            .iter()
            .map(|s| (s.url.clone(), s.title.clone()))
            .collect();
        let mut builder = JobReportBuilder::new(total);

        progress.on_job_start(total);
        log::info!(
            "Bulk job: {total} item(s) into {} ({} at a time)",
            self.generation.id(),
            self.concurrency
        );

        let plan = self.plan(songs);
        let done = Arc::new(AtomicUsize::new(0));

        let results: Vec<_> = stream::iter(songs.iter().cloned().zip(plan).enumerate())
            .map(|(index, (song, planned))| {
                let done = Arc::clone(&done);
                let token = cancellation_token.clone();
                async move {
                    if token.as_ref().is_some_and(CancellationToken::is_cancelled) {
                        return (index, None);
                    }
                    let outcome = match planned {
                        Planned::Resolved(outcome) => outcome,
                        Planned::Fetch { url } => {
                            progress.on_item_start(&song);
                            match self.fetch_and_store(url, token.as_ref()).await {
                                Ok(bytes) => ItemOutcome::Stored { bytes },
                                Err(Error::Cancelled) => return (index, None),
                                Err(e) => {
                                    log::warn!("Failed to cache {}: {e}", song.url);
                                    ItemOutcome::Failed(e.to_string())
                                }
                            }
                        }
                    };
                    let result = ItemResult {
                        url: song.url,
                        title: song.title,
                        outcome,
                    };
                    let resolved = done.fetch_add(1, Ordering::SeqCst) + 1;
                    progress.on_item_done(&result, resolved, total);
                    (index, Some(result))
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (index, result) in results {
            if let Some(result) = result {
                builder.record(index, result);
            }
        }

        let cancelled = cancellation_token
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled);
        let report = builder.build(&items, cancelled);
        log::info!(
            "Bulk job finished: {} stored, {} failed, {} skipped",
            report.stored(),
            report.failed(),
            report.skipped()
        );
        progress.on_job_complete(&report);
        report
    }

    /// Resolves URLs and marks repeated keys as duplicates.
    fn plan(&self, songs: &[Song]) -> Vec<Planned> {
        let mut seen: HashSet<CacheKey> = HashSet::with_capacity(songs.len());
        songs
            .iter()
            .map(|song| match key::resolve_url(&song.url, &self.origin) {
                Ok(url) => {
                    if seen.insert(CacheKey::canonical(&url, &self.origin)) {
                        Planned::Fetch { url }
                    } else {
                        Planned::Resolved(ItemOutcome::Skipped(SkipReason::Duplicate))
                    }
                }
                Err(e) => Planned::Resolved(ItemOutcome::Failed(e.to_string())),
            })
            .collect()
    }

    /// Fetches `url` bypassing HTTP caches and stores the full body.
    /// Once the fetch completes the store runs to completion.
    async fn fetch_and_store(&self, url: Url, token: Option<&CancellationToken>) -> Result<u64> {
        let key = CacheKey::canonical(&url, &self.origin);
        let request = FetchRequest::get(url).no_cache();

        let response = if let Some(token) = token {
            tokio::select! {
                res = self.network.fetch(&request) => res?,
                () = token.cancelled() => return Err(Error::Cancelled),
            }
        } else {
            self.network.fetch(&request).await?
        };

        if response.status != StatusCode::OK || response.is_opaque() {
            return Err(Error::Network(format!(
                "{}: status {}",
                request.url,
                response.status.as_u16()
            )));
        }

        let entry = CacheEntry::from_response(key, &response)?;
        let bytes = entry.len();
        self.generation.put(entry).await?;
        Ok(bytes)
    }
}

impl std::fmt::Debug for BulkDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkDownloader")
            .field("generation", &self.generation.id())
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}
