//! Worker lifecycle: install, activate and event dispatch.
//!
//! A [`ServiceWorker`] owns one cache generation. `install` pre-fetches the
//! core assets into it, `activate` evicts every other generation, and from
//! then on fetch and message events are served by the interceptor and the
//! bulk downloader. Events can be driven directly or through a
//! [`WorkerHandle`], whose dispatcher spawns one task per fetch or message.

use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use reqwest::{StatusCode, Url};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clients::{ClientId, Clients};
use crate::config::CacheConfig;
use crate::downloader::BulkDownloader;
use crate::entry::CacheEntry;
use crate::error::{Error, Result};
use crate::fetch::{FetchRequest, FetchResponse, Network};
use crate::interceptor::FetchInterceptor;
use crate::key::{self, CacheKey};
use crate::message::Message;
use crate::report::JobReport;
use crate::store::{CacheStore, Generation};

/// Capacity of the event queue behind a [`WorkerHandle`].
const EVENT_QUEUE: usize = 64;

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Created, core assets not yet stored.
    Installing,
    /// Core assets stored, older generations still present.
    Installed,
    /// Evicting older generations.
    Activating,
    /// Serving fetch and message events from the cache.
    Active,
    /// Install failed. Terminal.
    Redundant,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

/// Components that exist once install has succeeded.
struct Installed {
    generation: Generation,
    interceptor: FetchInterceptor,
    downloader: BulkDownloader,
}

/// The cache worker.
pub struct ServiceWorker {
    config: Arc<CacheConfig>,
    store: Arc<dyn CacheStore>,
    network: Arc<dyn Network>,
    clients: Clients,
    origin: Url,
    state: RwLock<WorkerState>,
    installed: OnceLock<Installed>,
    shutdown: CancellationToken,
}

impl ServiceWorker {
    /// Creates a worker for `config.generation_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn CacheStore>,
        network: Arc<dyn Network>,
    ) -> Result<Self> {
        config.validate()?;
        let origin = config.origin_url()?;
        Ok(Self {
            config: Arc::new(config),
            store,
            network,
            clients: Clients::new(),
            origin,
            state: RwLock::new(WorkerState::Installing),
            installed: OnceLock::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.state
            .read()
            .map_or(WorkerState::Redundant, |state| *state)
    }

    /// Generation this worker owns.
    #[must_use]
    pub fn generation_id(&self) -> &str {
        &self.config.generation_id
    }

    /// The worker's configuration.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Connected page contexts.
    #[must_use]
    pub const fn clients(&self) -> &Clients {
        &self.clients
    }

    fn set_state(&self, next: WorkerState) {
        if let Ok(mut state) = self.state.write() {
            log::debug!("Worker {}: {} -> {next}", self.generation_id(), *state);
            *state = next;
        }
    }

    /// Moves from `from` to `to`, failing if the worker is elsewhere.
    fn transition(&self, from: WorkerState, to: WorkerState) -> Result<()> {
        let Ok(mut state) = self.state.write() else {
            return Err(Error::InvalidState("worker state lock poisoned".to_string()));
        };
        if *state != from {
            return Err(Error::InvalidState(format!(
                "cannot move to {to} while {}",
                *state
            )));
        }
        log::debug!("Worker {}: {from} -> {to}", self.config.generation_id);
        *state = to;
        Ok(())
    }

    /// Opens the generation and stores every core asset.
    ///
    /// On failure the worker becomes [`WorkerState::Redundant`] and a
    /// generation created by this install is deleted, so a previous
    /// generation keeps serving.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CoreAssetInstall`] if any core asset cannot be
    /// fetched in full or stored, and [`Error::InvalidState`] if the worker
    /// is not installing.
    pub async fn install(&self) -> Result<()> {
        if self.state() != WorkerState::Installing {
            return Err(Error::InvalidState(format!(
                "cannot install while {}",
                self.state()
            )));
        }

        let id = self.generation_id();
        let existed = match self.store.generations().await {
            Ok(ids) => ids.iter().any(|g| g == id),
            Err(e) => {
                log::warn!("Could not list generations before install: {e}");
                true
            }
        };
        log::info!(
            "Installing generation {id} with {} core asset(s)",
            self.config.core_assets.len()
        );

        match self.install_core_assets().await {
            Ok(generation) => {
                self.attach(generation)?;
                self.transition(WorkerState::Installing, WorkerState::Installed)?;
                log::info!("Installed generation {id}");
                Ok(())
            }
            Err(e) => {
                log::error!("Install of {id} failed: {e}");
                self.set_state(WorkerState::Redundant);
                if !existed {
                    match self.store.delete_generation(id).await {
                        Ok(_) => log::info!("Removed partial generation {id}"),
                        Err(del) => log::warn!("Failed to remove partial generation {id}: {del}"),
                    }
                }
                Err(e)
            }
        }
    }

    /// Builds the interceptor and downloader over `generation`.
    fn attach(&self, generation: Generation) -> Result<()> {
        let interceptor = FetchInterceptor::new(
            generation.clone(),
            Arc::clone(&self.network),
            Arc::clone(&self.config),
        )?;
        let downloader =
            BulkDownloader::new(generation.clone(), Arc::clone(&self.network), &self.config)?;
        self.installed
            .set(Installed {
                generation,
                interceptor,
                downloader,
            })
            .map_err(|_| Error::InvalidState("worker already installed".to_string()))
    }

    async fn install_core_assets(&self) -> Result<Generation> {
        let generation = Generation::open(Arc::clone(&self.store), self.generation_id()).await?;
        try_join_all(
            self.config
                .core_assets
                .iter()
                .map(|asset| self.install_asset(&generation, asset)),
        )
        .await?;
        Ok(generation)
    }

    async fn install_asset(&self, generation: &Generation, asset: &str) -> Result<()> {
        let fail = |reason: String| Error::CoreAssetInstall {
            key: asset.to_string(),
            reason,
        };

        let url = key::resolve_url(asset, &self.origin).map_err(|e| fail(e.to_string()))?;
        let key = CacheKey::canonical(&url, &self.origin);
        let response = self
            .network
            .fetch(&FetchRequest::get(url))
            .await
            .map_err(|e| fail(e.to_string()))?;
        if response.status != StatusCode::OK || response.is_opaque() {
            return Err(fail(format!("status {}", response.status.as_u16())));
        }

        let entry = CacheEntry::from_response(key, &response).map_err(|e| fail(e.to_string()))?;
        log::debug!("Core asset {} ({} bytes)", entry.key, entry.len());
        generation.put(entry).await.map_err(|e| fail(e.to_string()))
    }

    /// Evicts every generation but this one and starts serving.
    ///
    /// Eviction failures are logged; stale generations are never read.
    /// Returns the evicted generation ids.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the worker is installed.
    pub async fn activate(&self) -> Result<Vec<String>> {
        self.transition(WorkerState::Installed, WorkerState::Activating)?;

        let evicted = match self.store.evict_all_except(self.generation_id()).await {
            Ok(evicted) => evicted,
            Err(e) => {
                log::warn!("Eviction of stale generations failed: {e}");
                Vec::new()
            }
        };
        for id in &evicted {
            log::info!("Evicted generation {id}");
        }

        self.transition(WorkerState::Activating, WorkerState::Active)?;
        log::info!("Generation {} active", self.generation_id());
        Ok(evicted)
    }

    /// Serves a generation that is already stored, without fetching core
    /// assets or evicting anything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the worker is installing, and
    /// [`Error::Storage`] if the generation is not in the store.
    pub async fn resume(&self) -> Result<()> {
        if self.state() != WorkerState::Installing {
            return Err(Error::InvalidState(format!(
                "cannot resume while {}",
                self.state()
            )));
        }
        let id = self.generation_id();
        if !self.store.generations().await?.iter().any(|g| g == id) {
            return Err(Error::Storage(format!("generation {id} does not exist")));
        }
        self.attach(Generation::open(Arc::clone(&self.store), id).await?)?;
        self.transition(WorkerState::Installing, WorkerState::Active)?;
        log::info!("Resumed generation {id}");
        Ok(())
    }

    /// Installs and activates this worker. If install fails, the newest
    /// generation left in the store keeps serving; with none left, the
    /// returned worker passes every request to the network.
    ///
    /// # Errors
    ///
    /// Returns an error only if activation of a successful install fails.
    pub async fn start(self) -> Result<Self> {
        let installed = self.install().await;
        let install_error = match installed {
            Ok(()) => {
                let evicted = self.activate().await?;
                log::info!("Activated {}, evicted {evicted:?}", self.generation_id());
                return Ok(self);
            }
            Err(e) => e,
        };

        let fallback = self.fallback().await;
        match fallback {
            Ok(Some(previous)) => {
                log::warn!(
                    "Install failed ({install_error}), still serving generation {}",
                    previous.generation_id()
                );
                Ok(previous)
            }
            Ok(None) => {
                log::error!("Install failed, serving uncached: {install_error}");
                Ok(self)
            }
            Err(e) => {
                log::error!("Install failed ({install_error}) and resume failed: {e}");
                Ok(self)
            }
        }
    }

    /// Builds a worker over the newest other generation in the store.
    async fn fallback(&self) -> Result<Option<Self>> {
        let Some(previous) = newest_generation(self.store.as_ref(), self.generation_id()).await?
        else {
            return Ok(None);
        };
        let config = (*self.config).clone().with_generation_id(previous);
        let worker = Self::new(config, Arc::clone(&self.store), Arc::clone(&self.network))?;
        worker.resume().await?;
        Ok(Some(worker))
    }

    fn active(&self) -> Option<&Installed> {
        if self.state() == WorkerState::Active {
            self.installed.get()
        } else {
            None
        }
    }

    /// Handles a fetch event. Before activation requests go straight to
    /// the network.
    ///
    /// # Errors
    ///
    /// Propagates network errors that have no cached fallback.
    pub async fn handle_fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        match self.active() {
            Some(installed) => installed.interceptor.handle(request).await,
            None => {
                log::debug!("Worker not active, passing {} to network", request.url);
                self.network.fetch(request).await
            }
        }
    }

    /// Handles a message from `client`.
    ///
    /// `CACHE_SONGS` runs a bulk job and returns its report; notification
    /// types sent by a page are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotActive`] before activation.
    pub async fn handle_message(
        &self,
        client: ClientId,
        message: Message,
    ) -> Result<Option<JobReport>> {
        let installed = self.active().ok_or(Error::NotActive)?;
        match message {
            Message::CacheSongs { songs } => {
                log::info!("Client {client} requested {} song(s)", songs.len());
                let report = installed
                    .downloader
                    .run_for_client(
                        &songs,
                        &self.clients,
                        client,
                        Some(self.shutdown.child_token()),
                    )
                    .await;
                Ok(Some(report))
            }
            Message::CacheProgress { .. } | Message::CacheComplete { .. } => {
                log::debug!("Ignoring notification sent by client {client}");
                Ok(None)
            }
        }
    }

    /// Decodes and handles a JSON message from `client`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMessage`] for undecodable text, otherwise as
    /// [`handle_message`](Self::handle_message).
    pub async fn handle_message_text(
        &self,
        client: ClientId,
        text: &str,
    ) -> Result<Option<JobReport>> {
        let message = Message::decode(text)?;
        self.handle_message(client, message).await
    }

    /// Cancels running bulk jobs.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// The active generation, if any.
    #[must_use]
    pub fn generation(&self) -> Option<&Generation> {
        self.installed.get().map(|installed| &installed.generation)
    }
}

impl fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("generation", &self.generation_id())
            .field("state", &self.state())
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}

/// The generation other than `excluding` holding the most recently
/// stored entry. Empty generations rank last.
async fn newest_generation(store: &dyn CacheStore, excluding: &str) -> Result<Option<String>> {
    let mut newest: Option<(Option<DateTime<Utc>>, String)> = None;
    for id in store.generations().await? {
        if id == excluding {
            continue;
        }
        let stored_at = store.list(&id).await?.iter().map(|e| e.stored_at).max();
        if newest.as_ref().is_none_or(|(at, _)| stored_at >= *at) {
            newest = Some((stored_at, id));
        }
    }
    Ok(newest.map(|(_, id)| id))
}

/// An event delivered to the worker.
#[derive(Debug)]
pub enum WorkerEvent {
    /// Run install.
    Install {
        /// Receives the install result.
        reply: oneshot::Sender<Result<()>>,
    },
    /// Run activation.
    Activate {
        /// Receives the evicted generation ids.
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
    /// Intercept a request.
    Fetch {
        /// The request.
        request: FetchRequest,
        /// Receives the response.
        reply: oneshot::Sender<Result<FetchResponse>>,
    },
    /// A message posted by a page.
    Message {
        /// Sender.
        client: ClientId,
        /// Decoded message.
        message: Message,
    },
}

/// Runs the event loop until every sender is dropped.
///
/// Install and activate run in order; each fetch and message event gets
/// its own task, so a long bulk job never blocks fetches.
pub async fn dispatch(worker: Arc<ServiceWorker>, mut events: mpsc::Receiver<WorkerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Install { reply } => {
                let _ = reply.send(worker.install().await);
            }
            WorkerEvent::Activate { reply } => {
                let _ = reply.send(worker.activate().await);
            }
            WorkerEvent::Fetch { request, reply } => {
                let worker = Arc::clone(&worker);
                tokio::spawn(async move {
                    let _ = reply.send(worker.handle_fetch(&request).await);
                });
            }
            WorkerEvent::Message { client, message } => {
                let worker = Arc::clone(&worker);
                tokio::spawn(async move {
                    if let Err(e) = worker.handle_message(client, message).await {
                        log::warn!("Message from client {client} rejected: {e}");
                    }
                });
            }
        }
    }
    log::debug!("Worker {} event loop stopped", worker.generation_id());
}

/// Sends events to a running dispatcher.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    events: mpsc::Sender<WorkerEvent>,
    worker: Arc<ServiceWorker>,
}

impl WorkerHandle {
    /// Spawns the dispatcher for `worker`.
    #[must_use]
    pub fn spawn(worker: Arc<ServiceWorker>) -> (Self, JoinHandle<()>) {
        let (events, rx) = mpsc::channel(EVENT_QUEUE);
        let task = tokio::spawn(dispatch(Arc::clone(&worker), rx));
        (Self { events, worker }, task)
    }

    /// The worker behind this handle.
    #[must_use]
    pub const fn worker(&self) -> &Arc<ServiceWorker> {
        &self.worker
    }

    async fn send<T>(&self, event: WorkerEvent, reply: oneshot::Receiver<Result<T>>) -> Result<T> {
        self.events
            .send(event)
            .await
            .map_err(|_| Error::InvalidState("worker event loop stopped".to_string()))?;
        reply
            .await
            .map_err(|_| Error::InvalidState("worker dropped the event".to_string()))?
    }

    /// Installs through the event loop.
    ///
    /// # Errors
    ///
    /// As [`ServiceWorker::install`].
    pub async fn install(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerEvent::Install { reply }, rx).await
    }

    /// Activates through the event loop.
    ///
    /// # Errors
    ///
    /// As [`ServiceWorker::activate`].
    pub async fn activate(&self) -> Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerEvent::Activate { reply }, rx).await
    }

    /// Delivers a fetch event and waits for its response.
    ///
    /// # Errors
    ///
    /// As [`ServiceWorker::handle_fetch`].
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerEvent::Fetch { request, reply }, rx).await
    }

    /// Posts a message from `client` without waiting for it to be handled.
    ///
    /// # Errors
    ///
    /// Returns an error if the event loop has stopped.
    pub async fn post_message(&self, client: ClientId, message: Message) -> Result<()> {
        self.events
            .send(WorkerEvent::Message { client, message })
            .await
            .map_err(|_| Error::InvalidState("worker event loop stopped".to_string()))
    }
}
