//! offline-media-cache - an offline-first cache worker for media sites.
//!
//! The worker pre-fetches a site's core assets into a named cache
//! generation, serves later requests cache-first (slicing HTTP Range
//! requests out of cached bodies so players can seek offline), falls back
//! to a cached app shell when navigation fails offline, and downloads
//! explicit song lists on request from a page.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use offline_media_cache::{
//!     CacheConfig, DiskStore, FetchRequest, HttpNetwork, ServiceWorker,
//! };
//!
//! # async fn example() -> offline_media_cache::Result<()> {
//! let config = CacheConfig::default()
//!     .with_origin("https://hymns.example/")
//!     .with_generation_id("music-cache-v3");
//! let store = Arc::new(DiskStore::new(config.cache_dir.clone()));
//! let worker = ServiceWorker::new(config, store, Arc::new(HttpNetwork::with_defaults()?))?;
//!
//! // Store core assets, then drop every older generation.
//! worker.install().await?;
//! worker.activate().await?;
//!
//! let origin = worker.config().origin_url()?;
//! let url = offline_media_cache::key::resolve_url("/hymns/amazing-grace.mp3", &origin)?;
//! let request = FetchRequest::get(url).with_range("bytes=0-65535");
//! let response = worker.handle_fetch(&request).await?;
//! println!("{} ({} bytes)", response.status, response.body.len());
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod clients;
pub mod config;
pub mod downloader;
pub mod entry;
pub mod error;
pub mod fetch;
pub mod format;
pub mod interceptor;
pub mod key;
pub mod lifecycle;
pub mod message;
pub mod range;
pub mod report;
pub mod store;
pub mod testing;

#[cfg(feature = "cli")]
pub mod cli;
#[cfg(feature = "server")]
pub mod server;

// Re-export main types for convenience
pub use clients::{ClientId, Clients};
pub use config::CacheConfig;
pub use downloader::{BulkDownloader, ClientProgress, JobProgress, NoProgress};
pub use entry::{CacheEntry, EntryInfo};
pub use error::{Error, Result};
pub use fetch::{Destination, FetchRequest, FetchResponse, HttpNetwork, Network, ResponseKind};
pub use format::{format_bytes, format_duration};
pub use interceptor::{FetchInterceptor, Served};
pub use key::CacheKey;
pub use lifecycle::{ServiceWorker, WorkerEvent, WorkerHandle, WorkerState};
pub use message::{Message, Song};
pub use report::{ItemOutcome, ItemResult, JobReport, SkipReason};
pub use store::{CacheStore, DiskStore, Generation, MemoryStore};
