//! Durable cache store split into named generations.
//!
//! A generation is a directory named after its id; each entry is one file
//! named by the SHA-256 of its key. Writes go to a uniquely named `.part`
//! file that is renamed over the final path, so a concurrent reader sees
//! either the previous entry or the new one in full.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::AsyncBufReadExt;

use crate::config::validate_generation_id;
use crate::entry::{CacheEntry, EntryInfo};
use crate::error::{Error, Result};
use crate::key::CacheKey;

const ENTRY_EXTENSION: &str = "entry";

/// Abstraction over the durable key→response map.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Creates a generation if it does not exist yet.
    async fn create_generation(&self, generation: &str) -> Result<()>;

    /// Lists every generation id currently stored.
    async fn generations(&self) -> Result<Vec<String>>;

    /// Deletes a generation. Returns false if it did not exist.
    async fn delete_generation(&self, generation: &str) -> Result<bool>;

    /// Looks up an entry.
    async fn get(&self, generation: &str, key: &CacheKey) -> Result<Option<CacheEntry>>;

    /// Stores an entry, replacing any previous entry for the same key.
    async fn put(&self, generation: &str, entry: CacheEntry) -> Result<()>;

    /// Lists metadata of every entry in a generation.
    async fn list(&self, generation: &str) -> Result<Vec<EntryInfo>>;

    /// Deletes every generation except `current`. Returns the evicted ids.
    async fn evict_all_except(&self, current: &str) -> Result<Vec<String>> {
        let mut evicted = Vec::new();
        for generation in self.generations().await? {
            if generation != current && self.delete_generation(&generation).await? {
                evicted.push(generation);
            }
        }
        Ok(evicted)
    }
}

/// Handle to one open generation.
#[derive(Clone)]
pub struct Generation {
    store: Arc<dyn CacheStore>,
    id: String,
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation").field("id", &self.id).finish()
    }
}

impl Generation {
    /// Opens (creating if absent) the generation `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the generation cannot be created.
    pub async fn open(store: Arc<dyn CacheStore>, id: &str) -> Result<Self> {
        store.create_generation(id).await?;
        Ok(Self {
            store,
            id: id.to_string(),
        })
    }

    /// Returns the generation id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Looks up an entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry exists but cannot be read.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        self.store.get(&self.id, key).await
    }

    /// Stores an entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be persisted.
    pub async fn put(&self, entry: CacheEntry) -> Result<()> {
        self.store.put(&self.id, entry).await
    }

    /// Lists entry metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the generation cannot be read.
    pub async fn list(&self) -> Result<Vec<EntryInfo>> {
        self.store.list(&self.id).await
    }
}

/// File-backed store rooted at a directory.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Creates a store rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn generation_dir(&self, generation: &str) -> Result<PathBuf> {
        validate_generation_id(generation)?;
        Ok(self.root.join(generation))
    }

    fn entry_path(&self, generation: &str, key: &CacheKey) -> Result<PathBuf> {
        let digest = Sha256::digest(key.as_str().as_bytes());
        Ok(self
            .generation_dir(generation)?
            .join(format!("{digest:x}.{ENTRY_EXTENSION}")))
    }
}

#[async_trait]
impl CacheStore for DiskStore {
    async fn create_generation(&self, generation: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.generation_dir(generation)?).await?;
        Ok(())
    }

    async fn generations(&self) -> Result<Vec<String>> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            if item.file_type().await?.is_dir()
                && let Some(name) = item.file_name().to_str()
                && validate_generation_id(name).is_ok()
            {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn delete_generation(&self, generation: &str) -> Result<bool> {
        match tokio::fs::remove_dir_all(self.generation_dir(generation)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, generation: &str, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(generation, key)?;
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry = CacheEntry::decode(Bytes::from(data))?;
        // Guards against a digest collision handing back a different resource.
        Ok((entry.key == *key).then_some(entry))
    }

    async fn put(&self, generation: &str, entry: CacheEntry) -> Result<()> {
        let dir = self.generation_dir(generation)?;
        if !tokio::fs::try_exists(&dir).await? {
            return Err(Error::Storage(format!(
                "generation {generation} does not exist"
            )));
        }
        let path = self.entry_path(generation, &entry.key)?;
        let part = path.with_extension(format!("{}.part", uuid::Uuid::new_v4()));

        let data = entry.encode()?;
        if let Err(e) = tokio::fs::write(&part, &data).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&part, &path).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn list(&self, generation: &str) -> Result<Vec<EntryInfo>> {
        let mut dir = match tokio::fs::read_dir(self.generation_dir(generation)?).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut infos = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().is_none_or(|ext| ext != ENTRY_EXTENSION) {
                continue;
            }
            let file = tokio::fs::File::open(&path).await?;
            let mut line = Vec::new();
            tokio::io::BufReader::new(file)
                .read_until(b'\n', &mut line)
                .await?;
            match EntryInfo::parse_header(&line) {
                Ok(info) => infos.push(info),
                Err(e) => log::warn!("Skipping unreadable entry {}: {e}", path.display()),
            }
        }
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(infos)
    }
}

type Generations = HashMap<String, HashMap<CacheKey, CacheEntry>>;

/// In-process store, optionally with a byte quota per generation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    generations: RwLock<Generations>,
    quota: Option<u64>,
}

impl MemoryStore {
    /// Creates an empty, unbounded store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that rejects puts once a generation would exceed `bytes`.
    #[must_use]
    pub fn with_quota(bytes: u64) -> Self {
        Self {
            generations: RwLock::default(),
            quota: Some(bytes),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Generations>> {
        self.generations
            .read()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Generations>> {
        self.generations
            .write()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn create_generation(&self, generation: &str) -> Result<()> {
        self.write()?.entry(generation.to_string()).or_default();
        Ok(())
    }

    async fn generations(&self) -> Result<Vec<String>> {
        let mut ids: Vec<_> = self.read()?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete_generation(&self, generation: &str) -> Result<bool> {
        Ok(self.write()?.remove(generation).is_some())
    }

    async fn get(&self, generation: &str, key: &CacheKey) -> Result<Option<CacheEntry>> {
        Ok(self
            .read()?
            .get(generation)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn put(&self, generation: &str, entry: CacheEntry) -> Result<()> {
        let mut generations = self.write()?;
        let entries = generations
            .get_mut(generation)
            .ok_or_else(|| Error::Storage(format!("generation {generation} does not exist")))?;
        if let Some(quota) = self.quota {
            let used: u64 = entries
                .values()
                .filter(|e| e.key != entry.key)
                .map(CacheEntry::len)
                .sum();
            if used + entry.len() > quota {
                return Err(Error::Storage(format!(
                    "quota exceeded storing {} ({} bytes, {used}/{quota} used)",
                    entry.key,
                    entry.len()
                )));
            }
        }
        entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn list(&self, generation: &str) -> Result<Vec<EntryInfo>> {
        let mut infos: Vec<_> = self
            .read()?
            .get(generation)
            .map(|entries| entries.values().map(CacheEntry::info).collect())
            .unwrap_or_default();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(infos)
    }
}
