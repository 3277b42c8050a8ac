//! Configuration types for the cache worker.

use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Media extensions cached opportunistically when fetched through the worker.
pub const DEFAULT_MEDIA_EXTENSIONS: &[&str] =
    &["mp3", "m4a", "aac", "ogg", "oga", "opus", "wav", "flac", "mp4", "m4v", "mkv", "webm"];

/// Configuration for one cache worker instance.
///
/// Every deploy gets its own `generation_id`; activating a worker evicts
/// every generation with a different id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Name of the cache generation owned by this worker.
    pub generation_id: String,
    /// Origin the worker serves; same-origin URLs are keyed by path.
    pub origin: String,
    /// Assets fetched at install time. Any failure aborts the install.
    pub core_assets: Vec<String>,
    /// Document served when a navigation request fails offline.
    pub app_shell: String,
    /// File extensions (without the dot, lowercase) treated as media.
    pub cacheable_media_extensions: Vec<String>,
    /// Number of bulk-download items fetched concurrently.
    pub concurrent_downloads: usize,
    /// Whether opaque cross-origin responses may be stored.
    pub cache_opaque_responses: bool,
    /// Root directory of the durable cache store.
    pub cache_dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("offline-media-cache");

        Self {
            generation_id: "music-cache-v2".to_string(),
            origin: "http://127.0.0.1:8000/".to_string(),
            core_assets: vec!["./".to_string(), "./index.html".to_string()],
            app_shell: "./index.html".to_string(),
            cacheable_media_extensions: DEFAULT_MEDIA_EXTENSIONS
                .iter()
                .map(ToString::to_string)
                .collect(),
            concurrent_downloads: 2,
            cache_opaque_responses: false,
            cache_dir,
        }
    }
}

impl CacheConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the generation id.
    #[must_use]
    pub fn with_generation_id(mut self, id: impl Into<String>) -> Self {
        self.generation_id = id.into();
        self
    }

    /// Sets the origin URL.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Sets the core asset list.
    #[must_use]
    pub fn with_core_assets<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.core_assets = assets.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the app-shell document.
    #[must_use]
    pub fn with_app_shell(mut self, shell: impl Into<String>) -> Self {
        self.app_shell = shell.into();
        self
    }

    /// Sets the cacheable media extensions.
    #[must_use]
    pub fn with_media_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cacheable_media_extensions = extensions
            .into_iter()
            .map(|e| e.into().trim_start_matches('.').to_ascii_lowercase())
            .collect();
        self
    }

    /// Sets the number of concurrent bulk downloads.
    #[must_use]
    pub const fn with_concurrent_downloads(mut self, concurrent: usize) -> Self {
        self.concurrent_downloads = concurrent;
        self
    }

    /// Sets whether opaque responses may be cached.
    #[must_use]
    pub const fn with_cache_opaque_responses(mut self, accept: bool) -> Self {
        self.cache_opaque_responses = accept;
        self
    }

    /// Sets the cache store directory.
    #[must_use]
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Parses the configured origin.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if the origin is not an absolute http(s) URL.
    pub fn origin_url(&self) -> Result<Url> {
        let url = Url::parse(&self.origin).map_err(|e| Error::InvalidUrl {
            url: self.origin.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidUrl {
                url: self.origin.clone(),
                reason: "origin must use http or https".to_string(),
            });
        }
        Ok(url)
    }

    /// Returns true if `path` ends in one of the cacheable media extensions.
    #[must_use]
    pub fn is_media_path(&self, path: &str) -> bool {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        let Some(name) = path.rsplit('/').next() else {
            return false;
        };
        name.rsplit_once('.').is_some_and(|(_, ext)| {
            self.cacheable_media_extensions
                .iter()
                .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(ext))
        })
    }

    /// Checks the configuration for values the worker cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        validate_generation_id(&self.generation_id)?;
        if self.concurrent_downloads == 0 {
            return Err(Error::Config(
                "concurrent_downloads must be at least 1".to_string(),
            ));
        }
        self.origin_url()
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(())
    }

    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&contents)?;
        let extensions = std::mem::take(&mut config.cacheable_media_extensions);
        let config = config.with_media_extensions(extensions);
        config.validate()?;
        Ok(config)
    }

    /// Saves the configuration atomically (write tmp + rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be serialized or written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, toml::to_string_pretty(self)?)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Default location of the configuration file.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("offline-media-cache")
            .join("config.toml")
    }

    /// Loads `path` if given, otherwise the default file if it exists,
    /// otherwise the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit or existing file cannot be loaded.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let default = Self::default_path();
        if default.is_file() {
            log::debug!("Loading configuration from {}", default.display());
            Self::load(&default)
        } else {
            Ok(Self::default())
        }
    }
}

/// Generation ids become directory names, so only a safe alphabet is allowed.
pub(crate) fn validate_generation_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "generation_id {id:?} must be non-empty and use only [A-Za-z0-9._-]"
        )))
    }
}
