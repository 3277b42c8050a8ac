//! Canonical cache keys.
//!
//! Same-origin requests are keyed by their origin-relative path and query,
//! cross-origin requests by their full URL. Fragments never take part in the
//! key. Every read and write goes through [`CacheKey::canonical`], so
//! `./index.html`, `/index.html` and `https://origin/index.html` all name
//! the same entry.

use std::fmt;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Canonical locator of a cached resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Computes the key of an absolute URL relative to `origin`.
    #[must_use]
    pub fn canonical(url: &Url, origin: &Url) -> Self {
        if url.origin() == origin.origin() {
            let mut key = url.path().to_string();
            if let Some(query) = url.query() {
                key.push('?');
                key.push_str(query);
            }
            Self(key)
        } else {
            let mut url = url.clone();
            url.set_fragment(None);
            Self(url.into())
        }
    }

    /// Resolves a possibly relative locator against `origin` and returns its key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if `raw` cannot be resolved to a URL.
    pub fn resolve(raw: &str, origin: &Url) -> Result<Self> {
        Ok(Self::canonical(&resolve_url(raw, origin)?, origin))
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Resolves `raw` (absolute or relative) against `origin`.
///
/// # Errors
///
/// Returns [`Error::InvalidUrl`] if the join fails.
pub fn resolve_url(raw: &str, origin: &Url) -> Result<Url> {
    origin.join(raw.trim()).map_err(|e| Error::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })
}
