//! Page ↔ worker message protocol.
//!
//! All messages share one JSON shape tagged by `type`, decoded once at the
//! boundary:
//!
//! ```json
//! { "type": "CACHE_SONGS", "songs": [{ "url": "/a.mp3", "title": "A" }] }
//! { "type": "CACHE_PROGRESS", "done": 1, "total": 3 }
//! { "type": "CACHE_COMPLETE", "count": 3 }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One item of a bulk download request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Song {
    /// Absolute or origin-relative URL.
    pub url: String,
    /// Display title.
    #[serde(default)]
    pub title: String,
}

impl Song {
    /// Creates a song target.
    #[must_use]
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
        }
    }
}

/// A message exchanged between a page and the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Page → worker: download and store these songs.
    CacheSongs {
        /// Ordered targets.
        songs: Vec<Song>,
    },
    /// Worker → originating page: an item resolved.
    CacheProgress {
        /// Items resolved so far.
        done: usize,
        /// Items in the job.
        total: usize,
    },
    /// Worker → all pages: the job finished.
    CacheComplete {
        /// Items stored successfully.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<usize>,
    },
}

impl Message {
    /// Decodes a JSON message.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidMessage`] for unknown types or bad shapes.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encodes the message as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
