//! Stored cache entries.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fetch::{FetchResponse, ResponseKind};
use crate::key::CacheKey;

/// A full response held by the cache store.
///
/// Entries are immutable once stored and never hold a partial body; ranged
/// responses are derived from them on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Canonical key the entry is stored under.
    pub key: CacheKey,
    /// `Content-Type` of the original response.
    pub content_type: Option<String>,
    /// Whether the entry came from an opaque response.
    pub opaque: bool,
    /// When the entry was written.
    pub stored_at: DateTime<Utc>,
    /// Full payload.
    pub body: Bytes,
}

/// Entry metadata, written as a JSON line in front of the payload on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    /// Canonical key.
    pub key: CacheKey,
    /// `Content-Type` of the original response.
    pub content_type: Option<String>,
    /// Payload length in bytes.
    pub content_length: u64,
    /// Whether the entry came from an opaque response.
    #[serde(default)]
    pub opaque: bool,
    /// When the entry was written.
    pub stored_at: DateTime<Utc>,
}

impl EntryInfo {
    /// Parses a metadata header line.
    ///
    /// # Errors
    ///
    /// Returns an error if the line is not valid entry metadata.
    pub fn parse_header(line: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(line.trim_ascii_end())?)
    }
}

impl CacheEntry {
    /// Creates an entry from a payload.
    #[must_use]
    pub fn new(key: CacheKey, body: impl Into<Bytes>, content_type: Option<&str>) -> Self {
        Self {
            key,
            content_type: content_type.map(ToString::to_string),
            opaque: false,
            stored_at: Utc::now(),
            body: body.into(),
        }
    }

    /// Creates an entry from a full network response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] for a 206 response or any other non-200
    /// basic response, since only complete bodies may be stored.
    pub fn from_response(key: CacheKey, response: &FetchResponse) -> Result<Self> {
        if !response.is_opaque() && response.status != StatusCode::OK {
            return Err(Error::Storage(format!(
                "refusing to store {key}: status {} is not a full response",
                response.status.as_u16()
            )));
        }
        let mut entry = Self::new(
            key,
            response.body.clone(),
            response.header(&header::CONTENT_TYPE),
        );
        entry.opaque = response.is_opaque();
        Ok(entry)
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.body.len() as u64
    }

    /// Returns true if the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Builds the 200 response served on a cache hit.
    #[must_use]
    pub fn to_response(&self) -> FetchResponse {
        let mut response = FetchResponse::new(StatusCode::OK, self.body.clone())
            .with_header(header::CONTENT_LENGTH, &self.len().to_string())
            .with_header(header::ACCEPT_RANGES, "bytes");
        if let Some(ref content_type) = self.content_type {
            response = response.with_header(header::CONTENT_TYPE, content_type);
        }
        if self.opaque {
            response = response.with_kind(ResponseKind::Opaque);
        }
        response
    }

    /// Returns the entry metadata.
    #[must_use]
    pub fn info(&self) -> EntryInfo {
        EntryInfo {
            key: self.key.clone(),
            content_type: self.content_type.clone(),
            content_length: self.len(),
            opaque: self.opaque,
            stored_at: self.stored_at,
        }
    }

    /// Serializes the entry as a JSON metadata line followed by the payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be serialized.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = serde_json::to_vec(&self.info())?;
        out.reserve(self.body.len() + 1);
        out.push(b'\n');
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    /// Parses the on-disk format produced by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the header is missing or the payload is
    /// shorter or longer than the recorded length.
    pub fn decode(data: Bytes) -> Result<Self> {
        let newline = data
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| Error::Storage("entry is missing its header line".to_string()))?;
        let meta = EntryInfo::parse_header(&data[..newline])?;
        let body = data.slice(newline + 1..);
        if body.len() as u64 != meta.content_length {
            return Err(Error::Storage(format!(
                "entry {} is truncated: expected {} bytes, found {}",
                meta.key,
                meta.content_length,
                body.len()
            )));
        }
        Ok(Self {
            key: meta.key,
            content_type: meta.content_type,
            opaque: meta.opaque,
            stored_at: meta.stored_at,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Url;

    fn key(path: &str) -> CacheKey {
        CacheKey::resolve(path, &Url::parse("https://hymns.example/").unwrap()).unwrap()
    }

    #[test]
    fn encode_decode_preserves_payload() {
        let body = vec![0u8, 10, 13, 255, b'\n'];
        let entry = CacheEntry::new(key("/song.mp3"), body, Some("audio/mpeg"));
        let decoded = CacheEntry::decode(Bytes::from(entry.encode().unwrap())).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn decode_rejects_truncated_payload() {
        let entry = CacheEntry::new(key("/song.mp3"), vec![1u8; 64], Some("audio/mpeg"));
        let mut data = entry.encode().unwrap();
        data.truncate(data.len() - 1);
        assert!(matches!(
            CacheEntry::decode(Bytes::from(data)),
            Err(Error::Storage(_))
        ));
    }

    #[test]
    fn header_line_parses_on_its_own() {
        let entry = CacheEntry::new(key("/a.mp3"), vec![1u8; 3], Some("audio/mpeg"));
        let data = entry.encode().unwrap();
        let newline = data.iter().position(|&b| b == b'\n').unwrap();
        let info = EntryInfo::parse_header(&data[..=newline]).unwrap();
        assert_eq!(info, entry.info());
        assert_eq!(info.content_length, 3);
    }

    #[test]
    fn decode_rejects_missing_header() {
        assert!(CacheEntry::decode(Bytes::from_static(b"no header")).is_err());
    }

    #[test]
    fn partial_responses_are_refused() {
        let resp = FetchResponse::new(StatusCode::PARTIAL_CONTENT, vec![1u8; 10]);
        assert!(CacheEntry::from_response(key("/a.mp3"), &resp).is_err());
        let resp = FetchResponse::new(StatusCode::NOT_FOUND, "missing");
        assert!(CacheEntry::from_response(key("/a.mp3"), &resp).is_err());
    }

    #[test]
    fn opaque_responses_keep_their_kind() {
        let resp = FetchResponse::new(StatusCode::OK, "x").with_kind(ResponseKind::Opaque);
        let entry = CacheEntry::from_response(key("https://cdn.example/a.mp3"), &resp).unwrap();
        assert!(entry.opaque);
        assert!(entry.to_response().is_opaque());
    }

    #[test]
    fn hit_response_carries_minimal_headers() {
        let entry = CacheEntry::new(key("/a.mp3"), vec![7u8; 5000], Some("audio/mpeg"));
        let resp = entry.to_response();
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.header(&header::CONTENT_TYPE), Some("audio/mpeg"));
        assert_eq!(resp.header(&header::CONTENT_LENGTH), Some("5000"));
        assert_eq!(resp.header(&header::ACCEPT_RANGES), Some("bytes"));
    }
}
