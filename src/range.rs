//! HTTP Range slicing of cached entries.
//!
//! Only single byte ranges are honoured. Anything that does not parse is
//! answered with the full entry, which is always a valid reply to a ranged
//! request.

use reqwest::StatusCode;
use reqwest::header;

use crate::entry::CacheEntry;
use crate::fetch::FetchResponse;

/// A parsed `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=<start>-<end>?`
    FromTo {
        /// First byte offset.
        start: u64,
        /// Last byte offset, inclusive; `None` means end of file.
        end: Option<u64>,
    },
    /// `bytes=-<length>`: the last `length` bytes.
    Suffix(u64),
}

impl ByteRange {
    /// Parses a `Range` header value. Returns `None` if it is malformed.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let (unit, ranges) = value.split_once('=')?;
        if !unit.trim().eq_ignore_ascii_case("bytes") || ranges.contains(',') {
            return None;
        }
        let (start, end) = ranges.trim().split_once('-')?;
        let (start, end) = (start.trim(), end.trim());

        if start.is_empty() {
            return parse_offset(end).map(Self::Suffix);
        }
        let start = parse_offset(start)?;
        let end = if end.is_empty() {
            None
        } else {
            Some(parse_offset(end)?)
        };
        if end.is_some_and(|end| end < start) {
            return None;
        }
        Some(Self::FromTo { start, end })
    }

    /// Resolves the range against a payload of `len` bytes into an inclusive
    /// window. Returns `None` when the range is not satisfiable.
    #[must_use]
    pub fn resolve(self, len: u64) -> Option<(u64, u64)> {
        match self {
            Self::FromTo { start, end } => {
                if start >= len {
                    return None;
                }
                let end = end.map_or(len - 1, |end| end.min(len - 1));
                Some((start, end))
            }
            Self::Suffix(suffix) => {
                if suffix == 0 || len == 0 {
                    return None;
                }
                Some((len - suffix.min(len), len - 1))
            }
        }
    }
}

/// Offsets past `u64::MAX` saturate; they still lie beyond any payload.
fn parse_offset(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(s.parse().unwrap_or(u64::MAX))
}

/// Answers a ranged request from a full cached entry.
///
/// - malformed header: the full entry with status 200
/// - satisfiable range: 206 with `Content-Range`, `Content-Length` and the window
/// - unsatisfiable range: 416 with `Content-Range: bytes */<len>`
#[must_use]
pub fn slice(entry: &CacheEntry, range_header: &str) -> FetchResponse {
    let Some(range) = ByteRange::parse(range_header) else {
        log::debug!("Malformed range {range_header:?} for {}, serving full entry", entry.key);
        return entry.to_response();
    };

    let len = entry.len();
    let Some((start, end)) = range.resolve(len) else {
        log::debug!("Unsatisfiable range {range_header:?} for {} ({len} bytes)", entry.key);
        return FetchResponse::new(StatusCode::RANGE_NOT_SATISFIABLE, bytes::Bytes::new())
            .with_header(header::CONTENT_RANGE, &format!("bytes */{len}"))
            .with_header(header::ACCEPT_RANGES, "bytes")
            .with_header(header::CONTENT_LENGTH, "0");
    };

    // Window bounds are < len, which is the in-memory length of the body.
    #[allow(clippy::cast_possible_truncation)]
    let body = entry.body.slice(start as usize..=end as usize);

    let mut response = FetchResponse::new(StatusCode::PARTIAL_CONTENT, body)
        .with_header(header::CONTENT_RANGE, &format!("bytes {start}-{end}/{len}"))
        .with_header(header::ACCEPT_RANGES, "bytes")
        .with_header(header::CONTENT_LENGTH, &(end - start + 1).to_string());
    if let Some(ref content_type) = entry.content_type {
        response = response.with_header(header::CONTENT_TYPE, content_type);
    }
    response
}
