//! Error types for talking to the remote library.

use crate::model::{PageId, TreeError};
use thiserror::Error;

/// Failure of a single HTTP exchange (after retries, where retries apply).
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid URL: {input}: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("Network error: could not reach {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} when fetching: {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Failed to read response body from {url}: {source}")]
    BodyRead {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Unexpected response from {url}: {reason}")]
    InvalidResponse { url: String, reason: String },

    #[error("Gave up on {url} after {attempts} attempt(s): {source}")]
    Exhausted {
        url: String,
        attempts: u32,
        #[source]
        source: Box<FetchError>,
    },
}

impl FetchError {
    /// Timeouts, connection failures, 5xx and 429 may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network { source, .. } | FetchError::BodyRead { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            FetchError::HttpStatus { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            FetchError::InvalidUrl { .. }
            | FetchError::InvalidResponse { .. }
            | FetchError::Exhausted { .. } => false,
        }
    }

    /// HTTP status of the underlying failure, looking through retry exhaustion.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Exhausted { source, .. } => source.status(),
            _ => None,
        }
    }
}

/// Failure while resolving the library page tree.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Cannot resolve root page {root}: {source}")]
    RootUnresolved {
        root: PageId,
        #[source]
        source: FetchError,
    },

    /// A non-root listing failed; its subtree is incomplete. The coordinator may skip it.
    #[error("Cannot list subpages of page {page}: {source}")]
    Listing {
        page: PageId,
        #[source]
        source: FetchError,
    },

    #[error("Malformed page tree: {0}")]
    Tree(#[from] TreeError),
}

impl DiscoveryError {
    /// Whether the whole discovery must stop (as opposed to a per-page listing failure).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DiscoveryError::Listing { .. })
    }
}

/// Permanent failure to fetch one page's markup.
#[derive(Debug, Error)]
#[error("Cannot fetch page {page_id}: {source}")]
pub struct PageFetchError {
    pub page_id: PageId,
    #[source]
    pub source: FetchError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_classification() {
        let status = |s: u16| FetchError::HttpStatus {
            status: s,
            url: "https://geo.libretexts.org/x".into(),
        };
        assert!(status(500).is_transient());
        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(!status(404).is_transient());
        assert!(!status(403).is_transient());
    }

    #[test]
    fn exhausted_is_permanent_and_keeps_status() {
        let e = FetchError::Exhausted {
            url: "u".into(),
            attempts: 3,
            source: Box::new(FetchError::HttpStatus {
                status: 502,
                url: "u".into(),
            }),
        };
        assert!(!e.is_transient());
        assert_eq!(e.status(), Some(502));
    }

    #[test]
    fn listing_failures_are_not_fatal() {
        let listing = DiscoveryError::Listing {
            page: "12".into(),
            source: FetchError::HttpStatus {
                status: 404,
                url: "u".into(),
            },
        };
        assert!(!listing.is_fatal());
        let tree = DiscoveryError::Tree(TreeError::Cycle { page: "1".into() });
        assert!(tree.is_fatal());
    }
}
