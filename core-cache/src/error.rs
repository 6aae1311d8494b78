//! # Cache Error Types
//!
//! Errors raised inside the download worker and by cache housekeeping.
//!
//! Worker errors never reach callers of `start_or_join`/`enqueue`: they are
//! caught at the worker boundary, trigger cleanup, and end up as a retry or a
//! `Failed` context. Housekeeping operations (`clear_all`, `clean_cache`,
//! index flushes) return them directly.

use bridge_traits::BridgeError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while downloading or managing cached tracks.
#[derive(Error, Debug)]
pub enum CacheError {
    // ========================================================================
    // Transfer Errors
    // ========================================================================
    /// Connection dropped, DNS failure, body stream error.
    #[error("Network error: {0}")]
    Network(String),

    /// The media server answered with a non-success status.
    #[error("HTTP request failed with status {status}")]
    Http { status: u16 },

    /// Disk full, permission denied, file vanished.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ========================================================================
    // Cache Content Errors
    // ========================================================================
    /// A pre-existing cache file is torn or corrupt.
    #[error("Cached file failed validation: {0}")]
    Validation(String),

    /// Sidecar or index JSON could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ========================================================================
    // Caller-Facing Errors
    // ========================================================================
    /// Not enough data arrived before the caller's deadline.
    #[error("Timed out after {0:?} waiting for buffered data")]
    Timeout(Duration),

    /// Every attempt for the track failed.
    #[error("Download of track {track_id} failed after {attempts} attempt(s)")]
    DownloadFailed { track_id: String, attempts: u32 },

    /// Catalog metadata lookup failed. Only costs the metadata repair.
    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The coordinator no longer accepts work.
    #[error("Download coordinator is shut down")]
    ShutDown,
}

impl CacheError {
    /// Returns `true` if another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CacheError::Network(_) | CacheError::Io(_) => true,
            CacheError::Http { status } => *status >= 500 || *status == 429 || *status == 408,
            _ => false,
        }
    }

    /// Returns `true` if this is a caller-side buffering timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CacheError::Timeout(_))
    }
}

impl From<BridgeError> for CacheError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Io(e) => CacheError::Io(e),
            BridgeError::Network(msg) | BridgeError::OperationFailed(msg) => {
                CacheError::Network(msg)
            }
            BridgeError::NotAvailable(msg) | BridgeError::DatabaseError(msg) => {
                CacheError::Config(msg)
            }
        }
    }
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
