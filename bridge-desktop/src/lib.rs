//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `HttpClient` using a pooled `reqwest` client with streaming bodies
//! - `SettingsStore` using a SQLite-backed key-value store
//! - [`default_cache_dir`] resolving the per-user cache directory
//!
//! The `Catalog` is server specific and always injected by the host.
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{default_cache_dir, ReqwestHttpClient, SqliteSettingsStore};
//!
//! #[tokio::main]
//! async fn main() -> bridge_traits::error::Result<()> {
//!     let http_client = ReqwestHttpClient::new()?;
//!     let settings = SqliteSettingsStore::in_memory().await?;
//!     let cache_dir = default_cache_dir()?;
//!     // Use in core configuration
//!     Ok(())
//! }
//! ```

mod http;
mod settings;

pub use http::ReqwestHttpClient;
pub use settings::SqliteSettingsStore;

use bridge_traits::error::{BridgeError, Result};
use std::path::PathBuf;

/// Directory name created under the platform cache root.
pub const CACHE_DIR_NAME: &str = "media-cache";

/// Per-user cache directory for cached media (`~/.cache/media-cache` on Linux).
pub fn default_cache_dir() -> Result<PathBuf> {
    dirs::cache_dir()
        .map(|root| root.join(CACHE_DIR_NAME))
        .ok_or_else(|| {
            BridgeError::NotAvailable("platform cache directory could not be resolved".to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cache_dir_ends_with_crate_folder() {
        if let Ok(dir) = default_cache_dir() {
            assert!(dir.ends_with(CACHE_DIR_NAME));
        }
    }
}
