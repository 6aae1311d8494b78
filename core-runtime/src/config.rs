//! # Core Configuration Module
//!
//! Holds the injected collaborators and paths the cache engine is built from.
//!
//! ## Overview
//!
//! The configuration system uses a builder to construct a `CoreConfig`. It
//! fails fast: a missing capability is reported at build time with an
//! actionable message instead of surfacing as a failed download later.
//!
//! ## Required Dependencies
//!
//! - `Catalog` - Track records and stream/artwork URLs (always host supplied)
//! - `HttpClient` - Pooled HTTP (desktop default: reqwest)
//! - `SettingsStore` - Runtime cache knobs (desktop default: SQLite)
//!
//! ## Optional Dependencies
//!
//! - `Clock` - Defaults to [`SystemClock`]
//!
//! When the `desktop-shims` feature is enabled, desktop defaults for
//! `HttpClient` and `SettingsStore` are injected automatically if not provided.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//! use std::sync::Arc;
//!
//! let config = CoreConfig::builder()
//!     .cache_dir("/path/to/cache")
//!     .catalog(Arc::new(MySubsonicCatalog::new(server)))
//!     .http_client(Arc::new(MyHttpClient))
//!     .settings_store(Arc::new(MySettingsStore))
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_BUFFER_SIZE;
use bridge_traits::{Catalog, Clock, HttpClient, SettingsStore, SystemClock};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Core configuration.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// Directory holding cached media, sidecars and the index snapshot
    pub cache_dir: PathBuf,

    /// HTTP client shared by every download
    pub http_client: Arc<dyn HttpClient>,

    /// Remote media server
    pub catalog: Arc<dyn Catalog>,

    /// User preferences storage
    pub settings_store: Arc<dyn SettingsStore>,

    /// Time source for cache timestamps
    pub clock: Arc<dyn Clock>,

    /// Capacity of the event bus channel
    pub event_buffer_size: usize,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("cache_dir", &self.cache_dir)
            .field("http_client", &"HttpClient { ... }")
            .field("catalog", &"Catalog { ... }")
            .field("settings_store", &"SettingsStore { ... }")
            .field("clock", &"Clock { ... }")
            .field("event_buffer_size", &self.event_buffer_size)
            .finish()
    }
}

impl CoreConfig {
    /// Creates a new builder for constructing a `CoreConfig`.
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Cache directory is not empty and is not a file
    /// - Event buffer size is within bounds
    pub fn validate(&self) -> Result<()> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(Error::Config("Cache directory cannot be empty".to_string()));
        }

        if self.cache_dir.is_file() {
            return Err(Error::Config(format!(
                "Cache directory {} points at a file",
                self.cache_dir.display()
            )));
        }

        if self.event_buffer_size == 0 || self.event_buffer_size > 100_000 {
            return Err(Error::Config(
                "Event buffer size must be between 1 and 100,000".to_string(),
            ));
        }

        Ok(())
    }
}

fn catalog_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "Catalog".to_string(),
        message: "A Catalog implementation is required to resolve stream URLs and track \
                 records. Inject the adapter for your media server with .catalog()."
            .to_string(),
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn http_client_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: "HttpClient implementation is required for downloads. \
                 Desktop: ensure the 'desktop-shims' feature is enabled to use the default ReqwestHttpClient. \
                 Mobile: inject the platform-native HTTP adapter."
            .to_string(),
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn settings_store_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "SettingsStore".to_string(),
        message: "SettingsStore implementation is required for cache preferences. \
                 Desktop: ensure the 'desktop-shims' feature is enabled to use the default SqliteSettingsStore. \
                 Mobile: inject platform-native settings (UserDefaults/DataStore)."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    use bridge_desktop::ReqwestHttpClient;

    let client = ReqwestHttpClient::new()
        .map_err(|e| Error::Internal(format!("Failed to initialize default HttpClient: {}", e)))?;
    let client: Arc<dyn HttpClient> = Arc::new(client);
    Ok(client)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    Err(http_client_missing_error())
}

#[cfg(feature = "desktop-shims")]
fn provide_default_settings_store(settings_path: &Path) -> Result<Arc<dyn SettingsStore>> {
    use bridge_desktop::SqliteSettingsStore;
    use std::thread;
    use tokio::runtime::{Handle, Runtime};

    let init_store = |path: PathBuf| -> Result<_> {
        let runtime = Runtime::new().map_err(|e| {
            Error::Internal(format!(
                "Failed to create Tokio runtime for default settings store: {}",
                e
            ))
        })?;

        runtime
            .block_on(SqliteSettingsStore::new(path))
            .map_err(|e| {
                Error::Internal(format!("Failed to initialize default SettingsStore: {}", e))
            })
    };

    // A runtime cannot be nested, so build the store on a helper thread when
    // the caller is already inside one.
    let store = match Handle::try_current() {
        Ok(_) => {
            let path = settings_path.to_path_buf();
            thread::spawn(move || init_store(path))
                .join()
                .map_err(|_| {
                    Error::Internal(
                        "Worker thread panicked while creating default SettingsStore".to_string(),
                    )
                })??
        }
        Err(_) => init_store(settings_path.to_path_buf())?,
    };

    let store: Arc<dyn SettingsStore> = Arc::new(store);
    Ok(store)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_settings_store(_settings_path: &Path) -> Result<Arc<dyn SettingsStore>> {
    Err(settings_store_missing_error())
}

/// Builder for constructing [`CoreConfig`] instances.
#[derive(Default)]
pub struct CoreConfigBuilder {
    cache_dir: Option<PathBuf>,
    settings_path: Option<PathBuf>,
    http_client: Option<Arc<dyn HttpClient>>,
    catalog: Option<Arc<dyn Catalog>>,
    settings_store: Option<Arc<dyn SettingsStore>>,
    clock: Option<Arc<dyn Clock>>,
    event_buffer_size: Option<usize>,
}

impl CoreConfigBuilder {
    /// Sets the cache directory (required).
    pub fn cache_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.cache_dir = Some(path.into());
        self
    }

    /// Location of the default SQLite settings database.
    ///
    /// Only used when no `SettingsStore` is injected; defaults to
    /// `settings.db` next to the cache directory.
    pub fn settings_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.settings_path = Some(path.into());
        self
    }

    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the media server catalog (required).
    pub fn catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn settings_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.settings_store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Builds the final `CoreConfig` instance.
    ///
    /// # Returns
    ///
    /// Returns an error if:
    /// - The cache directory or catalog is missing
    /// - A bridge without a platform default is missing
    /// - Configuration values are invalid
    pub fn build(self) -> Result<CoreConfig> {
        let cache_dir = self.cache_dir.ok_or_else(|| {
            Error::Config("Cache directory is required. Use .cache_dir() to set it.".to_string())
        })?;

        let catalog = self.catalog.ok_or_else(catalog_missing_error)?;

        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client()?,
        };

        let settings_store = match self.settings_store {
            Some(store) => store,
            None => {
                let path = self
                    .settings_path
                    .unwrap_or_else(|| default_settings_path(&cache_dir));
                provide_default_settings_store(&path)?
            }
        };

        let config = CoreConfig {
            cache_dir,
            http_client,
            catalog,
            settings_store,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
        };

        config.validate()?;

        Ok(config)
    }
}

fn default_settings_path(cache_dir: &Path) -> PathBuf {
    cache_dir
        .parent()
        .map(|parent| parent.join("settings.db"))
        .unwrap_or_else(|| cache_dir.join("settings.db"))
}
