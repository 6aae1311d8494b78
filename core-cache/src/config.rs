//! Cache configuration and runtime settings
//!
//! [`CacheConfig`] holds engine tuning that is fixed for the lifetime of a
//! coordinator. [`CacheSettings`] holds the user-facing knobs, which can
//! change at any moment and are therefore re-read through a
//! [`SettingsSource`] on every download decision.

use async_trait::async_trait;
use bridge_traits::SettingsStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// Settings key: cache budget in megabytes, 0 for unbounded.
pub const KEY_MAX_SIZE_MB: &str = "cache.max_size_mb";
/// Settings key: hold downloads in memory and drip them to disk.
pub const KEY_RAM_DOUBLE_BUFFERING: &str = "cache.ram_double_buffering";
/// Settings key: cache entries are only removed on user request.
pub const KEY_MANUAL_MODE: &str = "cache.manual_mode";
/// Settings key: wait for the whole track before playback starts.
pub const KEY_AGGRESSIVE_BUFFERING: &str = "playback.aggressive_buffering";

/// Engine tuning for the download coordinator.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Parallel network fetches (default: 3)
    pub max_concurrent_downloads: usize,

    /// Attempts per track before the context fails (default: 3)
    pub max_attempts: u32,

    /// Pause between attempts (default: 2s)
    pub retry_delay: Duration,

    /// Period of the debounced index writer (default: 15s)
    pub index_flush_interval: Duration,

    /// Longest wait for the next body chunk before the attempt fails (default: 30s)
    pub stream_idle_timeout: Duration,

    /// Largest slice written per network chunk (default: 80 KiB)
    pub network_chunk_size: usize,

    /// Publish threshold while the download is young (default: 16 KiB)
    pub eager_flush_bytes: u64,

    /// Bytes after which publishing coarsens (default: 256 KiB)
    pub eager_window_bytes: u64,

    /// Publish threshold after the eager window (default: 512 KiB)
    pub coarse_flush_bytes: u64,

    /// Drip writer chunk size (default: 128 KiB)
    pub drip_chunk_bytes: usize,

    /// Drip writer drain rate (default: 256 KiB/s)
    pub drip_rate_bytes_per_sec: u64,

    /// Longest the drip writer idles without a progress signal (default: 200ms)
    pub drip_idle_poll: Duration,

    /// Assumed size when the server omits Content-Length (default: 20 MiB)
    pub fallback_content_length: u64,

    /// Cached files at or below this size are treated as torn (default: 1024)
    pub min_valid_file_bytes: u64,

    /// Minimum batch for a disk-backed reader (default: 16 KiB)
    pub reader_min_disk_read: usize,

    /// Capacity of the completion broadcast channel (default: 64)
    pub completion_buffer_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 3,
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
            index_flush_interval: Duration::from_secs(15),
            stream_idle_timeout: Duration::from_secs(30),
            network_chunk_size: 81_920,
            eager_flush_bytes: 16 * KIB,
            eager_window_bytes: 256 * KIB,
            coarse_flush_bytes: 512 * KIB,
            drip_chunk_bytes: 128 * KIB as usize,
            drip_rate_bytes_per_sec: 256 * KIB,
            drip_idle_poll: Duration::from_millis(200),
            fallback_content_length: 20 * MIB,
            min_valid_file_bytes: 1024,
            reader_min_disk_read: 16 * KIB as usize,
            completion_buffer_size: 64,
        }
    }
}

impl CacheConfig {
    /// Create a new cache configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum concurrent downloads.
    pub fn with_max_concurrent_downloads(mut self, count: usize) -> Self {
        self.max_concurrent_downloads = count;
        self
    }

    /// Set attempts per track.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_index_flush_interval(mut self, interval: Duration) -> Self {
        self.index_flush_interval = interval;
        self
    }

    /// Fail an attempt whose body stalls for longer than `timeout`.
    pub fn with_stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.stream_idle_timeout = timeout;
        self
    }

    /// Set the drip writer drain rate in bytes per second.
    pub fn with_drip_rate(mut self, bytes_per_sec: u64) -> Self {
        self.drip_rate_bytes_per_sec = bytes_per_sec;
        self
    }

    pub fn with_fallback_content_length(mut self, bytes: u64) -> Self {
        self.fallback_content_length = bytes;
        self
    }

    /// Flush threshold for the current write position.
    ///
    /// Progress is published eagerly while the download is inside the eager
    /// window so playback can start early, then in larger batches.
    pub fn flush_threshold(&self, downloaded: u64) -> u64 {
        if downloaded <= self.eager_window_bytes {
            self.eager_flush_bytes
        } else {
            self.coarse_flush_bytes
        }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_downloads == 0 {
            return Err("max_concurrent_downloads must be at least 1".to_string());
        }

        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }

        if self.network_chunk_size == 0 || self.drip_chunk_bytes == 0 {
            return Err("chunk sizes must be greater than 0".to_string());
        }

        if self.eager_flush_bytes == 0 || self.coarse_flush_bytes < self.eager_flush_bytes {
            return Err(
                "coarse_flush_bytes must be at least eager_flush_bytes, which must be non-zero"
                    .to_string(),
            );
        }

        if self.drip_rate_bytes_per_sec == 0 {
            return Err("drip_rate_bytes_per_sec must be greater than 0".to_string());
        }

        if self.fallback_content_length == 0 {
            return Err("fallback_content_length must be greater than 0".to_string());
        }

        if self.index_flush_interval.is_zero() {
            return Err("index_flush_interval must be non-zero".to_string());
        }

        if self.stream_idle_timeout.is_zero() {
            return Err("stream_idle_timeout must be non-zero".to_string());
        }

        Ok(())
    }
}

/// User-facing cache knobs, re-read on every decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Size budget in bytes; 0 disables size-bounded eviction
    pub budget_bytes: u64,

    /// Buffer downloads in memory and drip them to disk
    pub ram_double_buffering: bool,

    /// Entries persist until the user deletes them; transient ones are swept
    pub manual_mode: bool,

    /// Wait for the complete track before starting playback
    pub aggressive_buffering: bool,
}

impl CacheSettings {
    /// Whether size-bounded LRU eviction applies.
    pub fn is_size_bounded(&self) -> bool {
        self.budget_bytes > 0
    }

    pub fn with_budget_mb(mut self, megabytes: u64) -> Self {
        self.budget_bytes = megabytes.saturating_mul(MIB);
        self
    }

    pub fn with_ram_double_buffering(mut self, enabled: bool) -> Self {
        self.ram_double_buffering = enabled;
        self
    }

    pub fn with_manual_mode(mut self, enabled: bool) -> Self {
        self.manual_mode = enabled;
        self
    }

    pub fn with_aggressive_buffering(mut self, enabled: bool) -> Self {
        self.aggressive_buffering = enabled;
        self
    }
}

/// Source of the current [`CacheSettings`].
#[async_trait]
pub trait SettingsSource: Send + Sync {
    /// Read the settings as they are right now.
    async fn current(&self) -> CacheSettings;
}

/// Reads cache settings from the host [`SettingsStore`].
///
/// Missing or unreadable keys fall back to the defaults (unbounded budget,
/// every flag off).
pub struct StoreSettingsSource {
    store: Arc<dyn SettingsStore>,
}

impl StoreSettingsSource {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    async fn read_bool(&self, key: &str) -> bool {
        match self.store.get_bool(key).await {
            Ok(value) => value.unwrap_or(false),
            Err(e) => {
                warn!(key, error = %e, "Failed to read cache setting, using default");
                false
            }
        }
    }
}

#[async_trait]
impl SettingsSource for StoreSettingsSource {
    async fn current(&self) -> CacheSettings {
        let budget_mb = match self.store.get_i64(KEY_MAX_SIZE_MB).await {
            Ok(value) => value.unwrap_or(0).max(0) as u64,
            Err(e) => {
                warn!(key = KEY_MAX_SIZE_MB, error = %e, "Failed to read cache setting, using default");
                0
            }
        };

        CacheSettings::default()
            .with_budget_mb(budget_mb)
            .with_ram_double_buffering(self.read_bool(KEY_RAM_DOUBLE_BUFFERING).await)
            .with_manual_mode(self.read_bool(KEY_MANUAL_MODE).await)
            .with_aggressive_buffering(self.read_bool(KEY_AGGRESSIVE_BUFFERING).await)
    }
}

/// In-memory settings, adjustable at runtime.
#[derive(Debug, Default)]
pub struct StaticSettings {
    settings: RwLock<CacheSettings>,
}

impl StaticSettings {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    /// Replace the settings; the next decision sees the new values.
    pub fn set(&self, settings: CacheSettings) {
        *self.settings.write() = settings;
    }

    pub fn update(&self, f: impl FnOnce(&mut CacheSettings)) {
        f(&mut self.settings.write());
    }
}

#[async_trait]
impl SettingsSource for StaticSettings {
    async fn current(&self) -> CacheSettings {
        *self.settings.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::error::Result as BridgeResult;
    use bridge_traits::BridgeError;
    use mockall::mock;
    use mockall::predicate::eq;

    mock! {
        Store {}

        #[async_trait]
        impl SettingsStore for Store {
            async fn set_string(&self, key: &str, value: &str) -> BridgeResult<()>;
            async fn get_string(&self, key: &str) -> BridgeResult<Option<String>>;
            async fn set_bool(&self, key: &str, value: bool) -> BridgeResult<()>;
            async fn get_bool(&self, key: &str) -> BridgeResult<Option<bool>>;
            async fn set_i64(&self, key: &str, value: i64) -> BridgeResult<()>;
            async fn get_i64(&self, key: &str) -> BridgeResult<Option<i64>>;
            async fn delete(&self, key: &str) -> BridgeResult<()>;
            async fn has_key(&self, key: &str) -> BridgeResult<bool>;
        }
    }

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.max_concurrent_downloads, 3);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_delay, Duration::from_secs(2));
        assert_eq!(config.index_flush_interval, Duration::from_secs(15));
        assert_eq!(config.network_chunk_size, 81_920);
        assert_eq!(config.fallback_content_length, 20 * 1024 * 1024);
        assert_eq!(config.stream_idle_timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flush_threshold_coarsens_after_window() {
        let config = CacheConfig::default();
        assert_eq!(config.flush_threshold(0), 16 * 1024);
        assert_eq!(config.flush_threshold(256 * 1024), 16 * 1024);
        assert_eq!(config.flush_threshold(256 * 1024 + 1), 512 * 1024);
    }

    #[test]
    fn test_config_validation() {
        assert!(CacheConfig::new()
            .with_max_concurrent_downloads(0)
            .validate()
            .is_err());
        assert!(CacheConfig::new().with_max_attempts(0).validate().is_err());
        assert!(CacheConfig::new().with_drip_rate(0).validate().is_err());
        assert!(CacheConfig::new()
            .with_fallback_content_length(0)
            .validate()
            .is_err());
        assert!(CacheConfig::new()
            .with_stream_idle_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_budget_mb_saturates() {
        let settings = CacheSettings::default().with_budget_mb(u64::MAX);
        assert_eq!(settings.budget_bytes, u64::MAX);
        assert!(settings.is_size_bounded());

        let settings = CacheSettings::default().with_budget_mb(2);
        assert_eq!(settings.budget_bytes, 2 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_store_source_reads_keys() {
        let mut store = MockStore::new();
        store
            .expect_get_i64()
            .with(eq(KEY_MAX_SIZE_MB))
            .returning(|_| Ok(Some(512)));
        store
            .expect_get_bool()
            .with(eq(KEY_RAM_DOUBLE_BUFFERING))
            .returning(|_| Ok(Some(true)));
        store
            .expect_get_bool()
            .with(eq(KEY_MANUAL_MODE))
            .returning(|_| Ok(None));
        store
            .expect_get_bool()
            .with(eq(KEY_AGGRESSIVE_BUFFERING))
            .returning(|_| Ok(Some(true)));

        let settings = StoreSettingsSource::new(Arc::new(store)).current().await;
        assert_eq!(settings.budget_bytes, 512 * 1024 * 1024);
        assert!(settings.ram_double_buffering);
        assert!(!settings.manual_mode);
        assert!(settings.aggressive_buffering);
        assert!(settings.is_size_bounded());
    }

    #[tokio::test]
    async fn test_store_source_falls_back_on_errors() {
        let mut store = MockStore::new();
        store
            .expect_get_i64()
            .returning(|_| Err(BridgeError::DatabaseError("locked".into())));
        store
            .expect_get_bool()
            .returning(|_| Err(BridgeError::DatabaseError("locked".into())));

        let settings = StoreSettingsSource::new(Arc::new(store)).current().await;
        assert_eq!(settings, CacheSettings::default());
        assert!(!settings.is_size_bounded());
    }

    #[tokio::test]
    async fn test_negative_budget_is_unbounded() {
        let mut store = MockStore::new();
        store.expect_get_i64().returning(|_| Ok(Some(-5)));
        store.expect_get_bool().returning(|_| Ok(None));

        let settings = StoreSettingsSource::new(Arc::new(store)).current().await;
        assert_eq!(settings.budget_bytes, 0);
    }

    #[tokio::test]
    async fn test_huge_budget_does_not_wrap() {
        let mut store = MockStore::new();
        store.expect_get_i64().returning(|_| Ok(Some(i64::MAX)));
        store.expect_get_bool().returning(|_| Ok(None));

        let settings = StoreSettingsSource::new(Arc::new(store)).current().await;
        assert_eq!(settings.budget_bytes, u64::MAX);
        assert!(settings.is_size_bounded());
    }

    #[tokio::test]
    async fn test_static_settings_update() {
        let source = StaticSettings::default();
        assert_eq!(source.current().await, CacheSettings::default());

        source.update(|s| s.manual_mode = true);
        assert!(source.current().await.manual_mode);

        source.set(CacheSettings::default().with_budget_mb(1));
        let current = source.current().await;
        assert_eq!(current.budget_bytes, 1024 * 1024);
        assert!(!current.manual_mode);
    }
}
