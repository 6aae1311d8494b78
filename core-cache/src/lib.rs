//! # Progressive Media Cache
//!
//! Downloads media payloads once, serves them to readers while they are
//! still arriving, and keeps the on-disk cache within budget.
//!
//! ## Overview
//!
//! This crate handles:
//! - Deduplicated, bounded, retried downloads ([`DownloadCoordinator`])
//! - Shared per-track progress state ([`DownloadContext`])
//! - Blocking `Read + Seek` over partial downloads ([`ProgressiveReader`])
//! - Optional RAM double buffering with a throttled drip writer to disk
//! - A debounced index of cached tracks ([`CacheIndex`])
//! - LRU, transient and clear-all eviction ([`EvictionPolicy`])
//!
//! ## Usage
//!
//! ```ignore
//! use core_cache::{BufferingMode, CacheConfig, DownloadCoordinator};
//!
//! let coordinator = DownloadCoordinator::from_core_config(&core_config, CacheConfig::default())?;
//! coordinator.start().await?;
//!
//! let reader = coordinator
//!     .prepare_playback(track, BufferingMode::Standard, Duration::from_secs(15))
//!     .await?;
//! std::thread::spawn(move || decode(reader));
//! ```

pub mod buffering;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod drip;
pub mod error;
pub mod eviction;
pub mod index;
pub mod layout;
pub mod reader;
pub mod stats;

pub use buffering::{BufferingMode, DEFAULT_PREPARE_TIMEOUT, STANDARD_BUFFER_BYTES};
pub use config::{CacheConfig, CacheSettings, SettingsSource, StaticSettings, StoreSettingsSource};
pub use context::{DownloadContext, DownloadState, RamBuffer};
pub use coordinator::{CacheDeps, DownloadCoordinator};
pub use error::{CacheError, Result};
pub use eviction::{EvictionPolicy, EvictionReport, ReconcileReport};
pub use index::{CacheIndex, IndexFlushTask};
pub use layout::{CacheLayout, CacheSidecar, Retention, SidecarState};
pub use reader::ProgressiveReader;
pub use stats::CacheStats;
