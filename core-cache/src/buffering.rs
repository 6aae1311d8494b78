//! # Playback Buffering
//!
//! Gets a track ready for a decoder: joins or starts its download, waits
//! for enough bytes, and hands back a [`ProgressiveReader`].
//!
//! ## Modes
//!
//! - `Standard`: start once [`STANDARD_BUFFER_BYTES`] are available
//! - `Aggressive`: start only once the whole track is downloaded
//!
//! The threshold is a fixed byte count, not scaled to the track's bitrate.
//!
//! The timeout belongs to the caller. Expiry fails the preparation but
//! leaves the download running so a later request can still use it.

use crate::config::CacheSettings;
use crate::context::{DownloadContext, DownloadState, RamBuffer};
use crate::coordinator::DownloadCoordinator;
use crate::error::{CacheError, Result};
use crate::reader::ProgressiveReader;
use bridge_traits::TrackMetadata;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Bytes buffered before playback starts in standard mode.
pub const STANDARD_BUFFER_BYTES: u64 = 256 * 1024;

/// Default wait before giving up on a track.
pub const DEFAULT_PREPARE_TIMEOUT: Duration = Duration::from_secs(15);

/// How much of a track must be present before playback starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferingMode {
    #[default]
    Standard,
    Aggressive,
}

impl BufferingMode {
    pub fn from_settings(settings: &CacheSettings) -> Self {
        if settings.aggressive_buffering {
            BufferingMode::Aggressive
        } else {
            BufferingMode::Standard
        }
    }

    /// Whether `ctx` holds enough bytes to start in this mode.
    pub fn is_ready(&self, ctx: &DownloadContext) -> bool {
        match ctx.state() {
            DownloadState::Complete | DownloadState::Failed => true,
            DownloadState::Pending => false,
            DownloadState::Downloading => match self {
                BufferingMode::Aggressive => false,
                BufferingMode::Standard => {
                    let mut wanted = STANDARD_BUFFER_BYTES as i64;
                    if ctx.is_length_exact() {
                        wanted = wanted.min(ctx.total_bytes());
                    }
                    ctx.downloaded_bytes() >= wanted
                }
            },
        }
    }
}

impl DownloadCoordinator {
    /// Join or start a transient download and wait until playback can begin.
    ///
    /// # Errors
    ///
    /// - [`CacheError::Timeout`] when `timeout` elapses first
    /// - [`CacheError::DownloadFailed`] when every attempt failed
    #[instrument(skip(self, track), fields(track_id = %track.id))]
    pub async fn prepare_playback(
        &self,
        track: TrackMetadata,
        mode: BufferingMode,
        timeout: Duration,
    ) -> Result<ProgressiveReader> {
        let track_id = track.id.clone();
        let ctx = self.start_or_join(track, true);

        if let Err(e) = self.touch_cached_file(&track_id).await {
            debug!(error = %e, "Could not refresh cache recency");
        }

        let waited = tokio::time::timeout(timeout, ctx.wait_until(|ctx| mode.is_ready(ctx))).await;
        if waited.is_err() {
            warn!(
                ?mode,
                downloaded = ctx.downloaded_bytes(),
                "Timed out waiting for playback buffer"
            );
            return Err(CacheError::Timeout(timeout));
        }

        if ctx.state() == DownloadState::Failed {
            return Err(CacheError::DownloadFailed {
                track_id,
                attempts: ctx.attempt(),
            });
        }

        let mut preloaded = None;
        if ctx.state() == DownloadState::Complete && self.settings().await.ram_double_buffering {
            preloaded = self.preload_into_ram(&ctx).await;
        }

        info!(
            ?mode,
            downloaded = ctx.downloaded_bytes(),
            total = ctx.total_bytes(),
            preloaded = preloaded.is_some(),
            "Playback buffer ready"
        );
        let reader = self.open_reader(ctx);
        Ok(match preloaded {
            Some(ram) => reader.with_preloaded(ram),
            None => reader,
        })
    }

    /// Copy a cached file into memory so reads never wait on the disk.
    ///
    /// The copy belongs to the returned reader and is freed with it.
    async fn preload_into_ram(&self, ctx: &DownloadContext) -> Option<Arc<RamBuffer>> {
        let path = ctx.file_path()?;
        match tokio::fs::read(&path).await {
            Ok(data) => {
                debug!(bytes = data.len(), "Preloaded cached track into memory");
                Some(Arc::new(RamBuffer::from_bytes(Bytes::from(data))))
            }
            Err(e) => {
                warn!(error = %e, "Preload failed, reading from disk");
                None
            }
        }
    }
}
