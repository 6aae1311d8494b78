//! # Eviction Policy
//!
//! Decides which cached tracks to delete and keeps the index in step.
//!
//! ## Modes
//!
//! - **Size-bounded**: oldest media (by modification time) goes first until
//!   the directory fits the budget
//! - **Transient sweep**: entries whose sidecar says `Transient` are deleted
//! - **Aggressive sweep** and **clear all**: everything not kept is deleted
//!
//! Every mode takes a protected `keep` set; ids in it are never deleted.
//! Deletes are best-effort: a file that cannot be removed is logged and
//! skipped, the pass continues.

use crate::error::{CacheError, Result};
use crate::index::CacheIndex;
use crate::layout::{self, CacheLayout, CacheSidecar, CachedFile, Retention, SidecarState};
use bridge_traits::TrackMetadata;
use core_runtime::events::{CacheEvent, CoreEvent, EventBus, EvictionReason};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Outcome of an eviction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Ids whose artifacts were deleted
    pub removed: Vec<String>,
    pub freed_bytes: u64,
    /// Entries left in place
    pub kept: usize,
}

/// Outcome of reconciling the directory with the index at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Complete entries found on disk
    pub restored: usize,
    /// Torn or undersized downloads deleted
    pub discarded: usize,
    /// Index entries whose media was gone
    pub dropped: usize,
}

/// Deletes cache entries and updates the index accordingly.
pub struct EvictionPolicy {
    layout: Arc<CacheLayout>,
    index: Arc<CacheIndex>,
    events: EventBus,
}

impl EvictionPolicy {
    pub fn new(layout: Arc<CacheLayout>, index: Arc<CacheIndex>, events: EventBus) -> Self {
        Self {
            layout,
            index,
            events,
        }
    }

    /// Delete one entry: media, sidecars and index row.
    pub async fn remove(&self, track_id: &str, reason: EvictionReason) -> u64 {
        let freed = self.layout.delete_artifacts(track_id).await;
        self.index.remove(track_id).await;
        debug!(track_id, freed, ?reason, "Evicted cache entry");
        self.events
            .emit(CoreEvent::Cache(CacheEvent::Evicted {
                track_id: track_id.to_string(),
                reason,
            }))
            .ok();
        freed
    }

    /// Delete oldest entries until the directory fits `budget_bytes`.
    #[instrument(skip(self, keep))]
    pub async fn enforce_budget(
        &self,
        budget_bytes: u64,
        keep: &HashSet<String>,
    ) -> Result<EvictionReport> {
        let scan = self.layout.scan().await?;
        let mut total = scan.total_bytes();
        let mut report = EvictionReport::default();

        if total <= budget_bytes {
            report.kept = scan.files.len();
            return Ok(report);
        }

        info!(total, budget_bytes, "Cache over budget, evicting oldest entries");

        for file in &scan.files {
            if total <= budget_bytes || keep.contains(&file.track_id) {
                report.kept += 1;
                continue;
            }
            self.remove(&file.track_id, EvictionReason::OverBudget).await;
            // Count the whole entry even if a sidecar refused to go.
            total = total.saturating_sub(file.total_bytes);
            report.freed_bytes += file.total_bytes;
            report.removed.push(file.track_id.clone());
        }

        if total > budget_bytes {
            warn!(total, budget_bytes, "Cache still over budget, remaining entries are protected");
        }
        Ok(report)
    }

    /// Delete every transient entry not in `keep`.
    #[instrument(skip(self, keep))]
    pub async fn clean_transient(&self, keep: &HashSet<String>) -> Result<EvictionReport> {
        let scan = self.layout.scan().await?;
        let mut report = EvictionReport::default();

        for file in &scan.files {
            let transient = match self.layout.read_sidecar(&file.track_id).await {
                Ok(Some(sidecar)) => sidecar.is_transient(),
                Ok(None) => false,
                Err(e) => {
                    debug!(track_id = %file.track_id, error = %e, "Skipping unreadable sidecar");
                    false
                }
            };

            if transient && !keep.contains(&file.track_id) {
                self.remove(&file.track_id, EvictionReason::TransientSweep)
                    .await;
                report.freed_bytes += file.total_bytes;
                report.removed.push(file.track_id.clone());
            } else {
                report.kept += 1;
            }
        }

        Ok(report)
    }

    /// Delete every entry not in `keep`; the index file itself stays.
    #[instrument(skip(self, keep))]
    pub async fn sweep_unkept(&self, keep: &HashSet<String>) -> Result<EvictionReport> {
        let scan = self.layout.scan().await?;
        Ok(self
            .remove_unkept(&scan.files, keep, EvictionReason::TransientSweep)
            .await)
    }

    /// Unconditionally delete everything not in `keep`, then flush the index.
    ///
    /// Leftover temp files and orphaned sidecars are removed as well.
    #[instrument(skip(self, keep))]
    pub async fn clear_all(&self, keep: &HashSet<String>) -> Result<EvictionReport> {
        let scan = self.layout.scan().await?;
        let report = self
            .remove_unkept(&scan.files, keep, EvictionReason::UserRequest)
            .await;

        for path in &scan.temp_files {
            layout::remove_file_quietly(path).await;
        }
        for (track_id, path) in &scan.orphans {
            if !keep.contains(track_id) {
                layout::remove_file_quietly(path).await;
            }
        }

        self.index.retain_ids(keep).await;
        self.index.flush_now().await?;

        info!(
            removed = report.removed.len(),
            kept = report.kept,
            freed = report.freed_bytes,
            "Cleared cache"
        );
        Ok(report)
    }

    async fn remove_unkept(
        &self,
        files: &[CachedFile],
        keep: &HashSet<String>,
        reason: EvictionReason,
    ) -> EvictionReport {
        let mut report = EvictionReport::default();
        for file in files {
            if keep.contains(&file.track_id) {
                report.kept += 1;
                continue;
            }
            self.remove(&file.track_id, reason).await;
            report.freed_bytes += file.total_bytes;
            report.removed.push(file.track_id.clone());
        }
        report
    }

    /// Refresh the LRU recency of a cached file.
    pub async fn touch(&self, track_id: &str) -> Result<bool> {
        layout::touch(&self.layout.media_path(track_id)).await
    }

    /// Mark an entry permanent and refresh its recency.
    pub async fn promote(&self, track_id: &str) -> Result<bool> {
        let updated = self
            .layout
            .set_retention(track_id, Retention::Permanent)
            .await?;
        if updated {
            self.touch(track_id).await?;
        }
        Ok(updated)
    }

    /// Mark an entry transient, writing a sidecar if the media has none.
    pub async fn ensure_transient(&self, track_id: &str) -> Result<bool> {
        match self.layout.set_retention(track_id, Retention::Transient).await {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(CacheError::Validation(reason)) => {
                debug!(track_id, %reason, "Replacing unreadable sidecar");
            }
            Err(e) => return Err(e),
        }

        if self.layout.media_len(track_id).await?.is_none() {
            return Ok(false);
        }
        let track = self.known_metadata(track_id).await;
        self.layout
            .write_sidecar(&CacheSidecar::new(
                track,
                SidecarState::Complete,
                Retention::Transient,
            ))
            .await?;
        Ok(true)
    }

    /// Promote every transient entry; returns how many changed.
    pub async fn remove_all_transient_markers(&self) -> Result<usize> {
        let scan = self.layout.scan().await?;
        let mut promoted = 0;
        for file in &scan.files {
            match self.layout.read_sidecar(&file.track_id).await {
                Ok(Some(sidecar)) if sidecar.is_transient() => {
                    self.layout
                        .set_retention(&file.track_id, Retention::Permanent)
                        .await?;
                    promoted += 1;
                }
                Ok(_) => {}
                Err(e) => debug!(track_id = %file.track_id, error = %e, "Skipping unreadable sidecar"),
            }
        }
        Ok(promoted)
    }

    /// Bring the index and the directory back in agreement.
    ///
    /// Torn downloads (an `InProgress` sidecar, or media at or below
    /// `min_valid_bytes`) are deleted. Complete media missing from the index
    /// is re-added from its sidecar, and a missing sidecar is rewritten.
    /// Ids in `skip` belong to live downloads and are left alone.
    #[instrument(skip(self, skip))]
    pub async fn reconcile(
        &self,
        min_valid_bytes: u64,
        skip: &HashSet<String>,
    ) -> Result<ReconcileReport> {
        let scan = self.layout.scan().await?;
        let mut report = ReconcileReport::default();
        let mut present = HashSet::new();

        for file in &scan.files {
            if skip.contains(&file.track_id) {
                present.insert(file.track_id.clone());
                continue;
            }

            let sidecar = self.layout.read_sidecar(&file.track_id).await.ok().flatten();
            let torn = matches!(&sidecar, Some(s) if !s.is_complete())
                || file.media_bytes <= min_valid_bytes;
            if torn {
                self.remove(&file.track_id, EvictionReason::Corrupt).await;
                report.discarded += 1;
                continue;
            }

            let track = match sidecar {
                Some(sidecar) => sidecar.track,
                None => {
                    let track = self.known_metadata(&file.track_id).await;
                    let repaired =
                        CacheSidecar::new(track.clone(), SidecarState::Complete, Retention::Permanent);
                    if let Err(e) = self.layout.write_sidecar(&repaired).await {
                        warn!(track_id = %file.track_id, error = %e, "Failed to repair sidecar");
                    }
                    track
                }
            };

            if !self.index.contains(&file.track_id).await {
                report.restored += 1;
            }
            self.index.upsert(track).await;
            present.insert(file.track_id.clone());
        }

        for entry in self.index.entries().await {
            if !present.contains(&entry.id) && self.index.remove(&entry.id).await {
                report.dropped += 1;
            }
        }

        for path in &scan.temp_files {
            layout::remove_file_quietly(path).await;
        }
        for (track_id, path) in &scan.orphans {
            if !skip.contains(track_id) {
                layout::remove_file_quietly(path).await;
            }
        }

        info!(
            restored = report.restored,
            discarded = report.discarded,
            dropped = report.dropped,
            "Reconciled cache directory"
        );
        Ok(report)
    }

    async fn known_metadata(&self, track_id: &str) -> TrackMetadata {
        self.index
            .get(track_id)
            .await
            .unwrap_or_else(|| TrackMetadata::new(track_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use uuid::Uuid;

    struct Fixture {
        layout: Arc<CacheLayout>,
        index: Arc<CacheIndex>,
        policy: EvictionPolicy,
    }

    impl Fixture {
        async fn new() -> Self {
            let layout = Arc::new(CacheLayout::new(
                std::env::temp_dir().join(format!("core-cache-eviction-{}", Uuid::new_v4())),
            ));
            layout.ensure_root().await.unwrap();
            let index = Arc::new(CacheIndex::new(layout.index_path()));
            let policy = EvictionPolicy::new(layout.clone(), index.clone(), EventBus::new(64));
            Self {
                layout,
                index,
                policy,
            }
        }

        /// Cached entry whose media was last modified `age_secs` ago.
        async fn add(&self, id: &str, bytes: usize, age_secs: u64, retention: Retention) {
            let path = self.layout.media_path(id);
            tokio::fs::write(&path, vec![7u8; bytes]).await.unwrap();
            let mtime = SystemTime::now() - Duration::from_secs(age_secs);
            std::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(mtime)
                .unwrap();

            let track = TrackMetadata::new(id).with_title(id);
            self.layout
                .write_sidecar(&CacheSidecar::new(track.clone(), SidecarState::Complete, retention))
                .await
                .unwrap();
            self.index.upsert(track).await;
        }

        async fn exists(&self, id: &str) -> bool {
            self.layout.media_len(id).await.unwrap().is_some()
        }

        async fn cleanup(self) {
            let _ = tokio::fs::remove_dir_all(self.layout.root()).await;
        }
    }

    fn keep(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_budget_evicts_oldest_first() {
        let fx = Fixture::new().await;
        fx.add("old", 4_000, 300, Retention::Permanent).await;
        fx.add("mid", 4_000, 200, Retention::Permanent).await;
        fx.add("new", 4_000, 100, Retention::Permanent).await;

        let sidecar_bytes = fx.layout.scan().await.unwrap().total_bytes() - 12_000;
        let budget = 8_000 + sidecar_bytes;
        let report = fx.policy.enforce_budget(budget, &keep(&[])).await.unwrap();

        assert_eq!(report.removed, vec!["old".to_string()]);
        assert!(!fx.exists("old").await);
        assert!(fx.layout.read_sidecar("old").await.unwrap().is_none());
        assert!(!fx.index.contains("old").await);
        assert!(fx.exists("mid").await && fx.exists("new").await);
        fx.cleanup().await;
    }

    #[tokio::test]
    async fn test_budget_never_evicts_protected() {
        let fx = Fixture::new().await;
        fx.add("playing", 4_000, 500, Retention::Permanent).await;
        fx.add("a", 4_000, 300, Retention::Permanent).await;
        fx.add("b", 4_000, 100, Retention::Permanent).await;

        let report = fx
            .policy
            .enforce_budget(1, &keep(&["playing"]))
            .await
            .unwrap();

        assert!(fx.exists("playing").await);
        assert!(fx.index.contains("playing").await);
        assert_eq!(report.removed.len(), 2);
        assert_eq!(report.kept, 1);
        fx.cleanup().await;
    }

    #[tokio::test]
    async fn test_under_budget_is_noop() {
        let fx = Fixture::new().await;
        fx.add("a", 2_000, 10, Retention::Permanent).await;

        let report = fx.policy.enforce_budget(1 << 30, &keep(&[])).await.unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(report.kept, 1);
        fx.cleanup().await;
    }

    #[tokio::test]
    async fn test_transient_sweep_respects_keep_and_retention() {
        let fx = Fixture::new().await;
        fx.add("scratch", 2_000, 10, Retention::Transient).await;
        fx.add("next", 2_000, 10, Retention::Transient).await;
        fx.add("saved", 2_000, 10, Retention::Permanent).await;

        let report = fx.policy.clean_transient(&keep(&["next"])).await.unwrap();

        assert_eq!(report.removed, vec!["scratch".to_string()]);
        assert!(!fx.exists("scratch").await);
        assert!(!fx.index.contains("scratch").await);
        assert!(fx.exists("next").await);
        assert!(fx.exists("saved").await);
        fx.cleanup().await;
    }

    #[tokio::test]
    async fn test_promote_survives_transient_sweep() {
        let fx = Fixture::new().await;
        fx.add("1", 2_000, 10, Retention::Transient).await;

        assert!(fx.policy.promote("1").await.unwrap());
        let report = fx.policy.clean_transient(&keep(&[])).await.unwrap();

        assert!(report.removed.is_empty());
        assert!(fx.exists("1").await);
        fx.cleanup().await;
    }

    #[tokio::test]
    async fn test_ensure_transient_writes_missing_sidecar() {
        let fx = Fixture::new().await;
        fx.add("1", 2_000, 10, Retention::Permanent).await;
        tokio::fs::remove_file(fx.layout.sidecar_path("1")).await.unwrap();

        assert!(fx.policy.ensure_transient("1").await.unwrap());
        let sidecar = fx.layout.read_sidecar("1").await.unwrap().unwrap();
        assert!(sidecar.is_transient());
        assert_eq!(sidecar.track.title, "1");

        assert!(!fx.policy.ensure_transient("missing").await.unwrap());
        fx.cleanup().await;
    }

    #[tokio::test]
    async fn test_remove_all_transient_markers() {
        let fx = Fixture::new().await;
        fx.add("1", 2_000, 10, Retention::Transient).await;
        fx.add("2", 2_000, 10, Retention::Transient).await;
        fx.add("3", 2_000, 10, Retention::Permanent).await;

        assert_eq!(fx.policy.remove_all_transient_markers().await.unwrap(), 2);
        assert!(fx.policy.clean_transient(&keep(&[])).await.unwrap().removed.is_empty());
        fx.cleanup().await;
    }

    #[tokio::test]
    async fn test_clear_all_keeps_ids_and_flushes_index() {
        let fx = Fixture::new().await;
        fx.add("1", 2_000, 10, Retention::Permanent).await;
        fx.add("2", 2_000, 10, Retention::Transient).await;
        tokio::fs::write(fx.layout.art_path("orphan"), b"art").await.unwrap();

        let report = fx.policy.clear_all(&keep(&["2"])).await.unwrap();

        assert_eq!(report.removed, vec!["1".to_string()]);
        assert!(fx.exists("2").await);
        assert!(!fx.layout.art_path("orphan").exists());
        assert!(fx.layout.index_path().exists());
        assert!(!fx.index.is_dirty());

        let reloaded = CacheIndex::new(fx.layout.index_path());
        let ids: Vec<String> = reloaded.entries().await.into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["2".to_string()]);
        fx.cleanup().await;
    }

    #[tokio::test]
    async fn test_sweep_unkept_leaves_index_file() {
        let fx = Fixture::new().await;
        fx.add("1", 2_000, 10, Retention::Permanent).await;
        fx.index.flush_now().await.unwrap();

        let report = fx.policy.sweep_unkept(&keep(&[])).await.unwrap();
        assert_eq!(report.removed.len(), 1);
        assert!(fx.layout.index_path().exists());
        fx.cleanup().await;
    }

    #[tokio::test]
    async fn test_reconcile_discards_torn_and_restores_complete() {
        let fx = Fixture::new().await;
        fx.add("done", 4_000, 10, Retention::Permanent).await;

        // Torn download from a previous run.
        tokio::fs::write(fx.layout.media_path("torn"), vec![0u8; 4_000]).await.unwrap();
        fx.layout
            .write_sidecar(&CacheSidecar::new(
                TrackMetadata::new("torn"),
                SidecarState::InProgress,
                Retention::Permanent,
            ))
            .await
            .unwrap();

        // Complete media with a lost sidecar, absent from the index.
        tokio::fs::write(fx.layout.media_path("bare"), vec![0u8; 4_000]).await.unwrap();

        // Undersized media.
        tokio::fs::write(fx.layout.media_path("tiny"), vec![0u8; 10]).await.unwrap();

        // Index row whose media is gone.
        fx.index.upsert(TrackMetadata::new("ghost")).await;

        let report = fx.policy.reconcile(1024, &keep(&[])).await.unwrap();

        assert_eq!(report.discarded, 2);
        assert_eq!(report.restored, 1);
        assert_eq!(report.dropped, 1);
        assert!(!fx.exists("torn").await);
        assert!(!fx.exists("tiny").await);
        assert!(fx.index.contains("bare").await);
        assert!(fx.layout.read_sidecar("bare").await.unwrap().is_some());
        assert!(!fx.index.contains("ghost").await);
        assert!(fx.index.contains("done").await);
        fx.cleanup().await;
    }
}
