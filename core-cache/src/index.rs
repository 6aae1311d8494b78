//! # Cache Index
//!
//! In-memory list of cached tracks, persisted as a debounced snapshot.
//!
//! ## Overview
//!
//! - Loaded lazily from `local_index.json` on first access
//! - `upsert`/`remove` only touch memory and set a dirty flag
//! - A background task writes the snapshot every `index_flush_interval`
//!   when dirty; `flush_now` is the synchronous path used by clear-all and
//!   shutdown
//! - A failed write leaves the flag set so the next tick retries
//!
//! The snapshot is cloned under the mutex and written after releasing it.

use crate::error::Result;
use crate::layout::write_atomic;
use bridge_traits::TrackMetadata;
use core_runtime::events::{CacheEvent, CoreEvent, EventBus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entries: Vec<TrackMetadata>,
}

#[derive(Default)]
struct IndexState {
    entries: Vec<TrackMetadata>,
    dirty: bool,
}

/// Debounced, persisted list of cached tracks.
pub struct CacheIndex {
    path: PathBuf,
    state: Mutex<IndexState>,
    loaded: OnceCell<()>,
}

impl CacheIndex {
    /// Index persisted at `path`; nothing is read until first access.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(IndexState::default()),
            loaded: OnceCell::new(),
        }
    }

    async fn ensure_loaded(&self) {
        self.loaded
            .get_or_init(|| async {
                let entries = self.read_snapshot().await;
                debug!(entries = entries.len(), "Loaded cache index snapshot");
                let mut state = self.state.lock();
                // Mutations made before the load finished win over the snapshot.
                let known: HashSet<String> = state.entries.iter().map(|e| e.id.clone()).collect();
                let mut merged: Vec<TrackMetadata> =
                    entries.into_iter().filter(|e| !known.contains(&e.id)).collect();
                merged.append(&mut state.entries);
                state.entries = merged;
            })
            .await;
    }

    async fn read_snapshot(&self) -> Vec<TrackMetadata> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(error = %e, "Failed to read cache index, starting empty");
                return Vec::new();
            }
        };

        match serde_json::from_slice::<Snapshot>(&raw) {
            Ok(snapshot) => snapshot.entries,
            Err(e) => {
                warn!(error = %e, "Cache index snapshot is corrupt, starting empty");
                Vec::new()
            }
        }
    }

    /// Insert or replace the entry with the same id.
    pub async fn upsert(&self, entry: TrackMetadata) {
        self.ensure_loaded().await;
        let mut state = self.state.lock();
        match state.entries.iter().position(|e| e.id == entry.id) {
            Some(i) if state.entries[i] == entry => return,
            Some(i) => state.entries[i] = entry,
            None => state.entries.push(entry),
        }
        state.dirty = true;
    }

    /// Remove an entry; returns whether it was present.
    pub async fn remove(&self, track_id: &str) -> bool {
        self.ensure_loaded().await;
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|e| e.id != track_id);
        let removed = state.entries.len() != before;
        if removed {
            state.dirty = true;
        }
        removed
    }

    /// Drop every entry whose id is not in `keep`; returns the count removed.
    pub async fn retain_ids(&self, keep: &HashSet<String>) -> usize {
        self.ensure_loaded().await;
        let mut state = self.state.lock();
        let before = state.entries.len();
        state.entries.retain(|e| keep.contains(&e.id));
        let removed = before - state.entries.len();
        if removed > 0 {
            state.dirty = true;
        }
        removed
    }

    pub async fn get(&self, track_id: &str) -> Option<TrackMetadata> {
        self.ensure_loaded().await;
        self.state
            .lock()
            .entries
            .iter()
            .find(|e| e.id == track_id)
            .cloned()
    }

    pub async fn contains(&self, track_id: &str) -> bool {
        self.get(track_id).await.is_some()
    }

    /// Copy of every entry, in insertion order.
    pub async fn entries(&self) -> Vec<TrackMetadata> {
        self.ensure_loaded().await;
        self.state.lock().entries.clone()
    }

    pub async fn len(&self) -> usize {
        self.ensure_loaded().await;
        self.state.lock().entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Write the snapshot if anything changed since the last write.
    ///
    /// Returns the number of entries written, or `None` when clean.
    pub async fn flush_if_dirty(&self) -> Result<Option<usize>> {
        self.ensure_loaded().await;
        let snapshot = {
            let mut state = self.state.lock();
            if !state.dirty {
                return Ok(None);
            }
            state.dirty = false;
            state.entries.clone()
        };

        let count = snapshot.len();
        if let Err(e) = self.write_snapshot(snapshot).await {
            self.state.lock().dirty = true;
            return Err(e);
        }
        Ok(Some(count))
    }

    /// Write the snapshot unconditionally.
    pub async fn flush_now(&self) -> Result<usize> {
        self.state.lock().dirty = true;
        Ok(self.flush_if_dirty().await?.unwrap_or(0))
    }

    async fn write_snapshot(&self, entries: Vec<TrackMetadata>) -> Result<()> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            entries,
        };
        let json = serde_json::to_vec(&snapshot)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_atomic(&self.path, &json).await
    }

    /// Spawn the periodic writer.
    pub fn spawn_flush_task(
        self: &Arc<Self>,
        interval: Duration,
        events: EventBus,
    ) -> IndexFlushTask {
        let token = CancellationToken::new();
        let index = Arc::clone(self);
        let child = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        match index.flush_if_dirty().await {
                            Ok(Some(entries)) => {
                                debug!(entries, "Flushed cache index");
                                events.emit(CoreEvent::Cache(CacheEvent::IndexFlushed { entries })).ok();
                            }
                            Ok(None) => {}
                            Err(e) => warn!(error = %e, "Cache index flush failed, will retry"),
                        }
                    }
                }
            }
            info!("Cache index flush task stopped");
        });

        IndexFlushTask { token, handle }
    }
}

/// Handle to the periodic index writer.
pub struct IndexFlushTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl IndexFlushTask {
    /// Stop the task and wait for it to exit.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Cache index flush task ended abnormally");
        }
    }
}
