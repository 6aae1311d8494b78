//! # Cache Directory Layout
//!
//! File naming and sidecar persistence for the cache directory.
//!
//! ```text
//! <cache_dir>/
//!   local_index.json        index snapshot
//!   track_42.media          media payload
//!   track_42.json           sidecar: metadata + state + retention
//!   track_42.art            optional cover art
//!   trackx_2f612f.media     id "/a/" is not filename-safe, so it is hex-encoded
//! ```
//!
//! The sidecar replaces marker files: an `InProgress` state marks a torn
//! download, a `Transient` retention marks disposable scratch space. Sidecar
//! and index writes go through a temp file and a rename.

use crate::error::{CacheError, Result};
use bridge_traits::TrackMetadata;
use chrono::{DateTime, Utc};
use core_runtime::logging::strip_path;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};
use uuid::Uuid;

/// Name of the index snapshot file.
pub const INDEX_FILE_NAME: &str = "local_index.json";

const SAFE_PREFIX: &str = "track_";
const ENCODED_PREFIX: &str = "trackx_";
const TEMP_SUFFIX: &str = ".tmp";

/// One of the files kept per cached track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Media,
    Sidecar,
    Art,
}

impl ArtifactKind {
    const ALL: [ArtifactKind; 3] = [ArtifactKind::Media, ArtifactKind::Sidecar, ArtifactKind::Art];

    fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Media => "media",
            ArtifactKind::Sidecar => "json",
            ArtifactKind::Art => "art",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.extension() == ext)
    }
}

/// Whether the media payload is fully written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SidecarState {
    InProgress,
    Complete,
}

/// Whether the entry is scratch space or a user-visible cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Retention {
    Transient,
    Permanent,
}

/// Metadata persisted next to each media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSidecar {
    pub track: TrackMetadata,
    pub state: SidecarState,
    pub retention: Retention,
    pub cached_at: DateTime<Utc>,
}

impl CacheSidecar {
    pub fn new(track: TrackMetadata, state: SidecarState, retention: Retention) -> Self {
        Self {
            track,
            state,
            retention,
            cached_at: Utc::now(),
        }
    }

    pub fn with_cached_at(mut self, cached_at: DateTime<Utc>) -> Self {
        self.cached_at = cached_at;
        self
    }

    pub fn is_transient(&self) -> bool {
        self.retention == Retention::Transient
    }

    pub fn is_complete(&self) -> bool {
        self.state == SidecarState::Complete
    }
}

/// A media file found on disk.
#[derive(Debug, Clone)]
pub struct CachedFile {
    pub track_id: String,
    pub media_path: PathBuf,
    /// Size of the media payload
    pub media_bytes: u64,
    /// Media plus sidecar and art
    pub total_bytes: u64,
    /// LRU recency signal
    pub modified: SystemTime,
}

/// Path arithmetic and sidecar I/O for one cache directory.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    pub fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE_NAME)
    }

    /// File stem for a track id.
    pub fn file_stem(track_id: &str) -> String {
        let safe = !track_id.is_empty()
            && track_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if safe {
            format!("{}{}", SAFE_PREFIX, track_id)
        } else {
            format!("{}{}", ENCODED_PREFIX, hex::encode(track_id))
        }
    }

    /// Recover the track id and artifact kind from a file name.
    pub fn parse_file_name(name: &str) -> Option<(String, ArtifactKind)> {
        let (stem, ext) = name.rsplit_once('.')?;
        let kind = ArtifactKind::from_extension(ext)?;

        let track_id = if let Some(encoded) = stem.strip_prefix(ENCODED_PREFIX) {
            String::from_utf8(hex::decode(encoded).ok()?).ok()?
        } else {
            stem.strip_prefix(SAFE_PREFIX)?.to_string()
        };

        (!track_id.is_empty()).then_some((track_id, kind))
    }

    pub fn artifact_path(&self, track_id: &str, kind: ArtifactKind) -> PathBuf {
        self.root
            .join(format!("{}.{}", Self::file_stem(track_id), kind.extension()))
    }

    pub fn media_path(&self, track_id: &str) -> PathBuf {
        self.artifact_path(track_id, ArtifactKind::Media)
    }

    pub fn sidecar_path(&self, track_id: &str) -> PathBuf {
        self.artifact_path(track_id, ArtifactKind::Sidecar)
    }

    pub fn art_path(&self, track_id: &str) -> PathBuf {
        self.artifact_path(track_id, ArtifactKind::Art)
    }

    /// Read the sidecar; `None` when absent.
    pub async fn read_sidecar(&self, track_id: &str) -> Result<Option<CacheSidecar>> {
        let path = self.sidecar_path(track_id);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| CacheError::Validation(format!("unreadable sidecar for {}: {}", track_id, e)))
    }

    pub async fn write_sidecar(&self, sidecar: &CacheSidecar) -> Result<()> {
        let json = serde_json::to_vec_pretty(sidecar)?;
        write_atomic(&self.sidecar_path(&sidecar.track.id), &json).await
    }

    /// Rewrite only the retention of an existing sidecar.
    ///
    /// Returns `false` when there is no sidecar to update.
    pub async fn set_retention(&self, track_id: &str, retention: Retention) -> Result<bool> {
        match self.read_sidecar(track_id).await? {
            Some(sidecar) if sidecar.retention == retention => Ok(true),
            Some(mut sidecar) => {
                sidecar.retention = retention;
                self.write_sidecar(&sidecar).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn write_art(&self, track_id: &str, data: &[u8]) -> Result<()> {
        write_atomic(&self.art_path(track_id), data).await
    }

    /// Size of the media file, `None` when it does not exist.
    pub async fn media_len(&self, track_id: &str) -> Result<Option<u64>> {
        match tokio::fs::metadata(self.media_path(track_id)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every artifact of a track; returns the bytes freed.
    ///
    /// Individual failures are logged and skipped.
    pub async fn delete_artifacts(&self, track_id: &str) -> u64 {
        let mut freed = 0;
        for kind in ArtifactKind::ALL {
            freed += remove_file_quietly(&self.artifact_path(track_id, kind)).await;
        }
        freed
    }

    /// Group every track artifact in the directory by id.
    ///
    /// Only ids with a media file are returned; orphan sidecars and art are
    /// listed separately so callers can tidy them.
    pub async fn scan(&self) -> Result<ScanResult> {
        use std::collections::HashMap;

        let mut media: HashMap<String, CachedFile> = HashMap::new();
        let mut extra: HashMap<String, u64> = HashMap::new();
        let mut orphans = Vec::new();
        let mut temp_files = Vec::new();

        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ScanResult::default()),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(TEMP_SUFFIX) {
                temp_files.push(entry.path());
                continue;
            }
            let Some((track_id, kind)) = Self::parse_file_name(&name) else {
                continue;
            };
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };

            match kind {
                ArtifactKind::Media => {
                    media.insert(
                        track_id.clone(),
                        CachedFile {
                            track_id,
                            media_path: entry.path(),
                            media_bytes: meta.len(),
                            total_bytes: meta.len(),
                            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                        },
                    );
                }
                ArtifactKind::Sidecar | ArtifactKind::Art => {
                    *extra.entry(track_id.clone()).or_default() += meta.len();
                    orphans.push((track_id, entry.path()));
                }
            }
        }

        for (track_id, bytes) in extra {
            if let Some(file) = media.get_mut(&track_id) {
                file.total_bytes += bytes;
            }
        }
        orphans.retain(|(track_id, _)| !media.contains_key(track_id));

        let mut files: Vec<CachedFile> = media.into_values().collect();
        files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.track_id.cmp(&b.track_id)));

        Ok(ScanResult {
            files,
            orphans,
            temp_files,
        })
    }
}

/// Contents of the cache directory, oldest media first.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub files: Vec<CachedFile>,
    /// Sidecars or art whose media file is gone
    pub orphans: Vec<(String, PathBuf)>,
    /// Leftovers of interrupted atomic writes
    pub temp_files: Vec<PathBuf>,
}

impl ScanResult {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.total_bytes).sum()
    }
}

/// Write `data` next to `path` and rename it into place.
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(".{}.{}{}", file_name, Uuid::new_v4(), TEMP_SUFFIX));

    if let Err(e) = tokio::fs::write(&temp, data).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Remove a file, returning its size; missing files count as zero.
pub(crate) async fn remove_file_quietly(path: &Path) -> u64 {
    let len = tokio::fs::metadata(path)
        .await
        .map(|meta| meta.len())
        .unwrap_or(0);

    match tokio::fs::remove_file(path).await {
        Ok(()) => len,
        Err(e) if e.kind() == ErrorKind::NotFound => 0,
        Err(e) => {
            warn!(
                file = %path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
                error = %e,
                "Failed to delete cache file"
            );
            0
        }
    }
}

/// Set a file's modification time to now.
pub(crate) async fn touch(path: &Path) -> Result<bool> {
    let target = path.to_path_buf();
    let touched = tokio::task::spawn_blocking(move || -> Result<bool> {
        match std::fs::OpenOptions::new().write(true).open(&target) {
            Ok(file) => {
                file.set_modified(SystemTime::now())?;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    })
    .await
    .map_err(|e| CacheError::Io(std::io::Error::other(e)))??;

    if touched {
        let name = path.to_string_lossy();
        debug!(file = %strip_path(&name), "Touched cache file");
    }
    Ok(touched)
}
