//! # Download Coordinator
//!
//! Accepts download requests, deduplicates them per track, bounds
//! parallelism, and drives the retry loop.
//!
//! ## Overview
//!
//! ```text
//! start_or_join ──┐                      ┌──> DownloadContext ──> ProgressiveReader
//!                 ├─> Semaphore(3) ──> worker
//! enqueue ─> FIFO ┘                      ├──> CacheLayout (media, sidecar, art)
//!                                        ├──> CacheIndex (upsert on success)
//!                                        └──> EvictionPolicy (reclaim on success)
//! ```
//!
//! At most one context is active per track id. A worker first looks for a
//! valid cached file (the fast path, no network). Otherwise it streams the
//! body from the catalog's URL into the media file, or into a
//! [`RamBuffer`] drained to disk by a drip writer when double buffering is
//! on. Failed attempts delete every artifact and are retried after
//! `retry_delay` while attempts remain and the error is transient.
//!
//! `start_or_join` and `enqueue` never fail: callers observe the context.
//!
//! ## Usage
//!
//! ```ignore
//! let coordinator = DownloadCoordinator::new(deps, CacheConfig::default())?;
//! coordinator.start().await?;
//!
//! let ctx = coordinator.start_or_join(track, true);
//! let reader = coordinator.open_reader(ctx);
//! // hand `reader` to the decoder thread
//!
//! coordinator.shutdown().await?;
//! ```

use crate::config::{CacheConfig, CacheSettings, SettingsSource, StoreSettingsSource};
use crate::context::{DownloadContext, DownloadState, RamBuffer};
use crate::drip::{spawn_drip_writer, DripSettings};
use crate::error::{CacheError, Result};
use crate::eviction::{EvictionPolicy, EvictionReport};
use crate::index::{CacheIndex, IndexFlushTask};
use crate::layout::{remove_file_quietly, CacheLayout, CacheSidecar, Retention, SidecarState};
use crate::reader::ProgressiveReader;
use crate::stats::CacheStats;
use bridge_traits::http::HttpRequest;
use bridge_traits::{Catalog, Clock, HttpClient, TrackMetadata};
use bytes::Bytes;
use core_runtime::events::{CacheEvent, CoreEvent, DownloadEvent, EventBus};
use core_runtime::logging::{redact_url, strip_path};
use core_runtime::CoreConfig;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Collaborators the coordinator is built from.
#[derive(Clone)]
pub struct CacheDeps {
    pub cache_dir: PathBuf,
    pub http_client: Arc<dyn HttpClient>,
    pub catalog: Arc<dyn Catalog>,
    pub settings: Arc<dyn SettingsSource>,
    pub clock: Arc<dyn Clock>,
    pub events: EventBus,
}

impl CacheDeps {
    /// Wire the coordinator to the bridges held by a [`CoreConfig`].
    pub fn from_core_config(config: &CoreConfig) -> Self {
        Self {
            cache_dir: config.cache_dir.clone(),
            http_client: Arc::clone(&config.http_client),
            catalog: Arc::clone(&config.catalog),
            settings: Arc::new(StoreSettingsSource::new(Arc::clone(&config.settings_store))),
            clock: Arc::clone(&config.clock),
            events: EventBus::new(config.event_buffer_size),
        }
    }
}

struct QueuedDownload {
    track: TrackMetadata,
    transient: bool,
}

/// How a successful attempt got its bytes.
struct Outcome {
    bytes: u64,
    from_cache: bool,
}

enum Sink {
    Disk(tokio::fs::File),
    Ram(Arc<RamBuffer>),
}

#[derive(Default)]
struct Background {
    flush: Option<IndexFlushTask>,
    drainer: Option<JoinHandle<()>>,
}

pub(crate) struct Inner {
    pub(crate) config: CacheConfig,
    pub(crate) layout: Arc<CacheLayout>,
    pub(crate) index: Arc<CacheIndex>,
    pub(crate) eviction: EvictionPolicy,
    http: Arc<dyn HttpClient>,
    catalog: Arc<dyn Catalog>,
    pub(crate) settings: Arc<dyn SettingsSource>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    active: Mutex<HashMap<String, Arc<DownloadContext>>>,
    /// Ids the player asked to keep, e.g. previous, current and next track
    pinned: Mutex<HashSet<String>>,
    limiter: Arc<Semaphore>,
    queue_tx: mpsc::UnboundedSender<QueuedDownload>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<QueuedDownload>>>,
    completed: broadcast::Sender<String>,
    shutdown: CancellationToken,
    accepting: AtomicBool,
    background: tokio::sync::Mutex<Background>,
}

/// Entry point of the cache engine. Cheap to clone.
#[derive(Clone)]
pub struct DownloadCoordinator {
    pub(crate) inner: Arc<Inner>,
}

impl DownloadCoordinator {
    /// Build a coordinator; nothing touches the disk until [`start`](Self::start).
    pub fn new(deps: CacheDeps, config: CacheConfig) -> Result<Self> {
        config.validate().map_err(CacheError::Config)?;

        let layout = Arc::new(CacheLayout::new(deps.cache_dir));
        let index = Arc::new(CacheIndex::new(layout.index_path()));
        let eviction = EvictionPolicy::new(layout.clone(), index.clone(), deps.events.clone());
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (completed, _) = broadcast::channel(config.completion_buffer_size.max(1));

        Ok(Self {
            inner: Arc::new(Inner {
                limiter: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
                config,
                layout,
                index,
                eviction,
                http: deps.http_client,
                catalog: deps.catalog,
                settings: deps.settings,
                clock: deps.clock,
                events: deps.events,
                active: Mutex::new(HashMap::new()),
                pinned: Mutex::new(HashSet::new()),
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                completed,
                shutdown: CancellationToken::new(),
                accepting: AtomicBool::new(true),
                background: tokio::sync::Mutex::new(Background::default()),
            }),
        })
    }

    /// Build a coordinator from a runtime [`CoreConfig`].
    pub fn from_core_config(core: &CoreConfig, config: CacheConfig) -> Result<Self> {
        Self::new(CacheDeps::from_core_config(core), config)
    }

    /// Reconcile the directory with the index and start background tasks.
    ///
    /// Calling it again is a no-op.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut background = inner.background.lock().await;
        if background.flush.is_some() {
            return Ok(());
        }
        if inner.shutdown.is_cancelled() {
            return Err(CacheError::ShutDown);
        }

        inner.layout.ensure_root().await?;
        inner
            .eviction
            .reconcile(inner.config.min_valid_file_bytes, &inner.in_use())
            .await?;

        background.flush = Some(
            inner
                .index
                .spawn_flush_task(inner.config.index_flush_interval, inner.events.clone()),
        );
        if let Some(rx) = inner.queue_rx.lock().take() {
            background.drainer = Some(tokio::spawn(Inner::drain_queue(Arc::clone(inner), rx)));
        }

        let root = inner.layout.root().to_string_lossy();
        info!(cache_dir = %strip_path(&root), "Download coordinator started");
        Ok(())
    }

    /// Stop accepting work, stop background tasks and flush the index.
    ///
    /// Downloads already running are left to finish.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        let inner = &self.inner;
        inner.accepting.store(false, Ordering::Release);
        inner.shutdown.cancel();

        let mut background = inner.background.lock().await;
        if let Some(flush) = background.flush.take() {
            flush.stop().await;
        }
        if let Some(drainer) = background.drainer.take() {
            if let Err(e) = drainer.await {
                warn!(error = %e, "Download queue drainer ended abnormally");
            }
        }

        let entries = inner.index.flush_now().await?;
        inner
            .events
            .emit(CoreEvent::Cache(CacheEvent::IndexFlushed { entries }))
            .ok();
        info!(entries, "Download coordinator shut down");
        Ok(())
    }

    /// Return the active context for `track.id`, or start a download.
    ///
    /// Concurrent calls for the same id share one context and one network
    /// fetch. Must be called from within a Tokio runtime.
    #[instrument(skip(self, track), fields(track_id = %track.id))]
    pub fn start_or_join(&self, track: TrackMetadata, transient: bool) -> Arc<DownloadContext> {
        Inner::launch(&self.inner, track, transient, None)
    }

    /// Queue tracks for background download without blocking.
    ///
    /// Tracks already active are skipped when their turn comes.
    pub fn enqueue(&self, tracks: Vec<TrackMetadata>, transient: bool) {
        if !self.inner.accepting.load(Ordering::Acquire) {
            warn!(count = tracks.len(), "Coordinator shut down, dropping queued tracks");
            return;
        }

        for track in tracks {
            let track_id = track.id.clone();
            if self
                .inner
                .queue_tx
                .send(QueuedDownload { track, transient })
                .is_ok()
            {
                self.inner.emit(DownloadEvent::Queued { track_id });
            }
        }
    }

    pub fn get_raw_context(&self, track_id: &str) -> Option<Arc<DownloadContext>> {
        self.inner.active.lock().get(track_id).cloned()
    }

    /// Reader over a context, batched to `reader_min_disk_read` on disk.
    pub fn open_reader(&self, context: Arc<DownloadContext>) -> ProgressiveReader {
        ProgressiveReader::with_min_disk_read(context, self.inner.config.reader_min_disk_read)
    }

    /// Replace the set of ids that eviction must skip.
    ///
    /// The player passes the tracks it is playing or about to play. Tracks
    /// with an open reader are skipped whether or not they are listed.
    pub fn set_protected<I, S>(&self, track_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: HashSet<String> = track_ids.into_iter().map(Into::into).collect();
        debug!(count = ids.len(), "Protected set updated");
        *self.inner.pinned.lock() = ids;
    }

    /// Stream of track ids whose download completed (including cache hits).
    pub fn subscribe_completed(&self) -> broadcast::Receiver<String> {
        self.inner.completed.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn index(&self) -> &Arc<CacheIndex> {
        &self.inner.index
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.inner.layout
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Current runtime settings.
    pub async fn settings(&self) -> CacheSettings {
        self.inner.settings.current().await
    }

    /// Delete one cached track. In-flight downloads are left alone.
    #[instrument(skip(self))]
    pub async fn remove_from_cache(&self, track_id: &str) -> Result<bool> {
        {
            let mut active = self.inner.active.lock();
            if let Some(ctx) = active.get(track_id) {
                if !ctx.is_terminal() {
                    warn!("Refusing to delete a track that is still downloading");
                    return Ok(false);
                }
            }
            active.remove(track_id);
        }

        let existed = self.inner.layout.media_len(track_id).await?.is_some()
            || self.inner.index.contains(track_id).await;
        self.inner
            .eviction
            .remove(track_id, core_runtime::events::EvictionReason::UserRequest)
            .await;
        Ok(existed)
    }

    /// Delete every cached track not in `keep` and flush the index.
    ///
    /// Callers that want kept ids to survive a later transient sweep should
    /// promote them first.
    #[instrument(skip(self))]
    pub async fn clear_all(&self, keep: &[String]) -> Result<EvictionReport> {
        let keep = self.inner.protected(keep);
        let report = self.inner.eviction.clear_all(&keep).await?;
        self.inner.finish_sweep(&report);
        Ok(report)
    }

    /// Reclaim space according to the current settings.
    ///
    /// - budget > 0: evict oldest entries until under budget
    /// - budget 0, manual mode: delete transient entries
    /// - budget 0, automatic mode: delete every entry not kept
    #[instrument(skip(self))]
    pub async fn clean_cache(&self, keep: &[String]) -> Result<EvictionReport> {
        let settings = self.inner.settings.current().await;
        let keep = self.inner.protected(keep);

        let report = if settings.is_size_bounded() {
            self.inner
                .eviction
                .enforce_budget(settings.budget_bytes, &keep)
                .await?
        } else if settings.manual_mode {
            self.inner.eviction.clean_transient(&keep).await?
        } else {
            self.inner.eviction.sweep_unkept(&keep).await?
        };

        self.inner.finish_sweep(&report);
        Ok(report)
    }

    /// Refresh a cached file's LRU recency without downloading it again.
    pub async fn touch_cached_file(&self, track_id: &str) -> Result<bool> {
        self.inner.eviction.touch(track_id).await
    }

    /// Turn a transient entry into a permanent one.
    pub async fn promote_transient(&self, track_id: &str) -> Result<bool> {
        if let Some(ctx) = self.get_raw_context(track_id) {
            ctx.request_permanent();
        }
        self.inner.eviction.promote(track_id).await
    }

    /// Mark an entry as disposable.
    pub async fn ensure_transient(&self, track_id: &str) -> Result<bool> {
        self.inner.eviction.ensure_transient(track_id).await
    }

    /// Make every cached entry permanent.
    pub async fn remove_all_transient_markers(&self) -> Result<usize> {
        self.inner.eviction.remove_all_transient_markers().await
    }

    /// Metadata of every cached track, for a cache manager listing.
    pub async fn list_cached(&self) -> Vec<TrackMetadata> {
        self.inner.index.entries().await
    }

    /// Whether a complete copy of the track is on disk.
    pub async fn is_cached(&self, track_id: &str) -> bool {
        match self.get_raw_context(track_id) {
            Some(ctx) if ctx.state() == DownloadState::Complete => true,
            _ => self.inner.index.contains(track_id).await,
        }
    }

    /// Usage figures for the cache directory.
    pub async fn stats(&self) -> Result<CacheStats> {
        let scan = self.inner.layout.scan().await?;
        let settings = self.inner.settings.current().await;

        let mut transient_count = 0;
        for file in &scan.files {
            if let Ok(Some(sidecar)) = self.inner.layout.read_sidecar(&file.track_id).await {
                if sidecar.is_transient() {
                    transient_count += 1;
                }
            }
        }

        Ok(CacheStats {
            entry_count: scan.files.len(),
            total_bytes: scan.total_bytes(),
            budget_bytes: settings.budget_bytes,
            transient_count,
            active_downloads: self.inner.live_ids().len(),
        })
    }
}

impl Inner {
    fn emit(&self, event: DownloadEvent) {
        self.events.emit(CoreEvent::Download(event)).ok();
    }

    /// Ids with a download in flight.
    fn live_ids(&self) -> HashSet<String> {
        self.active
            .lock()
            .iter()
            .filter(|(_, ctx)| !ctx.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Ids eviction must skip: in-flight downloads, tracks with an open
    /// reader and the player's protected set.
    pub(crate) fn in_use(&self) -> HashSet<String> {
        let mut ids: HashSet<String> = self
            .active
            .lock()
            .iter()
            .filter(|(_, ctx)| !ctx.is_terminal() || ctx.reader_count() > 0)
            .map(|(id, _)| id.clone())
            .collect();
        ids.extend(self.pinned.lock().iter().cloned());
        ids
    }

    /// Caller's keep set plus everything in use.
    fn protected(&self, keep: &[String]) -> HashSet<String> {
        let mut protected = self.in_use();
        protected.extend(keep.iter().cloned());
        protected
    }

    /// Forget resident contexts whose files were just deleted.
    fn finish_sweep(&self, report: &EvictionReport) {
        {
            let mut active = self.active.lock();
            for id in &report.removed {
                if active.get(id).is_some_and(|ctx| ctx.is_terminal()) {
                    active.remove(id);
                }
            }
        }
        self.events
            .emit(CoreEvent::Cache(CacheEvent::Cleared {
                removed: report.removed.len(),
                kept: report.kept,
            }))
            .ok();
    }

    fn launch(
        this: &Arc<Self>,
        track: TrackMetadata,
        transient: bool,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Arc<DownloadContext> {
        if !this.accepting.load(Ordering::Acquire) {
            let ctx = Arc::new(DownloadContext::new(track.id));
            ctx.mark_failed();
            return ctx;
        }

        let (ctx, fresh) = {
            let mut active = this.active.lock();
            match active.get(&track.id) {
                Some(existing) if existing.state() != DownloadState::Failed => {
                    (Arc::clone(existing), false)
                }
                _ => {
                    let ctx = Arc::new(DownloadContext::new(track.id.clone()));
                    active.insert(track.id.clone(), Arc::clone(&ctx));
                    (ctx, true)
                }
            }
        };

        if !fresh {
            debug!(track_id = %track.id, state = ?ctx.state(), "Joined active download");
            if !transient {
                ctx.request_permanent();
                if ctx.state() == DownloadState::Complete {
                    let inner = Arc::clone(this);
                    tokio::spawn(async move {
                        if let Err(e) = inner.eviction.promote(&track.id).await {
                            warn!(track_id = %track.id, error = %e, "Failed to promote cached track");
                        }
                    });
                }
            }
            return ctx;
        }

        let worker_ctx = Arc::clone(&ctx);
        tokio::spawn(Self::run(Arc::clone(this), worker_ctx, track, transient, permit));
        ctx
    }

    async fn drain_queue(this: Arc<Self>, mut rx: mpsc::UnboundedReceiver<QueuedDownload>) {
        loop {
            let item = tokio::select! {
                _ = this.shutdown.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let already_active = this
                .active
                .lock()
                .get(&item.track.id)
                .is_some_and(|ctx| ctx.state() != DownloadState::Failed);
            if already_active {
                debug!(track_id = %item.track.id, "Queued track already active, skipping");
                continue;
            }

            // Taking the permit here keeps queued tracks in FIFO order.
            let permit = tokio::select! {
                _ = this.shutdown.cancelled() => break,
                permit = Arc::clone(&this.limiter).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            Self::launch(&this, item.track, item.transient, Some(permit));
        }
        debug!("Download queue drainer stopped");
    }

    #[instrument(skip(self, ctx, track, permit), fields(track_id = %track.id))]
    async fn run(
        self: Arc<Self>,
        ctx: Arc<DownloadContext>,
        mut track: TrackMetadata,
        transient: bool,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let _permit = match permit {
            Some(permit) => permit,
            None => match Arc::clone(&self.limiter).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    self.fail(&ctx, 0, "download limiter closed".to_string());
                    return;
                }
            },
        };

        self.emit(DownloadEvent::Started {
            track_id: track.id.clone(),
            transient,
        });

        loop {
            let attempt = ctx.attempt();
            debug!(attempt, max_attempts = self.config.max_attempts, "Starting download attempt");

            let err = match self.attempt_download(&ctx, &mut track, transient).await {
                Ok(outcome) => {
                    self.succeed(&ctx, outcome).await;
                    return;
                }
                Err(err) => err,
            };

            let freed = self.layout.delete_artifacts(&track.id).await;
            self.index.remove(&track.id).await;
            debug!(freed, "Removed partial artifacts");

            let retry = attempt < self.config.max_attempts
                && err.is_transient()
                && !self.shutdown.is_cancelled();
            if !retry {
                self.fail(&ctx, attempt, err.to_string());
                return;
            }

            warn!(attempt, error = %err, "Download attempt failed, retrying");
            self.emit(DownloadEvent::AttemptFailed {
                track_id: track.id.clone(),
                attempt,
                message: err.to_string(),
            });
            ctx.reset_for_retry();

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.fail(&ctx, attempt, "coordinator shut down during retry delay".to_string());
                    return;
                }
                _ = tokio::time::sleep(self.config.retry_delay) => {}
            }
        }
    }

    async fn succeed(&self, ctx: &Arc<DownloadContext>, outcome: Outcome) {
        let track_id = ctx.track_id().to_string();
        info!(
            bytes = outcome.bytes,
            from_cache = outcome.from_cache,
            "Download complete"
        );
        self.emit(DownloadEvent::Completed {
            track_id: track_id.clone(),
            bytes: outcome.bytes,
            from_cache: outcome.from_cache,
        });
        self.completed.send(track_id.clone()).ok();

        if !outcome.from_cache {
            self.reclaim_space(&track_id).await;
        }
    }

    fn fail(&self, ctx: &Arc<DownloadContext>, attempts: u32, message: String) {
        error!(track_id = ctx.track_id(), attempts, %message, "Download failed");
        {
            let mut active = self.active.lock();
            if active
                .get(ctx.track_id())
                .is_some_and(|current| Arc::ptr_eq(current, ctx))
            {
                active.remove(ctx.track_id());
            }
        }

        ctx.mark_failed();
        self.emit(DownloadEvent::Failed {
            track_id: ctx.track_id().to_string(),
            attempts,
            message,
        });
    }

    /// Size-bounded eviction after a new file landed.
    async fn reclaim_space(&self, just_completed: &str) {
        let settings = self.settings.current().await;
        if !settings.is_size_bounded() {
            return;
        }

        let mut keep = self.in_use();
        keep.insert(just_completed.to_string());
        match self.eviction.enforce_budget(settings.budget_bytes, &keep).await {
            Ok(report) if !report.removed.is_empty() => self.finish_sweep(&report),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Eviction after download failed"),
        }
    }

    async fn attempt_download(
        &self,
        ctx: &Arc<DownloadContext>,
        track: &mut TrackMetadata,
        transient: bool,
    ) -> Result<Outcome> {
        self.layout.ensure_root().await?;
        let settings = self.settings.current().await;

        if let Some(bytes) = self.try_cache_hit(ctx, track, transient, &settings).await? {
            return Ok(Outcome {
                bytes,
                from_cache: true,
            });
        }

        self.repair_metadata(track).await;

        let media_path = self.layout.media_path(&track.id);
        let file = tokio::fs::File::create(&media_path).await?;
        let retention = self.retention_for(ctx, transient, &settings);
        self.layout
            .write_sidecar(
                &CacheSidecar::new(track.clone(), SidecarState::InProgress, retention)
                    .with_cached_at(self.clock.now()),
            )
            .await?;

        let ram = settings
            .ram_double_buffering
            .then(|| Arc::new(RamBuffer::new()));
        ctx.begin_attempt(media_path.clone(), ram.clone());

        let (sink, drip) = match ram {
            Some(ram) => {
                drop(file);
                let drip = spawn_drip_writer(
                    Arc::clone(ctx),
                    Arc::clone(&ram),
                    media_path.clone(),
                    self.drip_settings(),
                );
                (Sink::Ram(ram), Some(drip))
            }
            None => (Sink::Disk(file), None),
        };
        let ram = match &sink {
            Sink::Ram(ram) => Some(Arc::clone(ram)),
            Sink::Disk(_) => None,
        };

        let bytes = match self.transfer(ctx, sink).await {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Some(drip) = drip {
                    drip.abort();
                    let _ = drip.await;
                }
                return Err(e);
            }
        };

        if let (Some(drip), Some(ram)) = (drip, ram) {
            ram.seal();
            ctx.notify();
            let written = drip
                .await
                .map_err(|e| CacheError::Io(std::io::Error::other(e)))??;
            if written != bytes {
                return Err(CacheError::Io(std::io::Error::other(format!(
                    "drip writer stored {} of {} bytes",
                    written, bytes
                ))));
            }
        }

        let retention = self.retention_for(ctx, transient, &settings);
        self.layout
            .write_sidecar(
                &CacheSidecar::new(track.clone(), SidecarState::Complete, retention)
                    .with_cached_at(self.clock.now()),
            )
            .await?;
        self.fetch_cover_art(track).await;

        ctx.mark_complete(&media_path, bytes);
        self.index.upsert(track.clone()).await;

        Ok(Outcome {
            bytes,
            from_cache: false,
        })
    }

    fn retention_for(
        &self,
        ctx: &DownloadContext,
        transient: bool,
        settings: &CacheSettings,
    ) -> Retention {
        if transient && settings.manual_mode && !ctx.wants_permanent() {
            Retention::Transient
        } else {
            Retention::Permanent
        }
    }

    fn drip_settings(&self) -> DripSettings {
        DripSettings {
            chunk_bytes: self.config.drip_chunk_bytes,
            rate_bytes_per_sec: self.config.drip_rate_bytes_per_sec,
            idle_poll: self.config.drip_idle_poll,
        }
    }

    /// Serve the request from an existing file if it is complete.
    ///
    /// A torn or undersized file is deleted and treated as a miss.
    async fn try_cache_hit(
        &self,
        ctx: &DownloadContext,
        track: &mut TrackMetadata,
        transient: bool,
        settings: &CacheSettings,
    ) -> Result<Option<u64>> {
        let Some(len) = self.layout.media_len(&track.id).await? else {
            return Ok(None);
        };

        let sidecar = match self.layout.read_sidecar(&track.id).await {
            Ok(sidecar) => sidecar,
            Err(CacheError::Validation(reason)) => {
                debug!(%reason, "Cached sidecar unreadable, rewriting it");
                None
            }
            Err(e) => return Err(e),
        };

        let torn = sidecar.as_ref().is_some_and(|s| !s.is_complete());
        if torn || len <= self.config.min_valid_file_bytes {
            debug!(len, torn, "Discarding invalid cache file");
            self.layout.delete_artifacts(&track.id).await;
            self.index.remove(&track.id).await;
            return Ok(None);
        }

        let permanent = !transient || ctx.wants_permanent();
        match sidecar {
            Some(mut sidecar) => {
                let mut changed = false;
                if sidecar.track.is_incomplete() {
                    merge_metadata(&mut sidecar.track, track);
                    self.repair_metadata(&mut sidecar.track).await;
                    changed = true;
                }
                if permanent && sidecar.is_transient() {
                    sidecar.retention = Retention::Permanent;
                    changed = true;
                }
                if changed {
                    self.layout.write_sidecar(&sidecar).await?;
                }
                *track = sidecar.track;
            }
            None => {
                self.repair_metadata(track).await;
                let retention = self.retention_for(ctx, transient, settings);
                self.layout
                    .write_sidecar(
                        &CacheSidecar::new(track.clone(), SidecarState::Complete, retention)
                            .with_cached_at(self.clock.now()),
                    )
                    .await?;
            }
        }

        ctx.mark_complete(&self.layout.media_path(&track.id), len);
        self.index.upsert(track.clone()).await;
        Ok(Some(len))
    }

    /// Fill in artist/album from the catalog when missing. Best effort.
    async fn repair_metadata(&self, track: &mut TrackMetadata) {
        if !track.is_incomplete() {
            return;
        }
        match self.lookup_metadata(&track.id).await {
            Ok(full) => merge_metadata(track, &full),
            Err(e) => warn!(track_id = %track.id, error = %e, "Metadata repair failed"),
        }
    }

    async fn lookup_metadata(&self, track_id: &str) -> Result<TrackMetadata> {
        self.catalog
            .fetch_track_metadata(track_id)
            .await
            .map_err(|e| CacheError::Catalog(e.to_string()))
    }

    /// Stream the body into the sink; returns the bytes received.
    async fn transfer(&self, ctx: &DownloadContext, mut sink: Sink) -> Result<u64> {
        let url = self.catalog.stream_url(ctx.track_id());
        debug!(url = %redact_url(&url), "Requesting stream");

        let response = self.http.get_stream(HttpRequest::get(url)).await?;
        if !response.is_success() {
            return Err(CacheError::Http {
                status: response.status,
            });
        }

        match response.content_length.filter(|&len| len > 0) {
            Some(len) => ctx.set_total(len, true),
            None => ctx.set_total(self.config.fallback_content_length, false),
        }

        let mut body = response.body;
        let mut downloaded: u64 = 0;
        let mut unflushed: u64 = 0;

        let idle_timeout = self.config.stream_idle_timeout;
        loop {
            let next = tokio::time::timeout(idle_timeout, body.next())
                .await
                .map_err(|_| {
                    CacheError::Network(format!(
                        "no data for {:?} after {} bytes",
                        idle_timeout, downloaded
                    ))
                })?;
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            for piece in split_chunk(chunk, self.config.network_chunk_size) {
                let n = piece.len() as u64;
                downloaded += n;
                match &mut sink {
                    Sink::Disk(file) => {
                        file.write_all(&piece).await?;
                        unflushed += n;
                        if unflushed >= self.config.flush_threshold(downloaded) {
                            file.flush().await?;
                            ctx.publish(downloaded);
                            unflushed = 0;
                        }
                    }
                    Sink::Ram(ram) => {
                        ram.append(piece);
                        ctx.publish(downloaded);
                    }
                }
            }
        }

        if let Sink::Disk(file) = &mut sink {
            file.flush().await?;
            file.sync_data().await?;
            ctx.publish(downloaded);
        }

        if downloaded == 0 {
            return Err(CacheError::Validation("server returned an empty body".to_string()));
        }
        if ctx.is_length_exact() && downloaded < ctx.total_bytes().max(0) as u64 {
            return Err(CacheError::Network(format!(
                "connection closed after {} of {} bytes",
                downloaded,
                ctx.total_bytes()
            )));
        }
        Ok(downloaded)
    }

    /// Store the cover art next to the media. Failures only cost the art.
    async fn fetch_cover_art(&self, track: &TrackMetadata) {
        let Some(cover_art_id) = track.cover_art_id.as_deref() else {
            return;
        };
        let url = self.catalog.cover_art_url(cover_art_id);
        let art_path = self.layout.art_path(&track.id);

        match self.http.execute(HttpRequest::get(url)).await {
            Ok(response) if response.is_success() && !response.body.is_empty() => {
                if let Err(e) = self.layout.write_art(&track.id, &response.body).await {
                    warn!(error = %e, "Failed to store cover art");
                    remove_file_quietly(&art_path).await;
                }
            }
            Ok(response) => {
                debug!(status = response.status, "Cover art unavailable");
                remove_file_quietly(&art_path).await;
            }
            Err(e) => {
                debug!(error = %e, "Cover art fetch failed");
                remove_file_quietly(&art_path).await;
            }
        }
    }
}

/// Copy blank fields of `target` from `source`, keeping the id.
fn merge_metadata(target: &mut TrackMetadata, source: &TrackMetadata) {
    fn fill(field: &mut String, value: &str) {
        if field.trim().is_empty() && !value.trim().is_empty() {
            *field = value.to_string();
        }
    }
    fill(&mut target.title, &source.title);
    fill(&mut target.artist, &source.artist);
    fill(&mut target.album, &source.album);
    if target.cover_art_id.is_none() {
        target.cover_art_id = source.cover_art_id.clone();
    }
    if target.duration_secs.is_none() {
        target.duration_secs = source.duration_secs;
    }
}

/// Split a network chunk into pieces of at most `max` bytes without copying.
fn split_chunk(chunk: Bytes, max: usize) -> impl Iterator<Item = Bytes> {
    let max = max.max(1);
    let len = chunk.len();
    (0..len)
        .step_by(max)
        .map(move |start| chunk.slice(start..(start + max).min(len)))
}
