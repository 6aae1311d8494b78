//! # Download Context
//!
//! Per-track state shared between exactly one download worker (the writer)
//! and any number of [`ProgressiveReader`](crate::reader::ProgressiveReader)s.
//!
//! ## State Machine
//!
//! ```text
//! Pending ──> Downloading ──> Complete
//!    ^             │
//!    └── retry ────┤
//!                  └────────> Failed
//! ```
//!
//! `Complete` and `Failed` are terminal. A failed attempt that will be
//! retried goes back to `Pending` with `downloaded_bytes` reset to zero and
//! the attempt counter bumped, so readers know their file handle is stale.
//!
//! ## Synchronization
//!
//! Byte counters and state are atomics. Waiting is done on a
//! [`ProgressSignal`]: blocking readers park on a condition variable, async
//! waiters await a `watch` channel. The in-memory buffer, when present, is a
//! [`RamBuffer`] whose lock guards only the chunk list, never a copy.

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Lifecycle of a download context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DownloadState {
    Pending = 0,
    Downloading = 1,
    Complete = 2,
    Failed = 3,
}

impl DownloadState {
    /// `Complete` and `Failed` are never left.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadState::Complete | DownloadState::Failed)
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => DownloadState::Pending,
            1 => DownloadState::Downloading,
            2 => DownloadState::Complete,
            _ => DownloadState::Failed,
        }
    }
}

/// Wake-up primitive for readers waiting on new bytes.
///
/// Every publish bumps a generation counter under the mutex, so a waiter
/// that evaluates its condition while holding the same mutex cannot miss a
/// wake-up.
pub(crate) struct ProgressSignal {
    generation: Mutex<u64>,
    condvar: Condvar,
    watch: watch::Sender<u64>,
}

impl ProgressSignal {
    fn new() -> Self {
        let (watch, _) = watch::channel(0);
        Self {
            generation: Mutex::new(0),
            condvar: Condvar::new(),
            watch,
        }
    }

    fn notify(&self) {
        let generation = {
            let mut guard = self.generation.lock();
            *guard += 1;
            *guard
        };
        self.condvar.notify_all();
        self.watch.send_replace(generation);
    }

    /// Park the current thread until `ready` returns true.
    fn block_until(&self, mut ready: impl FnMut() -> bool) {
        let mut guard = self.generation.lock();
        while !ready() {
            self.condvar.wait(&mut guard);
        }
    }

    /// Await until `ready` returns true.
    async fn wait_until(&self, mut ready: impl FnMut() -> bool) {
        let mut rx = self.watch.subscribe();
        loop {
            if ready() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Await the next publish, or `limit`, whichever comes first.
    async fn changed_within(&self, limit: Duration) {
        let mut rx = self.watch.subscribe();
        let _ = tokio::time::timeout(limit, rx.changed()).await;
    }
}

/// Append-only in-memory copy of a download.
///
/// The writer appends `Bytes` chunks; readers locate the chunks covering a
/// range under the lock and copy them after releasing it.
#[derive(Default)]
pub struct RamBuffer {
    inner: Mutex<RamChunks>,
}

#[derive(Default)]
struct RamChunks {
    chunks: Vec<Bytes>,
    /// Start offset of each chunk
    offsets: Vec<u64>,
    len: u64,
    sealed: bool,
}

impl RamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a complete payload, e.g. a cached file preloaded for playback.
    pub fn from_bytes(data: Bytes) -> Self {
        let buffer = Self::new();
        buffer.append(data);
        buffer.seal();
        buffer
    }

    pub(crate) fn append(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        let start = inner.len;
        inner.len += chunk.len() as u64;
        inner.offsets.push(start);
        inner.chunks.push(chunk);
    }

    /// No more bytes will be appended.
    pub(crate) fn seal(&self) {
        self.inner.lock().sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.lock().sealed
    }

    pub fn len(&self) -> u64 {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Chunk views covering `[offset, offset + len)`, clamped to the data held.
    fn slices(&self, offset: u64, len: u64) -> Vec<Bytes> {
        let inner = self.inner.lock();
        if offset >= inner.len || len == 0 {
            return Vec::new();
        }
        let end = (offset + len).min(inner.len);
        let first = match inner.offsets.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };

        let mut slices = Vec::new();
        for (chunk, &start) in inner.chunks[first..].iter().zip(&inner.offsets[first..]) {
            if start >= end {
                break;
            }
            let from = offset.saturating_sub(start) as usize;
            let to = ((end - start) as usize).min(chunk.len());
            slices.push(chunk.slice(from..to));
        }
        slices
    }

    /// Copy bytes starting at `offset` into `buf`; returns the count copied.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        for slice in self.slices(offset, buf.len() as u64) {
            buf[copied..copied + slice.len()].copy_from_slice(&slice);
            copied += slice.len();
        }
        copied
    }

    /// Contiguous copy of `[offset, offset + len)`, clamped to the data held.
    pub fn copy_range(&self, offset: u64, len: u64) -> Bytes {
        let slices = self.slices(offset, len);
        if slices.len() == 1 {
            return slices.into_iter().next().unwrap_or_default();
        }
        let mut out = BytesMut::with_capacity(slices.iter().map(Bytes::len).sum());
        for slice in slices {
            out.extend_from_slice(&slice);
        }
        out.freeze()
    }
}

impl std::fmt::Debug for RamBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("RamBuffer")
            .field("len", &inner.len)
            .field("chunks", &inner.chunks.len())
            .field("sealed", &inner.sealed)
            .finish()
    }
}

#[derive(Default)]
struct Storage {
    file_path: Option<PathBuf>,
    ram: Option<Arc<RamBuffer>>,
}

/// Mutable state of one track download.
pub struct DownloadContext {
    track_id: String,
    total_bytes: AtomicI64,
    /// `total_bytes` came from Content-Length rather than the fallback guess
    length_exact: AtomicBool,
    downloaded_bytes: AtomicI64,
    state: AtomicU8,
    attempt: AtomicU32,
    /// Set when a non-transient request joined a transient download
    keep_permanent: AtomicBool,
    /// Live [`ProgressiveReader`](crate::reader::ProgressiveReader)s
    readers: AtomicUsize,
    storage: RwLock<Storage>,
    signal: ProgressSignal,
}

impl DownloadContext {
    pub(crate) fn new(track_id: impl Into<String>) -> Self {
        Self {
            track_id: track_id.into(),
            total_bytes: AtomicI64::new(-1),
            length_exact: AtomicBool::new(false),
            downloaded_bytes: AtomicI64::new(0),
            state: AtomicU8::new(DownloadState::Pending as u8),
            attempt: AtomicU32::new(1),
            keep_permanent: AtomicBool::new(false),
            readers: AtomicUsize::new(0),
            storage: RwLock::new(Storage::default()),
            signal: ProgressSignal::new(),
        }
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    /// Declared or assumed size; -1 while unknown.
    pub fn total_bytes(&self) -> i64 {
        self.total_bytes.load(Ordering::Acquire)
    }

    /// Whether `total_bytes` is the server's declared length.
    pub fn is_length_exact(&self) -> bool {
        self.length_exact.load(Ordering::Acquire)
    }

    pub fn downloaded_bytes(&self) -> i64 {
        self.downloaded_bytes.load(Ordering::Acquire)
    }

    pub fn state(&self) -> DownloadState {
        DownloadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// 1-based attempt number; bumps each time a failed attempt is retried.
    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::Acquire)
    }

    /// Fraction downloaded, when the total is known.
    pub fn progress(&self) -> Option<f64> {
        let total = self.total_bytes();
        if total <= 0 {
            return None;
        }
        Some((self.downloaded_bytes() as f64 / total as f64).min(1.0))
    }

    pub fn file_path(&self) -> Option<PathBuf> {
        self.storage.read().file_path.clone()
    }

    pub fn ram_buffer(&self) -> Option<Arc<RamBuffer>> {
        self.storage.read().ram.clone()
    }

    /// Readers currently open over this context.
    pub fn reader_count(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    pub(crate) fn reader_opened(&self) {
        self.readers.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn reader_closed(&self) {
        self.readers.fetch_sub(1, Ordering::AcqRel);
    }

    /// Block the calling thread until `ready` holds.
    ///
    /// `ready` is re-evaluated after every published change.
    pub fn block_until(&self, mut ready: impl FnMut(&Self) -> bool) {
        self.signal.block_until(|| ready(self));
    }

    /// Await until `ready` holds.
    pub async fn wait_until(&self, mut ready: impl FnMut(&Self) -> bool) {
        self.signal.wait_until(|| ready(self)).await;
    }

    /// Await a terminal state and return it.
    pub async fn wait_terminal(&self) -> DownloadState {
        self.wait_until(|ctx| ctx.is_terminal()).await;
        self.state()
    }

    pub(crate) async fn changed_within(&self, limit: Duration) {
        self.signal.changed_within(limit).await;
    }

    pub(crate) fn notify(&self) {
        self.signal.notify();
    }

    pub(crate) fn request_permanent(&self) {
        self.keep_permanent.store(true, Ordering::Release);
    }

    pub(crate) fn wants_permanent(&self) -> bool {
        self.keep_permanent.load(Ordering::Acquire)
    }

    /// Bind storage for a fresh attempt and enter `Downloading`.
    pub(crate) fn begin_attempt(&self, file_path: PathBuf, ram: Option<Arc<RamBuffer>>) {
        {
            let mut storage = self.storage.write();
            storage.file_path = Some(file_path);
            storage.ram = ram;
        }
        self.downloaded_bytes.store(0, Ordering::Release);
        self.state
            .store(DownloadState::Downloading as u8, Ordering::Release);
        self.notify();
    }

    pub(crate) fn set_total(&self, total: u64, exact: bool) {
        self.total_bytes.store(total as i64, Ordering::Release);
        self.length_exact.store(exact, Ordering::Release);
    }

    /// Publish the writer's position and wake waiters.
    pub(crate) fn publish(&self, downloaded: u64) {
        let downloaded = downloaded as i64;
        // An unknown-length body can outgrow its placeholder total.
        if !self.is_length_exact() && downloaded > self.total_bytes() {
            self.total_bytes.store(downloaded, Ordering::Release);
        }
        self.downloaded_bytes.fetch_max(downloaded, Ordering::AcqRel);
        self.notify();
    }

    /// Terminal success; the counters are pinned to the final size.
    ///
    /// The media file now holds every byte, so any in-memory copy is
    /// released and later reads go to disk.
    pub(crate) fn mark_complete(&self, file_path: &Path, bytes: u64) {
        {
            let mut storage = self.storage.write();
            storage.file_path = Some(file_path.to_path_buf());
            storage.ram = None;
        }
        self.total_bytes.store(bytes as i64, Ordering::Release);
        self.length_exact.store(true, Ordering::Release);
        self.downloaded_bytes.store(bytes as i64, Ordering::Release);
        self.state
            .store(DownloadState::Complete as u8, Ordering::Release);
        self.notify();
    }

    /// Drop this attempt's storage and go back to `Pending` for the next one.
    pub(crate) fn reset_for_retry(&self) {
        *self.storage.write() = Storage::default();
        self.downloaded_bytes.store(0, Ordering::Release);
        self.total_bytes.store(-1, Ordering::Release);
        self.length_exact.store(false, Ordering::Release);
        self.attempt.fetch_add(1, Ordering::AcqRel);
        self.state.store(DownloadState::Pending as u8, Ordering::Release);
        self.notify();
    }

    /// Terminal failure; storage is released and blocked readers wake up.
    pub(crate) fn mark_failed(&self) {
        *self.storage.write() = Storage::default();
        self.downloaded_bytes.store(0, Ordering::Release);
        self.state.store(DownloadState::Failed as u8, Ordering::Release);
        self.notify();
    }
}

impl std::fmt::Debug for DownloadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadContext")
            .field("track_id", &self.track_id)
            .field("state", &self.state())
            .field("attempt", &self.attempt())
            .field("downloaded_bytes", &self.downloaded_bytes())
            .field("total_bytes", &self.total_bytes())
            .finish()
    }
}
