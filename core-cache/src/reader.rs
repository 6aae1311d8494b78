//! # Progressive Reader
//!
//! Seekable byte stream over a track that may still be downloading.
//!
//! ## Overview
//!
//! `ProgressiveReader` implements [`std::io::Read`] and [`std::io::Seek`] so
//! it can be handed straight to a decoder. Its size is the context's
//! `total_bytes`, not what has arrived so far, so seeking to the end of an
//! unfinished track is well defined.
//!
//! A read that asks for bytes not yet downloaded parks the calling thread on
//! the context's condition variable until the bytes are published or the
//! download ends. If the download fails the read returns `Ok(0)`.
//!
//! Readers block, so call them from a decoder thread or
//! `tokio::task::spawn_blocking`, never directly on an async worker.
//!
//! ## Backing Store
//!
//! Storage is looked up on every read: a buffer preloaded into this reader,
//! then the context's in-memory buffer while the download runs, otherwise
//! the media file. Disk reads are batched to at least `min_disk_read` bytes;
//! memory reads are served as-is.
//!
//! Every open reader is counted on its context; the coordinator never
//! evicts a track that still has readers.

use crate::context::{DownloadContext, DownloadState, RamBuffer};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

/// Default minimum batch for disk-backed reads.
pub const DEFAULT_MIN_DISK_READ: usize = 16 * 1024;

struct OpenFile {
    file: File,
    path: PathBuf,
    attempt: u32,
}

/// Read-ahead bytes from the disk file.
#[derive(Default)]
struct ReadAhead {
    start: u64,
    data: Vec<u8>,
    attempt: u32,
}

impl ReadAhead {
    fn take(&self, position: u64, attempt: u32, buf: &mut [u8]) -> usize {
        if attempt != self.attempt || position < self.start {
            return 0;
        }
        let offset = (position - self.start) as usize;
        if offset >= self.data.len() {
            return 0;
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        n
    }
}

/// Blocking, seekable reader over a [`DownloadContext`].
pub struct ProgressiveReader {
    context: Arc<DownloadContext>,
    position: u64,
    min_disk_read: usize,
    file: Option<OpenFile>,
    read_ahead: ReadAhead,
    /// Whole-file copy owned by this reader and its clones
    preloaded: Option<Arc<RamBuffer>>,
}

impl ProgressiveReader {
    pub fn new(context: Arc<DownloadContext>) -> Self {
        Self::with_min_disk_read(context, DEFAULT_MIN_DISK_READ)
    }

    pub fn with_min_disk_read(context: Arc<DownloadContext>, min_disk_read: usize) -> Self {
        context.reader_opened();
        Self {
            context,
            position: 0,
            min_disk_read: min_disk_read.max(1),
            file: None,
            read_ahead: ReadAhead::default(),
            preloaded: None,
        }
    }

    /// Serve reads from `ram`, a complete copy of the media file.
    pub(crate) fn with_preloaded(mut self, ram: Arc<RamBuffer>) -> Self {
        self.preloaded = Some(ram);
        self
    }

    /// Whether reads are currently served from memory.
    pub fn is_memory_backed(&self) -> bool {
        self.preloaded.is_some() || self.context.ram_buffer().is_some()
    }

    pub fn context(&self) -> &Arc<DownloadContext> {
        &self.context
    }

    /// Final size of the stream; 0 while the total is unknown.
    pub fn size(&self) -> u64 {
        self.context.total_bytes().max(0) as u64
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Independent reader at the same position.
    ///
    /// A disk-backed clone opens its own file handle on first read; a
    /// memory-backed clone shares the same buffer.
    pub fn try_clone(&self) -> Self {
        self.context.reader_opened();
        Self {
            context: Arc::clone(&self.context),
            position: self.position,
            min_disk_read: self.min_disk_read,
            file: None,
            read_ahead: ReadAhead::default(),
            preloaded: self.preloaded.clone(),
        }
    }

    fn memory(&self) -> Option<Arc<RamBuffer>> {
        self.preloaded
            .clone()
            .or_else(|| self.context.ram_buffer())
    }

    /// End of the range a read at `position` for `len` bytes must wait for.
    ///
    /// With an exact length the range is clamped to it; with a placeholder
    /// length the real end is only known once the download completes.
    fn wanted_end(ctx: &DownloadContext, position: u64, len: u64) -> u64 {
        let end = position.saturating_add(len);
        if ctx.is_length_exact() && ctx.total_bytes() >= 0 {
            end.min(ctx.total_bytes() as u64)
        } else {
            end
        }
    }

    /// Park until `[position, wanted_end)` is downloaded or the context is
    /// terminal. Returns the attempt the bytes belong to.
    fn wait_for(&self, len: u64) -> u32 {
        let position = self.position;
        let mut observed = self.context.attempt();
        self.context.block_until(|ctx| {
            observed = ctx.attempt();
            if ctx.is_terminal() {
                return true;
            }
            let downloaded = ctx.downloaded_bytes().max(0) as u64;
            let end = Self::wanted_end(ctx, position, len);
            ctx.state() == DownloadState::Downloading && downloaded >= end
        });
        observed
    }

    fn read_from_disk(&mut self, attempt: u32, available: u64, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_ahead.take(self.position, attempt, buf);
        if n > 0 {
            return Ok(n);
        }

        let Some(path) = self.context.file_path() else {
            return Ok(0);
        };

        let reopen = match &self.file {
            Some(open) => open.attempt != attempt || open.path != path,
            None => true,
        };
        if reopen {
            let file = match File::open(&path) {
                Ok(file) => file,
                // The attempt was torn down underneath us.
                Err(_) if self.context.attempt() != attempt || self.context.is_terminal() => {
                    return Ok(0)
                }
                Err(e) => return Err(e),
            };
            self.file = Some(OpenFile {
                file,
                path,
                attempt,
            });
        }
        let Some(open) = self.file.as_mut() else {
            return Ok(0);
        };

        let remaining = available.saturating_sub(self.position);
        let batch = (buf.len().max(self.min_disk_read) as u64).min(remaining) as usize;
        if batch == 0 {
            return Ok(0);
        }

        let mut data = vec![0u8; batch];
        open.file.seek(SeekFrom::Start(self.position))?;
        let mut filled = 0;
        while filled < batch {
            match open.file.read(&mut data[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        data.truncate(filled);

        self.read_ahead = ReadAhead {
            start: self.position,
            data,
            attempt,
        };
        Ok(self.read_ahead.take(self.position, attempt, buf))
    }
}

impl Read for ProgressiveReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let attempt = self.wait_for(buf.len() as u64);
        let ctx = Arc::clone(&self.context);

        let available = match ctx.state() {
            DownloadState::Failed => return Ok(0),
            _ => ctx.downloaded_bytes().max(0) as u64,
        };
        if self.position >= available {
            return Ok(0);
        }

        let end = Self::wanted_end(&ctx, self.position, buf.len() as u64).min(available);
        let want = (end - self.position) as usize;
        let buf = &mut buf[..want];

        let mut read = 0;
        while read < want {
            let n = match self.memory() {
                Some(ram) => ram.read_at(self.position, &mut buf[read..]),
                None => self.read_from_disk(attempt, available, &mut buf[read..])?,
            };
            if n == 0 {
                break;
            }
            read += n;
            self.position += n as u64;
        }

        // The attempt was abandoned while copying; the bytes may be stale.
        if ctx.attempt() != attempt {
            self.position -= read as u64;
            self.read_ahead = ReadAhead::default();
            return self.read(buf);
        }

        Ok(read)
    }
}

impl Seek for ProgressiveReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.size() as i128;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(offset) => size + offset as i128,
            SeekFrom::Current(offset) => self.position as i128 + offset as i128,
        };

        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of stream",
            ));
        }

        // Past-the-end seeks clamp to the size once it is known.
        let clamped = if size > 0 { target.min(size) } else { target };
        self.position = clamped as u64;
        Ok(self.position)
    }
}

impl Clone for ProgressiveReader {
    fn clone(&self) -> Self {
        self.try_clone()
    }
}

impl Drop for ProgressiveReader {
    fn drop(&mut self) {
        self.context.reader_closed();
    }
}

impl std::fmt::Debug for ProgressiveReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressiveReader")
            .field("track_id", &self.context.track_id())
            .field("position", &self.position)
            .field("size", &self.size())
            .finish()
    }
}
