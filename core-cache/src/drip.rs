//! RAM-to-disk drip writer
//!
//! In double-buffering mode the download worker appends to a [`RamBuffer`]
//! and a drip writer copies those bytes to the media file at a throttled
//! rate, so disk writes stay a background activity. Once the buffer is
//! sealed or the context is terminal it drains the rest without throttling.

use crate::context::{DownloadContext, RamBuffer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Throttling parameters for the drip writer.
#[derive(Debug, Clone, Copy)]
pub struct DripSettings {
    pub chunk_bytes: usize,
    pub rate_bytes_per_sec: u64,
    /// Longest wait for new bytes before re-checking
    pub idle_poll: Duration,
}

impl DripSettings {
    fn pause_for(&self, bytes: usize) -> Duration {
        Duration::from_secs_f64(bytes as f64 / self.rate_bytes_per_sec.max(1) as f64)
    }
}

/// Spawn a drip writer copying `ram` into the file at `path`.
///
/// The file must already exist; it is written sequentially from offset 0.
/// The task resolves to the number of bytes written.
pub fn spawn_drip_writer(
    context: Arc<DownloadContext>,
    ram: Arc<RamBuffer>,
    path: PathBuf,
    settings: DripSettings,
) -> JoinHandle<std::io::Result<u64>> {
    tokio::spawn(async move { drip(context, ram, path, settings).await })
}

async fn drip(
    context: Arc<DownloadContext>,
    ram: Arc<RamBuffer>,
    path: PathBuf,
    settings: DripSettings,
) -> std::io::Result<u64> {
    let mut file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
    let mut written: u64 = 0;

    loop {
        let finishing = ram.is_sealed() || context.is_terminal();
        let available = ram.len();

        if written < available {
            let len = (available - written).min(settings.chunk_bytes as u64);
            let chunk = ram.copy_range(written, len);
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            trace!(track_id = context.track_id(), written, "Drip wrote chunk");

            if !finishing {
                tokio::time::sleep(settings.pause_for(chunk.len())).await;
            }
        } else if finishing {
            break;
        } else {
            context.changed_within(settings.idle_poll).await;
        }
    }

    file.flush().await?;
    file.sync_data().await?;
    debug!(track_id = context.track_id(), written, "Drip writer drained buffer");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use uuid::Uuid;

    fn settings(rate: u64) -> DripSettings {
        DripSettings {
            chunk_bytes: 1024,
            rate_bytes_per_sec: rate,
            idle_poll: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_drains_everything_after_seal() {
        let path = std::env::temp_dir().join(format!("core-cache-drip-{}.media", Uuid::new_v4()));
        tokio::fs::write(&path, b"").await.unwrap();

        let ctx = Arc::new(DownloadContext::new("1"));
        let ram = Arc::new(RamBuffer::new());
        ctx.begin_attempt(path.clone(), Some(ram.clone()));

        let handle = spawn_drip_writer(ctx.clone(), ram.clone(), path.clone(), settings(1 << 30));

        let data: Vec<u8> = (0..10_000).map(|i| (i % 256) as u8).collect();
        for chunk in data.chunks(3_000) {
            ram.append(Bytes::copy_from_slice(chunk));
            ctx.publish(ram.len());
        }
        ram.seal();
        ctx.notify();

        assert_eq!(handle.await.unwrap().unwrap(), 10_000);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), data);
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_final_drain_is_unthrottled() {
        let path = std::env::temp_dir().join(format!("core-cache-drip-{}.media", Uuid::new_v4()));
        tokio::fs::write(&path, b"").await.unwrap();

        let ctx = Arc::new(DownloadContext::new("1"));
        // 64 KiB at 1 byte/s would take most of a day if throttled.
        let ram = Arc::new(RamBuffer::from_bytes(Bytes::from(vec![9u8; 64 * 1024])));

        let written = tokio::time::timeout(
            Duration::from_secs(5),
            spawn_drip_writer(ctx, ram, path.clone(), settings(1)),
        )
        .await
        .expect("sealed buffer drains without throttling")
        .unwrap()
        .unwrap();

        assert_eq!(written, 64 * 1024);
        let _ = tokio::fs::remove_file(&path).await;
    }
}
