//! Shared fakes for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::http::{HttpRequest, HttpResponse, StreamingResponse};
use bridge_traits::{BridgeError, Catalog, HttpClient, SystemClock, TrackMetadata};
use bytes::Bytes;
use core_cache::{CacheConfig, CacheDeps, CacheSettings, DownloadCoordinator, StaticSettings};
use core_runtime::events::EventBus;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Deterministic payload for a track.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

pub fn track(id: &str) -> TrackMetadata {
    TrackMetadata::new(id)
        .with_title(format!("Song {}", id))
        .with_artist("Artist")
        .with_album("Album")
}

pub fn temp_cache_dir() -> PathBuf {
    std::env::temp_dir().join(format!("core-cache-it-{}", Uuid::new_v4()))
}

/// Scripted media server doubling as the catalog.
///
/// Bodies are served in `chunk_size` pieces. When gated, every chunk waits
/// for a permit released by the test.
pub struct FakeServer {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    statuses: Mutex<HashMap<String, u16>>,
    /// Stream requests that break off after the first chunk, per id
    broken_streams: Mutex<HashMap<String, u32>>,
    /// Stream requests that go silent after the first chunk, per id
    stalled_streams: Mutex<HashMap<String, u32>>,
    metadata: Mutex<HashMap<String, TrackMetadata>>,
    send_length: Mutex<bool>,
    chunk_size: usize,
    gate: Option<Arc<Semaphore>>,
    stream_requests: AtomicUsize,
    art_requests: AtomicUsize,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::build(16 * 1024, None)
    }

    /// Server whose chunks are only sent after [`release`](Self::release).
    pub fn gated(chunk_size: usize) -> Self {
        Self::build(chunk_size, Some(Arc::new(Semaphore::new(0))))
    }

    fn build(chunk_size: usize, gate: Option<Arc<Semaphore>>) -> Self {
        Self {
            bodies: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            broken_streams: Mutex::new(HashMap::new()),
            stalled_streams: Mutex::new(HashMap::new()),
            metadata: Mutex::new(HashMap::new()),
            send_length: Mutex::new(true),
            chunk_size,
            gate,
            stream_requests: AtomicUsize::new(0),
            art_requests: AtomicUsize::new(0),
        }
    }

    pub fn with_body(self, id: &str, body: Vec<u8>) -> Self {
        self.bodies.lock().insert(id.to_string(), body);
        self
    }

    pub fn with_status(self, id: &str, status: u16) -> Self {
        self.statuses.lock().insert(id.to_string(), status);
        self
    }

    /// The next `count` streams for `id` fail after one chunk.
    pub fn with_broken_streams(self, id: &str, count: u32) -> Self {
        self.broken_streams.lock().insert(id.to_string(), count);
        self
    }

    /// The next `count` streams for `id` send one chunk and then nothing,
    /// without closing.
    pub fn with_stalled_streams(self, id: &str, count: u32) -> Self {
        self.stalled_streams.lock().insert(id.to_string(), count);
        self
    }

    pub fn with_metadata(self, track: TrackMetadata) -> Self {
        self.metadata.lock().insert(track.id.clone(), track);
        self
    }

    pub fn without_content_length(self) -> Self {
        *self.send_length.lock() = false;
        self
    }

    /// Let `chunks` more chunks through the gate.
    pub fn release(&self, chunks: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(chunks);
        }
    }

    pub fn open_gate(&self) {
        self.release(Semaphore::MAX_PERMITS / 2);
    }

    pub fn stream_requests(&self) -> usize {
        self.stream_requests.load(Ordering::SeqCst)
    }

    pub fn art_requests(&self) -> usize {
        self.art_requests.load(Ordering::SeqCst)
    }

    /// Consume one scripted fault for `id`, if any remain.
    fn take_one(faults: &Mutex<HashMap<String, u32>>, id: &str) -> bool {
        match faults.lock().get_mut(id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn id_from(url: &str, prefix: &str) -> Option<String> {
        url.strip_prefix(prefix).map(str::to_string)
    }
}

#[async_trait]
impl HttpClient for FakeServer {
    async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        self.art_requests.fetch_add(1, Ordering::SeqCst);
        let status = match Self::id_from(&request.url, "fake://art/") {
            Some(_) => 200,
            None => 404,
        };
        Ok(HttpResponse {
            status,
            headers: HashMap::new(),
            body: Bytes::from_static(b"\x89PNG fake cover"),
        })
    }

    async fn get_stream(&self, request: HttpRequest) -> BridgeResult<StreamingResponse> {
        self.stream_requests.fetch_add(1, Ordering::SeqCst);
        let id = Self::id_from(&request.url, "fake://stream/")
            .ok_or_else(|| BridgeError::OperationFailed(format!("unexpected url {}", request.url)))?;

        if let Some(status) = self.statuses.lock().get(&id).copied() {
            return Ok(StreamingResponse {
                status,
                headers: HashMap::new(),
                content_length: None,
                body: futures::stream::empty().boxed(),
            });
        }

        let body = self.bodies.lock().get(&id).cloned().unwrap_or_default();
        let broken = Self::take_one(&self.broken_streams, &id);
        let stalled = Self::take_one(&self.stalled_streams, &id);

        let mut chunks: Vec<BridgeResult<Bytes>> = body
            .chunks(self.chunk_size)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        if broken {
            chunks.truncate(1);
            chunks.push(Err(BridgeError::Network("connection reset by peer".to_string())));
        } else if stalled {
            chunks.truncate(1);
        }

        let gate = self.gate.clone();
        let stream = futures::stream::iter(chunks).then(move |chunk| {
            let gate = gate.clone();
            async move {
                if let Some(gate) = gate {
                    if let Ok(permit) = gate.acquire().await {
                        permit.forget();
                    }
                }
                chunk
            }
        });

        let body_stream = if stalled {
            stream.chain(futures::stream::pending()).boxed()
        } else {
            stream.boxed()
        };

        Ok(StreamingResponse {
            status: 200,
            headers: HashMap::new(),
            content_length: self.send_length.lock().then_some(body.len() as u64),
            body: body_stream,
        })
    }
}

#[async_trait]
impl Catalog for FakeServer {
    async fn fetch_track_metadata(&self, id: &str) -> BridgeResult<TrackMetadata> {
        self.metadata
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::OperationFailed(format!("unknown track {}", id)))
    }

    fn stream_url(&self, id: &str) -> String {
        format!("fake://stream/{}", id)
    }

    fn cover_art_url(&self, cover_art_id: &str) -> String {
        format!("fake://art/{}", cover_art_id)
    }
}

/// A started coordinator over a fresh temp directory.
pub struct Harness {
    pub dir: PathBuf,
    pub server: Arc<FakeServer>,
    pub settings: Arc<StaticSettings>,
    pub events: EventBus,
    pub coordinator: DownloadCoordinator,
}

pub fn test_config() -> CacheConfig {
    CacheConfig::default()
        .with_retry_delay(Duration::from_millis(20))
        .with_index_flush_interval(Duration::from_millis(100))
        .with_drip_rate(64 * 1024 * 1024)
}

impl Harness {
    pub async fn start(server: FakeServer, settings: CacheSettings) -> Self {
        Self::start_with(server, settings, test_config()).await
    }

    pub async fn start_with(server: FakeServer, settings: CacheSettings, config: CacheConfig) -> Self {
        Self::start_in(temp_cache_dir(), Arc::new(server), settings, config).await
    }

    /// Start over an existing directory, e.g. to simulate a restart.
    pub async fn start_in(
        dir: PathBuf,
        server: Arc<FakeServer>,
        settings: CacheSettings,
        config: CacheConfig,
    ) -> Self {
        let settings = Arc::new(StaticSettings::new(settings));
        let events = EventBus::new(256);
        let deps = CacheDeps {
            cache_dir: dir.clone(),
            http_client: server.clone(),
            catalog: server.clone(),
            settings: settings.clone(),
            clock: Arc::new(SystemClock),
            events: events.clone(),
        };
        let coordinator = DownloadCoordinator::new(deps, config).unwrap();
        coordinator.start().await.unwrap();

        Self {
            dir,
            server,
            settings,
            events,
            coordinator,
        }
    }

    pub async fn stop(self) -> PathBuf {
        self.coordinator.shutdown().await.unwrap();
        self.dir
    }

    pub async fn cleanup(self) {
        let dir = self.stop().await;
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}

/// File names in `dir`, sorted.
pub async fn list_dir(dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    if let Ok(mut entries) = tokio::fs::read_dir(dir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    names
}

/// Receive events until one matches `matches`.
pub async fn wait_for_event(
    rx: &mut tokio::sync::broadcast::Receiver<core_runtime::events::CoreEvent>,
    mut matches: impl FnMut(&core_runtime::events::CoreEvent) -> bool,
) -> core_runtime::events::CoreEvent {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event bus closed: {}", e),
            }
        }
    })
    .await
    .expect("event within timeout")
}

/// Wait for the completion notification of `track_id`.
pub async fn wait_completed(rx: &mut tokio::sync::broadcast::Receiver<String>, track_id: &str) {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            match rx.recv().await {
                Ok(id) if id == track_id => return,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("completion stream closed: {}", e),
            }
        }
    })
    .await
    .expect("completion within timeout")
}

/// Read a reader to the end on a blocking thread.
pub async fn read_all(mut reader: core_cache::ProgressiveReader) -> Vec<u8> {
    tokio::time::timeout(
        TIMEOUT,
        tokio::task::spawn_blocking(move || {
            use std::io::Read;
            let mut out = Vec::new();
            reader.read_to_end(&mut out).map(|_| out)
        }),
    )
    .await
    .expect("read within timeout")
    .unwrap()
    .unwrap()
}

/// Every field value logged while installed, rendered as text.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<String>>>);

impl LogCapture {
    /// Capture events on the current thread until the guard is dropped.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        use tracing_subscriber::layer::SubscriberExt;
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    pub fn values(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for LogCapture {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        struct Values<'a>(&'a mut Vec<String>);

        impl tracing::field::Visit for Values<'_> {
            fn record_debug(&mut self, _field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                self.0.push(format!("{:?}", value));
            }

            fn record_str(&mut self, _field: &tracing::field::Field, value: &str) {
                self.0.push(value.to_string());
            }
        }

        let mut values = self.0.lock();
        event.record(&mut Values(&mut values));
    }
}
