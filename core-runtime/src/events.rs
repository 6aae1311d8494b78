//! # Event Bus System
//!
//! Typed notifications from the cache engine, fanned out over
//! `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! - **Event Types**: [`CoreEvent`] wraps per-domain enums ([`DownloadEvent`],
//!   [`CacheEvent`])
//! - **EventBus**: cloneable sender side; `emit` never blocks
//! - **EventStream**: receiver wrapper with an optional predicate
//!
//! ```text
//! ┌──────────────────┐   emit   ┌──────────┐  subscribe  ┌────────────────┐
//! │DownloadCoordinator├────────>│ EventBus ├────────────>│ prefetch / UI  │
//! └──────────────────┘          └──────────┘             └────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, DownloadEvent, EventBus, EventStream};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(64);
//! let mut completions = EventStream::new(bus.subscribe())
//!     .filter(|event| matches!(event, CoreEvent::Download(DownloadEvent::Completed { .. })));
//!
//! bus.emit(CoreEvent::Download(DownloadEvent::Completed {
//!     track_id: "42".to_string(),
//!     bytes: 1_000_000,
//!     from_cache: false,
//! }))
//! .ok();
//!
//! let event = completions.recv().await.unwrap();
//! assert_eq!(event.track_id(), Some("42"));
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber fell `n` events behind. Non-fatal.
//! - **`RecvError::Closed`**: every sender is gone; treat as shutdown.
//!
//! `emit` fails only when nobody is subscribed, which publishers ignore.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum published through the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Per-track download lifecycle
    Download(DownloadEvent),
    /// Cache directory and index housekeeping
    Cache(CacheEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Download(e) => e.description(),
            CoreEvent::Cache(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Download(DownloadEvent::Failed { .. }) => EventSeverity::Error,
            CoreEvent::Download(DownloadEvent::AttemptFailed { .. }) => EventSeverity::Warning,
            CoreEvent::Download(DownloadEvent::Completed { .. }) => EventSeverity::Info,
            CoreEvent::Cache(CacheEvent::Cleared { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }

    /// Track the event refers to, if it is about a single track.
    pub fn track_id(&self) -> Option<&str> {
        match self {
            CoreEvent::Download(e) => Some(e.track_id()),
            CoreEvent::Cache(CacheEvent::Evicted { track_id, .. }) => Some(track_id),
            CoreEvent::Cache(_) => None,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Download Events
// ============================================================================

/// Events emitted by the download coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum DownloadEvent {
    /// Track was placed on the bulk download queue.
    Queued { track_id: String },
    /// A worker picked the track up.
    Started {
        track_id: String,
        /// Whether the cached copy is disposable scratch space.
        transient: bool,
    },
    /// The track is fully available on disk.
    Completed {
        track_id: String,
        bytes: u64,
        /// Served from an existing cache file without touching the network.
        from_cache: bool,
    },
    /// One attempt failed; another will follow after the retry delay.
    AttemptFailed {
        track_id: String,
        attempt: u32,
        message: String,
    },
    /// Every attempt failed; the context is terminal.
    Failed {
        track_id: String,
        attempts: u32,
        message: String,
    },
}

impl DownloadEvent {
    fn description(&self) -> &str {
        match self {
            DownloadEvent::Queued { .. } => "Download queued",
            DownloadEvent::Started { .. } => "Download started",
            DownloadEvent::Completed { .. } => "Download completed",
            DownloadEvent::AttemptFailed { .. } => "Download attempt failed",
            DownloadEvent::Failed { .. } => "Download failed",
        }
    }

    fn track_id(&self) -> &str {
        match self {
            DownloadEvent::Queued { track_id }
            | DownloadEvent::Started { track_id, .. }
            | DownloadEvent::Completed { track_id, .. }
            | DownloadEvent::AttemptFailed { track_id, .. }
            | DownloadEvent::Failed { track_id, .. } => track_id,
        }
    }
}

// ============================================================================
// Cache Events
// ============================================================================

/// Why an entry left the cache.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EvictionReason {
    /// Oldest entry while the cache was over its byte budget
    OverBudget,
    /// Transient entry removed by a sweep
    TransientSweep,
    /// Removed by an explicit user action
    UserRequest,
    /// Left behind by an interrupted download
    Corrupt,
}

/// Events about the cache directory as a whole.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum CacheEvent {
    /// A cached entry and its sidecars were deleted.
    Evicted {
        track_id: String,
        reason: EvictionReason,
    },
    /// A clean/clear pass finished.
    Cleared {
        removed: usize,
        kept: usize,
    },
    /// The index snapshot was written to disk.
    IndexFlushed { entries: usize },
}

impl CacheEvent {
    fn description(&self) -> &str {
        match self {
            CacheEvent::Evicted { .. } => "Cache entry evicted",
            CacheEvent::Cleared { .. } => "Cache cleared",
            CacheEvent::IndexFlushed { .. } => "Cache index flushed",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Slow subscribers receive `RecvError::Lagged` instead of slowing the
/// publisher down.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an
    /// error if there are none.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber; past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with optional filtering.
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` are returned by `recv`/`try_recv`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn accepts(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Receives the next event that passes the filter.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.accepts(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive a matching event without waiting.
    ///
    /// Returns `None` if no matching event is currently buffered.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.accepts(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
