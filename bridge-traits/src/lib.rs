//! # Host Bridge Traits
//!
//! Capabilities the cache engine needs but does not implement itself.
//!
//! ## Overview
//!
//! This crate defines the contract between the core library and host-specific
//! implementations. Each trait represents a collaborator that lives outside
//! the engine: the network stack, the media server catalog, user settings,
//! wall-clock time and the host's log pipeline.
//!
//! ## Traits
//!
//! ### Networking
//! - [`HttpClient`](http::HttpClient) - Pooled HTTP with buffered and streaming GET
//! - [`Catalog`](catalog::Catalog) - Track records and stream/artwork URLs
//!
//! ### Storage
//! - [`SettingsStore`](storage::SettingsStore) - Key-value preferences storage
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! ## Platform Requirements
//!
//! | Platform | Implementation Crate | Status |
//! |----------|---------------------|--------|
//! | Desktop  | `bridge-desktop`    | ✅ In Progress |
//! | Mobile   | TBD                 | 📋 Planned |
//!
//! ## Error Handling
//!
//! All bridge traits use the [`BridgeError`](error::BridgeError) type. Platform
//! implementations should:
//!
//! - Convert platform-specific errors to `BridgeError`
//! - Use [`BridgeError::Network`](error::BridgeError::Network) for failures a
//!   retry could fix
//! - Provide actionable error messages
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` bounds to support safe concurrent usage
//! across async tasks. Implementations must ensure thread safety.

pub mod catalog;
pub mod error;
pub mod http;
pub mod storage;
pub mod time;

pub use error::BridgeError;

// Re-export commonly used types
pub use catalog::{Catalog, TrackMetadata};
pub use http::{
    ByteStream, HttpClient, HttpMethod, HttpRequest, HttpResponse, RetryPolicy, StreamingResponse,
};
pub use storage::SettingsStore;
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, SystemClock};
