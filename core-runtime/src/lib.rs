//! # Core Runtime Module
//!
//! Runtime infrastructure shared by the media cache crates:
//! - Logging and tracing setup with host log forwarding
//! - Configuration of injected bridges (`CoreConfig`)
//! - Event bus for download and cache notifications
//!
//! ## Overview
//!
//! This crate holds nothing cache specific. It establishes how the engine is
//! wired to its host (catalog, HTTP, settings, clock), how it logs, and how
//! it broadcasts progress to interested subscribers.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use config::{CoreConfig, CoreConfigBuilder};
pub use error::{Error, Result};
pub use events::{CacheEvent, CoreEvent, DownloadEvent, EventBus, EventStream, EvictionReason};
