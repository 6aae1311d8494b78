//! Workspace facade crate.
//!
//! Re-exports the member crates so host applications can depend on
//! `media-cache-workspace` alone and pick platform adapters with features:
//!
//! - `desktop-shims` (default): reqwest HTTP client and SQLite settings store
//!   from `bridge-desktop`, wired as `CoreConfig` defaults

pub use bridge_traits;
pub use core_cache;
pub use core_runtime;

#[cfg(feature = "desktop-shims")]
pub use bridge_desktop;
