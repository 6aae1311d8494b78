//! Media Catalog Abstraction
//!
//! The remote media server is opaque to the core: it is reached through a
//! [`Catalog`] that resolves track records and builds stream/artwork URLs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Denormalized track record as returned by the catalog.
///
/// The same record is persisted next to cached media so that a cache listing
/// can be rendered without asking the server again.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub album: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_art_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u32>,
}

impl TrackMetadata {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = artist.into();
        self
    }

    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.album = album.into();
        self
    }

    pub fn with_cover_art(mut self, cover_art_id: impl Into<String>) -> Self {
        self.cover_art_id = Some(cover_art_id.into());
        self
    }

    /// Artist or album is missing, so the record is worth re-fetching.
    pub fn is_incomplete(&self) -> bool {
        self.artist.trim().is_empty() || self.album.trim().is_empty()
    }
}

/// Catalog service trait
///
/// # Example
///
/// ```ignore
/// use bridge_traits::catalog::Catalog;
///
/// async fn describe(catalog: &dyn Catalog, id: &str) -> Result<String> {
///     let track = catalog.fetch_track_metadata(id).await?;
///     Ok(format!("{} - {}", track.artist, track.title))
/// }
/// ```
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Fetch the full record for a track
    async fn fetch_track_metadata(&self, id: &str) -> Result<TrackMetadata>;

    /// Build the URL that streams the track's media payload
    fn stream_url(&self, id: &str) -> String;

    /// Build the URL for a cover-art image
    fn cover_art_url(&self, cover_art_id: &str) -> String;
}
