use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;

use crate::error::CatalogError;
use crate::fetch::FetchManager;
use crate::models::{Playlist, Track};

/// Tracks resolved from one catalog lookup
#[derive(Debug, Clone, Default)]
pub struct CatalogListing {
    pub playlist: Option<Arc<Playlist>>,
    pub tracks: Vec<Track>,
}

/// Resolves identifiers to ordered track lists
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn track(&self, id: &str) -> Result<CatalogListing, CatalogError>;

    async fn album(&self, id: &str) -> Result<CatalogListing, CatalogError>;

    async fn playlist(&self, id: &str) -> Result<CatalogListing, CatalogError>;

    /// Tracks to continue with after the given ones
    async fn recommendations(&self, seed_ids: &[String]) -> Result<Vec<Track>, CatalogError>;
}

#[derive(Debug, Deserialize)]
struct TrackDocument {
    id: String,
    uri: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    artist: String,
    #[serde(default)]
    art_url: String,
    #[serde(default)]
    duration_ms: u64,
}

impl TrackDocument {
    fn into_track(self, playlist: Option<&Arc<Playlist>>) -> Track {
        let track = Track::new(self.id, self.uri, Duration::from_millis(self.duration_ms))
            .with_details(self.name, self.artist, self.art_url);
        match playlist {
            Some(playlist) => track.with_playlist(Arc::clone(playlist)),
            None => track,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CollectionDocument {
    id: String,
    name: String,
    #[serde(default)]
    image_url: String,
    tracks: Vec<TrackDocument>,
}

#[derive(Debug, Deserialize)]
struct RecommendationDocument {
    tracks: Vec<TrackDocument>,
}

/// Catalog served as JSON documents by the backend instances.
///
/// Track, album and playlist documents are cached on disk; recommendations
/// are always fetched fresh.
pub struct HttpCatalog {
    fetcher: FetchManager,
    cache_dir: PathBuf,
}

impl HttpCatalog {
    pub fn new(fetcher: FetchManager, cache_dir: PathBuf) -> Self {
        Self { fetcher, cache_dir }
    }

    /// Cache file for `id`; every byte outside `[A-Za-z0-9_-]` is written as `%XX`,
    /// so distinct ids never share a file
    fn cache_path(&self, kind: &str, id: &str) -> PathBuf {
        let mut name = String::with_capacity(id.len() + 5);
        for byte in id.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
                name.push(byte as char);
            } else {
                name.push_str(&format!("%{:02X}", byte));
            }
        }
        name.push_str(".json");
        self.cache_dir.join(kind).join(name)
    }

    async fn document<T>(&self, kind: &'static str, id: &str) -> Result<T, CatalogError>
    where
        T: serde::de::DeserializeOwned,
    {
        let path = self.cache_path(kind, id);
        self.fetcher.fetch_file(&format!("{}/{}", kind, id), &path).await?;

        let content = tokio::fs::read(&path).await?;
        match serde_json::from_slice(&content) {
            Ok(document) => Ok(document),
            Err(e) => {
                // A bad document must not be served from the cache again
                warn!("Discarding unreadable catalog document {}: {}", path.display(), e);
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    debug!("Cannot remove {}: {}", path.display(), e);
                }
                Err(CatalogError::Parse(e))
            }
        }
    }

    async fn collection(&self, kind: &'static str, id: &str, is_album: bool) -> Result<CatalogListing, CatalogError> {
        let document: CollectionDocument = self.document(kind, id).await?;
        if document.tracks.is_empty() {
            return Err(CatalogError::NotFound { kind, id: id.to_string() });
        }

        let playlist = Arc::new(Playlist::new(
            document.id,
            document.name,
            document.image_url,
            is_album,
            document.tracks.len() as u32,
        ));
        let tracks = document
            .tracks
            .into_iter()
            .map(|track| track.into_track(Some(&playlist)))
            .collect();

        Ok(CatalogListing {
            playlist: Some(playlist),
            tracks,
        })
    }
}

#[async_trait]
impl Catalog for HttpCatalog {
    async fn track(&self, id: &str) -> Result<CatalogListing, CatalogError> {
        let document: TrackDocument = self.document("tracks", id).await?;
        Ok(CatalogListing {
            playlist: None,
            tracks: vec![document.into_track(None)],
        })
    }

    async fn album(&self, id: &str) -> Result<CatalogListing, CatalogError> {
        self.collection("albums", id, true).await
    }

    async fn playlist(&self, id: &str) -> Result<CatalogListing, CatalogError> {
        self.collection("playlists", id, false).await
    }

    async fn recommendations(&self, seed_ids: &[String]) -> Result<Vec<Track>, CatalogError> {
        let locator = format!("recommendations?seed_tracks={}", seed_ids.join(","));
        let bytes = self.fetcher.fetch_bytes(&locator).await?;
        let document: RecommendationDocument = serde_json::from_slice(&bytes)?;
        Ok(document.tracks.into_iter().map(|track| track.into_track(None)).collect())
    }
}
