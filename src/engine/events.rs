use tokio::sync::{mpsc, oneshot};

use crate::error::{CatalogError, DecodeError, FetchError, PlayerError};
use crate::fetch::CatalogListing;
use crate::models::{LoopMode, PlaybackState, PlayerStatus, StreamParams, Track};

/// Commands accepted by the engine from the control layer
#[derive(Debug)]
pub enum Command {
    PlayTrack(String),
    PlayAlbum(String),
    PlayPlaylist(String),
    Play,
    Pause,
    PlayPause,
    Stop,
    Next,
    Previous,
    /// Move the play position by this many microseconds
    SeekRelative(i64),
    /// Jump to this position in microseconds
    SeekAbsolute(u64),
    SetShuffle(bool),
    SetLoopMode(LoopMode),
    SetVolume(f32),
    QueryStatus(oneshot::Sender<PlayerStatus>),
    Shutdown,
}

/// Events the engine reports to the control layer
#[derive(Debug, Clone)]
pub enum Notification {
    TrackChanged(Track),
    /// New play position in microseconds
    PositionSeeked(u64),
    PlaybackStatusChanged(PlaybackState),
    TrackOver,
    /// The output device failed; playback is paused
    PlaybackFault(String),
}

/// What a catalog lookup was for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogRequest {
    Track(String),
    Album(String),
    Playlist(String),
    Recommendations,
}

impl CatalogRequest {
    pub fn describe(&self) -> String {
        match self {
            CatalogRequest::Track(id) => format!("track {}", id),
            CatalogRequest::Album(id) => format!("album {}", id),
            CatalogRequest::Playlist(id) => format!("playlist {}", id),
            CatalogRequest::Recommendations => "recommendations".to_string(),
        }
    }
}

/// Internal events of the engine's event loop.
///
/// Track-scoped events carry the generation of the track they belong to;
/// catalog events carry the id of the request they answer.
#[derive(Debug)]
pub enum EngineEvent {
    HeaderParsed {
        generation: u64,
        params: StreamParams,
        reconfigure: bool,
    },
    TrackOver {
        generation: u64,
    },
    FetchFailed {
        generation: u64,
        error: FetchError,
    },
    DecodeFailed {
        generation: u64,
        error: DecodeError,
    },
    CatalogLoaded {
        request_id: u64,
        request: CatalogRequest,
        listing: CatalogListing,
    },
    CatalogFailed {
        request_id: u64,
        request: CatalogRequest,
        error: CatalogError,
    },
}

/// Cloneable sender side of the engine's command channel
#[derive(Debug, Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>) -> Self {
        Self { commands }
    }

    pub fn send(&self, command: Command) -> Result<(), PlayerError> {
        self.commands.send(command).map_err(|_| PlayerError::EngineStopped)
    }

    pub async fn status(&self) -> Result<PlayerStatus, PlayerError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::QueryStatus(reply))?;
        response.await.map_err(|_| PlayerError::EngineStopped)
    }

    pub fn shutdown(&self) {
        // Already stopped is fine
        let _ = self.commands.send(Command::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_reports_stopped_engine() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = EngineHandle::new(tx);
        drop(rx);

        assert!(matches!(handle.send(Command::Play), Err(PlayerError::EngineStopped)));
        assert!(matches!(handle.status().await, Err(PlayerError::EngineStopped)));
        handle.shutdown();
    }

    #[test]
    fn test_catalog_request_description() {
        assert_eq!(CatalogRequest::Album("x".to_string()).describe(), "album x");
        assert_eq!(CatalogRequest::Recommendations.describe(), "recommendations");
    }
}
