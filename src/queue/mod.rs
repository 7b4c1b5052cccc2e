//! The play queue: ordered tracks, the play cursor, shuffle and loop policy.
//!
//! The controller only decides *which* track plays next. Switching the
//! fetch, decoder and output over to that track is up to the engine.

pub mod cache;
pub mod shuffle;

use log::debug;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::QueueError;
use crate::models::{DownloadState, LoopMode, Track};

use shuffle::ShuffleTable;

/// Number of queue tracks sent as recommendation seeds
pub const RECOMMENDATION_SEEDS: usize = 5;

/// Why the queue is moving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceReason {
    /// Next / previous requested by the user
    Navigation,
    /// The current track played to its end
    NaturalEnd,
    /// The current track could not be fetched or decoded
    Failure,
}

/// What the engine should do after the queue moved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Switch to the track at this queue index
    Play(usize),
    /// Play the current track again from the start
    Replay(usize),
    /// The queue ran out; ask the catalog for more tracks
    NeedMore,
    /// More tracks were already requested and have not arrived yet
    Pending,
    /// Nothing to play
    End,
}

pub struct QueueController {
    tracks: Vec<Track>,
    /// Play-order position; equals the track index unless shuffled
    position: Option<usize>,
    shuffle: Option<ShuffleTable>,
    loop_mode: LoopMode,
    /// Position to resume at once more tracks arrive
    awaiting_more: Option<usize>,
    rng: StdRng,
}

impl QueueController {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Controller with a reproducible shuffle order
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            tracks: Vec::new(),
            position: None,
            shuffle: None,
            loop_mode: LoopMode::None,
            awaiting_more: None,
            rng,
        }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    /// Index of the current track in queue order
    pub fn current_index(&self) -> Option<usize> {
        self.position.and_then(|p| self.track_at(p))
    }

    pub fn current_track(&self) -> Option<&Track> {
        self.current_index().and_then(|i| self.tracks.get(i))
    }

    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) {
        debug!("Loop mode: {}", mode.as_str());
        self.loop_mode = mode;
    }

    pub fn is_shuffled(&self) -> bool {
        self.shuffle.is_some()
    }

    pub fn shuffle_table(&self) -> Option<&ShuffleTable> {
        self.shuffle.as_ref()
    }

    pub fn is_awaiting_more(&self) -> bool {
        self.awaiting_more.is_some()
    }

    pub fn set_download_state(&mut self, index: usize, state: DownloadState) -> Result<(), QueueError> {
        let track = self.tracks.get_mut(index).ok_or(QueueError::InvalidIndex { index })?;
        track.download_state = state;
        Ok(())
    }

    fn track_at(&self, position: usize) -> Option<usize> {
        match &self.shuffle {
            Some(table) => table.track_at(position),
            None => (position < self.tracks.len()).then_some(position),
        }
    }

    /// Move to `position`; a pending request for more tracks no longer applies
    fn play_position(&mut self, position: usize) -> Advance {
        self.position = Some(position);
        self.awaiting_more = None;
        match self.track_at(position) {
            Some(index) => Advance::Play(index),
            None => Advance::End,
        }
    }

    /// Replace the whole queue and return the index of the first track to play
    pub fn replace(&mut self, tracks: Vec<Track>) -> Result<usize, QueueError> {
        if tracks.is_empty() {
            return Err(QueueError::EmptyQueue);
        }

        // Dropping the old tracks releases their playlists
        self.tracks = tracks;
        self.awaiting_more = None;
        if self.shuffle.is_some() {
            self.shuffle = Some(ShuffleTable::new(self.tracks.len(), &mut self.rng));
        }

        match self.play_position(0) {
            Advance::Play(index) => Ok(index),
            _ => Err(QueueError::EmptyQueue),
        }
    }

    /// Turn shuffle on or off without replaying heard tracks
    pub fn set_shuffle(&mut self, enabled: bool) {
        if enabled == self.shuffle.is_some() {
            return;
        }

        let current = self.current_index();
        if enabled {
            let table = match current {
                Some(index) => ShuffleTable::split_at(self.tracks.len(), index, &mut self.rng),
                None => ShuffleTable::new(self.tracks.len(), &mut self.rng),
            };
            self.position = current.and_then(|index| table.position_of(index));
            self.shuffle = Some(table);
        } else {
            self.shuffle = None;
            self.position = current;
        }
        debug!("Shuffle {}", if enabled { "on" } else { "off" });
    }

    /// Move the play cursor by `delta`.
    ///
    /// Failures always move forward by one, whatever the loop mode, so a
    /// broken track cannot repeat forever.
    pub fn advance(&mut self, delta: isize, reason: AdvanceReason) -> Advance {
        if self.tracks.is_empty() {
            return Advance::End;
        }

        let Some(position) = self.position else {
            return self.play_position(0);
        };

        let delta = match reason {
            AdvanceReason::Failure => 1,
            _ if self.loop_mode == LoopMode::Track => {
                self.awaiting_more = None;
                return match self.current_index() {
                    Some(index) => Advance::Replay(index),
                    None => Advance::End,
                };
            }
            _ => delta,
        };

        let count = self.tracks.len() as isize;
        let target = position as isize + delta;

        if target < 0 {
            if self.loop_mode == LoopMode::Playlist {
                return self.play_position((count - 1) as usize);
            }
            return self.play_position(0);
        }

        if target >= count {
            if self.loop_mode == LoopMode::Playlist {
                if self.shuffle.is_some() {
                    self.shuffle = Some(ShuffleTable::new(self.tracks.len(), &mut self.rng));
                }
                return self.play_position((target % count) as usize);
            }
            if self.awaiting_more.is_some() {
                return Advance::Pending;
            }
            self.awaiting_more = Some(target as usize);
            return Advance::NeedMore;
        }

        self.play_position(target as usize)
    }

    /// Append tracks, resuming an advance that ran out of tracks.
    ///
    /// Returns the index of the track to play when an advance resumed.
    pub fn extend(&mut self, tracks: Vec<Track>) -> Option<usize> {
        if !tracks.is_empty() {
            self.tracks.extend(tracks);
            let count = self.tracks.len();
            if let Some(table) = self.shuffle.as_mut() {
                table.grow(count, self.position, &mut self.rng);
            }
        }

        let target = self.awaiting_more.take()?;
        if target >= self.tracks.len() {
            return None;
        }
        match self.play_position(target) {
            Advance::Play(index) => Some(index),
            _ => None,
        }
    }

    /// Give up on a pending request for more tracks
    pub fn abandon_more(&mut self) {
        self.awaiting_more = None;
    }

    /// Ids of the last queued tracks, for recommendations
    pub fn recommendation_seeds(&self) -> Vec<String> {
        let start = self.tracks.len().saturating_sub(RECOMMENDATION_SEEDS);
        self.tracks[start..].iter().map(|t| t.id.clone()).collect()
    }
}

impl Default for QueueController {
    fn default() -> Self {
        Self::new()
    }
}
