//! The playback engine.
//!
//! One event loop owns the queue, the current transfer, the decoder and the
//! output sink. Commands, transfer events, catalog answers and a periodic
//! tick are all handled on that loop, so none of this state is shared. The
//! only object crossing into the real-time callback is the `PlaybackBuffer`.

pub mod events;

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::audio::buffer::PlaybackBuffer;
use crate::audio::decoder::{DecodeContext, DecodeState, PacketCodec};
use crate::audio::output::AudioSink;
use crate::config::EngineConfig;
use crate::error::{AudioError, CatalogError, DecodeError, PlayerError};
use crate::error_recovery::{RecoveryAction, RecoveryPolicy};
use crate::fetch::{Catalog, CatalogListing, Destination, FetchEvent, FetchHandle, FetchManager};
use crate::logging::{EventLog, PlaybackEventType};
use crate::models::{DownloadState, PlaybackState, PlayerStatus, StreamParams, Track};
use crate::queue::cache::PlaylistCache;
use crate::queue::{Advance, AdvanceReason, QueueController};

pub use events::{CatalogRequest, Command, EngineEvent, EngineHandle, Notification};

/// Stream layout assumed for sizing the first buffer
const DEFAULT_PARAMS: StreamParams = StreamParams {
    channels: 2,
    sample_rate: 44_100,
};

/// Upper bound on the buffer reserved up front from a duration hint
const MAX_PREALLOCATED_SECS: u64 = 20 * 60;

pub struct PlaybackEngine<S: AudioSink> {
    config: EngineConfig,
    queue: QueueController,
    fetcher: FetchManager,
    catalog: Arc<dyn Catalog>,
    decoder: DecodeContext,
    buffer: Arc<PlaybackBuffer>,
    sink: S,
    cache: PlaylistCache,
    events: EventLog,
    policy: RecoveryPolicy,
    state: PlaybackState,

    /// Queue index of the track being played
    current: Option<usize>,
    playing_name: Option<String>,
    /// Tags transfers and events of the current track
    generation: u64,
    transfer: Option<FetchHandle>,
    transfer_complete: bool,
    /// Parameters of the most recent stream, kept across tracks
    last_params: Option<StreamParams>,
    load_request: u64,
    more_request: u64,
    /// Underrun count already written to the event log
    reported_underruns: u64,

    commands: mpsc::UnboundedReceiver<Command>,
    fetch_tx: mpsc::UnboundedSender<FetchEvent>,
    fetch_rx: mpsc::UnboundedReceiver<FetchEvent>,
    engine_tx: mpsc::UnboundedSender<EngineEvent>,
    engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
    notifications: mpsc::UnboundedSender<Notification>,
}

impl<S: AudioSink> PlaybackEngine<S> {
    pub fn new(
        config: EngineConfig,
        fetcher: FetchManager,
        catalog: Arc<dyn Catalog>,
        sink: S,
        codec: Box<dyn PacketCodec>,
    ) -> (Self, EngineHandle, mpsc::UnboundedReceiver<Notification>) {
        let config = config.sanitized();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (notifications, notification_rx) = mpsc::unbounded_channel();

        let engine = Self {
            queue: QueueController::new(),
            decoder: DecodeContext::new(codec, config.stall_threshold),
            buffer: Arc::new(PlaybackBuffer::new(config.default_volume, config.gain_trim)),
            cache: PlaylistCache::new(config.playlist_cache_path()),
            policy: RecoveryPolicy::new(config.retry_budget),
            events: EventLog::new(),
            state: PlaybackState::Stopped,
            current: None,
            playing_name: None,
            generation: 0,
            transfer: None,
            transfer_complete: false,
            last_params: None,
            load_request: 0,
            more_request: 0,
            reported_underruns: 0,
            config,
            fetcher,
            catalog,
            sink,
            commands,
            fetch_tx,
            fetch_rx,
            engine_tx,
            engine_rx,
            notifications,
        };

        (engine, EngineHandle::new(command_tx), notification_rx)
    }

    /// Use `queue` instead of a fresh, randomly seeded one
    pub fn with_queue(mut self, queue: QueueController) -> Self {
        self.queue = queue;
        self
    }

    /// History of playback events, shared with the engine
    pub fn event_log(&self) -> EventLog {
        self.events.clone()
    }

    /// Run until `Command::Shutdown` or until every handle is dropped
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Playback engine started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = self.fetch_rx.recv() => self.handle_fetch_event(event),
                Some(event) = self.engine_rx.recv() => self.handle_event(event),
                _ = tick.tick() => self.on_tick(),
            }
        }

        self.cancel_transfer();
        self.sink.close();
        info!("Playback engine stopped");
    }

    pub fn status(&self) -> PlayerStatus {
        PlayerStatus {
            state: self.state,
            current_track: self.current_track().cloned(),
            queue_index: self.current,
            queue_len: self.queue.len(),
            position_us: self.position_us(),
            volume: self.buffer.volume(),
            shuffle: self.queue.is_shuffled(),
            loop_mode: self.queue.loop_mode(),
            stream: self.decoder.params(),
            download_states: self.queue.tracks().iter().map(|t| t.download_state).collect(),
            underruns: self.buffer.underruns(),
        }
    }

    fn current_track(&self) -> Option<&Track> {
        self.current.and_then(|index| self.queue.track(index))
    }

    fn current_name(&self) -> String {
        self.playing_name.clone().unwrap_or_else(|| "track".to_string())
    }

    fn position_us(&self) -> u64 {
        self.decoder
            .params()
            .map_or(0, |params| params.samples_to_micros(self.buffer.position()))
    }

    fn notify(&self, notification: Notification) {
        // Nobody listening is fine
        let _ = self.notifications.send(notification);
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.state == state {
            return;
        }
        self.state = state;

        let event_type = match state {
            PlaybackState::Playing => PlaybackEventType::PlaybackStarted,
            PlaybackState::Paused => PlaybackEventType::PlaybackPaused,
            PlaybackState::Stopped => PlaybackEventType::PlaybackStopped,
        };
        self.events.record(event_type, self.current_name());
        self.notify(Notification::PlaybackStatusChanged(state));
    }

    fn mark(&mut self, index: usize, state: DownloadState) {
        if let Err(e) = self.queue.set_download_state(index, state) {
            debug!("Cannot mark track: {}", e);
        }
    }

    fn handle_command(&mut self, command: Command) {
        debug!("Command: {:?}", command);

        match command {
            Command::PlayTrack(id) => self.load(CatalogRequest::Track(id)),
            Command::PlayAlbum(id) => self.load(CatalogRequest::Album(id)),
            Command::PlayPlaylist(id) => self.load(CatalogRequest::Playlist(id)),
            Command::Play => self.play(),
            Command::Pause => self.pause(),
            Command::PlayPause => match self.state {
                PlaybackState::Playing => self.pause(),
                _ => self.play(),
            },
            Command::Stop => self.stop(),
            Command::Next => self.navigate(1),
            Command::Previous => self.navigate(-1),
            Command::SeekRelative(delta) => {
                let target = (self.position_us() as i64).saturating_add(delta).max(0);
                self.seek(target as u64);
            }
            Command::SeekAbsolute(micros) => self.seek(micros),
            Command::SetShuffle(enabled) => self.queue.set_shuffle(enabled),
            Command::SetLoopMode(mode) => self.queue.set_loop_mode(mode),
            Command::SetVolume(volume) => {
                self.buffer.set_volume(volume);
                debug!("Volume set to {:.2}", self.buffer.volume());
            }
            Command::QueryStatus(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown => {}
        }
    }

    fn handle_fetch_event(&mut self, event: FetchEvent) {
        if event.tag() != self.generation {
            debug!("Dropping event of cancelled transfer {}", event.tag());
            return;
        }

        match event {
            FetchEvent::Started { instance, attempt, .. } => {
                if attempt > 1 {
                    self.events.record(
                        PlaybackEventType::FetchRetry,
                        format!("Attempt {} for {} via {}", attempt, self.current_name(), instance),
                    );
                }
            }
            FetchEvent::Data { bytes, .. } => self.decode(&bytes),
            FetchEvent::Progress { .. } => {}
            FetchEvent::Completed { total, .. } => {
                debug!("Transfer of {} complete, {} bytes", self.current_name(), total);
                self.transfer_complete = true;
                self.transfer = None;
                if let Some(index) = self.current {
                    self.mark(index, DownloadState::Ready);
                }
            }
            FetchEvent::Failed { error, .. } => self.handle_event(EngineEvent::FetchFailed {
                generation: self.generation,
                error,
            }),
        }
    }

    fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::HeaderParsed {
                generation,
                params,
                reconfigure,
            } if generation == self.generation => self.on_header(params, reconfigure),
            EngineEvent::TrackOver { generation } if generation == self.generation => {
                self.notify(Notification::TrackOver);
                let advance = self.queue.advance(1, AdvanceReason::NaturalEnd);
                self.apply(advance);
            }
            EngineEvent::FetchFailed { generation, error } if generation == self.generation => {
                self.events.record(
                    PlaybackEventType::FetchFailed,
                    format!("{}: {}", self.current_name(), error),
                );
                let action = self.policy.classify(&PlayerError::Fetch(error));
                self.recover(action);
            }
            EngineEvent::DecodeFailed { generation, error } if generation == self.generation => {
                self.events.record(
                    PlaybackEventType::DecodeError,
                    format!("{}: {}", self.current_name(), error),
                );
                let action = self.policy.on_decode_error(&error);
                self.recover(action);
            }
            EngineEvent::CatalogLoaded {
                request_id,
                request,
                listing,
            } => self.on_catalog_loaded(request_id, request, listing),
            EngineEvent::CatalogFailed {
                request_id,
                request,
                error,
            } => self.on_catalog_failed(request_id, request, error),
            stale => debug!("Discarding stale {:?}", stale),
        }
    }

    fn recover(&mut self, action: RecoveryAction) {
        match action {
            RecoveryAction::SkipTrack(reason) => {
                self.cancel_transfer();
                if let Some(index) = self.current {
                    self.mark(index, DownloadState::Failed);
                }
                self.events.track_skipped(&self.current_name(), &reason);
                let advance = self.queue.advance(1, AdvanceReason::Failure);
                self.apply(advance);
            }
            RecoveryAction::Fault(reason) => self.fault(reason),
            RecoveryAction::Retry | RecoveryAction::Ignore => {}
        }
    }

    fn on_audio_error(&mut self, error: AudioError) {
        let action = self.policy.on_audio_error(&error);
        self.recover(action);
    }

    /// The output device failed: pause and tell the control layer
    fn fault(&mut self, reason: String) {
        self.events.record(PlaybackEventType::DeviceFault, reason.clone());
        self.sink.close();
        self.buffer.set_paused(true);
        self.notify(Notification::PlaybackFault(reason));
        if self.state == PlaybackState::Playing {
            self.set_state(PlaybackState::Paused);
        }
    }

    fn on_tick(&mut self) {
        if let Some(error) = self.sink.poll_fault() {
            self.on_audio_error(error);
        }

        let underruns = self.buffer.underruns();
        if underruns > self.reported_underruns {
            self.events.record(
                PlaybackEventType::BufferUnderrun,
                format!(
                    "{} period(s) short of audio in {}",
                    underruns - self.reported_underruns,
                    self.current_name()
                ),
            );
            self.reported_underruns = underruns;
        }

        if self.buffer.take_track_over() {
            self.handle_event(EngineEvent::TrackOver {
                generation: self.generation,
            });
        }

        // A finished transfer without an end-of-stream page: poll the
        // decoder so its stall counter can end the stream
        if self.transfer_complete && self.current.is_some() && self.decoder.state() != DecodeState::EndOfStream {
            self.decode(&[]);
        }
    }

    fn decode(&mut self, bytes: &[u8]) {
        let mut sink = Arc::clone(&self.buffer);
        let generation = self.generation;
        let mut result = self.decoder.feed(bytes, &mut sink);

        loop {
            let progress = match result {
                Ok(progress) => progress,
                Err(error) => {
                    self.handle_event(EngineEvent::DecodeFailed { generation, error });
                    return;
                }
            };

            if let Some(params) = progress.params {
                // The decoder stopped at the headers: output is set up
                // before the first samples of the stream are written
                self.handle_event(EngineEvent::HeaderParsed {
                    generation,
                    params,
                    reconfigure: progress.reconfigure,
                });
                if self.generation != generation {
                    return;
                }
                result = self.decoder.resume(&mut sink);
                continue;
            }

            if progress.finished {
                if self.decoder.params().is_none() {
                    self.handle_event(EngineEvent::DecodeFailed {
                        generation,
                        error: DecodeError::UnsupportedStream("stream ended before its headers".to_string()),
                    });
                } else {
                    debug!("Decoded all of {}", self.current_name());
                }
            }
            return;
        }
    }

    fn on_header(&mut self, params: StreamParams, reconfigure: bool) {
        self.last_params = Some(params);

        if reconfigure || !self.sink.is_open() {
            if let Err(e) = self.sink.open(params, Arc::clone(&self.buffer)) {
                self.on_audio_error(e);
                return;
            }
        }

        if self.state == PlaybackState::Playing {
            if let Err(e) = self.sink.play() {
                self.on_audio_error(e);
            }
        }
    }

    fn load(&mut self, request: CatalogRequest) {
        self.load_request += 1;
        let request_id = self.load_request;

        let cached = match &request {
            CatalogRequest::Album(id) => self.cached_listing(id, true),
            CatalogRequest::Playlist(id) => self.cached_listing(id, false),
            _ => None,
        };

        match cached {
            Some(listing) => self.on_catalog_loaded(request_id, request, listing),
            None => self.spawn_lookup(request_id, request),
        }
    }

    fn cached_listing(&self, id: &str, is_album: bool) -> Option<CatalogListing> {
        match self.cache.find(id, is_album) {
            Ok(Some(record)) => {
                debug!("Loaded '{}' from the playlist cache", record.playlist.name);
                Some(CatalogListing {
                    playlist: Some(record.playlist),
                    tracks: record.tracks,
                })
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Playlist cache unavailable: {}", e);
                None
            }
        }
    }

    fn spawn_lookup(&self, request_id: u64, request: CatalogRequest) {
        let catalog = Arc::clone(&self.catalog);
        let events = self.engine_tx.clone();
        let seeds = match request {
            CatalogRequest::Recommendations => self.queue.recommendation_seeds(),
            _ => Vec::new(),
        };

        tokio::spawn(async move {
            let result = match &request {
                CatalogRequest::Track(id) => catalog.track(id).await,
                CatalogRequest::Album(id) => catalog.album(id).await,
                CatalogRequest::Playlist(id) => catalog.playlist(id).await,
                CatalogRequest::Recommendations => catalog
                    .recommendations(&seeds)
                    .await
                    .map(|tracks| CatalogListing { playlist: None, tracks }),
            };

            let event = match result {
                Ok(listing) => EngineEvent::CatalogLoaded {
                    request_id,
                    request,
                    listing,
                },
                Err(error) => EngineEvent::CatalogFailed {
                    request_id,
                    request,
                    error,
                },
            };
            // The engine may have shut down meanwhile
            let _ = events.send(event);
        });
    }

    fn on_catalog_loaded(&mut self, request_id: u64, request: CatalogRequest, listing: CatalogListing) {
        if request == CatalogRequest::Recommendations {
            if request_id != self.more_request {
                debug!("Discarding outdated recommendations");
                return;
            }

            info!("Continuing with {} recommended tracks", listing.tracks.len());
            let waiting = self.queue.is_awaiting_more();
            match self.queue.extend(listing.tracks) {
                Some(index) => self.start_track(index),
                None if waiting => self.finish_queue(),
                None => {}
            }
            return;
        }

        if request_id != self.load_request {
            debug!("Discarding outdated result for {}", request.describe());
            return;
        }

        if let Some(playlist) = &listing.playlist {
            if let Err(e) = self.cache.touch(playlist, &listing.tracks) {
                warn!("Cannot cache '{}': {}", playlist.name, e);
            }
        }

        match self.queue.replace(listing.tracks) {
            Ok(index) => {
                // Recommendations for the old queue are no longer wanted
                self.more_request += 1;
                info!("Playing {} ({} tracks)", request.describe(), self.queue.len());
                self.start_track(index);
            }
            Err(e) => warn!("Nothing to play for {}: {}", request.describe(), e),
        }
    }

    fn on_catalog_failed(&mut self, request_id: u64, request: CatalogRequest, error: CatalogError) {
        warn!("Catalog lookup for {} failed: {}", request.describe(), error.user_message());

        if request == CatalogRequest::Recommendations && request_id == self.more_request {
            self.queue.abandon_more();
            self.finish_queue();
        }
    }

    fn play(&mut self) {
        match self.state {
            PlaybackState::Playing => {}
            PlaybackState::Paused => self.resume(),
            PlaybackState::Stopped => match self.current.or_else(|| self.queue.current_index()) {
                Some(index) => self.start_track(index),
                None => debug!("Nothing queued"),
            },
        }
    }

    fn resume(&mut self) {
        if !self.sink.is_open() {
            if let Some(params) = self.decoder.params() {
                if let Err(e) = self.sink.open(params, Arc::clone(&self.buffer)) {
                    self.on_audio_error(e);
                    return;
                }
            }
        }

        if let Err(e) = self.sink.play() {
            self.on_audio_error(e);
            return;
        }
        self.buffer.set_paused(false);
        self.set_state(PlaybackState::Playing);
    }

    fn pause(&mut self) {
        if self.state != PlaybackState::Playing {
            return;
        }
        self.buffer.set_paused(true);
        if let Err(e) = self.sink.pause() {
            warn!("Cannot pause output: {}", e);
        }
        self.set_state(PlaybackState::Paused);
    }

    fn stop(&mut self) {
        self.halt();
        // Events still queued for the stopped track are stale now
        self.generation += 1;
        self.decoder.restart();
        if let Err(e) = self.buffer.replace(0) {
            warn!("Cannot release playback buffer: {}", e);
        }
        self.set_state(PlaybackState::Stopped);
    }

    /// Move the read cursor; a target past the decoded audio ends the track
    fn seek(&mut self, micros: u64) {
        let Some(params) = self.decoder.params() else {
            debug!("Seek ignored, no stream yet");
            return;
        };

        self.buffer.request_seek(params.micros_to_samples(micros));
        self.events.record(PlaybackEventType::Seek, format!("{} to {} us", self.current_name(), micros));
        self.notify(Notification::PositionSeeked(micros));
    }

    fn navigate(&mut self, delta: isize) {
        let advance = self.queue.advance(delta, AdvanceReason::Navigation);
        self.apply(advance);
    }

    fn apply(&mut self, advance: Advance) {
        match advance {
            Advance::Play(index) => self.start_track(index),
            Advance::Replay(index) => self.replay(index),
            Advance::NeedMore => {
                self.more_request += 1;
                info!("Queue exhausted, asking for recommendations");
                self.spawn_lookup(self.more_request, CatalogRequest::Recommendations);
            }
            Advance::Pending => debug!("Still waiting for more tracks"),
            Advance::End => self.finish_queue(),
        }
    }

    fn replay(&mut self, index: usize) {
        if self.current != Some(index) || self.state == PlaybackState::Stopped {
            self.start_track(index);
            return;
        }

        // Everything decoded so far is still buffered
        self.buffer.restart();
        self.events.record(
            PlaybackEventType::Seek,
            format!("Restarting {}", self.current_name()),
        );
        self.notify(Notification::PositionSeeked(0));
    }

    fn finish_queue(&mut self) {
        info!("End of queue");
        self.halt();
        self.set_state(PlaybackState::Stopped);
    }

    fn halt(&mut self) {
        self.cancel_transfer();
        self.buffer.set_paused(true);
        if let Err(e) = self.sink.pause() {
            warn!("Cannot pause output: {}", e);
        }
    }

    fn cancel_transfer(&mut self) {
        if let Some(handle) = self.transfer.take() {
            handle.cancel();
        }
        self.transfer_complete = false;
    }

    fn initial_capacity(&self, track: &Track) -> usize {
        let params = self.last_params.unwrap_or(DEFAULT_PARAMS);
        let secs = if track.duration_hint.is_zero() {
            self.config.initial_buffer_secs
        } else {
            track.duration_hint.as_secs() + 1
        };
        params
            .samples_per_second()
            .saturating_mul(secs.min(MAX_PREALLOCATED_SECS) as usize)
    }

    /// Switch fetch, decoder and output over to the track at `index`
    fn start_track(&mut self, index: usize) {
        let Some(track) = self.queue.track(index).cloned() else {
            warn!("No track at queue index {}", index);
            return;
        };

        self.cancel_transfer();
        self.generation += 1;
        self.decoder.restart();
        let previous = self.playing_name.replace(track.display_name().to_string());
        self.current = Some(index);

        if let Err(error) = self.buffer.replace(self.initial_capacity(&track)) {
            // Reported through the loop so that a run of failing tracks
            // cannot recurse
            let _ = self.engine_tx.send(EngineEvent::DecodeFailed {
                generation: self.generation,
                error,
            });
            return;
        }
        self.buffer.set_paused(false);

        self.mark(index, DownloadState::Fetching);
        self.transfer = Some(self.fetcher.fetch(
            self.generation,
            &track.source_locator,
            Destination::Pipe,
            self.fetch_tx.clone(),
        ));

        self.events.track_changed(previous.as_deref(), track.display_name());
        self.notify(Notification::TrackChanged(track));

        self.set_state(PlaybackState::Playing);
        // Silent until the new stream's header has configured the output
        if self.sink.is_open() {
            if let Err(e) = self.sink.pause() {
                warn!("Cannot pause output: {}", e);
            }
        }
    }
}
