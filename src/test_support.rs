//! Scripted fakes shared by the unit and integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::audio::buffer::PlaybackBuffer;
use crate::audio::decoder::PacketCodec;
use crate::audio::ogg::{page_checksum, FLAG_BOS, FLAG_CONTINUED, FLAG_EOS};
use crate::audio::output::AudioSink;
use crate::error::{AudioError, CatalogError, DecodeError, FetchError};
use crate::fetch::{Catalog, CatalogListing, TransferBody, Transport};
use crate::models::{Playlist, StreamParams, Track};

// Ogg

/// Build a page from explicit lacing values and body bytes
pub fn ogg_page_raw(serial: u32, sequence: u32, flags: u8, granule: u64, lacing: &[u8], body: &[u8]) -> Vec<u8> {
    let mut page = Vec::with_capacity(27 + lacing.len() + body.len());
    page.extend_from_slice(b"OggS");
    page.push(0);
    page.push(flags);
    page.extend_from_slice(&granule.to_le_bytes());
    page.extend_from_slice(&serial.to_le_bytes());
    page.extend_from_slice(&sequence.to_le_bytes());
    page.extend_from_slice(&[0u8; 4]);
    page.push(lacing.len() as u8);
    page.extend_from_slice(lacing);
    page.extend_from_slice(body);

    let crc = page_checksum(&page);
    page[22..26].copy_from_slice(&crc.to_le_bytes());
    page
}

/// Build a page holding complete packets
pub fn ogg_page(serial: u32, sequence: u32, flags: u8, granule: u64, packets: &[&[u8]]) -> Vec<u8> {
    let mut lacing = Vec::new();
    let mut body = Vec::new();
    for packet in packets {
        lacing.extend(std::iter::repeat(255u8).take(packet.len() / 255));
        lacing.push((packet.len() % 255) as u8);
        body.extend_from_slice(packet);
    }
    ogg_page_raw(serial, sequence, flags, granule, &lacing, &body)
}

/// Encode a stream for `ScaleCodec`: two header pages, then the audio
/// packets split into small pages so packets span page boundaries.
pub fn encode_stream(channels: u16, sample_rate: u32, packets: &[&[i8]], eos: bool) -> Vec<u8> {
    const SERIAL: u32 = 0x5ca1e;
    const SEGMENTS_PER_PAGE: usize = 17;

    let mut ident = vec![b'S', channels as u8];
    ident.extend_from_slice(&sample_rate.to_le_bytes());

    let mut stream = ogg_page(SERIAL, 0, FLAG_BOS, 0, &[ident.as_slice()]);
    stream.extend(ogg_page(SERIAL, 1, 0, 0, &[b"comment", b"setup"]));

    let mut segments: Vec<(u8, Vec<u8>)> = Vec::new();
    for packet in packets {
        let bytes: Vec<u8> = packet.iter().map(|&s| s as u8).collect();
        let mut chunks = bytes.chunks(255).peekable();
        let mut last_full = bytes.is_empty();
        while let Some(chunk) = chunks.next() {
            segments.push((chunk.len() as u8, chunk.to_vec()));
            last_full = chunk.len() == 255 && chunks.peek().is_none();
        }
        if last_full || bytes.is_empty() {
            segments.push((0, Vec::new()));
        }
    }

    let mut sequence = 2;
    let mut granule = 0u64;
    let mut continued = false;
    let pages: Vec<&[(u8, Vec<u8>)]> = segments.chunks(SEGMENTS_PER_PAGE).collect();
    if pages.is_empty() && eos {
        stream.extend(ogg_page_raw(SERIAL, sequence, FLAG_EOS, 0, &[], &[]));
    }
    for (index, page) in pages.iter().enumerate() {
        let mut flags = if continued { FLAG_CONTINUED } else { 0 };
        if eos && index + 1 == pages.len() {
            flags |= FLAG_EOS;
        }
        let lacing: Vec<u8> = page.iter().map(|(len, _)| *len).collect();
        let body: Vec<u8> = page.iter().flat_map(|(_, data)| data.iter().copied()).collect();
        granule += body.len() as u64;
        stream.extend(ogg_page_raw(SERIAL, sequence, flags, granule, &lacing, &body));
        continued = lacing.last() == Some(&255);
        sequence += 1;
    }

    stream
}

/// Trivial codec: each packet byte is one sample of `byte / 100`
#[derive(Debug, Default)]
pub struct ScaleCodec {
    configured: bool,
}

impl PacketCodec for ScaleCodec {
    fn header_count(&self) -> usize {
        3
    }

    fn configure(&mut self, headers: &[Vec<u8>]) -> Result<StreamParams, DecodeError> {
        let ident = &headers[0];
        if ident.len() != 6 || ident[0] != b'S' {
            return Err(DecodeError::UnsupportedStream("not a scale stream".to_string()));
        }
        self.configured = true;
        Ok(StreamParams::new(
            ident[1] as u16,
            u32::from_le_bytes([ident[2], ident[3], ident[4], ident[5]]),
        ))
    }

    fn decode(&mut self, packet: &[u8], out: &mut Vec<f32>) -> Result<(), DecodeError> {
        if !self.configured {
            return Err(DecodeError::CodecCorruption("not configured".to_string()));
        }
        for &byte in packet {
            let sample = byte as i8;
            if sample == i8::MIN {
                return Err(DecodeError::CodecCorruption("poisoned sample".to_string()));
            }
            out.push(sample as f32 / 100.0);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.configured = false;
    }
}

// Transport

#[derive(Debug, Clone)]
pub enum Script {
    Fail(String),
    Status(u16),
    Body {
        chunks: Vec<Vec<u8>>,
        length: Option<u64>,
        hang_after: bool,
    },
}

impl Script {
    pub fn fail(message: &str) -> Self {
        Script::Fail(message.to_string())
    }

    pub fn status(code: u16) -> Self {
        Script::Status(code)
    }

    pub fn body(chunks: &[&[u8]]) -> Self {
        let chunks: Vec<Vec<u8>> = chunks.iter().map(|c| c.to_vec()).collect();
        let length = chunks.iter().map(|c| c.len() as u64).sum();
        Script::Body {
            chunks,
            length: Some(length),
            hang_after: false,
        }
    }

    /// Body delivered in pieces of `chunk_size` bytes
    pub fn chunked(bytes: &[u8], chunk_size: usize) -> Self {
        let chunks: Vec<&[u8]> = bytes.chunks(chunk_size.max(1)).collect();
        Self::body(&chunks)
    }

    pub fn hang() -> Self {
        Script::Body {
            chunks: Vec::new(),
            length: None,
            hang_after: true,
        }
    }

    pub fn with_length(self, announced: u64) -> Self {
        match self {
            Script::Body { chunks, hang_after, .. } => Script::Body {
                chunks,
                length: Some(announced),
                hang_after,
            },
            other => other,
        }
    }

    pub fn then_hang(self) -> Self {
        match self {
            Script::Body { chunks, length, .. } => Script::Body {
                chunks,
                length,
                hang_after: true,
            },
            other => other,
        }
    }
}

#[derive(Default)]
struct Route {
    queued: VecDeque<Script>,
    fallback: Option<Script>,
}

/// Transport answering from per-locator scripts, one script per request
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<Vec<(String, Route)>>,
    requests: Mutex<Vec<String>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    delay: Duration,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_route<F: FnOnce(&mut Route)>(&self, locator: &str, update: F) {
        let mut routes = self.routes.lock().unwrap();
        match routes.iter_mut().find(|(key, _)| key == locator) {
            Some((_, route)) => update(route),
            None => {
                let mut route = Route::default();
                update(&mut route);
                routes.push((locator.to_string(), route));
            }
        }
    }

    /// Answer the next request for `locator` with `script`
    pub fn script(&self, locator: &str, script: Script) {
        self.with_route(locator, |route| route.queued.push_back(script));
    }

    /// Answer every request for `locator` without a queued script
    pub fn script_always(&self, locator: &str, script: Script) {
        self.with_route(locator, |route| route.fallback = Some(script));
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, locator: &str) -> usize {
        self.requests().iter().filter(|url| url.ends_with(locator)).count()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_script(&self, url: &str) -> Option<Script> {
        let mut routes = self.routes.lock().unwrap();
        let (_, route) = routes.iter_mut().find(|(key, _)| url.ends_with(key.as_str()))?;
        route.queued.pop_front().or_else(|| route.fallback.clone())
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct ScriptedBody {
    chunks: VecDeque<Vec<u8>>,
    length: Option<u64>,
    hang_after: bool,
    delay: Duration,
    _active: ActiveGuard,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, url: &str) -> Result<Box<dyn TransferBody>, FetchError> {
        self.requests.lock().unwrap().push(url.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.next_script(url) {
            None => Err(FetchError::TransientNetwork(format!("no route to {}", url))),
            Some(Script::Fail(message)) => Err(FetchError::TransientNetwork(message)),
            Some(Script::Status(code)) => Err(FetchError::MalformedResponse(format!("HTTP {}", code))),
            Some(Script::Body { chunks, length, hang_after }) => {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                Ok(Box::new(ScriptedBody {
                    chunks: chunks.into(),
                    length,
                    hang_after,
                    delay: self.delay,
                    _active: ActiveGuard(Arc::clone(&self.active)),
                }))
            }
        }
    }
}

#[async_trait]
impl TransferBody for ScriptedBody {
    fn content_length(&self) -> Option<u64> {
        self.length
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.chunks.pop_front() {
            Some(chunk) => Ok(Some(chunk)),
            None if self.hang_after => std::future::pending().await,
            None => Ok(None),
        }
    }
}

// Catalog

pub fn track(id: &str) -> Track {
    Track::new(id, format!("stream/{}", id), Duration::from_secs(1)).with_details(id.to_uppercase(), "Artist", "")
}

#[derive(Default)]
pub struct MockCatalog {
    listings: Mutex<HashMap<String, CatalogListing>>,
    recommendations: Mutex<VecDeque<Vec<Track>>>,
    calls: Mutex<Vec<String>>,
}

impl MockCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_collection(&self, kind: &str, id: &str, track_ids: &[&str]) -> Arc<Playlist> {
        let playlist = Arc::new(Playlist::new(
            id.to_string(),
            format!("{} {}", kind, id),
            String::new(),
            kind == "album",
            track_ids.len() as u32,
        ));
        let tracks = track_ids
            .iter()
            .map(|t| track(t).with_playlist(Arc::clone(&playlist)))
            .collect();
        self.listings.lock().unwrap().insert(
            format!("{}:{}", kind, id),
            CatalogListing {
                playlist: Some(Arc::clone(&playlist)),
                tracks,
            },
        );
        playlist
    }

    pub fn add_track(&self, id: &str) {
        self.listings.lock().unwrap().insert(
            format!("track:{}", id),
            CatalogListing {
                playlist: None,
                tracks: vec![track(id)],
            },
        );
    }

    pub fn queue_recommendations(&self, track_ids: &[&str]) {
        let tracks = track_ids.iter().map(|t| track(t)).collect();
        self.recommendations.lock().unwrap().push_back(tracks);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn lookup(&self, kind: &'static str, id: &str) -> Result<CatalogListing, CatalogError> {
        self.calls.lock().unwrap().push(format!("{}:{}", kind, id));
        self.listings
            .lock()
            .unwrap()
            .get(&format!("{}:{}", kind, id))
            .cloned()
            .ok_or_else(|| CatalogError::NotFound { kind, id: id.to_string() })
    }
}

#[async_trait]
impl Catalog for MockCatalog {
    async fn track(&self, id: &str) -> Result<CatalogListing, CatalogError> {
        self.lookup("track", id)
    }

    async fn album(&self, id: &str) -> Result<CatalogListing, CatalogError> {
        self.lookup("album", id)
    }

    async fn playlist(&self, id: &str) -> Result<CatalogListing, CatalogError> {
        self.lookup("playlist", id)
    }

    async fn recommendations(&self, seed_ids: &[String]) -> Result<Vec<Track>, CatalogError> {
        self.calls.lock().unwrap().push(format!("recommendations:{}", seed_ids.join(",")));
        Ok(self.recommendations.lock().unwrap().pop_front().unwrap_or_default())
    }
}

// Sink

#[derive(Default)]
struct ManualSinkState {
    opens: Vec<StreamParams>,
    /// Samples already buffered when each stream was opened
    buffered_at_open: Vec<usize>,
    playing: bool,
    buffer: Option<Arc<PlaybackBuffer>>,
    fail_open: bool,
    fault: Option<String>,
}

/// Sink whose callback is driven by the test
#[derive(Clone, Default)]
pub struct ManualSink {
    state: Arc<Mutex<ManualSinkState>>,
}

impl ManualSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one callback period of `samples` samples
    pub fn render(&self, samples: usize) -> Vec<f32> {
        let mut out = vec![0.0; samples];
        let state = self.state.lock().unwrap();
        if let (true, Some(buffer)) = (state.playing, state.buffer.as_ref()) {
            buffer.render(&mut out);
        }
        out
    }

    pub fn opens(&self) -> Vec<StreamParams> {
        self.state.lock().unwrap().opens.clone()
    }

    pub fn buffered_at_open(&self) -> Vec<usize> {
        self.state.lock().unwrap().buffered_at_open.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().unwrap().playing
    }

    pub fn fail_open(&self) {
        self.state.lock().unwrap().fail_open = true;
    }

    pub fn raise_fault(&self, message: &str) {
        self.state.lock().unwrap().fault = Some(message.to_string());
    }
}

impl AudioSink for ManualSink {
    fn open(&mut self, params: StreamParams, buffer: Arc<PlaybackBuffer>) -> Result<(), AudioError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_open {
            return Err(AudioError::DeviceError("no device".to_string()));
        }
        state.opens.push(params);
        state.buffered_at_open.push(buffer.len());
        state.buffer = Some(buffer);
        state.playing = false;
        Ok(())
    }

    fn play(&mut self) -> Result<(), AudioError> {
        let mut state = self.state.lock().unwrap();
        if state.buffer.is_some() {
            state.playing = true;
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<(), AudioError> {
        self.state.lock().unwrap().playing = false;
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.buffer = None;
        state.playing = false;
    }

    fn is_open(&self) -> bool {
        self.state.lock().unwrap().buffer.is_some()
    }

    fn poll_fault(&mut self) -> Option<AudioError> {
        self.state
            .lock()
            .unwrap()
            .fault
            .take()
            .map(AudioError::DeviceError)
    }
}
