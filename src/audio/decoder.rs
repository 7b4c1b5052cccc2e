use std::collections::VecDeque;

use log::{debug, info, warn};

use symphonia::core::audio::{Channels, SampleBuffer};
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions, CODEC_TYPE_VORBIS};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet;

use crate::audio::ogg::OggPageReader;
use crate::error::DecodeError;
use crate::models::StreamParams;

/// Destination for decoded interleaved PCM
pub trait PcmSink {
    fn write(&mut self, samples: &[f32]) -> Result<(), DecodeError>;

    /// The stream ended; no more samples will be written
    fn finish(&mut self);
}

impl PcmSink for Vec<f32> {
    fn write(&mut self, samples: &[f32]) -> Result<(), DecodeError> {
        self.try_reserve(samples.len())
            .map_err(|_| DecodeError::ResourceExhaustion { requested: samples.len() })?;
        self.extend_from_slice(samples);
        Ok(())
    }

    fn finish(&mut self) {}
}

/// Codec that turns packets into interleaved `f32` PCM
pub trait PacketCodec: Send {
    /// Number of header packets preceding the audio packets
    fn header_count(&self) -> usize;

    /// Configure from the collected header packets
    fn configure(&mut self, headers: &[Vec<u8>]) -> Result<StreamParams, DecodeError>;

    /// Decode one audio packet, appending its samples to `out`
    fn decode(&mut self, packet: &[u8], out: &mut Vec<f32>) -> Result<(), DecodeError>;

    /// Free all codec state
    fn reset(&mut self);
}

/// Vorbis codec backed by symphonia
pub struct VorbisCodec {
    decoder: Option<Box<dyn Decoder>>,
    sample_buf: Option<SampleBuffer<f32>>,
    timestamp: u64,
}

impl VorbisCodec {
    pub fn new() -> Self {
        Self {
            decoder: None,
            sample_buf: None,
            timestamp: 0,
        }
    }

    /// Channel count and sample rate from the identification header
    fn parse_identification(packet: &[u8]) -> Result<StreamParams, DecodeError> {
        if packet.len() < 30 || packet[0] != 0x01 || &packet[1..7] != b"vorbis" {
            return Err(DecodeError::UnsupportedStream(
                "first packet is not a Vorbis identification header".to_string(),
            ));
        }

        let channels = packet[11] as u16;
        let sample_rate = u32::from_le_bytes([packet[12], packet[13], packet[14], packet[15]]);
        if channels == 0 || sample_rate == 0 {
            return Err(DecodeError::CodecCorruption(format!(
                "invalid stream parameters: {} channels at {} Hz",
                channels, sample_rate
            )));
        }

        Ok(StreamParams::new(channels, sample_rate))
    }

    fn channel_layout(channels: u16) -> Option<Channels> {
        if channels == 0 || channels > 8 {
            return None;
        }
        Some(Channels::from_bits_truncate((1u32 << channels) - 1))
    }
}

impl Default for VorbisCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketCodec for VorbisCodec {
    fn header_count(&self) -> usize {
        3
    }

    fn configure(&mut self, headers: &[Vec<u8>]) -> Result<StreamParams, DecodeError> {
        let [ident, comment, setup] = headers else {
            return Err(DecodeError::CodecCorruption(format!(
                "expected 3 header packets, got {}",
                headers.len()
            )));
        };

        let params = Self::parse_identification(ident)?;
        if comment.first() != Some(&0x03) || setup.first() != Some(&0x05) {
            return Err(DecodeError::CodecCorruption("malformed Vorbis header packets".to_string()));
        }

        // The decoder expects identification and setup headers back to back
        let mut extra_data = Vec::with_capacity(ident.len() + setup.len());
        extra_data.extend_from_slice(ident);
        extra_data.extend_from_slice(setup);

        let mut codec_params = CodecParameters::new();
        codec_params
            .for_codec(CODEC_TYPE_VORBIS)
            .with_sample_rate(params.sample_rate)
            .with_extra_data(extra_data.into_boxed_slice());
        if let Some(layout) = Self::channel_layout(params.channels) {
            codec_params.with_channels(layout);
        }

        let decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| DecodeError::CodecCorruption(format!("Failed to create Vorbis decoder: {}", e)))?;

        self.decoder = Some(decoder);
        self.sample_buf = None;
        self.timestamp = 0;

        Ok(params)
    }

    fn decode(&mut self, packet: &[u8], out: &mut Vec<f32>) -> Result<(), DecodeError> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| DecodeError::CodecCorruption("audio packet before headers".to_string()))?;

        let packet = Packet::new_from_slice(0, self.timestamp, 0, packet);
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(msg)) => {
                return Err(DecodeError::CodecCorruption(msg.to_string()));
            }
            Err(e) => return Err(DecodeError::CodecCorruption(e.to_string())),
        };

        let frames = decoded.frames();
        if frames == 0 {
            return Ok(());
        }
        self.timestamp += frames as u64;

        let spec = *decoded.spec();
        let needs_buffer = match &self.sample_buf {
            Some(buf) => buf.capacity() < decoded.capacity() * spec.channels.count(),
            None => true,
        };
        if needs_buffer {
            self.sample_buf = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
        }

        if let Some(buf) = self.sample_buf.as_mut() {
            buf.copy_interleaved_ref(decoded);
            out.extend_from_slice(buf.samples());
        }

        Ok(())
    }

    fn reset(&mut self) {
        self.decoder = None;
        self.sample_buf = None;
        self.timestamp = 0;
    }
}

/// Parse state of the incremental decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    Start,
    Headers,
    Decode,
    EndOfStream,
}

/// Outcome of one `feed` run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeProgress {
    /// Stream parameters, set on the run that parsed the last header
    pub params: Option<StreamParams>,
    /// Whether the parameters differ from the previous stream's
    pub reconfigure: bool,
    pub pages: usize,
    pub samples: usize,
    /// The stream reached its end on this run
    pub finished: bool,
}

/// Resumable Ogg decoder driven once per chunk of arriving bytes.
///
/// Output does not depend on how the input is chunked. The run that
/// completes the headers stops right there, so the caller can size its
/// output before any PCM of the stream is written; `resume` carries on
/// with the input already received.
pub struct DecodeContext {
    state: DecodeState,
    reader: OggPageReader,
    codec: Box<dyn PacketCodec>,
    headers: Vec<Vec<u8>>,
    /// Packets of the current page not yet handed to the codec
    backlog: VecDeque<Vec<u8>>,
    backlog_eos: bool,
    params: Option<StreamParams>,
    previous_params: Option<StreamParams>,
    stall_count: u32,
    stall_threshold: u32,
    scratch: Vec<f32>,
}

impl DecodeContext {
    pub fn new(codec: Box<dyn PacketCodec>, stall_threshold: u32) -> Self {
        Self {
            state: DecodeState::Start,
            reader: OggPageReader::new(),
            codec,
            headers: Vec::with_capacity(3),
            backlog: VecDeque::new(),
            backlog_eos: false,
            params: None,
            previous_params: None,
            stall_count: 0,
            stall_threshold: stall_threshold.max(1),
            scratch: Vec::new(),
        }
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    pub fn params(&self) -> Option<StreamParams> {
        self.params
    }

    pub fn stall_count(&self) -> u32 {
        self.stall_count
    }

    /// Prepare for a new track, remembering the current stream's parameters
    pub fn restart(&mut self) {
        if self.state != DecodeState::EndOfStream {
            self.codec.reset();
        }
        if let Some(params) = self.params.take() {
            self.previous_params = Some(params);
        }
        self.state = DecodeState::Start;
        self.reader.reset();
        self.headers.clear();
        self.backlog.clear();
        self.backlog_eos = false;
        self.stall_count = 0;
        self.scratch.clear();
    }

    /// Feed newly arrived bytes; an empty slice polls for a stalled stream
    pub fn feed<S: PcmSink + ?Sized>(&mut self, bytes: &[u8], sink: &mut S) -> Result<DecodeProgress, DecodeError> {
        self.run(bytes, sink, true)
    }

    /// Continue with input already received, after a run stopped at the headers.
    ///
    /// Never counts towards the stall threshold.
    pub fn resume<S: PcmSink + ?Sized>(&mut self, sink: &mut S) -> Result<DecodeProgress, DecodeError> {
        self.run(&[], sink, false)
    }

    fn run<S: PcmSink + ?Sized>(&mut self, bytes: &[u8], sink: &mut S, poll: bool) -> Result<DecodeProgress, DecodeError> {
        let mut progress = DecodeProgress::default();

        match self.state {
            DecodeState::EndOfStream => return Ok(progress),
            DecodeState::Start => self.state = DecodeState::Headers,
            DecodeState::Headers | DecodeState::Decode => {}
        }

        self.reader.push(bytes);
        let had_backlog = !self.backlog.is_empty() || self.backlog_eos;

        loop {
            if self.drain_backlog(sink, &mut progress)? || progress.params.is_some() {
                return Ok(progress);
            }

            let Some(page) = self.reader.next_page() else { break };
            progress.pages += 1;
            self.backlog_eos = page.is_eos();
            self.backlog.extend(page.packets);
        }

        if progress.pages > 0 || !bytes.is_empty() || had_backlog || !poll {
            self.stall_count = 0;
        } else {
            // Heuristic: a source that stops delivering without an end page
            self.stall_count += 1;
            if self.stall_count >= self.stall_threshold {
                warn!(
                    "No progress after {} runs, treating stream as ended",
                    self.stall_count
                );
                self.finish(sink);
                progress.finished = true;
            }
        }

        Ok(progress)
    }

    /// Hand queued packets to the codec; true once the stream has ended.
    ///
    /// Stops early when the last header was just accepted.
    fn drain_backlog<S: PcmSink + ?Sized>(&mut self, sink: &mut S, progress: &mut DecodeProgress) -> Result<bool, DecodeError> {
        while let Some(packet) = self.backlog.pop_front() {
            match self.state {
                DecodeState::Headers => {
                    self.accept_header(&packet, progress)?;
                    if progress.params.is_some() {
                        return Ok(false);
                    }
                }
                DecodeState::Decode => {
                    self.scratch.clear();
                    self.codec.decode(&packet, &mut self.scratch)?;
                    if !self.scratch.is_empty() {
                        sink.write(&self.scratch)?;
                        progress.samples += self.scratch.len();
                    }
                }
                DecodeState::Start | DecodeState::EndOfStream => {}
            }
        }

        if self.backlog_eos {
            debug!("End of stream page after {} pages", progress.pages);
            self.finish(sink);
            progress.finished = true;
            return Ok(true);
        }
        Ok(false)
    }

    fn accept_header(&mut self, packet: &[u8], progress: &mut DecodeProgress) -> Result<(), DecodeError> {
        self.headers.push(packet.to_vec());
        if self.headers.len() < self.codec.header_count() {
            return Ok(());
        }

        let params = self.codec.configure(&self.headers)?;
        self.headers.clear();
        self.state = DecodeState::Decode;

        progress.reconfigure = self.previous_params != Some(params);
        progress.params = Some(params);
        self.params = Some(params);

        info!("Stream parameters: {}", params);
        Ok(())
    }

    fn finish<S: PcmSink + ?Sized>(&mut self, sink: &mut S) {
        self.state = DecodeState::EndOfStream;
        self.codec.reset();
        self.headers.clear();
        self.backlog.clear();
        self.backlog_eos = false;
        self.reader.reset();
        sink.finish();
    }
}
