use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use crate::audio::decoder::PcmSink;
use crate::error::DecodeError;

const NO_SEEK: usize = usize::MAX;

#[derive(Debug, Default)]
struct PcmStore {
    samples: Vec<f32>,
    offset: usize,
    finished: bool,
    over: bool,
}

/// Offsets of the buffer at one instant, in samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSnapshot {
    pub offset: usize,
    pub len: usize,
    pub size: usize,
    pub finished: bool,
}

/// PCM store shared between the decoder and the real-time callback.
///
/// The decoder appends under the store lock; the callback only ever
/// `try_lock`s it and plays silence when the lock is contended. `len` and
/// `offset` are mirrored in atomics for lock-free position queries, and seek
/// requests are parked in `pending_seek` until the next callback applies
/// them, so the callback is the only writer of the read cursor.
#[derive(Debug)]
pub struct PlaybackBuffer {
    store: Mutex<PcmStore>,
    len: AtomicUsize,
    offset: AtomicUsize,
    size: AtomicUsize,
    pending_seek: AtomicUsize,
    volume: AtomicU32,
    gain_trim: AtomicU32,
    paused: AtomicBool,
    track_over: AtomicBool,
    underruns: AtomicU64,
}

impl PlaybackBuffer {
    pub fn new(volume: f32, gain_trim: f32) -> Self {
        Self {
            store: Mutex::new(PcmStore::default()),
            len: AtomicUsize::new(0),
            offset: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
            pending_seek: AtomicUsize::new(NO_SEEK),
            volume: AtomicU32::new(volume.clamp(0.0, 1.0).to_bits()),
            gain_trim: AtomicU32::new(gain_trim.to_bits()),
            paused: AtomicBool::new(false),
            track_over: AtomicBool::new(false),
            underruns: AtomicU64::new(0),
        }
    }

    fn lock_store(&self) -> MutexGuard<'_, PcmStore> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Real-time callback body: fill `out` with the next interleaved samples.
    ///
    /// Never allocates and never waits for the store lock.
    pub fn render(&self, out: &mut [f32]) {
        let mut store = match self.store.try_lock() {
            Ok(store) => store,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                out.fill(0.0);
                self.underruns.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let seek = self.pending_seek.swap(NO_SEEK, Ordering::AcqRel);
        if seek != NO_SEEK {
            if seek > store.samples.len() {
                store.over = true;
                self.track_over.store(true, Ordering::Release);
            } else {
                store.offset = seek;
                store.over = false;
                self.offset.store(seek, Ordering::Release);
            }
        }

        if store.over || self.paused.load(Ordering::Acquire) {
            out.fill(0.0);
            return;
        }

        let offset = store.offset;
        let available = store.samples.len() - offset;
        let count = out.len().min(available);
        let gain = f32::from_bits(self.volume.load(Ordering::Relaxed))
            * f32::from_bits(self.gain_trim.load(Ordering::Relaxed));

        for (dst, src) in out[..count].iter_mut().zip(&store.samples[offset..offset + count]) {
            *dst = src * gain;
        }
        out[count..].fill(0.0);

        store.offset = offset + count;
        self.offset.store(store.offset, Ordering::Release);

        if count < out.len() {
            if store.finished {
                store.over = true;
                self.track_over.store(true, Ordering::Release);
            } else {
                self.underruns.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Append decoded samples, doubling the store when it is full
    pub fn append(&self, samples: &[f32]) -> Result<(), DecodeError> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut store = self.lock_store();
        let needed = store.samples.len() + samples.len();
        if needed > store.samples.capacity() {
            let target = needed.max(store.samples.capacity().saturating_mul(2));
            let additional = target - store.samples.len();
            store
                .samples
                .try_reserve_exact(additional)
                .map_err(|_| DecodeError::ResourceExhaustion { requested: additional })?;
            self.size.store(store.samples.capacity(), Ordering::Release);
        }

        store.samples.extend_from_slice(samples);
        self.len.store(store.samples.len(), Ordering::Release);
        Ok(())
    }

    /// Swap in an empty store sized for `capacity` samples.
    ///
    /// The callback sees either the old store or the new one, never a mix.
    pub fn replace(&self, capacity: usize) -> Result<(), DecodeError> {
        let mut samples = Vec::new();
        samples
            .try_reserve_exact(capacity)
            .map_err(|_| DecodeError::ResourceExhaustion { requested: capacity })?;

        let mut fresh = PcmStore {
            samples,
            ..PcmStore::default()
        };

        {
            let mut store = self.lock_store();
            std::mem::swap(&mut *store, &mut fresh);
            self.pending_seek.store(NO_SEEK, Ordering::Release);
            self.track_over.store(false, Ordering::Release);
            self.len.store(0, Ordering::Release);
            self.offset.store(0, Ordering::Release);
            self.size.store(store.samples.capacity(), Ordering::Release);
        }

        // The previous track's samples are freed outside the lock
        drop(fresh);
        Ok(())
    }

    /// Play the buffered track again from the start
    pub fn restart(&self) {
        self.track_over.store(false, Ordering::Release);
        self.request_seek(0);
    }

    /// Queue a seek to an interleaved sample offset; applied by the next callback
    pub fn request_seek(&self, sample_offset: usize) {
        self.pending_seek.store(sample_offset.min(NO_SEEK - 1), Ordering::Release);
    }

    pub fn mark_finished(&self) {
        self.lock_store().finished = true;
    }

    /// Consume the track-over signal raised by the callback
    pub fn take_track_over(&self) -> bool {
        self.track_over.swap(false, Ordering::AcqRel)
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume.store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Read cursor, reporting a pending seek as already applied
    pub fn position(&self) -> usize {
        match self.pending_seek.load(Ordering::Acquire) {
            NO_SEEK => self.offset.load(Ordering::Acquire),
            seek => seek.min(self.len.load(Ordering::Acquire)),
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> BufferSnapshot {
        let store = self.lock_store();
        BufferSnapshot {
            offset: store.offset,
            len: store.samples.len(),
            size: store.samples.capacity(),
            finished: store.finished,
        }
    }
}

impl PcmSink for Arc<PlaybackBuffer> {
    fn write(&mut self, samples: &[f32]) -> Result<(), DecodeError> {
        self.append(samples)
    }

    fn finish(&mut self) {
        self.mark_finished();
    }
}
