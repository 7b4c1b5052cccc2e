use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use log::{debug, error, info};

use crate::audio::buffer::PlaybackBuffer;
use crate::audio::device::DeviceManager;
use crate::error::AudioError;
use crate::models::StreamParams;

/// Samples converted per pass for integer device formats
const SCRATCH_SAMPLES: usize = 8192;

/// Real-time audio output draining a `PlaybackBuffer`
pub trait AudioSink {
    /// Open an output stream for `params`; the stream starts paused
    fn open(&mut self, params: StreamParams, buffer: Arc<PlaybackBuffer>) -> Result<(), AudioError>;

    fn play(&mut self) -> Result<(), AudioError>;

    fn pause(&mut self) -> Result<(), AudioError>;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Error reported by the device since the last poll
    fn poll_fault(&mut self) -> Option<AudioError> {
        None
    }
}

/// Output sink on the platform audio device
pub struct CpalSink {
    devices: Option<DeviceManager>,
    preferred_device: Option<String>,
    stream: Option<Stream>,
    fault: Arc<Mutex<Option<String>>>,
}

impl CpalSink {
    pub fn new(preferred_device: Option<String>) -> Self {
        Self {
            devices: None,
            preferred_device,
            stream: None,
            fault: Arc::new(Mutex::new(None)),
        }
    }

    fn device_manager(&mut self) -> Result<&mut DeviceManager, AudioError> {
        if self.devices.is_none() {
            let mut manager = DeviceManager::new()?;
            manager.select_device_with_fallback(self.preferred_device.as_deref())?;
            if let Some(name) = manager.current_device_name() {
                info!("Using audio device: {}", name);
            }
            self.devices = Some(manager);
        }

        self.devices
            .as_mut()
            .ok_or_else(|| AudioError::DeviceError("No audio device available".to_string()))
    }

    fn build_stream<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        buffer: Arc<PlaybackBuffer>,
        fault: Arc<Mutex<Option<String>>>,
    ) -> Result<Stream, AudioError>
    where
        T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
    {
        let mut scratch = vec![0.0f32; SCRATCH_SAMPLES];

        let stream = device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    for chunk in data.chunks_mut(SCRATCH_SAMPLES) {
                        let pcm = &mut scratch[..chunk.len()];
                        buffer.render(pcm);
                        for (out, sample) in chunk.iter_mut().zip(pcm.iter()) {
                            *out = cpal::Sample::from_sample(*sample);
                        }
                    }
                },
                move |err| {
                    error!("Audio stream error: {}", err);
                    if let Ok(mut slot) = fault.lock() {
                        *slot = Some(err.to_string());
                    }
                },
                None,
            )
            .map_err(|e| AudioError::DeviceError(format!("Failed to build output stream: {}", e)))?;

        Ok(stream)
    }
}

impl AudioSink for CpalSink {
    fn open(&mut self, params: StreamParams, buffer: Arc<PlaybackBuffer>) -> Result<(), AudioError> {
        self.close();

        let fault = Arc::clone(&self.fault);
        let manager = self.device_manager()?;
        let (config, format) = manager.stream_config(params)?;
        let device = manager
            .current_device()
            .ok_or_else(|| AudioError::DeviceError("No output device selected".to_string()))?;

        let stream = match format {
            SampleFormat::F32 => Self::build_stream::<f32>(device, &config, buffer, fault)?,
            SampleFormat::I16 => Self::build_stream::<i16>(device, &config, buffer, fault)?,
            SampleFormat::U16 => Self::build_stream::<u16>(device, &config, buffer, fault)?,
            other => {
                return Err(AudioError::UnsupportedSampleFormat {
                    format: format!("{:?}", other),
                })
            }
        };

        stream
            .pause()
            .map_err(|e| AudioError::StreamError(format!("Failed to pause new stream: {}", e)))?;

        debug!("Opened {:?} output stream for {}", format, params);
        self.stream = Some(stream);
        Ok(())
    }

    fn play(&mut self) -> Result<(), AudioError> {
        match &self.stream {
            Some(stream) => stream
                .play()
                .map_err(|e| AudioError::StreamError(format!("Failed to start stream: {}", e))),
            None => Ok(()),
        }
    }

    fn pause(&mut self) -> Result<(), AudioError> {
        match &self.stream {
            Some(stream) => stream
                .pause()
                .map_err(|e| AudioError::StreamError(format!("Failed to pause stream: {}", e))),
            None => Ok(()),
        }
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("Closed output stream");
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn poll_fault(&mut self) -> Option<AudioError> {
        let message = self.fault.lock().ok()?.take()?;
        Some(AudioError::StreamError(message))
    }
}
