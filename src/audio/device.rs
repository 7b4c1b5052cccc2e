use cpal::{Device, Host, SampleFormat, SampleRate, StreamConfig};
use cpal::traits::{DeviceTrait, HostTrait};
use std::collections::HashMap;
use crate::error::AudioError;
use crate::models::StreamParams;

/// Sample formats the output stream can be built for, best first
const PREFERRED_FORMATS: [SampleFormat; 3] = [SampleFormat::F32, SampleFormat::I16, SampleFormat::U16];

/// Manages audio device enumeration and selection
pub struct DeviceManager {
    host: Host,
    devices: HashMap<String, Device>,
    current_device: Option<Device>,
}

impl DeviceManager {
    /// Create a new DeviceManager instance
    pub fn new() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let mut manager = DeviceManager {
            host,
            devices: HashMap::new(),
            current_device: None,
        };

        manager.refresh_devices()?;
        Ok(manager)
    }

    /// Refresh the list of available audio devices
    pub fn refresh_devices(&mut self) -> Result<(), AudioError> {
        self.devices.clear();

        let devices = self.host.output_devices()
            .map_err(|e| AudioError::DeviceError(format!("Failed to enumerate devices: {}", e)))?;

        for device in devices {
            // Devices that cannot report a name cannot be selected either
            if let Ok(name) = device.name() {
                self.devices.insert(name, device);
            }
        }

        Ok(())
    }

    /// Get a list of all available device names
    pub fn list_devices(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.keys().cloned().collect();
        names.sort();
        names
    }

    /// Select a device by name; `None` selects the default device
    pub fn select_device(&mut self, device_name: Option<&str>) -> Result<(), AudioError> {
        match device_name {
            Some(name) => {
                let device = self.devices.get(name).cloned().ok_or_else(|| AudioError::DeviceNotFound {
                    device: name.to_string(),
                })?;
                self.current_device = Some(device);
                Ok(())
            }
            None => self.select_default_device(),
        }
    }

    /// Select a device by name with fallback to default device
    pub fn select_device_with_fallback(&mut self, device_name: Option<&str>) -> Result<(), AudioError> {
        match self.select_device(device_name) {
            Err(AudioError::DeviceNotFound { device }) => {
                log::warn!("Audio device '{}' not found, using the default device", device);
                self.select_default_device()
                    .map_err(|_| AudioError::DeviceNotFound { device })
            }
            result => result,
        }
    }

    /// Select the default audio device
    pub fn select_default_device(&mut self) -> Result<(), AudioError> {
        let default_device = self.host.default_output_device()
            .ok_or_else(|| AudioError::DeviceError("No default output device available".to_string()))?;

        self.current_device = Some(default_device);
        Ok(())
    }

    /// Get the currently selected device
    pub fn current_device(&self) -> Option<&Device> {
        self.current_device.as_ref()
    }

    /// Get the name of the currently selected device
    pub fn current_device_name(&self) -> Option<String> {
        self.current_device.as_ref().and_then(|device| device.name().ok())
    }

    /// Find a stream configuration on the current device that plays `params` natively
    pub fn stream_config(&self, params: StreamParams) -> Result<(StreamConfig, SampleFormat), AudioError> {
        let device = self.current_device.as_ref()
            .ok_or_else(|| AudioError::DeviceError("No output device selected".to_string()))?;

        let ranges: Vec<_> = device.supported_output_configs()
            .map_err(|e| AudioError::DeviceError(format!("Failed to query output configurations: {}", e)))?
            .filter(|range| {
                range_supports(range.channels(), range.min_sample_rate().0, range.max_sample_rate().0, params)
            })
            .collect();

        let format = PREFERRED_FORMATS
            .iter()
            .copied()
            .find(|format| ranges.iter().any(|range| range.sample_format() == *format))
            .ok_or_else(|| match ranges.first() {
                Some(range) => AudioError::UnsupportedSampleFormat {
                    format: format!("{:?}", range.sample_format()),
                },
                None => AudioError::DeviceError(format!("Device cannot play {}", params)),
            })?;

        let config = StreamConfig {
            channels: params.channels,
            sample_rate: SampleRate(params.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        Ok((config, format))
    }
}

fn range_supports(channels: u16, min_rate: u32, max_rate: u32, params: StreamParams) -> bool {
    channels == params.channels && (min_rate..=max_rate).contains(&params.sample_rate)
}
