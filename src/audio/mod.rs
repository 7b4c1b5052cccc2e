//! Audio path from encoded Ogg bytes to the output device.

pub mod buffer;
pub mod decoder;
pub mod device;
pub mod ogg;
pub mod output;

pub use buffer::{BufferSnapshot, PlaybackBuffer};
pub use decoder::{DecodeContext, DecodeProgress, DecodeState, PacketCodec, PcmSink, VorbisCodec};
pub use device::DeviceManager;
pub use ogg::{OggPage, OggPageReader};
pub use output::{AudioSink, CpalSink};
