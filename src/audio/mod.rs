//! # Audio Codec Adapter
//!
//! Turns the compressed speech returned by the synthesis collaborator into the
//! format the avatar renderer consumes.
//!
//! ## Pipeline:
//! 1. **Decode** (`codec`): compressed bytes -> `f32` PCM at the native rate
//! 2. **Channel reduction** (`codec`): keep channel 0 only
//! 3. **Resample** (`processor`): linear interpolation to the target rate
//! 4. **Quantize** (`processor`): `f32` -> signed 16-bit with rounding and clamping
//!
//! ## Output Format:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers on the wire

pub mod buffer;       // Decoded PCM16 buffer handed to the gateway
pub mod codec;        // Compressed audio decoding and the shared decoder context
pub mod processor;    // Resampling and quantization

pub use buffer::DecodedAudioBuffer;
pub use codec::AudioCodecAdapter;
