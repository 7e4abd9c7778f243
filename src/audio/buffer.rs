//! # Decoded Audio Buffer
//!
//! The ephemeral result of one pass through the codec adapter: ordered signed
//! 16-bit samples at a fixed rate. A buffer is produced per turn, handed to the
//! gateway, serialized for the avatar renderer and dropped. It is never kept in
//! the session history.

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Cursor;

/// PCM16 samples ready for the avatar renderer.
///
/// ## Rust Concepts:
/// - **Vec<i16>**: owned sample storage, moved (not copied) into the gateway
/// - **u32 / u16**: sample rate and channel count match the WAV header field widths
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudioBuffer {
    samples: Vec<i16>,
    sample_rate: u32,
    channels: u16,
}

impl DecodedAudioBuffer {
    /// Wrap already-normalized mono samples.
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback length of the buffer.
    ///
    /// ## Calculation:
    /// Duration = number_of_samples / sample_rate
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Serialize as raw little-endian PCM16, the layout the renderer's
    /// `feed(pcm16Samples, 16000, 1)` expects in a binary WebSocket frame.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for &sample in &self.samples {
            // Writing into a Vec cannot fail
            let _ = out.write_i16::<LittleEndian>(sample);
        }
        out
    }

    /// Wrap the samples in a WAV container so tooling can play back exactly
    /// what the renderer receives.
    pub fn to_wav(&self) -> std::io::Result<Vec<u8>> {
        let header = wav::Header::new(
            wav::header::WAV_FORMAT_PCM,
            self.channels,
            self.sample_rate,
            16,
        );
        let mut cursor = Cursor::new(Vec::new());
        wav::write(header, &wav::BitDepth::Sixteen(self.samples.clone()), &mut cursor)?;
        Ok(cursor.into_inner())
    }
}
