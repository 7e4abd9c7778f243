//! # Compressed Audio Decoding
//!
//! Decodes whatever the speech-synthesis collaborator returns (MP3 in
//! practice, WAV/PCM in tests and for some providers) into float PCM and hands
//! it to the [`AudioProcessor`] for resampling and quantization.
//!
//! ## Shared decoding context:
//! Symphonia needs a format probe and a codec registry. Building them walks
//! every enabled format/codec, so they are built once per process behind a
//! `OnceLock` and shared by every session. This is the only cross-session
//! resource in the audio pipeline; each decode call is otherwise independent.

use crate::audio::buffer::DecodedAudioBuffer;
use crate::audio::processor::AudioProcessor;
use crate::error::ConversationError;
use std::io::Cursor;
use std::sync::OnceLock;
use symphonia::core::audio::{AudioBufferRef, SampleBuffer};
use symphonia::core::codecs::{CodecRegistry, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::{Hint, Probe};
use tracing::debug;

/// Process-wide decoder context, initialized on first use.
static DECODER_CONTEXT: OnceLock<DecoderContext> = OnceLock::new();

/// Format probe and codec registry shared by all decode calls.
struct DecoderContext {
    probe: Probe,
    codecs: CodecRegistry,
}

impl DecoderContext {
    fn get() -> &'static DecoderContext {
        DECODER_CONTEXT.get_or_init(|| {
            debug!("Building shared audio decoder context");
            let mut probe = Probe::default();
            symphonia::default::register_enabled_formats(&mut probe);
            let mut codecs = CodecRegistry::new();
            symphonia::default::register_enabled_codecs(&mut codecs);
            DecoderContext { probe, codecs }
        })
    }
}

/// Float PCM of the first channel at the stream's native rate.
#[derive(Debug, Clone)]
pub struct NativePcm {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: usize,
}

/// `decode_and_normalize(compressed) -> DecodedAudioBuffer | AudioDecodeError`.
///
/// ## Thread Safety:
/// Holds no mutable state, so one adapter can be cloned into blocking tasks
/// for any number of sessions at once.
#[derive(Debug, Clone, Default)]
pub struct AudioCodecAdapter {
    processor: AudioProcessor,
}

impl AudioCodecAdapter {
    pub fn new(processor: AudioProcessor) -> Self {
        Self { processor }
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.processor.target_sample_rate()
    }

    /// Decode, keep channel 0, resample, quantize.
    ///
    /// Malformed input fails with `AudioDecodeError`. Decoding is deterministic,
    /// so the caller never retries.
    pub fn decode_and_normalize(
        &self,
        compressed: &[u8],
    ) -> Result<DecodedAudioBuffer, ConversationError> {
        let native = decode_first_channel(compressed)?;
        let buffer = self.processor.normalize(&native.samples, native.sample_rate);

        debug!(
            native_rate = native.sample_rate,
            native_channels = native.channels,
            native_samples = native.samples.len(),
            output_samples = buffer.len(),
            "Normalized synthesized speech"
        );

        Ok(buffer)
    }
}

/// Decode a compressed stream to float PCM, keeping only channel 0.
pub fn decode_first_channel(compressed: &[u8]) -> Result<NativePcm, ConversationError> {
    if compressed.is_empty() {
        return Err(ConversationError::AudioDecodeError("audio payload is empty".to_string()));
    }

    let context = DecoderContext::get();
    let cursor = Cursor::new(compressed.to_vec());
    let source = MediaSourceStream::new(Box::new(cursor), Default::default());

    let probed = context
        .probe
        .format(&Hint::new(), source, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| decode_error("unrecognized audio format", e))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| ConversationError::AudioDecodeError("no audio track found".to_string()))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(0);

    let mut decoder = context
        .codecs
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| decode_error("unsupported codec", e))?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break
            }
            Err(err) => return Err(decode_error("failed reading audio packets", err)),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                if sample_rate == 0 {
                    sample_rate = spec.rate;
                }
                channels = spec.channels.count().max(1);
                append_first_channel(decoded, channels, &mut samples);
            }
            // A corrupt frame is skipped; the stream as a whole only fails if nothing decodes
            Err(SymphoniaError::DecodeError(reason)) => {
                debug!("Skipping undecodable audio packet: {}", reason);
            }
            Err(err) => return Err(decode_error("failed decoding audio packet", err)),
        }
    }

    if sample_rate == 0 {
        return Err(ConversationError::AudioDecodeError(
            "audio is missing sample rate metadata".to_string(),
        ));
    }
    if samples.is_empty() {
        return Err(ConversationError::AudioDecodeError(
            "audio decoded to zero samples".to_string(),
        ));
    }

    Ok(NativePcm {
        samples,
        sample_rate,
        channels: channels.max(1),
    })
}

fn append_first_channel(decoded: AudioBufferRef<'_>, channels: usize, out: &mut Vec<f32>) {
    let mut interleaved = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
    interleaved.copy_interleaved_ref(decoded);
    let data = interleaved.samples();

    if channels <= 1 {
        out.extend_from_slice(data);
    } else {
        out.extend(data.iter().step_by(channels).copied());
    }
}

fn decode_error(context: &str, err: SymphoniaError) -> ConversationError {
    ConversationError::AudioDecodeError(format!("{}: {}", context, err))
}
