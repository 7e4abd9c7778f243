//! # Resampling and Quantization
//!
//! Converts decoded floating-point speech into the renderer's format.
//!
//! ## Key Functions:
//! - **resample_linear**: change sample rate using linear interpolation
//! - **quantize_sample / quantize**: `f32` in [-1.0, 1.0] -> `i16`
//! - **AudioProcessor**: applies both for a fixed target rate
//!
//! The resampler is deliberately low-complexity (no windowed-sinc filter).
//! It is good enough for speech-quality lip-sync.

use crate::audio::buffer::DecodedAudioBuffer;
use crate::config::AudioConfig;

/// Resample `input` from `input_rate` to `output_rate` with linear interpolation.
///
/// ## Method:
/// - `ratio = input_rate / output_rate`
/// - output length is `floor(input.len() / ratio)`
/// - output sample `i` reads source position `i * ratio` and blends the two
///   bracketing input samples by the fractional part
///
/// Equal rates return the input unchanged.
pub fn resample_linear(input: &[f32], input_rate: u32, output_rate: u32) -> Vec<f32> {
    if input_rate == output_rate || input.is_empty() || input_rate == 0 || output_rate == 0 {
        return input.to_vec();
    }

    let ratio = input_rate as f64 / output_rate as f64;
    let output_len = (input.len() as f64 / ratio).floor() as usize;
    let last = input.len() - 1;

    let mut output = Vec::with_capacity(output_len);
    for i in 0..output_len {
        let position = i as f64 * ratio;
        let lower = (position.floor() as usize).min(last);
        let upper = (lower + 1).min(last);
        let fraction = (position - lower as f64) as f32;

        output.push(input[lower] * (1.0 - fraction) + input[upper] * fraction);
    }

    output
}

/// Map one float sample to signed 16-bit: `clamp(round(s * 32768), -32768, 32767)`.
///
/// Rounding rather than truncation keeps quantization unbiased; clamping
/// covers decoders that overshoot the nominal range. NaN maps to silence.
pub fn quantize_sample(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    (sample * 32768.0).round().clamp(-32768.0, 32767.0) as i16
}

pub fn quantize(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| quantize_sample(s)).collect()
}

/// Converts native-rate float speech into renderer-ready PCM16.
///
/// ## Purpose:
/// Holds the target format so the codec adapter does not have to thread it
/// through every call.
#[derive(Debug, Clone)]
pub struct AudioProcessor {
    target_sample_rate: u32,
}

impl AudioProcessor {
    pub fn new(target_sample_rate: u32) -> Self {
        Self { target_sample_rate }
    }

    pub fn from_config(config: &AudioConfig) -> Self {
        Self::new(config.target_sample_rate)
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    /// Resample mono `samples` from `native_rate` and quantize.
    pub fn normalize(&self, samples: &[f32], native_rate: u32) -> DecodedAudioBuffer {
        let resampled = resample_linear(samples, native_rate, self.target_sample_rate);
        DecodedAudioBuffer::new(quantize(&resampled), self.target_sample_rate)
    }
}

impl Default for AudioProcessor {
    fn default() -> Self {
        Self::new(16000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> Vec<f32> {
        (0..len).map(|i| ((i % 200) as f32 / 100.0) - 1.0).collect()
    }

    #[test]
    fn test_resample_identity_at_same_rate() {
        let input = ramp(1234);
        assert_eq!(resample_linear(&input, 16000, 16000), input);
        assert!(resample_linear(&[], 16000, 16000).is_empty());
    }

    #[test]
    fn test_resample_length_is_floor_of_len_over_ratio() {
        let cases = [
            (44100u32, 1000usize),
            (44100, 44100),
            (48000, 4801),
            (22050, 17),
            (32000, 3),
            (24000, 1),
            (16001, 16001),
        ];
        for (rate, len) in cases {
            let input = ramp(len);
            let ratio = rate as f64 / 16000.0;
            let expected = (len as f64 / ratio).floor() as usize;
            let output = resample_linear(&input, rate, 16000);
            assert_eq!(output.len(), expected, "rate {} len {}", rate, len);
        }
    }

    #[test]
    fn test_resample_interpolates_between_neighbours() {
        // 32kHz -> 16kHz picks every other sample exactly
        let input = vec![0.0, 0.5, 1.0, 0.5, 0.0, -0.5];
        let output = resample_linear(&input, 32000, 16000);
        assert_eq!(output, vec![0.0, 1.0, 0.0]);

        // 24kHz -> 16kHz: positions 0, 1.5, 3.0
        let input = vec![0.0, 0.2, 0.4, 0.6, 0.8, 1.0];
        let output = resample_linear(&input, 24000, 16000);
        assert_eq!(output.len(), 4);
        assert!((output[1] - 0.3).abs() < 1e-6);
        assert!((output[2] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_quantize_rounds_and_clamps() {
        assert_eq!(quantize_sample(0.0), 0);
        assert_eq!(quantize_sample(1.0), 32767);
        assert_eq!(quantize_sample(-1.0), -32768);
        assert_eq!(quantize_sample(0.5), 16384);
        // 0.75 / 32768 rounds up, truncation would give 0
        assert_eq!(quantize_sample(0.75 / 32768.0), 1);
        assert_eq!(quantize_sample(f32::NAN), 0);
    }

    #[test]
    fn test_quantize_bounds_outside_nominal_range() {
        let mut s = -1.5f32;
        while s <= 1.5 {
            let q = quantize_sample(s) as i32;
            assert!((-32768..=32767).contains(&q));
            s += 0.001;
        }
        assert_eq!(quantize_sample(1.5), 32767);
        assert_eq!(quantize_sample(-1.5), -32768);
    }

    #[test]
    fn test_processor_normalizes_to_target_rate() {
        let processor = AudioProcessor::new(16000);
        let input = vec![0.25f32; 48000];
        let buffer = processor.normalize(&input, 48000);
        assert_eq!(buffer.sample_rate(), 16000);
        assert_eq!(buffer.len(), 16000);
        assert!(buffer.samples().iter().all(|&s| s == 8192));
    }
}
