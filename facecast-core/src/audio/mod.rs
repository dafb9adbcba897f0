//! Host-side audio helpers: sample-format conversion, channel downmix and
//! rate conversion. The pipeline itself only ever sees mono f32 at the
//! model rate.

pub mod resample;

pub use resample::{resample_linear, RateConverter};

/// Signed 16-bit PCM to f32 in [-1, 1).
pub fn pcm16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| f32::from(s) / 32768.0).collect()
}

/// Average interleaved frames down to mono. A trailing partial frame is
/// dropped. `channels <= 1` copies the input.
pub fn downmix_interleaved(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}
