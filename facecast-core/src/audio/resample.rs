//! Sample-rate conversion.
//!
//! Two flavours:
//!
//! - [`resample_linear`]: one-shot linear interpolation over a whole clip.
//!   Used for offline utterances where the whole signal is at hand.
//! - [`RateConverter`]: streaming rubato `FastFixedIn` (cubic) that carries
//!   partial chunks across calls. Used by the live engine when the host
//!   pushes audio at a rate other than the model's.
//!
//! Both are identity when the rates match.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{error, info};

use crate::error::{FacecastError, Result};

/// Linear resample of `signal` from `from_rate` to `to_rate`.
///
/// Output length is `floor(len × to/from)`. Output sample `i` reads input
/// position `i × from/to`; positions past the last input sample repeat it.
///
/// # Errors
/// `FacecastError::Range` if either rate is zero.
pub fn resample_linear(signal: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == 0 || to_rate == 0 {
        return Err(FacecastError::range(format!(
            "sample rates must be > 0 (from={from_rate}, to={to_rate})"
        )));
    }
    if from_rate == to_rate || signal.is_empty() {
        return Ok(signal.to_vec());
    }

    // Integer floor avoids 15999.999… style rounding on exact ratios.
    let out_len = (signal.len() as u64 * u64::from(to_rate) / u64::from(from_rate)) as usize;
    let step = f64::from(from_rate) / f64::from(to_rate);
    let last = signal.len() - 1;

    let out = (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            if idx >= last {
                return signal[last];
            }
            let frac = (pos - idx as f64) as f32;
            signal[idx] + (signal[idx + 1] - signal[idx]) * frac
        })
        .collect();
    Ok(out)
}

/// Streaming mono f32 converter between two fixed rates.
pub struct RateConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    /// Partial input carried between calls.
    pending: Vec<f32>,
    chunk_size: usize,
    /// `[1][output_frames_max]`
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// `FacecastError::Range` for a zero rate or chunk size,
    /// `FacecastError::Config` if rubato rejects the parameters.
    pub fn new(input_rate: u32, output_rate: u32, chunk_size: usize) -> Result<Self> {
        if input_rate == 0 || output_rate == 0 || chunk_size == 0 {
            return Err(FacecastError::range(format!(
                "invalid converter parameters (in={input_rate}, out={output_rate}, chunk={chunk_size})"
            )));
        }
        if input_rate == output_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            f64::from(output_rate) / f64::from(input_rate),
            1.0,
            PolynomialDegree::Cubic,
            chunk_size,
            1,
        )
        .map_err(|e| FacecastError::Config(format!("resampler init: {e}")))?;

        let output_buf = vec![vec![0f32; resampler.output_frames_max()]; 1];
        info!(input_rate, output_rate, chunk_size, "live rate conversion enabled");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            output_buf,
        })
    }

    /// Convert `samples`, returning whatever full chunks produced. Input
    /// short of a chunk is held for the next call.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        let mut offset = 0;
        while self.pending.len() - offset >= self.chunk_size {
            let chunk = &self.pending[offset..offset + self.chunk_size];
            match resampler.process_into_buffer(&[chunk], &mut self.output_buf, None) {
                Ok((_, produced)) => out.extend_from_slice(&self.output_buf[0][..produced]),
                Err(e) => error!("resampler process error: {e}"),
            }
            offset += self.chunk_size;
        }
        self.pending.drain(..offset);
        out
    }

    /// Samples waiting for a full chunk.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Drop carried input and rubato's internal history.
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(r) = self.resampler.as_mut() {
            r.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn linear_same_rate_is_identity() {
        let x: Vec<f32> = (0..100).map(|i| (i as f32 * 0.1).sin()).collect();
        assert_eq!(resample_linear(&x, 22_050, 22_050).unwrap(), x);
        assert!(resample_linear(&[], 48_000, 16_000).unwrap().is_empty());
    }

    #[test]
    fn linear_upsample_interpolates_and_repeats_tail() {
        let out = resample_linear(&[0.0, 1.0, 2.0], 1, 2).unwrap();
        assert_eq!(out.len(), 6);
        assert_relative_eq!(out[1], 0.5);
        assert_relative_eq!(out[3], 1.5);
        assert_eq!(out[4], 2.0);
        assert_eq!(out[5], 2.0);
    }

    #[test]
    fn linear_downsample_length() {
        let out = resample_linear(&vec![0.25; 48_000], 48_000, 16_000).unwrap();
        assert_eq!(out.len(), 16_000);
        assert!(out.iter().all(|&s| s == 0.25));
    }

    #[test]
    fn linear_zero_rate_is_range_error() {
        assert!(matches!(
            resample_linear(&[1.0], 0, 16_000),
            Err(FacecastError::Range(_))
        ));
    }

    #[test]
    fn converter_passthrough() {
        let mut rc = RateConverter::new(16_000, 16_000, 960).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        assert_eq!(rc.process(&samples), samples);
    }

    #[test]
    fn converter_48k_to_16k_length() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        let out = rc.process(&vec![0.0f32; 960]);
        assert!((out.len() as isize - 320).unsigned_abs() <= 10, "len={}", out.len());
    }

    #[test]
    fn converter_carries_partial_chunks() {
        let mut rc = RateConverter::new(48_000, 16_000, 960).unwrap();
        assert!(rc.process(&vec![0.0f32; 500]).is_empty());
        assert_eq!(rc.pending(), 500);
        assert!(!rc.process(&vec![0.0f32; 500]).is_empty());
        assert_eq!(rc.pending(), 40);
        rc.reset();
        assert_eq!(rc.pending(), 0);
    }
}
