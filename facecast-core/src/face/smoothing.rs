//! Temporal smoothing, batch aggregation and frame-rate resampling of
//! inference results.

use crate::face::blendshape::{
    BlendshapeFrame, EyeGaze, FaceRegion, InferenceResult, BLENDSHAPE_COUNT, UPPER_FACE_MAX,
};

/// Exponential smoother with separate upper/lower face factors.
///
/// `out = prev × f + cur × (1 − f)`. A factor of 0 follows the input
/// exactly; 1 freezes on the first value seen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Smoother {
    upper: f32,
    lower: f32,
}

impl Smoother {
    pub fn new(upper: f32, lower: f32) -> Self {
        Self {
            upper: upper.clamp(0.0, 1.0),
            lower: lower.clamp(0.0, 1.0),
        }
    }

    pub fn upper(&self) -> f32 {
        self.upper
    }

    pub fn lower(&self) -> f32 {
        self.lower
    }

    pub fn set_smoothing(&mut self, factor: f32) {
        let f = factor.clamp(0.0, 1.0);
        self.upper = f;
        self.lower = f;
    }

    pub fn set_region(&mut self, region: FaceRegion, factor: f32) {
        let f = factor.clamp(0.0, 1.0);
        match region {
            FaceRegion::Upper => self.upper = f,
            FaceRegion::Lower => self.lower = f,
        }
    }

    #[inline]
    fn factor(&self, index: usize) -> f32 {
        if index <= UPPER_FACE_MAX {
            self.upper
        } else {
            self.lower
        }
    }

    pub fn smooth(&self, prev: Option<&BlendshapeFrame>, cur: &BlendshapeFrame) -> BlendshapeFrame {
        let Some(prev) = prev else {
            return *cur;
        };
        let mut out = *cur;
        for (i, w) in out.weights_mut().iter_mut().enumerate() {
            let f = self.factor(i);
            *w = prev.weights()[i] * f + *w * (1.0 - f);
        }
        out
    }

    /// Slice variant for callers holding raw weight vectors. Mismatched
    /// lengths return `cur` unchanged.
    pub fn smooth_slices(&self, prev: &[f32], cur: &[f32]) -> Vec<f32> {
        if prev.len() != cur.len() {
            return cur.to_vec();
        }
        prev.iter()
            .zip(cur)
            .enumerate()
            .map(|(i, (&p, &c))| {
                let f = self.factor(i);
                p * f + c * (1.0 - f)
            })
            .collect()
    }

    /// Smooth a time-ordered batch in place, each result against the
    /// already-smoothed one before it.
    pub fn smooth_in_order(&self, results: &mut [InferenceResult]) {
        let mut prev: Option<BlendshapeFrame> = None;
        for r in results.iter_mut() {
            r.blendshapes = self.smooth(prev.as_ref(), &r.blendshapes);
            prev = Some(r.blendshapes);
        }
    }
}

impl Default for Smoother {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_SMOOTHING, crate::config::DEFAULT_SMOOTHING)
    }
}

/// Summary of a batch of results.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateResult {
    pub blendshapes: BlendshapeFrame,
    pub jaw: f32,
    pub eyes: Option<EyeGaze>,
    pub frame_count: usize,
}

/// Per-channel mean weights and mean jaw; eyes come from the last result.
pub fn aggregate_results(results: &[InferenceResult]) -> AggregateResult {
    let Some(last) = results.last() else {
        return AggregateResult {
            blendshapes: BlendshapeFrame::zeros(),
            jaw: 0.0,
            eyes: None,
            frame_count: 0,
        };
    };

    let mut sums = [0f64; BLENDSHAPE_COUNT];
    let mut jaw = 0f64;
    for r in results {
        for (s, &w) in sums.iter_mut().zip(r.blendshapes.weights()) {
            *s += f64::from(w);
        }
        jaw += f64::from(r.jaw);
    }
    let n = results.len() as f64;
    let mut mean = [0f32; BLENDSHAPE_COUNT];
    for (m, s) in mean.iter_mut().zip(sums) {
        *m = (s / n) as f32;
    }

    AggregateResult {
        blendshapes: BlendshapeFrame::from_weights(mean),
        jaw: (jaw / n) as f32,
        eyes: last.eyes,
        frame_count: results.len(),
    }
}

/// Resample time-ordered results onto a fixed frame grid.
///
/// Produces `ceil(duration × fps)` frames at `t = k / fps`. Frames before the
/// first result are zero; frames after the last repeat it; everything in
/// between is linearly interpolated between the bracketing results.
pub fn interpolate_to_frame_rate(
    results: &[InferenceResult],
    fps: f64,
    duration: f64,
) -> Vec<BlendshapeFrame> {
    if fps <= 0.0 || duration <= 0.0 {
        return Vec::new();
    }
    let count = (duration * fps).ceil() as usize;
    let mut frames = Vec::with_capacity(count);
    // results[..next] all have time <= t; advances monotonically.
    let mut next = 0usize;

    for k in 0..count {
        let t = k as f64 / fps;
        while next < results.len() && results[next].time <= t {
            next += 1;
        }

        let frame = match next {
            0 => BlendshapeFrame::zeros(),
            n if n >= results.len() => results[n - 1].blendshapes,
            n => {
                let (a, b) = (&results[n - 1], &results[n]);
                let span = b.time - a.time;
                let frac = if span > 0.0 { ((t - a.time) / span) as f32 } else { 0.0 };
                lerp(&a.blendshapes, &b.blendshapes, frac)
            }
        };
        frames.push(frame);
    }
    frames
}

fn lerp(a: &BlendshapeFrame, b: &BlendshapeFrame, frac: f32) -> BlendshapeFrame {
    let mut out = *a;
    for (o, &w) in out.weights_mut().iter_mut().zip(b.weights()) {
        *o += (w - *o) * frac;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn frame(value: f32) -> BlendshapeFrame {
        BlendshapeFrame::from_weights([value; BLENDSHAPE_COUNT])
    }

    fn result_at(time: f64, value: f32) -> InferenceResult {
        InferenceResult {
            blendshapes: frame(value),
            jaw: value,
            eyes: None,
            time,
            ..InferenceResult::empty()
        }
    }

    #[test]
    fn first_frame_passes_through() {
        let s = Smoother::default();
        assert_eq!(s.smooth(None, &frame(0.7)), frame(0.7));
    }

    #[test]
    fn smoothing_identical_frames_is_identity() {
        let s = Smoother::new(0.3, 0.8);
        let mut x = frame(0.0);
        for (i, w) in x.weights_mut().iter_mut().enumerate() {
            *w = i as f32 / 52.0;
        }
        let out = s.smooth(Some(&x), &x);
        for (a, b) in out.weights().iter().zip(x.weights()) {
            assert_relative_eq!(a, b, epsilon = 1e-6);
        }
    }

    #[test]
    fn zero_factor_has_no_lag_and_one_freezes() {
        let mut s = Smoother::default();
        s.set_smoothing(0.0);
        assert_eq!(s.smooth(Some(&frame(0.1)), &frame(0.9)), frame(0.9));

        s.set_smoothing(1.0);
        let mut results = vec![result_at(0.0, 0.2), result_at(0.1, 0.9), result_at(0.2, 0.5)];
        s.smooth_in_order(&mut results);
        assert!(results.iter().all(|r| r.blendshapes == frame(0.2)));
    }

    #[test]
    fn regions_use_their_own_factor() {
        let mut s = Smoother::default();
        s.set_region(FaceRegion::Upper, 1.0);
        s.set_region(FaceRegion::Lower, 0.0);
        let out = s.smooth(Some(&frame(0.0)), &frame(1.0));
        assert_eq!(out.weights()[UPPER_FACE_MAX], 0.0);
        assert_eq!(out.weights()[UPPER_FACE_MAX + 1], 1.0);

        s.set_region(FaceRegion::Upper, 7.0);
        assert_eq!(s.upper(), 1.0);
    }

    #[test]
    fn slice_length_mismatch_returns_current() {
        let s = Smoother::default();
        assert_eq!(s.smooth_slices(&[0.0, 0.0], &[1.0]), vec![1.0]);
        let blended = s.smooth_slices(&[0.0], &[1.0]);
        assert_relative_eq!(blended[0], 0.7, epsilon = 1e-6);
    }

    #[test]
    fn interpolation_midpoint() {
        let results = [result_at(0.0, 0.0), result_at(1.0, 1.0)];
        let frames = interpolate_to_frame_rate(&results, 4.0, 1.0);
        assert_eq!(frames.len(), 4);
        assert_relative_eq!(frames[1].weights()[0], 0.25, epsilon = 1e-6);
        assert_relative_eq!(frames[3].weights()[0], 0.75, epsilon = 1e-6);
    }

    #[test]
    fn interpolation_edges() {
        let results = [result_at(0.5, 0.4), result_at(1.0, 0.8)];
        let frames = interpolate_to_frame_rate(&results, 2.0, 2.2);
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0], frame(0.0));
        assert_eq!(frames[1], frame(0.4));
        assert_eq!(frames[2], frame(0.8));
        assert_eq!(frames[4], frame(0.8));

        assert!(interpolate_to_frame_rate(&[], 30.0, 1.0)
            .iter()
            .all(|f| *f == frame(0.0)));
    }

    #[test]
    fn equal_timestamps_do_not_divide_by_zero() {
        let results = [result_at(0.0, 0.3), result_at(0.0, 0.9), result_at(1.0, 0.9)];
        let frames = interpolate_to_frame_rate(&results, 10.0, 0.1);
        assert_eq!(frames.len(), 1);
        assert_relative_eq!(frames[0].weights()[0], 0.9, epsilon = 1e-6);
    }

    #[test]
    fn aggregate_means_and_last_eyes() {
        let mut results = vec![result_at(0.0, 0.2), result_at(0.1, 0.6)];
        results[1].eyes = Some(EyeGaze {
            left_x: 0.5,
            ..EyeGaze::default()
        });
        let agg = aggregate_results(&results);
        assert_eq!(agg.frame_count, 2);
        assert_relative_eq!(agg.blendshapes.weights()[10], 0.4, epsilon = 1e-6);
        assert_relative_eq!(agg.jaw, 0.4, epsilon = 1e-6);
        assert_eq!(agg.eyes.unwrap().left_x, 0.5);

        let empty = aggregate_results(&[]);
        assert_eq!(empty.frame_count, 0);
        assert_eq!(empty.blendshapes, frame(0.0));
    }
}
