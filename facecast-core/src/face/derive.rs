//! Network output → 52 ARKit weights.
//!
//! Two strategies, picked by whether solve data is attached:
//!
//! - **Direct**: each skin logit goes through a scaled sigmoid.
//! - **PCA solve**: skin values are PCA coefficients; vertices are
//!   reconstructed, the frontal displacement from neutral is projected
//!   through the pseudo-inverse, and the jaw channels are patched from the
//!   jaw output region.
//!
//! Either way the per-channel multiplier/offset/active-pose chain runs last
//! and every weight leaves here clamped to [0, 1].

use std::sync::Arc;

use tracing::trace;

use crate::config::{OutputLayout, WeightAdjustments};
use crate::face::blendshape::{
    Blendshape, BlendshapeFrame, EyeGaze, InferenceResult, BLENDSHAPE_COUNT,
};
use crate::face::solve::SolveData;

/// Logits are scaled before the sigmoid so typical outputs land mid-curve.
const SIGMOID_INPUT_SCALE: f32 = 0.1;

// Jaw heuristic applied after the PCA solve.
const JAW_OPEN_INDEX: usize = 13;
const JAW_FORWARD_INDEX: usize = 14;
const JAW_OPEN_GAIN: f32 = 0.8;
const JAW_FORWARD_GAIN: f32 = 0.5;
const JAW_FORWARD_BIAS: f32 = 0.5;

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[inline]
fn clamp01(x: f32) -> f32 {
    // NaN collapses to 0 rather than propagating into the frame.
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone)]
pub struct BlendshapeDecoder {
    layout: OutputLayout,
    adjustments: WeightAdjustments,
    solve: Option<Arc<SolveData>>,
}

impl BlendshapeDecoder {
    pub fn new(layout: OutputLayout, adjustments: WeightAdjustments) -> Self {
        Self {
            layout,
            adjustments,
            solve: None,
        }
    }

    pub fn with_solve_data(mut self, solve: Option<Arc<SolveData>>) -> Self {
        self.solve = solve;
        self
    }

    pub fn set_solve_data(&mut self, solve: Option<Arc<SolveData>>) {
        self.solve = solve;
    }

    pub fn set_layout(&mut self, layout: OutputLayout, adjustments: WeightAdjustments) {
        self.layout = layout;
        self.adjustments = adjustments;
    }

    pub fn uses_solve(&self) -> bool {
        self.solve.is_some()
    }

    /// Decode one window's raw output into a result stamped with `time`.
    pub fn decode(&self, raw: &[f32], time: f64) -> InferenceResult {
        let (mut weights, jaw) = match &self.solve {
            Some(solve) => self.decode_solve(solve, raw),
            None => self.decode_direct(raw),
        };
        self.adjust(&mut weights);

        let mut blendshapes = BlendshapeFrame::from_weights(weights);
        if self.solve.is_some() {
            // The jaw heuristic overrides whatever the solve produced.
            blendshapes[Blendshape::JawOpen] = jaw;
            blendshapes[Blendshape::JawForward] = self.jaw_forward(raw);
        }

        trace!(time, jaw, "decoded window");
        InferenceResult {
            blendshapes,
            jaw,
            eyes: Some(self.eyes(raw)),
            time,
            timestamp_ms: crate::face::blendshape::now_millis(),
        }
    }

    fn decode_direct(&self, raw: &[f32]) -> ([f32; BLENDSHAPE_COUNT], f32) {
        let mut weights = [0f32; BLENDSHAPE_COUNT];
        let skin = self.layout.skin_size.min(BLENDSHAPE_COUNT);
        for (i, w) in weights.iter_mut().take(skin).enumerate() {
            let logit = raw.get(self.layout.skin_offset + i).copied().unwrap_or(0.0);
            *w = clamp01(sigmoid(logit * SIGMOID_INPUT_SCALE));
        }
        let jaw_logit = self.jaw_value(raw, 0);
        (weights, clamp01(sigmoid(jaw_logit * SIGMOID_INPUT_SCALE)))
    }

    fn decode_solve(&self, solve: &SolveData, raw: &[f32]) -> ([f32; BLENDSHAPE_COUNT], f32) {
        let start = self.layout.skin_offset.min(raw.len());
        let end = (self.layout.skin_offset + self.layout.skin_size).min(raw.len());
        let vertices = solve.reconstruct_vertices(&raw[start..end]);
        let target = solve.displacement_target(vertices.view());
        let weights = solve.solve_weights(target.view());
        let jaw_open = clamp01(-self.jaw_value(raw, JAW_OPEN_INDEX) * JAW_OPEN_GAIN);
        (weights, jaw_open)
    }

    fn jaw_forward(&self, raw: &[f32]) -> f32 {
        clamp01(self.jaw_value(raw, JAW_FORWARD_INDEX) * JAW_FORWARD_GAIN + JAW_FORWARD_BIAS)
    }

    /// Jaw and eye channels are addressed from their region offsets and
    /// read as zero only when the model output is too short.
    fn jaw_value(&self, raw: &[f32], index: usize) -> f32 {
        raw.get(self.layout.jaw_offset + index).copied().unwrap_or(0.0)
    }

    fn adjust(&self, weights: &mut [f32; BLENDSHAPE_COUNT]) {
        let adj = &self.adjustments;
        for (i, w) in weights.iter_mut().enumerate() {
            if let Some(m) = adj.multipliers.as_ref().and_then(|v| v.get(i)) {
                *w *= m;
            }
            if let Some(o) = adj.offsets.as_ref().and_then(|v| v.get(i)) {
                *w += o;
            }
            if adj.active_poses.as_ref().and_then(|v| v.get(i)) == Some(&false) {
                *w = 0.0;
            }
            *w = clamp01(*w);
        }
    }

    fn eyes(&self, raw: &[f32]) -> EyeGaze {
        let at = |i: usize| raw.get(self.layout.eyes_offset + i).copied().unwrap_or(0.0);
        EyeGaze {
            left_x: at(0),
            left_y: at(1),
            right_x: at(2),
            right_y: at(3),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::face::solve::tests::tiny_solve_data;
    use approx::assert_relative_eq;

    fn raw_output(skin: f32) -> Vec<f32> {
        let layout = OutputLayout::default();
        let mut raw = vec![0.0; layout.total()];
        raw[..layout.skin_size].fill(skin);
        raw
    }

    #[test]
    fn direct_zero_logits_decode_to_half() {
        let decoder = BlendshapeDecoder::new(OutputLayout::default(), WeightAdjustments::default());
        let result = decoder.decode(&raw_output(0.0), 1.5);
        assert!(result.blendshapes.weights().iter().all(|&w| w == 0.5));
        assert_eq!(result.jaw, 0.5);
        assert_eq!(result.time, 1.5);
        assert_eq!(result.eyes, Some(EyeGaze::default()));
    }

    #[test]
    fn direct_weights_stay_in_unit_range_for_extremes() {
        let decoder = BlendshapeDecoder::new(OutputLayout::default(), WeightAdjustments::default());
        for logit in [f32::MIN, -1e6, -37.0, 37.0, 1e6, f32::MAX, f32::NAN] {
            let result = decoder.decode(&raw_output(logit), 0.0);
            assert!(
                result.blendshapes.weights().iter().all(|w| (0.0..=1.0).contains(w)),
                "logit {logit}"
            );
            assert!((0.0..=1.0).contains(&result.jaw));
        }
    }

    #[test]
    fn short_output_leaves_missing_channels_neutral() {
        let layout = OutputLayout::from_sizes(10, 0, 1, 4);
        let decoder = BlendshapeDecoder::new(layout, WeightAdjustments::default());
        // Only five skin values and nothing else present.
        let result = decoder.decode(&[100.0; 5], 0.0);
        let w = result.blendshapes.weights();
        assert!(w[..5].iter().all(|&x| x > 0.99));
        assert!(w[5..10].iter().all(|&x| x == 0.5));
        assert!(w[10..].iter().all(|&x| x == 0.0));
        assert_eq!(result.eyes, Some(EyeGaze::default()));
    }

    #[test]
    fn jaw_and_eyes_read_past_declared_region_sizes() {
        // Zero-sized jaw and eye regions still read whatever the output holds.
        let layout = OutputLayout::from_sizes(2, 0, 0, 0);
        let decoder = BlendshapeDecoder::new(layout, WeightAdjustments::default());
        let result = decoder.decode(&[0.0, 0.0, 0.3, -0.1, 0.2], 0.0);
        assert!(result.jaw > 0.5);
        assert_eq!(
            result.eyes,
            Some(EyeGaze {
                left_x: 0.3,
                left_y: -0.1,
                right_x: 0.2,
                right_y: 0.0
            })
        );
    }

    #[test]
    fn adjustments_apply_in_order_then_clamp() {
        let mut multipliers = vec![1.0; BLENDSHAPE_COUNT];
        multipliers[0] = 4.0;
        let mut offsets = vec![0.0; BLENDSHAPE_COUNT];
        offsets[1] = -0.2;
        let mut active = vec![true; BLENDSHAPE_COUNT];
        active[2] = false;
        let decoder = BlendshapeDecoder::new(
            OutputLayout::default(),
            WeightAdjustments {
                multipliers: Some(multipliers),
                offsets: Some(offsets),
                active_poses: Some(active),
            },
        );
        let w = *decoder.decode(&raw_output(0.0), 0.0).blendshapes.weights();
        assert_eq!(w[0], 1.0);
        assert_relative_eq!(w[1], 0.3, epsilon = 1e-6);
        assert_eq!(w[2], 0.0);
        assert_eq!(w[3], 0.5);
    }

    #[test]
    fn eyes_read_from_their_region() {
        let layout = OutputLayout::default();
        let decoder = BlendshapeDecoder::new(layout, WeightAdjustments::default());
        let mut raw = raw_output(0.0);
        raw[layout.eyes_offset..layout.eyes_offset + 4].copy_from_slice(&[0.1, -0.2, 0.3, -0.4]);
        let eyes = decoder.decode(&raw, 0.0).eyes.unwrap();
        assert_eq!(
            eyes,
            EyeGaze {
                left_x: 0.1,
                left_y: -0.2,
                right_x: 0.3,
                right_y: -0.4
            }
        );
    }

    #[test]
    fn solve_path_projects_and_patches_jaw() {
        let layout = OutputLayout::default();
        let decoder = BlendshapeDecoder::new(layout, WeightAdjustments::default())
            .with_solve_data(Some(Arc::new(tiny_solve_data())));
        assert!(decoder.uses_solve());

        let mut raw = vec![0.0; layout.total()];
        raw[0] = 0.4;
        raw[1] = 0.1;
        raw[layout.jaw_offset + 13] = -0.5;
        raw[layout.jaw_offset + 14] = 0.6;

        let result = decoder.decode(&raw, 0.0);
        let f = &result.blendshapes;
        assert_relative_eq!(f[Blendshape::BrowInnerUp], 0.4, epsilon = 1e-6);
        assert_relative_eq!(f[Blendshape::MouthLeft], 0.2, epsilon = 1e-6);
        assert_eq!(f[Blendshape::MouthClose], 0.0);
        assert_relative_eq!(result.jaw, 0.4, epsilon = 1e-6);
        assert_relative_eq!(f[Blendshape::JawOpen], 0.4, epsilon = 1e-6);
        assert_relative_eq!(f[Blendshape::JawForward], 0.8, epsilon = 1e-6);
    }

    #[test]
    fn solve_weights_stay_in_unit_range() {
        let layout = OutputLayout::default();
        let decoder = BlendshapeDecoder::new(layout, WeightAdjustments::default())
            .with_solve_data(Some(Arc::new(tiny_solve_data())));
        for v in [-1e9f32, -5.0, 0.0, 5.0, 1e9] {
            let raw = vec![v; layout.total()];
            let result = decoder.decode(&raw, 0.0);
            assert!(result.blendshapes.weights().iter().all(|w| (0.0..=1.0).contains(w)));
            assert!((0.0..=1.0).contains(&result.jaw));
        }
    }
}
