//! Pipeline configuration.
//!
//! The on-disk document is JSON with four optional sections:
//!
//! ```json
//! {
//!   "audio_params":      { "buffer_len": 8320, "buffer_ofs": 4160, "samplerate": 16000 },
//!   "face_params":       { "emotion": [0.0, ...], "upper_face_smoothing": 0.3,
//!                          "lower_face_smoothing": 0.3, "prediction_delay": 0.15 },
//!   "network_params":    { "num_shapes_skin": 140, "num_shapes_tongue": 10,
//!                          "result_jaw_size": 15, "result_eyes_size": 4 },
//!   "blendshape_params": { "bsWeightMultipliers": [...52], "bsWeightOffsets": [...52],
//!                          "bsSolveActivePoses": [...52] }
//! }
//! ```
//!
//! Fields that are absent keep their previous value. A document is applied
//! to a copy and validated as a whole before it replaces the live config, so
//! a rejected document never leaves a half-updated `PipelineConfig` behind.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{FacecastError, Result};
use crate::face::blendshape::{BLENDSHAPE_COUNT, EMOTION_DIM};

pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;
pub const DEFAULT_BUFFER_LEN: usize = 8_320;
pub const DEFAULT_BUFFER_OFS: usize = 4_160;
pub const DEFAULT_SMOOTHING: f32 = 0.3;

/// File names inside a model directory.
pub const MODEL_FILE: &str = "model.onnx";
pub const CONFIG_FILE: &str = "config.json";

/// Model directory: `FACECAST_MODEL_DIR` when set, else the per-user data dir.
pub fn model_dir() -> PathBuf {
    if let Ok(explicit) = std::env::var("FACECAST_MODEL_DIR") {
        if !explicit.trim().is_empty() {
            return PathBuf::from(explicit.trim());
        }
    }
    default_model_dir()
}

pub fn default_model_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(|p| PathBuf::from(p).join("Lattice Labs").join("Facecast").join("models"))
            .unwrap_or_else(|| PathBuf::from("models"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("facecast")
            .join("models")
    }
}

const DEFAULT_SKIN_SIZE: usize = 140;
const DEFAULT_TONGUE_SIZE: usize = 10;
const DEFAULT_JAW_SIZE: usize = 15;
const DEFAULT_EYES_SIZE: usize = 4;

// ── Document ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigDocument {
    pub audio_params: Option<AudioParams>,
    pub face_params: Option<FaceParams>,
    pub network_params: Option<NetworkParams>,
    pub blendshape_params: Option<BlendshapeParams>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AudioParams {
    pub buffer_len: Option<usize>,
    pub buffer_ofs: Option<usize>,
    pub samplerate: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FaceParams {
    pub emotion: Option<Vec<f32>>,
    pub upper_face_smoothing: Option<f32>,
    pub lower_face_smoothing: Option<f32>,
    pub prediction_delay: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkParams {
    pub num_shapes_skin: Option<usize>,
    pub num_shapes_tongue: Option<usize>,
    pub result_jaw_size: Option<usize>,
    pub result_eyes_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BlendshapeParams {
    #[serde(rename = "bsWeightMultipliers")]
    pub weight_multipliers: Option<Vec<f32>>,
    #[serde(rename = "bsWeightOffsets")]
    pub weight_offsets: Option<Vec<f32>>,
    #[serde(rename = "bsSolveActivePoses")]
    pub solve_active_poses: Option<Vec<PoseFlag>>,
}

/// Active-pose entries appear both as booleans and as 0/1 numbers in the wild.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum PoseFlag {
    Bool(bool),
    Number(f64),
}

impl PoseFlag {
    pub fn is_active(self) -> bool {
        match self {
            PoseFlag::Bool(b) => b,
            PoseFlag::Number(n) => n != 0.0,
        }
    }
}

// ── Resolved config ──────────────────────────────────────────────────────────

/// Offsets and widths of the semantic regions in the flat network output.
///
/// Regions are laid out back to back: skin, tongue, jaw, eyes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputLayout {
    pub skin_offset: usize,
    pub skin_size: usize,
    pub tongue_offset: usize,
    pub tongue_size: usize,
    pub jaw_offset: usize,
    pub jaw_size: usize,
    pub eyes_offset: usize,
    pub eyes_size: usize,
}

impl OutputLayout {
    pub fn from_sizes(skin: usize, tongue: usize, jaw: usize, eyes: usize) -> Self {
        let tongue_offset = skin;
        let jaw_offset = tongue_offset + tongue;
        let eyes_offset = jaw_offset + jaw;
        Self {
            skin_offset: 0,
            skin_size: skin,
            tongue_offset,
            tongue_size: tongue,
            jaw_offset,
            jaw_size: jaw,
            eyes_offset,
            eyes_size: eyes,
        }
    }

    /// Total output width the layout expects.
    pub fn total(&self) -> usize {
        self.eyes_offset + self.eyes_size
    }
}

impl Default for OutputLayout {
    fn default() -> Self {
        Self::from_sizes(
            DEFAULT_SKIN_SIZE,
            DEFAULT_TONGUE_SIZE,
            DEFAULT_JAW_SIZE,
            DEFAULT_EYES_SIZE,
        )
    }
}

/// Optional per-channel post-processing, each exactly 52 long when present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightAdjustments {
    pub multipliers: Option<Vec<f32>>,
    pub offsets: Option<Vec<f32>>,
    pub active_poses: Option<Vec<bool>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Model sample rate in Hz.
    pub sample_rate: u32,
    /// Window length in samples.
    pub buffer_len: usize,
    /// Stride between windows in samples. Always `<= buffer_len`.
    pub buffer_ofs: usize,
    pub layout: OutputLayout,
    pub emotion: [f32; EMOTION_DIM],
    pub upper_face_smoothing: f32,
    pub lower_face_smoothing: f32,
    /// Shift applied to result timestamps, in seconds.
    pub prediction_delay: Option<f64>,
    pub adjustments: WeightAdjustments,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            buffer_len: DEFAULT_BUFFER_LEN,
            buffer_ofs: DEFAULT_BUFFER_OFS,
            layout: OutputLayout::default(),
            emotion: [0.0; EMOTION_DIM],
            upper_face_smoothing: DEFAULT_SMOOTHING,
            lower_face_smoothing: DEFAULT_SMOOTHING,
            prediction_delay: None,
            adjustments: WeightAdjustments::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with the document at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config = Self::from_json_str(&raw)?;
        info!(path = ?path, "loaded pipeline config");
        Ok(config)
    }

    /// Defaults overlaid with a JSON document.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let doc: ConfigDocument = serde_json::from_str(raw)
            .map_err(|e| FacecastError::Config(format!("malformed config document: {e}")))?;
        let mut config = Self::default();
        config.apply(&doc)?;
        Ok(config)
    }

    /// Overlay `doc` onto this config. On error `self` is left untouched.
    pub fn apply(&mut self, doc: &ConfigDocument) -> Result<()> {
        let mut next = self.clone();

        if let Some(ap) = &doc.audio_params {
            next.buffer_len = ap.buffer_len.unwrap_or(next.buffer_len);
            next.buffer_ofs = ap.buffer_ofs.unwrap_or(next.buffer_ofs);
            next.sample_rate = ap.samplerate.unwrap_or(next.sample_rate);
            if next.buffer_ofs > next.buffer_len {
                debug!(
                    buffer_ofs = next.buffer_ofs,
                    buffer_len = next.buffer_len,
                    "clamping buffer_ofs to buffer_len"
                );
                next.buffer_ofs = next.buffer_len;
            }
        }

        if let Some(fp) = &doc.face_params {
            next.upper_face_smoothing = fp.upper_face_smoothing.unwrap_or(next.upper_face_smoothing);
            next.lower_face_smoothing = fp.lower_face_smoothing.unwrap_or(next.lower_face_smoothing);
            if fp.prediction_delay.is_some() {
                next.prediction_delay = fp.prediction_delay;
            }
            if let Some(emotion) = &fp.emotion {
                if emotion.len() > EMOTION_DIM {
                    return Err(FacecastError::Config(format!(
                        "face_params.emotion has {} entries, at most {EMOTION_DIM} allowed",
                        emotion.len()
                    )));
                }
                next.emotion[..emotion.len()].copy_from_slice(emotion);
            }
        }

        if let Some(np) = &doc.network_params {
            let layout = next.layout;
            next.layout = OutputLayout::from_sizes(
                np.num_shapes_skin.unwrap_or(layout.skin_size),
                np.num_shapes_tongue.unwrap_or(layout.tongue_size),
                np.result_jaw_size.unwrap_or(layout.jaw_size),
                np.result_eyes_size.unwrap_or(layout.eyes_size),
            );
        }

        if let Some(bp) = &doc.blendshape_params {
            // The section is replaced wholesale: omitted arrays are cleared.
            next.adjustments = WeightAdjustments {
                multipliers: bp.weight_multipliers.clone(),
                offsets: bp.weight_offsets.clone(),
                active_poses: bp
                    .solve_active_poses
                    .as_ref()
                    .map(|flags| flags.iter().map(|f| f.is_active()).collect()),
            };
        }

        next.validate()?;
        *self = next;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(FacecastError::Config("samplerate must be > 0".into()));
        }
        if self.buffer_len == 0 {
            return Err(FacecastError::Config("buffer_len must be > 0".into()));
        }
        if self.buffer_ofs == 0 {
            return Err(FacecastError::Config("buffer_ofs must be > 0".into()));
        }
        for (name, value) in [
            ("upper_face_smoothing", self.upper_face_smoothing),
            ("lower_face_smoothing", self.lower_face_smoothing),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(FacecastError::Config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        let adj = &self.adjustments;
        for (name, len) in [
            ("bsWeightMultipliers", adj.multipliers.as_ref().map(Vec::len)),
            ("bsWeightOffsets", adj.offsets.as_ref().map(Vec::len)),
            ("bsSolveActivePoses", adj.active_poses.as_ref().map(Vec::len)),
        ] {
            if let Some(len) = len {
                if len != BLENDSHAPE_COUNT {
                    return Err(FacecastError::Config(format!(
                        "{name} must have {BLENDSHAPE_COUNT} entries, got {len}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Samples shared by consecutive windows.
    pub fn overlap(&self) -> usize {
        self.buffer_len - self.buffer_ofs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_keeps_defaults() {
        let config = PipelineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.layout.jaw_offset, 150);
        assert_eq!(config.layout.eyes_offset, 165);
        assert_eq!(config.overlap(), 4_160);
    }

    #[test]
    fn network_params_rederive_offsets() {
        let config = PipelineConfig::from_json_str(
            r#"{ "network_params": { "num_shapes_skin": 272, "num_shapes_tongue": 10 } }"#,
        )
        .unwrap();
        assert_eq!(config.layout.tongue_offset, 272);
        assert_eq!(config.layout.jaw_offset, 282);
        assert_eq!(config.layout.eyes_offset, 297);
        assert_eq!(config.layout.total(), 301);
    }

    #[test]
    fn buffer_ofs_is_clamped_to_buffer_len() {
        let config = PipelineConfig::from_json_str(
            r#"{ "audio_params": { "buffer_len": 1000, "buffer_ofs": 5000 } }"#,
        )
        .unwrap();
        assert_eq!(config.buffer_ofs, 1000);
        assert_eq!(config.overlap(), 0);
    }

    #[test]
    fn emotion_prefix_overwrites_leading_slots() {
        let config =
            PipelineConfig::from_json_str(r#"{ "face_params": { "emotion": [0.5, 0.25] } }"#)
                .unwrap();
        assert_eq!(config.emotion[0], 0.5);
        assert_eq!(config.emotion[1], 0.25);
        assert_eq!(config.emotion[2], 0.0);
    }

    #[test]
    fn active_poses_accept_bools_and_numbers() {
        let mut flags: Vec<String> = vec!["true".into(); 50];
        flags.push("0".into());
        flags.push("false".into());
        let doc = format!(
            r#"{{ "blendshape_params": {{ "bsSolveActivePoses": [{}] }} }}"#,
            flags.join(",")
        );
        let config = PipelineConfig::from_json_str(&doc).unwrap();
        let poses = config.adjustments.active_poses.unwrap();
        assert!(poses[0]);
        assert!(!poses[50]);
        assert!(!poses[51]);
        assert!(config.adjustments.multipliers.is_none());
    }

    #[test]
    fn rejects_wrong_length_adjustments() {
        let err = PipelineConfig::from_json_str(
            r#"{ "blendshape_params": { "bsWeightMultipliers": [1.0, 2.0] } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, FacecastError::Config(_)));
    }

    #[test]
    fn rejects_malformed_json_and_zero_stride() {
        assert!(matches!(
            PipelineConfig::from_json_str("{ not json"),
            Err(FacecastError::Config(_))
        ));
        assert!(matches!(
            PipelineConfig::from_json_str(r#"{ "audio_params": { "buffer_ofs": 0 } }"#),
            Err(FacecastError::Config(_))
        ));
    }

    #[test]
    fn failed_apply_leaves_config_untouched() {
        let mut config = PipelineConfig::default();
        let doc: ConfigDocument = serde_json::from_str(
            r#"{ "audio_params": { "buffer_len": 100 },
                 "face_params": { "upper_face_smoothing": 4.0 } }"#,
        )
        .unwrap();
        assert!(config.apply(&doc).is_err());
        assert_eq!(config, PipelineConfig::default());
    }
}
