//! The fixed 52-channel ARKit blendshape table and the per-window result types.
//!
//! Channel order is part of the AFAN v2 wire format: never reorder
//! [`BLENDSHAPE_NAMES`] or the [`Blendshape`] variants.

use std::fmt;
use std::ops::{Index, IndexMut};
use std::str::FromStr;

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::{FacecastError, Result};

/// Number of blendshape channels.
pub const BLENDSHAPE_COUNT: usize = 52;

/// Highest channel index that belongs to the upper face (brows, eyes, cheek puff).
pub const UPPER_FACE_MAX: usize = 19;

/// Width of the emotion control vector fed to the network.
pub const EMOTION_DIM: usize = 26;

pub const BLENDSHAPE_NAMES: [&str; BLENDSHAPE_COUNT] = [
    "browInnerUp",
    "browDownLeft",
    "browDownRight",
    "browOuterUpLeft",
    "browOuterUpRight",
    "eyeLookUpLeft",
    "eyeLookUpRight",
    "eyeLookDownLeft",
    "eyeLookDownRight",
    "eyeLookInLeft",
    "eyeLookInRight",
    "eyeLookOutLeft",
    "eyeLookOutRight",
    "eyeBlinkLeft",
    "eyeBlinkRight",
    "eyeSquintLeft",
    "eyeSquintRight",
    "eyeWideLeft",
    "eyeWideRight",
    "cheekPuff",
    "cheekSquintLeft",
    "cheekSquintRight",
    "noseSneerLeft",
    "noseSneerRight",
    "jawOpen",
    "jawForward",
    "jawLeft",
    "jawRight",
    "mouthFunnel",
    "mouthPucker",
    "mouthLeft",
    "mouthRight",
    "mouthRollUpper",
    "mouthRollLower",
    "mouthShrugUpper",
    "mouthShrugLower",
    "mouthOpen",
    "mouthClose",
    "mouthSmileLeft",
    "mouthSmileRight",
    "mouthFrownLeft",
    "mouthFrownRight",
    "mouthDimpleLeft",
    "mouthDimpleRight",
    "mouthUpperUpLeft",
    "mouthUpperUpRight",
    "mouthLowerDownLeft",
    "mouthLowerDownRight",
    "mouthPressLeft",
    "mouthPressRight",
    "mouthStretchLeft",
    "mouthStretchRight",
];

/// One blendshape channel. The discriminant is the channel index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Blendshape {
    BrowInnerUp,
    BrowDownLeft,
    BrowDownRight,
    BrowOuterUpLeft,
    BrowOuterUpRight,
    EyeLookUpLeft,
    EyeLookUpRight,
    EyeLookDownLeft,
    EyeLookDownRight,
    EyeLookInLeft,
    EyeLookInRight,
    EyeLookOutLeft,
    EyeLookOutRight,
    EyeBlinkLeft,
    EyeBlinkRight,
    EyeSquintLeft,
    EyeSquintRight,
    EyeWideLeft,
    EyeWideRight,
    CheekPuff,
    CheekSquintLeft,
    CheekSquintRight,
    NoseSneerLeft,
    NoseSneerRight,
    JawOpen,
    JawForward,
    JawLeft,
    JawRight,
    MouthFunnel,
    MouthPucker,
    MouthLeft,
    MouthRight,
    MouthRollUpper,
    MouthRollLower,
    MouthShrugUpper,
    MouthShrugLower,
    MouthOpen,
    MouthClose,
    MouthSmileLeft,
    MouthSmileRight,
    MouthFrownLeft,
    MouthFrownRight,
    MouthDimpleLeft,
    MouthDimpleRight,
    MouthUpperUpLeft,
    MouthUpperUpRight,
    MouthLowerDownLeft,
    MouthLowerDownRight,
    MouthPressLeft,
    MouthPressRight,
    MouthStretchLeft,
    MouthStretchRight,
}

impl Blendshape {
    pub const ALL: [Blendshape; BLENDSHAPE_COUNT] = {
        use Blendshape::*;
        [
            BrowInnerUp,
            BrowDownLeft,
            BrowDownRight,
            BrowOuterUpLeft,
            BrowOuterUpRight,
            EyeLookUpLeft,
            EyeLookUpRight,
            EyeLookDownLeft,
            EyeLookDownRight,
            EyeLookInLeft,
            EyeLookInRight,
            EyeLookOutLeft,
            EyeLookOutRight,
            EyeBlinkLeft,
            EyeBlinkRight,
            EyeSquintLeft,
            EyeSquintRight,
            EyeWideLeft,
            EyeWideRight,
            CheekPuff,
            CheekSquintLeft,
            CheekSquintRight,
            NoseSneerLeft,
            NoseSneerRight,
            JawOpen,
            JawForward,
            JawLeft,
            JawRight,
            MouthFunnel,
            MouthPucker,
            MouthLeft,
            MouthRight,
            MouthRollUpper,
            MouthRollLower,
            MouthShrugUpper,
            MouthShrugLower,
            MouthOpen,
            MouthClose,
            MouthSmileLeft,
            MouthSmileRight,
            MouthFrownLeft,
            MouthFrownRight,
            MouthDimpleLeft,
            MouthDimpleRight,
            MouthUpperUpLeft,
            MouthUpperUpRight,
            MouthLowerDownLeft,
            MouthLowerDownRight,
            MouthPressLeft,
            MouthPressRight,
            MouthStretchLeft,
            MouthStretchRight,
        ]
    };

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        BLENDSHAPE_NAMES[self.index()]
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn is_upper_face(self) -> bool {
        self.index() <= UPPER_FACE_MAX
    }
}

impl fmt::Display for Blendshape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Blendshape {
    type Err = FacecastError;

    fn from_str(s: &str) -> Result<Self> {
        BLENDSHAPE_NAMES
            .iter()
            .position(|name| *name == s)
            .and_then(Self::from_index)
            .ok_or_else(|| FacecastError::range(format!("unknown blendshape: {s}")))
    }
}

/// 52 weights in the fixed channel order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendshapeFrame([f32; BLENDSHAPE_COUNT]);

impl BlendshapeFrame {
    pub const fn zeros() -> Self {
        Self([0.0; BLENDSHAPE_COUNT])
    }

    pub const fn from_weights(weights: [f32; BLENDSHAPE_COUNT]) -> Self {
        Self(weights)
    }

    /// Build from a slice, zero-filling missing trailing channels and
    /// ignoring extras.
    pub fn from_slice(weights: &[f32]) -> Self {
        let mut frame = Self::zeros();
        for (dst, src) in frame.0.iter_mut().zip(weights) {
            *dst = *src;
        }
        frame
    }

    pub fn weights(&self) -> &[f32; BLENDSHAPE_COUNT] {
        &self.0
    }

    pub fn weights_mut(&mut self) -> &mut [f32; BLENDSHAPE_COUNT] {
        &mut self.0
    }

    pub fn get(&self, shape: Blendshape) -> f32 {
        self.0[shape.index()]
    }

    pub fn set(&mut self, shape: Blendshape, weight: f32) {
        self.0[shape.index()] = weight;
    }

    /// `(name, weight)` pairs in channel order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, f32)> + '_ {
        BLENDSHAPE_NAMES.iter().copied().zip(self.0.iter().copied())
    }
}

impl Default for BlendshapeFrame {
    fn default() -> Self {
        Self::zeros()
    }
}

impl Index<Blendshape> for BlendshapeFrame {
    type Output = f32;

    fn index(&self, shape: Blendshape) -> &f32 {
        &self.0[shape.index()]
    }
}

impl IndexMut<Blendshape> for BlendshapeFrame {
    fn index_mut(&mut self, shape: Blendshape) -> &mut f32 {
        &mut self.0[shape.index()]
    }
}

// Serialized as an ordered `{ name: weight }` map for hosts.
impl Serialize for BlendshapeFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(BLENDSHAPE_COUNT))?;
        for (name, weight) in self.iter() {
            map.serialize_entry(name, &weight)?;
        }
        map.end()
    }
}

/// Raw eye-gaze values read straight from the network output.
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EyeGaze {
    pub left_x: f32,
    pub left_y: f32,
    pub right_x: f32,
    pub right_y: f32,
}

/// Everything produced for one inference window.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResult {
    pub blendshapes: BlendshapeFrame,
    /// Jaw-open value, decoded separately from the 52-channel solve.
    pub jaw: f32,
    /// `None` on the empty result.
    pub eyes: Option<EyeGaze>,
    /// Seconds on the session timeline this result describes.
    pub time: f64,
    /// Wall-clock capture time, Unix milliseconds.
    pub timestamp_ms: u64,
}

impl InferenceResult {
    /// All-zero result used before the first window has been inferred.
    pub fn empty() -> Self {
        Self {
            blendshapes: BlendshapeFrame::zeros(),
            jaw: 0.0,
            eyes: None,
            time: 0.0,
            timestamp_ms: now_millis(),
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Explicit emotions occupying the first slots of the emotion vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Emotion {
    Amazement,
    Anger,
    Cheekiness,
    Disgust,
    Fear,
    Grief,
    Joy,
    OutOfBreath,
    Pain,
    Sadness,
}

impl Emotion {
    pub const ALL: [Emotion; 10] = [
        Emotion::Amazement,
        Emotion::Anger,
        Emotion::Cheekiness,
        Emotion::Disgust,
        Emotion::Fear,
        Emotion::Grief,
        Emotion::Joy,
        Emotion::OutOfBreath,
        Emotion::Pain,
        Emotion::Sadness,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Emotion::Amazement => "amazement",
            Emotion::Anger => "anger",
            Emotion::Cheekiness => "cheekiness",
            Emotion::Disgust => "disgust",
            Emotion::Fear => "fear",
            Emotion::Grief => "grief",
            Emotion::Joy => "joy",
            Emotion::OutOfBreath => "outofbreath",
            Emotion::Pain => "pain",
            Emotion::Sadness => "sadness",
        }
    }
}

impl FromStr for Emotion {
    type Err = FacecastError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|e| e.name() == s)
            .ok_or_else(|| {
                let valid: Vec<&str> = Self::ALL.iter().map(|e| e.name()).collect();
                FacecastError::range(format!(
                    "unknown emotion: {s}. Valid: {}",
                    valid.join(", ")
                ))
            })
    }
}

/// Smoothing region. Channels `0..=UPPER_FACE_MAX` are upper face.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceRegion {
    Upper,
    Lower,
}

impl FromStr for FaceRegion {
    type Err = FacecastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "upper" => Ok(FaceRegion::Upper),
            "lower" => Ok(FaceRegion::Lower),
            other => Err(FacecastError::range(format!(
                "unknown region: {other}. Valid: upper, lower"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_order_matches_name_table() {
        for (i, shape) in Blendshape::ALL.iter().enumerate() {
            assert_eq!(shape.index(), i);
            assert_eq!(shape.name(), BLENDSHAPE_NAMES[i]);
        }
        assert_eq!(Blendshape::JawOpen.index(), 24);
        assert_eq!(Blendshape::JawForward.index(), 25);
        assert_eq!(Blendshape::CheekPuff.index(), UPPER_FACE_MAX);
    }

    #[test]
    fn parse_names() {
        assert_eq!("mouthClose".parse::<Blendshape>().unwrap(), Blendshape::MouthClose);
        assert!(matches!(
            "mouthYawn".parse::<Blendshape>(),
            Err(FacecastError::Range(_))
        ));
        assert_eq!("joy".parse::<Emotion>().unwrap().index(), 6);
        assert!(matches!(
            "boredom".parse::<Emotion>(),
            Err(FacecastError::Range(_))
        ));
        assert!("upper".parse::<FaceRegion>().is_ok());
        assert!(matches!(
            "middle".parse::<FaceRegion>(),
            Err(FacecastError::Range(_))
        ));
    }

    #[test]
    fn frame_serializes_as_ordered_map() {
        let mut frame = BlendshapeFrame::zeros();
        frame[Blendshape::JawOpen] = 0.5;
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.starts_with("{\"browInnerUp\":0.0"));
        assert!(json.contains("\"jawOpen\":0.5"));
    }

    #[test]
    fn from_slice_zero_fills() {
        let frame = BlendshapeFrame::from_slice(&[0.1, 0.2]);
        assert_eq!(frame.get(Blendshape::BrowDownLeft), 0.2);
        assert_eq!(frame.get(Blendshape::MouthStretchRight), 0.0);
    }
}
