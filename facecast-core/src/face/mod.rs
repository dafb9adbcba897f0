//! Face-side model: blendshape channels, decoding from network output,
//! the PCA solve, and temporal smoothing.

pub mod blendshape;
pub mod derive;
pub mod smoothing;
pub mod solve;

pub use blendshape::{
    Blendshape, BlendshapeFrame, Emotion, EyeGaze, FaceRegion, InferenceResult,
    BLENDSHAPE_COUNT, BLENDSHAPE_NAMES, EMOTION_DIM, UPPER_FACE_MAX,
};
pub use derive::BlendshapeDecoder;
pub use smoothing::{aggregate_results, interpolate_to_frame_rate, AggregateResult, Smoother};
pub use solve::SolveData;
