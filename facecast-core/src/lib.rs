//! # facecast-core
//!
//! Audio-to-blendshape engine SDK.
//!
//! ## Architecture
//!
//! ```text
//! audio ─► AudioRingBuffer ─► window ─► InferenceAdapter::infer
//!                                              │
//!                                   BlendshapeDecoder::decode
//!                                   (direct or PCA solve)
//!                                              │
//!                                         Smoother::smooth
//!                                              │
//!                ┌─────────────────────────────┴───────────────┐
//!     broadcast::Sender<FrameEvent> (live)     interpolate_to_frame_rate
//!                                                        │
//!                                                  afan::encode
//! ```
//!
//! The live sink push is wait-free. All heap work happens on blocking threads.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod afan;
pub mod audio;
pub mod buffering;
pub mod config;
pub mod engine;
pub mod error;
pub mod face;
pub mod inference;
pub mod ipc;
pub mod npz;

// Convenience re-exports for downstream crates
pub use afan::{AfanAnimation, AfanVersion};
pub use config::{ConfigDocument, PipelineConfig};
pub use engine::{
    AudioSink, ChunkOutcome, EngineConfig, FaceEngine, FacePipeline, SharedPipeline,
};
pub use error::{FacecastError, Result};
pub use face::{Blendshape, BlendshapeFrame, Emotion, InferenceResult, SolveData};
pub use inference::{EngineHandle, InferenceEngine, StubEngine};
pub use ipc::events::{EngineStatus, EngineStatusEvent, FrameEvent};

#[cfg(feature = "onnx")]
pub use inference::{OnnxEngine, OnnxEngineConfig};
