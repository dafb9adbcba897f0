//! Event types broadcast by a live [`FaceEngine`](crate::engine::FaceEngine).
//!
//! | Event               | Receiver from                     |
//! |---------------------|-----------------------------------|
//! | `FrameEvent`        | `FaceEngine::subscribe_frames()`  |
//! | `EngineStatusEvent` | `FaceEngine::subscribe_status()`  |
//!
//! Hosts that forward events over a socket serialise them as camelCase JSON.

use serde::{Deserialize, Serialize};

use crate::face::blendshape::InferenceResult;

/// One inferred window, smoothed, ready for an animation rig.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    #[serde(flatten)]
    pub result: InferenceResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatusEvent {
    pub status: EngineStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Created, `start()` not yet called.
    Idle,
    /// Worker draining audio and emitting frames.
    Running,
    /// Stopped; may be restarted.
    Stopped,
    /// A window failed. The worker keeps going with the next chunk.
    Error,
}
