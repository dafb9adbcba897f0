//! Inference engine boundary.
//!
//! The `InferenceEngine` trait decouples the pipeline from any specific
//! runtime (deterministic stub, ONNX Runtime via `ort`, ...). Engines are
//! driven by name: the adapter introspects input/output names once and then
//! feeds flat f32 buffers with explicit shapes.
//!
//! `run` takes `&mut self` because runtimes keep per-session scratch state;
//! all calls are serialised through `EngineHandle`'s `parking_lot::Mutex`,
//! which also lets one loaded model serve several pipelines.

pub mod adapter;
pub mod stub;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::{ExecutionPreference, OnnxEngine, OnnxEngineConfig};

pub use adapter::InferenceAdapter;
pub use stub::StubEngine;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

/// Owned dense f32 tensor, row-major.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl Tensor {
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        Self { data, shape }
    }
}

/// Borrowed input tensor bound to an engine input name.
#[derive(Debug, Clone, Copy)]
pub struct NamedTensor<'a> {
    pub name: &'a str,
    pub data: &'a [f32],
    pub shape: &'a [usize],
}

/// Contract for inference backends.
pub trait InferenceEngine: Send + 'static {
    /// Declared input names, in model order.
    fn input_names(&self) -> &[String];

    /// Declared output names, in model order.
    fn output_names(&self) -> &[String];

    /// Run one forward pass. Returns every produced output by name.
    ///
    /// # Errors
    /// `FacecastError::Inference` when the runtime rejects the inputs or
    /// fails mid-run.
    fn run(&mut self, inputs: &[NamedTensor<'_>]) -> Result<Vec<(String, Tensor)>>;
}

/// Thread-safe reference-counted handle to any `InferenceEngine`.
#[derive(Clone)]
pub struct EngineHandle(pub Arc<Mutex<dyn InferenceEngine>>);

impl EngineHandle {
    pub fn new<E: InferenceEngine>(engine: E) -> Self {
        Self(Arc::new(Mutex::new(engine)))
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle").finish_non_exhaustive()
    }
}
