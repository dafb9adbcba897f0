//! ONNX Runtime backend via the `ort` crate.
//!
//! Targets the audio-to-face network export: one audio input `[1, 1, N]`
//! (named `audio` or `input`), an optional `emotion` input `[1, 1, 26]`,
//! and a flat output whose regions are described by the network params of
//! the pipeline config.
//!
//! ## Environment
//!
//! | Variable                     | Effect                                    |
//! |------------------------------|-------------------------------------------|
//! | `FACECAST_ORT_EP`            | `auto` (default), `cpu`, `directml`       |
//! | `FACECAST_ORT_INTRA_THREADS` | intra-op threads, default half the cores  |

use std::path::{Path, PathBuf};

use ort::ep;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionInputValue};
use ort::value::TensorRef;
use tracing::{info, warn};

use crate::config::{model_dir, MODEL_FILE};
use crate::error::{FacecastError, Result};
use crate::inference::{InferenceEngine, NamedTensor, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPreference {
    /// Accelerated provider first, CPU if it cannot be created.
    Auto,
    Cpu,
    DirectML,
}

impl ExecutionPreference {
    pub fn from_env() -> Self {
        match std::env::var("FACECAST_ORT_EP")
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "cpu" => Self::Cpu,
            "dml" | "directml" => Self::DirectML,
            _ => Self::Auto,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OnnxEngineConfig {
    pub model_path: PathBuf,
    pub intra_threads: usize,
    pub execution: ExecutionPreference,
}

impl Default for OnnxEngineConfig {
    fn default() -> Self {
        Self::for_model(model_dir().join(MODEL_FILE))
    }
}

impl OnnxEngineConfig {
    /// Environment-derived settings for an explicit model path.
    pub fn for_model(model_path: impl Into<PathBuf>) -> Self {
        let logical_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        let intra_threads = std::env::var("FACECAST_ORT_INTRA_THREADS")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(logical_cores / 2)
            .clamp(1, 32);
        Self {
            model_path: model_path.into(),
            intra_threads,
            execution: ExecutionPreference::from_env(),
        }
    }
}

fn session_error(e: impl std::fmt::Display) -> FacecastError {
    FacecastError::OnnxSession(e.to_string())
}

fn base_builder(config: &OnnxEngineConfig) -> Result<SessionBuilder> {
    SessionBuilder::new()
        .map_err(session_error)?
        .with_intra_threads(config.intra_threads)
        .map_err(session_error)?
        .with_inter_threads(1)
        .map_err(session_error)?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(session_error)
}

fn create_cpu_session(config: &OnnxEngineConfig) -> Result<Session> {
    base_builder(config)?
        .with_execution_providers([ep::CPU::default().build()])
        .map_err(session_error)?
        .commit_from_file(&config.model_path)
        .map_err(session_error)
}

fn create_session(config: &OnnxEngineConfig) -> Result<Session> {
    info!(
        intra_threads = config.intra_threads,
        execution = ?config.execution,
        "ONNX session threading configured"
    );

    #[cfg(target_os = "windows")]
    {
        if config.execution != ExecutionPreference::Cpu {
            let accelerated = base_builder(config)?
                .with_execution_providers([ep::DirectML::default()
                    .with_device_id(0)
                    .build()
                    .error_on_failure()])
                .map_err(session_error)
                .and_then(|b| b.commit_from_file(&config.model_path).map_err(session_error));
            match accelerated {
                Ok(session) => {
                    info!("ONNX session created on DirectML");
                    return Ok(session);
                }
                Err(e) => {
                    warn!(error = %e, "DirectML session failed, rebuilding on CPU");
                }
            }
        }
    }

    #[cfg(not(target_os = "windows"))]
    {
        if config.execution == ExecutionPreference::DirectML {
            warn!("FACECAST_ORT_EP=directml requested on non-Windows host; using CPU EP");
        }
    }

    create_cpu_session(config)
}

pub struct OnnxEngine {
    session: Session,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl OnnxEngine {
    /// Load with environment-derived settings.
    pub fn load(path: &Path) -> Result<Self> {
        Self::with_config(OnnxEngineConfig::for_model(path))
    }

    pub fn with_config(config: OnnxEngineConfig) -> Result<Self> {
        if !config.model_path.exists() {
            return Err(FacecastError::ModelNotFound {
                path: config.model_path.clone(),
            });
        }
        let size_mb = std::fs::metadata(&config.model_path)
            .map(|m| m.len() as f64 / 1_048_576.0)
            .unwrap_or(0.0);
        info!(path = ?config.model_path, size_mb, "loading face model");

        let session = create_session(&config)?;
        let inputs: Vec<String> = session
            .inputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();
        let outputs: Vec<String> = session
            .outputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();
        info!(?inputs, ?outputs, "face model ready");

        Ok(Self {
            session,
            inputs,
            outputs,
        })
    }
}

impl InferenceEngine for OnnxEngine {
    fn input_names(&self) -> &[String] {
        &self.inputs
    }

    fn output_names(&self) -> &[String] {
        &self.outputs
    }

    fn run(&mut self, inputs: &[NamedTensor<'_>]) -> Result<Vec<(String, Tensor)>> {
        let mut values: Vec<(String, SessionInputValue<'_>)> = Vec::with_capacity(inputs.len());
        for input in inputs {
            let shape: Vec<i64> = input.shape.iter().map(|&d| d as i64).collect();
            let tensor = TensorRef::from_array_view((shape, input.data))
                .map_err(|e| FacecastError::Inference(format!("{}: {e}", input.name)))?;
            values.push((input.name.to_string(), SessionInputValue::from(tensor)));
        }

        let outputs = self
            .session
            .run(values)
            .map_err(|e| FacecastError::Inference(e.to_string()))?;

        let mut produced = Vec::with_capacity(self.outputs.len());
        for name in &self.outputs {
            let Some(value) = outputs.get(name.as_str()) else {
                continue;
            };
            let (shape, data) = value
                .try_extract_tensor::<f32>()
                .map_err(|e| FacecastError::Inference(format!("{name}: {e}")))?;
            let shape = shape.iter().map(|&d| d.max(0) as usize).collect();
            produced.push((name.clone(), Tensor::new(data.to_vec(), shape)));
        }
        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_is_reported_before_session_creation() {
        let path = std::env::temp_dir().join("facecast-missing-model.onnx");
        match OnnxEngine::load(&path) {
            Err(FacecastError::ModelNotFound { path: p }) => assert_eq!(p, path),
            other => panic!("expected ModelNotFound, got {:?}", other.err()),
        }
    }

    #[test]
    fn intra_threads_never_zero() {
        assert!(OnnxEngineConfig::for_model("model.onnx").intra_threads >= 1);
    }
}
