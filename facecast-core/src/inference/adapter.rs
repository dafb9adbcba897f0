//! Window → raw network output.
//!
//! Resolves the model's input/output slots once at `prepare` time and keeps
//! pre-sized scratch buffers so a steady stream of equal-length windows
//! never allocates on the input side.

use tracing::{debug, info};

use crate::error::{FacecastError, Result};
use crate::face::blendshape::EMOTION_DIM;
use crate::inference::{EngineHandle, NamedTensor};

const AUDIO_INPUT_CANDIDATES: &[&str] = &["audio", "input"];
const EMOTION_INPUT: &str = "emotion";

fn resolve_name(candidates: &[String], preferred: &[&str]) -> Option<String> {
    preferred
        .iter()
        .find_map(|needle| candidates.iter().find(|name| name == needle).cloned())
}

pub struct InferenceAdapter {
    engine: EngineHandle,
    audio_input: String,
    emotion_input: Option<String>,
    primary_output: String,
    audio_buf: Vec<f32>,
    emotion_buf: [f32; EMOTION_DIM],
}

impl InferenceAdapter {
    /// # Errors
    /// `FacecastError::Inference` if the engine declares no inputs or no outputs.
    pub fn prepare(engine: &EngineHandle, window_len: usize) -> Result<Self> {
        let (inputs, outputs) = {
            let guard = engine.0.lock();
            (guard.input_names().to_vec(), guard.output_names().to_vec())
        };

        let audio_input = resolve_name(&inputs, AUDIO_INPUT_CANDIDATES)
            .or_else(|| inputs.first().cloned())
            .ok_or_else(|| FacecastError::Inference("model declares no inputs".into()))?;
        let emotion_input = inputs.iter().find(|n| *n == EMOTION_INPUT).cloned();
        let primary_output = outputs
            .first()
            .cloned()
            .ok_or_else(|| FacecastError::Inference("model declares no outputs".into()))?;

        info!(
            audio = %audio_input,
            emotion = ?emotion_input,
            output = %primary_output,
            window_len,
            "inference adapter prepared"
        );

        Ok(Self {
            engine: engine.clone(),
            audio_input,
            emotion_input,
            primary_output,
            audio_buf: vec![0.0; window_len],
            emotion_buf: [0.0; EMOTION_DIM],
        })
    }

    pub fn audio_input(&self) -> &str {
        &self.audio_input
    }

    pub fn emotion_input(&self) -> Option<&str> {
        self.emotion_input.as_deref()
    }

    pub fn primary_output(&self) -> &str {
        &self.primary_output
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    /// Run one window and return the primary output's flat data.
    ///
    /// Engine errors propagate unchanged.
    pub fn infer(&mut self, window: &[f32], emotion: &[f32; EMOTION_DIM]) -> Result<Vec<f32>> {
        // Windows of the prepared length reuse the cached buffer.
        let fresh;
        let audio: &[f32] = if window.len() == self.audio_buf.len() {
            self.audio_buf.copy_from_slice(window);
            &self.audio_buf
        } else {
            debug!(
                expected = self.audio_buf.len(),
                got = window.len(),
                "window length differs from prepared buffer"
            );
            fresh = window.to_vec();
            &fresh
        };
        self.emotion_buf.copy_from_slice(emotion);

        let audio_shape = [1, 1, audio.len()];
        let emotion_shape = [1, 1, EMOTION_DIM];
        let mut inputs = Vec::with_capacity(2);
        inputs.push(NamedTensor {
            name: &self.audio_input,
            data: audio,
            shape: &audio_shape,
        });
        if let Some(name) = &self.emotion_input {
            inputs.push(NamedTensor {
                name,
                data: &self.emotion_buf,
                shape: &emotion_shape,
            });
        }

        let outputs = self.engine.0.lock().run(&inputs)?;
        let mut outputs = outputs.into_iter();
        let mut first = None;
        for (name, tensor) in outputs.by_ref() {
            if name == self.primary_output {
                return Ok(tensor.data);
            }
            first.get_or_insert(tensor);
        }
        first
            .map(|t| t.data)
            .ok_or_else(|| FacecastError::Inference("engine returned no outputs".into()))
    }
}

impl std::fmt::Debug for InferenceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceAdapter")
            .field("audio_input", &self.audio_input)
            .field("emotion_input", &self.emotion_input)
            .field("primary_output", &self.primary_output)
            .field("window_len", &self.audio_buf.len())
            .finish()
    }
}
