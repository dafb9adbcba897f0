//! `StubEngine`: deterministic in-process backend.
//!
//! Used by tests and by hosts that want to exercise the full pipeline
//! without a model file. Output is a pure function of the inputs, so two
//! runs over the same audio produce identical frames.
//!
//! Default output: `output_len` zeros, except slot 0 which carries the mean
//! absolute amplitude of the audio window scaled by `gain`. With the default
//! layout slot 0 is the first skin logit, so louder audio raises
//! `browInnerUp` under direct decoding.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{FacecastError, Result};
use crate::inference::{InferenceEngine, NamedTensor, Tensor};

type Generator = Box<dyn FnMut(&[f32], Option<&[f32]>) -> Vec<f32> + Send>;

/// Shared counters for a stub that has already been moved into a handle.
#[derive(Debug, Default)]
pub struct StubControl {
    calls: AtomicUsize,
    fail_remaining: AtomicUsize,
    /// Runs that still succeed before `fail_remaining` starts counting down.
    pass_first: AtomicUsize,
}

impl StubControl {
    /// Completed or failed `run` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }

    /// Make the next `n` runs fail with `FacecastError::Inference`.
    pub fn fail_next(&self, n: usize) {
        self.fail_after(0, n);
    }

    /// Let `pass` runs succeed, then fail the following `n`.
    pub fn fail_after(&self, pass: usize, n: usize) {
        self.pass_first.store(pass, Ordering::Release);
        self.fail_remaining.store(n, Ordering::Release);
    }
}

pub struct StubEngine {
    inputs: Vec<String>,
    outputs: Vec<String>,
    output_len: usize,
    delay: Option<Duration>,
    generator: Option<Generator>,
    gain: f32,
    control: Arc<StubControl>,
}

impl StubEngine {
    /// Inputs `audio` + `emotion`, one output `output` of `output_len` values.
    pub fn new(output_len: usize) -> Self {
        Self {
            inputs: vec!["audio".into(), "emotion".into()],
            outputs: vec!["output".into()],
            output_len,
            delay: None,
            generator: None,
            gain: 10.0,
            control: Arc::new(StubControl::default()),
        }
    }

    pub fn with_input_names(mut self, names: &[&str]) -> Self {
        self.inputs = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_output_names(mut self, names: &[&str]) -> Self {
        self.outputs = names.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Sleep this long inside every run.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_gain(mut self, gain: f32) -> Self {
        self.gain = gain;
        self
    }

    /// Replace the default output with `f(audio, emotion)`.
    pub fn with_generator<F>(mut self, f: F) -> Self
    where
        F: FnMut(&[f32], Option<&[f32]>) -> Vec<f32> + Send + 'static,
    {
        self.generator = Some(Box::new(f));
        self
    }

    pub fn control(&self) -> Arc<StubControl> {
        Arc::clone(&self.control)
    }

    fn default_output(&self, audio: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0; self.output_len];
        if let Some(first) = out.first_mut() {
            let mean = if audio.is_empty() {
                0.0
            } else {
                audio.iter().map(|s| s.abs()).sum::<f32>() / audio.len() as f32
            };
            *first = mean * self.gain;
        }
        out
    }
}

impl InferenceEngine for StubEngine {
    fn input_names(&self) -> &[String] {
        &self.inputs
    }

    fn output_names(&self) -> &[String] {
        &self.outputs
    }

    fn run(&mut self, inputs: &[NamedTensor<'_>]) -> Result<Vec<(String, Tensor)>> {
        self.control.calls.fetch_add(1, Ordering::AcqRel);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        let passing = self
            .control
            .pass_first
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        let failing = !passing
            && self
                .control
                .fail_remaining
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok();
        if failing {
            return Err(FacecastError::Inference("stub engine: injected failure".into()));
        }

        // First input is treated as audio unless one is literally named so.
        let audio = inputs
            .iter()
            .find(|t| t.name == "audio")
            .or_else(|| inputs.first())
            .ok_or_else(|| FacecastError::Inference("stub engine: no inputs".into()))?;
        let emotion = inputs.iter().find(|t| t.name == "emotion").map(|t| t.data);

        let data = match self.generator.as_mut() {
            Some(f) => f(audio.data, emotion),
            None => self.default_output(audio.data),
        };
        debug!(samples = audio.data.len(), out = data.len(), "stub run");

        let shape = vec![1, data.len()];
        Ok(self
            .outputs
            .first()
            .map(|name| vec![(name.clone(), Tensor::new(data, shape))])
            .unwrap_or_default())
    }
}
