//! Streaming and offline face pipeline.
//!
//! ## Streaming stages (per `process_audio_chunk`)
//!
//! ```text
//! 1. Append samples to the ring accumulator
//! 2. While a full window is buffered:
//!    a. Run the window through the inference adapter
//!    b. Consume one stride (a failed window is dropped too)
//!    c. Decode raw output → blendshapes, stamp with window-center time
//!    d. Smooth against the previous result
//! 3. Return every result produced by this call, plus the first engine
//!    error if any window failed
//! ```
//!
//! `FacePipeline` is single-writer (`&mut self`). `SharedPipeline` wraps it
//! in a FIFO-fair async mutex and runs the CPU work on `spawn_blocking`, so
//! at most one inference is in flight per instance.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::audio::resample::resample_linear;
use crate::buffering::chunk::AudioWindow;
use crate::buffering::ring::AudioRingBuffer;
use crate::config::{ConfigDocument, PipelineConfig, CONFIG_FILE};
use crate::error::{FacecastError, Result};
use crate::face::blendshape::{BlendshapeFrame, Emotion, FaceRegion, InferenceResult, EMOTION_DIM};
use crate::face::derive::BlendshapeDecoder;
use crate::face::smoothing::{interpolate_to_frame_rate, Smoother};
use crate::face::solve::SolveData;
use crate::inference::{EngineHandle, InferenceAdapter};

#[derive(Default)]
pub struct PipelineDiagnostics {
    pub samples_in: AtomicUsize,
    pub windows_inferred: AtomicUsize,
    pub inference_errors: AtomicUsize,
    pub frames_emitted: AtomicUsize,
}

impl PipelineDiagnostics {
    pub fn reset(&self) {
        self.samples_in.store(0, Ordering::Relaxed);
        self.windows_inferred.store(0, Ordering::Relaxed);
        self.inference_errors.store(0, Ordering::Relaxed);
        self.frames_emitted.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            samples_in: self.samples_in.load(Ordering::Relaxed),
            windows_inferred: self.windows_inferred.load(Ordering::Relaxed),
            inference_errors: self.inference_errors.load(Ordering::Relaxed),
            frames_emitted: self.frames_emitted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub samples_in: usize,
    pub windows_inferred: usize,
    pub inference_errors: usize,
    pub frames_emitted: usize,
}

/// What one `process_audio_chunk` call produced.
///
/// A failing window does not stop the chunk: the windows after it still run,
/// so `results` may be non-empty even when `error` is set.
#[derive(Debug, Default)]
pub struct ChunkOutcome {
    /// Smoothed results in time order.
    pub results: Vec<InferenceResult>,
    /// First engine error of the chunk, propagated as-is. Later failures in
    /// the same chunk are counted in the diagnostics and logged.
    pub error: Option<FacecastError>,
}

impl ChunkOutcome {
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

pub struct FacePipeline {
    config: PipelineConfig,
    ring: AudioRingBuffer,
    engine: Option<EngineHandle>,
    adapter: Option<InferenceAdapter>,
    decoder: BlendshapeDecoder,
    smoother: Smoother,
    last_result: Option<InferenceResult>,
    /// Samples consumed from the ring since creation or the last reset.
    consumed_samples: u64,
    diagnostics: Arc<PipelineDiagnostics>,
}

impl FacePipeline {
    /// A pipeline with no model attached. Processing fails with
    /// `Uninitialized` until `attach_model` is called.
    pub fn new(config: PipelineConfig) -> Self {
        let decoder = BlendshapeDecoder::new(config.layout, config.adjustments.clone());
        let smoother = Smoother::new(config.upper_face_smoothing, config.lower_face_smoothing);
        Self {
            config,
            ring: AudioRingBuffer::new(),
            engine: None,
            adapter: None,
            decoder,
            smoother,
            last_result: None,
            consumed_samples: 0,
            diagnostics: Arc::new(PipelineDiagnostics::default()),
        }
    }

    pub fn with_model(config: PipelineConfig, engine: EngineHandle) -> Result<Self> {
        let mut pipeline = Self::new(config);
        pipeline.attach_model(engine)?;
        Ok(pipeline)
    }

    /// Build from a model directory: `config.json` (optional) and
    /// `solve_data.npz` (optional) are read from `dir`; `engine` is attached.
    pub fn from_model_dir(dir: &Path, engine: EngineHandle) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        let config = if config_path.exists() {
            PipelineConfig::load(&config_path)?
        } else {
            info!(path = ?config_path, "no config document, using defaults");
            PipelineConfig::default()
        };
        let mut pipeline = Self::with_model(config, engine)?;
        pipeline.attach_solve_data(SolveData::load_from_dir(dir)?.map(Arc::new));
        Ok(pipeline)
    }

    pub fn attach_model(&mut self, engine: EngineHandle) -> Result<()> {
        self.adapter = Some(InferenceAdapter::prepare(&engine, self.config.buffer_len)?);
        self.engine = Some(engine);
        Ok(())
    }

    /// `None` switches back to direct decoding.
    pub fn attach_solve_data(&mut self, solve: Option<Arc<SolveData>>) {
        info!(pca = solve.is_some(), "blendshape decoding strategy selected");
        self.decoder.set_solve_data(solve);
    }

    pub fn is_ready(&self) -> bool {
        self.adapter.is_some()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> Arc<PipelineDiagnostics> {
        Arc::clone(&self.diagnostics)
    }

    /// Samples buffered but not yet consumed by a window stride.
    pub fn buffered_samples(&self) -> usize {
        self.ring.len()
    }

    /// Overlay a config document. On error nothing changes.
    pub fn reload_config(&mut self, doc: &ConfigDocument) -> Result<()> {
        let mut next = self.config.clone();
        next.apply(doc)?;

        if next.buffer_len != self.config.buffer_len {
            if let Some(engine) = &self.engine {
                self.adapter = Some(InferenceAdapter::prepare(engine, next.buffer_len)?);
            }
        }
        self.decoder.set_layout(next.layout, next.adjustments.clone());
        self.smoother = Smoother::new(next.upper_face_smoothing, next.lower_face_smoothing);
        debug!(
            buffer_len = next.buffer_len,
            buffer_ofs = next.buffer_ofs,
            "pipeline config reloaded"
        );
        self.config = next;
        Ok(())
    }

    // ── Controls ─────────────────────────────────────────────────────────────

    /// Set one explicit emotion, value clamped to [0, 1].
    pub fn set_emotion(&mut self, name: &str, value: f32) -> Result<()> {
        let emotion: Emotion = name.parse()?;
        self.config.emotion[emotion.index()] = value.clamp(0.0, 1.0);
        Ok(())
    }

    /// Set several emotions. Validated up front; on error nothing changes.
    pub fn set_emotions<'a, I>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, f32)>,
    {
        let parsed = values
            .into_iter()
            .map(|(name, value)| name.parse::<Emotion>().map(|e| (e, value)))
            .collect::<Result<Vec<_>>>()?;
        for (emotion, value) in parsed {
            self.config.emotion[emotion.index()] = value.clamp(0.0, 1.0);
        }
        Ok(())
    }

    pub fn emotion_vector(&self) -> [f32; EMOTION_DIM] {
        self.config.emotion
    }

    pub fn set_smoothing(&mut self, factor: f32) {
        self.smoother.set_smoothing(factor);
        self.config.upper_face_smoothing = self.smoother.upper();
        self.config.lower_face_smoothing = self.smoother.lower();
    }

    pub fn set_smoothing_region(&mut self, region: &str, factor: f32) -> Result<()> {
        let region: FaceRegion = region.parse()?;
        self.smoother.set_region(region, factor);
        self.config.upper_face_smoothing = self.smoother.upper();
        self.config.lower_face_smoothing = self.smoother.lower();
        Ok(())
    }

    // ── Streaming ────────────────────────────────────────────────────────────

    /// Latest smoothed result, or the empty result before the first window.
    pub fn current_result(&self) -> InferenceResult {
        self.last_result.clone().unwrap_or_else(InferenceResult::empty)
    }

    /// Push mono samples at the model rate and run every window that
    /// becomes available.
    ///
    /// # Errors
    /// `Uninitialized` without a model. Engine failures do not abort the
    /// chunk; they are reported in [`ChunkOutcome::error`].
    pub fn process_audio_chunk(&mut self, samples: &[f32]) -> Result<ChunkOutcome> {
        let adapter = self
            .adapter
            .as_mut()
            .ok_or(FacecastError::Uninitialized("inference model"))?;

        self.ring.append(samples);
        self.diagnostics
            .samples_in
            .fetch_add(samples.len(), Ordering::Relaxed);

        let window_len = self.config.buffer_len;
        let stride = self.config.buffer_ofs;
        let rate = self.config.sample_rate;
        let mut outcome = ChunkOutcome::default();

        while self.ring.has_window(window_len) {
            let window = AudioWindow::new(
                self.ring.peek_window(window_len)?,
                self.consumed_samples,
                rate,
            );
            let time = window.center_secs() + self.config.prediction_delay.unwrap_or(0.0);
            let inferred = adapter.infer(window.samples, &self.config.emotion);

            self.ring.consume(stride)?;
            self.consumed_samples += stride as u64;

            let raw = match inferred {
                Ok(raw) => raw,
                Err(e) => {
                    self.diagnostics
                        .inference_errors
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, time, "window inference failed");
                    outcome.error.get_or_insert(e);
                    continue;
                }
            };
            self.diagnostics
                .windows_inferred
                .fetch_add(1, Ordering::Relaxed);

            let mut result = self.decoder.decode(&raw, time);
            let prev = self.last_result.as_ref().map(|r| &r.blendshapes);
            result.blendshapes = self.smoother.smooth(prev, &result.blendshapes);
            self.last_result = Some(result.clone());
            outcome.results.push(result);
        }

        Ok(outcome)
    }

    /// Clear buffered audio, timeline and smoothing history.
    pub fn reset(&mut self) {
        self.ring.clear();
        self.last_result = None;
        self.consumed_samples = 0;
        debug!("pipeline reset");
    }

    /// Reset and detach the model.
    pub fn dispose(&mut self) {
        self.reset();
        self.adapter = None;
        self.engine = None;
        info!("pipeline disposed");
    }

    // ── Offline ──────────────────────────────────────────────────────────────

    /// Run a whole clip without touching the streaming state.
    ///
    /// Windows start at `0, stride, 2·stride, …` while `start + window_len`
    /// stays strictly below the clip length. Results are smoothed in time
    /// order.
    pub fn process_utterance(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<Vec<InferenceResult>> {
        let adapter = self
            .adapter
            .as_mut()
            .ok_or(FacecastError::Uninitialized("inference model"))?;

        let rate = self.config.sample_rate;
        let resampled;
        let audio: &[f32] = if sample_rate == rate {
            samples
        } else {
            resampled = resample_linear(samples, sample_rate, rate)?;
            &resampled
        };

        let window_len = self.config.buffer_len;
        let stride = self.config.buffer_ofs;
        let delay = self.config.prediction_delay.unwrap_or(0.0);
        let mut results = Vec::new();
        let mut start = 0usize;

        while start + window_len < audio.len() {
            let window = AudioWindow::new(&audio[start..start + window_len], start as u64, rate);
            let raw = adapter.infer(window.samples, &self.config.emotion)?;
            results.push(self.decoder.decode(&raw, window.center_secs() + delay));
            start += stride;
        }

        self.smoother.smooth_in_order(&mut results);
        info!(
            samples = audio.len(),
            windows = results.len(),
            "utterance processed"
        );
        Ok(results)
    }

    /// `process_utterance` resampled onto a fixed frame grid covering the clip.
    pub fn render_utterance(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
        fps: f64,
    ) -> Result<Vec<BlendshapeFrame>> {
        if sample_rate == 0 {
            return Err(FacecastError::range("sample rate must be > 0"));
        }
        let duration = samples.len() as f64 / f64::from(sample_rate);
        let results = self.process_utterance(samples, sample_rate)?;
        Ok(interpolate_to_frame_rate(&results, fps, duration))
    }
}

impl std::fmt::Debug for FacePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacePipeline")
            .field("config", &self.config)
            .field("buffered", &self.ring.len())
            .field("adapter", &self.adapter)
            .field("consumed_samples", &self.consumed_samples)
            .finish_non_exhaustive()
    }
}

// ── Shared, single-flight wrapper ────────────────────────────────────────────

/// Cloneable async handle. Calls queue in arrival order; each runs to
/// completion on a blocking thread before the next one starts.
#[derive(Clone)]
pub struct SharedPipeline {
    inner: Arc<AsyncMutex<FacePipeline>>,
}

impl SharedPipeline {
    pub fn new(pipeline: FacePipeline) -> Self {
        Self {
            inner: Arc::new(AsyncMutex::new(pipeline)),
        }
    }

    pub async fn process_audio_chunk(&self, samples: Vec<f32>) -> Result<ChunkOutcome> {
        self.run_blocking(move |p| p.process_audio_chunk(&samples))
            .await
    }

    pub async fn process_utterance(
        &self,
        samples: Vec<f32>,
        sample_rate: u32,
    ) -> Result<Vec<InferenceResult>> {
        self.run_blocking(move |p| p.process_utterance(&samples, sample_rate))
            .await
    }

    pub async fn current_result(&self) -> InferenceResult {
        self.inner.lock().await.current_result()
    }

    /// Run a short synchronous operation (controls, config) under the lock.
    pub async fn with<R>(&self, f: impl FnOnce(&mut FacePipeline) -> R) -> R {
        let mut guard = self.inner.lock().await;
        f(&mut guard)
    }

    /// Synchronous access for code already on a blocking thread.
    pub fn blocking_with<R>(&self, f: impl FnOnce(&mut FacePipeline) -> R) -> R {
        let mut guard = self.inner.blocking_lock();
        f(&mut guard)
    }

    async fn run_blocking<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut FacePipeline) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let mut guard = Arc::clone(&self.inner).lock_owned().await;
        // The owned guard moves into the task, so the lock is released when the
        // task finishes, errors or panics.
        tokio::task::spawn_blocking(move || f(&mut guard))
            .await
            .map_err(|e| FacecastError::Other(anyhow::anyhow!("pipeline task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::StubEngine;
    use approx::assert_relative_eq;

    fn small_config() -> PipelineConfig {
        PipelineConfig {
            buffer_len: 120,
            buffer_ofs: 60,
            sample_rate: 1_000,
            ..PipelineConfig::default()
        }
    }

    fn pipeline(config: PipelineConfig) -> FacePipeline {
        let engine = EngineHandle::new(StubEngine::new(config.layout.total()));
        FacePipeline::with_model(config, engine).unwrap()
    }

    #[test]
    fn processing_without_model_is_uninitialized() {
        let mut p = FacePipeline::new(small_config());
        assert!(!p.is_ready());
        assert!(matches!(
            p.process_audio_chunk(&[0.0; 10]),
            Err(FacecastError::Uninitialized(_))
        ));
        assert!(matches!(
            p.process_utterance(&[0.0; 10], 1_000),
            Err(FacecastError::Uninitialized(_))
        ));
    }

    #[test]
    fn windows_follow_append_and_stride() {
        let mut p = pipeline(small_config());
        assert!(p.process_audio_chunk(&[0.1; 100]).unwrap().results.is_empty());

        let first = p.process_audio_chunk(&[0.1; 50]).unwrap().results;
        assert_eq!(first.len(), 1);
        assert_eq!(p.buffered_samples(), 90);
        // Center of samples 0..120 at 1 kHz.
        assert_relative_eq!(first[0].time, 0.06);

        let second = p.process_audio_chunk(&[0.1; 40]).unwrap().results;
        assert_eq!(second.len(), 1);
        assert_relative_eq!(second[0].time, 0.12);
        assert_eq!(p.current_result(), second[0]);
    }

    #[test]
    fn large_chunk_yields_every_window() {
        let mut p = pipeline(small_config());
        let results = p.process_audio_chunk(&[0.2; 600]).unwrap().results;
        // Windows at 0, 60, ... 480.
        assert_eq!(results.len(), 9);
        assert!(results.windows(2).all(|w| w[0].time < w[1].time));
        assert_eq!(p.diagnostics().snapshot().windows_inferred, 9);
    }

    #[test]
    fn prediction_delay_shifts_time() {
        let mut config = small_config();
        config.prediction_delay = Some(0.5);
        let mut p = pipeline(config);
        let results = p.process_audio_chunk(&[0.0; 120]).unwrap().results;
        assert_relative_eq!(results[0].time, 0.56);
    }

    #[test]
    fn failed_window_is_consumed_and_later_windows_run() {
        let config = small_config();
        let engine = StubEngine::new(config.layout.total());
        let control = engine.control();
        let mut p = FacePipeline::with_model(config, EngineHandle::new(engine)).unwrap();

        control.fail_next(1);
        let outcome = p.process_audio_chunk(&[0.0; 120]).unwrap();
        assert!(outcome.results.is_empty());
        assert!(matches!(outcome.error, Some(FacecastError::Inference(_))));
        assert_eq!(p.buffered_samples(), 60);

        let next = p.process_audio_chunk(&[0.0; 60]).unwrap();
        assert!(next.is_clean());
        assert_eq!(next.results.len(), 1);
        assert_eq!(p.diagnostics().snapshot().inference_errors, 1);
    }

    #[test]
    fn middle_window_failure_keeps_neighbours_in_the_same_chunk() {
        let config = small_config();
        let engine = StubEngine::new(config.layout.total());
        let control = engine.control();
        let mut p = FacePipeline::with_model(config, EngineHandle::new(engine)).unwrap();

        // 240 samples → windows at 0, 60, 120; the second one fails.
        control.fail_after(1, 1);
        let outcome = p.process_audio_chunk(&[0.1; 240]).unwrap();

        assert!(matches!(outcome.error, Some(FacecastError::Inference(_))));
        let times: Vec<f64> = outcome.results.iter().map(|r| r.time).collect();
        assert_eq!(times.len(), 2);
        assert_relative_eq!(times[0], 0.06);
        assert_relative_eq!(times[1], 0.18);
        // Nothing is left waiting for more audio.
        assert_eq!(p.buffered_samples(), 60);
        assert_eq!(p.current_result(), outcome.results[1]);

        let diag = p.diagnostics().snapshot();
        assert_eq!(diag.windows_inferred, 2);
        assert_eq!(diag.inference_errors, 1);
    }

    #[test]
    fn emotions_validate_and_clamp() {
        let mut p = pipeline(small_config());
        p.set_emotion("joy", 3.0).unwrap();
        assert_eq!(p.emotion_vector()[6], 1.0);
        assert!(matches!(
            p.set_emotion("ennui", 0.5),
            Err(FacecastError::Range(_))
        ));

        let err = p.set_emotions([("anger", 0.4), ("boredom", 0.2)]);
        assert!(err.is_err());
        assert_eq!(p.emotion_vector()[1], 0.0);

        p.set_emotions([("anger", 0.4), ("sadness", -1.0)]).unwrap();
        assert_eq!(p.emotion_vector()[1], 0.4);
        assert_eq!(p.emotion_vector()[9], 0.0);
    }

    #[test]
    fn smoothing_controls() {
        let mut p = pipeline(small_config());
        p.set_smoothing(0.9);
        assert_eq!(p.config().upper_face_smoothing, 0.9);
        p.set_smoothing_region("lower", 0.1).unwrap();
        assert_eq!(p.config().lower_face_smoothing, 0.1);
        assert!(p.set_smoothing_region("middle", 0.1).is_err());
    }

    #[test]
    fn reset_clears_timeline_and_dispose_detaches() {
        let mut p = pipeline(small_config());
        p.process_audio_chunk(&[0.0; 150]).unwrap();
        p.reset();
        assert_eq!(p.buffered_samples(), 0);
        assert_eq!(p.current_result().eyes, None);
        let again = p.process_audio_chunk(&[0.0; 120]).unwrap().results;
        assert_relative_eq!(again[0].time, 0.06);

        p.dispose();
        assert!(matches!(
            p.process_audio_chunk(&[0.0; 120]),
            Err(FacecastError::Uninitialized(_))
        ));
    }

    #[test]
    fn utterance_window_count_is_strict() {
        let mut p = pipeline(small_config());
        // start + 120 < 240 → starts 0, 60. start 120 is excluded.
        let results = p.process_utterance(&[0.0; 240], 1_000).unwrap();
        assert_eq!(results.len(), 2);
        let results = p.process_utterance(&[0.0; 241], 1_000).unwrap();
        assert_eq!(results.len(), 3);
        // Streaming state untouched.
        assert_eq!(p.buffered_samples(), 0);
    }

    #[test]
    fn utterance_resamples_to_model_rate() {
        let mut p = pipeline(small_config());
        // 482 samples at 2 kHz → 241 at 1 kHz → three windows.
        let results = p.process_utterance(&[0.0; 482], 2_000).unwrap();
        assert_eq!(results.len(), 3);
        let frames = p.render_utterance(&[0.0; 482], 2_000, 30.0).unwrap();
        assert_eq!(frames.len(), 8);
    }

    #[test]
    fn reload_config_rejects_and_keeps_previous() {
        let mut p = pipeline(small_config());
        let bad: ConfigDocument =
            serde_json::from_str(r#"{ "audio_params": { "buffer_len": 0 } }"#).unwrap();
        assert!(p.reload_config(&bad).is_err());
        assert_eq!(p.config().buffer_len, 120);

        let good: ConfigDocument =
            serde_json::from_str(r#"{ "audio_params": { "buffer_len": 200, "buffer_ofs": 100 } }"#)
                .unwrap();
        p.reload_config(&good).unwrap();
        let results = p.process_audio_chunk(&[0.0; 200]).unwrap().results;
        assert_eq!(results.len(), 1);
        assert_relative_eq!(results[0].time, 0.1);
    }
}
