//! `FaceEngine`: live lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! FaceEngine::new(pipeline)
//!     └─► start()   → pipeline reset, SPSC sink created, worker spawned, status = Running
//!         └─► stop() → session flag cleared, status = Stopped
//! ```
//!
//! Calling `start()`/`stop()` in the wrong state returns an error rather than
//! panicking.
//!
//! ## Threading
//!
//! The host pushes mono f32 into the returned [`AudioSink`] from any thread,
//! including an audio callback (`push` is wait-free). A `spawn_blocking`
//! worker drains the sink, converts to the model rate, runs the pipeline
//! under its lock and broadcasts one `FrameEvent` per window.

pub mod pipeline;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::{
    audio::resample::RateConverter,
    buffering::{create_audio_sink, AudioConsumer, AudioProducer, Consumer, Producer},
    error::{FacecastError, Result},
    ipc::events::{EngineStatus, EngineStatusEvent, FrameEvent},
};

pub use pipeline::{
    ChunkOutcome, DiagnosticsSnapshot, FacePipeline, PipelineDiagnostics, SharedPipeline,
};

/// Broadcast channel capacity for slow consumers.
const BROADCAST_CAP: usize = 256;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Rate of the audio pushed into the sink (Hz). Converted to the model
    /// rate when different. Default: the model rate.
    pub input_sample_rate: Option<u32>,
    /// Samples drained per worker iteration. Default: 960.
    pub drain_chunk: usize,
    /// Worker sleep when the sink is empty. Default: 5 ms.
    pub idle_sleep: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: None,
            drain_chunk: 960,
            idle_sleep: Duration::from_millis(5),
        }
    }
}

/// Producer half handed to the host.
pub struct AudioSink {
    producer: AudioProducer,
    sample_rate: u32,
}

impl AudioSink {
    /// Push samples; returns how many fit. Never blocks.
    pub fn push(&mut self, samples: &[f32]) -> usize {
        self.producer.push_slice(samples)
    }

    /// Rate the engine expects on this sink.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// `Send + Sync`; wrap in `Arc<FaceEngine>` to share with event forwarders.
pub struct FaceEngine {
    config: EngineConfig,
    pipeline: SharedPipeline,
    /// Running flag of the active session. Each `start()` gets a fresh flag
    /// so a worker from a previous session cannot be revived.
    session: Mutex<Option<Arc<AtomicBool>>>,
    status: Arc<Mutex<EngineStatus>>,
    frame_tx: broadcast::Sender<FrameEvent>,
    status_tx: broadcast::Sender<EngineStatusEvent>,
    seq: Arc<AtomicU64>,
}

impl FaceEngine {
    pub fn new(config: EngineConfig, pipeline: SharedPipeline) -> Self {
        let (frame_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            config,
            pipeline,
            session: Mutex::new(None),
            status: Arc::new(Mutex::new(EngineStatus::Idle)),
            frame_tx,
            status_tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared pipeline, for controls (emotion, smoothing) while running.
    pub fn pipeline(&self) -> &SharedPipeline {
        &self.pipeline
    }

    /// Spawn the worker and return the sink to push audio into.
    ///
    /// # Errors
    /// - `FacecastError::AlreadyRunning` if a session is active.
    /// - `FacecastError::Uninitialized` if the pipeline has no model.
    pub async fn start(&self) -> Result<AudioSink> {
        if self.is_running() {
            return Err(FacecastError::AlreadyRunning);
        }

        let (ready, model_rate, diagnostics) = self
            .pipeline
            .with(|p| (p.is_ready(), p.config().sample_rate, p.diagnostics()))
            .await;
        if !ready {
            return Err(FacecastError::Uninitialized("inference model"));
        }
        let input_rate = self.config.input_sample_rate.unwrap_or(model_rate);
        let converter = RateConverter::new(input_rate, model_rate, self.config.drain_chunk)?;

        let running = Arc::new(AtomicBool::new(true));
        {
            let mut session = self.session.lock();
            // Re-check: another caller may have started while we awaited.
            if session.is_some() {
                return Err(FacecastError::AlreadyRunning);
            }
            *session = Some(Arc::clone(&running));
        }
        // Each session starts a fresh timeline: no leftover audio, smoothing
        // history or sample count from the previous one.
        self.pipeline.with(|p| p.reset()).await;
        diagnostics.reset();
        set_status(&self.status, &self.status_tx, EngineStatus::Running, None);

        let (producer, consumer) = create_audio_sink();
        let ctx = WorkerContext {
            config: self.config.clone(),
            pipeline: self.pipeline.clone(),
            consumer,
            converter,
            running,
            frame_tx: self.frame_tx.clone(),
            status_tx: self.status_tx.clone(),
            status: Arc::clone(&self.status),
            seq: Arc::clone(&self.seq),
        };
        tokio::task::spawn_blocking(move || run_worker(ctx));

        info!(input_rate, model_rate, "engine started");
        Ok(AudioSink {
            producer,
            sample_rate: input_rate,
        })
    }

    /// # Errors
    /// `FacecastError::NotRunning` if no session is active.
    pub fn stop(&self) -> Result<()> {
        let running = self.session.lock().take().ok_or(FacecastError::NotRunning)?;
        running.store(false, Ordering::SeqCst);
        set_status(&self.status, &self.status_tx, EngineStatus::Stopped, None);
        info!("engine stop requested");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Current engine status (snapshot).
    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    pub fn subscribe_frames(&self) -> broadcast::Receiver<FrameEvent> {
        self.frame_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Counters of the current (or last) session.
    pub async fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.pipeline.with(|p| p.diagnostics()).await.snapshot()
    }
}

impl Drop for FaceEngine {
    fn drop(&mut self) {
        if let Some(running) = self.session.lock().take() {
            running.store(false, Ordering::SeqCst);
        }
    }
}

fn set_status(
    status: &Mutex<EngineStatus>,
    tx: &broadcast::Sender<EngineStatusEvent>,
    new_status: EngineStatus,
    detail: Option<String>,
) {
    *status.lock() = new_status;
    let _ = tx.send(EngineStatusEvent {
        status: new_status,
        detail,
    });
}

struct WorkerContext {
    config: EngineConfig,
    pipeline: SharedPipeline,
    consumer: AudioConsumer,
    converter: RateConverter,
    running: Arc<AtomicBool>,
    frame_tx: broadcast::Sender<FrameEvent>,
    status_tx: broadcast::Sender<EngineStatusEvent>,
    status: Arc<Mutex<EngineStatus>>,
    seq: Arc<AtomicU64>,
}

fn run_worker(mut ctx: WorkerContext) {
    info!("engine worker started");
    let mut raw = vec![0f32; ctx.config.drain_chunk.max(1)];

    while ctx.running.load(Ordering::Relaxed) {
        let n = ctx.consumer.pop_slice(&mut raw);
        if n == 0 {
            std::thread::sleep(ctx.config.idle_sleep);
            continue;
        }

        let samples = ctx.converter.process(&raw[..n]);
        if samples.is_empty() {
            continue;
        }

        let processed = ctx.pipeline.blocking_with(|p| {
            let diagnostics = p.diagnostics();
            p.process_audio_chunk(&samples).map(|o| (o, diagnostics))
        });
        let (outcome, diagnostics) = match processed {
            Ok(pair) => pair,
            Err(e) => {
                report_error(&ctx, &e);
                continue;
            }
        };

        // Frames computed before or after a failed window are still delivered.
        let delivered = !outcome.results.is_empty();
        for result in outcome.results {
            let seq = ctx.seq.fetch_add(1, Ordering::Relaxed);
            diagnostics.frames_emitted.fetch_add(1, Ordering::Relaxed);
            // No subscribers is fine; frames are simply dropped.
            let _ = ctx.frame_tx.send(FrameEvent { seq, result });
        }
        match outcome.error {
            Some(e) => report_error(&ctx, &e),
            None if delivered && *ctx.status.lock() == EngineStatus::Error => {
                set_status(&ctx.status, &ctx.status_tx, EngineStatus::Running, None);
            }
            None => {}
        }
    }

    info!(emitted = ctx.seq.load(Ordering::Relaxed), "engine worker stopped");
}

fn report_error(ctx: &WorkerContext, e: &FacecastError) {
    error!(error = %e, "window processing failed");
    set_status(
        &ctx.status,
        &ctx.status_tx,
        EngineStatus::Error,
        Some(e.to_string()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::inference::{EngineHandle, StubEngine};

    fn ready_pipeline() -> SharedPipeline {
        let config = PipelineConfig {
            buffer_len: 120,
            buffer_ofs: 60,
            sample_rate: 1_000,
            ..PipelineConfig::default()
        };
        let engine = EngineHandle::new(StubEngine::new(config.layout.total()));
        SharedPipeline::new(FacePipeline::with_model(config, engine).unwrap())
    }

    #[tokio::test]
    async fn start_requires_model() {
        let engine = FaceEngine::new(
            EngineConfig::default(),
            SharedPipeline::new(FacePipeline::new(PipelineConfig::default())),
        );
        assert!(matches!(
            engine.start().await,
            Err(FacecastError::Uninitialized(_))
        ));
        assert_eq!(engine.status(), EngineStatus::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lifecycle_state_errors() {
        let engine = FaceEngine::new(EngineConfig::default(), ready_pipeline());
        assert!(matches!(engine.stop(), Err(FacecastError::NotRunning)));

        let _sink = engine.start().await.unwrap();
        assert!(engine.is_running());
        assert_eq!(engine.status(), EngineStatus::Running);
        assert!(matches!(
            engine.start().await,
            Err(FacecastError::AlreadyRunning)
        ));

        engine.stop().unwrap();
        assert!(!engine.is_running());
        assert_eq!(engine.status(), EngineStatus::Stopped);
        assert!(matches!(engine.stop(), Err(FacecastError::NotRunning)));

        // Restart gets a fresh session.
        let sink = engine.start().await.unwrap();
        assert_eq!(sink.sample_rate(), 1_000);
        engine.stop().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pushed_audio_becomes_frame_events() {
        let engine = FaceEngine::new(EngineConfig::default(), ready_pipeline());
        let mut frames = engine.subscribe_frames();
        let mut sink = engine.start().await.unwrap();

        assert_eq!(sink.push(&[0.2; 240]), 240);

        let mut seqs = Vec::new();
        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(5), frames.recv())
                .await
                .expect("frame within timeout")
                .unwrap();
            seqs.push(event.seq);
        }
        assert_eq!(seqs, vec![0, 1, 2]);

        engine.stop().unwrap();
        let diag = engine.diagnostics().await;
        assert_eq!(diag.windows_inferred, 3);
        assert_eq!(diag.frames_emitted, 3);
    }

    async fn next_frame(frames: &mut broadcast::Receiver<FrameEvent>) -> FrameEvent {
        tokio::time::timeout(Duration::from_secs(5), frames.recv())
            .await
            .expect("frame within timeout")
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_begins_a_fresh_timeline() {
        let engine = FaceEngine::new(EngineConfig::default(), ready_pipeline());
        let mut frames = engine.subscribe_frames();

        let mut sink = engine.start().await.unwrap();
        sink.push(&[0.2; 150]);
        assert!((next_frame(&mut frames).await.result.time - 0.06).abs() < 1e-9);
        engine.stop().unwrap();

        let mut sink = engine.start().await.unwrap();
        assert_eq!(engine.pipeline().with(|p| p.buffered_samples()).await, 0);
        sink.push(&[0.2; 120]);
        let first = next_frame(&mut frames).await;
        assert!((first.result.time - 0.06).abs() < 1e-9);
        engine.stop().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn frames_around_a_failed_window_are_broadcast() {
        let config = PipelineConfig {
            buffer_len: 120,
            buffer_ofs: 60,
            sample_rate: 1_000,
            ..PipelineConfig::default()
        };
        let stub = StubEngine::new(config.layout.total());
        let control = stub.control();
        let pipeline = FacePipeline::with_model(config, EngineHandle::new(stub)).unwrap();
        let engine = FaceEngine::new(EngineConfig::default(), SharedPipeline::new(pipeline));
        let mut frames = engine.subscribe_frames();
        let mut status = engine.subscribe_status();

        let mut sink = engine.start().await.unwrap();
        assert_eq!(status.recv().await.unwrap().status, EngineStatus::Running);
        control.fail_after(1, 1);
        sink.push(&[0.2; 240]);

        let a = next_frame(&mut frames).await;
        let b = next_frame(&mut frames).await;
        assert!((a.result.time - 0.06).abs() < 1e-9);
        assert!((b.result.time - 0.18).abs() < 1e-9);
        let failed = tokio::time::timeout(Duration::from_secs(5), status.recv())
            .await
            .expect("status within timeout")
            .unwrap();
        assert_eq!(failed.status, EngineStatus::Error);

        engine.stop().unwrap();
    }
}
