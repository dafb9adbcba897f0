use std::sync::Arc;
use std::time::{Duration, Instant};

use facecast_core::config::PipelineConfig;
use facecast_core::engine::{EngineConfig, FaceEngine, FacePipeline, SharedPipeline};
use facecast_core::inference::{EngineHandle, StubEngine};
use facecast_core::ipc::events::{EngineStatus, FrameEvent};
use facecast_core::FacecastError;
use tokio::sync::broadcast;

const INFER_DELAY: Duration = Duration::from_millis(40);

fn small_config() -> PipelineConfig {
    PipelineConfig {
        buffer_len: 120,
        buffer_ofs: 60,
        sample_rate: 1_000,
        ..PipelineConfig::default()
    }
}

fn delayed_pipeline() -> (SharedPipeline, Arc<facecast_core::inference::stub::StubControl>) {
    let config = small_config();
    let stub = StubEngine::new(config.layout.total()).with_delay(INFER_DELAY);
    let control = stub.control();
    let pipeline = FacePipeline::with_model(config, EngineHandle::new(stub)).unwrap();
    (SharedPipeline::new(pipeline), control)
}

async fn recv_frame_with_timeout(
    rx: &mut broadcast::Receiver<FrameEvent>,
    timeout: Duration,
) -> FrameEvent {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(ev)) => return ev,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                panic!("frame channel closed unexpectedly")
            }
            Err(_) => panic!("timed out waiting for frame event"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_chunks_run_one_at_a_time_in_arrival_order() {
    let (shared, control) = delayed_pipeline();

    let start = Instant::now();
    let first = {
        let shared = shared.clone();
        tokio::spawn(async move { shared.process_audio_chunk(vec![0.1; 120]).await })
    };
    // Let the first call take the lock before the second arrives.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = {
        let shared = shared.clone();
        tokio::spawn(async move { shared.process_audio_chunk(vec![0.1; 120]).await })
    };

    let first = first.await.unwrap().unwrap().results;
    let second = second.await.unwrap().unwrap().results;
    let elapsed = start.elapsed();

    // 120 samples → one window; +120 → 180 buffered → two more.
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 2);
    assert!((first[0].time - 0.06).abs() < 1e-9);
    assert!((second[0].time - 0.12).abs() < 1e-9);
    assert!((second[1].time - 0.18).abs() < 1e-9);
    assert_eq!(control.calls(), 3);
    assert!(
        elapsed >= INFER_DELAY * 3,
        "inferences overlapped: {elapsed:?}"
    );

    let latest = shared.current_result().await;
    assert!((latest.time - 0.18).abs() < 1e-9);
}

#[tokio::test]
async fn lock_is_released_after_engine_failure() {
    let (shared, control) = delayed_pipeline();
    control.fail_next(1);

    let failed = shared.process_audio_chunk(vec![0.1; 120]).await.unwrap();
    assert!(failed.results.is_empty());
    assert!(matches!(failed.error, Some(FacecastError::Inference(_))));

    // The failed window was consumed; 60 + 60 completes the next one.
    let ok = tokio::time::timeout(
        Duration::from_secs(2),
        shared.process_audio_chunk(vec![0.1; 60]),
    )
    .await
    .expect("pipeline stayed locked after a failure")
    .unwrap()
    .results;
    assert_eq!(ok.len(), 1);
    assert!((ok[0].time - 0.12).abs() < 1e-9);

    let diag = shared.with(|p| p.diagnostics().snapshot()).await;
    assert_eq!(diag.inference_errors, 1);
    assert_eq!(diag.windows_inferred, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_engine_first_frame_latency_under_500ms() {
    let config = small_config();
    let stub = StubEngine::new(config.layout.total()).with_delay(Duration::from_millis(20));
    let pipeline = FacePipeline::with_model(config, EngineHandle::new(stub)).unwrap();
    let engine = FaceEngine::new(EngineConfig::default(), SharedPipeline::new(pipeline));

    let mut frames = engine.subscribe_frames();
    let mut status = engine.subscribe_status();
    let mut sink = engine.start().await.unwrap();
    assert_eq!(status.recv().await.unwrap().status, EngineStatus::Running);

    let start = Instant::now();
    sink.push(&[0.3; 120]);
    let first = recv_frame_with_timeout(&mut frames, Duration::from_secs(2)).await;
    let elapsed = start.elapsed();

    assert_eq!(first.seq, 0);
    assert!((first.result.time - 0.06).abs() < 1e-9);
    assert!(
        elapsed < Duration::from_millis(500),
        "first frame too slow: {elapsed:?} (target < 500ms)"
    );

    engine.stop().unwrap();
    assert_eq!(status.recv().await.unwrap().status, EngineStatus::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_engine_reports_errors_and_recovers() {
    let config = small_config();
    let stub = StubEngine::new(config.layout.total());
    let control = stub.control();
    let pipeline = FacePipeline::with_model(config, EngineHandle::new(stub)).unwrap();
    let engine = FaceEngine::new(EngineConfig::default(), SharedPipeline::new(pipeline));

    let mut frames = engine.subscribe_frames();
    let mut status = engine.subscribe_status();
    let mut sink = engine.start().await.unwrap();
    assert_eq!(status.recv().await.unwrap().status, EngineStatus::Running);

    control.fail_next(1);
    sink.push(&[0.3; 120]);
    let failed = tokio::time::timeout(Duration::from_secs(2), status.recv())
        .await
        .expect("error status within timeout")
        .unwrap();
    assert_eq!(failed.status, EngineStatus::Error);
    assert!(failed.detail.is_some());

    sink.push(&[0.3; 60]);
    let frame = recv_frame_with_timeout(&mut frames, Duration::from_secs(2)).await;
    assert!((frame.result.time - 0.12).abs() < 1e-9);
    let recovered = tokio::time::timeout(Duration::from_secs(2), status.recv())
        .await
        .expect("running status within timeout")
        .unwrap();
    assert_eq!(recovered.status, EngineStatus::Running);

    engine.stop().unwrap();
}
