//! `facecast`: convert speech WAV files into AFAN blendshape animations.
//!
//! ```text
//! facecast convert <in.wav> <out.afan> [--fps N] [--model-dir DIR]
//!                  [--version 1|2] [--emotion name=value]... [--summary]
//! facecast inspect <file.afan> [--json] [--at SECONDS]
//! ```

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use facecast_core::afan::{self, AfanAnimation, AfanVersion};
use facecast_core::audio::{downmix_interleaved, pcm16_to_f32};
use facecast_core::config::{model_dir, OutputLayout, MODEL_FILE};
use facecast_core::engine::{FacePipeline, SharedPipeline};
use facecast_core::face::{aggregate_results, interpolate_to_frame_rate};
use facecast_core::inference::{EngineHandle, OnnxEngine, StubEngine};
use serde::Serialize;
use tracing::{info, warn};

const USAGE: &str = "\
Usage:
  facecast convert <in.wav> <out.afan> [--fps <n>] [--model-dir <dir>]
                   [--version 1|2] [--emotion <name>=<value>]... [--summary]
  facecast inspect <file.afan> [--json] [--at <seconds>]";

#[derive(Debug)]
struct ConvertArgs {
    input: PathBuf,
    output: PathBuf,
    fps: u8,
    model_dir: PathBuf,
    version: AfanVersion,
    emotions: Vec<(String, f32)>,
    summary: bool,
}

#[derive(Debug)]
struct InspectArgs {
    input: PathBuf,
    json: bool,
    at: Option<f64>,
}

#[derive(Debug)]
enum Command {
    Convert(ConvertArgs),
    Inspect(InspectArgs),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InspectReport<'a> {
    fps: u8,
    channels: usize,
    frames: usize,
    duration_secs: f64,
    channel_names: &'a [String],
    /// Mean weight per channel across all frames.
    mean_weights: Vec<f32>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("facecast=info")),
        )
        .init();

    let outcome = match parse_args(std::env::args().skip(1)) {
        Ok(Command::Convert(args)) => convert(args).await,
        Ok(Command::Inspect(args)) => inspect(&args),
        Err(e) => Err(e),
    };
    if let Err(e) = outcome {
        eprintln!("facecast failed: {e:#}");
        std::process::exit(1);
    }
}

fn parse_args(args: impl Iterator<Item = String>) -> Result<Command> {
    let mut it = args.peekable();
    let Some(sub) = it.next() else {
        bail!("missing subcommand\n{USAGE}");
    };

    let mut positional = Vec::new();
    let mut fps: u8 = 30;
    let mut model_dir_arg: Option<PathBuf> = None;
    let mut version = AfanVersion::V2;
    let mut emotions = Vec::new();
    let mut summary = false;
    let mut json = false;
    let mut at = None;

    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--fps" => {
                let v = it.next().ok_or_else(|| anyhow!("missing value for --fps"))?;
                fps = v
                    .parse::<u8>()
                    .ok()
                    .filter(|f| *f > 0)
                    .ok_or_else(|| anyhow!("invalid value for --fps: {v}"))?;
            }
            "--model-dir" => {
                let v = it
                    .next()
                    .ok_or_else(|| anyhow!("missing value for --model-dir"))?;
                model_dir_arg = Some(PathBuf::from(v));
            }
            "--version" => {
                let v = it
                    .next()
                    .ok_or_else(|| anyhow!("missing value for --version"))?;
                version = match v.as_str() {
                    "1" => AfanVersion::V1,
                    "2" => AfanVersion::V2,
                    other => bail!("invalid value for --version: {other}"),
                };
            }
            "--emotion" => {
                let v = it
                    .next()
                    .ok_or_else(|| anyhow!("missing value for --emotion"))?;
                let (name, value) = v
                    .split_once('=')
                    .ok_or_else(|| anyhow!("--emotion expects <name>=<value>, got {v}"))?;
                let value = value
                    .parse::<f32>()
                    .with_context(|| format!("invalid emotion value in {v}"))?;
                emotions.push((name.to_owned(), value));
            }
            "--summary" => summary = true,
            "--json" => json = true,
            "--at" => {
                let v = it.next().ok_or_else(|| anyhow!("missing value for --at"))?;
                at = Some(
                    v.parse::<f64>()
                        .with_context(|| format!("invalid value for --at: {v}"))?,
                );
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            other if other.starts_with("--") => bail!("unknown argument: {other}"),
            _ => positional.push(PathBuf::from(arg)),
        }
    }

    match (sub.as_str(), positional.as_slice()) {
        ("convert", [input, output]) => Ok(Command::Convert(ConvertArgs {
            input: input.clone(),
            output: output.clone(),
            fps,
            model_dir: model_dir_arg.unwrap_or_else(model_dir),
            version,
            emotions,
            summary,
        })),
        ("inspect", [input]) => Ok(Command::Inspect(InspectArgs {
            input: input.clone(),
            json,
            at,
        })),
        ("convert" | "inspect", _) => bail!("wrong number of paths for {sub}\n{USAGE}"),
        (other, _) => bail!("unknown subcommand: {other}\n{USAGE}"),
    }
}

fn read_wav_mono_f32(path: &Path) -> Result<(Vec<f32>, u32)> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int if spec.bits_per_sample == 16 => {
            let pcm = reader.samples::<i16>().collect::<Result<Vec<_>, _>>()?;
            pcm16_to_f32(&pcm)
        }
        hound::SampleFormat::Int => {
            // Full scale follows the declared width so -2^(bits-1) maps to -1.0.
            let scale = (1_i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    Ok((downmix_interleaved(&interleaved, channels), spec.sample_rate))
}

fn load_engine(dir: &Path) -> Result<EngineHandle> {
    let model_path = dir.join(MODEL_FILE);
    if model_path.exists() {
        info!(path = ?model_path, "loading ONNX model");
        Ok(EngineHandle::new(OnnxEngine::load(&model_path)?))
    } else {
        warn!(
            path = ?model_path,
            "model file not found, using the deterministic stub engine"
        );
        Ok(EngineHandle::new(StubEngine::new(OutputLayout::default().total())))
    }
}

async fn convert(args: ConvertArgs) -> Result<()> {
    let (samples, sample_rate) = read_wav_mono_f32(&args.input)?;
    info!(
        input = %args.input.display(),
        samples = samples.len(),
        sample_rate,
        "audio loaded"
    );
    if sample_rate == 0 {
        bail!("{} reports a zero sample rate", args.input.display());
    }
    let duration = samples.len() as f64 / f64::from(sample_rate);

    let engine = load_engine(&args.model_dir)?;
    let mut pipeline = FacePipeline::from_model_dir(&args.model_dir, engine)?;
    pipeline.set_emotions(args.emotions.iter().map(|(n, v)| (n.as_str(), *v)))?;
    let shared = SharedPipeline::new(pipeline);

    let started = Instant::now();
    let results = shared.process_utterance(samples, sample_rate).await?;
    let frames = interpolate_to_frame_rate(&results, f64::from(args.fps), duration);
    info!(
        windows = results.len(),
        frames = frames.len(),
        elapsed_ms = started.elapsed().as_secs_f64() * 1000.0,
        "inference complete"
    );

    let animation = AfanAnimation::from_frames(args.fps, &frames);
    let bytes = animation.encode(args.version)?;
    std::fs::write(&args.output, &bytes)
        .with_context(|| format!("writing {}", args.output.display()))?;
    println!(
        "{} → {} ({} frames @ {} fps, {} bytes)",
        args.input.display(),
        args.output.display(),
        frames.len(),
        args.fps,
        bytes.len()
    );

    if args.summary {
        let aggregate = aggregate_results(&results);
        println!("{}", serde_json::to_string_pretty(&aggregate)?);
    }
    Ok(())
}

fn inspect(args: &InspectArgs) -> Result<()> {
    let bytes =
        std::fs::read(&args.input).with_context(|| format!("reading {}", args.input.display()))?;
    let animation = afan::decode(&bytes)?;

    if let Some(time) = args.at {
        let index = animation.frame_index_at(time);
        let frame = animation
            .frame_at_time(time)
            .ok_or_else(|| anyhow!("{} has no frames", args.input.display()))?;
        println!("frame {index} @ {time:.3}s");
        for (name, w) in animation.channel_names.iter().zip(frame) {
            if *w > 0.0 {
                println!("  {name:<20} {w:.3}");
            }
        }
        return Ok(());
    }

    let channels = animation.channel_count();
    let mut mean_weights = vec![0f32; channels];
    for frame in &animation.frames {
        for (m, w) in mean_weights.iter_mut().zip(frame) {
            *m += w;
        }
    }
    let n = animation.frame_count().max(1) as f32;
    mean_weights.iter_mut().for_each(|m| *m /= n);

    let report = InspectReport {
        fps: animation.fps,
        channels,
        frames: animation.frame_count(),
        duration_secs: animation.duration_secs(),
        channel_names: &animation.channel_names,
        mean_weights,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "{}: {} frames, {} channels @ {} fps ({:.2}s)",
        args.input.display(),
        report.frames,
        report.channels,
        report.fps,
        report.duration_secs
    );
    let mut ranked: Vec<_> = report
        .channel_names
        .iter()
        .zip(&report.mean_weights)
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(a.1));
    for (name, mean) in ranked.into_iter().take(8) {
        println!("  {name:<20} mean {mean:.3}");
    }
    Ok(())
}
