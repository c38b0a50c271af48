//! # avsource headless player
//!
//! Plays a synthetic clip through a `Source` the way an audio-clocked player
//! would: pull audio chunks, ask for a picture whenever a chunk says a frame
//! is due, and print what happened as JSON.

use anyhow::Result;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use avsource_core::memory::{MemoryBackend, SyntheticClip};
use avsource_core::{InitializedBackend, LogLevel, Source, SourceConfig, SourceStats};

const LOCATOR: &str = "synthetic://pattern";

/// Capabilities listed in the report when the backend has them
const FEATURES: &[&str] = &["audio", "video", "seek", "subtitles", "network"];

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;

    let default_filter = if options.verbose {
        "avsource=debug"
    } else {
        "avsource=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    tracing::info!("avsource player v{}", avsource_core::VERSION);

    let report = run(&options)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// ============================================================================
// Options
// ============================================================================

struct PlayerOptions {
    clip: SyntheticClip,
    seek: Option<f64>,
    realtime: bool,
    verbose: bool,
    config: Option<PathBuf>,
    log_level: Option<LogLevel>,
}

fn parse_args(args: &[String]) -> Result<PlayerOptions> {
    let mut options = PlayerOptions {
        clip: SyntheticClip::default(),
        seek: None,
        realtime: false,
        verbose: false,
        config: None,
        log_level: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--duration" | "-d" => {
                options.clip.duration = parse_value(args, i, "--duration")?;
                i += 2;
            }
            "--fps" => {
                options.clip.fps = parse_value(args, i, "--fps")?;
                i += 2;
            }
            "--seek" | "-s" => {
                options.seek = Some(parse_value(args, i, "--seek")?);
                i += 2;
            }
            "--config" | "-c" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow::anyhow!("Missing value for --config"))?;
                options.config = Some(PathBuf::from(value));
                i += 2;
            }
            "--log-level" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow::anyhow!("Missing value for --log-level"))?;
                let level = serde_json::from_value(serde_json::Value::String(value.clone()))
                    .map_err(|_| anyhow::anyhow!("Unknown backend log level {:?}", value))?;
                options.log_level = Some(level);
                i += 2;
            }
            "--realtime" => {
                options.realtime = true;
                i += 1;
            }
            "--verbose" | "-v" => {
                options.verbose = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                print_usage();
                return Err(anyhow::anyhow!("Unknown argument {:?}", other));
            }
        }
    }

    Ok(options)
}

fn parse_value(args: &[String], i: usize, flag: &str) -> Result<f64> {
    let value = args
        .get(i + 1)
        .ok_or_else(|| anyhow::anyhow!("Missing value for {}", flag))?;
    value
        .parse::<f64>()
        .map_err(|e| anyhow::anyhow!("Invalid value {} for {}: {}", value, flag, e))
}

fn print_usage() {
    eprintln!(
        "\nUsage:\n  avsource [--duration <secs>] [--fps <n>] [--seek <secs>] [--config <file.json>]\n           [--log-level <quiet|error|warning|info|debug>] [--realtime] [--verbose]\n"
    );
}

fn load_config(options: &PlayerOptions) -> Result<SourceConfig> {
    let mut config = match &options.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("Cannot read config {:?}: {}", path, e))?;
            serde_json::from_str(&text)
                .map_err(|e| anyhow::anyhow!("Invalid config {:?}: {}", path, e))?
        }
        None => SourceConfig::default(),
    };
    if let Some(level) = options.log_level {
        config.backend_log_level = level;
    }
    Ok(config)
}

// ============================================================================
// Playback
// ============================================================================

#[derive(Debug, Serialize)]
struct PlaybackReport {
    locator: String,
    backend: String,
    backend_features: Vec<String>,
    duration: f64,
    video: Option<(u32, u32)>,
    audio_chunks: u64,
    audio_seconds: f64,
    first_chunk_at: Option<f64>,
    frames_requested: u64,
    frames_shown: u64,
    last_frame_at: Option<f64>,
    wall_ms: u128,
    stats: SourceStats,
}

fn run(options: &PlayerOptions) -> Result<PlaybackReport> {
    let config = load_config(options)?;

    let memory = Arc::new(MemoryBackend::new());
    memory.insert(LOCATOR, options.clip.build());
    let backend = InitializedBackend::new(memory, config.backend_log_level)?;
    let backend_features: Vec<String> = FEATURES
        .iter()
        .filter(|feature| backend.backend().has_feature(feature))
        .map(|feature| feature.to_string())
        .collect();
    tracing::debug!("Backend {} features: {:?}", backend.backend().name(), backend_features);

    let mut source = Source::open(&backend, LOCATOR, config)?;
    tracing::info!(
        "Playing {:?}: {:.2}s, video {:?}, audio {:?}",
        source.locator(),
        source.duration(),
        source.video_format(),
        source.audio_format()
    );

    if let Some(target) = options.seek {
        source.seek(target)?;
    }

    let started = Instant::now();
    let mut report = PlaybackReport {
        locator: source.locator().to_string(),
        backend: backend.backend().name().to_string(),
        backend_features,
        duration: source.duration(),
        video: source.video_format().map(|f| (f.width, f.height)),
        audio_chunks: 0,
        audio_seconds: 0.0,
        first_chunk_at: None,
        frames_requested: 0,
        frames_shown: 0,
        last_frame_at: None,
        wall_ms: 0,
        stats: source.stats(),
    };

    while let Some(chunk) = source.next_audio_chunk() {
        report.audio_chunks += 1;
        report.audio_seconds += chunk.duration;
        if report.first_chunk_at.is_none() {
            report.first_chunk_at = Some(chunk.timestamp);
        }

        for event in &chunk.events {
            report.frames_requested += 1;
            if let Some(image) = source.frame_at(event.timestamp) {
                report.frames_shown += 1;
                report.last_frame_at = Some(event.timestamp);
                tracing::trace!("Frame for {:.3}s: {} bytes", event.timestamp, image.data.len());
            }
        }

        if options.realtime {
            thread::sleep(Duration::from_secs_f64(chunk.duration));
        }
    }

    report.wall_ms = started.elapsed().as_millis();
    report.stats = source.stats();
    source.close();

    tracing::info!(
        "Playback complete: {} chunks, {}/{} frames shown",
        report.audio_chunks,
        report.frames_shown,
        report.frames_requested
    );

    Ok(report)
}
