//! Headless recorder
//!
//! Drives the pipeline from the command line: list devices, record until a
//! duration elapses or Ctrl-C, and probe finished files.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use open_screenrecorder::capture::traits::DeviceCatalog;
use open_screenrecorder::capture::SyntheticCatalog;
use open_screenrecorder::config::request::default_output_path;
use open_screenrecorder::config::{
    AudioQuality, Container, PipelineTuning, QualityPreset, ScreenSelector, StartRequest,
    VideoQuality,
};
use open_screenrecorder::encoder::{
    probe_media, EncoderFactory, FfmpegEncoderFactory, MemoryEncoderFactory,
};
use open_screenrecorder::{RecordingController, RecordingEvent};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

/// Screen, webcam and audio recorder
#[derive(Parser, Debug)]
#[command(name = "screenrecorder")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List displays, audio devices and cameras
    Devices {
        /// Use the synthetic test devices
        #[arg(long)]
        synthetic: bool,
    },
    /// Record until the duration elapses or Ctrl-C
    Record(RecordArgs),
    /// Show the streams of a recorded file
    Probe {
        path: PathBuf,
    },
}

#[derive(Parser, Debug, Clone)]
struct RecordArgs {
    /// Output file; the extension picks the container (mp4, mov, mkv)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Display ID (use 'screenrecorder devices' to find)
    #[arg(long)]
    display: Option<String>,

    /// Audio device ID, repeat to bind several
    #[arg(long = "audio")]
    audio: Vec<String>,

    /// Webcam device ID for the overlay
    #[arg(long)]
    webcam: Option<String>,

    #[arg(long, value_enum, default_value_t = VideoQuality::Medium)]
    video_quality: VideoQuality,

    #[arg(long, value_enum, default_value_t = AudioQuality::Medium)]
    audio_quality: AudioQuality,

    /// Output frame rate, overriding the video tier
    #[arg(long)]
    fps: Option<u32>,

    /// Gain applied to the mixed audio track
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    gain_db: f32,

    /// Auto-stop after duration (seconds)
    #[arg(short, long)]
    duration: Option<f64>,

    /// Use the synthetic test devices
    #[arg(long)]
    synthetic: bool,

    /// Record into memory instead of running FFmpeg
    #[arg(long)]
    dry_run: bool,

    /// Pipeline tuning JSON file
    #[arg(long)]
    tuning: Option<PathBuf>,

    /// Start request JSON file; replaces the device and quality flags
    #[arg(long)]
    request: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    open_screenrecorder::init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Devices { synthetic } => list_devices(catalog(synthetic)?.as_ref()),
        Commands::Record(args) => record(args).await,
        Commands::Probe { path } => {
            let metadata = probe_media(&path)?;
            println!("{}", serde_json::to_string_pretty(&metadata)?);
            Ok(())
        }
    }
}

fn catalog(synthetic: bool) -> Result<Arc<dyn DeviceCatalog>> {
    if synthetic {
        return Ok(Arc::new(SyntheticCatalog::standard()));
    }
    #[cfg(feature = "native")]
    {
        Ok(Arc::new(open_screenrecorder::capture::native::NativeCatalog::new()))
    }
    #[cfg(not(feature = "native"))]
    {
        bail!("built without the `native` feature; pass --synthetic")
    }
}

fn list_devices(catalog: &dyn DeviceCatalog) -> Result<()> {
    let cameras: Vec<_> = catalog
        .cameras()
        .into_iter()
        .map(|camera| {
            let modes = catalog.camera_capabilities(&camera.id).unwrap_or_default();
            serde_json::json!({ "camera": camera, "capabilities": modes })
        })
        .collect();
    let listing = serde_json::json!({
        "displays": catalog.displays(),
        "audioDevices": catalog.audio_devices(),
        "cameras": cameras,
    });
    println!("{}", serde_json::to_string_pretty(&listing)?);
    Ok(())
}

fn build_request(args: &RecordArgs, catalog: &dyn DeviceCatalog) -> Result<StartRequest> {
    if let Some(path) = &args.request {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        return serde_json::from_str(&json).with_context(|| format!("parsing {}", path.display()));
    }

    let display = match &args.display {
        Some(id) => id.clone(),
        None => match catalog.displays().into_iter().find(|d| d.is_primary) {
            Some(display) => display.id,
            None => bail!("no display found"),
        },
    };
    let output = match &args.output {
        Some(path) => path.clone(),
        None => {
            let path = default_output_path(Container::Mp4).context("no default output directory")?;
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            path
        }
    };

    let mut request = StartRequest::new(ScreenSelector::Display { id: display }, output);
    request.audio_devices = args.audio.clone();
    request.webcam = args.webcam.clone();
    request.preset = QualityPreset::new(args.video_quality, args.audio_quality);
    request.frame_rate = args.fps;
    request.audio_gain_db = args.gain_db;
    Ok(request)
}

/// Log the status feed until it closes. Returns how many events were seen.
async fn print_status(mut events: broadcast::Receiver<RecordingEvent>) -> usize {
    let mut seen = 0;
    loop {
        match events.recv().await {
            Ok(event) => {
                seen += 1;
                log_event(event);
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::debug!("Status printer skipped {} events", missed)
            }
            Err(RecvError::Closed) => return seen,
        }
    }
}

fn log_event(event: RecordingEvent) {
    match event {
        RecordingEvent::Progress { elapsed_ms, .. } => {
            tracing::debug!("Recorded {:.1}s", elapsed_ms / 1000.0)
        }
        RecordingEvent::SourceDegraded { source, reason } => {
            tracing::warn!("{} degraded: {}", source, reason)
        }
        RecordingEvent::Failed { reason } => tracing::error!("Recording failed: {}", reason),
        other => tracing::info!("{:?}", other),
    }
}

async fn record(args: RecordArgs) -> Result<()> {
    let catalog = catalog(args.synthetic)?;
    let tuning = match &args.tuning {
        Some(path) => PipelineTuning::load(path)?,
        None => PipelineTuning::default(),
    };
    let encoders: Arc<dyn EncoderFactory> = if args.dry_run {
        Arc::new(MemoryEncoderFactory::new())
    } else {
        Arc::new(FfmpegEncoderFactory::new())
    };
    let request = build_request(&args, catalog.as_ref())?;

    let controller = RecordingController::new(catalog, encoders, tuning);
    tokio::spawn(print_status(controller.subscribe()));

    let session = controller.start(request).await?;
    tracing::info!("Recording to {}", session.output_path.display());

    let duration = args.duration.map(Duration::from_secs_f64);
    tokio::select! {
        _ = async {
            match duration {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        } => {}
        result = tokio::signal::ctrl_c() => result?,
    }

    let summary = controller.stop().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
