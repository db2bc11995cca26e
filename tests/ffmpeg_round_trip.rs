//! Full sessions through the FFmpeg backend, read back with ffprobe.
//! Skipped when ffmpeg or ffprobe is not installed.

use open_screenrecorder::capture::synthetic::SyntheticCatalog;
use open_screenrecorder::config::{
    AudioQuality, PipelineTuning, QualityPreset, ScreenSelector, StartRequest, VideoQuality,
};
use open_screenrecorder::encoder::{ensure_ffmpeg, probe_media, FfmpegEncoderFactory};
use open_screenrecorder::RecordingController;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

fn tools_available() -> bool {
    let ffprobe = Command::new("ffprobe")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    ensure_ffmpeg(Path::new("ffmpeg")).is_ok() && ffprobe
}

fn secs(d: Option<Duration>) -> f64 {
    d.map(|d| d.as_secs_f64()).unwrap_or(f64::NAN)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn medium_preset_file_has_matching_track_durations() {
    if !tools_available() {
        eprintln!("ffmpeg/ffprobe not found, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("session.mp4");
    let controller = RecordingController::new(
        Arc::new(SyntheticCatalog::standard()),
        Arc::new(FfmpegEncoderFactory::new()),
        PipelineTuning::default(),
    );

    let mut request = StartRequest::new(
        ScreenSelector::Display {
            id: "synthetic-0".into(),
        },
        output.clone(),
    );
    request.preset = QualityPreset::new(VideoQuality::Medium, AudioQuality::Medium);
    request.audio_devices = vec!["synthetic-mic".into()];

    controller.start(request).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    let summary = controller.stop().await.unwrap();
    let elapsed = controller.elapsed().as_secs_f64();

    assert!(output.exists());
    assert!(summary.bytes_written > 0);
    let names: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["session.mp4".to_string()]);

    let meta = probe_media(&output).unwrap();
    let video = meta.video.unwrap();
    let audio = meta.audio.unwrap();
    assert_eq!((video.width, video.height), (1920, 1080));
    assert_eq!(video.codec, "h264");
    assert_eq!(audio.codec, "aac");
    assert_eq!(audio.sample_rate, 44100);
    assert_eq!(audio.channels, 2);

    let frame = 1.0 / 30.0;
    // AAC frames are 1024 samples; the encoder adds one frame of priming
    let block = 2.0 * 1024.0 / 44100.0;
    let video_secs = secs(video.duration);
    let audio_secs = secs(audio.duration);
    assert!(
        (video_secs - elapsed).abs() <= frame + 1e-3,
        "video {} vs {}",
        video_secs,
        elapsed
    );
    assert!(
        (audio_secs - elapsed).abs() <= block + 1e-3,
        "audio {} vs {}",
        audio_secs,
        elapsed
    );
}
