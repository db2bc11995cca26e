//! End-to-end sessions against synthetic devices and the in-memory encoder.

use open_screenrecorder::capture::source::{SourceId, SourceKind};
use open_screenrecorder::capture::synthetic::{
    Fault, SyntheticAudio, SyntheticCamera, SyntheticCatalog, SyntheticDisplay,
};
use open_screenrecorder::config::{
    AudioQuality, PipelineTuning, QualityPreset, ScreenSelector, StartRequest, VideoQuality,
};
use open_screenrecorder::encoder::MemoryEncoderFactory;
use open_screenrecorder::utils::error::{ConfigError, FinalizeError};
use open_screenrecorder::{RecordingController, RecordingEvent, RecordingState};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

fn controller(catalog: SyntheticCatalog, encoders: &MemoryEncoderFactory) -> RecordingController {
    RecordingController::new(
        Arc::new(catalog),
        Arc::new(encoders.clone()),
        PipelineTuning::default(),
    )
}

/// Low tier at 10 fps keeps debug builds comfortably real-time
fn light_request(dir: &Path) -> StartRequest {
    let mut request = StartRequest::new(
        ScreenSelector::Display {
            id: "synthetic-0".into(),
        },
        dir.join("session.mkv"),
    );
    request.preset = QualityPreset::new(VideoQuality::Low, AudioQuality::Low);
    request.frame_rate = Some(10);
    request.audio_devices = vec!["synthetic-mic".into()];
    request
}

fn small_display() -> SyntheticDisplay {
    SyntheticDisplay::new("synthetic-0", 640, 360)
}

fn collect(events: &mut broadcast::Receiver<RecordingEvent>) -> Vec<RecordingEvent> {
    let mut seen = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => seen.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return seen,
        }
    }
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn elapsed_time_excludes_pauses() {
    let dir = tempfile::tempdir().unwrap();
    let encoders = MemoryEncoderFactory::new();
    let controller = controller(
        SyntheticCatalog::standard().with_display(small_display()),
        &encoders,
    );

    let a0 = Instant::now();
    controller.start(light_request(dir.path())).await.unwrap();
    let a1 = Instant::now();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let p0 = Instant::now();
    controller.pause().await.unwrap();
    let p1 = Instant::now();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let frozen = controller.elapsed();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(controller.elapsed(), frozen);

    let r0 = Instant::now();
    controller.resume().await.unwrap();
    let r1 = Instant::now();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let s0 = Instant::now();
    let summary = controller.stop().await.unwrap();
    let s1 = Instant::now();
    let elapsed = controller.elapsed();

    // One output tick at 10 fps
    let tick = Duration::from_millis(100);
    let lower = (p0 - a1) + (s0 - r1);
    let upper = (p1 - a0) + (s1 - r0);
    assert!(elapsed + tick >= lower, "{:?} < {:?}", elapsed, lower);
    assert!(elapsed <= upper + tick, "{:?} > {:?}", elapsed, upper);

    let paused = Duration::from_secs_f64(summary.paused_ms / 1000.0);
    assert!(paused + tick >= r0 - p1);
    assert!(paused <= (r1 - p0) + tick);

    // The video track covers exactly the recorded time
    assert!((summary.video_duration_ms - ms(elapsed)).abs() <= 100.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn medium_preset_round_trip_durations() {
    let dir = tempfile::tempdir().unwrap();
    let encoders = MemoryEncoderFactory::new();
    let controller = controller(SyntheticCatalog::standard(), &encoders);

    let mut request = light_request(dir.path());
    request.preset = QualityPreset::new(VideoQuality::Medium, AudioQuality::Medium);
    request.frame_rate = None;
    request.audio_devices = vec!["synthetic-mic".into(), "synthetic-loopback".into()];

    let handle = controller.start(request).await.unwrap();
    assert_eq!((handle.preset.width, handle.preset.height), (1920, 1080));
    assert_eq!(handle.preset.frame_rate, 30);
    assert_eq!(handle.preset.sample_rate, 44100);
    assert_eq!(handle.preset.audio_codec.ffmpeg_name(), "aac");

    let n = Duration::from_millis(1000);
    tokio::time::sleep(n).await;
    let summary = controller.stop().await.unwrap();
    let elapsed = controller.elapsed();

    let frame = 1000.0 / 30.0;
    let block = 1000.0 * 1024.0 / 44100.0;
    assert!((summary.video_duration_ms - ms(elapsed)).abs() <= frame);
    assert!((summary.audio_duration_ms - ms(elapsed)).abs() <= block);
    // Start and stop overheads stay well under a few frames
    assert!((ms(elapsed) - ms(n)).abs() < 250.0, "elapsed {:?}", elapsed);

    let recording = encoders.last_recording().unwrap();
    assert_eq!(recording.video_frames(), summary.video_frames);
    assert_eq!(recording.audio_frames, summary.audio_frames);
    assert!(recording.audio_peak > 0.0);
    // Per-stream timestamps never go backwards
    assert!(recording.video_timestamps.windows(2).all(|w| w[0] < w[1]));
    assert!(recording.audio_timestamps.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_twice_returns_the_same_summary() {
    let dir = tempfile::tempdir().unwrap();
    let encoders = MemoryEncoderFactory::new();
    let controller = controller(
        SyntheticCatalog::standard().with_display(small_display()),
        &encoders,
    );

    controller.start(light_request(dir.path())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let first = controller.stop().await.unwrap();
    let mut events = controller.subscribe();
    let second = controller.stop().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(controller.state(), RecordingState::Idle);
    // Nothing was re-finalized
    assert!(collect(&mut events).is_empty());
    assert_eq!(encoders.recordings().len(), 1);
    assert!(encoders.last_recording().unwrap().finalized);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn denied_microphone_degrades_once_and_records_silence() {
    let dir = tempfile::tempdir().unwrap();
    let mut mic = SyntheticAudio::new("synthetic-mic", 48000, 1);
    mic.fault = Fault::permission_denied("microphone");
    let catalog = SyntheticCatalog::standard()
        .with_display(small_display())
        .with_audio(mic);
    let encoders = MemoryEncoderFactory::new();
    let controller = controller(catalog, &encoders);
    let mut events = controller.subscribe();

    controller.start(light_request(dir.path())).await.unwrap();
    assert_eq!(controller.state(), RecordingState::Recording);
    tokio::time::sleep(Duration::from_millis(400)).await;
    let summary = controller.stop().await.unwrap();

    let mic_id = SourceId::new(SourceKind::Audio, "synthetic-mic");
    let events = collect(&mut events);
    let degraded: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            RecordingEvent::SourceDegraded { source, .. } => Some(source.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(degraded, vec![mic_id.clone()]);
    assert!(events.contains(&RecordingEvent::StateChanged {
        from: RecordingState::Starting,
        to: RecordingState::Recording,
    }));

    assert_eq!(summary.degraded_sources, vec![mic_id]);
    assert!(summary.video_frames > 0);
    assert!(summary.audio_frames > 0);
    let recording = encoders.last_recording().unwrap();
    assert_eq!(recording.audio_peak, 0.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unplugged_webcam_freezes_on_last_frame() {
    let dir = tempfile::tempdir().unwrap();
    let mut camera = SyntheticCamera::new("synthetic-cam", 320, 240, 30);
    let (fault, unplug) = Fault::switch();
    camera.fault = fault;
    let catalog = SyntheticCatalog::standard()
        .with_display(small_display())
        .with_camera(camera);

    // Low tier renders 1280x720. The default layout puts a 256x192 overlay
    // at (1004, 508); sample its centre and the screen's marker row.
    let webcam_point = (1132, 604);
    let mut points = vec![webcam_point];
    points.extend((0..40).map(|i| (i * 32, 10)));
    let encoders = MemoryEncoderFactory::new().with_probe_points(points);
    let controller = controller(catalog, &encoders);
    let mut events = controller.subscribe();

    let mut request = light_request(dir.path());
    request.webcam = Some("synthetic-cam".into());
    controller.start(request).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    unplug.store(true, Ordering::SeqCst);
    let unplugged_at = controller.elapsed();
    tokio::time::sleep(Duration::from_millis(1000)).await;
    let summary = controller.stop().await.unwrap();
    let elapsed = controller.elapsed();

    let cam_id = SourceId::new(SourceKind::Webcam, "synthetic-cam");
    assert!(collect(&mut events).iter().any(
        |e| matches!(e, RecordingEvent::SourceDegraded { source, .. } if *source == cam_id)
    ));
    assert_eq!(summary.degraded_sources, vec![cam_id]);

    // No gap in the video track
    assert!((summary.video_duration_ms - ms(elapsed)).abs() <= 100.0);

    let recording = encoders.last_recording().unwrap();
    let settle = unplugged_at + Duration::from_millis(300);
    let after: Vec<&Vec<[u8; 4]>> = recording
        .video_timestamps
        .iter()
        .zip(&recording.pixel_samples)
        .filter(|(ts, _)| **ts >= settle)
        .map(|(_, samples)| samples)
        .collect();
    assert!(after.len() >= 3, "only {} frames after unplug", after.len());

    // Webcam layer is frozen on a real camera frame
    let frozen = after[0][0];
    assert!(after.iter().all(|s| s[0] == frozen));
    assert_ne!(frozen, [0, 0, 0, 0]);
    // The screen underneath keeps moving
    assert!(after.windows(2).any(|w| w[0][1..] != w[1][1..]));

    // Before the unplug the bars were still cycling
    let before: Vec<[u8; 4]> = recording
        .video_timestamps
        .iter()
        .zip(&recording.pixel_samples)
        .filter(|(ts, _)| **ts < unplugged_at)
        .map(|(_, samples)| samples[0])
        .collect();
    assert!(before.windows(2).any(|w| w[0] != w[1]));
}

#[tokio::test]
async fn illegal_commands_leave_state_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let encoders = MemoryEncoderFactory::new();
    let controller = controller(SyntheticCatalog::standard(), &encoders);

    assert!(controller.pause().await.is_err());
    assert!(controller.resume().await.is_err());
    assert_eq!(controller.stop().await, Err(FinalizeError::NotActive));
    assert_eq!(controller.state(), RecordingState::Idle);

    let mut request = light_request(dir.path());
    request.audio_devices.push("no-such-device".into());
    assert!(matches!(
        controller.start(request).await,
        Err(ConfigError::DeviceNotFound(_))
    ));
    assert_eq!(controller.state(), RecordingState::Idle);
    assert!(encoders.recordings().is_empty());
    assert!(!dir.path().join("session.mkv").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn only_source_failing_rejects_the_start() {
    let dir = tempfile::tempdir().unwrap();
    let mut display = small_display();
    display.fault = Fault::permission_denied("screen recording");
    let catalog = SyntheticCatalog::standard().with_display(display);
    let encoders = MemoryEncoderFactory::new();
    let controller = controller(catalog, &encoders);

    let mut request = light_request(dir.path());
    request.audio_devices.clear();
    assert!(matches!(
        controller.start(request).await,
        Err(ConfigError::NoUsableSources(_))
    ));
    assert_eq!(controller.state(), RecordingState::Idle);
    assert!(encoders.recordings().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn progress_reports_elapsed_time() {
    let dir = tempfile::tempdir().unwrap();
    let encoders = MemoryEncoderFactory::new();
    let tuning = PipelineTuning {
        progress_interval_ms: 50,
        ..Default::default()
    };
    let controller = RecordingController::new(
        Arc::new(SyntheticCatalog::standard().with_display(small_display())),
        Arc::new(encoders),
        tuning,
    );
    let mut events = controller.subscribe();

    controller.start(light_request(dir.path())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    controller.stop().await.unwrap();

    let progress: Vec<f64> = collect(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            RecordingEvent::Progress { elapsed_ms, .. } => Some(elapsed_ms),
            _ => None,
        })
        .collect();
    assert!(progress.len() >= 3);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
}
