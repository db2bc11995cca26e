//! FFmpeg backend
//!
//! Video is piped as raw RGBA into an `ffmpeg` process that encodes H.264
//! into a Matroska spool next to the output. Audio is spooled as raw PCM.
//! Finalize muxes both into `<output>.part` and renames it over the output,
//! so the output path only ever holds a complete file.

use crate::capture::frame::{AudioChunk, CompositeFrame};
use crate::config::preset::{AudioCodec, Container};
use crate::encoder::types::{
    sibling_path, AudioStreamInfo, EncoderFactory, EncoderParams, FinalizeReport, MediaEncoder,
    MediaMetadata, VideoStreamInfo,
};
use crate::encoder::pcm::PcmSpool;
use crate::utils::error::{ConfigError, EncodeError, FinalizeError, StreamKind};
use serde::Deserialize;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStderr, Command, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;

/// Stderr lines kept for error reports
const STDERR_TAIL: usize = 20;

/// Audio timestamp error (in frames) absorbed without padding or trimming
const AUDIO_SLACK_FRAMES: u64 = 2;

/// Check that FFmpeg is installed and runnable. Returns its version line.
pub fn ensure_ffmpeg(binary: &Path) -> Result<String, ConfigError> {
    let output = Command::new(binary)
        .arg("-version")
        .stdin(Stdio::null())
        .output()
        .map_err(|e| {
            ConfigError::EncoderUnavailable(format!("{} not runnable: {}", binary.display(), e))
        })?;

    if !output.status.success() {
        return Err(ConfigError::EncoderUnavailable(format!(
            "{} -version exited with {}",
            binary.display(),
            output.status
        )));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().next().unwrap_or_default().to_string())
}

/// Forward an FFmpeg stderr pipe to tracing. The returned thread yields the
/// last lines for error messages.
fn drain_stderr(stderr: ChildStderr, label: &'static str) -> Option<JoinHandle<String>> {
    std::thread::Builder::new()
        .name(format!("ffmpeg-{}-stderr", label))
        .spawn(move || {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL);
            for line in BufReader::new(stderr).lines() {
                let Ok(line) = line else {
                    break;
                };
                tracing::debug!(target: "ffmpeg", "[{}] {}", label, line);
                if tail.len() == STDERR_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Vec::from(tail).join("\n")
        })
        .map_err(|e| tracing::warn!("Failed to spawn stderr reader: {}", e))
        .ok()
}

fn join_stderr(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Creates FFmpeg-backed encoders
#[derive(Debug, Clone)]
pub struct FfmpegEncoderFactory {
    ffmpeg: PathBuf,
}

impl Default for FfmpegEncoderFactory {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }
}

impl FfmpegEncoderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific FFmpeg binary instead of the one on `PATH`
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: binary.into(),
        }
    }

    fn video_args(params: &EncoderParams, spool: &Path) -> Vec<String> {
        let maxrate = params.video_bitrate_kbps;
        vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-f".to_string(),
            "rawvideo".to_string(),
            "-pix_fmt".to_string(),
            "rgba".to_string(),
            "-s".to_string(),
            format!("{}x{}", params.width, params.height),
            "-r".to_string(),
            params.frame_rate.to_string(),
            "-i".to_string(),
            "-".to_string(), // stdin for video frames
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            params.x264_preset.clone(),
            "-crf".to_string(),
            params.crf.to_string(),
            "-maxrate".to_string(),
            format!("{}k", maxrate),
            "-bufsize".to_string(),
            format!("{}k", maxrate * 2),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-g".to_string(),
            (params.frame_rate * 2).to_string(),
            "-f".to_string(),
            "matroska".to_string(),
            spool.to_string_lossy().into_owned(),
        ]
    }

    fn spawn(&self, params: &EncoderParams, output: &Path) -> Result<FfmpegEncoder, EncodeError> {
        let video_spool = sibling_path(output, "video.mkv");
        let audio_spool = sibling_path(output, "audio.pcm");
        let args = Self::video_args(params, &video_spool);
        tracing::info!("Starting FFmpeg encoder: {:?}", args);

        let mut process = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EncodeError::Spawn(format!("Failed to start FFmpeg encoder: {}", e)))?;

        let cleanup = |process: &mut Child| {
            let _ = process.kill();
            let _ = process.wait();
            let _ = std::fs::remove_file(&video_spool);
            let _ = std::fs::remove_file(&audio_spool);
        };

        let Some(stdin) = process.stdin.take() else {
            cleanup(&mut process);
            return Err(EncodeError::Spawn("Failed to capture FFmpeg stdin".to_string()));
        };
        let stderr = process.stderr.take().and_then(|s| drain_stderr(s, "video"));

        let audio = match PcmSpool::create(&audio_spool, params.sample_rate, params.channels) {
            Ok(spool) => spool,
            Err(e) => {
                drop(stdin);
                cleanup(&mut process);
                return Err(EncodeError::Spawn(format!(
                    "Failed to create audio spool {}: {}",
                    audio_spool.display(),
                    e
                )));
            }
        };

        Ok(FfmpegEncoder {
            ffmpeg: self.ffmpeg.clone(),
            params: params.clone(),
            output: output.to_path_buf(),
            video_spool,
            audio_spool,
            audio_input: audio.input_args(),
            process,
            stdin: Some(BufWriter::with_capacity(params.frame_len(), stdin)),
            stderr,
            audio: Some(audio),
            video_frames: 0,
            last_frame: None,
        })
    }
}

impl EncoderFactory for FfmpegEncoderFactory {
    fn probe(&self) -> Result<(), ConfigError> {
        let version = ensure_ffmpeg(&self.ffmpeg)?;
        tracing::info!("Using {}", version);
        Ok(())
    }

    fn open(
        &self,
        params: &EncoderParams,
        output: &Path,
    ) -> Result<Box<dyn MediaEncoder>, EncodeError> {
        Ok(Box::new(self.spawn(params, output)?))
    }
}

pub struct FfmpegEncoder {
    ffmpeg: PathBuf,
    params: EncoderParams,
    output: PathBuf,
    video_spool: PathBuf,
    audio_spool: PathBuf,
    /// Demuxer options for the raw audio spool
    audio_input: Vec<String>,
    process: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    stderr: Option<JoinHandle<String>>,
    /// Taken when the spool is finished
    audio: Option<PcmSpool>,
    video_frames: u64,
    /// Repeated when a tick is missing
    last_frame: Option<CompositeFrame>,
}

impl FfmpegEncoder {
    fn write_raw(&mut self, data: &[u8]) -> Result<(), EncodeError> {
        let stdin = self.stdin.as_mut().ok_or_else(|| EncodeError::Write {
            stream: StreamKind::Video,
            reason: "encoder input already closed".to_string(),
        })?;
        stdin.write_all(data).map_err(|e| EncodeError::Write {
            stream: StreamKind::Video,
            reason: e.to_string(),
        })?;
        self.video_frames += 1;
        Ok(())
    }

    fn write_black(&mut self, frames: u64) -> Result<(), EncodeError> {
        let black: Vec<u8> = [0, 0, 0, 255].repeat(self.params.frame_len() / 4);
        for _ in 0..frames {
            self.write_raw(&black)?;
        }
        Ok(())
    }

    fn audio_spool(&mut self) -> Result<&mut PcmSpool, EncodeError> {
        self.audio.as_mut().ok_or_else(|| EncodeError::Write {
            stream: StreamKind::Audio,
            reason: "audio spool already closed".to_string(),
        })
    }

    fn audio_error(e: std::io::Error) -> EncodeError {
        EncodeError::Write {
            stream: StreamKind::Audio,
            reason: e.to_string(),
        }
    }

    /// Intermediate files currently on disk
    fn written(&self) -> Vec<PathBuf> {
        [&self.video_spool, &self.audio_spool]
            .into_iter()
            .filter(|p| p.exists())
            .cloned()
            .collect()
    }

    fn container_error(&self, reason: String) -> FinalizeError {
        FinalizeError::Container {
            reason,
            written: self.written(),
        }
    }

    /// Close the video pipe and wait for the encoder to flush
    fn finish_video(&mut self) -> Result<(), String> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin
                .flush()
                .map_err(|e| format!("Failed to flush video: {}", e))?;
        }
        let status = self
            .process
            .wait()
            .map_err(|e| format!("Failed to wait for FFmpeg: {}", e))?;
        let tail = join_stderr(self.stderr.take());
        if !status.success() {
            return Err(format!("FFmpeg exited with {}: {}", status, tail));
        }
        Ok(())
    }

    fn mux_args(&self, part: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-hide_banner".into(),
            "-i".into(),
            self.video_spool.to_string_lossy().into_owned(),
        ];
        args.extend(self.audio_input.iter().cloned());
        args.extend([
            "-i".into(),
            self.audio_spool.to_string_lossy().into_owned(),
            "-map".into(),
            "0:v".into(),
            "-map".into(),
            "1:a".into(),
            "-c:v".into(),
            "copy".into(),
            "-c:a".into(),
            self.params.audio_codec.ffmpeg_name().into(),
        ]);
        if let AudioCodec::Aac { bitrate_kbps } = self.params.audio_codec {
            args.extend(["-b:a".into(), format!("{}k", bitrate_kbps)]);
        }
        if matches!(self.params.container, Container::Mp4 | Container::Mov) {
            args.extend(["-movflags".into(), "+faststart".into()]);
        }
        args.extend([
            "-f".into(),
            self.params.container.muxer().into(),
            part.to_string_lossy().into_owned(),
        ]);
        args
    }

    fn mux(&self, part: &Path) -> Result<(), String> {
        let args = self.mux_args(part);
        tracing::info!("Muxing: {:?}", args);
        let output = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| format!("Failed to run FFmpeg mux: {}", e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("FFmpeg mux failed: {}", stderr.trim()));
        }
        Ok(())
    }
}

impl MediaEncoder for FfmpegEncoder {
    fn write_video(&mut self, frame: CompositeFrame) -> Result<(), EncodeError> {
        if frame.width != self.params.width
            || frame.height != self.params.height
            || frame.data.len() != self.params.frame_len()
        {
            return Err(EncodeError::InvalidFrame(format!(
                "{}x{} frame ({} bytes) for a {}x{} encoder",
                frame.width,
                frame.height,
                frame.data.len(),
                self.params.width,
                self.params.height
            )));
        }
        if frame.index < self.video_frames {
            return Err(EncodeError::InvalidFrame(format!(
                "tick {} already written",
                frame.index
            )));
        }

        // Missing ticks repeat the previous frame so the track keeps its rate
        if frame.index > self.video_frames {
            let missing = frame.index - self.video_frames;
            tracing::debug!("Repeating {} frames before tick {}", missing, frame.index);
            match self.last_frame.take() {
                Some(last) => {
                    let result = (0..missing).try_for_each(|_| self.write_raw(&last.data));
                    self.last_frame = Some(last);
                    result?;
                }
                None => self.write_black(missing)?,
            }
        }

        self.write_raw(&frame.data)?;
        self.last_frame = Some(frame);
        Ok(())
    }

    fn write_audio(&mut self, chunk: AudioChunk) -> Result<(), EncodeError> {
        if chunk.sample_rate != self.params.sample_rate || chunk.channels != self.params.channels {
            return Err(EncodeError::InvalidFrame(format!(
                "{}Hz/{}ch audio for a {}Hz/{}ch encoder",
                chunk.sample_rate, chunk.channels, self.params.sample_rate, self.params.channels
            )));
        }

        let channels = self.params.channels as usize;
        let position =
            (chunk.timestamp.as_secs_f64() * self.params.sample_rate as f64).round() as u64;
        let spool = self.audio_spool()?;
        let written = spool.frames();
        let mut samples = &chunk.samples[..];

        if position > written + AUDIO_SLACK_FRAMES {
            spool
                .write_silence(position - written)
                .map_err(Self::audio_error)?;
        } else if position + AUDIO_SLACK_FRAMES < written {
            let overlap = ((written - position) as usize * channels).min(samples.len());
            samples = &samples[overlap..];
        }
        spool.write_samples(samples).map_err(Self::audio_error)
    }

    fn finalize(mut self: Box<Self>) -> Result<FinalizeReport, FinalizeError> {
        // An empty track would leave nothing to mux
        if self.video_frames == 0 {
            if let Err(e) = self.write_black(1) {
                tracing::warn!("Failed to write placeholder frame: {}", e);
            }
        }
        self.last_frame = None;
        let video_frames = self.video_frames;

        if let Err(reason) = self.finish_video() {
            return Err(self.container_error(reason));
        }

        let audio_frames = match self.audio.take().map(|spool| {
            let frames = spool.frames();
            spool.finish().map(|_| frames)
        }) {
            Some(Ok(frames)) => frames,
            Some(Err(e)) => {
                return Err(self.container_error(format!("Failed to finish audio spool: {}", e)))
            }
            None => return Err(self.container_error("Audio spool already closed".to_string())),
        };

        let part = sibling_path(&self.output, "part");
        if let Err(reason) = self.mux(&part) {
            let _ = std::fs::remove_file(&part);
            return Err(self.container_error(reason));
        }
        if let Err(e) = std::fs::rename(&part, &self.output) {
            let mut written = self.written();
            written.push(part);
            return Err(FinalizeError::Container {
                reason: format!("Failed to move output into place: {}", e),
                written,
            });
        }
        for spool in [&self.video_spool, &self.audio_spool] {
            if let Err(e) = std::fs::remove_file(spool) {
                tracing::warn!("Failed to remove spool {}: {}", spool.display(), e);
            }
        }

        let bytes_written = std::fs::metadata(&self.output)
            .map(|m| m.len())
            .unwrap_or(0);
        tracing::info!(
            "Finalized {}: {} video frames, {} audio frames, {} bytes",
            self.output.display(),
            video_frames,
            audio_frames,
            bytes_written
        );
        Ok(FinalizeReport {
            output_path: self.output.clone(),
            video_frames,
            audio_frames,
            video_duration: self.params.video_duration(video_frames),
            audio_duration: self.params.audio_duration(audio_frames),
            bytes_written,
        })
    }

    fn abort(mut self: Box<Self>) -> Vec<PathBuf> {
        tracing::warn!("Aborting encoder for {}", self.output.display());
        self.stdin = None;
        let _ = self.process.kill();
        let _ = self.process.wait();
        join_stderr(self.stderr.take());
        if let Some(spool) = self.audio.take() {
            if let Err(e) = spool.finish() {
                tracing::warn!("Failed to finish audio spool: {}", e);
            }
        }
        self.written()
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u16>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    size: Option<String>,
}

fn parse_seconds(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Parse frame rate (format: "30/1" or "30000/1001")
fn parse_rate(value: &str) -> f64 {
    match value.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().unwrap_or(0.0);
            let den: f64 = den.parse().unwrap_or(1.0);
            if den == 0.0 {
                0.0
            } else {
                num / den
            }
        }
        None => value.parse().unwrap_or(0.0),
    }
}

fn parse_probe(path: &Path, json: &[u8]) -> Result<MediaMetadata, EncodeError> {
    let probe: ProbeOutput = serde_json::from_slice(json)
        .map_err(|e| EncodeError::Probe(format!("Unexpected ffprobe output: {}", e)))?;

    let kind = |k: &str| {
        probe
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some(k))
    };
    let video = kind("video").map(|s| VideoStreamInfo {
        codec: s.codec_name.clone().unwrap_or_default(),
        width: s.width.unwrap_or(0),
        height: s.height.unwrap_or(0),
        frame_rate: s.r_frame_rate.as_deref().map(parse_rate).unwrap_or(0.0),
        duration: parse_seconds(s.duration.as_deref()),
    });
    let audio = kind("audio").map(|s| AudioStreamInfo {
        codec: s.codec_name.clone().unwrap_or_default(),
        sample_rate: s
            .sample_rate
            .as_deref()
            .and_then(|r| r.parse().ok())
            .unwrap_or(0),
        channels: s.channels.unwrap_or(0),
        duration: parse_seconds(s.duration.as_deref()),
    });
    let format = probe.format.as_ref();

    Ok(MediaMetadata {
        path: path.to_path_buf(),
        format: format
            .and_then(|f| f.format_name.clone())
            .unwrap_or_default(),
        duration: parse_seconds(format.and_then(|f| f.duration.as_deref())),
        size_bytes: format
            .and_then(|f| f.size.as_deref())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        video,
        audio,
    })
}

/// Read stream metadata of a media file with ffprobe
pub fn probe_media(path: &Path) -> Result<MediaMetadata, EncodeError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "stream=codec_type,codec_name,width,height,r_frame_rate,sample_rate,channels,duration:format=format_name,duration,size",
            "-of",
            "json",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| EncodeError::Probe(format!("Failed to run ffprobe: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(EncodeError::Probe(format!("ffprobe failed: {}", stderr.trim())));
    }
    parse_probe(path, &output.stdout)
}
