//! Session pipeline
//!
//! Everything one recording owns while it runs: the source adapters, the
//! capture gate, the session clock, the synchronizer and the encoder sink.
//! All methods block and are called by the controller off the async
//! runtime.

use crate::capture::pool::FramePool;
use crate::capture::queue::SinkQueue;
use crate::capture::screen::{ScreenFormat, ScreenSource};
use crate::capture::source::{
    CaptureGate, SourceContext, SourceHandle, SourceId, SourceKind, SourceMonitor,
};
use crate::capture::traits::{AudioBackend, DeviceCatalog, ScreenBackend, WebcamBackend};
use crate::capture::{AudioSource, WebcamSource};
use crate::config::preset::ResolvedPreset;
use crate::config::request::StartRequest;
use crate::config::tuning::PipelineTuning;
use crate::encoder::sink::{EncoderSink, SinkReport};
use crate::encoder::types::{EncoderFactory, EncoderParams};
use crate::recorder::events::{EventSender, FaultSender};
use crate::sync::clock::SessionClock;
use crate::sync::synchronizer::{SyncHandle, SyncReport, SyncSettings, SyncStats, Synchronizer};
use crate::utils::error::{ClockError, ConfigError, FinalizeError, SourceError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

const READY_POLL: Duration = Duration::from_millis(5);

/// A device resolved from the catalog but not opened yet
enum PendingSource {
    Screen(Box<dyn ScreenBackend>, ScreenFormat),
    Audio(Box<dyn AudioBackend>),
    Webcam(Box<dyn WebcamBackend>),
}

pub struct Pipeline {
    output: PathBuf,
    gate: Arc<CaptureGate>,
    clock: Arc<SessionClock>,
    sources: Vec<SourceHandle>,
    /// Every bound source, opened or not
    monitors: Vec<Arc<SourceMonitor>>,
    sync: Option<SyncHandle>,
    sync_stats: Arc<SyncStats>,
    sink: Option<EncoderSink>,
}

impl Pipeline {
    /// Open every source, wait until they deliver, then start the encoder
    /// and synchronizer. Nothing is handed downstream until [`go_live`].
    ///
    /// A source that fails to open is degraded; the start only fails if no
    /// source is left. Anything opened is released again on error, and no
    /// output file exists unless this returns `Ok`.
    ///
    /// [`go_live`]: Pipeline::go_live
    pub fn open(
        request: &StartRequest,
        preset: &ResolvedPreset,
        catalog: &dyn DeviceCatalog,
        encoders: &dyn EncoderFactory,
        tuning: &PipelineTuning,
        events: &EventSender,
        faults: &FaultSender,
    ) -> Result<Self, ConfigError> {
        // Resolve every device before touching any of them
        let mut pending: Vec<(SourceId, PendingSource)> = Vec::new();
        let display = request.screen.display_id();
        pending.push((
            SourceId::new(SourceKind::Screen, display),
            PendingSource::Screen(
                catalog.screen_backend(display)?,
                ScreenFormat {
                    frame_rate: preset.frame_rate,
                    region: request.screen.region(),
                },
            ),
        ));
        for id in &request.audio_devices {
            pending.push((
                SourceId::new(SourceKind::Audio, id.as_str()),
                PendingSource::Audio(catalog.audio_backend(id)?),
            ));
        }
        if let Some(id) = &request.webcam {
            pending.push((
                SourceId::new(SourceKind::Webcam, id.as_str()),
                PendingSource::Webcam(catalog.webcam_backend(id)?),
            ));
        }
        encoders.probe()?;

        let gate = CaptureGate::new();
        let pool = FramePool::new(tuning.frame_pool_size);
        let mut sources = Vec::new();
        let mut monitors = Vec::new();
        let mut failures = Vec::new();

        for (id, source) in pending {
            let monitor = SourceMonitor::new(id.clone(), events.clone());
            monitors.push(monitor.clone());
            let ctx = SourceContext {
                gate: gate.clone(),
                monitor: monitor.clone(),
                pool: pool.clone(),
                tuning: tuning.clone(),
            };
            let started = match source {
                PendingSource::Screen(backend, format) => ScreenSource::start(backend, format, ctx),
                PendingSource::Audio(backend) => AudioSource::start(backend, ctx),
                PendingSource::Webcam(backend) => WebcamSource::start(backend, ctx),
            };
            match started {
                Ok(handle) => sources.push(handle),
                Err(e) => {
                    monitor.degrade(&e);
                    failures.push(format!("{}: {}", id, e));
                }
            }
        }

        if sources.is_empty() {
            return Err(ConfigError::NoUsableSources(failures.join("; ")));
        }

        let mut pipeline = Self {
            output: request.output_path.clone(),
            gate,
            clock: Arc::new(SessionClock::new()),
            sources,
            monitors,
            sync: None,
            sync_stats: Arc::new(SyncStats::default()),
            sink: None,
        };

        if let Err(e) = pipeline.wait_ready(tuning.ready_timeout()) {
            pipeline.release_sources();
            return Err(e);
        }

        let params = EncoderParams::from_preset(preset);
        let encoder = match encoders.open(&params, &request.output_path) {
            Ok(encoder) => encoder,
            Err(e) => {
                pipeline.release_sources();
                return Err(ConfigError::EncoderUnavailable(e.to_string()));
            }
        };

        let queue = Arc::new(SinkQueue::new(tuning.sink_queue_capacity));
        let sink = match EncoderSink::spawn(
            encoder,
            queue.clone(),
            request.output_path.clone(),
            faults.clone(),
        ) {
            Ok(sink) => sink,
            Err(e) => {
                pipeline.release_sources();
                return Err(ConfigError::EncoderUnavailable(e.to_string()));
            }
        };

        let taps = pipeline.sources.iter().map(|s| s.tap()).collect();
        let settings = SyncSettings {
            preset: preset.clone(),
            layout: request.webcam_layout.clone(),
            gain_db: request.audio_gain_db,
            tuning: tuning.clone(),
        };
        let synchronizer = Synchronizer::new(
            settings,
            taps,
            pipeline.clock.clone(),
            queue,
            events.clone(),
            faults.clone(),
        );
        pipeline.sync_stats = synchronizer.stats();
        match synchronizer.spawn() {
            Ok(handle) => pipeline.sync = Some(handle),
            Err(e) => {
                let written = sink.abort();
                discard(&written);
                pipeline.release_sources();
                return Err(ConfigError::Setup(e.to_string()));
            }
        }
        pipeline.sink = Some(sink);

        tracing::info!(
            "Pipeline ready: {} of {} sources live",
            pipeline.sources.len(),
            pipeline.monitors.len()
        );
        Ok(pipeline)
    }

    /// Wait until every opened source has captured once. Sources that fail
    /// meanwhile stop counting; at least one must deliver.
    fn wait_ready(&self, timeout: Duration) -> Result<(), ConfigError> {
        let deadline = Instant::now() + timeout;
        loop {
            let waiting = self
                .sources
                .iter()
                .filter(|s| s.monitor().is_usable() && s.monitor().first_capture().is_none())
                .count();
            let ready = self
                .sources
                .iter()
                .filter(|s| s.monitor().first_capture().is_some())
                .count();
            if waiting == 0 && ready > 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                if ready > 0 {
                    for source in &self.sources {
                        if source.monitor().first_capture().is_none() {
                            source.monitor().degrade(&SourceError::DeviceUnavailable(format!(
                                "no data within {:?}",
                                timeout
                            )));
                        }
                    }
                    return Ok(());
                }
                return Err(ConfigError::SourcesNotReady(timeout));
            }
            if waiting == 0 {
                // Everything opened has already failed
                return Err(ConfigError::SourcesNotReady(timeout));
            }
            std::thread::sleep(READY_POLL);
        }
    }

    fn release_sources(&mut self) {
        for source in &mut self.sources {
            source.stop();
        }
    }

    /// Fix the session origin and start handing items downstream
    pub fn go_live(&self) -> Result<(), ClockError> {
        self.clock.establish(Instant::now())?;
        self.gate.open();
        Ok(())
    }

    pub fn pause(&self) -> Result<(), ClockError> {
        self.gate.close();
        self.clock.pause(Instant::now())
    }

    pub fn resume(&self) -> Result<(), ClockError> {
        self.clock.resume(Instant::now())?;
        self.gate.open();
        Ok(())
    }

    pub fn clock(&self) -> &Arc<SessionClock> {
        &self.clock
    }

    pub fn sync_stats(&self) -> Arc<SyncStats> {
        self.sync_stats.clone()
    }

    pub fn output(&self) -> &PathBuf {
        &self.output
    }

    /// Sources that ended up degraded
    pub fn degraded_sources(&self) -> Vec<SourceId> {
        self.monitors
            .iter()
            .filter(|m| m.is_degraded())
            .map(|m| m.id().clone())
            .collect()
    }

    /// Freeze the clock, stop every adapter and let the synchronizer emit
    /// the tail. Adapters have all released their devices when this
    /// returns.
    pub fn drain(&mut self) -> SyncReport {
        self.clock.freeze(Instant::now());
        self.gate.close();
        self.release_sources();
        match self.sync.take() {
            Some(sync) => sync.drain(),
            None => SyncReport::default(),
        }
    }

    /// Flush the encoder and finalize the container. Call after
    /// [`drain`](Pipeline::drain).
    pub fn finalize(&mut self) -> Result<SinkReport, FinalizeError> {
        match self.sink.take() {
            Some(sink) => sink.finish(),
            None => Err(FinalizeError::NotActive),
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Some(sync) = self.sync.take() {
            sync.abort();
        }
        self.release_sources();
        if let Some(sink) = self.sink.take() {
            sink.abort();
        }
    }
}

/// Remove files of a session that never started
fn discard(written: &[PathBuf]) {
    for path in written {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::{Fault, SyntheticCatalog, SyntheticDisplay};
    use crate::config::preset::{AudioQuality, QualityPreset, VideoQuality};
    use crate::config::request::ScreenSelector;
    use crate::encoder::memory::{MemoryEncoderFactory, MemoryFault};
    use crate::recorder::events;

    fn request(dir: &std::path::Path) -> StartRequest {
        let mut request = StartRequest::new(
            ScreenSelector::Display {
                id: "synthetic-0".into(),
            },
            dir.join("out.mkv"),
        );
        request.preset = QualityPreset::new(VideoQuality::Low, AudioQuality::Low);
        request.audio_devices = vec!["synthetic-mic".into()];
        request
    }

    fn open(
        request: &StartRequest,
        catalog: &SyntheticCatalog,
        encoders: &MemoryEncoderFactory,
    ) -> Result<Pipeline, ConfigError> {
        let preset = request.validate()?;
        let (faults, _rx) = events::fault_channel();
        Pipeline::open(
            request,
            &preset,
            catalog,
            encoders,
            &PipelineTuning::default(),
            &events::channel(),
            &faults,
        )
    }

    #[test]
    fn unknown_device_opens_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = request(dir.path());
        request.audio_devices.push("no-such-mic".into());
        let encoders = MemoryEncoderFactory::new();
        let result = open(&request, &SyntheticCatalog::standard(), &encoders);
        assert!(matches!(result, Err(ConfigError::DeviceNotFound(_))));
        assert!(encoders.recordings().is_empty());
    }

    #[test]
    fn encoder_open_failure_releases_sources() {
        let dir = tempfile::tempdir().unwrap();
        let encoders = MemoryEncoderFactory::new().with_fault(MemoryFault::Open);
        let result = open(&request(dir.path()), &SyntheticCatalog::standard(), &encoders);
        assert!(matches!(result, Err(ConfigError::EncoderUnavailable(_))));
    }

    #[test]
    fn failed_screen_alone_is_not_enough_to_abort() {
        let dir = tempfile::tempdir().unwrap();
        let mut display = SyntheticDisplay::new("synthetic-0", 64, 32);
        display.fault = Fault::permission_denied("screen recording");
        let catalog = SyntheticCatalog::standard().with_display(display);
        let encoders = MemoryEncoderFactory::new();

        let mut pipeline = open(&request(dir.path()), &catalog, &encoders).unwrap();
        assert_eq!(
            pipeline.degraded_sources(),
            vec![SourceId::new(SourceKind::Screen, "synthetic-0")]
        );
        pipeline.go_live().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        pipeline.drain();
        assert!(pipeline.finalize().is_ok());
    }

    #[test]
    fn no_usable_source_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut display = SyntheticDisplay::new("synthetic-0", 64, 32);
        display.fault = Fault::permission_denied("screen recording");
        let catalog = SyntheticCatalog::standard().with_display(display);
        let mut request = request(dir.path());
        request.audio_devices.clear();

        let encoders = MemoryEncoderFactory::new();
        let result = open(&request, &catalog, &encoders);
        assert!(matches!(result, Err(ConfigError::NoUsableSources(_))));
        assert!(encoders.recordings().is_empty());
    }
}
