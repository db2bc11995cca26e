//! Encoder sink
//!
//! Owns the encoder on its own thread and feeds it from the [`SinkQueue`].
//! Each stream must arrive in non-decreasing timestamp order; anything else
//! is an [`EncodeError::OutOfOrder`]. An encode error is fatal: it is raised
//! to the controller, the queue is closed so producers stop, and a
//! best-effort finalize runs on what was written.

use crate::capture::queue::{SinkItem, SinkQueue};
use crate::encoder::types::{FinalizeReport, MediaEncoder};
use crate::recorder::events::{raise, FaultSender};
use crate::utils::error::{EncodeError, FinalizeError, PipelineFault, StreamKind};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const POP_WAIT: Duration = Duration::from_millis(20);

/// What the sink did over the session
#[derive(Debug, Clone, PartialEq)]
pub struct SinkReport {
    pub output: FinalizeReport,
    pub video_items: u64,
    pub audio_items: u64,
}

#[derive(Debug, Default)]
struct SinkShared {
    abort: AtomicBool,
    video_items: AtomicU64,
    audio_items: AtomicU64,
    fault: Mutex<Option<EncodeError>>,
}

enum SinkExit {
    Finalized(Result<FinalizeReport, FinalizeError>),
    Aborted(Vec<PathBuf>),
}

pub struct EncoderSink {
    queue: Arc<SinkQueue>,
    shared: Arc<SinkShared>,
    output: PathBuf,
    thread: Option<JoinHandle<SinkExit>>,
}

impl EncoderSink {
    /// Start the sink thread. The queue is closed when the thread exits.
    pub fn spawn(
        encoder: Box<dyn MediaEncoder>,
        queue: Arc<SinkQueue>,
        output: PathBuf,
        faults: FaultSender,
    ) -> Result<Self, EncodeError> {
        let shared = Arc::new(SinkShared::default());
        let thread = {
            let queue = queue.clone();
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("encoder-sink".to_string())
                .spawn(move || run(encoder, &queue, &shared, &faults))
                .map_err(|e| EncodeError::Spawn(format!("failed to spawn encoder sink: {}", e)))?
        };
        Ok(Self {
            queue,
            shared,
            output,
            thread: Some(thread),
        })
    }

    pub fn queue(&self) -> &Arc<SinkQueue> {
        &self.queue
    }

    pub fn video_items(&self) -> u64 {
        self.shared.video_items.load(Ordering::Relaxed)
    }

    pub fn audio_items(&self) -> u64 {
        self.shared.audio_items.load(Ordering::Relaxed)
    }

    /// The encode error that stopped the sink, if any
    pub fn fault(&self) -> Option<EncodeError> {
        self.shared.fault.lock().clone()
    }

    /// Close the input, let the encoder write everything queued and
    /// finalize the container.
    pub fn finish(mut self) -> Result<SinkReport, FinalizeError> {
        self.queue.close();
        let exit = self.join();
        let fault = self.fault();
        match (exit, fault) {
            (SinkExit::Finalized(result), Some(fault)) => {
                // The partial file is reported but the session still failed
                let written = match result {
                    Ok(report) => vec![report.output_path],
                    Err(e) => e.written().to_vec(),
                };
                Err(FinalizeError::Failed {
                    cause: fault.to_string(),
                    written,
                })
            }
            (SinkExit::Finalized(result), None) => result.map(|output| SinkReport {
                output,
                video_items: self.video_items(),
                audio_items: self.audio_items(),
            }),
            (SinkExit::Aborted(written), _) => Err(FinalizeError::Failed {
                cause: "encoder aborted".to_string(),
                written,
            }),
        }
    }

    /// Stop without finalizing. Returns the files left behind.
    pub fn abort(mut self) -> Vec<PathBuf> {
        self.shared.abort.store(true, Ordering::SeqCst);
        self.queue.close();
        match self.join() {
            SinkExit::Aborted(written) => written,
            SinkExit::Finalized(Ok(report)) => vec![report.output_path],
            SinkExit::Finalized(Err(e)) => e.written().to_vec(),
        }
    }

    fn join(&mut self) -> SinkExit {
        match self.thread.take().map(|t| t.join()) {
            Some(Ok(exit)) => exit,
            Some(Err(_)) => {
                tracing::error!("Encoder sink thread panicked");
                let written = [self.output.clone()]
                    .into_iter()
                    .filter(|p| p.exists())
                    .collect();
                SinkExit::Finalized(Err(FinalizeError::Container {
                    reason: "encoder thread panicked".to_string(),
                    written,
                }))
            }
            None => SinkExit::Aborted(Vec::new()),
        }
    }
}

impl Drop for EncoderSink {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shared.abort.store(true, Ordering::SeqCst);
            self.queue.close();
            self.join();
        }
    }
}

/// Last timestamp written per stream
#[derive(Debug, Default)]
struct StreamOrder {
    video: Option<Duration>,
    audio: Option<Duration>,
}

impl StreamOrder {
    fn check(&mut self, stream: StreamKind, got: Duration) -> Result<(), EncodeError> {
        let last = match stream {
            StreamKind::Video => &mut self.video,
            StreamKind::Audio => &mut self.audio,
        };
        if let Some(previous) = *last {
            if got < previous {
                return Err(EncodeError::OutOfOrder {
                    stream,
                    previous,
                    got,
                });
            }
        }
        *last = Some(got);
        Ok(())
    }
}

fn run(
    mut encoder: Box<dyn MediaEncoder>,
    queue: &SinkQueue,
    shared: &SinkShared,
    faults: &FaultSender,
) -> SinkExit {
    tracing::info!("Encoder sink started");
    let mut order = StreamOrder::default();

    loop {
        if shared.abort.load(Ordering::SeqCst) {
            return SinkExit::Aborted(encoder.abort());
        }
        let Some(item) = queue.pop_timeout(POP_WAIT) else {
            if queue.is_drained() {
                break;
            }
            continue;
        };

        let result = match item {
            SinkItem::Video(frame) => order
                .check(StreamKind::Video, frame.timestamp)
                .and_then(|_| encoder.write_video(frame))
                .map(|_| shared.video_items.fetch_add(1, Ordering::Relaxed)),
            SinkItem::Audio(chunk) => order
                .check(StreamKind::Audio, chunk.timestamp)
                .and_then(|_| encoder.write_audio(chunk))
                .map(|_| shared.audio_items.fetch_add(1, Ordering::Relaxed)),
        };

        if let Err(e) = result {
            *shared.fault.lock() = Some(e.clone());
            raise(faults, PipelineFault::Encode(e));
            queue.close();
            break;
        }
    }

    if shared.abort.load(Ordering::SeqCst) {
        return SinkExit::Aborted(encoder.abort());
    }
    tracing::info!(
        "Encoder sink draining done: {} video, {} audio items",
        shared.video_items.load(Ordering::Relaxed),
        shared.audio_items.load(Ordering::Relaxed)
    );
    SinkExit::Finalized(encoder.finalize())
}
