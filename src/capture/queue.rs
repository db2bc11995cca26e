//! Bounded queues between pipeline stages
//!
//! Video and audio use two deliberately different disciplines:
//!
//! - [`VideoQueue`] drops the oldest frame when full and never blocks the
//!   producer.
//! - [`AudioQueue`] blocks the producer while full, up to a hard timeout
//!   that is reported as a [`BackpressureError`].
//!
//! [`SinkQueue`] feeds the encoder and applies the same asymmetry per item.

use crate::capture::frame::{AudioChunk, CaptureFrame, CompositeFrame};
use crate::utils::error::BackpressureError;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    dropped: u64,
}

struct Bounded<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> Bounded<T> {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                dropped: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Push, evicting the oldest item when full. Returns the evicted item, or
    /// the rejected one if the queue is closed.
    fn push_evicting(&self, item: T) -> Option<T> {
        let mut state = self.state.lock();
        if state.closed {
            return Some(item);
        }
        let evicted = if state.items.len() >= self.capacity {
            state.dropped += 1;
            state.items.pop_front()
        } else {
            None
        };
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        evicted
    }

    /// Push without waiting. Hands the item back when full or closed.
    fn try_push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.closed || state.items.len() >= self.capacity {
            if !state.closed {
                state.dropped += 1;
            }
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Push, waiting up to `timeout` for space. `None` waits indefinitely.
    fn push_waiting(&self, item: T, timeout: Option<Duration>) -> Result<(), BackpressureError> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(BackpressureError::Closed);
            }
            if state.items.len() < self.capacity {
                break;
            }
            match deadline {
                Some(deadline) => {
                    if self.not_full.wait_until(&mut state, deadline).timed_out()
                        && state.items.len() >= self.capacity
                        && !state.closed
                    {
                        return Err(BackpressureError::Timeout {
                            waited: started.elapsed(),
                        });
                    }
                }
                None => self.not_full.wait(&mut state),
            }
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    fn try_pop(&self) -> Option<T> {
        let item = self.state.lock().items.pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Pop, waiting up to `timeout`. Returns `None` on timeout or when the
    /// queue is closed and empty.
    fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                let item = state.items.pop_front();
                drop(state);
                if item.is_some() {
                    self.not_full.notify_one();
                }
                return item;
            }
        }
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.closed && state.items.is_empty()
    }

    fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}

/// Drop-oldest queue for video frames
pub struct VideoQueue {
    inner: Bounded<CaptureFrame>,
}

impl VideoQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Bounded::new(capacity),
        }
    }

    /// Never blocks. When full the oldest frame is evicted and returned so
    /// its buffer goes back to the pool. A closed queue returns `frame`.
    pub fn push(&self, frame: CaptureFrame) -> Option<CaptureFrame> {
        self.inner.push_evicting(frame)
    }

    pub fn try_pop(&self) -> Option<CaptureFrame> {
        self.inner.try_pop()
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<CaptureFrame> {
        self.inner.pop_timeout(timeout)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Frames evicted because the consumer fell behind
    pub fn dropped(&self) -> u64 {
        self.inner.dropped()
    }

    pub fn close(&self) {
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn is_drained(&self) -> bool {
        self.inner.is_drained()
    }
}

/// Bounded-block queue for audio chunks
pub struct AudioQueue {
    inner: Bounded<AudioChunk>,
}

impl AudioQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Bounded::new(capacity),
        }
    }

    /// Blocks while full. Gives up after `timeout`; the chunk is not queued
    /// and the caller must report the stall.
    pub fn push(&self, chunk: AudioChunk, timeout: Duration) -> Result<(), BackpressureError> {
        self.inner.push_waiting(chunk, Some(timeout))
    }

    pub fn try_pop(&self) -> Option<AudioChunk> {
        self.inner.try_pop()
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<AudioChunk> {
        self.inner.pop_timeout(timeout)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Wakes blocked producers with [`BackpressureError::Closed`]
    pub fn close(&self) {
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn is_drained(&self) -> bool {
        self.inner.is_drained()
    }
}

/// An item bound for the encoder
#[derive(Debug)]
pub enum SinkItem {
    Video(CompositeFrame),
    Audio(AudioChunk),
}

impl SinkItem {
    pub fn timestamp(&self) -> Duration {
        match self {
            SinkItem::Video(frame) => frame.timestamp,
            SinkItem::Audio(chunk) => chunk.timestamp,
        }
    }
}

/// Encoder input queue
///
/// Live video is offered with [`SinkQueue::offer_video`] and dropped when
/// the encoder is behind; audio waits with a timeout.
pub struct SinkQueue {
    inner: Bounded<SinkItem>,
}

impl SinkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Bounded::new(capacity),
        }
    }

    /// Returns `false` if the frame was dropped.
    pub fn offer_video(&self, frame: CompositeFrame) -> bool {
        self.inner.try_push(SinkItem::Video(frame)).is_ok()
    }

    pub fn push_audio(&self, chunk: AudioChunk, timeout: Duration) -> Result<(), BackpressureError> {
        self.inner.push_waiting(SinkItem::Audio(chunk), Some(timeout))
    }

    /// Waits as long as needed. Used while draining, when no capture is
    /// competing for time.
    pub fn push_blocking(&self, item: SinkItem) -> Result<(), BackpressureError> {
        self.inner.push_waiting(item, None)
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<SinkItem> {
        self.inner.pop_timeout(timeout)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Video frames refused because the queue was full
    pub fn dropped(&self) -> u64 {
        self.inner.dropped()
    }

    pub fn close(&self) {
        self.inner.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn is_drained(&self) -> bool {
        self.inner.is_drained()
    }
}
