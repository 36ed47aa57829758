//! Sinks: the consumer side of a capture.
//!
//! A sink receives up to one audio and one video stream, each in the format
//! it was set up with, and optionally a muxed container of both. Frames are
//! pulled with [`CaptureSink::acquire_frame`] and must be handed back with
//! [`CaptureSink::release_frame`].
//!
//! Each stream of a sink owns a [`ShareQueue`] with two ports:
//!
//! - port 0: the application (`acquire_frame`)
//! - port 1: the sink's muxer thread, if a muxer was added
//!
//! After a path error or end of data, frames already queued can still be
//! acquired; afterwards `acquire_frame` returns [`CaptureError::NotFound`].

mod muxer;

pub use muxer::{MockMuxer, Muxer, MuxerConfig, MuxerDataCallback, MuxerMask};
pub(crate) use muxer::MuxerPath;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::capture::CaptureInner;
use crate::error::{CaptureError, Result};
use crate::event::SinkEvent;
use crate::format::{AudioInfo, VideoInfo};
use crate::frame::{Frame, StreamType};
use crate::pipeline::stage::StageFactory;
use crate::queue::{DataQueue, ShareQueue, Ticket};
use crate::source::Overlay;

/// Port of a sink share queue read by the application.
pub(crate) const APP_PORT: usize = 0;
/// Port of a sink share queue read by the muxer.
pub(crate) const MUXER_PORT: usize = 1;
/// Longest a blocked `acquire` waits before re-checking its path.
const PATH_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// How a sink runs once enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// The sink receives nothing.
    #[default]
    Disable,
    /// The sink receives every frame.
    Always,
    /// The sink receives one video frame per call to
    /// [`CaptureSink::enable`]; audio keeps flowing.
    Oneshot,
}

/// Formats a sink wants.
///
/// # Example
///
/// ```
/// use stream_capture::format::{AudioInfo, FormatId, VideoInfo};
/// use stream_capture::SinkConfig;
///
/// let config = SinkConfig::new()
///     .with_audio(AudioInfo::new(FormatId::AAC, 16000, 1, 16))
///     .with_video(VideoInfo::new(FormatId::H264, 1280, 720, 30));
/// assert!(config.audio.is_some());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkConfig {
    /// Audio format, `None` for no audio.
    pub audio: Option<AudioInfo>,
    /// Video format, `None` for no video.
    pub video: Option<VideoInfo>,
}

impl SinkConfig {
    /// A sink without streams.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the audio format.
    #[must_use]
    pub fn with_audio(mut self, info: AudioInfo) -> Self {
        self.audio = Some(info);
        self
    }

    /// Sets the video format.
    #[must_use]
    pub fn with_video(mut self, info: VideoInfo) -> Self {
        self.video = Some(info);
        self
    }
}

/// Frame counters of a sink, or summed over a capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Frames handed to the application.
    pub frames_delivered: u64,
    /// Frames dropped because a consumer did not keep up.
    pub frames_dropped: u64,
    /// Paths that failed at start or while running.
    pub path_errors: u64,
}

impl std::ops::Add for CaptureStats {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            frames_delivered: self.frames_delivered + other.frames_delivered,
            frames_dropped: self.frames_dropped + other.frames_dropped,
            path_errors: self.path_errors + other.path_errors,
        }
    }
}

pub(crate) type FrameQueue = Arc<ShareQueue<Frame>>;

#[derive(Default)]
struct StreamSlot {
    queue: Mutex<Option<FrameQueue>>,
    path_disabled: AtomicBool,
    raw_disabled: AtomicBool,
}

/// Data-plane state of one sink, shared by pipeline workers, the event
/// dispatcher and consumer threads.
pub(crate) struct SinkSlot {
    index: u8,
    disabled: AtomicBool,
    audio: StreamSlot,
    video: StreamSlot,
    muxer_output: Mutex<Option<Arc<DataQueue>>>,
    events: Mutex<Option<mpsc::UnboundedSender<SinkEvent>>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
    path_errors: AtomicU64,
}

impl SinkSlot {
    pub fn new(index: u8) -> Self {
        Self {
            index,
            disabled: AtomicBool::new(true),
            audio: StreamSlot::default(),
            video: StreamSlot::default(),
            muxer_output: Mutex::new(None),
            events: Mutex::new(None),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            path_errors: AtomicU64::new(0),
        }
    }

    fn stream(&self, stream: StreamType) -> Result<&StreamSlot> {
        match stream {
            StreamType::Audio => Ok(&self.audio),
            StreamType::Video => Ok(&self.video),
            StreamType::Muxer => Err(CaptureError::invalid_arg("muxer is not a path stream")),
        }
    }

    pub fn queue(&self, stream: StreamType) -> Option<FrameQueue> {
        self.stream(stream).ok()?.queue.lock().clone()
    }

    pub fn set_queue(&self, stream: StreamType, queue: Option<FrameQueue>) -> Result<()> {
        *self.stream(stream)?.queue.lock() = queue;
        Ok(())
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::SeqCst);
    }

    pub fn set_path_disabled(&self, stream: StreamType, disabled: bool) {
        if let Ok(slot) = self.stream(stream) {
            slot.path_disabled.store(disabled, Ordering::SeqCst);
        }
    }

    pub fn set_raw_disabled(&self, stream: StreamType) -> Result<()> {
        self.stream(stream)?.raw_disabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_raw_disabled(&self, stream: StreamType) -> bool {
        self.stream(stream)
            .is_ok_and(|s| s.raw_disabled.load(Ordering::SeqCst))
    }

    pub fn set_muxer_output(&self, output: Option<Arc<DataQueue>>) {
        *self.muxer_output.lock() = output;
    }

    /// Hands a processed frame to the sink's consumers.
    ///
    /// A disabled sink refuses frames with [`CaptureError::NotSupported`],
    /// which the producer treats as a silent drop.
    pub fn deliver(&self, stream: StreamType, frame: Frame) -> Result<()> {
        let slot = self.stream(stream)?;
        if self.disabled.load(Ordering::SeqCst) || slot.path_disabled.load(Ordering::SeqCst) {
            return Err(CaptureError::not_supported(format!("sink {} disabled", self.index)));
        }
        let queue = slot
            .queue
            .lock()
            .clone()
            .ok_or_else(|| CaptureError::not_supported(format!("sink {} not prepared", self.index)))?;
        match queue.add(frame) {
            Err(CaptureError::Timeout) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(CaptureError::Timeout)
            }
            other => other,
        }
    }

    /// Marks a stream's path as failed or finished and wakes its consumers.
    ///
    /// An end-of-stream frame is queued behind the buffered ones when a slot
    /// is free. The application port is woken either way, so a consumer that
    /// would not receive the marker (a finished one-shot port, a full queue)
    /// still returns.
    pub fn fail_path(&self, stream: StreamType, error: bool) {
        let Ok(slot) = self.stream(stream) else {
            return;
        };
        slot.path_disabled.store(true, Ordering::SeqCst);
        if error {
            self.path_errors.fetch_add(1, Ordering::Relaxed);
        }
        let queue = slot.queue.lock().clone();
        if let Some(queue) = queue {
            if let Err(e) = queue.add(Frame::end_of_stream(stream)) {
                debug!(sink = self.index, %stream, error = %e, "end of stream not queued");
            }
            if let Err(e) = queue.wake(APP_PORT) {
                debug!(sink = self.index, %stream, error = %e, "consumer not woken");
            }
        }
    }

    pub fn acquire(&self, stream: StreamType, no_wait: bool) -> Result<Frame> {
        if stream == StreamType::Muxer {
            return self.acquire_muxed(no_wait);
        }
        let slot = self.stream(stream)?;
        if slot.raw_disabled.load(Ordering::SeqCst) {
            return Err(CaptureError::not_supported(format!("{stream} disabled on sink {}", self.index)));
        }
        let queue = slot
            .queue
            .lock()
            .clone()
            .ok_or_else(|| CaptureError::not_supported(format!("no {stream} on sink {}", self.index)))?;

        loop {
            if let Some(shared) = queue.try_recv(APP_PORT)? {
                return self.take(&queue, shared.into_parts());
            }
            if no_wait || slot.path_disabled.load(Ordering::SeqCst) {
                return Err(CaptureError::not_found(format!("{stream} frame")));
            }
            // Bounded wait so a path failure racing this call is still seen.
            match queue.recv_timeout(APP_PORT, PATH_CHECK_INTERVAL) {
                Ok(shared) => return self.take(&queue, shared.into_parts()),
                Err(CaptureError::Interrupted) if !queue.is_enabled(APP_PORT) => {
                    return Err(CaptureError::not_found(format!("{stream} frame")));
                }
                Err(CaptureError::Interrupted | CaptureError::Timeout) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn take(&self, queue: &ShareQueue<Frame>, (ticket, mut frame): (Ticket, Frame)) -> Result<Frame> {
        if frame.is_end_of_stream() {
            queue.release(ticket);
            return Err(CaptureError::not_found(format!("{} frame", frame.stream_type)));
        }
        frame.ticket = Some(ticket);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(frame)
    }

    fn acquire_muxed(&self, no_wait: bool) -> Result<Frame> {
        let output = self
            .muxer_output
            .lock()
            .clone()
            .ok_or_else(|| CaptureError::not_supported(format!("no muxer output on sink {}", self.index)))?;
        match muxer::read_output(&output, no_wait) {
            Ok(frame) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(frame)
            }
            Err(CaptureError::Interrupted) => Err(CaptureError::not_found("muxer data")),
            Err(e) => Err(e),
        }
    }

    /// Returns a frame from [`acquire`](SinkSlot::acquire). Frames whose
    /// queue is already gone are ignored.
    pub fn release(&self, frame: Frame) -> Result<()> {
        if frame.stream_type == StreamType::Muxer {
            let output = self.muxer_output.lock().clone();
            return match output {
                Some(output) => output.read_unlock(),
                None => Ok(()),
            };
        }
        let ticket = frame
            .ticket
            .ok_or_else(|| CaptureError::invalid_arg("frame was not acquired from a sink"))?;
        match self.queue(frame.stream_type) {
            Some(queue) => {
                if !queue.release(ticket) {
                    trace!(sink = self.index, "frame still referenced");
                }
            }
            None => debug!(sink = self.index, "release after sink teardown"),
        }
        Ok(())
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SinkEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(tx);
        rx
    }

    pub fn notify(&self, event: SinkEvent) {
        let mut events = self.events.lock();
        if let Some(tx) = events.as_ref() {
            if tx.send(event).is_err() {
                debug!(sink = self.index, "sink event receiver dropped");
                *events = None;
            }
        }
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_delivered: self.delivered.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
            path_errors: self.path_errors.load(Ordering::Relaxed),
        }
    }
}

/// Handle to one sink of a [`Capture`](crate::Capture).
///
/// Obtained from [`Capture::sink_setup`](crate::Capture::sink_setup) or
/// [`Capture::sink`](crate::Capture::sink). Handles are cheap to clone and
/// may be used from any thread; `acquire_frame` is meant for a dedicated
/// consumer thread.
#[derive(Clone)]
pub struct CaptureSink {
    inner: Arc<CaptureInner>,
    index: u8,
}

impl CaptureSink {
    pub(crate) fn new(inner: Arc<CaptureInner>, index: u8) -> Self {
        Self { inner, index }
    }

    /// Sink index.
    pub fn index(&self) -> u8 {
        self.index
    }

    /// Sets how the sink runs.
    ///
    /// Before the capture starts this only records the mode. While running,
    /// enabling starts the sink's paths and muxer, and
    /// [`RunMode::Disable`] stops them after flushing queued frames.
    /// Calling it again with [`RunMode::Oneshot`] re-arms the next video frame.
    pub fn enable(&self, mode: RunMode) -> Result<()> {
        self.inner.sink_enable(self.index, mode)
    }

    /// Excludes a stream from this sink's raw output before start.
    ///
    /// For [`StreamType::Muxer`] the muxer keeps writing but its output is
    /// not cached for `acquire_frame`.
    pub fn disable_stream(&self, stream: StreamType) -> Result<()> {
        self.inner.sink_disable_stream(self.index, stream)
    }

    /// Attaches a muxer to the sink.
    pub fn add_muxer(&self, config: MuxerConfig) -> Result<()> {
        self.inner.sink_add_muxer(self.index, config)
    }

    /// Turns the muxer on or off; it starts and stops with the sink.
    pub fn enable_muxer(&self, enable: bool) -> Result<()> {
        self.inner.sink_enable_muxer(self.index, enable)
    }

    /// Blends an overlay into this sink's video.
    pub fn add_overlay(&self, overlay: impl Overlay + 'static) -> Result<()> {
        self.inner.sink_add_overlay(self.index, Box::new(overlay))
    }

    /// Turns overlay blending on or off.
    pub fn enable_overlay(&self, enable: bool) -> Result<()> {
        self.inner.sink_enable_overlay(self.index, enable)
    }

    /// Sets the encoder bitrate of one stream.
    pub fn set_bitrate(&self, stream: StreamType, bps: u32) -> Result<()> {
        self.inner.sink_set_bitrate(self.index, stream, bps)
    }

    /// Builds this sink's pipeline for `stream` from named stages before
    /// start, replacing the automatic one.
    pub fn build_pipeline(&self, stream: StreamType, stages: &[&str]) -> Result<()> {
        self.inner.sink_build_pipeline(self.index, stream, stages)
    }

    /// Registers a stage usable by [`build_pipeline`](Self::build_pipeline)
    /// and the automatic builders; a registered name shadows a built-in one.
    pub fn register_stage(&self, stream: StreamType, name: &str, factory: StageFactory) -> Result<()> {
        self.inner.register_stage(stream, name, factory)
    }

    /// Takes the next frame of `stream`.
    ///
    /// Blocks until a frame is queued unless `no_wait` is set. Returns
    /// [`CaptureError::NotFound`] when nothing is queued and `no_wait` is set,
    /// or once the path has failed or finished and its queue is drained.
    pub fn acquire_frame(&self, stream: StreamType, no_wait: bool) -> Result<Frame> {
        self.inner.slot(self.index)?.acquire(stream, no_wait)
    }

    /// Hands back a frame from [`acquire_frame`](Self::acquire_frame).
    pub fn release_frame(&self, frame: Frame) -> Result<()> {
        self.inner.slot(self.index)?.release(frame)
    }

    /// Subscribes to this sink's path events. A new subscription replaces
    /// the previous one.
    pub fn events(&self) -> Result<mpsc::UnboundedReceiver<SinkEvent>> {
        Ok(self.inner.slot(self.index)?.subscribe())
    }

    /// Frame counters of this sink.
    pub fn stats(&self) -> Result<CaptureStats> {
        Ok(self.inner.slot(self.index)?.stats())
    }
}

impl std::fmt::Debug for CaptureSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureSink")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prepared(slot: &SinkSlot, stream: StreamType) -> FrameQueue {
        let queue: FrameQueue = Arc::new(ShareQueue::new(2, 4, |_frame: Frame| {}));
        queue.enable(APP_PORT, true).unwrap();
        slot.set_queue(stream, Some(queue.clone())).unwrap();
        slot.set_disabled(false);
        queue
    }

    #[test]
    fn test_disabled_sink_refuses_frames() {
        let slot = SinkSlot::new(0);
        let err = slot
            .deliver(StreamType::Audio, Frame::new(StreamType::Audio, 0, vec![1]))
            .unwrap_err();
        assert!(err.is_not_supported());
    }

    #[test]
    fn test_acquire_and_release() {
        let slot = SinkSlot::new(0);
        let queue = prepared(&slot, StreamType::Audio);
        slot.deliver(StreamType::Audio, Frame::new(StreamType::Audio, 20, vec![1, 2]))
            .unwrap();

        let frame = slot.acquire(StreamType::Audio, true).unwrap();
        assert_eq!(frame.pts, 20);
        assert_eq!(queue.in_flight(), 1);
        slot.release(frame).unwrap();
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(slot.stats().frames_delivered, 1);

        assert!(slot.acquire(StreamType::Audio, true).unwrap_err().is_not_found());
    }

    #[test]
    fn test_failed_path_drains_then_not_found() {
        let slot = SinkSlot::new(1);
        let queue = prepared(&slot, StreamType::Video);
        for pts in [0, 33] {
            slot.deliver(StreamType::Video, Frame::new(StreamType::Video, pts, vec![0]))
                .unwrap();
        }
        slot.fail_path(StreamType::Video, true);

        // Buffered frames first, then the blocking call sees the end.
        for pts in [0, 33] {
            let frame = slot.acquire(StreamType::Video, false).unwrap();
            assert_eq!(frame.pts, pts);
            slot.release(frame).unwrap();
        }
        assert!(slot.acquire(StreamType::Video, false).unwrap_err().is_not_found());
        assert!(slot.acquire(StreamType::Video, false).unwrap_err().is_not_found());
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(slot.stats().path_errors, 1);
    }

    #[test]
    fn test_blocked_consumer_woken_by_disable() {
        let slot = Arc::new(SinkSlot::new(0));
        let queue = prepared(&slot, StreamType::Audio);
        let consumer = {
            let slot = slot.clone();
            std::thread::spawn(move || slot.acquire(StreamType::Audio, false))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        queue.enable(APP_PORT, false).unwrap();
        assert!(consumer.join().unwrap().unwrap_err().is_not_found());
    }

    #[test]
    fn test_oneshot_consumer_woken_by_path_failure() {
        let slot = Arc::new(SinkSlot::new(0));
        let queue = prepared(&slot, StreamType::Video);
        queue.enable_once(APP_PORT, true).unwrap();
        slot.deliver(StreamType::Video, Frame::new(StreamType::Video, 0, vec![0]))
            .unwrap();
        let frame = slot.acquire(StreamType::Video, false).unwrap();
        slot.release(frame).unwrap();

        let consumer = {
            let slot = slot.clone();
            std::thread::spawn(move || slot.acquire(StreamType::Video, false))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        slot.fail_path(StreamType::Video, true);

        let started = std::time::Instant::now();
        assert!(consumer.join().unwrap().unwrap_err().is_not_found());
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn test_raw_stream_disabled() {
        let slot = SinkSlot::new(2);
        prepared(&slot, StreamType::Video);
        slot.set_raw_disabled(StreamType::Video).unwrap();
        assert!(slot
            .acquire(StreamType::Video, true)
            .unwrap_err()
            .is_not_supported());
    }

    #[test]
    fn test_release_without_ticket_rejected() {
        let slot = SinkSlot::new(0);
        let err = slot
            .release(Frame::new(StreamType::Audio, 0, vec![1]))
            .unwrap_err();
        assert!(matches!(err, CaptureError::InvalidArg { .. }));
    }

    #[tokio::test]
    async fn test_events_reach_subscriber() {
        let slot = SinkSlot::new(0);
        let mut rx = slot.subscribe();
        slot.notify(SinkEvent::Started(StreamType::Video));
        assert_eq!(rx.recv().await, Some(SinkEvent::Started(StreamType::Video)));
    }
}
