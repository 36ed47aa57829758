//! Container muxer attached to a sink.
//!
//! A sink's audio and video share queues both feed port 1 into one message
//! queue read by the muxer thread (`muxer_<sink>`). The thread hands each
//! packet to the [`Muxer`] and releases the frame. With streaming on, the
//! muxer's output is cached in a [`DataQueue`] as `[pts: u32 LE][payload]`
//! records that the application reads back as [`StreamType::Muxer`] frames.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{CaptureConfig, ThreadScheduler};
use crate::error::{CaptureError, Result};
use crate::format::{AudioInfo, VideoInfo};
use crate::frame::{Frame, StreamType};
use crate::queue::{DataQueue, MsgQueue, ShareQueue, Shared};

/// Receives each chunk of container data the muxer produces.
pub type MuxerDataCallback = Box<dyn FnMut(&[u8]) -> Result<()> + Send>;

/// A container writer.
///
/// Stream indices returned by `add_*_stream` are passed back with every
/// packet of that stream.
pub trait Muxer: Send {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Opens the container. Called before any stream is added.
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Returns `true` if the muxer can hand out its output through a callback.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Installs the callback receiving container data.
    fn set_data_callback(&mut self, _callback: MuxerDataCallback) -> Result<()> {
        Err(CaptureError::not_supported("muxer streaming"))
    }

    /// Adds an audio stream.
    fn add_audio_stream(&mut self, info: &AudioInfo) -> Result<usize>;

    /// Adds a video stream.
    fn add_video_stream(&mut self, info: &VideoInfo) -> Result<usize>;

    /// Writes one audio packet.
    fn add_audio_packet(&mut self, stream: usize, frame: &Frame) -> Result<()>;

    /// Writes one video packet.
    fn add_video_packet(&mut self, stream: usize, frame: &Frame) -> Result<()>;

    /// Finishes the container.
    fn close(&mut self) -> Result<()>;
}

/// Streams of a sink handed to its muxer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MuxerMask {
    /// Audio only.
    Audio,
    /// Video only.
    Video,
    /// Audio and video.
    #[default]
    All,
}

impl MuxerMask {
    fn has_audio(self) -> bool {
        matches!(self, Self::Audio | Self::All)
    }

    fn has_video(self) -> bool {
        matches!(self, Self::Video | Self::All)
    }
}

/// Muxer settings of one sink.
///
/// # Example
///
/// ```
/// use stream_capture::{MockMuxer, MuxerConfig, MuxerMask};
///
/// let config = MuxerConfig::new(MockMuxer::new())
///     .with_mask(MuxerMask::Video)
///     .with_cache_size(64 * 1024);
/// assert!(config.streaming);
/// ```
pub struct MuxerConfig {
    /// The container writer.
    pub muxer: Box<dyn Muxer>,
    /// Streams to mux.
    pub mask: MuxerMask,
    /// Keep the container output readable as [`StreamType::Muxer`] frames.
    /// Turned off when the muxer cannot stream.
    pub streaming: bool,
    /// Streaming cache in bytes. `None` sizes it from the sink's formats with
    /// [`CaptureConfig::muxer_cache_size`].
    pub cache_size: Option<usize>,
}

impl MuxerConfig {
    /// Muxes every stream with streaming on.
    pub fn new(muxer: impl Muxer + 'static) -> Self {
        Self {
            muxer: Box::new(muxer),
            mask: MuxerMask::All,
            streaming: true,
            cache_size: None,
        }
    }

    /// Sets the muxed streams.
    #[must_use]
    pub fn with_mask(mut self, mask: MuxerMask) -> Self {
        self.mask = mask;
        self
    }

    /// Turns streaming output on or off.
    #[must_use]
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Sets the streaming cache size.
    #[must_use]
    pub fn with_cache_size(mut self, bytes: usize) -> Self {
        self.cache_size = Some(bytes);
        self
    }
}

impl std::fmt::Debug for MuxerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxerConfig")
            .field("muxer", &self.muxer.name())
            .field("mask", &self.mask)
            .field("streaming", &self.streaming)
            .field("cache_size", &self.cache_size)
            .finish()
    }
}

/// Stream indices assigned by the muxer.
#[derive(Debug, Clone, Copy, Default)]
struct MuxerStreams {
    audio: Option<usize>,
    video: Option<usize>,
}

type SharedMuxer = Arc<Mutex<Box<dyn Muxer>>>;
type FrameQueue = Arc<ShareQueue<Frame>>;

struct MuxerWorker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    audio: Option<FrameQueue>,
    video: Option<FrameQueue>,
}

/// The muxer sub-path of one sink.
pub(crate) struct MuxerPath {
    sink: u8,
    muxer: SharedMuxer,
    mask: MuxerMask,
    streaming: bool,
    cache_size: Option<usize>,
    enabled: bool,
    streams: Option<MuxerStreams>,
    input: Arc<MsgQueue<Shared<Frame>>>,
    output: Option<Arc<DataQueue>>,
    cur_pts: Arc<AtomicU32>,
    worker: Option<MuxerWorker>,
}

impl MuxerPath {
    pub fn new(sink: u8, config: MuxerConfig, capture: &CaptureConfig) -> Self {
        // One entry per tracked frame of both share queues.
        let depth = capture.audio_queue_depth + capture.video_queue_depth;
        Self {
            sink,
            muxer: Arc::new(Mutex::new(config.muxer)),
            mask: config.mask,
            streaming: config.streaming,
            cache_size: config.cache_size,
            enabled: true,
            streams: None,
            input: Arc::new(MsgQueue::new(depth)),
            output: None,
            cur_pts: Arc::new(AtomicU32::new(0)),
            worker: None,
        }
    }

    /// Queue to install as port 1 of the sink's share queues.
    pub fn input(&self) -> Arc<MsgQueue<Shared<Frame>>> {
        self.input.clone()
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn disable_streaming(&mut self) {
        self.streaming = false;
    }

    /// Returns `true` once the muxer has a stream for `stream`.
    pub fn accepts(&self, stream: StreamType) -> bool {
        self.streams.is_some_and(|s| match stream {
            StreamType::Audio => s.audio.is_some(),
            StreamType::Video => s.video.is_some(),
            StreamType::Muxer => false,
        })
    }

    /// Streaming output, while the muxer runs with streaming on.
    pub fn output(&self) -> Option<Arc<DataQueue>> {
        self.worker.as_ref().and(self.output.clone())
    }

    /// Opens the muxer and adds the sink's streams.
    ///
    /// Fails with [`CaptureError::NotSupported`] when no stream was accepted.
    pub fn prepare(
        &mut self,
        audio: Option<AudioInfo>,
        video: Option<VideoInfo>,
        config: &CaptureConfig,
    ) -> Result<()> {
        if self.streams.is_some() {
            return Ok(());
        }
        let mut muxer = self.muxer.lock();
        muxer.open()?;

        let mut streams = MuxerStreams::default();
        if let Some(info) = audio.filter(|a| self.mask.has_audio() && !a.is_none()) {
            match muxer.add_audio_stream(&info) {
                Ok(idx) => streams.audio = Some(idx),
                Err(e) => warn!(sink = self.sink, %info, error = %e, "muxer rejected audio"),
            }
        }
        if let Some(info) = video.filter(|v| self.mask.has_video() && !v.is_none()) {
            match muxer.add_video_stream(&info) {
                Ok(idx) => streams.video = Some(idx),
                Err(e) => warn!(sink = self.sink, %info, error = %e, "muxer rejected video"),
            }
        }
        if streams.audio.is_none() && streams.video.is_none() {
            if let Err(e) = muxer.close() {
                debug!(sink = self.sink, error = %e, "closing unused muxer");
            }
            return Err(CaptureError::not_supported(format!(
                "{} accepted no stream",
                muxer.name()
            )));
        }

        if self.streaming && !muxer.supports_streaming() {
            info!(sink = self.sink, muxer = muxer.name(), "muxer cannot stream");
            self.streaming = false;
        }
        self.output = None;
        if self.streaming {
            let video_info = if streams.video.is_some() {
                video.unwrap_or_default()
            } else {
                VideoInfo::default()
            };
            let size = self
                .cache_size
                .unwrap_or_else(|| config.muxer_cache_size(streams.audio.is_some(), &video_info));
            if size > 0 {
                let queue = Arc::new(DataQueue::new(size));
                let writer = queue.clone();
                let pts = self.cur_pts.clone();
                let callback: MuxerDataCallback = Box::new(move |data| {
                    let stamp = pts.load(Ordering::Relaxed).to_le_bytes();
                    writer.push_parts(&[&stamp, data])
                });
                match muxer.set_data_callback(callback) {
                    Ok(()) => self.output = Some(queue),
                    Err(e) => warn!(sink = self.sink, error = %e, "muxer streaming unavailable"),
                }
            }
        }
        info!(
            sink = self.sink,
            muxer = muxer.name(),
            audio = ?streams.audio,
            video = ?streams.video,
            streaming = self.output.is_some(),
            "muxer prepared"
        );
        self.streams = Some(streams);
        Ok(())
    }

    /// Spawns the muxer thread. `audio` and `video` are the share queues
    /// feeding it, used to release frames.
    pub fn start(
        &mut self,
        audio: Option<FrameQueue>,
        video: Option<FrameQueue>,
        scheduler: &ThreadScheduler,
    ) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let streams = self
            .streams
            .ok_or_else(|| CaptureError::invalid_state("muxer not prepared"))?;
        let stop = Arc::new(AtomicBool::new(false));
        let thread = MuxerThread {
            sink: self.sink,
            muxer: self.muxer.clone(),
            streams,
            input: self.input.clone(),
            audio: audio.clone(),
            video: video.clone(),
            cur_pts: self.cur_pts.clone(),
            stop: stop.clone(),
        };
        let handle = scheduler.spawn(&format!("muxer_{}", self.sink), move || thread.run())?;
        self.worker = Some(MuxerWorker {
            stop,
            handle,
            audio,
            video,
        });
        info!(sink = self.sink, "muxer started");
        Ok(())
    }

    /// Stops the thread, releases pending frames and closes the muxer.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            self.close_prepared();
            return;
        };
        worker.stop.store(true, Ordering::SeqCst);
        if let Some(output) = &self.output {
            output.consume_all();
            output.wakeup();
        }
        self.input.wakeup();
        if worker.handle.join().is_err() {
            warn!(sink = self.sink, "muxer thread panicked");
        }
        let mut flushed = 0;
        for shared in self.input.drain() {
            release(worker.audio.as_ref(), worker.video.as_ref(), shared);
            flushed += 1;
        }
        debug!(sink = self.sink, flushed, "muxer input flushed");
        self.close_prepared();
        info!(sink = self.sink, "muxer stopped");
    }

    fn close_prepared(&mut self) {
        if self.streams.take().is_none() {
            return;
        }
        self.output = None;
        if let Err(e) = self.muxer.lock().close() {
            warn!(sink = self.sink, error = %e, "muxer close failed");
        }
    }
}

impl Drop for MuxerPath {
    fn drop(&mut self) {
        self.stop();
    }
}

fn release(audio: Option<&FrameQueue>, video: Option<&FrameQueue>, shared: Shared<Frame>) {
    let queue = match shared.item().stream_type {
        StreamType::Audio => audio,
        StreamType::Video => video,
        StreamType::Muxer => None,
    };
    if let Some(queue) = queue {
        queue.release(shared.ticket());
    }
}

struct MuxerThread {
    sink: u8,
    muxer: SharedMuxer,
    streams: MuxerStreams,
    input: Arc<MsgQueue<Shared<Frame>>>,
    audio: Option<FrameQueue>,
    video: Option<FrameQueue>,
    cur_pts: Arc<AtomicU32>,
    stop: Arc<AtomicBool>,
}

impl MuxerThread {
    fn run(self) {
        debug!(sink = self.sink, "muxer thread running");
        while !self.stop.load(Ordering::SeqCst) {
            let shared = match self.input.recv_timeout(Duration::from_millis(100)) {
                Ok(shared) => shared,
                Err(CaptureError::Timeout | CaptureError::Interrupted) => continue,
                Err(e) => {
                    warn!(sink = self.sink, error = %e, "muxer input failed");
                    break;
                }
            };
            let frame = shared.item();
            if !frame.is_end_of_stream() {
                self.write(frame);
            }
            release(self.audio.as_ref(), self.video.as_ref(), shared);
        }
        debug!(sink = self.sink, "muxer thread exiting");
    }

    fn write(&self, frame: &Frame) {
        self.cur_pts.store(frame.pts, Ordering::Relaxed);
        let mut muxer = self.muxer.lock();
        let result = match (frame.stream_type, self.streams) {
            (StreamType::Audio, MuxerStreams { audio: Some(idx), .. }) => {
                muxer.add_audio_packet(idx, frame)
            }
            (StreamType::Video, MuxerStreams { video: Some(idx), .. }) => {
                muxer.add_video_packet(idx, frame)
            }
            _ => return,
        };
        if let Err(e) = result {
            warn!(sink = self.sink, stream = %frame.stream_type, error = %e, "muxer dropped packet");
        }
    }
}

/// Reads one streaming record as a [`StreamType::Muxer`] frame.
///
/// Returns [`CaptureError::NotFound`] when `no_wait` is set and nothing is
/// cached. The record must be handed back with [`DataQueue::read_unlock`].
pub(crate) fn read_output(output: &DataQueue, no_wait: bool) -> Result<Frame> {
    let record = if no_wait {
        output
            .try_read_lock()?
            .ok_or_else(|| CaptureError::not_found("muxer data"))?
    } else {
        output.read_lock()?
    };
    if record.len() < 4 {
        output.read_unlock()?;
        return Err(CaptureError::internal("truncated muxer record"));
    }
    let pts = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
    Ok(Frame::new(StreamType::Muxer, pts, record.slice(4..)))
}

#[derive(Default)]
struct MockMuxerState {
    opened: usize,
    closed: usize,
    audio_streams: Vec<AudioInfo>,
    video_streams: Vec<VideoInfo>,
    audio_packets: usize,
    video_packets: usize,
}

/// In-memory [`Muxer`] for tests.
///
/// Every packet is echoed to the data callback as one chunk: a stream tag
/// byte (`b'A'` or `b'V'`) followed by the payload. Clones share state.
#[derive(Clone)]
pub struct MockMuxer {
    state: Arc<Mutex<MockMuxerState>>,
    callback: Arc<Mutex<Option<MuxerDataCallback>>>,
    streaming: bool,
    reject_audio: bool,
}

impl MockMuxer {
    /// A streaming muxer accepting audio and video.
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            callback: Arc::default(),
            streaming: true,
            reject_audio: false,
        }
    }

    /// Disables streaming support.
    #[must_use]
    pub fn without_streaming(mut self) -> Self {
        self.streaming = false;
        self
    }

    /// Refuses audio streams.
    #[must_use]
    pub fn reject_audio(mut self) -> Self {
        self.reject_audio = true;
        self
    }

    /// Audio packets written so far.
    pub fn audio_packets(&self) -> usize {
        self.state.lock().audio_packets
    }

    /// Video packets written so far.
    pub fn video_packets(&self) -> usize {
        self.state.lock().video_packets
    }

    /// Streams added since creation, as `(audio, video)`.
    pub fn streams(&self) -> (Vec<AudioInfo>, Vec<VideoInfo>) {
        let state = self.state.lock();
        (state.audio_streams.clone(), state.video_streams.clone())
    }

    /// Times the muxer was opened.
    pub fn open_count(&self) -> usize {
        self.state.lock().opened
    }

    /// Times the muxer was closed.
    pub fn close_count(&self) -> usize {
        self.state.lock().closed
    }

    fn emit(&self, tag: u8, frame: &Frame) -> Result<()> {
        if let Some(callback) = self.callback.lock().as_mut() {
            let mut chunk = Vec::with_capacity(frame.len() + 1);
            chunk.push(tag);
            chunk.extend_from_slice(&frame.data);
            callback(&chunk)?;
        }
        Ok(())
    }
}

impl Default for MockMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl Muxer for MockMuxer {
    fn name(&self) -> &str {
        "mock_muxer"
    }

    fn open(&mut self) -> Result<()> {
        self.state.lock().opened += 1;
        Ok(())
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    fn set_data_callback(&mut self, callback: MuxerDataCallback) -> Result<()> {
        if !self.streaming {
            return Err(CaptureError::not_supported("mock muxer streaming"));
        }
        *self.callback.lock() = Some(callback);
        Ok(())
    }

    fn add_audio_stream(&mut self, info: &AudioInfo) -> Result<usize> {
        if self.reject_audio {
            return Err(CaptureError::not_supported("mock muxer audio"));
        }
        let mut state = self.state.lock();
        state.audio_streams.push(*info);
        Ok(state.audio_streams.len() + state.video_streams.len() - 1)
    }

    fn add_video_stream(&mut self, info: &VideoInfo) -> Result<usize> {
        let mut state = self.state.lock();
        state.video_streams.push(*info);
        Ok(state.audio_streams.len() + state.video_streams.len() - 1)
    }

    fn add_audio_packet(&mut self, _stream: usize, frame: &Frame) -> Result<()> {
        self.state.lock().audio_packets += 1;
        self.emit(b'A', frame)
    }

    fn add_video_packet(&mut self, _stream: usize, frame: &Frame) -> Result<()> {
        self.state.lock().video_packets += 1;
        self.emit(b'V', frame)
    }

    fn close(&mut self) -> Result<()> {
        self.state.lock().closed += 1;
        *self.callback.lock() = None;
        Ok(())
    }
}
