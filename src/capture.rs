//! Capture orchestrator.
//!
//! A [`Capture`] owns the audio and video path managers, up to
//! [`MAX_SINKS`] sinks and the event dispatcher thread. Every control call
//! runs under one lock; frames move on the pipeline, muxer and consumer
//! threads without it.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::builder::CaptureBuilder;
use crate::config::{CaptureConfig, ThreadScheduler, MAX_SINKS};
use crate::error::{CaptureError, Result};
use crate::event::{CaptureEvent, EventCallback, PathEventKind, PathEventReceiver, SinkEvent};
use crate::format::StreamInfo;
use crate::frame::{Frame, StreamType};
use crate::path::PathManager;
use crate::pipeline::builder::PipelineBuilder;
use crate::pipeline::stage::StageFactory;
use crate::pipeline::task::FrameHandler;
use crate::pipeline::SourceHandle;
use crate::queue::ShareQueue;
use crate::sink::{
    CaptureSink, CaptureStats, MuxerConfig, MuxerPath, RunMode, SinkConfig, SinkSlot, APP_PORT,
    MUXER_PORT,
};
use crate::source::{Overlay, SharedOverlay};
use crate::sync::{CaptureClock, SyncMode};

const STREAMS: [StreamType; 2] = [StreamType::Audio, StreamType::Video];

#[derive(Default)]
struct SinkControl {
    setup: bool,
    config: SinkConfig,
    mode: RunMode,
    muxer: Option<MuxerPath>,
}

impl SinkControl {
    fn has(&self, stream: StreamType) -> bool {
        match stream {
            StreamType::Audio => self.config.audio.is_some(),
            StreamType::Video => self.config.video.is_some(),
            StreamType::Muxer => self.muxer.is_some(),
        }
    }
}

struct Control {
    audio: Option<PathManager>,
    video: Option<PathManager>,
    sources: Vec<SourceHandle>,
    overlays: Vec<SharedOverlay>,
    sinks: [SinkControl; MAX_SINKS],
    clock: Arc<CaptureClock>,
    started: bool,
    closed: bool,
    dispatcher: Option<JoinHandle<()>>,
}

impl Control {
    fn manager(&mut self, stream: StreamType) -> Result<&mut PathManager> {
        let manager = match stream {
            StreamType::Audio => self.audio.as_mut(),
            StreamType::Video => self.video.as_mut(),
            StreamType::Muxer => {
                return Err(CaptureError::invalid_arg("muxer has no path manager"));
            }
        };
        manager.ok_or_else(|| CaptureError::not_supported(format!("capture has no {stream} source")))
    }

    fn sink(&mut self, index: u8) -> Result<&mut SinkControl> {
        self.sinks
            .get_mut(usize::from(index))
            .filter(|s| s.setup)
            .ok_or_else(|| CaptureError::not_found(format!("sink {index}")))
    }
}

pub(crate) struct CaptureInner {
    control: Mutex<Control>,
    slots: [Arc<SinkSlot>; MAX_SINKS],
    callback: Option<EventCallback>,
    config: CaptureConfig,
    scheduler: ThreadScheduler,
}

/// A capture session.
///
/// Created with [`Capture::builder`]. Set up sinks, enable them, then
/// [`start`](Capture::start). Dropping the capture closes it.
///
/// # Example
///
/// ```
/// use stream_capture::format::{AudioInfo, FormatId};
/// use stream_capture::source::MockAudioSource;
/// use stream_capture::{Capture, RunMode, SinkConfig, StreamType};
///
/// let source = MockAudioSource::new(AudioInfo::new(FormatId::PCM, 16000, 1, 16));
/// let capture = Capture::builder().audio_source(source).open().unwrap();
///
/// let sink = capture
///     .sink_setup(0, SinkConfig::new().with_audio(AudioInfo::new(FormatId::G711A, 8000, 1, 16)))
///     .unwrap();
/// sink.enable(RunMode::Always).unwrap();
/// capture.start().unwrap();
///
/// let frame = sink.acquire_frame(StreamType::Audio, false).unwrap();
/// assert!(!frame.is_empty());
/// sink.release_frame(frame).unwrap();
///
/// capture.stop().unwrap();
/// capture.close().unwrap();
/// ```
pub struct Capture {
    inner: Arc<CaptureInner>,
}

impl Capture {
    /// Returns a builder for configuring a capture.
    pub fn builder() -> CaptureBuilder {
        CaptureBuilder::new()
    }

    /// Opens the sources and spawns the event dispatcher.
    pub(crate) fn open(
        audio: Option<Box<dyn PipelineBuilder>>,
        video: Option<Box<dyn PipelineBuilder>>,
        config: CaptureConfig,
        scheduler: ThreadScheduler,
        callback: Option<EventCallback>,
    ) -> Result<Self> {
        if audio.is_none() && video.is_none() {
            return Err(CaptureError::invalid_arg("capture needs an audio or video source"));
        }
        for (builder, stream) in [(&audio, StreamType::Audio), (&video, StreamType::Video)] {
            if let Some(builder) = builder {
                if builder.stream_type() != stream {
                    return Err(CaptureError::invalid_arg(format!(
                        "{} pipeline builder given as {stream}",
                        builder.stream_type()
                    )));
                }
            }
        }

        let mut sources = Vec::new();
        for builder in audio.iter().chain(video.iter()) {
            let source = builder.source();
            if let Err(e) = open_source(&source) {
                sources.iter().for_each(close_source);
                return Err(e);
            }
            sources.push(source);
        }

        let mode = config.sync_mode.unwrap_or(if audio.is_some() {
            SyncMode::Audio
        } else {
            SyncMode::System
        });
        let clock = Arc::new(CaptureClock::new(mode));
        let slots: [Arc<SinkSlot>; MAX_SINKS] =
            std::array::from_fn(|i| Arc::new(SinkSlot::new(i as u8)));

        let (tx, rx) = mpsc::unbounded_channel();
        let manager = |builder: Box<dyn PipelineBuilder>| {
            let stream = builder.stream_type();
            PathManager::new(
                builder,
                deliver_to(&slots, stream),
                tx.clone(),
                clock.clone(),
                scheduler.clone(),
            )
        };
        let audio = audio.map(&manager);
        let video = video.map(&manager);
        drop(tx);

        let dispatcher = {
            let slots = slots.clone();
            let callback = callback.clone();
            scheduler.spawn("capture_event", move || {
                dispatch_events(rx, &slots, callback.as_ref());
            })
        };
        let dispatcher = match dispatcher {
            Ok(handle) => handle,
            Err(e) => {
                sources.iter().for_each(close_source);
                return Err(e);
            }
        };

        info!(
            audio = audio.is_some(),
            video = video.is_some(),
            sync = ?mode,
            "capture opened"
        );
        Ok(Self {
            inner: Arc::new(CaptureInner {
                control: Mutex::new(Control {
                    audio,
                    video,
                    sources,
                    overlays: Vec::new(),
                    sinks: Default::default(),
                    clock,
                    started: false,
                    closed: false,
                    dispatcher: Some(dispatcher),
                }),
                slots,
                callback,
                config,
                scheduler,
            }),
        })
    }

    /// Configures sink `index` and returns its handle.
    ///
    /// Allowed until the capture starts; setting up a sink again replaces
    /// its formats.
    pub fn sink_setup(&self, index: u8, config: SinkConfig) -> Result<CaptureSink> {
        self.inner.sink_setup(index, config)?;
        Ok(CaptureSink::new(self.inner.clone(), index))
    }

    /// Returns the handle of a sink already set up.
    pub fn sink(&self, index: u8) -> Result<CaptureSink> {
        self.inner.lock()?.sink(index)?;
        Ok(CaptureSink::new(self.inner.clone(), index))
    }

    /// Starts every enabled sink.
    ///
    /// Video paths start before audio. A path that cannot start is reported
    /// through an error event and does not keep the others from starting.
    pub fn start(&self) -> Result<()> {
        self.inner.start()
    }

    /// Stops every sink, flushing queued frames first.
    pub fn stop(&self) -> Result<()> {
        self.inner.stop()
    }

    /// Stops the capture and closes the sources.
    pub fn close(self) -> Result<()> {
        self.inner.close()
    }

    /// Returns `true` between `start` and `stop`.
    pub fn is_started(&self) -> bool {
        self.inner.control.lock().started
    }

    /// Frame counters summed over every sink.
    pub fn stats(&self) -> CaptureStats {
        self.inner
            .slots
            .iter()
            .fold(CaptureStats::default(), |acc, slot| acc + slot.stats())
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        if let Err(e) = self.inner.close() {
            warn!(error = %e, "capture close on drop failed");
        }
    }
}

impl std::fmt::Debug for Capture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capture")
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

fn open_source(source: &SourceHandle) -> Result<()> {
    match source {
        SourceHandle::Audio(s) => s.lock().open(),
        SourceHandle::Video(s) => s.lock().open(),
    }
}

fn close_source(source: &SourceHandle) {
    let result = match source {
        SourceHandle::Audio(s) => s.lock().close(),
        SourceHandle::Video(s) => s.lock().close(),
    };
    if let Err(e) = result {
        warn!(stream = %source.stream_type(), error = %e, "source close failed");
    }
}

fn deliver_to(slots: &[Arc<SinkSlot>; MAX_SINKS], stream: StreamType) -> FrameHandler {
    let slots = slots.clone();
    Arc::new(move |path, frame: Frame| {
        slots
            .get(usize::from(path))
            .ok_or_else(|| CaptureError::invalid_arg(format!("no sink {path}")))?
            .deliver(stream, frame)
    })
}

/// Applies path events to the sinks and forwards them to listeners until
/// every path manager is gone.
fn dispatch_events(
    mut rx: PathEventReceiver,
    slots: &[Arc<SinkSlot>; MAX_SINKS],
    callback: Option<&EventCallback>,
) {
    while let Some(event) = rx.blocking_recv() {
        let Some(slot) = slots.get(usize::from(event.path)) else {
            continue;
        };
        let stream = event.stream;
        let (public, local) = match event.kind {
            PathEventKind::PipelineBuilt => {
                let built = match stream {
                    StreamType::Audio => CaptureEvent::AudioPipelineBuilt,
                    _ => CaptureEvent::VideoPipelineBuilt,
                };
                (Some(built), None)
            }
            PathEventKind::Started => (None, Some(SinkEvent::Started(stream))),
            PathEventKind::Stopped => (None, Some(SinkEvent::Stopped(stream))),
            PathEventKind::Error => {
                slot.fail_path(stream, true);
                (
                    Some(CaptureEvent::Error {
                        path: Some(event.path),
                    }),
                    Some(SinkEvent::Error(stream)),
                )
            }
            PathEventKind::Finished => {
                slot.fail_path(stream, false);
                (
                    Some(CaptureEvent::Finished { path: event.path }),
                    Some(SinkEvent::Finished(stream)),
                )
            }
        };
        debug!(sink = event.path, %stream, kind = ?event.kind, "path event");
        if let Some(local) = local {
            slot.notify(local);
        }
        if let (Some(public), Some(callback)) = (public, callback) {
            callback(public);
        }
    }
    debug!("event dispatcher exiting");
}

impl CaptureInner {
    fn lock(&self) -> Result<MutexGuard<'_, Control>> {
        let ctl = self.control.lock();
        if ctl.closed {
            return Err(CaptureError::invalid_state("capture closed"));
        }
        Ok(ctl)
    }

    fn emit(&self, event: CaptureEvent) {
        if let Some(callback) = &self.callback {
            callback(event);
        }
    }

    pub(crate) fn slot(&self, index: u8) -> Result<&Arc<SinkSlot>> {
        self.slots
            .get(usize::from(index))
            .ok_or_else(|| CaptureError::invalid_arg(format!("sink {index} out of range")))
    }

    fn sink_setup(&self, index: u8, config: SinkConfig) -> Result<()> {
        self.slot(index)?;
        let mut ctl = self.lock()?;
        if ctl.started {
            return Err(CaptureError::invalid_state("sinks are set up before start"));
        }
        if config.audio.is_none() && config.video.is_none() {
            return Err(CaptureError::invalid_arg(format!("sink {index} has no stream")));
        }
        if let Some(info) = config.audio {
            ctl.manager(StreamType::Audio)?
                .add_path(index, StreamInfo::Audio(info))?;
        }
        if let Some(info) = config.video {
            ctl.manager(StreamType::Video)?
                .add_path(index, StreamInfo::Video(info))?;
        }
        let sink = &mut ctl.sinks[usize::from(index)];
        sink.setup = true;
        sink.config = config;
        info!(sink = index, audio = ?config.audio, video = ?config.video, "sink set up");
        Ok(())
    }

    pub(crate) fn sink_enable(&self, index: u8, mode: RunMode) -> Result<()> {
        let mut ctl = self.lock()?;
        let sink = ctl.sink(index)?;
        let previous = sink.mode;
        sink.mode = mode;
        debug!(sink = index, ?previous, ?mode, "sink run mode");

        if !ctl.started {
            return self.record_paths(&mut ctl, index, mode);
        }
        if mode == RunMode::Disable {
            if previous != RunMode::Disable {
                self.disable_sink(&mut ctl, index);
            }
            return Ok(());
        }
        self.enable_sink(&mut ctl, index, mode)
    }

    /// Stores the wanted path state for when the capture starts.
    fn record_paths(&self, ctl: &mut Control, index: u8, mode: RunMode) -> Result<()> {
        let enable = mode != RunMode::Disable;
        for stream in STREAMS {
            if !ctl.sinks[usize::from(index)].has(stream) {
                continue;
            }
            let manager = ctl.manager(stream)?;
            if stream == StreamType::Video {
                manager.set_run_once(index, mode == RunMode::Oneshot)?;
            }
            manager.enable_path(index, enable)?;
        }
        Ok(())
    }

    fn enable_sink(&self, ctl: &mut Control, index: u8, mode: RunMode) -> Result<()> {
        let idx = usize::from(index);
        let slot = &self.slots[idx];
        slot.set_disabled(false);
        for stream in STREAMS {
            if !ctl.sinks[idx].has(stream) {
                continue;
            }
            slot.set_path_disabled(stream, false);
            if let Some(queue) = slot.queue(stream) {
                if !slot.is_raw_disabled(stream) {
                    queue.enable(APP_PORT, true)?;
                    if stream == StreamType::Video {
                        queue.enable_once(APP_PORT, mode == RunMode::Oneshot)?;
                    }
                }
            }
        }

        let mut result = Ok(());
        for stream in [StreamType::Video, StreamType::Audio] {
            if !ctl.sinks[idx].has(stream) {
                continue;
            }
            let manager = ctl.manager(stream)?;
            if stream == StreamType::Video {
                manager.set_run_once(index, mode == RunMode::Oneshot)?;
            }
            if let Err(e) = manager.enable_path(index, true) {
                warn!(sink = index, %stream, error = %e, "path failed to start");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.start_muxer(ctl, index);
        info!(sink = index, ?mode, "sink enabled");
        result
    }

    /// Stops feeding a sink: refuse new frames, stop the muxer, flush what
    /// is queued, then stop the paths.
    fn disable_sink(&self, ctl: &mut Control, index: u8) {
        let idx = usize::from(index);
        let slot = &self.slots[idx];
        slot.set_disabled(true);
        self.stop_muxer(ctl, index);
        self.flush_sink(index);
        for stream in [StreamType::Video, StreamType::Audio] {
            if !ctl.sinks[idx].has(stream) {
                continue;
            }
            let result = ctl
                .manager(stream)
                .and_then(|manager| manager.enable_path(index, false));
            if let Err(e) = result {
                warn!(sink = index, %stream, error = %e, "path failed to stop");
            }
        }
        info!(sink = index, "sink disabled");
    }

    fn flush_sink(&self, index: u8) {
        let slot = &self.slots[usize::from(index)];
        for stream in STREAMS {
            let Some(queue) = slot.queue(stream) else {
                continue;
            };
            let flushed = queue.recv_all();
            if let Err(e) = queue.enable(APP_PORT, false) {
                warn!(sink = index, %stream, error = %e, "failed to close sink port");
            }
            debug!(sink = index, %stream, flushed, "sink queue flushed");
        }
    }

    /// Creates the share queues of a sink for a new run.
    fn prepare_sink(&self, ctl: &Control, index: u8) -> Result<()> {
        let idx = usize::from(index);
        let sink = &ctl.sinks[idx];
        let slot = &self.slots[idx];
        let enabled = sink.mode != RunMode::Disable;
        slot.set_disabled(!enabled);
        for stream in STREAMS {
            if !sink.has(stream) {
                continue;
            }
            let depth = match stream {
                StreamType::Audio => self.config.audio_queue_depth,
                _ => self.config.video_queue_depth,
            };
            let queue = Arc::new(
                ShareQueue::new(2, depth, |_frame: Frame| {})
                    .with_add_timeout(self.config.share_add_timeout),
            );
            if let Some(muxer) = &sink.muxer {
                queue.set_port_queue(MUXER_PORT, muxer.input())?;
            }
            if enabled && !slot.is_raw_disabled(stream) {
                queue.enable(APP_PORT, true)?;
                if stream == StreamType::Video && sink.mode == RunMode::Oneshot {
                    queue.enable_once(APP_PORT, true)?;
                }
            }
            slot.set_path_disabled(stream, false);
            slot.set_queue(stream, Some(queue))?;
        }
        debug!(sink = index, mode = ?sink.mode, "sink prepared");
        Ok(())
    }

    /// Prepares and starts the muxer of a sink, then opens its ports.
    fn start_muxer(&self, ctl: &mut Control, index: u8) {
        let idx = usize::from(index);
        let slot = &self.slots[idx];
        let sink = &mut ctl.sinks[idx];
        let config = sink.config;
        let Some(muxer) = sink.muxer.as_mut() else {
            return;
        };
        if !muxer.is_enabled() || muxer.is_running() {
            return;
        }
        let audio = slot.queue(StreamType::Audio);
        let video = slot.queue(StreamType::Video);
        if let Err(e) = muxer.prepare(config.audio, config.video, &self.config) {
            warn!(sink = index, error = %e, "muxer not prepared");
            return;
        }
        if let Err(e) = muxer.start(audio.clone(), video.clone(), &self.scheduler) {
            warn!(sink = index, error = %e, "muxer not started");
            muxer.stop();
            return;
        }
        for (stream, queue) in [(StreamType::Audio, audio), (StreamType::Video, video)] {
            let Some(queue) = queue else {
                continue;
            };
            if muxer.accepts(stream) {
                if let Err(e) = queue.enable(MUXER_PORT, true) {
                    warn!(sink = index, %stream, error = %e, "muxer port not enabled");
                }
            }
        }
        slot.set_muxer_output(muxer.output());
    }

    fn stop_muxer(&self, ctl: &mut Control, index: u8) {
        let idx = usize::from(index);
        let Some(muxer) = ctl.sinks[idx].muxer.as_mut() else {
            return;
        };
        let slot = &self.slots[idx];
        slot.set_muxer_output(None);
        for stream in STREAMS {
            if let Some(queue) = slot.queue(stream) {
                if let Err(e) = queue.enable(MUXER_PORT, false) {
                    debug!(sink = index, %stream, error = %e, "muxer port not disabled");
                }
            }
        }
        muxer.stop();
    }

    pub(crate) fn sink_disable_stream(&self, index: u8, stream: StreamType) -> Result<()> {
        let mut ctl = self.lock()?;
        if ctl.started {
            return Err(CaptureError::invalid_state("streams are disabled before start"));
        }
        let sink = ctl.sink(index)?;
        match stream {
            StreamType::Muxer => sink
                .muxer
                .as_mut()
                .ok_or_else(|| CaptureError::not_supported(format!("sink {index} has no muxer")))?
                .disable_streaming(),
            _ => {
                if !sink.has(stream) {
                    return Err(CaptureError::not_supported(format!("sink {index} has no {stream}")));
                }
                self.slots[usize::from(index)].set_raw_disabled(stream)?;
            }
        }
        info!(sink = index, %stream, "stream disabled");
        Ok(())
    }

    pub(crate) fn sink_add_muxer(&self, index: u8, config: MuxerConfig) -> Result<()> {
        let mut ctl = self.lock()?;
        if ctl.started {
            return Err(CaptureError::invalid_state("muxers are added before start"));
        }
        let sink = ctl.sink(index)?;
        if sink.muxer.is_some() {
            return Err(CaptureError::invalid_state(format!("sink {index} already has a muxer")));
        }
        debug!(sink = index, ?config, "muxer added");
        sink.muxer = Some(MuxerPath::new(index, config, &self.config));
        Ok(())
    }

    pub(crate) fn sink_enable_muxer(&self, index: u8, enable: bool) -> Result<()> {
        let mut ctl = self.lock()?;
        let started = ctl.started;
        let sink = ctl.sink(index)?;
        let running = sink.mode != RunMode::Disable;
        sink.muxer
            .as_mut()
            .ok_or_else(|| CaptureError::not_supported(format!("sink {index} has no muxer")))?
            .set_enabled(enable);
        if started && running {
            if enable {
                self.start_muxer(&mut ctl, index);
            } else {
                self.stop_muxer(&mut ctl, index);
            }
        }
        Ok(())
    }

    pub(crate) fn sink_add_overlay(&self, index: u8, mut overlay: Box<dyn Overlay>) -> Result<()> {
        let mut ctl = self.lock()?;
        if !ctl.sink(index)?.has(StreamType::Video) {
            return Err(CaptureError::not_supported(format!("sink {index} has no video")));
        }
        overlay.open()?;
        let shared: SharedOverlay = Arc::new(Mutex::new(overlay));
        ctl.manager(StreamType::Video)?
            .add_overlay(index, shared.clone())?;
        ctl.overlays.push(shared);
        Ok(())
    }

    pub(crate) fn sink_enable_overlay(&self, index: u8, enable: bool) -> Result<()> {
        let mut ctl = self.lock()?;
        ctl.sink(index)?;
        ctl.manager(StreamType::Video)?
            .enable_overlay(index, enable)
    }

    pub(crate) fn sink_set_bitrate(&self, index: u8, stream: StreamType, bps: u32) -> Result<()> {
        let mut ctl = self.lock()?;
        if !ctl.sink(index)?.has(stream) {
            return Err(CaptureError::not_supported(format!("sink {index} has no {stream}")));
        }
        ctl.manager(stream)?.set_bitrate(index, bps)
    }

    pub(crate) fn sink_build_pipeline(&self, index: u8, stream: StreamType, stages: &[&str]) -> Result<()> {
        let mut ctl = self.lock()?;
        if ctl.started {
            return Err(CaptureError::invalid_state("pipelines are built before start"));
        }
        if !ctl.sink(index)?.has(stream) {
            return Err(CaptureError::not_supported(format!("sink {index} has no {stream}")));
        }
        ctl.manager(stream)?.build_pipeline(index, stages)
    }

    pub(crate) fn register_stage(&self, stream: StreamType, name: &str, factory: StageFactory) -> Result<()> {
        self.lock()?.manager(stream)?.register_stage(name, factory)
    }

    fn start(&self) -> Result<()> {
        let mut ctl = self.lock()?;
        if ctl.started {
            return Ok(());
        }
        ctl.clock.start();
        ctl.started = true;
        for index in 0..MAX_SINKS as u8 {
            if ctl.sinks[usize::from(index)].setup {
                self.prepare_sink(&ctl, index)?;
            }
        }

        // Video negotiation and start take longer; begin with it.
        for stream in [StreamType::Video, StreamType::Audio] {
            if let Ok(manager) = ctl.manager(stream) {
                if let Err(e) = manager.start() {
                    warn!(%stream, error = %e, "stream failed to start");
                }
            }
        }
        for index in 0..MAX_SINKS as u8 {
            let sink = &ctl.sinks[usize::from(index)];
            if sink.setup && sink.mode != RunMode::Disable {
                self.start_muxer(&mut ctl, index);
            }
        }
        drop(ctl);
        info!("capture started");
        self.emit(CaptureEvent::Started);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut ctl = self.control.lock();
        if !ctl.started {
            return Ok(());
        }
        for index in 0..MAX_SINKS as u8 {
            if !ctl.sinks[usize::from(index)].setup {
                continue;
            }
            self.slots[usize::from(index)].set_disabled(true);
            self.stop_muxer(&mut ctl, index);
            self.flush_sink(index);
        }

        let mut result = Ok(());
        for stream in [StreamType::Video, StreamType::Audio] {
            if let Ok(manager) = ctl.manager(stream) {
                if let Err(e) = manager.stop() {
                    warn!(%stream, error = %e, "stream failed to stop");
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
        }
        ctl.clock.stop();
        for slot in &self.slots {
            for stream in STREAMS {
                if let Err(e) = slot.set_queue(stream, None) {
                    debug!(error = %e, "sink queue not cleared");
                }
            }
        }
        ctl.started = false;
        drop(ctl);
        info!("capture stopped");
        self.emit(CaptureEvent::Stopped);
        result
    }

    fn close(&self) -> Result<()> {
        let result = self.stop();
        let mut ctl = self.control.lock();
        if ctl.closed {
            return result;
        }
        ctl.closed = true;
        for sink in &mut ctl.sinks {
            sink.muxer = None;
        }
        // Dropping the path managers closes the event channel.
        ctl.audio = None;
        ctl.video = None;
        let dispatcher = ctl.dispatcher.take();
        let sources = std::mem::take(&mut ctl.sources);
        let overlays = std::mem::take(&mut ctl.overlays);
        drop(ctl);

        if let Some(handle) = dispatcher {
            if handle.join().is_err() {
                warn!("event dispatcher panicked");
            }
        }
        for overlay in overlays {
            if let Err(e) = overlay.lock().close() {
                warn!(error = %e, "overlay close failed");
            }
        }
        sources.iter().for_each(close_source);
        info!("capture closed");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{AudioInfo, FormatId, VideoInfo};
    use crate::sink::MockMuxer;
    use crate::source::{MockAudioSource, MockVideoSource};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn pcm16k() -> AudioInfo {
        AudioInfo::new(FormatId::PCM, 16000, 1, 16)
    }

    fn rgb() -> VideoInfo {
        VideoInfo::new(FormatId::RGB565, 64, 48, 30)
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_open_needs_a_source() {
        let err = Capture::builder().open().unwrap_err();
        assert!(matches!(err, CaptureError::InvalidArg { .. }));
    }

    #[test]
    fn test_sink_setup_rules() {
        let capture = Capture::builder()
            .audio_source(MockAudioSource::new(pcm16k()))
            .open()
            .unwrap();
        assert!(capture.sink(0).unwrap_err().is_not_found());
        assert!(capture.sink_setup(3, SinkConfig::new().with_audio(pcm16k())).is_err());
        // No video source.
        let err = capture
            .sink_setup(0, SinkConfig::new().with_video(rgb()))
            .unwrap_err();
        assert!(err.is_not_supported());

        capture
            .sink_setup(0, SinkConfig::new().with_audio(pcm16k()))
            .unwrap();
        capture.start().unwrap();
        let err = capture
            .sink_setup(1, SinkConfig::new().with_audio(pcm16k()))
            .unwrap_err();
        assert!(matches!(err, CaptureError::InvalidState { .. }));
    }

    #[test]
    fn test_audio_frames_and_events() {
        let mock = MockAudioSource::new(pcm16k()).realtime(false).frame_limit(3);
        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = events.clone();
        let capture = Capture::builder()
            .audio_source(mock.clone())
            .on_event(move |event| seen.lock().push(event))
            .open()
            .unwrap();
        let sink = capture
            .sink_setup(0, SinkConfig::new().with_audio(pcm16k()))
            .unwrap();
        sink.enable(RunMode::Always).unwrap();
        capture.start().unwrap();

        let mut frames = 0;
        loop {
            match sink.acquire_frame(StreamType::Audio, false) {
                Ok(frame) => {
                    frames += 1;
                    sink.release_frame(frame).unwrap();
                }
                Err(e) => {
                    assert!(e.is_not_found());
                    break;
                }
            }
        }
        assert_eq!(frames, 3);
        assert!(wait_for(|| events
            .lock()
            .contains(&CaptureEvent::Finished { path: 0 })));
        capture.stop().unwrap();
        capture.close().unwrap();
        assert!(mock.is_closed());

        let events = events.lock();
        assert!(events.contains(&CaptureEvent::AudioPipelineBuilt));
        assert!(events.contains(&CaptureEvent::Started));
        assert_eq!(events.last(), Some(&CaptureEvent::Stopped));
    }

    #[test]
    fn test_disabled_sink_gets_nothing() {
        let mock = MockAudioSource::new(pcm16k()).realtime(false);
        let capture = Capture::builder().audio_source(mock.clone()).open().unwrap();
        let sink = capture
            .sink_setup(1, SinkConfig::new().with_audio(pcm16k()))
            .unwrap();
        capture.start().unwrap();
        assert!(!mock.is_started());
        assert!(sink
            .acquire_frame(StreamType::Audio, true)
            .unwrap_err()
            .is_not_found());

        sink.enable(RunMode::Always).unwrap();
        assert!(mock.is_started());
        let frame = sink.acquire_frame(StreamType::Audio, false).unwrap();
        sink.release_frame(frame).unwrap();

        sink.enable(RunMode::Disable).unwrap();
        assert!(!mock.is_started());
        assert!(sink
            .acquire_frame(StreamType::Audio, true)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn test_video_oneshot_rearms() {
        let mock = MockVideoSource::new(rgb());
        let capture = Capture::builder().video_source(mock).open().unwrap();
        let sink = capture
            .sink_setup(0, SinkConfig::new().with_video(rgb()))
            .unwrap();
        sink.enable(RunMode::Oneshot).unwrap();
        capture.start().unwrap();

        let frame = sink.acquire_frame(StreamType::Video, false).unwrap();
        sink.release_frame(frame).unwrap();
        std::thread::sleep(Duration::from_millis(150));
        assert!(sink
            .acquire_frame(StreamType::Video, true)
            .unwrap_err()
            .is_not_found());

        sink.enable(RunMode::Oneshot).unwrap();
        let frame = sink.acquire_frame(StreamType::Video, false).unwrap();
        sink.release_frame(frame).unwrap();
    }

    #[test]
    fn test_muxer_streaming_output() {
        let muxer = MockMuxer::new();
        let capture = Capture::builder()
            .video_source(MockVideoSource::new(rgb()).realtime(false))
            .open()
            .unwrap();
        let h264 = VideoInfo::new(FormatId::H264, 64, 48, 30);
        let sink = capture
            .sink_setup(0, SinkConfig::new().with_video(h264))
            .unwrap();
        sink.add_muxer(MuxerConfig::new(muxer.clone()).with_cache_size(64 * 1024))
            .unwrap();
        sink.disable_stream(StreamType::Video).unwrap();
        sink.enable(RunMode::Always).unwrap();
        capture.start().unwrap();

        let frame = sink.acquire_frame(StreamType::Muxer, false).unwrap();
        assert_eq!(frame.stream_type, StreamType::Muxer);
        assert_eq!(frame.data[0], b'V');
        sink.release_frame(frame).unwrap();
        assert!(sink
            .acquire_frame(StreamType::Video, true)
            .unwrap_err()
            .is_not_supported());

        capture.stop().unwrap();
        assert!(muxer.video_packets() > 0);
        assert_eq!(muxer.close_count(), 1);
    }

    #[test]
    fn test_failed_path_reported_once() {
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        let capture = Capture::builder()
            .audio_source(MockAudioSource::new(pcm16k()).realtime(false))
            .on_event(move |event| {
                if matches!(event, CaptureEvent::Error { path: Some(1) }) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .open()
            .unwrap();
        capture
            .sink_setup(0, SinkConfig::new().with_audio(pcm16k()))
            .unwrap()
            .enable(RunMode::Always)
            .unwrap();
        let bad = capture
            .sink_setup(1, SinkConfig::new().with_audio(AudioInfo::new(FormatId::MJPEG, 16000, 1, 16)))
            .unwrap();
        bad.enable(RunMode::Always).unwrap();
        capture.start().unwrap();

        assert!(wait_for(|| errors.load(Ordering::SeqCst) == 1));
        assert!(bad
            .acquire_frame(StreamType::Audio, false)
            .unwrap_err()
            .is_not_found());
        let good = capture.sink(0).unwrap();
        let frame = good.acquire_frame(StreamType::Audio, false).unwrap();
        good.release_frame(frame).unwrap();
        assert_eq!(capture.stats().path_errors, 1);
    }

    #[test]
    fn test_closed_capture_rejects_calls() {
        let capture = Capture::builder()
            .audio_source(MockAudioSource::new(pcm16k()))
            .open()
            .unwrap();
        let sink = capture
            .sink_setup(0, SinkConfig::new().with_audio(pcm16k()))
            .unwrap();
        capture.close().unwrap();
        let err = sink.enable(RunMode::Always).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidState { .. }));
    }
}
