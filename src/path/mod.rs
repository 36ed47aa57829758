//! Per-stream path manager.
//!
//! A path is one sink's view of a stream. The manager takes each path
//! through `configured → negotiated → started` and back, sharing pipelines
//! between paths: a pipeline runs while any path has its bit in the
//! pipeline's run mask, and only the last path leaving it stops it.
//!
//! ```text
//! add_path ─► configured ─► (start / enable) ─► negotiated ─► started
//!                 ▲                                              │
//!                 └──────────────── disable / stop ──────────────┘
//! ```

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::{ThreadScheduler, MAX_SINKS};
use crate::error::{CaptureError, Result};
use crate::event::{PathEvent, PathEventKind, PathEventSender};
use crate::format::StreamInfo;
use crate::frame::StreamType;
use crate::pipeline::builder::PipelineBuilder;
use crate::pipeline::stage::{StageCap, StageControl, StageFactory};
use crate::pipeline::task::{FrameHandler, PipelineTask, TaskContext};
use crate::pipeline::topology::{self, path_bit, Linked};
use crate::pipeline::{sink_of, Pipeline};
use crate::source::SharedOverlay;
use crate::sync::CaptureClock;

/// State of one path.
#[derive(Default)]
struct PathResource {
    configured: bool,
    negotiated: bool,
    enabled: bool,
    started: bool,
    bitrate: Option<u32>,
    run_once: bool,
    overlay: Option<SharedOverlay>,
    overlay_enabled: bool,
}

/// Drives the paths of one stream over the pipelines of its builder.
pub(crate) struct PathManager {
    stream: StreamType,
    builder: Box<dyn PipelineBuilder>,
    paths: [PathResource; MAX_SINKS],
    pipelines: Vec<Arc<Pipeline>>,
    run_mask: Vec<u8>,
    tasks: Vec<Option<PipelineTask>>,
    started: bool,
    ctx: TaskContext,
}

impl PathManager {
    pub fn new(
        builder: Box<dyn PipelineBuilder>,
        deliver: FrameHandler,
        events: PathEventSender,
        clock: Arc<CaptureClock>,
        scheduler: ThreadScheduler,
    ) -> Self {
        let ctx = TaskContext {
            source: builder.source(),
            deliver,
            events,
            clock,
            scheduler,
        };
        Self {
            stream: builder.stream_type(),
            builder,
            paths: Default::default(),
            pipelines: Vec::new(),
            run_mask: Vec::new(),
            tasks: Vec::new(),
            started: false,
            ctx,
        }
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream
    }

    pub fn pipelines(&self) -> &[Arc<Pipeline>] {
        &self.pipelines
    }

    pub fn is_path_started(&self, path: u8) -> bool {
        self.res(path).is_ok_and(|r| r.started)
    }

    fn res(&self, path: u8) -> Result<&PathResource> {
        self.paths
            .get(usize::from(path))
            .filter(|r| r.configured)
            .ok_or_else(|| CaptureError::not_supported(format!("{} path {path}", self.stream)))
    }

    fn res_mut(&mut self, path: u8) -> Result<&mut PathResource> {
        let stream = self.stream;
        self.paths
            .get_mut(usize::from(path))
            .filter(|r| r.configured)
            .ok_or_else(|| CaptureError::not_supported(format!("{stream} path {path}")))
    }

    fn emit(&self, path: u8, kind: PathEventKind) {
        if self.ctx.events.send(PathEvent::new(self.stream, path, kind)).is_err() {
            debug!(path, ?kind, "event channel closed");
        }
    }

    fn configured_mask(&self) -> u8 {
        (0..MAX_SINKS as u8)
            .filter(|&p| self.paths[usize::from(p)].configured)
            .fold(0, |mask, p| mask | path_bit(p))
    }

    /// Configures `path` to receive `info`.
    pub fn add_path(&mut self, path: u8, info: StreamInfo) -> Result<()> {
        let idx = usize::from(path);
        if idx >= MAX_SINKS {
            return Err(CaptureError::invalid_arg(format!("path {path} out of range")));
        }
        let none = match info {
            StreamInfo::Audio(a) => self.stream != StreamType::Audio || a.is_none(),
            StreamInfo::Video(v) => self.stream != StreamType::Video || v.is_none(),
        };
        if none {
            return Err(CaptureError::invalid_arg(format!(
                "{} path {path} needs a {} format",
                self.stream, self.stream
            )));
        }
        if self.paths[idx].started {
            return Err(CaptureError::invalid_state(format!("path {path} is running")));
        }
        self.builder.set_sink_config(path, info)?;
        self.paths[idx].configured = true;
        debug!(stream = %self.stream, path, %info, "path configured");
        Ok(())
    }

    /// Records the wanted state of `path`; drives it at once if started.
    pub fn enable_path(&mut self, path: u8, enable: bool) -> Result<()> {
        let res = self.res_mut(path)?;
        if res.enabled == enable {
            return Ok(());
        }
        res.enabled = enable;
        if !self.started {
            return Ok(());
        }
        if enable {
            self.start_path(path)
        } else {
            self.stop_path(path)
        }
    }

    /// Builds the pipelines and starts every enabled path.
    ///
    /// A path that fails to start is reported with an error event and
    /// skipped; the others still start.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        let all = self.configured_mask();
        if all == 0 {
            return Ok(());
        }

        self.pipelines = self.builder.pipelines()?;
        if self.pipelines.is_empty() {
            error!(stream = %self.stream, "no pipeline built");
            return Err(CaptureError::invalid_arg("no pipeline"));
        }
        self.run_mask = vec![0; self.pipelines.len()];
        self.tasks = self.pipelines.iter().map(|_| None).collect();
        self.emit(0, PathEventKind::PipelineBuilt);

        match self.builder.negotiate(all) {
            Ok(()) => {
                for res in self.paths.iter_mut().filter(|r| r.configured) {
                    res.negotiated = true;
                }
            }
            Err(e) => warn!(stream = %self.stream, error = %e, "negotiating all paths failed"),
        }
        for path in 0..MAX_SINKS as u8 {
            if self.paths[usize::from(path)].configured {
                self.apply_settings(path);
            }
        }

        for path in 0..MAX_SINKS as u8 {
            let res = &self.paths[usize::from(path)];
            if res.configured && res.enabled {
                if let Err(e) = self.start_path(path) {
                    warn!(stream = %self.stream, path, error = %e, "path failed to start");
                }
            }
        }
        Ok(())
    }

    /// Stops every path and releases the pipelines.
    pub fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        self.started = false;
        for path in 0..MAX_SINKS as u8 {
            if self.paths[usize::from(path)].configured {
                if let Err(e) = self.stop_path(path) {
                    error!(stream = %self.stream, path, error = %e, "failed to stop path");
                }
            }
        }
        for task in self.tasks.iter_mut().flatten() {
            task.stop();
        }
        self.tasks.clear();
        self.run_mask.clear();
        self.pipelines.clear();
        for res in &mut self.paths {
            res.negotiated = false;
        }
        self.builder.release_pipelines();
        Ok(())
    }

    fn start_path(&mut self, path: u8) -> Result<()> {
        let res = self.res(path)?;
        if res.started {
            return Ok(());
        }
        match self.prepare_and_run(path) {
            Ok(()) => {
                self.paths[usize::from(path)].started = true;
                info!(stream = %self.stream, path, "path started");
                self.emit(path, PathEventKind::Started);
                Ok(())
            }
            Err(e) => {
                error!(stream = %self.stream, path, error = %e, "failed to start path");
                self.abandon(path);
                self.emit(path, PathEventKind::Error);
                Err(e)
            }
        }
    }

    fn prepare_and_run(&mut self, path: u8) -> Result<()> {
        topology::verify_single_sink(&self.pipelines, path)?;
        self.negotiate_path(path)?;
        self.apply_settings(path);

        let bit = path_bit(path);
        for (idx, pipeline) in self.pipelines.iter().enumerate() {
            if pipeline.path_mask() & bit == 0 || self.tasks[idx].is_some() {
                continue;
            }
            self.tasks[idx] = Some(PipelineTask::new(&self.pipelines, idx, self.ctx.clone())?);
        }

        // Consumers first so their ports are open before producers run.
        let order = topology::sort(&self.pipelines)?;
        for &idx in order.iter().rev() {
            if self.pipelines[idx].path_mask() & bit == 0 {
                continue;
            }
            if self.run_mask[idx] == 0 {
                if let Some(task) = self.tasks[idx].as_mut() {
                    task.run()?;
                }
            }
            self.run_mask[idx] |= bit;
        }
        Ok(())
    }

    fn negotiate_path(&mut self, path: u8) -> Result<()> {
        if self.paths[usize::from(path)].negotiated {
            return Ok(());
        }
        let bit = path_bit(path);
        let first = !self.paths.iter().any(|r| r.negotiated);
        let mask = if first { self.configured_mask() } else { bit };
        let mut result = self.builder.negotiate(mask);
        if result.is_err() && mask != bit {
            debug!(stream = %self.stream, path, "negotiating this path alone");
            result = self.builder.negotiate(bit);
        }
        result?;
        if first && mask != bit {
            for res in self.paths.iter_mut().filter(|r| r.configured) {
                res.negotiated = true;
            }
        }
        self.paths[usize::from(path)].negotiated = true;
        Ok(())
    }

    /// Undoes a partial start of `path`.
    fn abandon(&mut self, path: u8) {
        let bit = path_bit(path);
        for idx in 0..self.pipelines.len() {
            if self.pipelines[idx].path_mask() & bit == 0 {
                continue;
            }
            if self.run_mask[idx] == bit {
                if let Some(task) = self.tasks[idx].as_mut() {
                    task.stop();
                }
            }
            self.run_mask[idx] &= !bit;
            if self.run_mask[idx] == 0 {
                self.tasks[idx] = None;
            }
        }
        self.paths[usize::from(path)].negotiated = false;
    }

    /// Stops `path`. Stopping a path that is not started does nothing.
    pub fn stop_path(&mut self, path: u8) -> Result<()> {
        let res = self.res_mut(path)?;
        if !res.started {
            return Ok(());
        }
        res.started = false;
        res.negotiated = false;

        let bit = path_bit(path);
        let order = topology::sort(&self.pipelines)?;
        for &idx in order.iter().rev() {
            let pipeline = &self.pipelines[idx];
            if pipeline.path_mask() & bit == 0 || self.tasks[idx].is_none() {
                continue;
            }
            if self.run_mask[idx] & !bit != 0 {
                debug!(
                    pipeline = pipeline.name(),
                    run_mask = self.run_mask[idx],
                    "pipeline still used by other paths"
                );
                self.run_mask[idx] &= !bit;
                continue;
            }
            if !topology::is_sink(pipeline) {
                // Downstream paths must renegotiate against a restarted source.
                for res in &mut self.paths {
                    res.negotiated = false;
                }
            }
            if let Some(task) = self.tasks[idx].as_mut() {
                task.stop();
            }
            self.run_mask[idx] &= !bit;
        }

        for idx in 0..self.pipelines.len() {
            if self.pipelines[idx].path_mask() & bit != 0 && self.run_mask[idx] == 0 {
                self.tasks[idx] = None;
            }
        }
        info!(stream = %self.stream, path, "path stopped");
        self.emit(path, PathEventKind::Stopped);
        Ok(())
    }

    fn encoder_cap(&self) -> StageCap {
        match self.stream {
            StreamType::Video => StageCap::VideoEncoder,
            _ => StageCap::AudioEncoder,
        }
    }

    /// Pushes stored settings of `path` into its pipelines.
    fn apply_settings(&self, path: u8) {
        if self.pipelines.is_empty() {
            return;
        }
        let res = &self.paths[usize::from(path)];
        if let Some(bps) = res.bitrate {
            if let Err(e) = self.apply_bitrate(path, bps) {
                warn!(stream = %self.stream, path, error = %e, "bitrate not applied");
            }
        }
        if let Some(overlay) = &res.overlay {
            if let Err(e) = self.apply_overlay(path, Some(overlay), res.overlay_enabled) {
                warn!(path, error = %e, "overlay not applied");
            }
        }
        if self.stream == StreamType::Video {
            if let Err(e) = self.apply_run_once(path, res.run_once) {
                debug!(path, error = %e, "run once not applied");
            }
        }
    }

    fn apply_bitrate(&self, path: u8, bps: u32) -> Result<()> {
        let idx = sink_of(&self.pipelines, path)
            .ok_or_else(|| CaptureError::not_found(format!("sink pipeline of path {path}")))?;
        self.pipelines[idx].control(self.encoder_cap(), StageControl::Bitrate(bps))
    }

    fn apply_overlay(&self, path: u8, overlay: Option<&SharedOverlay>, enable: bool) -> Result<()> {
        let bit = path_bit(path);
        let pipeline = self
            .pipelines
            .iter()
            .find(|p| p.path_mask() & bit != 0 && p.has_cap(StageCap::VideoOverlay))
            .ok_or_else(|| CaptureError::not_supported("no overlay stage"))?;
        if let Some(overlay) = overlay {
            pipeline.control(StageCap::VideoOverlay, StageControl::Overlay(overlay.clone()))?;
        }
        pipeline.control(StageCap::VideoOverlay, StageControl::OverlayEnable(enable))
    }

    fn apply_run_once(&self, path: u8, once: bool) -> Result<()> {
        let bit = path_bit(path);
        for (idx, head) in self.pipelines.iter().enumerate() {
            if head.path_mask() & bit == 0 || !topology::is_source(idx, &self.pipelines) {
                continue;
            }
            if head.path_mask() & !bit == 0 {
                head.fetch.set(once);
                return Ok(());
            }
            let port = head
                .links()
                .iter()
                .position(|&to| self.pipelines[to].path_mask() & bit != 0)
                .ok_or_else(|| CaptureError::not_found(format!("port of path {path}")))?;
            let copier = head
                .copier()
                .ok_or_else(|| CaptureError::internal(format!("{} has no copier", head.name())))?;
            return copier.enable_once(port, once);
        }
        Err(CaptureError::not_supported("no source pipeline for path"))
    }

    /// Sets the encoder bitrate of `path`.
    pub fn set_bitrate(&mut self, path: u8, bps: u32) -> Result<()> {
        self.res_mut(path)?.bitrate = Some(bps);
        if self.pipelines.is_empty() {
            return Ok(());
        }
        self.apply_bitrate(path, bps)
    }

    /// Attaches an overlay to the video of `path`.
    pub fn add_overlay(&mut self, path: u8, overlay: SharedOverlay) -> Result<()> {
        if self.stream != StreamType::Video {
            return Err(CaptureError::not_supported("overlay on audio"));
        }
        let res = self.res_mut(path)?;
        if res.overlay.is_some() {
            warn!(path, "overlay already added");
            return Err(CaptureError::invalid_state("overlay already added"));
        }
        res.overlay = Some(overlay.clone());
        let enabled = res.overlay_enabled;
        if self.pipelines.is_empty() {
            return Ok(());
        }
        self.apply_overlay(path, Some(&overlay), enabled)
    }

    /// Turns overlay blending on or off for `path`.
    pub fn enable_overlay(&mut self, path: u8, enable: bool) -> Result<()> {
        let res = self.res_mut(path)?;
        if res.overlay.is_none() {
            return Err(CaptureError::not_supported("no overlay added"));
        }
        res.overlay_enabled = enable;
        if self.pipelines.is_empty() {
            return Ok(());
        }
        self.apply_overlay(path, None, enable)
    }

    /// Limits `path` to one video frame per arming.
    pub fn set_run_once(&mut self, path: u8, once: bool) -> Result<()> {
        if self.stream != StreamType::Video {
            return Err(CaptureError::not_supported("run once on audio"));
        }
        self.res_mut(path)?.run_once = once;
        if self.pipelines.is_empty() {
            return Ok(());
        }
        self.apply_run_once(path, once)
    }

    pub fn register_stage(&mut self, name: &str, factory: StageFactory) -> Result<()> {
        self.builder.register_stage(name, factory)
    }

    pub fn build_pipeline(&mut self, path: u8, stages: &[&str]) -> Result<()> {
        if self.started {
            return Err(CaptureError::invalid_state("pipelines are built at start"));
        }
        self.builder.build_pipeline(path, stages)
    }
}

impl Drop for PathManager {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureConfig;
    use crate::format::{AudioInfo, FormatId, VideoInfo};
    use crate::frame::Frame;
    use crate::pipeline::builder::{AutoAudioBuilder, AutoVideoBuilder};
    use crate::source::{AudioSource, MockAudioSource, MockVideoSource, VideoSource};
    use crate::sync::SyncMode;
    use parking_lot::Mutex;
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;

    type Delivered = Arc<Mutex<Vec<(u8, Frame)>>>;

    struct Fixture {
        mngr: PathManager,
        delivered: Delivered,
        events: mpsc::UnboundedReceiver<PathEvent>,
    }

    fn manager(builder: Box<dyn PipelineBuilder>) -> Fixture {
        let delivered: Delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        let deliver: FrameHandler = Arc::new(move |path, frame| {
            sink.lock().push((path, frame));
            Ok(())
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let mngr = PathManager::new(
            builder,
            deliver,
            tx,
            Arc::new(CaptureClock::new(SyncMode::System)),
            ThreadScheduler::default(),
        );
        Fixture {
            mngr,
            delivered,
            events: rx,
        }
    }

    fn audio_fixture(mock: &MockAudioSource) -> Fixture {
        let mut boxed: Box<dyn AudioSource> = Box::new(mock.clone());
        boxed.open().unwrap();
        let builder = AutoAudioBuilder::new(Arc::new(Mutex::new(boxed)), CaptureConfig::default());
        manager(Box::new(builder))
    }

    fn pcm(rate: u32) -> StreamInfo {
        StreamInfo::Audio(AudioInfo::new(FormatId::PCM, rate, 1, 16))
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

    fn frames_for(delivered: &Delivered, path: u8) -> usize {
        delivered.lock().iter().filter(|(p, _)| *p == path).count()
    }

    #[test]
    fn test_add_path_rejects_none() {
        let mock = MockAudioSource::new(AudioInfo::new(FormatId::PCM, 16000, 1, 16));
        let mut fx = audio_fixture(&mock);
        let err = fx
            .mngr
            .add_path(0, StreamInfo::Audio(AudioInfo::default()))
            .unwrap_err();
        assert!(matches!(err, CaptureError::InvalidArg { .. }));
        let video = StreamInfo::Video(VideoInfo::new(FormatId::H264, 320, 240, 15));
        assert!(fx.mngr.add_path(0, video).is_err());
    }

    #[test]
    fn test_enable_unknown_path() {
        let mock = MockAudioSource::new(AudioInfo::new(FormatId::PCM, 16000, 1, 16));
        let mut fx = audio_fixture(&mock);
        assert!(fx.mngr.enable_path(1, true).unwrap_err().is_not_supported());
    }

    #[test]
    fn test_enable_before_start_only_records() {
        let mock = MockAudioSource::new(AudioInfo::new(FormatId::PCM, 16000, 1, 16));
        let mut fx = audio_fixture(&mock);
        fx.mngr.add_path(0, pcm(16000)).unwrap();
        fx.mngr.enable_path(0, true).unwrap();
        assert!(fx.mngr.pipelines().is_empty());
        assert_eq!(mock.start_count(), 0);

        fx.mngr.start().unwrap();
        assert!(fx.mngr.is_path_started(0));
        assert!(wait_for(|| frames_for(&fx.delivered, 0) >= 2));
        fx.mngr.stop().unwrap();
        assert!(!mock.is_started());
    }

    #[test]
    fn test_shared_source_stops_with_last_path() {
        let mock = MockAudioSource::new(AudioInfo::new(FormatId::PCM, 16000, 1, 16));
        let mut fx = audio_fixture(&mock);
        fx.mngr.add_path(0, pcm(16000)).unwrap();
        fx.mngr.add_path(1, pcm(8000)).unwrap();
        fx.mngr.enable_path(0, true).unwrap();
        fx.mngr.enable_path(1, true).unwrap();
        fx.mngr.start().unwrap();
        assert_eq!(fx.mngr.pipelines().len(), 3);
        assert!(wait_for(|| frames_for(&fx.delivered, 1) >= 2));
        assert_eq!(mock.negotiated().len(), 1);

        fx.mngr.enable_path(0, false).unwrap();
        assert!(mock.is_started());
        assert!(fx.mngr.pipelines()[0].is_running());
        assert!(!fx.mngr.pipelines()[1].is_running());

        fx.mngr.enable_path(1, false).unwrap();
        assert!(!mock.is_started());
        assert!(fx.mngr.pipelines().iter().all(|p| !p.is_running()));

        // Source stopped: re-enabling renegotiates and restarts it.
        fx.mngr.enable_path(0, true).unwrap();
        assert_eq!(mock.start_count(), 2);
        assert_eq!(mock.negotiated().len(), 2);
        fx.mngr.stop().unwrap();
    }

    #[test]
    fn test_stop_path_twice_is_noop() {
        let mock = MockAudioSource::new(AudioInfo::new(FormatId::PCM, 16000, 1, 16));
        let mut fx = audio_fixture(&mock);
        fx.mngr.add_path(0, pcm(16000)).unwrap();
        fx.mngr.enable_path(0, true).unwrap();
        fx.mngr.start().unwrap();
        fx.mngr.stop_path(0).unwrap();
        fx.mngr.stop_path(0).unwrap();
        assert!(!fx.mngr.is_path_started(0));
        assert_eq!(mock.start_count(), 1);
        fx.mngr.stop().unwrap();
        fx.mngr.stop().unwrap();
    }

    #[test]
    fn test_failing_path_does_not_block_others() {
        let mock = MockAudioSource::new(AudioInfo::new(FormatId::PCM, 16000, 1, 16));
        let mut fx = audio_fixture(&mock);
        fx.mngr.add_path(0, pcm(16000)).unwrap();
        // No audio encoder produces MJPEG.
        fx.mngr
            .add_path(1, StreamInfo::Audio(AudioInfo::new(FormatId::MJPEG, 16000, 1, 16)))
            .unwrap();
        fx.mngr.enable_path(0, true).unwrap();
        fx.mngr.enable_path(1, true).unwrap();
        fx.mngr.start().unwrap();

        assert!(fx.mngr.is_path_started(0));
        assert!(!fx.mngr.is_path_started(1));
        let mut kinds = Vec::new();
        while let Ok(event) = fx.events.try_recv() {
            kinds.push((event.path, event.kind));
        }
        assert!(kinds.contains(&(0, PathEventKind::PipelineBuilt)));
        assert!(kinds.contains(&(0, PathEventKind::Started)));
        assert!(kinds.contains(&(1, PathEventKind::Error)));
        fx.mngr.stop().unwrap();
    }

    #[test]
    fn test_video_run_once_single_frame() {
        let mock = MockVideoSource::new(VideoInfo::new(FormatId::RGB565, 64, 48, 30));
        let mut boxed: Box<dyn VideoSource> = Box::new(mock.clone());
        boxed.open().unwrap();
        let builder = AutoVideoBuilder::new(Arc::new(Mutex::new(boxed)), CaptureConfig::default());
        let mut fx = manager(Box::new(builder));

        fx.mngr
            .add_path(0, StreamInfo::Video(VideoInfo::new(FormatId::RGB565, 64, 48, 30)))
            .unwrap();
        fx.mngr.set_run_once(0, true).unwrap();
        fx.mngr.enable_path(0, true).unwrap();
        fx.mngr.start().unwrap();

        assert!(wait_for(|| frames_for(&fx.delivered, 0) == 1));
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(frames_for(&fx.delivered, 0), 1);

        fx.mngr.set_run_once(0, true).unwrap();
        assert!(wait_for(|| frames_for(&fx.delivered, 0) == 2));
        fx.mngr.stop().unwrap();
        assert_eq!(mock.frames_acquired(), mock.frames_released());
    }

    #[test]
    fn test_bitrate_reaches_encoder() {
        let mock = MockAudioSource::new(AudioInfo::new(FormatId::PCM, 16000, 1, 16));
        let mut fx = audio_fixture(&mock);
        fx.mngr
            .add_path(0, StreamInfo::Audio(AudioInfo::new(FormatId::AAC, 16000, 1, 16)))
            .unwrap();
        fx.mngr.set_bitrate(0, 64_000).unwrap();
        fx.mngr.enable_path(0, true).unwrap();
        fx.mngr.start().unwrap();
        fx.mngr.set_bitrate(0, 32_000).unwrap();
        assert!(fx.mngr.set_bitrate(2, 1).unwrap_err().is_not_supported());
        fx.mngr.stop().unwrap();
    }
}
