//! Pipelines: chains of stages linked into a graph per stream.
//!
//! ```text
//! source ─► [source pipeline] ─► copier ─┬─► [sink pipeline 0] ─► sink 0
//!                                         └─► [sink pipeline 1] ─► sink 1
//! ```
//!
//! - **Stages** ([`stage`]): converters, encoders, overlay mixer
//! - **Topology** ([`topology`]): ordering and source/sink classification
//! - **Negotiation** ([`negotiate`]): picks the source format and configures
//!   every stage so each sink gets exactly its format
//! - **Builders** ([`builder`]): create the pipeline list from sink configs
//! - **Tasks**: one worker thread per running pipeline
//!
//! A pipeline with outgoing links owns a copier [`ShareQueue`] with one port
//! per link; the linked pipelines read from their port.

pub mod builder;
pub mod negotiate;
pub mod stage;
pub mod topology;
pub(crate) mod task;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::CaptureConfig;
use crate::error::{CaptureError, Result};
use crate::format::StreamInfo;
use crate::frame::{Frame, StreamType};
use crate::queue::ShareQueue;
use crate::source::{SharedAudioSource, SharedVideoSource};
use stage::{Stage, StageCap, StageControl};
use topology::Linked;

/// Source driver feeding the head pipelines of one stream.
#[derive(Clone)]
pub enum SourceHandle {
    /// Audio driver.
    Audio(SharedAudioSource),
    /// Video driver.
    Video(SharedVideoSource),
}

impl SourceHandle {
    /// Stream the source produces.
    #[must_use]
    pub fn stream_type(&self) -> StreamType {
        match self {
            Self::Audio(_) => StreamType::Audio,
            Self::Video(_) => StreamType::Video,
        }
    }
}

impl std::fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SourceHandle({})", self.stream_type())
    }
}

/// Where a pipeline gets its frames from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipelineInput {
    /// Reads the stream's source driver.
    Source,
    /// Reads one port of another pipeline's copier.
    Upstream { pipeline: usize, port: usize },
}

/// Formats recorded by the last successful negotiation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineCaps {
    /// Format entering the pipeline.
    pub input: Option<StreamInfo>,
    /// Format leaving the pipeline.
    pub output: Option<StreamInfo>,
    /// Bytes read from the source per iteration (audio source pipelines).
    pub read_size: usize,
}

/// Single-fetch gate used for one-shot video on a source pipeline.
pub(crate) struct FetchGate {
    state: Mutex<(bool, bool)>,
    cond: Condvar,
}

impl FetchGate {
    fn new() -> Self {
        Self {
            state: Mutex::new((false, false)),
            cond: Condvar::new(),
        }
    }

    /// Arms (`once = true`) or clears the gate. Arming allows one more fetch.
    pub fn set(&self, once: bool) {
        *self.state.lock() = (once, false);
        self.cond.notify_all();
    }

    /// Blocks while the gate is closed. Returns `false` once `stop` is set.
    pub fn wait_turn(&self, stop: &AtomicBool) -> bool {
        let mut state = self.state.lock();
        loop {
            if stop.load(Ordering::Acquire) {
                return false;
            }
            let (once, done) = *state;
            if !once || !done {
                return true;
            }
            self.cond.wait_for(&mut state, Duration::from_millis(100));
        }
    }

    /// Records a fetch; closes the gate when armed.
    pub fn mark_fetched(&self) {
        let mut state = self.state.lock();
        if state.0 {
            state.1 = true;
        }
    }

    /// Wakes a waiter so it re-checks its stop flag.
    pub fn wake(&self) {
        self.cond.notify_all();
    }
}

/// A chain of stages run by one worker thread.
///
/// # Example
///
/// ```
/// use stream_capture::StreamType;
/// use stream_capture::pipeline::stage::{ChannelConvert, RateConvert, Stage};
/// use stream_capture::pipeline::topology::Linked;
/// use stream_capture::pipeline::Pipeline;
///
/// let stages: Vec<Box<dyn Stage>> = vec![
///     Box::new(ChannelConvert::default()),
///     Box::new(RateConvert::default()),
/// ];
/// let pipeline = Pipeline::new("aud_sink_0", StreamType::Audio, 0b001, stages);
/// assert!(pipeline.links().is_empty());
/// assert_eq!(pipeline.stage_names(), vec!["aud_ch_cvt", "aud_rate_cvt"]);
/// ```
pub struct Pipeline {
    name: String,
    stream: StreamType,
    path_mask: u8,
    links: Vec<usize>,
    user_built: bool,
    input: Mutex<PipelineInput>,
    stages: Mutex<Vec<Box<dyn Stage>>>,
    copier: Mutex<Option<Arc<ShareQueue<Frame>>>>,
    caps: Mutex<PipelineCaps>,
    running: AtomicBool,
    pub(crate) fetch: FetchGate,
}

impl Pipeline {
    /// Creates a pipeline serving the paths in `path_mask`.
    pub fn new(
        name: impl Into<String>,
        stream: StreamType,
        path_mask: u8,
        stages: Vec<Box<dyn Stage>>,
    ) -> Self {
        Self {
            name: name.into(),
            stream,
            path_mask,
            links: Vec::new(),
            user_built: false,
            input: Mutex::new(PipelineInput::Source),
            stages: Mutex::new(stages),
            copier: Mutex::new(None),
            caps: Mutex::new(PipelineCaps::default()),
            running: AtomicBool::new(false),
            fetch: FetchGate::new(),
        }
    }

    /// Feeds the pipelines at `links` (indices into the same list).
    #[must_use]
    pub fn with_links(mut self, links: Vec<usize>) -> Self {
        self.links = links;
        self
    }

    /// Marks the pipeline as built by the user; it survives pipeline release.
    #[must_use]
    pub fn user_built(mut self) -> Self {
        self.user_built = true;
        self
    }

    /// Pipeline name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stream handled by the pipeline.
    pub fn stream_type(&self) -> StreamType {
        self.stream
    }

    /// Returns `true` for user-built pipelines.
    pub fn is_user_built(&self) -> bool {
        self.user_built
    }

    /// Names of the stages in processing order.
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.lock().iter().map(|s| s.name().to_string()).collect()
    }

    /// Formats recorded by the last negotiation.
    pub fn caps(&self) -> PipelineCaps {
        *self.caps.lock()
    }

    pub(crate) fn set_caps(&self, caps: PipelineCaps) {
        *self.caps.lock() = caps;
    }

    pub(crate) fn update_caps(&self, f: impl FnOnce(&mut PipelineCaps)) {
        f(&mut self.caps.lock());
    }

    pub(crate) fn stages(&self) -> MutexGuard<'_, Vec<Box<dyn Stage>>> {
        self.stages.lock()
    }

    pub(crate) fn input(&self) -> PipelineInput {
        *self.input.lock()
    }

    pub(crate) fn copier(&self) -> Option<Arc<ShareQueue<Frame>>> {
        self.copier.lock().clone()
    }

    /// Returns `true` while a worker thread runs the pipeline.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    /// Returns `true` if one of the stages declares `cap`.
    pub fn has_cap(&self, cap: StageCap) -> bool {
        self.stages.lock().iter().any(|s| s.has_cap(cap))
    }

    /// Sends `control` to the first stage declaring `cap`.
    pub fn control(&self, cap: StageCap, control: StageControl) -> Result<()> {
        let mut stages = self.stages.lock();
        let stage = stages
            .iter_mut()
            .find(|s| s.has_cap(cap))
            .ok_or_else(|| CaptureError::not_found(format!("{cap:?} stage in {}", self.name)))?;
        stage.control(control)
    }

    /// Drops buffered stage state.
    pub(crate) fn reset_stages(&self) {
        for stage in self.stages.lock().iter_mut() {
            stage.reset();
        }
    }
}

impl Linked for Pipeline {
    fn links(&self) -> &[usize] {
        &self.links
    }

    fn path_mask(&self) -> u8 {
        self.path_mask
    }
}

impl<T: Linked> Linked for Arc<T> {
    fn links(&self) -> &[usize] {
        (**self).links()
    }

    fn path_mask(&self) -> u8 {
        (**self).path_mask()
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("stream", &self.stream)
            .field("path_mask", &format_args!("{:#05b}", self.path_mask))
            .field("links", &self.links)
            .finish_non_exhaustive()
    }
}

/// Wires a pipeline list: sets every pipeline's input and gives each
/// pipeline with links a copier with one port per link.
///
/// Fails with `NotFound` if the links do not form a graph (see
/// [`topology::sort`]) or a pipeline is fed by more than one upstream.
pub fn assemble(pipelines: &[Arc<Pipeline>], config: &CaptureConfig) -> Result<()> {
    topology::sort(pipelines)?;
    let mut inputs = vec![PipelineInput::Source; pipelines.len()];
    for (idx, pipeline) in pipelines.iter().enumerate() {
        for (port, &to) in pipeline.links.iter().enumerate() {
            if inputs[to] != PipelineInput::Source {
                return Err(CaptureError::invalid_arg(format!(
                    "pipeline {} has more than one upstream",
                    pipelines[to].name
                )));
            }
            inputs[to] = PipelineInput::Upstream {
                pipeline: idx,
                port,
            };
        }
    }

    let depth = match pipelines.first().map(|p| p.stream) {
        Some(StreamType::Video) => config.video_queue_depth,
        _ => config.audio_queue_depth,
    };
    for (pipeline, input) in pipelines.iter().zip(inputs) {
        *pipeline.input.lock() = input;
        let mut copier = pipeline.copier.lock();
        let ports = pipeline.links.len();
        if ports == 0 {
            *copier = None;
        } else if copier.as_ref().map_or(true, |c| c.port_count() != ports) {
            // Payloads are refcounted, so the copier has nothing to hand back.
            *copier = Some(Arc::new(
                ShareQueue::new(ports, depth, |_frame: Frame| {})
                    .with_add_timeout(config.share_add_timeout),
            ));
        }
    }
    Ok(())
}

/// Index of the sink pipeline serving `path`.
pub(crate) fn sink_of<T: Linked>(all: &[T], path: u8) -> Option<usize> {
    let bit = topology::path_bit(path);
    all.iter()
        .position(|p| p.path_mask() & bit != 0 && topology::is_sink(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stage::{OverlayMixer, Scale};

    fn pipe(name: &str, mask: u8, links: Vec<usize>) -> Arc<Pipeline> {
        Arc::new(Pipeline::new(name, StreamType::Video, mask, Vec::new()).with_links(links))
    }

    #[test]
    fn test_assemble_wires_copier() {
        let all = vec![
            pipe("src", 0b11, vec![1, 2]),
            pipe("sink0", 0b01, vec![]),
            pipe("sink1", 0b10, vec![]),
        ];
        assemble(&all, &CaptureConfig::default()).unwrap();
        assert_eq!(all[0].input(), PipelineInput::Source);
        assert_eq!(
            all[2].input(),
            PipelineInput::Upstream {
                pipeline: 0,
                port: 1
            }
        );
        assert_eq!(all[0].copier().unwrap().port_count(), 2);
        assert!(all[1].copier().is_none());
    }

    #[test]
    fn test_assemble_rejects_two_upstreams() {
        let all = vec![
            pipe("a", 0b01, vec![2]),
            pipe("b", 0b01, vec![2]),
            pipe("c", 0b01, vec![]),
        ];
        assert!(assemble(&all, &CaptureConfig::default()).is_err());
    }

    #[test]
    fn test_sink_of() {
        let all = vec![
            pipe("src", 0b11, vec![1, 2]),
            pipe("s0", 0b01, vec![]),
            pipe("s1", 0b10, vec![]),
        ];
        assert_eq!(sink_of(&all, 0), Some(1));
        assert_eq!(sink_of(&all, 1), Some(2));
        assert_eq!(sink_of(&all, 2), None);
    }

    #[test]
    fn test_control_reaches_stage_by_cap() {
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(Scale::default()),
            Box::new(OverlayMixer::default()),
        ];
        let p = Pipeline::new("v", StreamType::Video, 1, stages);
        assert!(p.has_cap(StageCap::VideoOverlay));
        p.control(StageCap::VideoOverlay, StageControl::OverlayEnable(true))
            .unwrap();
        let err = p
            .control(StageCap::VideoEncoder, StageControl::Bitrate(1000))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_fetch_gate() {
        let gate = FetchGate::new();
        let stop = AtomicBool::new(false);
        assert!(gate.wait_turn(&stop));
        gate.set(true);
        assert!(gate.wait_turn(&stop));
        gate.mark_fetched();
        stop.store(true, Ordering::Release);
        assert!(!gate.wait_turn(&stop));
        gate.set(true);
        stop.store(false, Ordering::Release);
        assert!(gate.wait_turn(&stop));
    }
}
