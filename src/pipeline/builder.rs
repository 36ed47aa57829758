//! Pipeline builders.
//!
//! A builder owns the sink formats of one stream, creates the pipeline list
//! the path manager runs, and negotiates it. The automatic builders give
//! every sink its own conversion chain and, when more than one pipeline has
//! to be fed, put a source pipeline with a copier in front:
//!
//! ```text
//! one sink:    source ─► [conv… ─► enc] ─► sink 0
//! many sinks:  source ─► [copier] ─┬─► [conv… ─► enc] ─► sink 0
//!                                  └─► [conv… ─► enc] ─► sink 1
//! ```
//!
//! Stages are looked up by capability in a [`StageRegistry`], so a stage
//! registered with [`PipelineBuilder::register_stage`] replaces the built-in
//! one with the same capability.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::negotiate::{negotiate_audio, negotiate_video};
use super::stage::{
    names, BitConvert, ChannelConvert, ColorConvert, FpsConvert, OverlayMixer, RateConvert, Scale,
    Stage, StageCap, StageFactory,
};
use super::topology::{path_bit, Linked};
use super::{assemble, Pipeline, SourceHandle};
use crate::codec::MockEncoder;
use crate::config::{CaptureConfig, MAX_SINKS};
use crate::error::{CaptureError, Result};
use crate::format::{AudioInfo, StreamInfo, VideoInfo};
use crate::frame::StreamType;
use crate::source::{SharedAudioSource, SharedVideoSource};

/// Creates, negotiates and releases the pipelines of one stream.
///
/// Implement this to take full control over pipeline layout; most users
/// stay with [`AutoAudioBuilder`] and [`AutoVideoBuilder`].
pub trait PipelineBuilder: Send {
    /// Stream the pipelines handle.
    fn stream_type(&self) -> StreamType;

    /// Source feeding the head pipelines.
    fn source(&self) -> SourceHandle;

    /// Sets the format `path` must receive.
    fn set_sink_config(&mut self, path: u8, info: StreamInfo) -> Result<()>;

    /// Format configured for `path`.
    fn sink_config(&self, path: u8) -> Option<StreamInfo>;

    /// Returns the pipeline list, building it on first use.
    ///
    /// Indices in [`Pipeline::links`](super::topology::Linked::links) refer
    /// to this list, which is wired with [`assemble`].
    fn pipelines(&mut self) -> Result<Vec<Arc<Pipeline>>>;

    /// Negotiates the pipelines serving the paths in `mask`.
    fn negotiate(&mut self, mask: u8) -> Result<()>;

    /// Drops the built pipelines. User-built pipelines are kept.
    fn release_pipelines(&mut self);

    /// Makes a stage available under `name`, ahead of the built-in stages.
    fn register_stage(&mut self, name: &str, factory: StageFactory) -> Result<()> {
        let _ = (name, factory);
        Err(CaptureError::not_supported("stage registration"))
    }

    /// Builds the pipeline of `path` from registered stage names instead of
    /// the automatic layout.
    fn build_pipeline(&mut self, path: u8, stages: &[&str]) -> Result<()> {
        let _ = (path, stages);
        Err(CaptureError::not_supported("user pipelines"))
    }
}

/// Named stage factories, most recently registered first.
///
/// # Example
///
/// ```
/// use stream_capture::pipeline::builder::StageRegistry;
/// use stream_capture::pipeline::stage::StageCap;
///
/// let registry = StageRegistry::audio();
/// assert_eq!(registry.find_by_cap(StageCap::AudioRateConvert), Some("aud_rate_cvt"));
/// assert!(registry.create("aud_enc").is_ok());
/// assert!(registry.create("missing").err().unwrap().is_not_found());
/// ```
#[derive(Clone, Default)]
pub struct StageRegistry {
    factories: Vec<(String, StageFactory)>,
}

fn factory<S: Stage + 'static>(make: fn() -> S) -> StageFactory {
    Arc::new(move || Box::new(make()) as Box<dyn Stage>)
}

impl StageRegistry {
    /// Registry holding the built-in audio stages.
    #[must_use]
    pub fn audio() -> Self {
        let mut registry = Self::default();
        registry.register(names::AUDIO_ENCODER, factory(MockEncoder::audio));
        registry.register(names::AUDIO_RATE, factory(RateConvert::default));
        registry.register(names::AUDIO_BIT, factory(BitConvert::default));
        registry.register(names::AUDIO_CHANNEL, factory(ChannelConvert::default));
        registry
    }

    /// Registry holding the built-in video stages.
    #[must_use]
    pub fn video() -> Self {
        let mut registry = Self::default();
        registry.register(names::VIDEO_ENCODER, factory(MockEncoder::video));
        registry.register(names::VIDEO_COLOR, factory(ColorConvert::default));
        registry.register(names::VIDEO_SCALE, factory(Scale::default));
        registry.register(names::VIDEO_FPS, factory(FpsConvert::default));
        registry.register(names::VIDEO_OVERLAY, factory(OverlayMixer::default));
        registry
    }

    /// Registers `factory` under `name`, shadowing earlier registrations.
    pub fn register(&mut self, name: &str, factory: StageFactory) {
        self.factories.insert(0, (name.to_string(), factory));
    }

    /// Creates the stage registered as `name`.
    pub fn create(&self, name: &str) -> Result<Box<dyn Stage>> {
        self.factories
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, make)| make())
            .ok_or_else(|| CaptureError::not_found(format!("stage {name}")))
    }

    /// Name of the most recently registered stage declaring `cap`.
    pub fn find_by_cap(&self, cap: StageCap) -> Option<&str> {
        self.factories
            .iter()
            .find(|(_, make)| make().has_cap(cap))
            .map(|(name, _)| name.as_str())
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.factories.iter().map(|(name, _)| name))
            .finish()
    }
}

/// State shared by the automatic builders.
struct BuilderCore {
    stream: StreamType,
    prefix: &'static str,
    chain: &'static [StageCap],
    registry: StageRegistry,
    sinks: [Option<StreamInfo>; MAX_SINKS],
    user: Vec<(u8, Arc<Pipeline>)>,
    pipelines: Vec<Arc<Pipeline>>,
    built: bool,
    config: CaptureConfig,
}

const AUDIO_CHAIN: &[StageCap] = &[
    StageCap::AudioChannelConvert,
    StageCap::AudioBitConvert,
    StageCap::AudioRateConvert,
    StageCap::AudioEncoder,
];

// Overlay blends in the source format; scaling runs before color conversion
// because the scaler only handles packed formats.
const VIDEO_CHAIN: &[StageCap] = &[
    StageCap::VideoOverlay,
    StageCap::VideoFpsConvert,
    StageCap::VideoScale,
    StageCap::VideoColorConvert,
    StageCap::VideoEncoder,
];

impl BuilderCore {
    fn new(stream: StreamType, config: CaptureConfig) -> Self {
        let (prefix, chain, registry) = match stream {
            StreamType::Video => ("vid", VIDEO_CHAIN, StageRegistry::video()),
            _ => ("aud", AUDIO_CHAIN, StageRegistry::audio()),
        };
        Self {
            stream,
            prefix,
            chain,
            registry,
            sinks: [None; MAX_SINKS],
            user: Vec::new(),
            pipelines: Vec::new(),
            built: false,
            config,
        }
    }

    fn check_path(path: u8) -> Result<usize> {
        let idx = usize::from(path);
        if idx >= MAX_SINKS {
            return Err(CaptureError::invalid_arg(format!(
                "path {path} out of range (max {MAX_SINKS})"
            )));
        }
        Ok(idx)
    }

    fn set_sink(&mut self, path: u8, info: StreamInfo) -> Result<()> {
        let idx = Self::check_path(path)?;
        if self.built {
            return Err(CaptureError::invalid_state(
                "sink formats are fixed while pipelines exist",
            ));
        }
        self.sinks[idx] = Some(info);
        Ok(())
    }

    fn sink(&self, path: u8) -> Option<StreamInfo> {
        self.sinks.get(usize::from(path)).copied().flatten()
    }

    fn has_user(&self, path: u8) -> bool {
        self.user.iter().any(|(p, _)| *p == path)
    }

    fn sink_stages(&self) -> Result<Vec<Box<dyn Stage>>> {
        let mut stages = Vec::with_capacity(self.chain.len());
        for &cap in self.chain {
            match self.registry.find_by_cap(cap) {
                Some(name) => stages.push(self.registry.create(name)?),
                None if matches!(cap, StageCap::AudioEncoder | StageCap::VideoEncoder) => {
                    return Err(CaptureError::not_found(format!("{cap:?} stage")));
                }
                None => debug!(?cap, "no stage registered, leaving it out"),
            }
        }
        Ok(stages)
    }

    fn build(&mut self) -> Result<Vec<Arc<Pipeline>>> {
        if self.built {
            return Ok(self.pipelines.clone());
        }
        let configured: Vec<u8> = (0..MAX_SINKS as u8)
            .filter(|&p| self.sink(p).is_some())
            .collect();
        if configured.is_empty() {
            return Ok(Vec::new());
        }

        let mut sinks = Vec::new();
        for &path in &configured {
            if self.has_user(path) {
                continue;
            }
            let pipeline = Pipeline::new(
                format!("{}_sink_{path}", self.prefix),
                self.stream,
                path_bit(path),
                self.sink_stages()?,
            );
            sinks.push(Arc::new(pipeline));
        }
        for (path, pipeline) in &self.user {
            if configured.contains(path) {
                sinks.push(pipeline.clone());
            } else {
                warn!(path, "user pipeline for unconfigured path ignored");
            }
        }

        let shared_source = configured.len() > 1 || !self.user.is_empty();
        let pipelines = if shared_source {
            let mask = sinks.iter().fold(0u8, |m, p| m | p.path_mask());
            let source = Pipeline::new(format!("{}_src", self.prefix), self.stream, mask, Vec::new())
                .with_links((1..=sinks.len()).collect());
            let mut all = vec![Arc::new(source)];
            all.extend(sinks);
            all
        } else {
            sinks
        };

        assemble(&pipelines, &self.config)?;
        info!(
            stream = %self.stream,
            pipelines = pipelines.len(),
            shared_source,
            "pipelines built"
        );
        self.pipelines = pipelines;
        self.built = true;
        Ok(self.pipelines.clone())
    }

    fn release(&mut self) {
        if self.built {
            debug!(stream = %self.stream, "releasing pipelines");
        }
        self.pipelines.clear();
        self.built = false;
    }

    fn build_user(&mut self, path: u8, stage_names: &[&str]) -> Result<()> {
        Self::check_path(path)?;
        if self.has_user(path) {
            warn!(path, "pipeline already built for path");
            return Ok(());
        }
        if self.built {
            return Err(CaptureError::invalid_state("pipelines already built"));
        }
        let mut stages = Vec::with_capacity(stage_names.len());
        for &name in stage_names {
            if name == names::AUDIO_SOURCE || name == names::VIDEO_SOURCE {
                continue;
            }
            stages.push(self.registry.create(name)?);
        }
        let pipeline = Pipeline::new(
            format!("{}_user_{path}", self.prefix),
            self.stream,
            path_bit(path),
            stages,
        )
        .user_built();
        self.user.push((path, Arc::new(pipeline)));
        Ok(())
    }
}

/// Builds one conversion chain per audio sink:
/// channel, bit depth and rate conversion, then the encoder.
pub struct AutoAudioBuilder {
    source: SharedAudioSource,
    core: BuilderCore,
}

impl AutoAudioBuilder {
    /// Creates a builder over `source`.
    pub fn new(source: SharedAudioSource, config: CaptureConfig) -> Self {
        Self {
            source,
            core: BuilderCore::new(StreamType::Audio, config),
        }
    }

    fn sink_formats(&self) -> [AudioInfo; MAX_SINKS] {
        let mut formats = [AudioInfo::default(); MAX_SINKS];
        for (slot, sink) in formats.iter_mut().zip(&self.core.sinks) {
            if let Some(info) = sink.and_then(|s| s.audio()) {
                *slot = info;
            }
        }
        formats
    }
}

impl PipelineBuilder for AutoAudioBuilder {
    fn stream_type(&self) -> StreamType {
        StreamType::Audio
    }

    fn source(&self) -> SourceHandle {
        SourceHandle::Audio(self.source.clone())
    }

    fn set_sink_config(&mut self, path: u8, info: StreamInfo) -> Result<()> {
        if info.audio().is_none() {
            return Err(CaptureError::invalid_arg("audio builder needs an audio format"));
        }
        self.core.set_sink(path, info)
    }

    fn sink_config(&self, path: u8) -> Option<StreamInfo> {
        self.core.sink(path)
    }

    fn pipelines(&mut self) -> Result<Vec<Arc<Pipeline>>> {
        self.core.build()
    }

    fn negotiate(&mut self, mask: u8) -> Result<()> {
        let pipelines = self.core.build()?;
        negotiate_audio(
            &pipelines,
            &self.sink_formats(),
            mask,
            &self.source,
            self.core.config.audio_frame_duration,
        )
    }

    fn release_pipelines(&mut self) {
        self.core.release();
    }

    fn register_stage(&mut self, name: &str, factory: StageFactory) -> Result<()> {
        self.core.registry.register(name, factory);
        Ok(())
    }

    fn build_pipeline(&mut self, path: u8, stages: &[&str]) -> Result<()> {
        self.core.build_user(path, stages)
    }
}

/// Builds one conversion chain per video sink:
/// overlay, frame rate, scale, color conversion, then the encoder.
pub struct AutoVideoBuilder {
    source: SharedVideoSource,
    core: BuilderCore,
}

impl AutoVideoBuilder {
    /// Creates a builder over `source`.
    pub fn new(source: SharedVideoSource, config: CaptureConfig) -> Self {
        Self {
            source,
            core: BuilderCore::new(StreamType::Video, config),
        }
    }

    fn sink_formats(&self) -> [VideoInfo; MAX_SINKS] {
        let mut formats = [VideoInfo::default(); MAX_SINKS];
        for (slot, sink) in formats.iter_mut().zip(&self.core.sinks) {
            if let Some(info) = sink.and_then(|s| s.video()) {
                *slot = info;
            }
        }
        formats
    }
}

impl PipelineBuilder for AutoVideoBuilder {
    fn stream_type(&self) -> StreamType {
        StreamType::Video
    }

    fn source(&self) -> SourceHandle {
        SourceHandle::Video(self.source.clone())
    }

    fn set_sink_config(&mut self, path: u8, info: StreamInfo) -> Result<()> {
        if info.video().is_none() {
            return Err(CaptureError::invalid_arg("video builder needs a video format"));
        }
        self.core.set_sink(path, info)
    }

    fn sink_config(&self, path: u8) -> Option<StreamInfo> {
        self.core.sink(path)
    }

    fn pipelines(&mut self) -> Result<Vec<Arc<Pipeline>>> {
        self.core.build()
    }

    fn negotiate(&mut self, mask: u8) -> Result<()> {
        let pipelines = self.core.build()?;
        negotiate_video(&pipelines, &self.sink_formats(), mask, &self.source)
    }

    fn release_pipelines(&mut self) {
        self.core.release();
    }

    fn register_stage(&mut self, name: &str, factory: StageFactory) -> Result<()> {
        self.core.registry.register(name, factory);
        Ok(())
    }

    fn build_pipeline(&mut self, path: u8, stages: &[&str]) -> Result<()> {
        self.core.build_user(path, stages)
    }
}
