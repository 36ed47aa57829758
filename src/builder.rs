//! Builder for opening a [`Capture`].

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::capture::Capture;
use crate::config::{CaptureConfig, ThreadScheduler};
use crate::error::{CaptureError, Result};
use crate::event::{event_callback, CaptureEvent, EventCallback};
use crate::frame::StreamType;
use crate::pipeline::builder::{AutoAudioBuilder, AutoVideoBuilder, PipelineBuilder};
use crate::source::{AudioSource, VideoSource};

/// Configures the sources of a capture and opens it.
///
/// Give each stream either a source, which gets the automatic conversion
/// chains, or a full [`PipelineBuilder`] for custom layouts. At least one
/// stream is required.
///
/// # Example
///
/// ```
/// use stream_capture::format::{AudioInfo, FormatId, VideoInfo};
/// use stream_capture::source::{MockAudioSource, MockVideoSource};
/// use stream_capture::{Capture, CaptureConfig};
///
/// let capture = Capture::builder()
///     .audio_source(MockAudioSource::new(AudioInfo::new(FormatId::PCM, 16_000, 1, 16)))
///     .video_source(MockVideoSource::new(VideoInfo::new(FormatId::YUV420, 320, 240, 15)))
///     .with_config(CaptureConfig::default())
///     .on_event(|e| tracing::info!(?e, "capture event"))
///     .open()?;
/// capture.close()?;
/// # Ok::<(), stream_capture::CaptureError>(())
/// ```
#[must_use]
pub struct CaptureBuilder {
    audio_source: Option<Box<dyn AudioSource>>,
    video_source: Option<Box<dyn VideoSource>>,
    audio_builder: Option<Box<dyn PipelineBuilder>>,
    video_builder: Option<Box<dyn PipelineBuilder>>,
    config: CaptureConfig,
    scheduler: ThreadScheduler,
    event_callback: Option<EventCallback>,
}

impl Default for CaptureBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBuilder {
    /// Creates a builder with no sources and default settings.
    pub fn new() -> Self {
        Self {
            audio_source: None,
            video_source: None,
            audio_builder: None,
            video_builder: None,
            config: CaptureConfig::default(),
            scheduler: ThreadScheduler::default(),
            event_callback: None,
        }
    }

    /// Sets the audio source. Audio sinks get automatic conversion chains.
    pub fn audio_source<S: AudioSource + 'static>(mut self, source: S) -> Self {
        self.audio_source = Some(Box::new(source));
        self
    }

    /// Sets the video source. Video sinks get automatic conversion chains.
    pub fn video_source<S: VideoSource + 'static>(mut self, source: S) -> Self {
        self.video_source = Some(Box::new(source));
        self
    }

    /// Uses a custom builder for the audio pipelines instead of an audio source.
    pub fn audio_pipeline_builder<B: PipelineBuilder + 'static>(mut self, builder: B) -> Self {
        self.audio_builder = Some(Box::new(builder));
        self
    }

    /// Uses a custom builder for the video pipelines instead of a video source.
    pub fn video_pipeline_builder<B: PipelineBuilder + 'static>(mut self, builder: B) -> Self {
        self.video_builder = Some(Box::new(builder));
        self
    }

    /// Set custom capture configuration.
    pub fn with_config(mut self, config: CaptureConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the scheduler that configures every worker thread.
    pub fn scheduler(mut self, scheduler: ThreadScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Set a callback to receive capture events.
    ///
    /// Pipeline and path events are delivered from the event dispatcher
    /// thread; `Started` and `Stopped` from the thread calling
    /// [`Capture::start`] or [`Capture::stop`].
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(CaptureEvent) + Send + Sync + 'static,
    {
        self.event_callback = Some(event_callback(callback));
        self
    }

    fn validate(&self) -> Result<()> {
        if self.audio_source.is_some() && self.audio_builder.is_some() {
            return Err(CaptureError::invalid_arg(
                "audio source and audio pipeline builder are exclusive",
            ));
        }
        if self.video_source.is_some() && self.video_builder.is_some() {
            return Err(CaptureError::invalid_arg(
                "video source and video pipeline builder are exclusive",
            ));
        }
        if self.audio_source.is_none()
            && self.audio_builder.is_none()
            && self.video_source.is_none()
            && self.video_builder.is_none()
        {
            return Err(CaptureError::invalid_arg("capture needs an audio or video source"));
        }
        Ok(())
    }

    fn stream_builder(
        stream: StreamType,
        source: Option<Box<dyn PipelineBuilder>>,
        custom: Option<Box<dyn PipelineBuilder>>,
    ) -> Option<Box<dyn PipelineBuilder>> {
        if custom.is_some() {
            debug!(%stream, "using custom pipeline builder");
        }
        custom.or(source)
    }

    /// Opens the sources and returns the capture, ready for sink setup.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - No stream is configured, or a stream has both a source and a builder
    /// - A custom builder handles the other stream type
    /// - A source fails to open
    pub fn open(self) -> Result<Capture> {
        self.validate()?;

        let audio_auto = self.audio_source.map(|source| {
            Box::new(AutoAudioBuilder::new(Arc::new(Mutex::new(source)), self.config.clone()))
                as Box<dyn PipelineBuilder>
        });
        let video_auto = self.video_source.map(|source| {
            Box::new(AutoVideoBuilder::new(Arc::new(Mutex::new(source)), self.config.clone()))
                as Box<dyn PipelineBuilder>
        });

        let audio = Self::stream_builder(StreamType::Audio, audio_auto, self.audio_builder);
        let video = Self::stream_builder(StreamType::Video, video_auto, self.video_builder);
        Capture::open(audio, video, self.config, self.scheduler, self.event_callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{AudioInfo, FormatId, VideoInfo};
    use crate::source::{MockAudioSource, MockVideoSource};

    fn pcm_source() -> MockAudioSource {
        MockAudioSource::new(AudioInfo::new(FormatId::PCM, 16_000, 1, 16))
    }

    fn yuv_source() -> MockVideoSource {
        MockVideoSource::new(VideoInfo::new(FormatId::YUV420, 320, 240, 15))
    }

    fn audio_builder() -> AutoAudioBuilder {
        let boxed: Box<dyn AudioSource> = Box::new(pcm_source());
        AutoAudioBuilder::new(Arc::new(Mutex::new(boxed)), CaptureConfig::default())
    }

    #[test]
    fn test_builder_default() {
        let builder = CaptureBuilder::new();
        assert!(builder.audio_source.is_none());
        assert!(builder.video_source.is_none());
        assert!(builder.event_callback.is_none());
        assert_eq!(builder.config.audio_queue_depth, 5);
    }

    #[test]
    fn test_builder_rejects_no_sources() {
        let result = CaptureBuilder::new().validate();
        assert!(matches!(result, Err(CaptureError::InvalidArg { .. })));
    }

    #[test]
    fn test_builder_rejects_source_and_builder() {
        let builder = Capture::builder()
            .audio_source(pcm_source())
            .audio_pipeline_builder(audio_builder());

        assert!(matches!(builder.validate(), Err(CaptureError::InvalidArg { .. })));
    }

    #[test]
    fn test_builder_rejects_builder_for_wrong_stream() {
        let result = Capture::builder().video_pipeline_builder(audio_builder()).open();
        assert!(matches!(result, Err(CaptureError::InvalidArg { .. })));
    }

    #[test]
    fn test_builder_opens_video_only() {
        let mock = yuv_source();
        let capture = Capture::builder().video_source(mock.clone()).open().unwrap();
        assert!(!capture.is_started());
        capture.close().unwrap();
        assert!(mock.is_closed());
    }

    #[test]
    fn test_builder_custom_audio_builder() {
        let capture = Capture::builder()
            .audio_pipeline_builder(audio_builder())
            .open()
            .unwrap();
        capture.close().unwrap();
    }
}
