//! # stream-capture
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Audio/video capture core with up to three independent sinks.
//!
//! `stream-capture` runs one audio and one video source, converts and
//! encodes their frames per sink, and hands every sink its own stream of
//! frames plus an optional muxed byte stream. Frames are produced once and
//! shared by reference between all their consumers.
//!
//! ## Quick Start
//!
//! ```rust
//! use stream_capture::format::{AudioInfo, FormatId, VideoInfo};
//! use stream_capture::source::{MockAudioSource, MockVideoSource};
//! use stream_capture::{
//!     Capture, MockMuxer, MuxerConfig, MuxerMask, RunMode, SinkConfig, StreamType,
//! };
//!
//! let capture = Capture::builder()
//!     .audio_source(MockAudioSource::new(AudioInfo::new(FormatId::PCM, 16_000, 1, 16)))
//!     .video_source(MockVideoSource::new(VideoInfo::new(FormatId::YUV420, 320, 240, 15)))
//!     .on_event(|e| tracing::info!(?e, "capture event"))
//!     .open()?;
//!
//! // Sink 0: H.264 video and G.711 audio, also muxed into one byte stream
//! let sink = capture.sink_setup(
//!     0,
//!     SinkConfig::new()
//!         .with_video(VideoInfo::new(FormatId::H264, 320, 240, 15))
//!         .with_audio(AudioInfo::new(FormatId::G711A, 8000, 1, 16)),
//! )?;
//! sink.add_muxer(MuxerConfig::new(MockMuxer::new()).with_mask(MuxerMask::All))?;
//! sink.enable(RunMode::Always)?;
//! capture.start()?;
//!
//! let frame = sink.acquire_frame(StreamType::Video, false)?;
//! sink.release_frame(frame)?;
//!
//! capture.stop()?;
//! capture.close()?;
//! # Ok::<(), stream_capture::CaptureError>(())
//! ```
//!
//! ## Architecture
//!
//! Each stream has a path manager that owns a graph of pipelines:
//!
//! - **Source pipeline**: reads the source and fans frames out through a
//!   copier when more than one pipeline consumes them
//! - **Sink pipelines**: per-sink converters and encoder, ending in the
//!   sink's share queue
//! - **Share queues**: refcounted fan-out to the application port and the
//!   muxer port; a slow consumer only delays release, never the producer
//!
//! Every running pipeline has its own worker thread. Control calls never
//! block on consumers, and runtime faults are reported through events.

#![warn(missing_docs)]
// Media code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
// unwrap/expect allowed in tests only
#![allow(clippy::unwrap_used)]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod builder;
mod capture;
mod codec;
mod config;
mod error;
mod event;
pub mod format;
mod frame;
mod path;
pub mod pipeline;
pub mod queue;
mod sink;
pub mod source;
mod sync;

pub use builder::CaptureBuilder;
pub use capture::Capture;
pub use codec::{linear_to_alaw, linear_to_ulaw, MockEncoder};
pub use config::{CaptureConfig, ThreadConfig, ThreadScheduler, MAX_SINKS};
pub use error::{CaptureError, Result};
pub use event::{event_callback, CaptureEvent, EventCallback, SinkEvent};
pub use frame::{Frame, StreamType};
pub use sink::{
    CaptureSink, CaptureStats, MockMuxer, Muxer, MuxerConfig, MuxerDataCallback, MuxerMask,
    RunMode, SinkConfig,
};
pub use sync::{CaptureClock, SyncMode};
