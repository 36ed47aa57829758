//! Capture source abstraction.
//!
//! Sources are the drivers at the head of every pipeline: a microphone or
//! codec for audio, a camera for video, and optional overlay providers that
//! are blended into video frames. The capture core only talks to them through
//! these traits.

mod mock;

pub use mock::{MockAudioSource, MockOverlay, MockVideoSource};

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{CaptureError, Result};
use crate::format::{AudioInfo, FormatId, Region, VideoInfo};
use crate::frame::Frame;

/// An audio capture driver.
///
/// Call order is `open`, `negotiate_caps` (possibly several times),
/// `start`, any number of `read_frame`, `stop`, and finally `close`.
/// A stopped source may be negotiated and started again.
pub trait AudioSource: Send {
    /// Opens the device.
    fn open(&mut self) -> Result<()>;

    /// Formats the source can produce natively.
    fn supported_codecs(&self) -> Vec<FormatId>;

    /// Pins the source to one format regardless of later negotiation.
    fn set_fixed_caps(&mut self, caps: &AudioInfo) -> Result<()> {
        let _ = caps;
        Err(CaptureError::not_supported("fixed caps"))
    }

    /// Agrees on an output format.
    ///
    /// `request.format` may be [`FormatId::ANY`], in which case the source
    /// answers with whatever it produces natively.
    fn negotiate_caps(&mut self, request: &AudioInfo) -> Result<AudioInfo>;

    /// Starts capturing.
    fn start(&mut self) -> Result<()>;

    /// Reads `size` bytes of audio.
    ///
    /// Returns `Ok(None)` once the source has no more data.
    fn read_frame(&mut self, size: usize) -> Result<Option<Frame>>;

    /// Stops capturing.
    fn stop(&mut self) -> Result<()>;

    /// Closes the device.
    fn close(&mut self) -> Result<()>;
}

/// A video capture driver.
pub trait VideoSource: Send {
    /// Opens the device.
    fn open(&mut self) -> Result<()>;

    /// Formats the source can produce natively.
    fn supported_codecs(&self) -> Vec<FormatId>;

    /// Pins the source to one format regardless of later negotiation.
    fn set_fixed_caps(&mut self, caps: &VideoInfo) -> Result<()> {
        let _ = caps;
        Err(CaptureError::not_supported("fixed caps"))
    }

    /// Agrees on an output format; see [`AudioSource::negotiate_caps`].
    fn negotiate_caps(&mut self, request: &VideoInfo) -> Result<VideoInfo>;

    /// Starts capturing.
    fn start(&mut self) -> Result<()>;

    /// Waits for the next frame. Returns `Ok(None)` once the source has no
    /// more data.
    fn acquire_frame(&mut self) -> Result<Option<Frame>>;

    /// Hands a frame obtained from [`acquire_frame`](VideoSource::acquire_frame) back.
    fn release_frame(&mut self, frame: Frame) -> Result<()>;

    /// Stops capturing.
    fn stop(&mut self) -> Result<()>;

    /// Closes the device.
    fn close(&mut self) -> Result<()>;
}

/// Provides an image to blend on top of video frames.
pub trait Overlay: Send {
    /// Prepares the overlay.
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Pixel format of the overlay image and where it goes in the frame.
    fn region(&self) -> (FormatId, Region);

    /// Sets the blend factor (0 transparent, 255 opaque).
    fn set_alpha(&mut self, alpha: u8) -> Result<()>;

    /// Current blend factor.
    fn alpha(&self) -> u8;

    /// Gets the current overlay image, `Ok(None)` when nothing should be drawn.
    fn acquire_frame(&mut self) -> Result<Option<Frame>>;

    /// Returns an image obtained from [`acquire_frame`](Overlay::acquire_frame).
    fn release_frame(&mut self, frame: Frame) -> Result<()>;

    /// Releases the overlay.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Audio source shared between the control plane and its pipeline worker.
pub type SharedAudioSource = Arc<Mutex<Box<dyn AudioSource>>>;

/// Video source shared between the control plane and its pipeline worker.
pub type SharedVideoSource = Arc<Mutex<Box<dyn VideoSource>>>;

/// Overlay shared between a sink and the overlay stage drawing it.
pub type SharedOverlay = Arc<Mutex<Box<dyn Overlay>>>;
