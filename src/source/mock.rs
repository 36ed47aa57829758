//! Mock sources for testing without hardware.
//!
//! Each mock is a cheap handle over shared state: keep a clone before boxing
//! it into a capture to inspect negotiation attempts and lifecycle calls later.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use super::{AudioSource, Overlay, VideoSource};
use crate::error::{CaptureError, Result};
use crate::format::{AudioInfo, FormatId, Region, VideoInfo};
use crate::frame::{Frame, StreamType};

#[derive(Debug, Default)]
struct Lifecycle {
    opened: bool,
    started: bool,
    start_count: usize,
    stop_count: usize,
    closed: bool,
}

#[derive(Debug)]
struct AudioMockState {
    native: AudioInfo,
    accepted: Vec<FormatId>,
    realtime: bool,
    frame_limit: Option<usize>,
    fail_after: Option<usize>,
    requests: Vec<AudioInfo>,
    negotiated: Vec<AudioInfo>,
    frames_read: usize,
    samples_read: u64,
    started_at: Option<Instant>,
    lifecycle: Lifecycle,
}

/// A mock audio source that generates a sine tone.
///
/// The source always produces its native format; negotiation only decides
/// whether the request is acceptable.
///
/// # Example
///
/// ```
/// use stream_capture::format::{AudioInfo, FormatId};
/// use stream_capture::source::{AudioSource, MockAudioSource};
///
/// let mut mock = MockAudioSource::new(AudioInfo::new(FormatId::PCM, 48000, 2, 16))
///     .realtime(false);
/// let probe = mock.clone();
///
/// mock.open().unwrap();
/// let info = mock
///     .negotiate_caps(&AudioInfo::new(FormatId::ANY, 16000, 1, 16))
///     .unwrap();
/// assert_eq!(info.sample_rate, 48000);
/// assert_eq!(probe.negotiated().len(), 1);
/// ```
#[derive(Clone)]
pub struct MockAudioSource {
    state: Arc<Mutex<AudioMockState>>,
}

impl MockAudioSource {
    /// Creates a mock producing `native`, accepting PCM and wildcard requests.
    pub fn new(native: AudioInfo) -> Self {
        Self {
            state: Arc::new(Mutex::new(AudioMockState {
                native,
                accepted: vec![native.format, FormatId::ANY],
                realtime: true,
                frame_limit: None,
                fail_after: None,
                requests: Vec::new(),
                negotiated: Vec::new(),
                frames_read: 0,
                samples_read: 0,
                started_at: None,
                lifecycle: Lifecycle::default(),
            })),
        }
    }

    /// Paces reads to real time. Default: `true`.
    #[must_use]
    pub fn realtime(self, realtime: bool) -> Self {
        self.state.lock().realtime = realtime;
        self
    }

    /// Replaces the list of request formats the source accepts.
    #[must_use]
    pub fn accept_formats(self, formats: &[FormatId]) -> Self {
        self.state.lock().accepted = formats.to_vec();
        self
    }

    /// Ends the stream after `frames` reads.
    #[must_use]
    pub fn frame_limit(self, frames: usize) -> Self {
        self.state.lock().frame_limit = Some(frames);
        self
    }

    /// Fails every read after `frames` successful ones.
    #[must_use]
    pub fn fail_after(self, frames: usize) -> Self {
        self.state.lock().fail_after = Some(frames);
        self
    }

    /// Every request passed to `negotiate_caps`, in order.
    pub fn requests(&self) -> Vec<AudioInfo> {
        self.state.lock().requests.clone()
    }

    /// Results of every successful negotiation.
    pub fn negotiated(&self) -> Vec<AudioInfo> {
        self.state.lock().negotiated.clone()
    }

    /// Number of frames read so far.
    pub fn frames_read(&self) -> usize {
        self.state.lock().frames_read
    }

    /// Returns `true` while started.
    pub fn is_started(&self) -> bool {
        self.state.lock().lifecycle.started
    }

    /// Number of `start` calls.
    pub fn start_count(&self) -> usize {
        self.state.lock().lifecycle.start_count
    }

    /// Returns `true` once closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().lifecycle.closed
    }
}

fn sine_frame(info: &AudioInfo, first_sample: u64, size: usize) -> Vec<u8> {
    let frame_bytes = info.sample_size().max(1);
    let frames = size / frame_bytes;
    let width = usize::from(info.bits_per_sample / 8).max(1);
    let rate = f64::from(info.sample_rate.max(1));
    let mut out = Vec::with_capacity(frames * frame_bytes);
    for i in 0..frames {
        let t = (first_sample + i as u64) as f64 / rate;
        let value = (2.0 * std::f64::consts::PI * 440.0 * t).sin();
        let sample = ((value * 16000.0) as i32) << 16;
        for _ in 0..info.channels {
            out.extend_from_slice(&sample.to_le_bytes()[4 - width..]);
        }
    }
    out
}

impl AudioSource for MockAudioSource {
    fn open(&mut self) -> Result<()> {
        self.state.lock().lifecycle.opened = true;
        Ok(())
    }

    fn supported_codecs(&self) -> Vec<FormatId> {
        vec![self.state.lock().native.format]
    }

    fn negotiate_caps(&mut self, request: &AudioInfo) -> Result<AudioInfo> {
        let mut state = self.state.lock();
        state.requests.push(*request);
        if !state.accepted.contains(&request.format) {
            return Err(CaptureError::not_supported(format!(
                "mock audio source cannot produce {}",
                request.format
            )));
        }
        let native = state.native;
        state.negotiated.push(native);
        Ok(native)
    }

    fn start(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.lifecycle.opened {
            return Err(CaptureError::invalid_state("mock audio source not opened"));
        }
        state.lifecycle.started = true;
        state.lifecycle.start_count += 1;
        state.samples_read = 0;
        state.frames_read = 0;
        state.started_at = Some(Instant::now());
        Ok(())
    }

    fn read_frame(&mut self, size: usize) -> Result<Option<Frame>> {
        let (data, pts, wait) = {
            let mut state = self.state.lock();
            if !state.lifecycle.started {
                return Err(CaptureError::invalid_state("mock audio source not started"));
            }
            if state.frame_limit.is_some_and(|limit| state.frames_read >= limit) {
                return Ok(None);
            }
            if state.fail_after.is_some_and(|limit| state.frames_read >= limit) {
                return Err(CaptureError::internal("mock audio read failure"));
            }
            let info = state.native;
            let rate = u64::from(info.sample_rate.max(1));
            let data = sine_frame(&info, state.samples_read, size);
            let pts = (state.samples_read * 1000 / rate) as u32;
            state.samples_read += (size / info.sample_size().max(1)) as u64;
            state.frames_read += 1;
            let due = Duration::from_millis(state.samples_read * 1000 / rate);
            let wait = match (state.realtime, state.started_at) {
                (true, Some(at)) => due.checked_sub(at.elapsed()),
                _ => None,
            };
            (data, pts, wait)
        };
        if let Some(wait) = wait {
            std::thread::sleep(wait);
        }
        Ok(Some(Frame::new(StreamType::Audio, pts, data)))
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.lifecycle.started = false;
        state.lifecycle.stop_count += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.state.lock().lifecycle.closed = true;
        Ok(())
    }
}

#[derive(Debug)]
struct VideoMockState {
    native: VideoInfo,
    accepted: Vec<FormatId>,
    realtime: bool,
    frame_limit: Option<usize>,
    fail_after: Option<usize>,
    requests: Vec<FormatId>,
    negotiated: Vec<VideoInfo>,
    current: Option<VideoInfo>,
    frames_acquired: usize,
    frames_released: usize,
    last_frame: Option<Instant>,
    lifecycle: Lifecycle,
}

/// A mock camera producing a moving gradient.
///
/// Negotiation accepts the native format, the wildcard, and anything added
/// with [`accept_formats`](MockVideoSource::accept_formats); the resulting
/// resolution and frame rate follow the request when given.
#[derive(Clone)]
pub struct MockVideoSource {
    state: Arc<Mutex<VideoMockState>>,
}

impl MockVideoSource {
    /// Creates a mock whose native output is `native`.
    pub fn new(native: VideoInfo) -> Self {
        Self {
            state: Arc::new(Mutex::new(VideoMockState {
                native,
                accepted: vec![native.format, FormatId::ANY],
                realtime: true,
                frame_limit: None,
                fail_after: None,
                requests: Vec::new(),
                negotiated: Vec::new(),
                current: None,
                frames_acquired: 0,
                frames_released: 0,
                last_frame: None,
                lifecycle: Lifecycle::default(),
            })),
        }
    }

    /// Paces frames to the negotiated frame rate. Default: `true`.
    #[must_use]
    pub fn realtime(self, realtime: bool) -> Self {
        self.state.lock().realtime = realtime;
        self
    }

    /// Replaces the list of request formats the source accepts.
    #[must_use]
    pub fn accept_formats(self, formats: &[FormatId]) -> Self {
        self.state.lock().accepted = formats.to_vec();
        self
    }

    /// Ends the stream after `frames` frames.
    #[must_use]
    pub fn frame_limit(self, frames: usize) -> Self {
        self.state.lock().frame_limit = Some(frames);
        self
    }

    /// Fails every acquire after `frames` successful ones.
    #[must_use]
    pub fn fail_after(self, frames: usize) -> Self {
        self.state.lock().fail_after = Some(frames);
        self
    }

    /// Formats requested through `negotiate_caps`, in order.
    pub fn requests(&self) -> Vec<FormatId> {
        self.state.lock().requests.clone()
    }

    /// Results of every successful negotiation.
    pub fn negotiated(&self) -> Vec<VideoInfo> {
        self.state.lock().negotiated.clone()
    }

    /// Number of frames handed out.
    pub fn frames_acquired(&self) -> usize {
        self.state.lock().frames_acquired
    }

    /// Number of frames handed back.
    pub fn frames_released(&self) -> usize {
        self.state.lock().frames_released
    }

    /// Returns `true` while started.
    pub fn is_started(&self) -> bool {
        self.state.lock().lifecycle.started
    }

    /// Number of `start` calls.
    pub fn start_count(&self) -> usize {
        self.state.lock().lifecycle.start_count
    }

    /// Returns `true` once closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().lifecycle.closed
    }
}

fn gradient_frame(info: &VideoInfo, seq: usize) -> Vec<u8> {
    let size = info.frame_size().unwrap_or(1024);
    let shift = (seq % 256) as u8;
    (0..size).map(|i| (i as u8).wrapping_add(shift)).collect()
}

impl VideoSource for MockVideoSource {
    fn open(&mut self) -> Result<()> {
        self.state.lock().lifecycle.opened = true;
        Ok(())
    }

    fn supported_codecs(&self) -> Vec<FormatId> {
        self.state
            .lock()
            .accepted
            .iter()
            .copied()
            .filter(|f| !f.is_any())
            .collect()
    }

    fn negotiate_caps(&mut self, request: &VideoInfo) -> Result<VideoInfo> {
        let mut state = self.state.lock();
        state.requests.push(request.format);
        if !state.accepted.contains(&request.format) {
            return Err(CaptureError::not_supported(format!(
                "mock video source cannot produce {}",
                request.format
            )));
        }
        let native = state.native;
        let pick = |req: u16, native: u16| if req == 0 { native } else { req };
        let info = VideoInfo {
            format: if request.format.is_any() {
                native.format
            } else {
                request.format
            },
            width: pick(request.width, native.width),
            height: pick(request.height, native.height),
            fps: if request.fps == 0 { native.fps } else { request.fps },
        };
        state.negotiated.push(info);
        state.current = Some(info);
        Ok(info)
    }

    fn start(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.current.is_none() {
            return Err(CaptureError::invalid_state("mock video source not negotiated"));
        }
        state.lifecycle.started = true;
        state.lifecycle.start_count += 1;
        state.frames_acquired = 0;
        state.last_frame = None;
        Ok(())
    }

    fn acquire_frame(&mut self) -> Result<Option<Frame>> {
        let (data, pts, wait) = {
            let mut state = self.state.lock();
            if !state.lifecycle.started {
                return Err(CaptureError::invalid_state("mock video source not started"));
            }
            if state.frame_limit.is_some_and(|limit| state.frames_acquired >= limit) {
                return Ok(None);
            }
            if state.fail_after.is_some_and(|limit| state.frames_acquired >= limit) {
                return Err(CaptureError::internal("mock video acquire failure"));
            }
            let info = state.current.unwrap_or(state.native);
            let interval = Duration::from_millis(u64::from(info.frame_interval_ms()));
            let wait = match (state.realtime, state.last_frame) {
                (true, Some(at)) => interval.checked_sub(at.elapsed()),
                _ => None,
            };
            let seq = state.frames_acquired;
            state.frames_acquired += 1;
            let pts = seq as u32 * info.frame_interval_ms();
            (gradient_frame(&info, seq), pts, wait)
        };
        if let Some(wait) = wait {
            std::thread::sleep(wait);
        }
        self.state.lock().last_frame = Some(Instant::now());
        Ok(Some(Frame::new(StreamType::Video, pts, data)))
    }

    fn release_frame(&mut self, _frame: Frame) -> Result<()> {
        self.state.lock().frames_released += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.lifecycle.started = false;
        state.lifecycle.stop_count += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.state.lock().lifecycle.closed = true;
        Ok(())
    }
}

/// A solid-colour RGB565 overlay.
#[derive(Debug, Clone)]
pub struct MockOverlay {
    region: Region,
    color: u16,
    alpha: u8,
}

impl MockOverlay {
    /// Creates an opaque overlay filling `region` with `color`.
    pub fn new(region: Region, color: u16) -> Self {
        Self {
            region,
            color,
            alpha: 255,
        }
    }
}

impl Overlay for MockOverlay {
    fn region(&self) -> (FormatId, Region) {
        (FormatId::RGB565, self.region)
    }

    fn set_alpha(&mut self, alpha: u8) -> Result<()> {
        self.alpha = alpha;
        Ok(())
    }

    fn alpha(&self) -> u8 {
        self.alpha
    }

    fn acquire_frame(&mut self) -> Result<Option<Frame>> {
        let pixels = usize::from(self.region.width) * usize::from(self.region.height);
        let data: Vec<u8> = std::iter::repeat(self.color.to_le_bytes())
            .take(pixels)
            .flatten()
            .collect();
        Ok(Some(Frame::new(StreamType::Video, 0, Bytes::from(data))))
    }

    fn release_frame(&mut self, _frame: Frame) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_48k() -> AudioInfo {
        AudioInfo::new(FormatId::PCM, 48000, 2, 16)
    }

    #[test]
    fn test_mock_audio_negotiates_native() {
        let mut mock = MockAudioSource::new(stereo_48k()).realtime(false);
        let info = mock
            .negotiate_caps(&AudioInfo::new(FormatId::PCM, 16000, 1, 16))
            .unwrap();
        assert_eq!(info, stereo_48k());
        assert_eq!(mock.requests().len(), 1);
    }

    #[test]
    fn test_mock_audio_rejects_encoded() {
        let mut mock = MockAudioSource::new(stereo_48k());
        let err = mock
            .negotiate_caps(&AudioInfo::new(FormatId::AAC, 16000, 1, 16))
            .unwrap_err();
        assert!(err.is_not_supported());
        assert!(mock.negotiated().is_empty());
    }

    #[test]
    fn test_mock_audio_read_sizes_and_pts() {
        let mut mock = MockAudioSource::new(stereo_48k()).realtime(false);
        mock.open().unwrap();
        mock.start().unwrap();
        let first = mock.read_frame(3840).unwrap().unwrap();
        assert_eq!(first.len(), 3840);
        assert_eq!(first.pts, 0);
        let second = mock.read_frame(3840).unwrap().unwrap();
        // 3840 bytes of 48k stereo 16-bit is 20ms.
        assert_eq!(second.pts, 20);
    }

    #[test]
    fn test_mock_audio_frame_limit() {
        let mut mock = MockAudioSource::new(stereo_48k())
            .realtime(false)
            .frame_limit(2);
        mock.open().unwrap();
        mock.start().unwrap();
        assert!(mock.read_frame(64).unwrap().is_some());
        assert!(mock.read_frame(64).unwrap().is_some());
        assert!(mock.read_frame(64).unwrap().is_none());
    }

    #[test]
    fn test_mock_audio_requires_start() {
        let mut mock = MockAudioSource::new(stereo_48k());
        assert!(mock.read_frame(64).is_err());
    }

    #[test]
    fn test_mock_video_wildcard_returns_native_format() {
        let native = VideoInfo::new(FormatId::RGB565, 320, 240, 15);
        let mut mock = MockVideoSource::new(native).realtime(false);
        let err = mock
            .negotiate_caps(&VideoInfo::new(FormatId::H264, 640, 480, 30))
            .unwrap_err();
        assert!(err.is_not_supported());
        let info = mock
            .negotiate_caps(&VideoInfo::new(FormatId::ANY, 640, 480, 30))
            .unwrap();
        assert_eq!(info, VideoInfo::new(FormatId::RGB565, 640, 480, 30));
        assert_eq!(mock.requests(), vec![FormatId::H264, FormatId::ANY]);
    }

    #[test]
    fn test_mock_video_frames() {
        let native = VideoInfo::new(FormatId::RGB565, 16, 8, 30);
        let mut mock = MockVideoSource::new(native).realtime(false).frame_limit(1);
        mock.open().unwrap();
        mock.negotiate_caps(&native).unwrap();
        mock.start().unwrap();
        let frame = mock.acquire_frame().unwrap().unwrap();
        assert_eq!(frame.len(), 16 * 8 * 2);
        mock.release_frame(frame).unwrap();
        assert!(mock.acquire_frame().unwrap().is_none());
        assert_eq!(mock.frames_released(), 1);
    }

    #[test]
    fn test_mock_video_fail_after() {
        let native = VideoInfo::new(FormatId::RGB565, 16, 8, 30);
        let mut mock = MockVideoSource::new(native).realtime(false).fail_after(1);
        mock.open().unwrap();
        mock.negotiate_caps(&native).unwrap();
        mock.start().unwrap();
        assert!(mock.acquire_frame().unwrap().is_some());
        assert!(mock.acquire_frame().is_err());
    }

    #[test]
    fn test_mock_overlay_fill() {
        let mut overlay = MockOverlay::new(Region::new(0, 0, 2, 2), 0xF800);
        let frame = overlay.acquire_frame().unwrap().unwrap();
        assert_eq!(frame.len(), 8);
        assert_eq!(&frame.data[..2], &0xF800u16.to_le_bytes());
        overlay.set_alpha(128).unwrap();
        assert_eq!(overlay.alpha(), 128);
    }
}
