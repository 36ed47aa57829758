//! Processing stages and the built-in converters.
//!
//! A stage declares what it can change through [`StageCap`] tags.
//! Negotiation only ever touches a stage through those tags: it computes the
//! stage's input and output descriptors and hands them over with
//! [`Stage::configure`].

use std::sync::Arc;

use bytes::Bytes;

use crate::error::{CaptureError, Result};
use crate::format::convert::{
    can_convert_pixels, convert_bits, convert_channels, convert_pixels, i32_to_pcm, packed_bpp,
    pcm_to_i32, scale_packed,
};
use crate::format::resample::resample_interleaved;
use crate::format::{AudioInfo, FormatId, VideoInfo};
use crate::frame::Frame;
use crate::source::SharedOverlay;

/// Capability tag of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageCap {
    /// Changes the audio channel count.
    AudioChannelConvert,
    /// Changes the audio bit depth.
    AudioBitConvert,
    /// Changes the audio sample rate.
    AudioRateConvert,
    /// Encodes audio.
    AudioEncoder,
    /// Changes the pixel format.
    VideoColorConvert,
    /// Changes the frame rate.
    VideoFpsConvert,
    /// Changes the resolution.
    VideoScale,
    /// Encodes video.
    VideoEncoder,
    /// Blends an overlay image into frames.
    VideoOverlay,
}

/// Input and output descriptors negotiated for a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSetting {
    /// Audio stage setting.
    Audio {
        /// What the stage receives.
        input: AudioInfo,
        /// What the stage must produce.
        output: AudioInfo,
    },
    /// Video stage setting.
    Video {
        /// What the stage receives.
        input: VideoInfo,
        /// What the stage must produce.
        output: VideoInfo,
    },
}

/// Runtime control forwarded to a stage.
#[derive(Clone)]
pub enum StageControl {
    /// Target bitrate in bits per second.
    Bitrate(u32),
    /// Overlay to blend.
    Overlay(SharedOverlay),
    /// Turns overlay blending on or off.
    OverlayEnable(bool),
}

impl std::fmt::Debug for StageControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bitrate(bps) => f.debug_tuple("Bitrate").field(bps).finish(),
            Self::Overlay(_) => f.write_str("Overlay(..)"),
            Self::OverlayEnable(on) => f.debug_tuple("OverlayEnable").field(on).finish(),
        }
    }
}

/// One processing unit of a pipeline.
pub trait Stage: Send {
    /// Registered name, e.g. `"aud_rate_cvt"`.
    fn name(&self) -> &str;

    /// What this stage can change.
    fn caps(&self) -> &[StageCap];

    /// Applies a negotiated setting. May be called again with a new setting
    /// before the pipeline runs.
    fn configure(&mut self, setting: &StageSetting) -> Result<()> {
        let _ = setting;
        Ok(())
    }

    /// Processes one frame, pushing zero or more output frames.
    fn process(&mut self, frame: Frame, out: &mut Vec<Frame>) -> Result<()>;

    /// Bytes consumed and the maximum produced per encoded packet, for encoders.
    fn frame_size(&self) -> Option<(usize, usize)> {
        None
    }

    /// Raw formats an encoder accepts when producing `codec`.
    fn input_formats(&self, codec: FormatId) -> Vec<FormatId> {
        let _ = codec;
        Vec::new()
    }

    /// Applies a runtime control.
    fn control(&mut self, control: StageControl) -> Result<()> {
        Err(CaptureError::not_supported(format!(
            "{} does not accept {control:?}",
            self.name()
        )))
    }

    /// Drops buffered state before the pipeline is run again.
    fn reset(&mut self) {}

    /// Returns `true` if this stage declares `cap`.
    fn has_cap(&self, cap: StageCap) -> bool {
        self.caps().contains(&cap)
    }
}

/// Creates a fresh stage instance.
pub type StageFactory = Arc<dyn Fn() -> Box<dyn Stage> + Send + Sync>;

/// Names of the built-in stages.
pub mod names {
    /// Audio source head marker.
    pub const AUDIO_SOURCE: &str = "aud_src";
    /// Audio channel converter.
    pub const AUDIO_CHANNEL: &str = "aud_ch_cvt";
    /// Audio bit depth converter.
    pub const AUDIO_BIT: &str = "aud_bit_cvt";
    /// Audio resampler.
    pub const AUDIO_RATE: &str = "aud_rate_cvt";
    /// Audio encoder.
    pub const AUDIO_ENCODER: &str = "aud_enc";
    /// Video source head marker.
    pub const VIDEO_SOURCE: &str = "vid_src";
    /// Pixel format converter.
    pub const VIDEO_COLOR: &str = "vid_color_cvt";
    /// Scaler.
    pub const VIDEO_SCALE: &str = "vid_scale";
    /// Frame rate converter.
    pub const VIDEO_FPS: &str = "vid_fps_cvt";
    /// Overlay mixer.
    pub const VIDEO_OVERLAY: &str = "vid_overlay";
    /// Video encoder.
    pub const VIDEO_ENCODER: &str = "vid_enc";
}

fn audio_setting(name: &str, setting: &StageSetting) -> Result<(AudioInfo, AudioInfo)> {
    match setting {
        StageSetting::Audio { input, output } => Ok((*input, *output)),
        StageSetting::Video { .. } => Err(CaptureError::invalid_arg(format!(
            "{name} expects an audio setting"
        ))),
    }
}

fn video_setting(name: &str, setting: &StageSetting) -> Result<(VideoInfo, VideoInfo)> {
    match setting {
        StageSetting::Video { input, output } => Ok((*input, *output)),
        StageSetting::Audio { .. } => Err(CaptureError::invalid_arg(format!(
            "{name} expects a video setting"
        ))),
    }
}

/// Converters only touch PCM; an unchanged stream of any format passes through.
fn require_pcm(name: &str, input: &AudioInfo, output: &AudioInfo) -> Result<()> {
    if input == output {
        return Ok(());
    }
    if input.format != FormatId::PCM || output.format != FormatId::PCM {
        return Err(CaptureError::not_supported(format!(
            "{name} only converts PCM, got {} -> {}",
            input.format, output.format
        )));
    }
    Ok(())
}

/// Up- or down-mixes interleaved PCM.
#[derive(Debug, Default)]
pub struct ChannelConvert {
    setting: Option<(AudioInfo, AudioInfo)>,
}

impl Stage for ChannelConvert {
    fn name(&self) -> &str {
        names::AUDIO_CHANNEL
    }

    fn caps(&self) -> &[StageCap] {
        &[StageCap::AudioChannelConvert]
    }

    fn configure(&mut self, setting: &StageSetting) -> Result<()> {
        let (input, output) = audio_setting(self.name(), setting)?;
        require_pcm(self.name(), &input, &output)?;
        if input.channels == 0 || output.channels == 0 {
            return Err(CaptureError::invalid_arg("zero channel count"));
        }
        self.setting = Some((input, output));
        Ok(())
    }

    fn process(&mut self, frame: Frame, out: &mut Vec<Frame>) -> Result<()> {
        match self.setting {
            Some((input, output)) if input.channels != output.channels => {
                let samples = pcm_to_i32(&frame.data, input.bits_per_sample);
                let mixed = convert_channels(&samples, input.channels, output.channels);
                out.push(frame.with_data(i32_to_pcm(&mixed, input.bits_per_sample)));
            }
            _ => out.push(frame),
        }
        Ok(())
    }
}

/// Changes PCM bit depth.
#[derive(Debug, Default)]
pub struct BitConvert {
    setting: Option<(AudioInfo, AudioInfo)>,
}

impl Stage for BitConvert {
    fn name(&self) -> &str {
        names::AUDIO_BIT
    }

    fn caps(&self) -> &[StageCap] {
        &[StageCap::AudioBitConvert]
    }

    fn configure(&mut self, setting: &StageSetting) -> Result<()> {
        let (input, output) = audio_setting(self.name(), setting)?;
        require_pcm(self.name(), &input, &output)?;
        for bits in [input.bits_per_sample, output.bits_per_sample] {
            if !matches!(bits, 8 | 16 | 24 | 32) {
                return Err(CaptureError::not_supported(format!("{bits}-bit PCM")));
            }
        }
        self.setting = Some((input, output));
        Ok(())
    }

    fn process(&mut self, frame: Frame, out: &mut Vec<Frame>) -> Result<()> {
        match self.setting {
            Some((input, output)) if input.bits_per_sample != output.bits_per_sample => {
                let data = convert_bits(&frame.data, input.bits_per_sample, output.bits_per_sample);
                out.push(frame.with_data(data));
            }
            _ => out.push(frame),
        }
        Ok(())
    }
}

/// Resamples interleaved PCM.
#[derive(Debug, Default)]
pub struct RateConvert {
    setting: Option<(AudioInfo, AudioInfo)>,
}

impl Stage for RateConvert {
    fn name(&self) -> &str {
        names::AUDIO_RATE
    }

    fn caps(&self) -> &[StageCap] {
        &[StageCap::AudioRateConvert]
    }

    fn configure(&mut self, setting: &StageSetting) -> Result<()> {
        let (input, output) = audio_setting(self.name(), setting)?;
        require_pcm(self.name(), &input, &output)?;
        if input.sample_rate == 0 || output.sample_rate == 0 {
            return Err(CaptureError::invalid_arg("zero sample rate"));
        }
        self.setting = Some((input, output));
        Ok(())
    }

    fn process(&mut self, frame: Frame, out: &mut Vec<Frame>) -> Result<()> {
        match self.setting {
            Some((input, output)) if input.sample_rate != output.sample_rate => {
                let samples = pcm_to_i32(&frame.data, input.bits_per_sample);
                let resampled = resample_interleaved(
                    &samples,
                    input.channels,
                    input.sample_rate,
                    output.sample_rate,
                );
                out.push(frame.with_data(i32_to_pcm(&resampled, input.bits_per_sample)));
            }
            _ => out.push(frame),
        }
        Ok(())
    }
}

/// Converts between raw pixel formats.
#[derive(Debug, Default)]
pub struct ColorConvert {
    setting: Option<(VideoInfo, VideoInfo)>,
}

impl Stage for ColorConvert {
    fn name(&self) -> &str {
        names::VIDEO_COLOR
    }

    fn caps(&self) -> &[StageCap] {
        &[StageCap::VideoColorConvert]
    }

    fn configure(&mut self, setting: &StageSetting) -> Result<()> {
        let (input, output) = video_setting(self.name(), setting)?;
        if !can_convert_pixels(input.format, output.format) {
            return Err(CaptureError::not_supported(format!(
                "no color conversion {} -> {}",
                input.format, output.format
            )));
        }
        self.setting = Some((input, output));
        Ok(())
    }

    fn process(&mut self, frame: Frame, out: &mut Vec<Frame>) -> Result<()> {
        match self.setting {
            Some((input, output)) if input.format != output.format => {
                let data = convert_pixels(
                    &frame.data,
                    input.width,
                    input.height,
                    input.format,
                    output.format,
                )
                .ok_or_else(|| {
                    CaptureError::internal(format!(
                        "color conversion {} -> {} failed on {} bytes",
                        input.format,
                        output.format,
                        frame.len()
                    ))
                })?;
                out.push(frame.with_data(data));
            }
            _ => out.push(frame),
        }
        Ok(())
    }
}

/// Nearest-neighbour scaler for packed formats.
#[derive(Debug, Default)]
pub struct Scale {
    setting: Option<(VideoInfo, VideoInfo)>,
}

impl Stage for Scale {
    fn name(&self) -> &str {
        names::VIDEO_SCALE
    }

    fn caps(&self) -> &[StageCap] {
        &[StageCap::VideoScale]
    }

    fn configure(&mut self, setting: &StageSetting) -> Result<()> {
        let (input, output) = video_setting(self.name(), setting)?;
        let resized = (input.width, input.height) != (output.width, output.height);
        if resized && packed_bpp(input.format).is_none() {
            return Err(CaptureError::not_supported(format!(
                "cannot scale {}",
                input.format
            )));
        }
        self.setting = Some((input, output));
        Ok(())
    }

    fn process(&mut self, frame: Frame, out: &mut Vec<Frame>) -> Result<()> {
        let Some((input, output)) = self.setting else {
            out.push(frame);
            return Ok(());
        };
        if (input.width, input.height) == (output.width, output.height) {
            out.push(frame);
            return Ok(());
        }
        let bpp = packed_bpp(input.format).unwrap_or(1);
        let data = scale_packed(
            &frame.data,
            bpp,
            (input.width, input.height),
            (output.width, output.height),
        );
        out.push(frame.with_data(data));
        Ok(())
    }
}

/// Drops frames to lower the frame rate.
#[derive(Debug, Default)]
pub struct FpsConvert {
    setting: Option<(VideoInfo, VideoInfo)>,
    seen: u64,
    emitted: u64,
}

impl Stage for FpsConvert {
    fn name(&self) -> &str {
        names::VIDEO_FPS
    }

    fn caps(&self) -> &[StageCap] {
        &[StageCap::VideoFpsConvert]
    }

    fn configure(&mut self, setting: &StageSetting) -> Result<()> {
        let (input, output) = video_setting(self.name(), setting)?;
        if output.fps > input.fps {
            return Err(CaptureError::not_supported(format!(
                "cannot raise frame rate {} -> {}",
                input.fps, output.fps
            )));
        }
        self.setting = Some((input, output));
        self.reset();
        Ok(())
    }

    fn process(&mut self, frame: Frame, out: &mut Vec<Frame>) -> Result<()> {
        let Some((input, output)) = self.setting else {
            out.push(frame);
            return Ok(());
        };
        if output.fps >= input.fps || input.fps == 0 {
            out.push(frame);
            return Ok(());
        }
        // Emit while the output count lags the ideal count for frames seen.
        self.seen += 1;
        let due = self.seen * u64::from(output.fps) / u64::from(input.fps);
        if due > self.emitted {
            self.emitted += 1;
            out.push(frame);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.seen = 0;
        self.emitted = 0;
    }
}

/// Alpha-blends an [`Overlay`](crate::source::Overlay) into RGB565 frames.
#[derive(Default)]
pub struct OverlayMixer {
    format: Option<VideoInfo>,
    overlay: Option<SharedOverlay>,
    enabled: bool,
}

fn blend_565(dst: u16, src: u16, alpha: u16) -> u16 {
    let mix = |d: u16, s: u16| (s * alpha + d * (255 - alpha)) / 255;
    let r = mix((dst >> 11) & 0x1F, (src >> 11) & 0x1F);
    let g = mix((dst >> 5) & 0x3F, (src >> 5) & 0x3F);
    let b = mix(dst & 0x1F, src & 0x1F);
    (r << 11) | (g << 5) | b
}

impl OverlayMixer {
    fn blend(&self, frame: &Frame, info: &VideoInfo) -> Result<Option<Bytes>> {
        let Some(overlay) = &self.overlay else {
            return Ok(None);
        };
        let mut overlay = overlay.lock();
        let (format, region) = overlay.region();
        if format != FormatId::RGB565 || info.format != FormatId::RGB565 {
            return Ok(None);
        }
        if !region.fits(info.width, info.height) {
            return Ok(None);
        }
        let Some(image) = overlay.acquire_frame()? else {
            return Ok(None);
        };
        let alpha = u16::from(overlay.alpha());
        let mut data = frame.data.to_vec();
        let stride = usize::from(info.width) * 2;
        let row_bytes = usize::from(region.width) * 2;
        for row in 0..usize::from(region.height) {
            let src_row = image.data.get(row * row_bytes..(row + 1) * row_bytes);
            let dst_at = (usize::from(region.y) + row) * stride + usize::from(region.x) * 2;
            let (Some(src_row), Some(dst_row)) = (src_row, data.get_mut(dst_at..dst_at + row_bytes))
            else {
                break;
            };
            for (d, s) in dst_row.chunks_exact_mut(2).zip(src_row.chunks_exact(2)) {
                let px = blend_565(
                    u16::from_le_bytes([d[0], d[1]]),
                    u16::from_le_bytes([s[0], s[1]]),
                    alpha,
                );
                d.copy_from_slice(&px.to_le_bytes());
            }
        }
        overlay.release_frame(image)?;
        Ok(Some(Bytes::from(data)))
    }
}

impl Stage for OverlayMixer {
    fn name(&self) -> &str {
        names::VIDEO_OVERLAY
    }

    fn caps(&self) -> &[StageCap] {
        &[StageCap::VideoOverlay]
    }

    fn configure(&mut self, setting: &StageSetting) -> Result<()> {
        let (input, _) = video_setting(self.name(), setting)?;
        self.format = Some(input);
        Ok(())
    }

    fn process(&mut self, frame: Frame, out: &mut Vec<Frame>) -> Result<()> {
        let blended = match (&self.format, self.enabled) {
            (Some(info), true) => self.blend(&frame, info)?,
            _ => None,
        };
        match blended {
            Some(data) => out.push(frame.with_data(data)),
            None => out.push(frame),
        }
        Ok(())
    }

    fn control(&mut self, control: StageControl) -> Result<()> {
        match control {
            StageControl::Overlay(overlay) => {
                self.overlay = Some(overlay);
                Ok(())
            }
            StageControl::OverlayEnable(enable) => {
                self.enabled = enable;
                Ok(())
            }
            StageControl::Bitrate(_) => Err(CaptureError::not_supported("overlay bitrate")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Region;
    use crate::frame::StreamType;
    use crate::source::{MockOverlay, Overlay};
    use parking_lot::Mutex;

    fn audio(rate: u32, ch: u8, bits: u8) -> AudioInfo {
        AudioInfo::new(FormatId::PCM, rate, ch, bits)
    }

    fn run(stage: &mut dyn Stage, frame: Frame) -> Vec<Frame> {
        let mut out = Vec::new();
        stage.process(frame, &mut out).unwrap();
        out
    }

    #[test]
    fn test_channel_convert_downmix() {
        let mut stage = ChannelConvert::default();
        stage
            .configure(&StageSetting::Audio {
                input: audio(16000, 2, 16),
                output: audio(16000, 1, 16),
            })
            .unwrap();
        let pcm: Vec<u8> = [100i16, 300, -50, -150]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let out = run(&mut stage, Frame::new(StreamType::Audio, 7, pcm));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].pts, 7);
        assert_eq!(&out[0].data[..], &[200i16.to_le_bytes(), (-100i16).to_le_bytes()].concat()[..]);
    }

    #[test]
    fn test_rate_convert_length() {
        let mut stage = RateConvert::default();
        stage
            .configure(&StageSetting::Audio {
                input: audio(48000, 1, 16),
                output: audio(16000, 1, 16),
            })
            .unwrap();
        let out = run(&mut stage, Frame::new(StreamType::Audio, 0, vec![0u8; 960 * 2]));
        assert_eq!(out[0].len(), 320 * 2);
    }

    #[test]
    fn test_bit_convert_rejects_encoded() {
        let mut stage = BitConvert::default();
        let err = stage
            .configure(&StageSetting::Audio {
                input: AudioInfo::new(FormatId::AAC, 16000, 1, 16),
                output: audio(16000, 1, 8),
            })
            .unwrap_err();
        assert!(err.is_not_supported());
    }

    #[test]
    fn test_unchanged_encoded_audio_passes() {
        let aac = AudioInfo::new(FormatId::AAC, 16000, 1, 16);
        let mut stage = ChannelConvert::default();
        stage
            .configure(&StageSetting::Audio {
                input: aac,
                output: aac,
            })
            .unwrap();
        let out = run(&mut stage, Frame::new(StreamType::Audio, 0, vec![1u8; 12]));
        assert_eq!(out[0].len(), 12);
    }

    #[test]
    fn test_wrong_setting_kind() {
        let mut stage = ChannelConvert::default();
        let video = VideoInfo::new(FormatId::RGB565, 2, 2, 1);
        assert!(stage
            .configure(&StageSetting::Video {
                input: video,
                output: video
            })
            .is_err());
    }

    #[test]
    fn test_color_convert_rgb_to_yuv() {
        let mut stage = ColorConvert::default();
        stage
            .configure(&StageSetting::Video {
                input: VideoInfo::new(FormatId::RGB565, 4, 4, 15),
                output: VideoInfo::new(FormatId::YUV420, 4, 4, 15),
            })
            .unwrap();
        let out = run(&mut stage, Frame::new(StreamType::Video, 0, vec![0u8; 32]));
        assert_eq!(out[0].len(), 24);
    }

    #[test]
    fn test_color_convert_unsupported() {
        let mut stage = ColorConvert::default();
        let err = stage
            .configure(&StageSetting::Video {
                input: VideoInfo::new(FormatId::YUV420, 4, 4, 15),
                output: VideoInfo::new(FormatId::RGB565, 4, 4, 15),
            })
            .unwrap_err();
        assert!(err.is_not_supported());
    }

    #[test]
    fn test_scale_halves() {
        let mut stage = Scale::default();
        stage
            .configure(&StageSetting::Video {
                input: VideoInfo::new(FormatId::RGB565, 4, 4, 15),
                output: VideoInfo::new(FormatId::RGB565, 2, 2, 15),
            })
            .unwrap();
        let out = run(&mut stage, Frame::new(StreamType::Video, 0, vec![1u8; 32]));
        assert_eq!(out[0].len(), 8);
    }

    #[test]
    fn test_fps_convert_halves_rate() {
        let mut stage = FpsConvert::default();
        stage
            .configure(&StageSetting::Video {
                input: VideoInfo::new(FormatId::RGB565, 2, 2, 30),
                output: VideoInfo::new(FormatId::RGB565, 2, 2, 15),
            })
            .unwrap();
        let mut emitted = 0;
        for i in 0..30 {
            emitted += run(&mut stage, Frame::new(StreamType::Video, i, vec![0u8; 8])).len();
        }
        assert_eq!(emitted, 15);
    }

    #[test]
    fn test_overlay_blends_region() {
        let mut stage = OverlayMixer::default();
        let info = VideoInfo::new(FormatId::RGB565, 4, 2, 15);
        stage
            .configure(&StageSetting::Video {
                input: info,
                output: info,
            })
            .unwrap();
        let overlay: Box<dyn Overlay> = Box::new(MockOverlay::new(Region::new(1, 0, 2, 1), 0xFFFF));
        stage
            .control(StageControl::Overlay(Arc::new(Mutex::new(overlay))))
            .unwrap();

        // Disabled: untouched.
        let out = run(&mut stage, Frame::new(StreamType::Video, 0, vec![0u8; 16]));
        assert!(out[0].data.iter().all(|&b| b == 0));

        stage.control(StageControl::OverlayEnable(true)).unwrap();
        let out = run(&mut stage, Frame::new(StreamType::Video, 0, vec![0u8; 16]));
        assert_eq!(&out[0].data[0..2], &[0, 0]);
        assert_eq!(&out[0].data[2..6], &[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&out[0].data[6..8], &[0, 0]);
    }

    #[test]
    fn test_default_control_not_supported() {
        let mut stage = RateConvert::default();
        assert!(stage.control(StageControl::Bitrate(1000)).unwrap_err().is_not_supported());
    }
}
