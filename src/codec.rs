//! Encoder stages.
//!
//! Real codecs live behind the [`Stage`] trait and are registered by name.
//! This module ships G.711 (a complete A-law / mu-law encoder) and a mock
//! encoder that reproduces the framing of AAC, Opus, H.264 and MJPEG without
//! compressing anything, which is enough to exercise negotiation, frame
//! sizing and muxing.

use crate::error::{CaptureError, Result};
use crate::format::{AudioInfo, FormatId, VideoInfo};
use crate::frame::{Frame, StreamType};
use crate::pipeline::stage::{names, Stage, StageCap, StageControl, StageSetting};

/// Samples per AAC-LC frame.
const AAC_FRAME_SAMPLES: usize = 1024;
/// Opus and G.711 frame duration.
const SPEECH_FRAME_MS: usize = 20;
/// Size of the mock packet header: fourcc plus sequence number.
const MOCK_HEADER: usize = 8;

/// Encodes one 16-bit linear sample as G.711 A-law.
pub fn linear_to_alaw(sample: i16) -> u8 {
    let mut pcm = i32::from(sample) >> 3;
    let mask = if pcm >= 0 {
        0xD5
    } else {
        pcm = -pcm - 1;
        0x55
    };
    let segment = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF]
        .iter()
        .position(|&end| pcm <= end);
    let Some(seg) = segment else {
        return 0x7F ^ mask;
    };
    let shift = if seg < 2 { 1 } else { seg };
    let value = ((seg as i32) << 4) | ((pcm >> shift) & 0x0F);
    (value as u8) ^ mask
}

/// Encodes one 16-bit linear sample as G.711 mu-law.
pub fn linear_to_ulaw(sample: i16) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;
    let mut pcm = i32::from(sample);
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(CLIP) + BIAS;
    let exponent = (7 - (pcm >> 7).leading_zeros().saturating_sub(24) as i32).clamp(0, 7);
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

#[derive(Debug, Clone, Copy)]
enum Config {
    Audio { input: AudioInfo, output: AudioInfo },
    Video { input: VideoInfo, output: VideoInfo },
}

/// Encoder stage for every codec the capture core knows.
///
/// The codec is chosen by the output format of the negotiated setting. When
/// input and output formats are equal the stage passes frames through.
pub struct MockEncoder {
    stream: StreamType,
    config: Option<Config>,
    bitrate: u32,
    pending: Vec<u8>,
    pending_pts: Option<u32>,
    sequence: u32,
}

impl MockEncoder {
    /// Creates an audio encoder.
    pub fn audio() -> Self {
        Self::new(StreamType::Audio)
    }

    /// Creates a video encoder.
    pub fn video() -> Self {
        Self::new(StreamType::Video)
    }

    fn new(stream: StreamType) -> Self {
        Self {
            stream,
            config: None,
            bitrate: 0,
            pending: Vec::new(),
            pending_pts: None,
            sequence: 0,
        }
    }

    /// Bitrate set through [`StageControl::Bitrate`], 0 when unset.
    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    fn audio_input_bytes(input: &AudioInfo, codec: FormatId) -> usize {
        let samples = match codec {
            FormatId::AAC => AAC_FRAME_SAMPLES,
            _ => input.sample_rate as usize * SPEECH_FRAME_MS / 1000,
        };
        samples * input.sample_size()
    }

    fn audio_output_bytes(input: &AudioInfo, codec: FormatId) -> usize {
        let in_bytes = Self::audio_input_bytes(input, codec);
        match codec {
            FormatId::G711A | FormatId::G711U => in_bytes / 2,
            _ => MOCK_HEADER + in_bytes / 8,
        }
    }

    fn check_audio(input: &AudioInfo, output: &AudioInfo) -> Result<()> {
        if input == output {
            return Ok(());
        }
        if input.format != FormatId::PCM {
            return Err(CaptureError::not_supported(format!(
                "audio encoder needs PCM input, got {}",
                input.format
            )));
        }
        if output.format == FormatId::PCM {
            if input != output {
                return Err(CaptureError::not_supported(
                    "audio encoder bypass cannot convert PCM",
                ));
            }
            return Ok(());
        }
        if !matches!(
            output.format,
            FormatId::AAC | FormatId::OPUS | FormatId::G711A | FormatId::G711U
        ) {
            return Err(CaptureError::not_supported(format!(
                "no audio encoder for {}",
                output.format
            )));
        }
        if input.sample_rate != output.sample_rate || input.channels != output.channels {
            return Err(CaptureError::not_supported(format!(
                "encoder input {input} does not match output {output}"
            )));
        }
        if matches!(output.format, FormatId::G711A | FormatId::G711U) && input.bits_per_sample != 16
        {
            return Err(CaptureError::not_supported("G.711 needs 16-bit input"));
        }
        Ok(())
    }

    fn check_video(&self, input: &VideoInfo, output: &VideoInfo) -> Result<()> {
        if input.format == output.format {
            if (input.width, input.height) != (output.width, output.height) {
                return Err(CaptureError::not_supported("encoder cannot scale"));
            }
            return Ok(());
        }
        if !output.format.is_encoded() {
            return Err(CaptureError::not_supported(format!(
                "encoder cannot output raw {}",
                output.format
            )));
        }
        if !self.input_formats(output.format).contains(&input.format) {
            return Err(CaptureError::not_supported(format!(
                "{} encoder does not accept {}",
                output.format, input.format
            )));
        }
        if (input.width, input.height) != (output.width, output.height) {
            return Err(CaptureError::not_supported("encoder cannot scale"));
        }
        Ok(())
    }

    fn packet(&mut self, codec: FormatId, pts: u32, body: &[u8]) -> Frame {
        let mut data = Vec::with_capacity(MOCK_HEADER + body.len());
        data.extend_from_slice(&codec.raw().to_le_bytes());
        data.extend_from_slice(&self.sequence.to_le_bytes());
        data.extend_from_slice(body);
        self.sequence = self.sequence.wrapping_add(1);
        Frame::new(self.stream, pts, data)
    }

    fn encode_audio(
        &mut self,
        input: AudioInfo,
        output: AudioInfo,
        frame: Frame,
        out: &mut Vec<Frame>,
    ) {
        let in_bytes = Self::audio_input_bytes(&input, output.format).max(1);
        if self.pending.is_empty() {
            self.pending_pts = Some(frame.pts);
        }
        self.pending.extend_from_slice(&frame.data);
        let bytes_per_ms = (input.sample_size() * input.sample_rate as usize / 1000).max(1);
        while self.pending.len() >= in_bytes {
            let chunk: Vec<u8> = self.pending.drain(..in_bytes).collect();
            let pts = self.pending_pts.unwrap_or(frame.pts);
            let encoded = match output.format {
                FormatId::G711A | FormatId::G711U => chunk
                    .chunks_exact(2)
                    .map(|c| {
                        let s = i16::from_le_bytes([c[0], c[1]]);
                        if output.format == FormatId::G711A {
                            linear_to_alaw(s)
                        } else {
                            linear_to_ulaw(s)
                        }
                    })
                    .collect::<Vec<u8>>(),
                codec => {
                    let body: Vec<u8> = chunk.iter().step_by(8).copied().collect();
                    let packet = self.packet(codec, pts, &body);
                    packet.data.to_vec()
                }
            };
            out.push(Frame::new(StreamType::Audio, pts, encoded));
            self.pending_pts = Some(pts + (in_bytes / bytes_per_ms) as u32);
        }
    }
}

impl Stage for MockEncoder {
    fn name(&self) -> &str {
        match self.stream {
            StreamType::Video => names::VIDEO_ENCODER,
            _ => names::AUDIO_ENCODER,
        }
    }

    fn caps(&self) -> &[StageCap] {
        match self.stream {
            StreamType::Video => &[StageCap::VideoEncoder],
            _ => &[StageCap::AudioEncoder],
        }
    }

    fn configure(&mut self, setting: &StageSetting) -> Result<()> {
        let config = match (self.stream, setting) {
            (StreamType::Video, StageSetting::Video { input, output }) => {
                self.check_video(input, output)?;
                Config::Video {
                    input: *input,
                    output: *output,
                }
            }
            (StreamType::Audio, StageSetting::Audio { input, output }) => {
                Self::check_audio(input, output)?;
                Config::Audio {
                    input: *input,
                    output: *output,
                }
            }
            _ => {
                return Err(CaptureError::invalid_arg(format!(
                    "{} got a setting for another stream",
                    self.name()
                )))
            }
        };
        self.config = Some(config);
        self.reset();
        Ok(())
    }

    fn process(&mut self, frame: Frame, out: &mut Vec<Frame>) -> Result<()> {
        match self.config {
            None => Err(CaptureError::invalid_state("encoder not configured")),
            Some(Config::Audio { input, output }) if input.format != output.format => {
                self.encode_audio(input, output, frame, out);
                Ok(())
            }
            Some(Config::Video { input, output }) if input.format != output.format => {
                let ratio = if output.format == FormatId::H264 { 10 } else { 4 };
                let body: Vec<u8> = frame.data.iter().step_by(ratio).copied().collect();
                let packet = self.packet(output.format, frame.pts, &body);
                out.push(packet);
                Ok(())
            }
            Some(_) => {
                out.push(frame);
                Ok(())
            }
        }
    }

    fn frame_size(&self) -> Option<(usize, usize)> {
        match self.config? {
            Config::Audio { input, output }
                if output.format != FormatId::PCM && input.format != output.format =>
            {
                Some((
                    Self::audio_input_bytes(&input, output.format),
                    Self::audio_output_bytes(&input, output.format),
                ))
            }
            Config::Audio { .. } => None,
            Config::Video { input, .. } => {
                let raw = input.frame_size()?;
                Some((raw, raw))
            }
        }
    }

    fn input_formats(&self, codec: FormatId) -> Vec<FormatId> {
        match codec {
            FormatId::H264 => vec![FormatId::YUV420, FormatId::O_UYY_E_VYY],
            FormatId::MJPEG => vec![FormatId::YUV420, FormatId::YUV422P, FormatId::RGB565],
            FormatId::AAC | FormatId::OPUS | FormatId::G711A | FormatId::G711U => {
                vec![FormatId::PCM]
            }
            _ => Vec::new(),
        }
    }

    fn control(&mut self, control: StageControl) -> Result<()> {
        match control {
            StageControl::Bitrate(bps) => {
                self.bitrate = bps;
                Ok(())
            }
            other => Err(CaptureError::not_supported(format!(
                "encoder does not accept {other:?}"
            ))),
        }
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.pending_pts = None;
        self.sequence = 0;
    }
}
