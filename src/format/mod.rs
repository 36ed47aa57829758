//! Stream format descriptors and raw sample/pixel conversion.

pub mod convert;
pub mod resample;

/// Four-character code identifying an audio codec, video codec or pixel format.
///
/// # Example
///
/// ```
/// use stream_capture::format::FormatId;
///
/// assert_eq!(FormatId::H264.to_string(), "H264");
/// assert!(FormatId::AAC.is_encoded());
/// assert!(!FormatId::RGB565.is_encoded());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FormatId(u32);

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | ((code[1] as u32) << 8) | ((code[2] as u32) << 16) | ((code[3] as u32) << 24)
}

impl FormatId {
    /// No format: the stream is not configured.
    pub const NONE: Self = Self(0);
    /// Wildcard: accept whatever the producer natively outputs.
    pub const ANY: Self = Self(0xFFFF);

    /// Raw PCM audio.
    pub const PCM: Self = Self(fourcc(b"PCM "));
    /// G.711 A-law.
    pub const G711A: Self = Self(fourcc(b"ALAW"));
    /// G.711 mu-law.
    pub const G711U: Self = Self(fourcc(b"ULAW"));
    /// Opus.
    pub const OPUS: Self = Self(fourcc(b"OPUS"));
    /// AAC.
    pub const AAC: Self = Self(fourcc(b"AAC "));

    /// H.264.
    pub const H264: Self = Self(fourcc(b"H264"));
    /// Motion JPEG.
    pub const MJPEG: Self = Self(fourcc(b"MJPG"));
    /// RGB565, little endian.
    pub const RGB565: Self = Self(fourcc(b"RGBL"));
    /// RGB565, big endian.
    pub const RGB565_BE: Self = Self(fourcc(b"RGBB"));
    /// Packed RGB888.
    pub const RGB888: Self = Self(fourcc(b"RGB3"));
    /// Packed BGR888.
    pub const BGR888: Self = Self(fourcc(b"BGR3"));
    /// Planar YUV 4:2:0 (I420).
    pub const YUV420: Self = Self(fourcc(b"YU12"));
    /// Planar YUV 4:2:2.
    pub const YUV422P: Self = Self(fourcc(b"422P"));
    /// Packed YUYV 4:2:2.
    pub const YUV422: Self = Self(fourcc(b"YUYV"));
    /// Odd lines UYY, even lines VYY (4:2:0 packed).
    pub const O_UYY_E_VYY: Self = Self(fourcc(b"OUEV"));

    /// Creates a format id from a four-character code.
    #[must_use]
    pub const fn from_fourcc(code: &[u8; 4]) -> Self {
        Self(fourcc(code))
    }

    /// Raw numeric value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns `true` for [`FormatId::NONE`].
    #[must_use]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    /// Returns `true` for [`FormatId::ANY`].
    #[must_use]
    pub fn is_any(self) -> bool {
        self == Self::ANY
    }

    /// Returns `true` for compressed formats that need an encoder to produce.
    #[must_use]
    pub fn is_encoded(self) -> bool {
        matches!(
            self,
            Self::G711A | Self::G711U | Self::OPUS | Self::AAC | Self::H264 | Self::MJPEG
        )
    }

    /// Returns `true` for audio codecs, including PCM.
    #[must_use]
    pub fn is_audio(self) -> bool {
        matches!(
            self,
            Self::PCM | Self::G711A | Self::G711U | Self::OPUS | Self::AAC
        )
    }

    /// Returns `true` for video codecs and pixel formats.
    #[must_use]
    pub fn is_video(self) -> bool {
        !self.is_none() && !self.is_any() && !self.is_audio()
    }
}

impl std::fmt::Display for FormatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            return f.write_str("NONE");
        }
        if self.is_any() {
            return f.write_str("ANY");
        }
        let bytes = self.0.to_le_bytes();
        let text: String = bytes.iter().map(|&b| char::from(b)).collect();
        f.write_str(text.trim_end())
    }
}

impl std::fmt::Debug for FormatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FormatId({self})")
    }
}

/// Shape of an audio stream at one point of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AudioInfo {
    /// Codec.
    pub format: FormatId,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u8,
    /// Bits per sample.
    pub bits_per_sample: u8,
}

impl AudioInfo {
    /// Creates an audio descriptor.
    #[must_use]
    pub const fn new(format: FormatId, sample_rate: u32, channels: u8, bits_per_sample: u8) -> Self {
        Self {
            format,
            sample_rate,
            channels,
            bits_per_sample,
        }
    }

    /// Returns `true` if no audio is configured.
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.format.is_none()
    }

    /// Bytes per interleaved sample frame (all channels).
    #[must_use]
    pub fn sample_size(&self) -> usize {
        usize::from(self.channels) * usize::from(self.bits_per_sample) / 8
    }

    /// Number of PCM bytes covering `ms` milliseconds.
    #[must_use]
    pub fn bytes_for_ms(&self, ms: u32) -> usize {
        self.sample_size() * (self.sample_rate as usize * ms as usize / 1000)
    }

    /// Field-wise maximum of rate, channels and bit depth.
    ///
    /// The format of `self` is kept unless `other` asks for a concrete codec.
    #[must_use]
    pub fn join(&self, other: &AudioInfo) -> AudioInfo {
        let format = if other.format.is_encoded() {
            other.format
        } else {
            self.format
        };
        AudioInfo {
            format,
            sample_rate: self.sample_rate.max(other.sample_rate),
            channels: self.channels.max(other.channels),
            bits_per_sample: self.bits_per_sample.max(other.bits_per_sample),
        }
    }
}

impl std::fmt::Display for AudioInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}Hz {}ch {}bit",
            self.format, self.sample_rate, self.channels, self.bits_per_sample
        )
    }
}

/// Shape of a video stream at one point of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct VideoInfo {
    /// Codec or pixel format.
    pub format: FormatId,
    /// Width in pixels.
    pub width: u16,
    /// Height in pixels.
    pub height: u16,
    /// Frames per second.
    pub fps: u8,
}

impl VideoInfo {
    /// Creates a video descriptor.
    #[must_use]
    pub const fn new(format: FormatId, width: u16, height: u16, fps: u8) -> Self {
        Self {
            format,
            width,
            height,
            fps,
        }
    }

    /// Returns `true` if no video is configured.
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.format.is_none()
    }

    /// Pixel count.
    #[must_use]
    pub fn area(&self) -> u32 {
        u32::from(self.width) * u32::from(self.height)
    }

    /// Size of one raw frame in bytes, `None` for compressed formats.
    #[must_use]
    pub fn frame_size(&self) -> Option<usize> {
        let pixels = self.area() as usize;
        let size = match self.format {
            FormatId::RGB565 | FormatId::RGB565_BE | FormatId::YUV422 | FormatId::YUV422P => {
                pixels * 2
            }
            FormatId::RGB888 | FormatId::BGR888 => pixels * 3,
            FormatId::YUV420 | FormatId::O_UYY_E_VYY => pixels * 3 / 2,
            _ => return None,
        };
        Some(size)
    }

    /// Frame interval in milliseconds.
    #[must_use]
    pub fn frame_interval_ms(&self) -> u32 {
        if self.fps == 0 {
            return 0;
        }
        1000 / u32::from(self.fps)
    }

    /// Field-wise maximum of resolution and frame rate; the format of `self` is kept.
    #[must_use]
    pub fn join(&self, other: &VideoInfo) -> VideoInfo {
        VideoInfo {
            format: self.format,
            width: self.width.max(other.width),
            height: self.height.max(other.height),
            fps: self.fps.max(other.fps),
        }
    }
}

impl std::fmt::Display for VideoInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}x{}@{}",
            self.format, self.width, self.height, self.fps
        )
    }
}

/// Format descriptor of either stream kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamInfo {
    /// Audio descriptor.
    Audio(AudioInfo),
    /// Video descriptor.
    Video(VideoInfo),
}

impl StreamInfo {
    /// Audio descriptor, if this is audio.
    #[must_use]
    pub fn audio(&self) -> Option<AudioInfo> {
        match self {
            Self::Audio(info) => Some(*info),
            Self::Video(_) => None,
        }
    }

    /// Video descriptor, if this is video.
    #[must_use]
    pub fn video(&self) -> Option<VideoInfo> {
        match self {
            Self::Video(info) => Some(*info),
            Self::Audio(_) => None,
        }
    }
}

impl std::fmt::Display for StreamInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio(info) => info.fmt(f),
            Self::Video(info) => info.fmt(f),
        }
    }
}

/// Rectangle inside a video frame, used for overlays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    /// Left edge in pixels.
    pub x: u16,
    /// Top edge in pixels.
    pub y: u16,
    /// Width in pixels.
    pub width: u16,
    /// Height in pixels.
    pub height: u16,
}

impl Region {
    /// Creates a region.
    #[must_use]
    pub const fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Returns `true` if the region lies inside a `width` x `height` frame.
    #[must_use]
    pub fn fits(&self, width: u16, height: u16) -> bool {
        u32::from(self.x) + u32::from(self.width) <= u32::from(width)
            && u32::from(self.y) + u32::from(self.height) <= u32::from(height)
    }
}
