//! Media frame with metadata.

use bytes::Bytes;

use crate::queue::Ticket;

/// Kind of stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    /// Raw or encoded audio.
    Audio,
    /// Raw or encoded video.
    Video,
    /// Container output produced by a muxer.
    Muxer,
}

impl StreamType {
    /// Short lowercase name used in logs and thread names.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Muxer => "muxer",
        }
    }
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A buffer of media data moving through the capture pipeline.
///
/// Payloads are stored in [`Bytes`], so cloning a frame for every consumer
/// of a share queue never copies the data.
///
/// An empty frame is the end-of-stream marker: it is queued to wake up
/// consumers when a path stops or fails.
///
/// # Example
///
/// ```
/// use stream_capture::{Frame, StreamType};
///
/// let frame = Frame::new(StreamType::Audio, 40, vec![0u8; 640]);
/// assert_eq!(frame.len(), 640);
/// assert!(!frame.is_end_of_stream());
///
/// let eos = Frame::end_of_stream(StreamType::Audio);
/// assert!(eos.is_end_of_stream());
/// ```
#[derive(Debug, Clone)]
pub struct Frame {
    /// Stream this frame belongs to.
    pub stream_type: StreamType,

    /// Presentation timestamp in milliseconds.
    pub pts: u32,

    /// Frame payload.
    pub data: Bytes,

    /// Share queue entry this frame was handed out from, if any.
    pub(crate) ticket: Option<Ticket>,
}

impl Frame {
    /// Creates a new frame.
    pub fn new(stream_type: StreamType, pts: u32, data: impl Into<Bytes>) -> Self {
        Self {
            stream_type,
            pts,
            data: data.into(),
            ticket: None,
        }
    }

    /// Creates an empty end-of-stream frame.
    pub fn end_of_stream(stream_type: StreamType) -> Self {
        Self::new(stream_type, 0, Bytes::new())
    }

    /// Returns `true` if this is an end-of-stream marker.
    pub fn is_end_of_stream(&self) -> bool {
        self.data.is_empty()
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Replaces the payload, keeping stream type and timestamp.
    #[must_use]
    pub fn with_data(&self, data: impl Into<Bytes>) -> Self {
        Self {
            stream_type: self.stream_type,
            pts: self.pts,
            data: data.into(),
            ticket: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_new() {
        let frame = Frame::new(StreamType::Video, 33, vec![1u8, 2, 3]);
        assert_eq!(frame.stream_type, StreamType::Video);
        assert_eq!(frame.pts, 33);
        assert_eq!(frame.len(), 3);
        assert!(frame.ticket.is_none());
    }

    #[test]
    fn test_end_of_stream() {
        let frame = Frame::end_of_stream(StreamType::Audio);
        assert!(frame.is_end_of_stream());
        assert!(frame.is_empty());
        assert_eq!(frame.pts, 0);
    }

    #[test]
    fn test_clone_shares_payload() {
        let frame = Frame::new(StreamType::Audio, 0, vec![7u8; 1024]);
        let cloned = frame.clone();
        assert_eq!(frame.data.as_ptr(), cloned.data.as_ptr());
    }

    #[test]
    fn test_with_data_keeps_metadata() {
        let frame = Frame::new(StreamType::Audio, 120, vec![0u8; 4]);
        let out = frame.with_data(vec![1u8, 2]);
        assert_eq!(out.pts, 120);
        assert_eq!(out.stream_type, StreamType::Audio);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_stream_type_display() {
        assert_eq!(StreamType::Audio.to_string(), "audio");
        assert_eq!(StreamType::Muxer.to_string(), "muxer");
    }
}
