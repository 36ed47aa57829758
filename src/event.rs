//! Runtime events for monitoring capture health.
//!
//! Asynchronous faults are only ever reported here. Path managers post
//! [`PathEvent`]s to a channel; the capture dispatcher thread applies them to
//! the sinks and then hands a [`CaptureEvent`] to the user callback, so
//! callbacks never run on a pipeline worker thread.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::frame::StreamType;

/// Events emitted by a capture session.
///
/// # Example
///
/// ```
/// use stream_capture::CaptureEvent;
///
/// fn handle_event(event: CaptureEvent) {
///     match event {
///         CaptureEvent::Started => println!("capture started"),
///         CaptureEvent::Stopped => println!("capture stopped"),
///         CaptureEvent::Error { path } => eprintln!("path {path:?} failed"),
///         CaptureEvent::Finished { path } => println!("path {path} finished"),
///         CaptureEvent::AudioPipelineBuilt | CaptureEvent::VideoPipelineBuilt => {}
///     }
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEvent {
    /// The session started.
    Started,

    /// The session stopped.
    Stopped,

    /// A path failed to start or its pipeline reported a runtime fault.
    ///
    /// The path is marked disabled; consumers drain buffered frames and then
    /// get [`CaptureError::NotFound`](crate::CaptureError::NotFound).
    Error {
        /// Sink index, or `None` when the failure is not tied to one sink.
        path: Option<u8>,
    },

    /// A source reached the end of its data.
    Finished {
        /// Sink index.
        path: u8,
    },

    /// The audio pipeline builder finished building its pipelines.
    AudioPipelineBuilt,

    /// The video pipeline builder finished building its pipelines.
    VideoPipelineBuilt,
}

/// Callback type for receiving capture events.
///
/// Register one via [`CaptureBuilder::on_event()`](crate::CaptureBuilder::on_event).
/// Path and pipeline events are invoked from the capture dispatcher thread;
/// [`CaptureEvent::Started`] and [`CaptureEvent::Stopped`] from the thread
/// calling [`Capture::start`](crate::Capture::start) or
/// [`Capture::stop`](crate::Capture::stop).
///
/// # Example
///
/// ```
/// use stream_capture::format::{AudioInfo, FormatId};
/// use stream_capture::source::MockAudioSource;
/// use stream_capture::Capture;
///
/// let capture = Capture::builder()
///     .audio_source(MockAudioSource::new(AudioInfo::new(FormatId::PCM, 16_000, 1, 16)))
///     .on_event(|event| {
///         tracing::warn!(?event, "capture event");
///     })
///     .open()?;
/// # capture.close()?;
/// # Ok::<(), stream_capture::CaptureError>(())
/// ```
pub type EventCallback = Arc<dyn Fn(CaptureEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// # Example
///
/// ```
/// use stream_capture::{event_callback, CaptureEvent};
///
/// let callback = event_callback(|event| {
///     println!("Got event: {:?}", event);
/// });
/// callback(CaptureEvent::Started);
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(CaptureEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// What happened on a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PathEventKind {
    Started,
    Stopped,
    Error,
    Finished,
    PipelineBuilt,
}

/// Event posted by a path manager for one sink path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PathEvent {
    pub stream: StreamType,
    pub path: u8,
    pub kind: PathEventKind,
}

impl PathEvent {
    pub fn new(stream: StreamType, path: u8, kind: PathEventKind) -> Self {
        Self { stream, path, kind }
    }
}

pub(crate) type PathEventSender = mpsc::UnboundedSender<PathEvent>;
pub(crate) type PathEventReceiver = mpsc::UnboundedReceiver<PathEvent>;

/// Events a sink sees on its own channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkEvent {
    /// The stream's path started.
    Started(StreamType),
    /// The stream's path stopped.
    Stopped(StreamType),
    /// The stream's path failed; remaining frames can still be drained.
    Error(StreamType),
    /// The stream's source reached end of data.
    Finished(StreamType),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_event_debug() {
        let event = CaptureEvent::Error { path: Some(2) };
        let debug = format!("{:?}", event);
        assert!(debug.contains("Error"));
        assert!(debug.contains('2'));
    }

    #[test]
    fn test_event_callback_helper() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        let callback = event_callback(move |_| {
            called_clone.store(true, Ordering::SeqCst);
        });

        callback(CaptureEvent::Stopped);
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_path_event_channel() {
        let (tx, mut rx): (PathEventSender, PathEventReceiver) = mpsc::unbounded_channel();
        tx.send(PathEvent::new(StreamType::Video, 1, PathEventKind::Error))
            .unwrap();
        drop(tx);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.path, 1);
        assert_eq!(event.kind, PathEventKind::Error);
        assert!(rx.recv().await.is_none());
    }
}
