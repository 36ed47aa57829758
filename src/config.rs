//! Configuration types for capture sessions and worker threads.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{CaptureError, Result};
use crate::format::{FormatId, VideoInfo};
use crate::sync::SyncMode;

/// Maximum number of sinks (output paths) per capture.
pub const MAX_SINKS: usize = 3;

/// Configuration for capture behavior.
///
/// Use [`CaptureConfig::default()`] for sensible defaults, or customize as needed.
///
/// # Example
///
/// ```
/// use stream_capture::CaptureConfig;
/// use std::time::Duration;
///
/// let config = CaptureConfig {
///     video_queue_depth: 3,
///     share_add_timeout: Duration::from_millis(50),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Depth of every audio consumer queue and of the audio share queue's
    /// tracking ring.
    ///
    /// Default: 5
    pub audio_queue_depth: usize,

    /// Depth of every video consumer queue and of the video share queue's
    /// tracking ring.
    ///
    /// Default: 5
    pub video_queue_depth: usize,

    /// How long a producer waits for a free tracking slot before the frame
    /// is dropped.
    ///
    /// Default: 100ms
    pub share_add_timeout: Duration,

    /// Audio production granularity used when no encoder asks for a
    /// specific frame size.
    ///
    /// Default: 20ms
    pub audio_frame_duration: Duration,

    /// Muxer streaming cache reserved for audio, in bytes.
    ///
    /// Default: 20 KiB
    pub muxer_audio_cache: usize,

    /// Number of encoded video frames the muxer streaming cache holds.
    ///
    /// Default: 3
    pub muxer_cache_frames: usize,

    /// Clock used to timestamp frames. `None` picks [`SyncMode::Audio`] when
    /// an audio source is present, otherwise [`SyncMode::System`].
    ///
    /// Default: `None`
    pub sync_mode: Option<SyncMode>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            audio_queue_depth: 5,
            video_queue_depth: 5,
            share_add_timeout: Duration::from_millis(100),
            audio_frame_duration: Duration::from_millis(20),
            muxer_audio_cache: 20 * 1024,
            muxer_cache_frames: 3,
            sync_mode: None,
        }
    }
}

impl CaptureConfig {
    /// Size of the muxer streaming cache for a sink with the given streams.
    ///
    /// Video frames are budgeted by codec and by the longer side of the
    /// picture (640, 1280, 1920 and up).
    #[must_use]
    pub fn muxer_cache_size(&self, has_audio: bool, video: &VideoInfo) -> usize {
        let mut size = if has_audio { self.muxer_audio_cache } else { 0 };
        let table: &[usize] = match video.format {
            FormatId::H264 => &[20, 40, 100],
            FormatId::MJPEG => &[40, 100, 200],
            _ => return size,
        };
        let idx = (usize::from(video.width.max(video.height)) / 640).min(table.len() - 1);
        size += table[idx] * self.muxer_cache_frames * 1024;
        size
    }
}

/// Scheduling parameters for one worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadConfig {
    /// Relative priority. Recorded for diagnostics; the OS default policy is used.
    ///
    /// Default: 0
    pub priority: i32,

    /// Stack size in bytes; `0` keeps the platform default.
    ///
    /// Default: 0
    pub stack_size: usize,

    /// CPU core to pin the thread to.
    ///
    /// Default: `None`
    pub core: Option<usize>,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            priority: 0,
            stack_size: 0,
            core: None,
        }
    }
}

type SchedulerFn = dyn Fn(&str) -> ThreadConfig + Send + Sync;

/// Maps a worker thread name to its [`ThreadConfig`].
///
/// Worker names are `"<stream>_<pipeline>"` for pipeline segments and
/// `"muxer_<sink>"` for muxer threads, so encoders can be pinned away from
/// feed-in threads.
///
/// # Example
///
/// ```
/// use stream_capture::{ThreadConfig, ThreadScheduler};
///
/// let scheduler = ThreadScheduler::new(|name| ThreadConfig {
///     core: name.contains("enc").then_some(1),
///     ..Default::default()
/// });
/// assert_eq!(scheduler.config_for("video_enc").core, Some(1));
/// assert_eq!(scheduler.config_for("audio_src").core, None);
/// ```
#[derive(Clone)]
pub struct ThreadScheduler {
    inner: Arc<SchedulerFn>,
}

impl ThreadScheduler {
    /// Creates a scheduler from a closure.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str) -> ThreadConfig + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// Returns the configuration for the thread called `name`.
    #[must_use]
    pub fn config_for(&self, name: &str) -> ThreadConfig {
        (self.inner)(name)
    }

    /// Spawns a named worker thread using the configuration for `name`.
    pub(crate) fn spawn<F, T>(&self, name: &str, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let cfg = self.config_for(name);
        let mut builder = std::thread::Builder::new().name(name.to_string());
        if cfg.stack_size > 0 {
            builder = builder.stack_size(cfg.stack_size);
        }
        let core = cfg.core;
        let thread_name = name.to_string();
        debug!(thread = %name, priority = cfg.priority, core = ?core, "spawning worker");
        builder
            .spawn(move || {
                if let Some(id) = core {
                    if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
                        warn!(thread = %thread_name, core = id, "failed to pin thread");
                    }
                }
                f()
            })
            .map_err(|e| CaptureError::no_resources(format!("thread {name}: {e}")))
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::new(|_| ThreadConfig::default())
    }
}

impl std::fmt::Debug for ThreadScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadScheduler").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_config_defaults() {
        let config = CaptureConfig::default();
        assert_eq!(config.audio_queue_depth, 5);
        assert_eq!(config.video_queue_depth, 5);
        assert_eq!(config.share_add_timeout, Duration::from_millis(100));
        assert_eq!(config.audio_frame_duration, Duration::from_millis(20));
        assert_eq!(config.muxer_audio_cache, 20 * 1024);
        assert_eq!(config.muxer_cache_frames, 3);
        assert!(config.sync_mode.is_none());
    }

    #[test]
    fn test_muxer_cache_size() {
        let config = CaptureConfig::default();
        let none = VideoInfo::default();
        assert_eq!(config.muxer_cache_size(true, &none), 20 * 1024);
        assert_eq!(config.muxer_cache_size(false, &none), 0);

        let vga = VideoInfo::new(FormatId::H264, 320, 240, 15);
        assert_eq!(config.muxer_cache_size(false, &vga), 20 * 3 * 1024);

        let hd = VideoInfo::new(FormatId::MJPEG, 1280, 720, 15);
        assert_eq!(config.muxer_cache_size(true, &hd), 20 * 1024 + 200 * 3 * 1024);

        let huge = VideoInfo::new(FormatId::H264, 3840, 2160, 30);
        assert_eq!(config.muxer_cache_size(false, &huge), 100 * 3 * 1024);
    }

    #[test]
    fn test_thread_config_default() {
        let cfg = ThreadConfig::default();
        assert_eq!(cfg.stack_size, 0);
        assert!(cfg.core.is_none());
    }

    #[test]
    fn test_scheduler_spawn_named() {
        let scheduler = ThreadScheduler::new(|_| ThreadConfig {
            stack_size: 256 * 1024,
            ..Default::default()
        });
        let handle = scheduler
            .spawn("audio_test", || {
                std::thread::current().name().map(str::to_string)
            })
            .unwrap();
        assert_eq!(handle.join().unwrap().as_deref(), Some("audio_test"));
    }
}
