//! Presentation clock shared by the audio and video paths.

use std::time::Instant;

use parking_lot::Mutex;

/// How frame timestamps are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Sources stamp their own frames.
    None,
    /// Video is stamped with wall-clock time since start.
    #[default]
    System,
    /// The audio path drives the clock; video is stamped relative to the
    /// latest audio timestamp.
    Audio,
}

#[derive(Debug)]
struct ClockState {
    started: bool,
    last_update: Instant,
    last_pts: u32,
}

/// Millisecond clock used to stamp captured frames.
///
/// In [`SyncMode::Audio`], the audio path calls
/// [`audio_update`](CaptureClock::audio_update) with every frame's pts and
/// video reads [`current`](CaptureClock::current), which extrapolates from
/// the last update.
#[derive(Debug)]
pub struct CaptureClock {
    mode: SyncMode,
    state: Mutex<ClockState>,
}

impl CaptureClock {
    /// Creates a stopped clock.
    pub fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            state: Mutex::new(ClockState {
                started: false,
                last_update: Instant::now(),
                last_pts: 0,
            }),
        }
    }

    /// Clock mode.
    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Starts the clock from zero.
    pub fn start(&self) {
        let mut state = self.state.lock();
        state.started = true;
        state.last_pts = 0;
        state.last_update = Instant::now();
    }

    /// Freezes the clock at its last reference point.
    pub fn stop(&self) {
        self.state.lock().started = false;
    }

    /// Feeds an audio timestamp. Ignored unless the mode is [`SyncMode::Audio`].
    pub fn audio_update(&self, pts: u32) {
        if self.mode != SyncMode::Audio {
            return;
        }
        let mut state = self.state.lock();
        state.last_pts = pts;
        state.last_update = Instant::now();
    }

    /// Current presentation time in milliseconds.
    pub fn current(&self) -> u32 {
        let state = self.state.lock();
        if !state.started {
            return state.last_pts;
        }
        let elapsed = state.last_update.elapsed().as_millis() as u32;
        state.last_pts.wrapping_add(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_stopped_clock_holds() {
        let clock = CaptureClock::new(SyncMode::System);
        assert_eq!(clock.current(), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.current(), 0);
    }

    #[test]
    fn test_running_clock_advances() {
        let clock = CaptureClock::new(SyncMode::System);
        clock.start();
        std::thread::sleep(Duration::from_millis(20));
        assert!(clock.current() >= 20);
    }

    #[test]
    fn test_audio_update_only_in_audio_mode() {
        let system = CaptureClock::new(SyncMode::System);
        system.audio_update(5000);
        assert_eq!(system.current(), 0);

        let audio = CaptureClock::new(SyncMode::Audio);
        audio.audio_update(5000);
        assert_eq!(audio.current(), 5000);
        audio.start();
        audio.audio_update(7000);
        assert!(audio.current() >= 7000);
    }

    #[test]
    fn test_stop_freezes() {
        let clock = CaptureClock::new(SyncMode::Audio);
        clock.start();
        clock.audio_update(100);
        clock.stop();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.current(), 100);
    }
}
