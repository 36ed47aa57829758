//! Worker threads running pipelines.
//!
//! Each running pipeline has one [`PipelineTask`]. Its worker pulls frames
//! from the stream source or from an upstream copier port, runs them through
//! the stages, and pushes the result into its own copier or hands it to the
//! sink delivery callback. End of data and faults are reported as path events
//! for every path the pipeline serves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use super::stage::Stage;
use super::topology::{path_bit, path_index, Linked};
use super::{Pipeline, PipelineInput, SourceHandle};
use crate::config::{ThreadScheduler, MAX_SINKS};
use crate::error::{CaptureError, Result};
use crate::event::{PathEvent, PathEventKind, PathEventSender};
use crate::frame::Frame;
use crate::queue::{ShareQueue, Ticket};
use crate::sync::{CaptureClock, SyncMode};

/// Delivers a frame produced by a sink pipeline to the sink of `path`.
///
/// Returning [`CaptureError::NotSupported`] means the sink does not want the
/// frame; it is counted as dropped.
pub(crate) type FrameHandler = Arc<dyn Fn(u8, Frame) -> Result<()> + Send + Sync>;

const UPSTREAM_POLL: Duration = Duration::from_millis(100);
const DISABLED_BACKOFF: Duration = Duration::from_millis(10);

/// What a worker needs besides its pipeline.
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub source: SourceHandle,
    pub deliver: FrameHandler,
    pub events: PathEventSender,
    pub clock: Arc<CaptureClock>,
    pub scheduler: ThreadScheduler,
}

enum Output {
    Copier(Arc<ShareQueue<Frame>>),
    Sink { path: u8, deliver: FrameHandler },
}

enum Input {
    Source,
    Upstream {
        copier: Arc<ShareQueue<Frame>>,
        port: usize,
    },
}

/// Handle to the worker thread of one pipeline.
pub(crate) struct PipelineTask {
    pipeline: Arc<Pipeline>,
    ctx: TaskContext,
    upstream: Option<(Arc<ShareQueue<Frame>>, usize)>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PipelineTask {
    /// Binds a task to `pipelines[idx]`. Nothing runs until [`run`](Self::run).
    pub fn new(pipelines: &[Arc<Pipeline>], idx: usize, ctx: TaskContext) -> Result<Self> {
        let pipeline = pipelines
            .get(idx)
            .cloned()
            .ok_or_else(|| CaptureError::not_found(format!("pipeline {idx}")))?;
        let upstream = match pipeline.input() {
            PipelineInput::Source => None,
            PipelineInput::Upstream { pipeline: up, port } => {
                let copier = pipelines.get(up).and_then(|p| p.copier()).ok_or_else(|| {
                    CaptureError::internal(format!("{} has no upstream copier", pipeline.name()))
                })?;
                Some((copier, port))
            }
        };
        Ok(Self {
            pipeline,
            ctx,
            upstream,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        })
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Starts the worker. Starts the source first for head pipelines.
    pub fn run(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        let output = match self.pipeline.copier() {
            Some(copier) => Output::Copier(copier),
            None => {
                let path = path_index(self.pipeline.path_mask()).ok_or_else(|| {
                    CaptureError::invalid_state(format!("{} serves no path", self.pipeline.name()))
                })?;
                Output::Sink {
                    path,
                    deliver: self.ctx.deliver.clone(),
                }
            }
        };

        self.pipeline.reset_stages();
        self.stop.store(false, Ordering::Release);
        let input = match &self.upstream {
            Some((copier, port)) => {
                copier.enable(*port, true)?;
                Input::Upstream {
                    copier: copier.clone(),
                    port: *port,
                }
            }
            None => {
                start_source(&self.ctx.source)?;
                Input::Source
            }
        };

        let worker = Worker {
            pipeline: self.pipeline.clone(),
            source: self.ctx.source.clone(),
            input,
            output,
            stop: self.stop.clone(),
            events: self.ctx.events.clone(),
            clock: self.ctx.clock.clone(),
        };
        let name = format!("{}_{}", self.pipeline.stream_type(), self.pipeline.name());
        match self.ctx.scheduler.spawn(&name, move || worker.run()) {
            Ok(handle) => {
                self.handle = Some(handle);
                self.pipeline.set_running(true);
                debug!(pipeline = self.pipeline.name(), "pipeline running");
                Ok(())
            }
            Err(e) => {
                self.release_input();
                Err(e)
            }
        }
    }

    /// Stops the worker and waits for it to exit.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        self.pipeline.fetch.wake();
        if let Some((copier, port)) = &self.upstream {
            // Wakes a worker blocked on the port.
            if let Err(e) = copier.enable(*port, false) {
                warn!(pipeline = self.pipeline.name(), error = %e, "failed to disable upstream port");
            }
        }
        if handle.join().is_err() {
            error!(pipeline = self.pipeline.name(), "pipeline worker panicked");
        }
        self.release_input();
        self.pipeline.set_running(false);
        debug!(pipeline = self.pipeline.name(), "pipeline stopped");
    }

    fn release_input(&self) {
        match &self.upstream {
            Some((copier, port)) => {
                let _ = copier.enable(*port, false);
            }
            None => stop_source(&self.ctx.source),
        }
    }
}

impl Drop for PipelineTask {
    fn drop(&mut self) {
        self.stop();
    }
}

fn start_source(source: &SourceHandle) -> Result<()> {
    match source {
        SourceHandle::Audio(s) => s.lock().start(),
        SourceHandle::Video(s) => s.lock().start(),
    }
}

fn stop_source(source: &SourceHandle) {
    let result = match source {
        SourceHandle::Audio(s) => s.lock().stop(),
        SourceHandle::Video(s) => s.lock().stop(),
    };
    if let Err(e) = result {
        warn!(stream = %source.stream_type(), error = %e, "failed to stop source");
    }
}

enum Fetched {
    Frame {
        frame: Frame,
        ticket: Option<Ticket>,
        raw: Option<Frame>,
    },
    Idle,
    End,
    Stopped,
}

struct Worker {
    pipeline: Arc<Pipeline>,
    source: SourceHandle,
    input: Input,
    output: Output,
    stop: Arc<AtomicBool>,
    events: PathEventSender,
    clock: Arc<CaptureClock>,
}

impl Worker {
    fn run(self) {
        info!(pipeline = self.pipeline.name(), "pipeline worker started");
        let kind = match self.main_loop() {
            Ok(true) => {
                info!(pipeline = self.pipeline.name(), "source finished");
                Some(PathEventKind::Finished)
            }
            Ok(false) => None,
            Err(e) if self.stopping() => {
                debug!(pipeline = self.pipeline.name(), error = %e, "error while stopping");
                None
            }
            Err(e) => {
                error!(pipeline = self.pipeline.name(), error = %e, "pipeline failed");
                Some(PathEventKind::Error)
            }
        };
        if let Some(kind) = kind {
            self.notify(kind);
        }
        info!(pipeline = self.pipeline.name(), "pipeline worker exited");
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn notify(&self, kind: PathEventKind) {
        let mask = self.pipeline.path_mask();
        for path in 0..MAX_SINKS as u8 {
            if mask & path_bit(path) == 0 {
                continue;
            }
            let event = PathEvent::new(self.pipeline.stream_type(), path, kind);
            if self.events.send(event).is_err() {
                debug!(path, "event channel closed");
            }
        }
    }

    /// Returns `Ok(true)` at end of data, `Ok(false)` when stopped.
    fn main_loop(&self) -> Result<bool> {
        loop {
            if self.stopping() {
                return Ok(false);
            }
            let (frame, ticket, raw) = match self.fetch()? {
                Fetched::Frame { frame, ticket, raw } => (frame, ticket, raw),
                Fetched::Idle => continue,
                Fetched::End => return Ok(true),
                Fetched::Stopped => return Ok(false),
            };

            let result = process(&mut self.pipeline.stages(), frame)
                .and_then(|frames| frames.into_iter().try_for_each(|f| self.dispatch(f)));

            if let (Some(ticket), Input::Upstream { copier, .. }) = (ticket, &self.input) {
                copier.release(ticket);
            }
            if let Some(raw) = raw {
                if let SourceHandle::Video(source) = &self.source {
                    source.lock().release_frame(raw)?;
                }
                self.pipeline.fetch.mark_fetched();
            }
            result?;
        }
    }

    fn fetch(&self) -> Result<Fetched> {
        match &self.input {
            Input::Upstream { copier, port } => match copier.recv_timeout(*port, UPSTREAM_POLL) {
                Ok(shared) => {
                    let (ticket, frame) = shared.into_parts();
                    Ok(Fetched::Frame {
                        frame,
                        ticket: Some(ticket),
                        raw: None,
                    })
                }
                Err(CaptureError::Timeout) => Ok(Fetched::Idle),
                Err(CaptureError::Interrupted) => {
                    std::thread::sleep(DISABLED_BACKOFF);
                    Ok(Fetched::Idle)
                }
                Err(e) => Err(e),
            },
            Input::Source => match &self.source {
                SourceHandle::Audio(source) => {
                    let size = self.pipeline.caps().read_size;
                    if size == 0 {
                        return Err(CaptureError::invalid_state(format!(
                            "{} has no read size",
                            self.pipeline.name()
                        )));
                    }
                    let Some(frame) = source.lock().read_frame(size)? else {
                        return Ok(Fetched::End);
                    };
                    self.clock.audio_update(frame.pts);
                    Ok(Fetched::Frame {
                        frame,
                        ticket: None,
                        raw: None,
                    })
                }
                SourceHandle::Video(source) => {
                    if !self.pipeline.fetch.wait_turn(&self.stop) {
                        return Ok(Fetched::Stopped);
                    }
                    let Some(mut frame) = source.lock().acquire_frame()? else {
                        return Ok(Fetched::End);
                    };
                    if self.clock.mode() != SyncMode::None {
                        frame.pts = self.clock.current();
                    }
                    Ok(Fetched::Frame {
                        raw: Some(frame.clone()),
                        frame,
                        ticket: None,
                    })
                }
            },
        }
    }

    fn dispatch(&self, frame: Frame) -> Result<()> {
        match &self.output {
            Output::Copier(copier) => {
                if let Err(e) = copier.add(frame) {
                    warn!(pipeline = self.pipeline.name(), error = %e, "copier dropped frame");
                }
                Ok(())
            }
            Output::Sink { path, deliver } => match deliver(*path, frame) {
                Ok(()) => Ok(()),
                Err(CaptureError::NotSupported { .. }) => {
                    trace!(path, "sink not accepting frames");
                    Ok(())
                }
                Err(CaptureError::Timeout) => {
                    warn!(path, "sink queue full, frame dropped");
                    Ok(())
                }
                Err(e) => Err(e),
            },
        }
    }
}

/// Runs one frame through every stage in order.
fn process(stages: &mut [Box<dyn Stage>], frame: Frame) -> Result<Vec<Frame>> {
    let mut frames = vec![frame];
    for stage in stages.iter_mut() {
        let mut out = Vec::with_capacity(frames.len());
        for frame in frames {
            stage.process(frame, &mut out)?;
        }
        frames = out;
        if frames.is_empty() {
            break;
        }
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureConfig;
    use crate::format::{AudioInfo, FormatId};
    use crate::frame::StreamType;
    use crate::pipeline::{assemble, PipelineCaps};
    use crate::source::{AudioSource, MockAudioSource};
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    fn audio_source(mock: &MockAudioSource) -> SourceHandle {
        let mut boxed: Box<dyn AudioSource> = Box::new(mock.clone());
        boxed.open().unwrap();
        SourceHandle::Audio(Arc::new(Mutex::new(boxed)))
    }

    fn collector() -> (FrameHandler, Arc<Mutex<Vec<(u8, Frame)>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        let deliver: FrameHandler = Arc::new(move |path, frame| {
            sink.lock().push((path, frame));
            Ok(())
        });
        (deliver, frames)
    }

    fn context(source: SourceHandle, deliver: FrameHandler) -> (TaskContext, mpsc::UnboundedReceiver<PathEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = TaskContext {
            source,
            deliver,
            events: tx,
            clock: Arc::new(CaptureClock::new(SyncMode::Audio)),
            scheduler: ThreadScheduler::default(),
        };
        (ctx, rx)
    }

    fn with_read_size(p: Pipeline, read_size: usize) -> Arc<Pipeline> {
        p.set_caps(PipelineCaps {
            read_size,
            ..PipelineCaps::default()
        });
        Arc::new(p)
    }

    #[test]
    fn test_source_to_sink_until_finished() {
        let mock = MockAudioSource::new(AudioInfo::new(FormatId::PCM, 16000, 1, 16))
            .realtime(false)
            .frame_limit(4);
        let (deliver, frames) = collector();
        let (ctx, mut rx) = context(audio_source(&mock), deliver);
        let pipes = vec![with_read_size(
            Pipeline::new("aud_sink_1", StreamType::Audio, 0b10, Vec::new()),
            640,
        )];
        assemble(&pipes, &CaptureConfig::default()).unwrap();

        let mut task = PipelineTask::new(&pipes, 0, ctx).unwrap();
        task.run().unwrap();
        assert!(pipes[0].is_running());

        let event = rx.blocking_recv().unwrap();
        assert_eq!(event.kind, PathEventKind::Finished);
        assert_eq!(event.path, 1);

        task.stop();
        assert!(!pipes[0].is_running());
        assert!(!mock.is_started());
        let frames = frames.lock();
        assert_eq!(frames.len(), 4);
        assert!(frames.iter().all(|(path, f)| *path == 1 && f.len() == 640));
    }

    #[test]
    fn test_read_failure_reports_error() {
        let mock = MockAudioSource::new(AudioInfo::new(FormatId::PCM, 16000, 1, 16))
            .realtime(false)
            .fail_after(1);
        let (deliver, _frames) = collector();
        let (ctx, mut rx) = context(audio_source(&mock), deliver);
        let pipes = vec![with_read_size(
            Pipeline::new("aud_sink_0", StreamType::Audio, 0b1, Vec::new()),
            320,
        )];
        assemble(&pipes, &CaptureConfig::default()).unwrap();

        let mut task = PipelineTask::new(&pipes, 0, ctx).unwrap();
        task.run().unwrap();
        assert_eq!(rx.blocking_recv().unwrap().kind, PathEventKind::Error);
        task.stop();
    }

    #[test]
    fn test_copier_feeds_two_sinks() {
        let mock = MockAudioSource::new(AudioInfo::new(FormatId::PCM, 16000, 1, 16))
            .realtime(false)
            .frame_limit(3);
        let (deliver, frames) = collector();
        let (ctx, mut rx) = context(audio_source(&mock), deliver);
        let pipes = vec![
            with_read_size(
                Pipeline::new("aud_src", StreamType::Audio, 0b11, Vec::new()).with_links(vec![1, 2]),
                320,
            ),
            Arc::new(Pipeline::new("aud_sink_0", StreamType::Audio, 0b01, Vec::new())),
            Arc::new(Pipeline::new("aud_sink_1", StreamType::Audio, 0b10, Vec::new())),
        ];
        assemble(&pipes, &CaptureConfig::default()).unwrap();

        // Consumers first so the source never adds into disabled ports.
        let mut tasks: Vec<PipelineTask> = [2, 1, 0]
            .iter()
            .map(|&i| PipelineTask::new(&pipes, i, ctx.clone()).unwrap())
            .collect();
        for task in &mut tasks {
            task.run().unwrap();
        }

        let mut finished = Vec::new();
        while finished.len() < 2 {
            let event = rx.blocking_recv().unwrap();
            assert_eq!(event.kind, PathEventKind::Finished);
            finished.push(event.path);
        }
        finished.sort_unstable();
        assert_eq!(finished, vec![0, 1]);

        let copier = pipes[0].copier().unwrap();
        copier.wait_empty(Duration::from_secs(2)).unwrap();
        for task in &mut tasks {
            task.stop();
        }
        let frames = frames.lock();
        assert_eq!(frames.iter().filter(|(p, _)| *p == 0).count(), 3);
        assert_eq!(frames.iter().filter(|(p, _)| *p == 1).count(), 3);
        assert!(!copier.is_enabled(0));
    }

    #[test]
    fn test_rejected_frames_do_not_fail() {
        let mock = MockAudioSource::new(AudioInfo::new(FormatId::PCM, 16000, 1, 16))
            .realtime(false)
            .frame_limit(2);
        let deliver: FrameHandler =
            Arc::new(|_, _| Err(CaptureError::not_supported("sink disabled")));
        let (ctx, mut rx) = context(audio_source(&mock), deliver);
        let pipes = vec![with_read_size(
            Pipeline::new("aud_sink_0", StreamType::Audio, 0b1, Vec::new()),
            320,
        )];
        assemble(&pipes, &CaptureConfig::default()).unwrap();
        let mut task = PipelineTask::new(&pipes, 0, ctx).unwrap();
        task.run().unwrap();
        assert_eq!(rx.blocking_recv().unwrap().kind, PathEventKind::Finished);
        task.stop();
    }
}
