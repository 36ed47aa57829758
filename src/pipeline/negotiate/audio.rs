use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use super::{configured_paths, running_output};
use crate::error::{CaptureError, Result};
use crate::format::{AudioInfo, FormatId, StreamInfo};
use crate::pipeline::stage::{StageCap, StageSetting};
use crate::pipeline::topology::{self, Linked};
use crate::pipeline::{Pipeline, PipelineCaps};
use crate::source::SharedAudioSource;

/// Negotiates every audio source pipeline serving a path in `mask`.
///
/// `sinks[path]` is the format path `path` must receive; paths whose format
/// is [`FormatId::NONE`] are skipped. Every request carries the highest rate,
/// channel count and bit depth among the source's sinks. The source is first
/// asked for the sinks' codec when they all use the same encoded one, then
/// for PCM, then for whatever it produces natively; a format the chain cannot
/// carry to every sink moves on to the next request. A failing source is
/// logged and the others are still negotiated; the first error is returned.
///
/// The source pipeline's read size is set from the smallest encoder input
/// (scaled to the source rate), or `frame_duration` of audio without encoders.
pub fn negotiate_audio(
    pipelines: &[Arc<Pipeline>],
    sinks: &[AudioInfo],
    mask: u8,
    source: &SharedAudioSource,
    frame_duration: Duration,
) -> Result<()> {
    let order = topology::sort(pipelines)?;
    let mut result = Ok(());
    for idx in order {
        let head = &pipelines[idx];
        if !topology::is_source(idx, pipelines) || head.path_mask() & mask == 0 {
            continue;
        }
        let paths = configured_paths(head.path_mask() & mask, |p| {
            sinks.get(p).is_some_and(|s| !s.is_none())
        });
        if paths.is_empty() {
            debug!(pipeline = head.name(), "no audio sink configured yet");
            continue;
        }
        let mut walk = AudioWalk {
            pipelines,
            sinks,
            mask,
            source_rate: 0,
            min_samples: None,
        };
        if let Err(e) = walk.negotiate_source(idx, &paths, source, frame_duration) {
            error!(pipeline = head.name(), mask, error = %e, "audio negotiation failed");
            if result.is_ok() {
                result = Err(e);
            }
        }
    }
    result
}

/// PCM at the field-wise maximum of the given sinks.
fn join_sinks(sinks: &[AudioInfo], paths: &[usize]) -> AudioInfo {
    paths
        .iter()
        .fold(AudioInfo::new(FormatId::PCM, 0, 0, 0), |acc, &p| {
            AudioInfo {
                format: FormatId::PCM,
                ..acc.join(&sinks[p])
            }
        })
}

/// Requests to offer the source, best first: the sinks' codec when they all
/// share one, then PCM, then the wildcard.
fn candidates(sinks: &[AudioInfo], paths: &[usize]) -> Vec<AudioInfo> {
    let pcm = join_sinks(sinks, paths);
    let mut codecs: Vec<FormatId> = Vec::new();
    for &p in paths {
        if !codecs.contains(&sinks[p].format) {
            codecs.push(sinks[p].format);
        }
    }

    let mut requests = Vec::with_capacity(3);
    if let [codec] = codecs.as_slice() {
        if codec.is_encoded() {
            requests.push(AudioInfo {
                format: *codec,
                ..pcm
            });
        }
    }
    requests.push(pcm);
    requests.push(AudioInfo {
        format: FormatId::ANY,
        ..pcm
    });
    requests
}

struct AudioWalk<'a> {
    pipelines: &'a [Arc<Pipeline>],
    sinks: &'a [AudioInfo],
    mask: u8,
    source_rate: u32,
    min_samples: Option<usize>,
}

impl AudioWalk<'_> {
    fn negotiate_source(
        &mut self,
        idx: usize,
        paths: &[usize],
        source: &SharedAudioSource,
        frame_duration: Duration,
    ) -> Result<()> {
        let pipelines = self.pipelines;
        let head = &pipelines[idx];
        if head.is_running() {
            let info = head
                .caps()
                .input
                .and_then(|i| i.audio())
                .ok_or_else(|| CaptureError::internal("running audio source without format"))?;
            debug!(pipeline = head.name(), %info, "audio source running, reusing format");
            self.source_rate = info.sample_rate;
            return self.visit(idx, info);
        }

        let mut negotiated = None;
        let mut last_err = CaptureError::not_supported("no audio format satisfies every sink");
        for request in candidates(self.sinks, paths) {
            let offered = source.lock().negotiate_caps(&request);
            let info = match offered {
                Ok(info) => info,
                Err(e) => {
                    debug!(%request, error = %e, "audio source rejected request");
                    last_err = e;
                    continue;
                }
            };
            self.source_rate = info.sample_rate;
            self.min_samples = None;
            match self.visit(idx, info) {
                Ok(()) => {
                    info!(%request, source = %info, "audio source negotiated");
                    negotiated = Some(info);
                    break;
                }
                Err(e) => {
                    debug!(%request, source = %info, error = %e, "audio chain cannot use source format");
                    last_err = e;
                }
            }
        }
        let Some(info) = negotiated else {
            return Err(last_err);
        };

        let sample_size = info.sample_size().max(1);
        let read_size = match self.min_samples {
            Some(samples) if samples > 0 => samples * sample_size,
            _ => info
                .bytes_for_ms(frame_duration.as_millis() as u32)
                .max(sample_size),
        };
        debug!(pipeline = head.name(), read_size, "audio read size");
        head.update_caps(|caps| {
            caps.input = Some(StreamInfo::Audio(info));
            caps.read_size = read_size;
        });
        Ok(())
    }

    /// Format a pipeline must produce, `None` when no sink below it is configured.
    fn target(&self, node: &Pipeline) -> Option<AudioInfo> {
        if topology::is_sink(node) {
            let path = topology::path_index(node.path_mask())?;
            return self
                .sinks
                .get(usize::from(path))
                .copied()
                .filter(|s| !s.is_none());
        }
        let paths = configured_paths(node.path_mask() & self.mask, |p| {
            self.sinks.get(p).is_some_and(|s| !s.is_none())
        });
        match paths.as_slice() {
            [] => None,
            [only] => Some(self.sinks[*only]),
            _ => Some(join_sinks(self.sinks, &paths)),
        }
    }

    fn visit(&mut self, idx: usize, input: AudioInfo) -> Result<()> {
        let pipelines = self.pipelines;
        let node = &pipelines[idx];
        let Some(target) = self.target(node) else {
            debug!(pipeline = node.name(), "skipping branch without sink");
            return Ok(());
        };

        let output = if node.is_running() {
            running_output(node)?
                .audio()
                .ok_or_else(|| CaptureError::internal("audio pipeline with video output"))?
        } else {
            self.configure_stages(node, input, &target)?
        };

        if topology::is_sink(node) {
            if output != target {
                return Err(CaptureError::not_supported(format!(
                    "{} produces {output}, sink wants {target}",
                    node.name()
                )));
            }
            debug!(pipeline = node.name(), %output, "audio sink negotiated");
            return Ok(());
        }
        for &to in node.links() {
            if pipelines[to].path_mask() & self.mask != 0 {
                self.visit(to, output)?;
            }
        }
        Ok(())
    }

    fn configure_stages(
        &mut self,
        node: &Pipeline,
        input: AudioInfo,
        target: &AudioInfo,
    ) -> Result<AudioInfo> {
        let mut cur = input;
        for stage in node.stages().iter_mut() {
            let mut out = cur;
            if stage.has_cap(StageCap::AudioChannelConvert) {
                out.channels = target.channels;
            }
            if stage.has_cap(StageCap::AudioBitConvert) {
                out.bits_per_sample = target.bits_per_sample;
            }
            if stage.has_cap(StageCap::AudioRateConvert) {
                out.sample_rate = target.sample_rate;
            }
            if stage.has_cap(StageCap::AudioEncoder) {
                out.format = target.format;
            }
            stage.configure(&StageSetting::Audio {
                input: cur,
                output: out,
            })?;
            if stage.has_cap(StageCap::AudioEncoder) {
                if let Some((in_bytes, _)) = stage.frame_size() {
                    let samples = in_bytes / cur.sample_size().max(1);
                    let at_source = samples * self.source_rate as usize
                        / cur.sample_rate.max(1) as usize;
                    self.min_samples =
                        Some(self.min_samples.map_or(at_source, |m| m.min(at_source)));
                }
            }
            cur = out;
        }
        node.set_caps(PipelineCaps {
            input: Some(StreamInfo::Audio(input)),
            output: Some(StreamInfo::Audio(cur)),
            read_size: 0,
        });
        Ok(cur)
    }
}
