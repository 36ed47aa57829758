use std::sync::Arc;

use tracing::{debug, error, info};

use super::{configured_paths, running_output};
use crate::error::{CaptureError, Result};
use crate::format::{FormatId, StreamInfo, VideoInfo};
use crate::pipeline::stage::{StageCap, StageSetting};
use crate::pipeline::topology::{self, Linked};
use crate::pipeline::{sink_of, Pipeline, PipelineCaps};
use crate::source::SharedVideoSource;

/// Negotiates every video source pipeline serving a path in `mask`.
///
/// The sink with the largest picture (raw formats winning ties) decides the
/// first request, sized to the largest width, height and frame rate among
/// the sinks. If the source refuses it, or the chain cannot reach every sink
/// from what the source offers, the next candidate is tried: the raw formats
/// that sink's encoder accepts, the other sinks' formats, and finally the
/// wildcard.
pub fn negotiate_video(
    pipelines: &[Arc<Pipeline>],
    sinks: &[VideoInfo],
    mask: u8,
    source: &SharedVideoSource,
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
            debug!(pipeline = head.name(), "no video sink configured yet");
            continue;
        }
        let walk = VideoWalk {
            pipelines,
            sinks,
            mask,
        };
        if let Err(e) = walk.negotiate_source(idx, &paths, source) {
            error!(pipeline = head.name(), mask, error = %e, "video negotiation failed");
            if result.is_ok() {
                result = Err(e);
            }
        }
    }
    result
}

struct VideoWalk<'a> {
    pipelines: &'a [Arc<Pipeline>],
    sinks: &'a [VideoInfo],
    mask: u8,
}

impl VideoWalk<'_> {
    fn negotiate_source(
        &self,
        idx: usize,
        paths: &[usize],
        source: &SharedVideoSource,
    ) -> Result<()> {
        let head = &self.pipelines[idx];
        if head.is_running() {
            let info = head
                .caps()
                .input
                .and_then(|i| i.video())
                .ok_or_else(|| CaptureError::internal("running video source without format"))?;
            debug!(pipeline = head.name(), %info, "video source running, reusing format");
            return self.visit(idx, info);
        }

        let mut last_err = CaptureError::not_supported("no video format satisfies every sink");
        for request in self.candidates(paths) {
            let offered = source.lock().negotiate_caps(&request);
            let info = match offered {
                Ok(info) => info,
                Err(e) => {
                    debug!(%request, error = %e, "video source rejected request");
                    last_err = e;
                    continue;
                }
            };
            match self.visit(idx, info) {
                Ok(()) => {
                    info!(%request, source = %info, "video source negotiated");
                    head.update_caps(|caps| caps.input = Some(StreamInfo::Video(info)));
                    return Ok(());
                }
                Err(e) => {
                    debug!(%request, source = %info, error = %e, "video chain cannot use source format");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Requests to offer the source, best first.
    fn candidates(&self, paths: &[usize]) -> Vec<VideoInfo> {
        let sel_path = paths
            .iter()
            .copied()
            .max_by_key(|&p| {
                let s = &self.sinks[p];
                (s.area(), !s.format.is_encoded())
            })
            .unwrap_or_default();
        let sel = self.sinks[sel_path];
        let max = paths
            .iter()
            .fold(sel, |acc, &p| acc.join(&self.sinks[p]));

        let mut formats = vec![max.format];
        if let Some(sink) = sink_of(self.pipelines, sel_path as u8) {
            let stages = self.pipelines[sink].stages();
            if let Some(encoder) = stages.iter().find(|s| s.has_cap(StageCap::VideoEncoder)) {
                formats.extend(encoder.input_formats(sel.format));
            }
        }
        formats.extend(paths.iter().map(|&p| self.sinks[p].format));
        formats.push(FormatId::ANY);

        let mut seen = Vec::new();
        formats
            .into_iter()
            .filter(|f| {
                if seen.contains(f) {
                    false
                } else {
                    seen.push(*f);
                    true
                }
            })
            .map(|format| VideoInfo { format, ..max })
            .collect()
    }

    fn target(&self, node: &Pipeline, input: &VideoInfo) -> Option<VideoInfo> {
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
        let (&first, rest) = paths.split_first()?;
        if rest.is_empty() {
            return Some(self.sinks[first]);
        }
        let joined = rest
            .iter()
            .fold(self.sinks[first], |acc, &p| acc.join(&self.sinks[p]));
        Some(VideoInfo {
            format: input.format,
            ..joined
        })
    }

    fn visit(&self, idx: usize, input: VideoInfo) -> Result<()> {
        let node = &self.pipelines[idx];
        let Some(target) = self.target(node, &input) else {
            debug!(pipeline = node.name(), "skipping branch without sink");
            return Ok(());
        };

        let output = if node.is_running() {
            running_output(node)?
                .video()
                .ok_or_else(|| CaptureError::internal("video pipeline with audio output"))?
        } else {
            configure_stages(node, input, &target)?
        };

        if topology::is_sink(node) {
            if output != target {
                return Err(CaptureError::not_supported(format!(
                    "{} produces {output}, sink wants {target}",
                    node.name()
                )));
            }
            debug!(pipeline = node.name(), %output, "video sink negotiated");
            return Ok(());
        }
        for &to in node.links() {
            if self.pipelines[to].path_mask() & self.mask != 0 {
                self.visit(to, output)?;
            }
        }
        Ok(())
    }
}

fn configure_stages(node: &Pipeline, input: VideoInfo, target: &VideoInfo) -> Result<VideoInfo> {
    let mut stages = node.stages();
    let accepted = stages
        .iter()
        .find(|s| s.has_cap(StageCap::VideoEncoder))
        .map(|enc| enc.input_formats(target.format))
        .unwrap_or_default();

    let mut cur = input;
    for stage in stages.iter_mut() {
        let mut out = cur;
        if stage.has_cap(StageCap::VideoColorConvert) {
            out.format = if cur.format == target.format {
                cur.format
            } else if target.format.is_encoded() {
                match accepted.first() {
                    Some(&first) if !accepted.contains(&cur.format) => first,
                    _ => cur.format,
                }
            } else {
                target.format
            };
        }
        if stage.has_cap(StageCap::VideoFpsConvert) {
            out.fps = target.fps;
        }
        if stage.has_cap(StageCap::VideoScale) {
            out.width = target.width;
            out.height = target.height;
        }
        if stage.has_cap(StageCap::VideoEncoder) {
            out.format = target.format;
        }
        stage.configure(&StageSetting::Video {
            input: cur,
            output: out,
        })?;
        cur = out;
    }
    node.set_caps(PipelineCaps {
        input: Some(StreamInfo::Video(input)),
        output: Some(StreamInfo::Video(cur)),
        read_size: 0,
    });
    Ok(cur)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MockEncoder;
    use crate::frame::StreamType;
    use crate::pipeline::stage::{ColorConvert, FpsConvert, OverlayMixer, Scale, Stage};
    use crate::source::{MockVideoSource, VideoSource};
    use parking_lot::Mutex;

    fn chain() -> Vec<Box<dyn Stage>> {
        vec![
            Box::new(OverlayMixer::default()),
            Box::new(FpsConvert::default()),
            Box::new(Scale::default()),
            Box::new(ColorConvert::default()),
            Box::new(MockEncoder::video()),
        ]
    }

    fn shared(mock: &MockVideoSource) -> SharedVideoSource {
        let boxed: Box<dyn VideoSource> = Box::new(mock.clone());
        Arc::new(Mutex::new(boxed))
    }

    #[test]
    fn test_wildcard_rgb565_into_h264() {
        let mock = MockVideoSource::new(VideoInfo::new(FormatId::RGB565, 320, 240, 30))
            .accept_formats(&[FormatId::RGB565, FormatId::ANY]);
        let pipes = vec![Arc::new(Pipeline::new("v", StreamType::Video, 0b1, chain()))];
        let sink = VideoInfo::new(FormatId::H264, 320, 240, 15);
        negotiate_video(&pipes, &[sink], 0b1, &shared(&mock)).unwrap();

        assert_eq!(
            mock.requests(),
            vec![FormatId::H264, FormatId::YUV420, FormatId::O_UYY_E_VYY, FormatId::ANY]
        );
        let caps = pipes[0].caps();
        assert_eq!(
            caps.input,
            Some(StreamInfo::Video(VideoInfo::new(FormatId::RGB565, 320, 240, 15)))
        );
        assert_eq!(caps.output, Some(StreamInfo::Video(sink)));
    }

    #[test]
    fn test_encoded_source_passes_through() {
        let mock = MockVideoSource::new(VideoInfo::new(FormatId::MJPEG, 640, 480, 10));
        let pipes = vec![Arc::new(Pipeline::new("v", StreamType::Video, 0b1, chain()))];
        let sink = VideoInfo::new(FormatId::MJPEG, 640, 480, 10);
        negotiate_video(&pipes, &[sink], 0b1, &shared(&mock)).unwrap();
        assert_eq!(mock.requests(), vec![FormatId::MJPEG]);
        assert_eq!(pipes[0].caps().output, Some(StreamInfo::Video(sink)));
    }

    #[test]
    fn test_two_sinks_share_largest_source() {
        let mock = MockVideoSource::new(VideoInfo::new(FormatId::RGB565, 640, 480, 30))
            .accept_formats(&[FormatId::RGB565, FormatId::ANY]);
        let pipes = vec![
            Arc::new(
                Pipeline::new("src", StreamType::Video, 0b11, Vec::new()).with_links(vec![1, 2]),
            ),
            Arc::new(Pipeline::new("s0", StreamType::Video, 0b01, chain())),
            Arc::new(Pipeline::new("s1", StreamType::Video, 0b10, chain())),
        ];
        let sinks = [
            VideoInfo::new(FormatId::H264, 640, 480, 15),
            VideoInfo::new(FormatId::RGB565, 320, 240, 10),
        ];
        negotiate_video(&pipes, &sinks, 0b11, &shared(&mock)).unwrap();

        let negotiated = mock.negotiated();
        assert_eq!(negotiated.len(), 1);
        assert_eq!(negotiated[0], VideoInfo::new(FormatId::RGB565, 640, 480, 15));
        assert_eq!(pipes[1].caps().output, Some(StreamInfo::Video(sinks[0])));
        assert_eq!(pipes[2].caps().output, Some(StreamInfo::Video(sinks[1])));
    }

    #[test]
    fn test_no_candidate_fails() {
        let mock = MockVideoSource::new(VideoInfo::new(FormatId::YUV422, 320, 240, 30))
            .accept_formats(&[FormatId::YUV422, FormatId::ANY]);
        let pipes = vec![Arc::new(Pipeline::new("v", StreamType::Video, 0b1, chain()))];
        let sink = VideoInfo::new(FormatId::H264, 320, 240, 15);
        // YUYV cannot be color converted to what the H.264 encoder takes.
        assert!(negotiate_video(&pipes, &[sink], 0b1, &shared(&mock)).is_err());
    }
}
