//! Capability negotiation.
//!
//! For every source pipeline serving the requested paths, the source is asked
//! for one format that covers all of its sinks, then the graph is walked from
//! the source to each sink. Stages only change the fields their
//! [`StageCap`](crate::pipeline::stage::StageCap) tags allow, and every sink
//! pipeline must end up producing exactly the format its path asked for.
//!
//! Pipelines that are already running keep their recorded formats: a new
//! path joining a running source is walked from the source's current output.

mod audio;
mod video;

pub use audio::negotiate_audio;
pub use video::negotiate_video;

use crate::error::{CaptureError, Result};
use crate::format::StreamInfo;
use crate::pipeline::Pipeline;

/// Paths of `mask` (lowest first) for which `configured` holds.
fn configured_paths(mask: u8, configured: impl Fn(usize) -> bool) -> Vec<usize> {
    (0..u8::BITS as usize)
        .filter(|&p| mask & (1 << p) != 0 && configured(p))
        .collect()
}

/// Output recorded on a running pipeline.
fn running_output(pipeline: &Pipeline) -> Result<StreamInfo> {
    pipeline.caps().output.ok_or_else(|| {
        CaptureError::internal(format!(
            "running pipeline {} has no negotiated output",
            pipeline.name()
        ))
    })
}
