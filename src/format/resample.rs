//! Sample rate conversion.
//!
//! Linear interpolation over interleaved frames. Fast and good enough for
//! speech paths; codec-grade resampling belongs in a dedicated stage.

/// Resamples one channel of samples from `from_rate` to `to_rate`.
pub fn resample(samples: &[i32], from_rate: u32, to_rate: u32) -> Vec<i32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    if from_rate == 0 || to_rate == 0 {
        return Vec::new();
    }

    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let output_len = (samples.len() as f64 * ratio).round() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_pos = i as f64 / ratio;
        let src_idx = src_pos.floor() as usize;
        let frac = src_pos - src_idx as f64;

        let sample = match (samples.get(src_idx), samples.get(src_idx + 1)) {
            (Some(&s1), Some(&s2)) => {
                let (s1, s2) = (f64::from(s1), f64::from(s2));
                (s1 + (s2 - s1) * frac) as i32
            }
            (Some(&s), None) => s,
            _ => *samples.last().unwrap_or(&0),
        };
        output.push(sample);
    }

    output
}

/// Resamples interleaved audio with `channels` channels.
///
/// Channels are processed independently and re-interleaved. Trailing
/// samples that do not form a complete frame are dropped.
pub fn resample_interleaved(samples: &[i32], channels: u8, from_rate: u32, to_rate: u32) -> Vec<i32> {
    let channels = usize::from(channels.max(1));
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    if channels == 1 {
        return resample(samples, from_rate, to_rate);
    }

    let frames = samples.len() / channels;
    let planes: Vec<Vec<i32>> = (0..channels)
        .map(|c| {
            let plane: Vec<i32> = (0..frames).map(|f| samples[f * channels + c]).collect();
            resample(&plane, from_rate, to_rate)
        })
        .collect();

    let out_frames = planes.iter().map(Vec::len).min().unwrap_or(0);
    let mut output = Vec::with_capacity(out_frames * channels);
    for f in 0..out_frames {
        for plane in &planes {
            output.push(plane[f]);
        }
    }
    output
}
