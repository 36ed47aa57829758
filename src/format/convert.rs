//! Sample, channel and pixel format conversion.
//!
//! All PCM buffers are interleaved little-endian bytes.

use super::FormatId;

/// Decodes little-endian PCM of the given bit depth into `i32` samples
/// scaled to the 32-bit range.
pub fn pcm_to_i32(data: &[u8], bits: u8) -> Vec<i32> {
    match bits {
        8 => data.iter().map(|&b| (i32::from(b) - 128) << 24).collect(),
        16 => data
            .chunks_exact(2)
            .map(|c| i32::from(i16::from_le_bytes([c[0], c[1]])) << 16)
            .collect(),
        24 => data
            .chunks_exact(3)
            .map(|c| i32::from_le_bytes([0, c[0], c[1], c[2]]))
            .collect(),
        32 => data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        _ => Vec::new(),
    }
}

/// Encodes `i32` samples into little-endian PCM of the given bit depth.
pub fn i32_to_pcm(samples: &[i32], bits: u8) -> Vec<u8> {
    let width = usize::from(bits / 8);
    let mut out = Vec::with_capacity(samples.len() * width);
    for &s in samples {
        match bits {
            8 => out.push(((s >> 24) + 128) as u8),
            16 => out.extend_from_slice(&((s >> 16) as i16).to_le_bytes()),
            24 => out.extend_from_slice(&s.to_le_bytes()[1..]),
            32 => out.extend_from_slice(&s.to_le_bytes()),
            _ => {}
        }
    }
    out
}

/// Converts PCM between bit depths.
pub fn convert_bits(data: &[u8], from_bits: u8, to_bits: u8) -> Vec<u8> {
    if from_bits == to_bits {
        return data.to_vec();
    }
    i32_to_pcm(&pcm_to_i32(data, from_bits), to_bits)
}

/// Converts interleaved samples between channel counts.
///
/// Downmixing averages all input channels into each output channel;
/// upmixing repeats the last input channel.
pub fn convert_channels(samples: &[i32], from: u8, to: u8) -> Vec<i32> {
    if from == to || from == 0 || to == 0 {
        return samples.to_vec();
    }
    let from = usize::from(from);
    let to = usize::from(to);
    let mut out = Vec::with_capacity(samples.len() / from * to);
    for frame in samples.chunks_exact(from) {
        if to < from {
            let sum: i64 = frame.iter().map(|&s| i64::from(s)).sum();
            let avg = (sum / from as i64) as i32;
            out.extend(std::iter::repeat(avg).take(to));
        } else {
            out.extend_from_slice(frame);
            let last = frame[from - 1];
            out.extend(std::iter::repeat(last).take(to - from));
        }
    }
    out
}

fn rgb565_to_rgb(v: u16) -> [u8; 3] {
    let r = ((v >> 11) & 0x1F) as u8;
    let g = ((v >> 5) & 0x3F) as u8;
    let b = (v & 0x1F) as u8;
    [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]
}

fn rgb_to_rgb565(rgb: [u8; 3]) -> u16 {
    (u16::from(rgb[0] >> 3) << 11) | (u16::from(rgb[1] >> 2) << 5) | u16::from(rgb[2] >> 3)
}

fn decode_rgb(data: &[u8], format: FormatId) -> Option<Vec<[u8; 3]>> {
    let pixels = match format {
        FormatId::RGB565 => data
            .chunks_exact(2)
            .map(|c| rgb565_to_rgb(u16::from_le_bytes([c[0], c[1]])))
            .collect(),
        FormatId::RGB565_BE => data
            .chunks_exact(2)
            .map(|c| rgb565_to_rgb(u16::from_be_bytes([c[0], c[1]])))
            .collect(),
        FormatId::RGB888 => data.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect(),
        FormatId::BGR888 => data.chunks_exact(3).map(|c| [c[2], c[1], c[0]]).collect(),
        _ => return None,
    };
    Some(pixels)
}

fn encode_rgb(pixels: &[[u8; 3]], format: FormatId) -> Option<Vec<u8>> {
    let out = match format {
        FormatId::RGB565 => pixels
            .iter()
            .flat_map(|&p| rgb_to_rgb565(p).to_le_bytes())
            .collect(),
        FormatId::RGB565_BE => pixels
            .iter()
            .flat_map(|&p| rgb_to_rgb565(p).to_be_bytes())
            .collect(),
        FormatId::RGB888 => pixels.iter().flatten().copied().collect(),
        FormatId::BGR888 => pixels.iter().flat_map(|p| [p[2], p[1], p[0]]).collect(),
        _ => return None,
    };
    Some(out)
}

fn rgb_to_i420(pixels: &[[u8; 3]], width: usize, height: usize) -> Vec<u8> {
    let luma = |p: [u8; 3]| {
        let (r, g, b) = (i32::from(p[0]), i32::from(p[1]), i32::from(p[2]));
        (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16).clamp(0, 255) as u8
    };
    let chroma = |p: [u8; 3]| {
        let (r, g, b) = (i32::from(p[0]), i32::from(p[1]), i32::from(p[2]));
        let u = (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128).clamp(0, 255) as u8;
        let v = (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128).clamp(0, 255) as u8;
        (u, v)
    };
    let cw = width.div_ceil(2);
    let ch = height.div_ceil(2);
    let mut y_plane = Vec::with_capacity(width * height);
    let mut u_plane = Vec::with_capacity(cw * ch);
    let mut v_plane = Vec::with_capacity(cw * ch);
    for p in pixels {
        y_plane.push(luma(*p));
    }
    for row in (0..height).step_by(2) {
        for col in (0..width).step_by(2) {
            let (u, v) = chroma(pixels[row * width + col]);
            u_plane.push(u);
            v_plane.push(v);
        }
    }
    y_plane.extend(u_plane);
    y_plane.extend(v_plane);
    y_plane
}

/// Returns `true` if [`convert_pixels`] can convert between the two formats.
pub fn can_convert_pixels(from: FormatId, to: FormatId) -> bool {
    let rgb = |f| {
        matches!(
            f,
            FormatId::RGB565 | FormatId::RGB565_BE | FormatId::RGB888 | FormatId::BGR888
        )
    };
    from == to || (rgb(from) && (rgb(to) || to == FormatId::YUV420))
}

/// Converts a raw frame between pixel formats.
///
/// Supports any pair of RGB layouts, and RGB to planar YUV 4:2:0.
/// Returns `None` for unsupported conversions or truncated input.
pub fn convert_pixels(
    data: &[u8],
    width: u16,
    height: u16,
    from: FormatId,
    to: FormatId,
) -> Option<Vec<u8>> {
    if from == to {
        return Some(data.to_vec());
    }
    let (w, h) = (usize::from(width), usize::from(height));
    let pixels = decode_rgb(data, from)?;
    if pixels.len() < w * h {
        return None;
    }
    if to == FormatId::YUV420 {
        return Some(rgb_to_i420(&pixels[..w * h], w, h));
    }
    encode_rgb(&pixels, to)
}

/// Nearest-neighbour scaling of a packed frame with `bpp` bytes per pixel.
pub fn scale_packed(
    data: &[u8],
    bpp: usize,
    src: (u16, u16),
    dst: (u16, u16),
) -> Vec<u8> {
    let (sw, sh) = (usize::from(src.0), usize::from(src.1));
    let (dw, dh) = (usize::from(dst.0), usize::from(dst.1));
    if (sw, sh) == (dw, dh) || sw == 0 || sh == 0 {
        return data.to_vec();
    }
    let mut out = Vec::with_capacity(dw * dh * bpp);
    for y in 0..dh {
        let sy = y * sh / dh;
        for x in 0..dw {
            let sx = x * sw / dw;
            let at = (sy * sw + sx) * bpp;
            match data.get(at..at + bpp) {
                Some(px) => out.extend_from_slice(px),
                None => out.extend(std::iter::repeat(0).take(bpp)),
            }
        }
    }
    out
}

/// Bytes per pixel of a packed RGB format.
pub fn packed_bpp(format: FormatId) -> Option<usize> {
    match format {
        FormatId::RGB565 | FormatId::RGB565_BE | FormatId::YUV422 => Some(2),
        FormatId::RGB888 | FormatId::BGR888 => Some(3),
        _ => None,
    }
}
