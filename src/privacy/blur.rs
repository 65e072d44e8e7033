//! Separable Gaussian blur.
//!
//! The Gaussian is approximated by three successive box blurs per axis, which
//! keeps the cost independent of the radius. The source is first extended
//! with clamped edges so the blur can spread past the frame border, and the
//! result is cropped back to the input extent.
//!
//! Large radii are blurred on a downscaled copy and scaled back up, so the
//! work per frame stays bounded on full-resolution displays.

use image::imageops;
use image::RgbaImage;

use crate::capture::types::Size;
use crate::privacy::scale::resize_rgba;

const PASSES: usize = 3;
const CHANNELS: usize = 4;
/// Largest sigma blurred at full resolution.
const MAX_DIRECT_SIGMA: f32 = 8.0;

/// Integer downscale factor that brings `sigma` within [`MAX_DIRECT_SIGMA`].
pub fn blur_scale(sigma: f32) -> u32 {
    if !sigma.is_finite() || sigma <= MAX_DIRECT_SIGMA {
        return 1;
    }
    (sigma / MAX_DIRECT_SIGMA).ceil() as u32
}

/// Blur `src` with standard deviation `sigma` at reduced resolution.
///
/// The source is shrunk by [`blur_scale`], blurred with the scaled sigma and
/// resized back to its own extent. Falls back to a full-resolution blur if
/// either resize fails.
pub fn downscaled_blur(src: &RgbaImage, sigma: f32) -> RgbaImage {
    let factor = blur_scale(sigma);
    let (width, height) = src.dimensions();
    if factor == 1 || width == 0 || height == 0 {
        return gaussian_blur(src, sigma);
    }

    let reduced = Size::new(width.div_ceil(factor), height.div_ceil(factor));
    let blurred = resize_rgba(src, reduced)
        .map(|small| gaussian_blur(&small, sigma / factor as f32))
        .and_then(|small| resize_rgba(&small, Size::new(width, height)));
    blurred.unwrap_or_else(|| gaussian_blur(src, sigma))
}

/// Blur `src` with standard deviation `sigma`. Returns a new image with the
/// same dimensions; `src` is left untouched.
pub fn gaussian_blur(src: &RgbaImage, sigma: f32) -> RgbaImage {
    let (width, height) = src.dimensions();
    if width == 0 || height == 0 || !sigma.is_finite() || sigma < 0.5 {
        return src.clone();
    }

    let boxes = box_sizes(sigma);
    let margin: u32 = boxes.iter().map(|b| b / 2).sum();

    let mut padded = expand_clamped(src, margin);
    let (pw, ph) = padded.dimensions();
    let (pw, ph) = (pw as usize, ph as usize);
    let mut scratch = vec![0u8; padded.len()];

    for &size in &boxes {
        let r = (size / 2) as usize;
        box_blur_horizontal(&padded, &mut scratch, pw, ph, r);
        box_blur_vertical(&scratch, &mut padded, pw, ph, r);
    }

    imageops::crop_imm(&padded, margin, margin, width, height).to_image()
}

/// Odd box widths whose successive application approximates a Gaussian of
/// the given standard deviation.
fn box_sizes(sigma: f32) -> [u32; PASSES] {
    let n = PASSES as f32;
    let ideal = (12.0 * sigma * sigma / n + 1.0).sqrt();
    let mut lower = ideal.floor() as i64;
    if lower % 2 == 0 {
        lower -= 1;
    }
    let lower = lower.max(1);
    let upper = lower + 2;

    let lf = lower as f32;
    let m_ideal = (12.0 * sigma * sigma - n * lf * lf - 4.0 * n * lf - 3.0 * n) / (-4.0 * lf - 4.0);
    let m = m_ideal.round().clamp(0.0, n) as usize;

    let mut sizes = [0u32; PASSES];
    for (i, size) in sizes.iter_mut().enumerate() {
        *size = if i < m { lower as u32 } else { upper as u32 };
    }
    sizes
}

/// Copy `src` into a larger image, repeating edge pixels into the margin.
fn expand_clamped(src: &RgbaImage, margin: u32) -> RgbaImage {
    let (width, height) = src.dimensions();
    RgbaImage::from_fn(width + 2 * margin, height + 2 * margin, |x, y| {
        let sx = x.saturating_sub(margin).min(width - 1);
        let sy = y.saturating_sub(margin).min(height - 1);
        *src.get_pixel(sx, sy)
    })
}

fn box_blur_horizontal(src: &[u8], dst: &mut [u8], width: usize, height: usize, r: usize) {
    let window = (2 * r + 1) as u32;
    let last = width - 1;
    for y in 0..height {
        let row = y * width * CHANNELS;
        for c in 0..CHANNELS {
            let at = |x: usize| u32::from(src[row + x.min(last) * CHANNELS + c]);
            // Window starts centred on x = 0 with everything left of it clamped.
            let mut sum = at(0) * (r as u32 + 1);
            for x in 1..=r {
                sum += at(x);
            }
            for x in 0..width {
                dst[row + x * CHANNELS + c] = ((sum + window / 2) / window) as u8;
                sum += at(x + r + 1);
                sum -= at(x.saturating_sub(r));
            }
        }
    }
}

fn box_blur_vertical(src: &[u8], dst: &mut [u8], width: usize, height: usize, r: usize) {
    let window = (2 * r + 1) as u32;
    let last = height - 1;
    let stride = width * CHANNELS;
    for x in 0..width {
        let col = x * CHANNELS;
        for c in 0..CHANNELS {
            let at = |y: usize| u32::from(src[y.min(last) * stride + col + c]);
            let mut sum = at(0) * (r as u32 + 1);
            for y in 1..=r {
                sum += at(y);
            }
            for y in 0..height {
                dst[y * stride + col + c] = ((sum + window / 2) / window) as u8;
                sum += at(y + r + 1);
                sum -= at(y.saturating_sub(r));
            }
        }
    }
}
