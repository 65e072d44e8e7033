use fast_image_resize as fr;
use fr::images::Image;
use image::RgbaImage;

use crate::capture::types::Size;

/// Resize RGBA pixels to exactly `target` using SIMD bilinear filtering.
///
/// Returns `None` when either side is empty or the buffer does not match its
/// dimensions.
pub fn resize_rgba(src: &RgbaImage, target: Size) -> Option<RgbaImage> {
    let (width, height) = src.dimensions();
    if width == 0 || height == 0 || target.is_empty() {
        return None;
    }
    if (width, height) == (target.width, target.height) {
        return Some(src.clone());
    }

    let src_image = match Image::from_vec_u8(width, height, src.as_raw().clone(), fr::PixelType::U8x4) {
        Ok(image) => image,
        Err(e) => {
            tracing::warn!("Cannot wrap {width}x{height} frame for resize: {e}");
            return None;
        }
    };
    let mut dst_image = Image::new(target.width, target.height, fr::PixelType::U8x4);

    let options = fr::ResizeOptions::new()
        .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
    let mut resizer = fr::Resizer::new();
    if let Err(e) = resizer.resize(&src_image, &mut dst_image, &options) {
        tracing::warn!("Resize to {}x{} failed: {e}", target.width, target.height);
        return None;
    }

    RgbaImage::from_raw(target.width, target.height, dst_image.into_vec())
}

/// Largest rectangle with `source`'s aspect ratio that fits in `bounds`,
/// centred. Returns `(x, y, size)`.
pub fn fit_rect(source: Size, bounds: Size) -> (u32, u32, Size) {
    if source.is_empty() || bounds.is_empty() {
        return (0, 0, Size::new(0, 0));
    }
    let sw = u64::from(source.width);
    let sh = u64::from(source.height);
    let bw = u64::from(bounds.width);
    let bh = u64::from(bounds.height);

    // Compare aspect ratios without floating point: sw/sh vs bw/bh.
    let size = if sw * bh >= bw * sh {
        let height = ((bw * sh) / sw).max(1) as u32;
        Size::new(bounds.width, height)
    } else {
        let width = ((bh * sw) / sh).max(1) as u32;
        Size::new(width, bounds.height)
    };
    let x = (bounds.width - size.width) / 2;
    let y = (bounds.height - size.height) / 2;
    (x, y, size)
}
