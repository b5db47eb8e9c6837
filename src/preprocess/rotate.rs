//! Bicubic rotation with replicated borders.
//!
//! `imageproc`'s rotation fills uncovered corners with a constant color,
//! which leaves black wedges that OCR engines read as ink. We replicate the
//! nearest edge pixel instead.

use image::{ImageBuffer, Pixel};

/// Bicubic convolution parameter.
const A: f64 = -0.75;

/// Rotate `image` about `(width / 2, height / 2)` by `angle_degrees`, keeping
/// the original canvas size.
///
/// A positive angle straightens content that slopes downwards to the right
/// by that many degrees (in image coordinates, where `y` grows downwards).
pub fn rotate_about_center<P>(
    image: &ImageBuffer<P, Vec<u8>>,
    angle_degrees: f64,
) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8>,
{
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }
    let channels = usize::from(P::CHANNEL_COUNT);
    let cx = f64::from(width / 2);
    let cy = f64::from(height / 2);
    let (sin, cos) = angle_degrees.to_radians().sin_cos();

    let src = image.as_raw();
    let mut out = ImageBuffer::<P, Vec<u8>>::new(width, height);
    let row_len = width as usize * channels;
    let mut acc = vec![0.0f64; channels];

    for (y, row) in out.chunks_exact_mut(row_len).enumerate() {
        let dy = y as f64 - cy;
        for x in 0..width as usize {
            let dx = x as f64 - cx;
            let sx = cos * dx - sin * dy + cx;
            let sy = sin * dx + cos * dy + cy;

            let x0 = sx.floor();
            let y0 = sy.floor();
            let wx = weights(sx - x0);
            let wy = weights(sy - y0);
            let x0 = x0 as i64;
            let y0 = y0 as i64;

            acc.fill(0.0);
            for (j, wy) in wy.iter().enumerate() {
                let py = clamp_index(y0 - 1 + j as i64, height);
                for (i, wx) in wx.iter().enumerate() {
                    let px = clamp_index(x0 - 1 + i as i64, width);
                    let offset = (py * width as usize + px) * channels;
                    let w = wx * wy;
                    for (c, acc) in acc.iter_mut().enumerate() {
                        *acc += w * f64::from(src[offset + c]);
                    }
                }
            }

            let dest = &mut row[x * channels..(x + 1) * channels];
            for (d, v) in dest.iter_mut().zip(&acc) {
                *d = v.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

/// Weights for the four taps at offsets -1, 0, 1, 2 around a sample with
/// fractional part `t`.
fn weights(t: f64) -> [f64; 4] {
    [
        cubic(1.0 + t),
        cubic(t),
        cubic(1.0 - t),
        cubic(2.0 - t),
    ]
}

fn cubic(x: f64) -> f64 {
    let x = x.abs();
    if x <= 1.0 {
        ((A + 2.0) * x - (A + 3.0)) * x * x + 1.0
    } else if x < 2.0 {
        ((A * x - 5.0 * A) * x + 8.0 * A) * x - 4.0 * A
    } else {
        0.0
    }
}

fn clamp_index(i: i64, len: u32) -> usize {
    i.clamp(0, i64::from(len) - 1) as usize
}

#[cfg(test)]
mod tests {
    use image::{GrayImage, Luma, Rgb, RgbImage};

    use super::*;

    #[test]
    fn weights_sum_to_one() {
        for t in [0.0, 0.1, 0.5, 0.9] {
            let sum: f64 = weights(t).iter().sum();
            assert!((sum - 1.0).abs() < 1e-9, "t={t} sum={sum}");
        }
    }

    #[test]
    fn zero_rotation_is_identity() {
        let img = GrayImage::from_fn(13, 9, |x, y| Luma([(x * 17 + y * 5) as u8]));
        assert_eq!(rotate_about_center(&img, 0.0), img);
    }

    #[test]
    fn uniform_image_stays_uniform() {
        // Replicated borders mean there are no dark corners.
        let img = RgbImage::from_pixel(20, 10, Rgb([240, 230, 220]));
        let out = rotate_about_center(&img, 7.5);
        assert_eq!(out.dimensions(), (20, 10));
        assert!(out.pixels().all(|p| *p == Rgb([240, 230, 220])));
    }

    #[test]
    fn quarter_turn_moves_pixels_around_center() {
        // 90 degrees: the sample for (cx + 1, cy) comes from (cx, cy + 1).
        let mut img = GrayImage::from_pixel(11, 11, Luma([0]));
        img.put_pixel(5, 6, Luma([255]));
        let out = rotate_about_center(&img, 90.0);
        assert_eq!(out.get_pixel(6, 5).0[0], 255);
        assert_eq!(out.get_pixel(5, 6).0[0], 0);
    }
}
