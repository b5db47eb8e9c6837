//! Contrast-limited adaptive histogram equalization (CLAHE).
//!
//! The image is split into a grid of tiles. Each tile gets its own
//! equalization lookup table, built from a histogram whose peaks are clipped
//! so that flat paper doesn't get amplified into noise. Each output pixel
//! blends the tables of the four nearest tile centers.
//!
//! When the image size isn't a multiple of the grid, tiles are rounded up
//! and the missing pixels are read by reflecting across the image edge.

use image::{GrayImage, Luma};

use crate::errors::PipelineError;

const BINS: usize = 256;

/// Apply CLAHE with a `grid_x`×`grid_y` tile grid. A grid larger than the
/// image is reduced to one tile per pixel.
pub fn equalize(
    image: &GrayImage,
    clip_limit: f64,
    grid_x: u32,
    grid_y: u32,
) -> Result<GrayImage, PipelineError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(PipelineError::InvalidImage("image has zero size".to_owned()));
    }
    if grid_x == 0 || grid_y == 0 {
        return Err(PipelineError::InvalidConfig(format!(
            "contrast grid must be at least 1x1, got {grid_x}x{grid_y}"
        )));
    }
    if !(clip_limit.is_finite() && clip_limit > 0.0) {
        return Err(PipelineError::InvalidConfig(format!(
            "contrast clip limit must be positive, got {clip_limit}"
        )));
    }

    let tiles_x = grid_x.min(width);
    let tiles_y = grid_y.min(height);
    let tile_w = width.div_ceil(tiles_x);
    let tile_h = height.div_ceil(tiles_y);
    let tile_area = u64::from(tile_w) * u64::from(tile_h);
    let clip = ((clip_limit * tile_area as f64 / BINS as f64) as u64).max(1);

    let mut luts = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let mut hist = [0u64; BINS];
            for y in ty * tile_h..(ty + 1) * tile_h {
                let sy = reflect(y, height);
                for x in tx * tile_w..(tx + 1) * tile_w {
                    let sx = reflect(x, width);
                    hist[usize::from(image.get_pixel(sx, sy).0[0])] += 1;
                }
            }
            clip_histogram(&mut hist, clip);
            luts.push(lookup_table(&hist, tile_area));
        }
    }

    let lut_at = |tx: u32, ty: u32| &luts[(ty * tiles_x + tx) as usize];
    let inv_tw = 1.0 / f64::from(tile_w);
    let inv_th = 1.0 / f64::from(tile_h);

    Ok(GrayImage::from_fn(width, height, |x, y| {
        let v = usize::from(image.get_pixel(x, y).0[0]);

        let (tx1, tx2, xa) = neighbors(f64::from(x) * inv_tw - 0.5, tiles_x);
        let (ty1, ty2, ya) = neighbors(f64::from(y) * inv_th - 0.5, tiles_y);

        let top = f64::from(lut_at(tx1, ty1)[v]) * (1.0 - xa)
            + f64::from(lut_at(tx2, ty1)[v]) * xa;
        let bottom = f64::from(lut_at(tx1, ty2)[v]) * (1.0 - xa)
            + f64::from(lut_at(tx2, ty2)[v]) * xa;
        let value = top * (1.0 - ya) + bottom * ya;
        Luma([value.round().clamp(0.0, 255.0) as u8])
    }))
}

/// Clip every bin at `clip` and spread the excess evenly, with any remainder
/// going to evenly spaced bins.
fn clip_histogram(hist: &mut [u64; BINS], clip: u64) {
    let mut excess = 0;
    for count in hist.iter_mut() {
        if *count > clip {
            excess += *count - clip;
            *count = clip;
        }
    }
    let batch = excess / BINS as u64;
    let mut residual = excess % BINS as u64;
    for count in hist.iter_mut() {
        *count += batch;
    }
    if residual > 0 {
        let step = (BINS / residual as usize).max(1);
        let mut i = 0;
        while i < BINS && residual > 0 {
            hist[i] += 1;
            i += step;
            residual -= 1;
        }
    }
}

/// Cumulative distribution, scaled to `0..=255`.
fn lookup_table(hist: &[u64; BINS], total: u64) -> [u8; BINS] {
    let scale = (BINS - 1) as f64 / total as f64;
    let mut lut = [0u8; BINS];
    let mut sum = 0;
    for (out, count) in lut.iter_mut().zip(hist) {
        sum += count;
        *out = (sum as f64 * scale).round().min(255.0) as u8;
    }
    lut
}

/// The two tile indices surrounding position `pos` (in tile units, relative
/// to tile centers), and the weight of the second.
fn neighbors(pos: f64, tiles: u32) -> (u32, u32, f64) {
    let lower = pos.floor();
    let weight = pos - lower;
    let lower = lower as i64;
    let last = i64::from(tiles) - 1;
    let first = lower.clamp(0, last) as u32;
    let second = (lower + 1).clamp(0, last) as u32;
    (first, second, weight)
}

/// Reflect an index past the end of `0..len` back into range, without
/// repeating the edge pixel.
fn reflect(i: u32, len: u32) -> u32 {
    if len == 1 {
        0
    } else if i < len {
        i
    } else {
        (2 * (len - 1)).saturating_sub(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::test_page;

    fn contrast(img: &GrayImage) -> u8 {
        let min = img.pixels().map(|p| p.0[0]).min().unwrap();
        let max = img.pixels().map(|p| p.0[0]).max().unwrap();
        max - min
    }

    #[test]
    fn preserves_dimensions_for_awkward_sizes() {
        for (w, h) in [(64, 64), (37, 23), (3, 100), (1, 1), (7, 5)] {
            let out = equalize(&test_page(w, h), 2.0, 8, 8).unwrap();
            assert_eq!(out.dimensions(), (w, h));
        }
    }

    #[test]
    fn stretches_low_contrast_image() {
        let img = GrayImage::from_fn(64, 64, |x, y| Luma([100 + ((x + y) % 20) as u8]));
        let out = equalize(&img, 2.0, 8, 8).unwrap();
        assert!(contrast(&out) > contrast(&img), "{} <= {}", contrast(&out), contrast(&img));
    }

    #[test]
    fn uniform_image_stays_uniform() {
        let img = GrayImage::from_pixel(32, 32, Luma([128]));
        let out = equalize(&img, 2.0, 4, 4).unwrap();
        let first = out.get_pixel(0, 0).0[0];
        assert!(out.pixels().all(|p| p.0[0] == first));
    }

    #[test]
    fn clipping_conserves_total_count() {
        let mut hist = [0u64; BINS];
        hist[10] = 1000;
        hist[200] = 37;
        clip_histogram(&mut hist, 40);
        assert_eq!(hist.iter().sum::<u64>(), 1037);
        assert!(hist[10] <= 40 + 1000 / 256 + 1);
    }

    #[test]
    fn lookup_table_is_monotonic_and_ends_at_255() {
        let mut hist = [0u64; BINS];
        hist[50] = 10;
        hist[60] = 30;
        let lut = lookup_table(&hist, 40);
        assert!(lut.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(lut[255], 255);
        assert_eq!(lut[49], 0);
    }

    #[test]
    fn rejects_bad_parameters() {
        let img = test_page(10, 10);
        assert!(equalize(&img, 2.0, 0, 8).is_err());
        assert!(equalize(&img, -1.0, 8, 8).is_err());
        assert!(equalize(&GrayImage::new(0, 3), 2.0, 8, 8).is_err());
    }

    #[test]
    fn reflect_stays_in_bounds() {
        assert_eq!(reflect(4, 5), 4);
        assert_eq!(reflect(5, 5), 3);
        assert_eq!(reflect(7, 5), 1);
        assert_eq!(reflect(3, 1), 0);
    }
}
