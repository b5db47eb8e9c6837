//! Skew detection and correction.
//!
//! We binarize the page, find edges, and run a Hough transform over them.
//! Lines of handwriting produce long, nearly horizontal edges, so the median
//! line angle is a good estimate of how far the page is rotated.
//!
//! Limitation: a page that is upside down has nearly horizontal lines too, so
//! we can't tell 0° from 180° and leave such pages as they are.

use image::{GrayImage, Luma};
use imageproc::{
    contrast::otsu_level,
    edges::canny,
    hough::{LineDetectionOptions, detect_lines},
};

use super::rotate::rotate_about_center;
use crate::{prelude::*, raster::Raster};

/// Canny hysteresis thresholds.
const CANNY_LOW: f32 = 50.0;
const CANNY_HIGH: f32 = 150.0;

/// Minimum Hough votes for a line to count.
const VOTE_THRESHOLD: u32 = 200;

/// Skews at or below this many degrees are left alone.
const MIN_CORRECTION_DEGREES: f64 = 0.5;

/// Border added around the binarized page before edge detection, filled by
/// replicating the nearest pixel. `imageproc`'s hysteresis step can index
/// outside the image when edges reach the border.
const MARGIN: u32 = 8;

/// Estimate the page skew, in degrees. Positive means lines slope down to
/// the right. Returns `None` if no lines were found.
pub fn estimate_skew_angle(gray: &GrayImage) -> Option<f64> {
    if gray.width() == 0 || gray.height() == 0 {
        return None;
    }
    let binary = binarize_inverted(gray);
    let edges = canny(&binary, CANNY_LOW, CANNY_HIGH);
    let lines = detect_lines(
        &edges,
        LineDetectionOptions {
            vote_threshold: VOTE_THRESHOLD,
            suppression_radius: 1,
        },
    );
    trace!(count = lines.len(), "Hough lines");

    let mut angles = lines
        .iter()
        .map(|line| f64::from(line.angle_in_degrees) - 90.0)
        .collect::<Vec<_>>();
    median(&mut angles)
}

/// Straighten a page. Returns the input unchanged when no lines are found or
/// the skew is too small to matter.
#[instrument(level = "debug", skip_all)]
pub fn deskew(raster: Raster) -> Raster {
    let Some(angle) = estimate_skew_angle(&raster.to_gray()) else {
        debug!("No lines found, skipping deskew");
        return raster;
    };
    if angle.abs() <= MIN_CORRECTION_DEGREES {
        debug!(angle, "Skew below threshold, skipping deskew");
        return raster;
    }
    debug!(angle, "Correcting skew");
    match &raster {
        Raster::Gray(img) => Raster::Gray(rotate_about_center(img, angle)),
        Raster::Color(img) => Raster::Color(rotate_about_center(img, angle)),
    }
}

/// Otsu threshold, with ink as white (255) on a black background, padded by
/// [`MARGIN`] replicated pixels on every side.
fn binarize_inverted(gray: &GrayImage) -> GrayImage {
    let level = otsu_level(gray);
    let (width, height) = gray.dimensions();
    GrayImage::from_fn(width + 2 * MARGIN, height + 2 * MARGIN, |x, y| {
        let sx = x.saturating_sub(MARGIN).min(width - 1);
        let sy = y.saturating_sub(MARGIN).min(height - 1);
        let value = if gray.get_pixel(sx, sy).0[0] > level { 0 } else { 255 };
        Luma([value])
    })
}

/// Median, averaging the two middle values for even lengths.
fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A white page with thick dark bars at `slope_degrees`.
    fn ruled_page(width: u32, height: u32, slope_degrees: f64) -> GrayImage {
        let slope = slope_degrees.to_radians().tan();
        let cx = f64::from(width) / 2.0;
        let mut img = GrayImage::from_pixel(width, height, Luma([240]));
        for base in [100.0, 180.0, 260.0] {
            for x in 40..width - 40 {
                let center = base + slope * (f64::from(x) - cx);
                for dy in -3..=3 {
                    let y = (center + f64::from(dy)).round() as i64;
                    if (0..i64::from(height)).contains(&y) {
                        img.put_pixel(x, y as u32, Luma([15]));
                    }
                }
            }
        }
        img
    }

    #[test]
    fn median_handles_odd_and_even_lengths() {
        assert_eq!(median(&mut []), None);
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&mut [4.0, 1.0, 3.0, 2.0]), Some(2.5));
    }

    #[test]
    fn blank_page_is_unchanged() {
        let img = GrayImage::from_pixel(300, 200, Luma([250]));
        assert_eq!(estimate_skew_angle(&img), None);
        assert_eq!(deskew(Raster::Gray(img.clone())), Raster::Gray(img));
    }

    #[test]
    fn straight_page_is_pixel_identical() {
        let img = ruled_page(400, 320, 0.0);
        let angle = estimate_skew_angle(&img).expect("should find the bars");
        assert!(angle.abs() <= MIN_CORRECTION_DEGREES, "angle={angle}");
        assert_eq!(deskew(Raster::Gray(img.clone())), Raster::Gray(img));
    }

    #[test]
    fn detects_clockwise_skew() {
        let img = ruled_page(520, 360, 5.0);
        let angle = estimate_skew_angle(&img).expect("should find the bars");
        assert!((angle - 5.0).abs() <= 1.5, "angle={angle}");
    }

    #[test]
    fn detects_counterclockwise_skew() {
        let img = ruled_page(520, 360, -4.0);
        let angle = estimate_skew_angle(&img).expect("should find the bars");
        assert!((angle + 4.0).abs() <= 1.5, "angle={angle}");
    }

    #[test]
    fn correction_reduces_skew_and_keeps_size() {
        let img = ruled_page(520, 360, 6.0);
        let corrected = deskew(Raster::Gray(img));
        assert_eq!(corrected.dimensions(), (520, 360));
        let residual = estimate_skew_angle(&corrected.to_gray()).expect("bars survive");
        assert!(residual.abs() <= 1.5, "residual={residual}");
    }
}
