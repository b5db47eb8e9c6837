//! Image normalization before OCR.
//!
//! Handwritten pages arrive as phone photos and flatbed scans, so we clean
//! them up in a fixed order: grayscale, deskew, denoise, then local contrast
//! enhancement. Each stage can be switched off in [`PreprocessConfig`], and
//! none of them changes the image dimensions. Oversized pages may be shrunk
//! first, if `max_width` or `max_height` is set.

use image::imageops::{FilterType, resize};
use imageproc::filter::median_filter;

use crate::{config::PreprocessConfig, errors::PipelineError, prelude::*, raster::Raster};

pub mod clahe;
pub mod deskew;
pub mod rotate;

/// Runs the configured preprocessing stages.
#[derive(Clone, Debug, Default)]
pub struct ImageNormalizer {
    config: PreprocessConfig,
}

impl ImageNormalizer {
    /// Create a normalizer, rejecting invalid settings up front.
    pub fn new(config: PreprocessConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Run every enabled stage, in order.
    #[instrument(level = "debug", skip_all, fields(width = image.width(), height = image.height()))]
    pub fn normalize(&self, image: Raster) -> Result<Raster, PipelineError> {
        image.check_not_empty()?;
        let config = &self.config;
        let mut image = image;

        if config.max_width.is_some() || config.max_height.is_some() {
            image = resize_if_needed(
                image,
                config.max_width.unwrap_or(u32::MAX),
                config.max_height.unwrap_or(u32::MAX),
            );
        }
        if config.grayscale {
            image = grayscale(image);
            debug!("Converted to grayscale");
        }
        if config.deskew {
            image = deskew::deskew(image);
        }
        if config.denoise {
            image = denoise(&image, config.median_blur_kernel)?;
            debug!(kernel = config.median_blur_kernel, "Applied median filter");
        }
        if config.enhance_contrast {
            let [grid_x, grid_y] = config.clahe_grid_size;
            let enhanced =
                clahe::equalize(&image.to_gray(), config.clahe_clip_limit, grid_x, grid_y)?;
            image = Raster::Gray(enhanced);
            debug!("Applied contrast enhancement");
        }
        Ok(image)
    }
}

/// Convenience wrapper around [`ImageNormalizer::normalize`].
pub fn normalize(image: Raster, config: &PreprocessConfig) -> Result<Raster, PipelineError> {
    ImageNormalizer::new(config.clone())?.normalize(image)
}

/// Convert to a single channel. Gray images pass through untouched.
pub fn grayscale(raster: Raster) -> Raster {
    match raster {
        Raster::Gray(_) => raster,
        Raster::Color(_) => Raster::Gray(raster.to_gray()),
    }
}

/// Apply a `kernel`×`kernel` median filter to each channel. Edges are
/// handled by clamping, so the output has the same size as the input.
pub fn denoise(image: &Raster, kernel: u32) -> Result<Raster, PipelineError> {
    if kernel == 0 || kernel % 2 == 0 {
        return Err(PipelineError::InvalidConfig(format!(
            "median filter kernel must be a positive odd number, got {kernel}"
        )));
    }
    let radius = (kernel - 1) / 2;
    Ok(match image {
        Raster::Gray(img) => Raster::Gray(median_filter(img, radius, radius)),
        Raster::Color(img) => Raster::Color(median_filter(img, radius, radius)),
    })
}

/// Shrink an image to fit within `max_width`×`max_height`, keeping its aspect
/// ratio. Images that already fit are returned unchanged.
pub fn resize_if_needed(raster: Raster, max_width: u32, max_height: u32) -> Raster {
    let (width, height) = raster.dimensions();
    if width <= max_width && height <= max_height {
        return raster;
    }
    let scale = f64::min(
        f64::from(max_width) / f64::from(width),
        f64::from(max_height) / f64::from(height),
    );
    let new_width = ((f64::from(width) * scale) as u32).max(1);
    let new_height = ((f64::from(height) * scale) as u32).max(1);
    debug!(width, height, new_width, new_height, "Resizing image");
    match raster {
        Raster::Gray(img) => {
            Raster::Gray(resize(&img, new_width, new_height, FilterType::Lanczos3))
        }
        Raster::Color(img) => {
            Raster::Color(resize(&img, new_width, new_height, FilterType::Lanczos3))
        }
    }
}

/// A gray test page: white paper with a few dark strokes.
#[cfg(test)]
pub(crate) fn test_page(width: u32, height: u32) -> image::GrayImage {
    image::GrayImage::from_fn(width, height, |x, y| {
        let stroke = (y % 20 < 3 && x > width / 8 && x < width * 7 / 8) || (x * 7 + y * 3) % 97 == 0;
        image::Luma([if stroke { 20 } else { 235 }])
    })
}

#[cfg(test)]
mod tests {
    use image::{GrayImage, Luma, Rgb, RgbImage};

    use super::*;

    fn all_stages_on() -> PreprocessConfig {
        PreprocessConfig::default()
    }

    #[test]
    fn normalize_preserves_dimensions() {
        for (w, h) in [(64, 48), (33, 71), (5, 5), (1, 1)] {
            let out = normalize(Raster::Gray(test_page(w, h)), &all_stages_on()).unwrap();
            assert_eq!(out.dimensions(), (w, h));
        }
    }

    #[test]
    fn normalize_color_input_produces_gray_output() {
        let img = RgbImage::from_fn(40, 30, |x, _| Rgb([x as u8 * 5, 100, 200]));
        let out = normalize(Raster::Color(img), &all_stages_on()).unwrap();
        assert!(out.is_gray());
        assert_eq!(out.dimensions(), (40, 30));
    }

    #[test]
    fn all_stages_off_is_identity() {
        let config = PreprocessConfig {
            grayscale: false,
            deskew: false,
            denoise: false,
            enhance_contrast: false,
            ..PreprocessConfig::default()
        };
        let img = RgbImage::from_fn(9, 7, |x, y| Rgb([x as u8, y as u8, 77]));
        let out = normalize(Raster::Color(img.clone()), &config).unwrap();
        assert_eq!(out, Raster::Color(img));
    }

    #[test]
    fn empty_image_is_rejected() {
        let err = normalize(Raster::Gray(GrayImage::new(0, 0)), &all_stages_on()).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidImage(_)));
    }

    #[test]
    fn even_kernel_is_rejected_before_processing() {
        let config = PreprocessConfig {
            median_blur_kernel: 2,
            ..PreprocessConfig::default()
        };
        assert!(matches!(
            ImageNormalizer::new(config),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn median_filter_removes_salt_noise() {
        let mut img = GrayImage::from_pixel(9, 9, Luma([200]));
        img.put_pixel(4, 4, Luma([0]));
        let Raster::Gray(out) = denoise(&Raster::Gray(img), 3).unwrap() else {
            panic!("expected gray output");
        };
        assert_eq!(out.get_pixel(4, 4).0[0], 200);
    }

    #[test]
    fn median_filter_keeps_color() {
        let img = RgbImage::from_pixel(5, 5, Rgb([1, 2, 3]));
        let out = denoise(&Raster::Color(img.clone()), 5).unwrap();
        assert_eq!(out, Raster::Color(img));
    }

    #[test]
    fn normalize_shrinks_oversized_pages() {
        let config = PreprocessConfig {
            max_width: Some(50),
            ..PreprocessConfig::default()
        };
        let out = normalize(Raster::Gray(test_page(200, 80)), &config).unwrap();
        assert_eq!(out.dimensions(), (50, 20));
        let small = normalize(Raster::Gray(test_page(40, 80)), &config).unwrap();
        assert_eq!(small.dimensions(), (40, 80));
    }

    #[test]
    fn resize_keeps_aspect_ratio() {
        let out = resize_if_needed(Raster::Gray(test_page(400, 200)), 100, 100);
        assert_eq!(out.dimensions(), (100, 50));
        let small = resize_if_needed(Raster::Gray(test_page(40, 20)), 100, 100);
        assert_eq!(small.dimensions(), (40, 20));
    }
}
