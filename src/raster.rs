//! In-memory page images.

use std::io::Cursor;

use image::{DynamicImage, GrayImage, ImageFormat, Luma, RgbImage};

use crate::{config::UploadConfig, errors::PipelineError, prelude::*};

/// 0.299, 0.587 and 0.114, scaled by `1 << BT601_SHIFT`.
const BT601_R: u32 = 4899;
const BT601_G: u32 = 9617;
const BT601_B: u32 = 1868;
const BT601_SHIFT: u32 = 14;

/// An 8-bit page image, either single-channel or RGB.
///
/// Every processing stage takes a `Raster` and returns a new one. We never
/// mutate an input in place.
#[derive(Clone, Debug, PartialEq)]
pub enum Raster {
    Gray(GrayImage),
    Color(RgbImage),
}

impl Raster {
    /// Decode an image from raw file bytes. Alpha channels are dropped and
    /// 16-bit images are reduced to 8 bits.
    pub fn decode(bytes: &[u8]) -> Result<Self, PipelineError> {
        let format = image::guess_format(bytes)
            .map_err(|err| PipelineError::DecodeFailure(err.to_string()))?;
        let image = image::load_from_memory_with_format(bytes, format)
            .map_err(|err| PipelineError::DecodeFailure(err.to_string()))?;
        let raster = Self::from(image);
        raster.check_not_empty()?;
        Ok(raster)
    }

    /// Load and decode an image file.
    pub async fn load(path: &Path) -> Result<Self, PipelineError> {
        let bytes = tokio::fs::read(path).await.map_err(|err| {
            PipelineError::DecodeFailure(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::decode(&bytes)
    }

    pub fn width(&self) -> u32 {
        match self {
            Raster::Gray(img) => img.width(),
            Raster::Color(img) => img.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Raster::Gray(img) => img.height(),
            Raster::Color(img) => img.height(),
        }
    }

    /// `(width, height)`.
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width(), self.height())
    }

    pub fn is_gray(&self) -> bool {
        matches!(self, Raster::Gray(_))
    }

    /// Return an error if this raster has no pixels.
    pub fn check_not_empty(&self) -> Result<(), PipelineError> {
        if self.width() == 0 || self.height() == 0 {
            Err(PipelineError::InvalidImage(format!(
                "image has zero size ({}x{})",
                self.width(),
                self.height()
            )))
        } else {
            Ok(())
        }
    }

    /// Get a grayscale copy (or a clone, if we're already gray). Color is
    /// weighted with the BT.601 coefficients, in 14-bit fixed point.
    pub fn to_gray(&self) -> GrayImage {
        match self {
            Raster::Gray(img) => img.clone(),
            Raster::Color(img) => GrayImage::from_fn(img.width(), img.height(), |x, y| {
                let [r, g, b] = img.get_pixel(x, y).0;
                let luma = (u32::from(r) * BT601_R
                    + u32::from(g) * BT601_G
                    + u32::from(b) * BT601_B
                    + (1 << (BT601_SHIFT - 1)))
                    >> BT601_SHIFT;
                Luma([luma.min(255) as u8])
            }),
        }
    }

    /// Encode as PNG, for handing to external tools and APIs.
    pub fn to_png(&self) -> Result<Vec<u8>> {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::from(self.clone())
            .write_to(&mut buf, ImageFormat::Png)
            .context("could not encode image as PNG")?;
        Ok(buf.into_inner())
    }
}

impl From<DynamicImage> for Raster {
    fn from(image: DynamicImage) -> Self {
        match image {
            DynamicImage::ImageLuma8(img) => Raster::Gray(img),
            DynamicImage::ImageLuma16(_) | DynamicImage::ImageLumaA8(_) => {
                Raster::Gray(image.into_luma8())
            }
            DynamicImage::ImageLumaA16(_) => Raster::Gray(image.into_luma8()),
            DynamicImage::ImageRgb8(img) => Raster::Color(img),
            other => Raster::Color(other.into_rgb8()),
        }
    }
}

impl From<Raster> for DynamicImage {
    fn from(raster: Raster) -> Self {
        match raster {
            Raster::Gray(img) => DynamicImage::ImageLuma8(img),
            Raster::Color(img) => DynamicImage::ImageRgb8(img),
        }
    }
}

/// An uploaded file, before we've looked inside it.
#[derive(Clone, Debug)]
pub struct Upload {
    /// The original file name, used for extension checks and reporting.
    pub filename: String,

    /// The raw file contents.
    pub bytes: Vec<u8>,
}

impl Upload {
    /// Read an upload from disk. Files larger than `max_file_size` are
    /// rejected without being read.
    pub async fn from_path(path: &Path, max_file_size: u64) -> Result<Self> {
        let size = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("could not read {}", path.display()))?
            .len();
        if size > max_file_size {
            return Err(too_large(size, max_file_size).into());
        }
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("could not read {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { filename, bytes })
    }

    /// Check the extension and size against our limits.
    pub fn validate(&self, limits: &UploadConfig) -> Result<(), PipelineError> {
        let ext = Path::new(&self.filename)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
            .unwrap_or_default();
        if !limits
            .allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&ext))
        {
            return Err(PipelineError::invalid_input(format!(
                "file type {:?} not allowed (expected one of: {})",
                ext,
                limits.allowed_extensions.join(", ")
            )));
        }
        let size = self.bytes.len() as u64;
        if size > limits.max_file_size {
            return Err(too_large(size, limits.max_file_size));
        }
        Ok(())
    }
}

fn too_large(size: u64, limit: u64) -> PipelineError {
    PipelineError::invalid_input(format!("file is {size} bytes, limit is {limit} bytes"))
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    fn upload(filename: &str, len: usize) -> Upload {
        Upload {
            filename: filename.to_owned(),
            bytes: vec![0; len],
        }
    }

    #[test]
    fn decodes_png_round_trip() {
        let img = GrayImage::from_fn(7, 5, |x, y| Luma([(x * 30 + y) as u8]));
        let png = Raster::Gray(img.clone()).to_png().unwrap();
        assert_eq!(Raster::decode(&png).unwrap(), Raster::Gray(img));
    }

    #[test]
    fn decodes_color_as_color() {
        let img = RgbImage::from_pixel(3, 3, Rgb([10, 20, 30]));
        let png = Raster::Color(img).to_png().unwrap();
        assert!(!Raster::decode(&png).unwrap().is_gray());
    }

    #[test]
    fn garbage_is_a_decode_failure() {
        assert!(matches!(
            Raster::decode(b"definitely not an image"),
            Err(PipelineError::DecodeFailure(_))
        ));
    }

    #[test]
    fn empty_raster_is_invalid() {
        let raster = Raster::Gray(GrayImage::new(0, 10));
        assert!(matches!(
            raster.check_not_empty(),
            Err(PipelineError::InvalidImage(_))
        ));
    }

    #[test]
    fn color_to_gray_uses_bt601_weights() {
        let img = RgbImage::from_fn(4, 1, |x, _| match x {
            0 => Rgb([255, 0, 0]),
            1 => Rgb([0, 255, 0]),
            2 => Rgb([0, 0, 255]),
            _ => Rgb([255, 255, 255]),
        });
        let gray = Raster::Color(img).to_gray();
        let values: Vec<u8> = gray.pixels().map(|p| p.0[0]).collect();
        assert_eq!(values, vec![76, 150, 29, 255]);
    }

    #[tokio::test]
    async fn oversized_file_is_rejected_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.png");
        std::fs::write(&path, vec![0u8; 101]).unwrap();

        let err = Upload::from_path(&path, 100).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::InvalidInput(_))
        ));

        let upload = Upload::from_path(&path, 101).await.unwrap();
        assert_eq!(upload.filename, "page.png");
        assert_eq!(upload.bytes.len(), 101);
    }

    #[test]
    fn validate_accepts_known_extensions_case_insensitively() {
        let limits = UploadConfig::default();
        for name in ["a.jpg", "b.JPEG", "c.png", "d.Tif", "e.webp"] {
            assert!(upload(name, 10).validate(&limits).is_ok(), "{name}");
        }
    }

    #[test]
    fn validate_rejects_other_extensions_and_large_files() {
        let limits = UploadConfig {
            max_file_size: 100,
            ..UploadConfig::default()
        };
        assert!(upload("notes.pdf", 10).validate(&limits).is_err());
        assert!(upload("no_extension", 10).validate(&limits).is_err());
        assert!(upload("big.png", 101).validate(&limits).is_err());
        assert!(upload("exact.png", 100).validate(&limits).is_ok());
    }
}
