use std::io::Cursor;
use std::str::FromStr;

use image::imageops::FilterType;
use image::io::{Limits, Reader as ImageReader};
use image::{DynamicImage, RgbImage};
use ndarray::Array4;

use crate::errors::PredictError;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// How pixel values are scaled before they enter the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    /// Plain `[0, 1]` scaling, as expected by exported YOLO classifiers.
    Unit,
    /// `[0, 1]` scaling followed by ImageNet mean/std standardisation.
    ImageNet,
}

impl FromStr for Normalization {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unit" => Ok(Normalization::Unit),
            "imagenet" => Ok(Normalization::ImageNet),
            other => Err(format!(
                "unknown normalization {other:?}, expected unit or imagenet"
            )),
        }
    }
}

/// Fixed at load time together with the model it feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preprocessing {
    pub input_size: u32,
    pub normalization: Normalization,
    pub max_dimension: u32,
}

impl Default for Preprocessing {
    fn default() -> Self {
        Self {
            input_size: 224,
            normalization: Normalization::Unit,
            max_dimension: 8192,
        }
    }
}

impl Preprocessing {
    /// Decodes `bytes` into a 3-channel pixel grid, rejecting anything whose
    /// declared dimensions exceed `max_dimension` before pixels are allocated.
    pub fn decode(&self, bytes: &[u8]) -> Result<RgbImage, PredictError> {
        if bytes.is_empty() {
            return Err(PredictError::InvalidImage("empty payload".into()));
        }

        let mut reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| PredictError::InvalidImage(e.to_string()))?;

        if reader.format().is_none() {
            return Err(PredictError::InvalidImage("unknown image format".into()));
        }

        let mut limits = Limits::default();
        limits.max_image_width = Some(self.max_dimension);
        limits.max_image_height = Some(self.max_dimension);
        reader.limits(limits);

        let decoded = reader
            .decode()
            .map_err(|e| PredictError::InvalidImage(e.to_string()))?;

        Ok(decoded.to_rgb8())
    }

    /// Resizes the shortest side to `input_size`, centre-crops to a square and
    /// lays the pixels out as a `[1, 3, size, size]` NCHW tensor.
    pub fn to_tensor(&self, rgb: RgbImage) -> Array4<f32> {
        let size = self.input_size;
        let square = DynamicImage::ImageRgb8(rgb)
            .resize_to_fill(size, size, FilterType::Triangle)
            .to_rgb8();

        let (mean, std) = match self.normalization {
            Normalization::Unit => ([0.0; 3], [1.0; 3]),
            Normalization::ImageNet => (IMAGENET_MEAN, IMAGENET_STD),
        };

        let side = size as usize;
        Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            let pixel = square.get_pixel(x as u32, y as u32);
            (pixel[c] as f32 / 255.0 - mean[c]) / std[c]
        })
    }
}
