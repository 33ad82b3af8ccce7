//! Image acquisition and CLIP-style preprocessing.
//!
//! One image is fetched at pipeline construction, padded to a square with the
//! normalization mean as background, resized, rescaled, and normalized into a
//! `(3, edge, edge)` tensor on the compute device.

use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, Rgb, RgbImage, imageops};
use serde::Deserialize;
use thiserror::Error;

// CLIP ViT-L/14-336 statistics, used when the checkpoint ships no
// preprocessor config.
const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_1];
const DEFAULT_EDGE: u32 = 336;

#[derive(Debug, Error)]
pub enum ImageSourceError {
    #[error("failed to fetch image over http")]
    Fetch(#[from] reqwest::Error),
    #[error("failed to read image file")]
    Io(#[from] std::io::Error),
    #[error("failed to decode image")]
    Decode(#[from] image::ImageError),
}

/// Loads an RGB-decodable image from a local path or an `http(s)` URL.
///
/// Network and filesystem failures propagate as-is; nothing is retried.
pub fn fetch_image(source: &str) -> Result<DynamicImage, ImageSourceError> {
    if source.starts_with("http://") || source.starts_with("https://") {
        log::debug!("fetching image from {source}");
        let bytes = reqwest::blocking::get(source)?.error_for_status()?.bytes()?;
        Ok(image::load_from_memory(&bytes)?)
    } else {
        Ok(image::ImageReader::open(source)?.decode()?)
    }
}

/// A target size as the various `preprocessor_config.json` layouts spell it.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum SizeSpec {
    Edge(u32),
    WidthHeight { height: u32, width: u32 },
    ShortestEdge { shortest_edge: u32 },
}

impl SizeSpec {
    fn edge(self) -> u32 {
        match self {
            SizeSpec::Edge(edge) => edge,
            SizeSpec::WidthHeight { height, .. } => height,
            SizeSpec::ShortestEdge { shortest_edge } => shortest_edge,
        }
    }
}

/// The subset of `preprocessor_config.json` the pad-and-normalize path needs.
/// Absent fields fall back to the CLIP ViT-L/336 values.
#[derive(Debug, Clone, Deserialize)]
pub struct PreProcessorConfig {
    #[serde(default = "default_mean")]
    pub image_mean: [f32; 3],
    #[serde(default = "default_std")]
    pub image_std: [f32; 3],
    #[serde(default = "default_rescale_factor")]
    pub rescale_factor: f32,
    #[serde(default)]
    pub crop_size: Option<SizeSpec>,
    #[serde(default)]
    pub size: Option<SizeSpec>,
}

fn default_mean() -> [f32; 3] {
    CLIP_MEAN
}

fn default_std() -> [f32; 3] {
    CLIP_STD
}

fn default_rescale_factor() -> f32 {
    1.0 / 255.0
}

impl Default for PreProcessorConfig {
    fn default() -> Self {
        Self {
            image_mean: CLIP_MEAN,
            image_std: CLIP_STD,
            rescale_factor: default_rescale_factor(),
            crop_size: None,
            size: None,
        }
    }
}

impl PreProcessorConfig {
    fn target_edge(&self) -> u32 {
        self.crop_size
            .or(self.size)
            .map(SizeSpec::edge)
            .unwrap_or(DEFAULT_EDGE)
    }
}

/// Turns a decoded image into the tensor the vision tower expects.
#[derive(Debug, Clone)]
pub struct ImageProcessor {
    image_mean: [f32; 3],
    image_std: [f32; 3],
    rescale_factor: f32,
    target_edge: u32,
}

impl ImageProcessor {
    pub fn new(config: &PreProcessorConfig) -> Self {
        Self {
            image_mean: config.image_mean,
            image_std: config.image_std,
            rescale_factor: config.rescale_factor,
            target_edge: config.target_edge(),
        }
    }

    /// Pad to square with the mean color, resize, rescale, and normalize.
    /// Returns a `(1, 3, edge, edge)` tensor on `device` in `dtype`.
    pub fn preprocess(
        &self,
        img: &DynamicImage,
        dtype: DType,
        device: &Device,
    ) -> Result<Tensor, candle_core::Error> {
        let fill = Rgb(self.image_mean.map(|m| (m * 255.0).round() as u8));
        let squared = pad_to_square(&img.to_rgb8(), fill);
        let edge = self.target_edge;
        let resized = imageops::resize(&squared, edge, edge, imageops::FilterType::CatmullRom);

        let (height, width) = (edge as usize, edge as usize);
        let raw = resized.into_raw();
        let pixels = Tensor::from_vec(raw, (height, width, 3), &Device::Cpu)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(self.rescale_factor as f64, 0.0)?;
        let mean = Tensor::new(&self.image_mean, &Device::Cpu)?.reshape((3, 1, 1))?;
        let std = Tensor::new(&self.image_std, &Device::Cpu)?.reshape((3, 1, 1))?;
        pixels
            .broadcast_sub(&mean)?
            .broadcast_div(&std)?
            .unsqueeze(0)?
            .to_dtype(dtype)?
            .to_device(device)
    }
}

/// Centers the image on a square canvas filled with `fill`. The square side
/// is the longer input edge.
fn pad_to_square(img: &RgbImage, fill: Rgb<u8>) -> RgbImage {
    let (width, height) = img.dimensions();
    if width == height {
        return img.clone();
    }
    let side = width.max(height);
    let mut canvas = RgbImage::from_pixel(side, side, fill);
    let x = i64::from((side - width) / 2);
    let y = i64::from((side - height) / 2);
    imageops::overlay(&mut canvas, img, x, y);
    canvas
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_landscape_to_square_centered() {
        let img = RgbImage::from_pixel(4, 2, Rgb([10, 20, 30]));
        let fill = Rgb([0, 0, 0]);
        let padded = pad_to_square(&img, fill);

        assert_eq!(padded.dimensions(), (4, 4));
        // Fill above, content in the middle band, fill below.
        assert_eq!(*padded.get_pixel(0, 0), fill);
        assert_eq!(*padded.get_pixel(0, 1), Rgb([10, 20, 30]));
        assert_eq!(*padded.get_pixel(0, 2), Rgb([10, 20, 30]));
        assert_eq!(*padded.get_pixel(0, 3), fill);
    }

    #[test]
    fn square_input_is_unchanged() {
        let img = RgbImage::from_pixel(3, 3, Rgb([7, 7, 7]));
        let padded = pad_to_square(&img, Rgb([0, 0, 0]));
        assert_eq!(padded, img);
    }

    #[test]
    fn preprocess_normalizes_known_pixel() {
        let config: PreProcessorConfig =
            serde_json::from_str(r#"{ "crop_size": { "height": 4, "width": 4 } }"#).unwrap();
        let processor = ImageProcessor::new(&config);

        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([255, 255, 255])));
        let tensor = processor
            .preprocess(&img, DType::F32, &Device::Cpu)
            .unwrap();
        assert_eq!(tensor.dims(), &[1, 3, 4, 4]);

        let values = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let expected = (1.0 - CLIP_MEAN[0]) / CLIP_STD[0];
        assert!((values[0] - expected).abs() < 1e-4);
    }

    #[test]
    fn config_defaults_match_clip() {
        let config: PreProcessorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.image_mean, CLIP_MEAN);
        assert_eq!(config.target_edge(), DEFAULT_EDGE);
        assert!((config.rescale_factor - 1.0 / 255.0).abs() < f32::EPSILON);
    }

    #[test]
    fn size_spec_variants_resolve() {
        let shortest: PreProcessorConfig =
            serde_json::from_str(r#"{ "size": { "shortest_edge": 224 } }"#).unwrap();
        assert_eq!(shortest.target_edge(), 224);

        let plain: PreProcessorConfig = serde_json::from_str(r#"{ "size": 448 }"#).unwrap();
        assert_eq!(plain.target_edge(), 448);
    }
}
