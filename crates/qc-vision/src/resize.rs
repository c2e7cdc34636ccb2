use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, DynamicImage};

use crate::inspect::{compute_fit_dimensions, Dimensions, THUMBNAIL_MAX};

pub const JPEG_QUALITY: u8 = 85;
pub const THUMBNAIL_QUALITY: u8 = 75;

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("encode jpeg: {0}")]
    Encode(#[source] image::ImageError),
}

#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub dimensions: Dimensions,
}

/// Decode `bytes`, shrink to fit `max` when needed, and encode as JPEG.
pub fn fit_jpeg(
    bytes: &[u8],
    max: Dimensions,
    quality: u8,
) -> Result<EncodedImage, TransformError> {
    let img = image::load_from_memory(bytes).map_err(TransformError::Decode)?;
    let src = Dimensions::new(img.width(), img.height());
    let target = compute_fit_dimensions(src, max);
    let img = if target == src {
        img
    } else {
        img.resize_exact(target.width, target.height, FilterType::Triangle)
    };
    Ok(EncodedImage {
        bytes: encode_jpeg(&img, quality)?,
        dimensions: target,
    })
}

pub fn thumbnail(bytes: &[u8]) -> Result<EncodedImage, TransformError> {
    fit_jpeg(bytes, THUMBNAIL_MAX, THUMBNAIL_QUALITY)
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, TransformError> {
    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(&rgb)
        .map_err(TransformError::Encode)?;
    Ok(out)
}

#[cfg(test)]
pub(crate) fn solid_jpeg(width: u32, height: u32) -> Vec<u8> {
    let pixels = image::RgbImage::from_pixel(width, height, image::Rgb([200, 40, 40]));
    let img = DynamicImage::ImageRgb8(pixels);
    encode_jpeg(&img, 90).unwrap()
}
