//! Boundary to the external face-descriptor model.
//!
//! The model itself lives outside this crate. The core only validates the
//! image it hands over and interprets the typed failures that come back.

use crate::types::Descriptor;
use image::ImageReader;
use std::future::Future;
use std::io::Cursor;
use thiserror::Error;

/// Embedding dimension of the default descriptor model.
pub const DEFAULT_DESCRIPTOR_DIM: usize = 128;

pub const DEFAULT_MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_IMAGE_SIDE: u32 = 4096;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImageError {
    #[error("image is empty")]
    Empty,
    #[error("image could not be decoded: {0}")]
    Unreadable(String),
    #[error("image too large: {0}")]
    TooLarge(String),
}

/// Bounds on caller-supplied images, checked before any pixel is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLimits {
    /// Maximum encoded size.
    pub max_bytes: usize,
    /// Maximum width and height declared by the image header.
    pub max_side: u32,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_IMAGE_BYTES,
            max_side: DEFAULT_MAX_IMAGE_SIDE,
        }
    }
}

impl ImageLimits {
    fn decoder_limits(&self) -> image::Limits {
        let mut limits = image::Limits::default();
        limits.max_image_width = Some(self.max_side);
        limits.max_image_height = Some(self.max_side);
        limits
    }
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("no face detected in the image")]
    NoFaceDetected,
    #[error("multiple faces detected; only one face may be visible")]
    MultipleFacesDetected,
    #[error("extractor did not answer within the time limit")]
    Timeout,
    #[error("extractor unavailable: {0}")]
    Unavailable(String),
    #[error("extractor returned a malformed descriptor: {0}")]
    Malformed(String),
}

/// A caller-supplied image that decodes as a picture.
#[derive(Debug, Clone)]
pub struct FaceImage {
    bytes: Vec<u8>,
    width: u32,
    height: u32,
}

impl FaceImage {
    /// Validate raw image bytes. Decoding only checks the image is usable;
    /// the original encoded bytes are what the extractor receives.
    pub fn decode(bytes: Vec<u8>, limits: &ImageLimits) -> Result<Self, ImageError> {
        if bytes.is_empty() {
            return Err(ImageError::Empty);
        }
        if bytes.len() > limits.max_bytes {
            return Err(ImageError::TooLarge(format!(
                "{} bytes exceeds the {} byte limit",
                bytes.len(),
                limits.max_bytes
            )));
        }

        let mut reader = ImageReader::new(Cursor::new(bytes.as_slice()))
            .with_guessed_format()
            .map_err(|e| ImageError::Unreadable(e.to_string()))?;
        reader.limits(limits.decoder_limits());
        let decoded = reader.decode().map_err(|e| match e {
            image::ImageError::Limits(limit) => ImageError::TooLarge(limit.to_string()),
            other => ImageError::Unreadable(other.to_string()),
        })?;
        let (width, height) = (decoded.width(), decoded.height());
        if width == 0 || height == 0 {
            return Err(ImageError::Empty);
        }
        Ok(Self {
            bytes,
            width,
            height,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

/// Turns one image into exactly one face descriptor.
pub trait DescriptorExtractor: Send + Sync {
    fn extract(
        &self,
        image: &FaceImage,
    ) -> impl Future<Output = Result<Descriptor, ExtractError>> + Send;
}

/// Reject descriptors a healthy model would never produce.
pub fn check_descriptor(descriptor: &Descriptor, expected_dim: usize) -> Result<(), ExtractError> {
    if descriptor.dimension() != expected_dim {
        return Err(ExtractError::Malformed(format!(
            "expected {expected_dim}-dim descriptor, got {}",
            descriptor.dimension()
        )));
    }
    if descriptor.values().iter().any(|v| !v.is_finite()) {
        return Err(ExtractError::Malformed("non-finite component".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, ImageFormat, Luma};
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img: ImageBuffer<Luma<u8>, Vec<u8>> = ImageBuffer::from_pixel(width, height, Luma([90]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_decode_valid_png() {
        let image = FaceImage::decode(png(4, 3), &ImageLimits::default()).unwrap();
        assert_eq!((image.width(), image.height()), (4, 3));
        assert!(!image.bytes().is_empty());
    }

    #[test]
    fn test_decode_empty() {
        assert_eq!(FaceImage::decode(Vec::new(), &ImageLimits::default()).unwrap_err(), ImageError::Empty);
    }

    #[test]
    fn test_decode_garbage() {
        let err = FaceImage::decode(b"definitely not an image".to_vec(), &ImageLimits::default())
            .unwrap_err();
        assert!(matches!(err, ImageError::Unreadable(_)));
    }

    #[test]
    fn test_decode_rejects_oversized_payload() {
        let bytes = png(4, 4);
        let limits = ImageLimits {
            max_bytes: bytes.len() - 1,
            ..ImageLimits::default()
        };
        let err = FaceImage::decode(bytes.clone(), &limits).unwrap_err();
        assert!(matches!(err, ImageError::TooLarge(_)));

        let exact = ImageLimits {
            max_bytes: bytes.len(),
            ..ImageLimits::default()
        };
        assert!(FaceImage::decode(bytes, &exact).is_ok());
    }

    #[test]
    fn test_decode_rejects_oversized_dimensions() {
        let limits = ImageLimits {
            max_side: 32,
            ..ImageLimits::default()
        };
        let err = FaceImage::decode(png(64, 8), &limits).unwrap_err();
        assert!(matches!(err, ImageError::TooLarge(_)));
        assert!(FaceImage::decode(png(32, 32), &limits).is_ok());
    }

    #[test]
    fn test_check_descriptor_dimension() {
        let d = Descriptor::new(vec![0.0; 3]);
        assert!(check_descriptor(&d, 3).is_ok());
        assert!(matches!(check_descriptor(&d, 128), Err(ExtractError::Malformed(_))));
    }

    #[test]
    fn test_check_descriptor_non_finite() {
        let d = Descriptor::new(vec![0.0, f32::NAN]);
        assert!(matches!(check_descriptor(&d, 2), Err(ExtractError::Malformed(_))));
    }
}
