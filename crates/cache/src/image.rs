//! Decoded images and the values stored in cache tiers

use crate::StatusCode;
use std::sync::Arc;

/// A decoded RGBA8 image.
///
/// The pixel count is fixed at construction and is the unit every cache
/// budget is measured in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl DecodedImage {
    /// Wrap raw RGBA8 pixel data
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }

    /// A fully transparent image of the given size
    pub fn blank(width: u32, height: u32) -> Self {
        let len = width as usize * height as usize * 4;
        Self::new(width, height, vec![0; len])
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw RGBA8 pixel data
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Give the pixel buffer back, e.g. for reuse by a decoder
    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }

    /// width × height
    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Memory size of the pixel data in bytes
    pub fn memory_size(&self) -> usize {
        self.pixels.len()
    }
}

/// A value held by one of the cache tiers
#[derive(Debug, Clone)]
pub enum CachedValue {
    /// A successfully decoded image
    Image(Arc<DecodedImage>),

    /// A negative sentinel recording that a resource failed to load
    Failed { status: StatusCode },
}

impl CachedValue {
    pub fn failed(status: StatusCode) -> Self {
        Self::Failed { status }
    }

    /// Whether this value belongs in the negative tier
    pub fn is_negative(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn image(&self) -> Option<&Arc<DecodedImage>> {
        match self {
            Self::Image(image) => Some(image),
            Self::Failed { .. } => None,
        }
    }

    /// Status recorded by a negative sentinel
    pub fn failure_status(&self) -> Option<StatusCode> {
        match self {
            Self::Image(_) => None,
            Self::Failed { status } => Some(*status),
        }
    }

    /// Pixel cost charged against the tier budget.
    ///
    /// A sentinel costs one pixel, like a 1×1 marker bitmap.
    pub fn pixel_count(&self) -> u64 {
        match self {
            Self::Image(image) => image.pixel_count(),
            Self::Failed { .. } => 1,
        }
    }
}

impl From<Arc<DecodedImage>> for CachedValue {
    fn from(image: Arc<DecodedImage>) -> Self {
        Self::Image(image)
    }
}

impl From<DecodedImage> for CachedValue {
    fn from(image: DecodedImage) -> Self {
        Self::Image(Arc::new(image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_count() {
        let image = DecodedImage::blank(40, 30);
        assert_eq!(image.pixel_count(), 1200);
        assert_eq!(image.memory_size(), 1200 * 4);
    }

    #[test]
    fn test_sentinel_costs_one_pixel() {
        let value = CachedValue::failed(StatusCode::NOT_FOUND);
        assert!(value.is_negative());
        assert!(value.image().is_none());
        assert_eq!(value.pixel_count(), 1);
    }

    #[test]
    fn test_failure_status() {
        let image = CachedValue::from(DecodedImage::blank(2, 2));
        assert_eq!(image.failure_status(), None);
        assert_eq!(image.pixel_count(), 4);

        let failed = CachedValue::failed(StatusCode::TRANSFORM_ERROR);
        assert_eq!(failed.failure_status(), Some(StatusCode::TRANSFORM_ERROR));
    }
}
