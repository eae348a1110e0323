//! Decode collaborator interface and the default `image` crate decoder

use crate::error::DecodeError;
use crate::fetch::ImageSource;
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, ImageDecoder, ImageReader, Limits};
use pixcache_cache::DecodedImage;
use std::fs;
use std::io::Cursor;

/// Per-decode parameters chosen by the engine
#[derive(Debug, Default)]
pub struct DecodeOptions {
    /// Power-of-two divisor applied to both dimensions
    pub sample_factor: u32,

    /// A previously decoded pixel buffer the decoder may write into.
    ///
    /// Only offered to decoders that report
    /// [`Decoder::supports_buffer_reuse`].
    pub reuse: Option<Vec<u8>>,
}

impl DecodeOptions {
    pub fn new(sample_factor: u32) -> Self {
        Self {
            sample_factor: sample_factor.max(1),
            reuse: None,
        }
    }

    pub fn with_reuse(mut self, buffer: Vec<u8>) -> Self {
        self.reuse = Some(buffer);
        self
    }
}

/// Turns fetched bytes into RGBA pixels.
///
/// Decoders run on the requesting thread, outside every cache and dispatcher
/// lock.
pub trait Decoder: Send + Sync {
    /// Read only the header of `source`
    fn dimensions(&self, source: &ImageSource) -> Result<(u32, u32), DecodeError>;

    /// Fully decode `source`, downsampled by `options.sample_factor`
    fn decode(
        &self,
        source: &ImageSource,
        options: DecodeOptions,
    ) -> Result<DecodedImage, DecodeError>;

    /// Whether [`DecodeOptions::reuse`] is honoured
    fn supports_buffer_reuse(&self) -> bool {
        false
    }
}

impl From<image::ImageError> for DecodeError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Limits(_) => DecodeError::OutOfMemory,
            image::ImageError::Unsupported(e) => DecodeError::Unsupported(e.to_string()),
            image::ImageError::IoError(e) => DecodeError::Io(e.to_string()),
            other => DecodeError::Malformed(other.to_string()),
        }
    }
}

/// Decoder backed by the `image` crate.
///
/// The format is guessed from the payload. `max_alloc` caps the decoded
/// buffer size; exceeding it is reported as [`DecodeError::OutOfMemory`].
#[derive(Debug, Clone, Default)]
pub struct ImageCrateDecoder {
    max_alloc: Option<u64>,
}

impl ImageCrateDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the bytes a single decode may allocate
    pub fn with_max_alloc(mut self, bytes: u64) -> Self {
        self.max_alloc = Some(bytes);
        self
    }

    fn reader(&self, source: &ImageSource) -> Result<ImageReader<Cursor<Vec<u8>>>, DecodeError> {
        let bytes = match source {
            ImageSource::Bytes(bytes) => bytes.clone(),
            ImageSource::File(path) => fs::read(path).map_err(|e| DecodeError::Io(e.to_string()))?,
        };

        let mut reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| DecodeError::Io(e.to_string()))?;
        let mut limits = Limits::default();
        limits.max_alloc = self.max_alloc;
        reader.limits(limits);
        Ok(reader)
    }
}

impl Decoder for ImageCrateDecoder {
    fn dimensions(&self, source: &ImageSource) -> Result<(u32, u32), DecodeError> {
        Ok(self.reader(source)?.into_dimensions()?)
    }

    fn decode(
        &self,
        source: &ImageSource,
        options: DecodeOptions,
    ) -> Result<DecodedImage, DecodeError> {
        let decoder = self.reader(source)?.into_decoder()?;
        let (width, height) = decoder.dimensions();

        let rgba_bytes = u64::from(width) * u64::from(height) * 4;
        if self.max_alloc.is_some_and(|max| rgba_bytes > max) {
            return Err(DecodeError::OutOfMemory);
        }

        let factor = options.sample_factor.max(1);

        // Straight into the recycled buffer when no conversion is needed
        if let Some(mut buffer) = options.reuse {
            if factor == 1 && decoder.color_type() == ColorType::Rgba8 {
                let len = usize::try_from(decoder.total_bytes())
                    .map_err(|_| DecodeError::OutOfMemory)?;
                buffer.clear();
                buffer.resize(len, 0);
                decoder.read_image(&mut buffer)?;
                tracing::trace!(width, height, "decoded into recycled buffer");
                return Ok(DecodedImage::new(width, height, buffer));
            }
        }

        let mut image = DynamicImage::from_decoder(decoder)?;
        if factor > 1 {
            let sampled_width = (width / factor).max(1);
            let sampled_height = (height / factor).max(1);
            image = image.resize_exact(sampled_width, sampled_height, FilterType::Triangle);
        }

        let rgba = image.into_rgba8();
        let (width, height) = rgba.dimensions();
        Ok(DecodedImage::new(width, height, rgba.into_raw()))
    }

    fn supports_buffer_reuse(&self) -> bool {
        true
    }
}
