// src/engine/decoder.rs
//
// Pixel decoder collaborator.
//
// The loader pushes the file through a `PixelDecoder` chunk by chunk. The
// decoder reports the image size as early as it can and hands back the
// bitmap on close. `DecoderFactory` is the seam tests use to plug in slow,
// partial or failing codecs.

use crate::engine::common::{run_with_panic_policy, EngineResult};
use crate::engine::config::EngineConfig;
use crate::engine::{MAX_DIMENSION, MAX_PIXELS};
use crate::error::ViewerError;
use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, DynamicImage, Frame, ImageFormat, ImageReader};
use std::io::Cursor;

/// Stop re-probing the header once this much data is buffered.
const HEADER_PROBE_LIMIT: usize = 4 * 1024 * 1024;

/// Result of closing a decoder.
///
/// `image` and `error` may both be set: the codec failed late but still
/// produced a usable bitmap.
#[derive(Default)]
pub struct DecodeOutcome {
    pub image: Option<DynamicImage>,
    /// Animation frames, first frame first.
    pub frames: Option<Vec<Frame>>,
    pub error: Option<ViewerError>,
}

impl DecodeOutcome {
    pub fn failed(error: ViewerError) -> Self {
        Self {
            image: None,
            frames: None,
            error: Some(error),
        }
    }
}

pub trait PixelDecoder: Send {
    /// Feed the next chunk. An error is terminal: no further writes follow.
    fn write(&mut self, chunk: &[u8]) -> EngineResult<()>;

    /// Width and height, once the header has been seen.
    fn size(&self) -> Option<(u32, u32)>;

    /// End of stream. Consumes the decoder.
    fn close(self: Box<Self>) -> DecodeOutcome;
}

pub trait DecoderFactory: Send + Sync {
    /// Create a decoder for a stream of the given format, if known.
    fn create(&self, format: Option<ImageFormat>) -> Box<dyn PixelDecoder>;
}

/// Decompression-bomb limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodeLimits {
    pub max_dimension: u32,
    pub max_pixels: u64,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_dimension: MAX_DIMENSION,
            max_pixels: MAX_PIXELS,
        }
    }
}

impl DecodeLimits {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_dimension: config.max_dimension,
            max_pixels: config.max_pixels,
        }
    }
}

/// Check if image dimensions are within safe limits.
/// Returns an error if the image is too large (potential decompression bomb).
pub fn check_dimensions(width: u32, height: u32, limits: &DecodeLimits) -> EngineResult<()> {
    if width > limits.max_dimension || height > limits.max_dimension {
        return Err(ViewerError::dimension_exceeds_limit(
            width.max(height),
            limits.max_dimension,
        ));
    }
    let pixels = width as u64 * height as u64;
    if pixels > limits.max_pixels {
        return Err(ViewerError::pixel_count_exceeds_limit(
            pixels,
            limits.max_pixels,
        ));
    }
    Ok(())
}

/// The `image` crate behind the `DecoderFactory` seam.
#[derive(Clone, Debug, Default)]
pub struct StandardDecoders {
    limits: DecodeLimits,
}

impl StandardDecoders {
    pub fn new(limits: DecodeLimits) -> Self {
        Self { limits }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(DecodeLimits::from_config(config))
    }
}

impl DecoderFactory for StandardDecoders {
    fn create(&self, format: Option<ImageFormat>) -> Box<dyn PixelDecoder> {
        Box::new(BufferedDecoder {
            format,
            limits: self.limits,
            data: Vec::new(),
            size: None,
            rejected: None,
        })
    }
}

/// Buffers the stream; decodes everything on close.
struct BufferedDecoder {
    format: Option<ImageFormat>,
    limits: DecodeLimits,
    data: Vec<u8>,
    size: Option<(u32, u32)>,
    rejected: Option<ViewerError>,
}

impl BufferedDecoder {
    fn reader(&self) -> std::io::Result<ImageReader<Cursor<&[u8]>>> {
        let cursor = Cursor::new(self.data.as_slice());
        match self.format {
            Some(format) => Ok(ImageReader::with_format(cursor, format)),
            None => ImageReader::new(cursor).with_guessed_format(),
        }
    }

    fn probe_header(&mut self) -> EngineResult<()> {
        if self.size.is_some() || self.data.len() > HEADER_PROBE_LIMIT {
            return Ok(());
        }
        let dims = self.reader().ok().and_then(|r| r.into_dimensions().ok());
        if let Some((width, height)) = dims {
            check_dimensions(width, height, &self.limits)?;
            tracing::debug!(width, height, "image header parsed");
            self.size = Some((width, height));
        }
        Ok(())
    }

    fn decode(&self) -> EngineResult<(DynamicImage, Option<Vec<Frame>>)> {
        run_with_panic_policy("decode:image", || {
            let reader = self
                .reader()
                .map_err(|e| ViewerError::decode_failed(format!("failed to read header: {e}")))?;
            let format = reader.format();
            let (width, height) = reader
                .into_dimensions()
                .map_err(|e| ViewerError::decode_failed(format!("failed to read dimensions: {e}")))?;
            check_dimensions(width, height, &self.limits)?;

            if format == Some(ImageFormat::Gif) {
                let decoder = GifDecoder::new(Cursor::new(self.data.as_slice()))
                    .map_err(|e| ViewerError::decode_failed(format!("gif: {e}")))?;
                let frames = decoder
                    .into_frames()
                    .collect_frames()
                    .map_err(|e| ViewerError::decode_failed(format!("gif frames: {e}")))?;
                let first = frames
                    .first()
                    .map(|f| DynamicImage::ImageRgba8(f.buffer().clone()))
                    .ok_or_else(|| ViewerError::decode_failed("gif: no frames"))?;
                let frames = (frames.len() > 1).then_some(frames);
                return Ok((first, frames));
            }

            let image = self
                .reader()
                .map_err(|e| ViewerError::decode_failed(format!("failed to read header: {e}")))?
                .decode()
                .map_err(|e| ViewerError::decode_failed(format!("decode failed: {e}")))?;
            Ok((image, None))
        })
    }
}

impl PixelDecoder for BufferedDecoder {
    fn write(&mut self, chunk: &[u8]) -> EngineResult<()> {
        if let Some(err) = &self.rejected {
            return Err(err.clone());
        }
        self.data.extend_from_slice(chunk);
        if let Err(err) = self.probe_header() {
            self.rejected = Some(err.clone());
            return Err(err);
        }
        Ok(())
    }

    fn size(&self) -> Option<(u32, u32)> {
        self.size
    }

    fn close(self: Box<Self>) -> DecodeOutcome {
        if let Some(err) = self.rejected {
            return DecodeOutcome::failed(err);
        }
        if self.data.is_empty() {
            return DecodeOutcome::failed(ViewerError::decode_failed("empty file"));
        }
        match self.decode() {
            Ok((image, frames)) => DecodeOutcome {
                image: Some(image),
                frames,
                error: None,
            },
            Err(err) => DecodeOutcome::failed(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgb, RgbImage, RgbaImage};

    fn encode_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |_, _| Rgb([0, 0, 0]));
        let mut buffer = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .unwrap();
        buffer
    }

    fn encode_gif(frames: usize) -> Vec<u8> {
        use image::codecs::gif::GifEncoder;
        let mut buffer = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut buffer);
            for i in 0..frames {
                let frame = Frame::new(RgbaImage::from_pixel(4, 3, image::Rgba([i as u8 * 50, 0, 0, 255])));
                encoder.encode_frame(frame).unwrap();
            }
        }
        buffer
    }

    fn decode_in_chunks(data: &[u8], chunk: usize) -> (Option<(u32, u32)>, DecodeOutcome) {
        let mut decoder = StandardDecoders::default().create(None);
        let mut first_size = None;
        for piece in data.chunks(chunk) {
            decoder.write(piece).unwrap();
            if first_size.is_none() {
                first_size = decoder.size();
            }
        }
        (first_size, decoder.close())
    }

    #[test]
    fn test_size_is_known_before_close() {
        let png = encode_png(64, 32);
        let mut decoder = StandardDecoders::default().create(Some(ImageFormat::Png));
        decoder.write(&png[..64]).unwrap();
        assert_eq!(decoder.size(), Some((64, 32)));
        decoder.write(&png[64..]).unwrap();
        let outcome = decoder.close();
        assert!(outcome.error.is_none());
        assert_eq!(outcome.image.unwrap().dimensions(), (64, 32));
    }

    #[test]
    fn test_rejects_oversized_header() {
        let limits = DecodeLimits {
            max_dimension: 16,
            max_pixels: MAX_PIXELS,
        };
        let png = encode_png(17, 1);
        let mut decoder = StandardDecoders::new(limits).create(None);
        let err = decoder.write(&png).unwrap_err();
        assert!(matches!(err, ViewerError::DimensionExceedsLimit { .. }));
        let outcome = decoder.close();
        assert!(outcome.image.is_none());
        assert!(matches!(
            outcome.error,
            Some(ViewerError::DimensionExceedsLimit { .. })
        ));
    }

    #[test]
    fn test_pixel_limit() {
        let limits = DecodeLimits {
            max_dimension: MAX_DIMENSION,
            max_pixels: 100,
        };
        assert!(check_dimensions(10, 10, &limits).is_ok());
        assert!(matches!(
            check_dimensions(11, 10, &limits),
            Err(ViewerError::PixelCountExceedsLimit { .. })
        ));
    }

    #[test]
    fn test_garbage_fails_on_close() {
        let (size, outcome) = decode_in_chunks(b"definitely not an image at all", 8);
        assert_eq!(size, None);
        assert!(outcome.image.is_none());
        assert!(outcome.error.is_some());
    }

    #[test]
    fn test_truncated_png_fails() {
        let png = encode_png(32, 32);
        let (size, outcome) = decode_in_chunks(&png[..png.len() / 2], 16);
        assert_eq!(size, Some((32, 32)));
        assert!(outcome.image.is_none());
        assert!(outcome.error.is_some());
    }

    #[test]
    fn test_gif_frames_are_collected() {
        let gif = encode_gif(3);
        let (size, outcome) = decode_in_chunks(&gif, 32);
        assert_eq!(size, Some((4, 3)));
        assert_eq!(outcome.image.unwrap().dimensions(), (4, 3));
        assert_eq!(outcome.frames.map(|f| f.len()), Some(3));
    }

    #[test]
    fn test_single_frame_gif_is_not_an_animation() {
        let gif = encode_gif(1);
        let (_, outcome) = decode_in_chunks(&gif, 1024);
        assert!(outcome.image.is_some());
        assert!(outcome.frames.is_none());
    }
}
