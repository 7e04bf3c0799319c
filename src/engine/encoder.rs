// src/engine/encoder.rs
//
// Encoder operations for saving: bitmap -> container bytes, then ICC and
// EXIF re-embedded with img-parts.

use crate::engine::common::{run_with_panic_policy, EngineResult};
use crate::error::ViewerError;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use img_parts::jpeg::Jpeg;
use img_parts::png::Png;
use img_parts::webp::WebP;
use img_parts::{Bytes, ImageEXIF, ImageICC};
use std::borrow::Cow;
use std::io::Cursor;

/// Metadata carried over into a saved file.
#[derive(Clone, Debug, Default)]
pub struct EmbeddedMetadata<'a> {
    pub icc: Option<&'a [u8]>,
    /// TIFF-structured EXIF block, without the JPEG `Exif\0\0` prefix.
    pub exif: Option<Cow<'a, [u8]>>,
}

impl EmbeddedMetadata<'_> {
    pub fn is_empty(&self) -> bool {
        self.icc.is_none() && self.exif.is_none()
    }
}

fn format_name(format: ImageFormat) -> &'static str {
    format.extensions_str().first().copied().unwrap_or("image")
}

/// Convert to a pixel layout the target encoder accepts.
fn normalize_for(img: &DynamicImage, format: ImageFormat) -> Cow<'_, DynamicImage> {
    let has_alpha = img.color().has_alpha();
    match format {
        // JPEG has no alpha channel
        ImageFormat::Jpeg => match img {
            DynamicImage::ImageRgb8(_) | DynamicImage::ImageLuma8(_) => Cow::Borrowed(img),
            _ => Cow::Owned(DynamicImage::ImageRgb8(img.to_rgb8())),
        },
        ImageFormat::Png => Cow::Borrowed(img),
        ImageFormat::Gif => Cow::Owned(DynamicImage::ImageRgba8(img.to_rgba8())),
        _ => match (img, has_alpha) {
            (DynamicImage::ImageRgb8(_), _) | (DynamicImage::ImageRgba8(_), _) => {
                Cow::Borrowed(img)
            }
            (_, true) => Cow::Owned(DynamicImage::ImageRgba8(img.to_rgba8())),
            (_, false) => Cow::Owned(DynamicImage::ImageRgb8(img.to_rgb8())),
        },
    }
}

/// Encode `img` as `format`. `quality` only affects JPEG.
pub fn encode(img: &DynamicImage, format: ImageFormat, quality: u8) -> EngineResult<Vec<u8>> {
    let name = format_name(format);
    if !format.writing_enabled() {
        return Err(ViewerError::unsupported_format(name));
    }
    if img.width() == 0 || img.height() == 0 {
        return Err(ViewerError::encode_failed(
            name,
            "width or height is zero",
        ));
    }
    run_with_panic_policy("encode:image", || {
        let img = normalize_for(img, format);
        let estimated_size = (img.width() as usize * img.height() as usize / 4).max(4096);
        let mut buf = Vec::with_capacity(estimated_size);
        match format {
            ImageFormat::Jpeg => {
                let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
                img.write_with_encoder(encoder)
                    .map_err(|e| ViewerError::encode_failed(name, e.to_string()))?;
            }
            _ => {
                img.write_to(&mut Cursor::new(&mut buf), format)
                    .map_err(|e| ViewerError::encode_failed(name, e.to_string()))?;
            }
        }
        Ok(buf)
    })
}

/// Embed ICC and EXIF into encoded bytes using img-parts.
/// Formats img-parts cannot edit are returned unchanged.
pub fn embed_metadata(
    data: Vec<u8>,
    format: ImageFormat,
    metadata: &EmbeddedMetadata<'_>,
) -> EngineResult<Vec<u8>> {
    if metadata.is_empty() {
        return Ok(data);
    }
    let icc = metadata.icc.map(|icc| Bytes::from(icc.to_vec()));
    let exif = metadata.exif.as_ref().map(|exif| Bytes::from(exif.to_vec()));

    match format {
        ImageFormat::Jpeg => run_with_panic_policy("encode:jpeg:embed", || {
            let mut jpeg = Jpeg::from_bytes(Bytes::from(data)).map_err(|e| {
                ViewerError::decode_failed(format!("failed to parse JPEG for metadata: {e}"))
            })?;
            if icc.is_some() {
                jpeg.set_icc_profile(icc);
            }
            if exif.is_some() {
                jpeg.set_exif(exif);
            }
            let mut output = Vec::new();
            jpeg.encoder().write_to(&mut output).map_err(|e| {
                ViewerError::encode_failed("jpeg", format!("failed to write JPEG metadata: {e}"))
            })?;
            Ok(output)
        }),
        ImageFormat::Png => run_with_panic_policy("encode:png:embed", || {
            let mut png = Png::from_bytes(Bytes::from(data)).map_err(|e| {
                ViewerError::decode_failed(format!("failed to parse PNG for metadata: {e}"))
            })?;
            if icc.is_some() {
                png.set_icc_profile(icc);
            }
            if exif.is_some() {
                png.set_exif(exif);
            }
            let mut output = Vec::new();
            png.encoder().write_to(&mut output).map_err(|e| {
                ViewerError::encode_failed("png", format!("failed to write PNG metadata: {e}"))
            })?;
            Ok(output)
        }),
        ImageFormat::WebP => run_with_panic_policy("encode:webp:embed", || {
            let mut webp = WebP::from_bytes(Bytes::from(data)).map_err(|e| {
                ViewerError::decode_failed(format!("failed to parse WebP for metadata: {e}"))
            })?;
            if icc.is_some() {
                webp.set_icc_profile(icc);
            }
            if exif.is_some() {
                webp.set_exif(exif);
            }
            let mut output = Vec::new();
            webp.encoder().write_to(&mut output).map_err(|e| {
                ViewerError::encode_failed("webp", format!("failed to write WebP metadata: {e}"))
            })?;
            Ok(output)
        }),
        other => {
            tracing::debug!(format = format_name(other), "metadata not embedded for this format");
            Ok(data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::metadata::{tiff_with_orientation, MetadataReader};
    use image::{GenericImageView, Rgba, RgbaImage};

    fn create_test_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x * 10) as u8, (y * 10) as u8, 128, 200])
        }))
    }

    fn create_minimal_icc() -> Vec<u8> {
        let mut data = vec![0u8; 128];
        data[3] = 0x80;
        data[4..8].copy_from_slice(b"lcms");
        data[8] = 4;
        data[12..16].copy_from_slice(b"mntr");
        data[16..20].copy_from_slice(b"RGB ");
        data[20..24].copy_from_slice(b"XYZ ");
        data
    }

    fn read_metadata(data: &[u8]) -> crate::engine::metadata::ImageMetadata {
        let mut reader = MetadataReader::for_header(data).unwrap();
        reader.consume(data);
        reader.finish();
        reader.into_metadata()
    }

    #[test]
    fn test_encode_jpeg_drops_alpha() {
        let img = create_test_image(10, 8);
        let data = encode(&img, ImageFormat::Jpeg, 90).unwrap();
        assert_eq!(&data[0..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&data).unwrap();
        assert_eq!(decoded.dimensions(), (10, 8));
    }

    #[test]
    fn test_encode_jpeg_quality_affects_size() {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_fn(64, 64, |x, y| {
            image::Rgb([(x * 4) as u8, (y * 4) as u8, ((x ^ y) * 4) as u8])
        }));
        let low = encode(&img, ImageFormat::Jpeg, 20).unwrap();
        let high = encode(&img, ImageFormat::Jpeg, 95).unwrap();
        assert!(low.len() < high.len());
    }

    #[test]
    fn test_encode_png_and_webp_preserve_pixels() {
        let img = create_test_image(5, 4);
        for format in [ImageFormat::Png, ImageFormat::WebP] {
            let data = encode(&img, format, 90).unwrap();
            let decoded = image::load_from_memory(&data).unwrap();
            assert_eq!(decoded.to_rgba8(), img.to_rgba8(), "{format:?}");
        }
    }

    #[test]
    fn test_encode_rejects_read_only_format() {
        let img = create_test_image(2, 2);
        let err = encode(&img, ImageFormat::Avif, 90).unwrap_err();
        assert!(matches!(err, ViewerError::UnsupportedFormat { .. }));
    }

    #[test]
    fn test_embed_round_trips_through_metadata_reader() {
        let icc = create_minimal_icc();
        let exif = tiff_with_orientation(1, true);
        let img = create_test_image(6, 6);
        for format in [ImageFormat::Jpeg, ImageFormat::Png, ImageFormat::WebP] {
            let data = encode(&img, format, 85).unwrap();
            let embedded = embed_metadata(
                data,
                format,
                &EmbeddedMetadata {
                    icc: Some(&icc),
                    exif: Some(Cow::Borrowed(&exif)),
                },
            )
            .unwrap();
            let meta = read_metadata(&embedded);
            assert_eq!(meta.icc.as_deref(), Some(icc.as_slice()), "{format:?}");
            assert_eq!(meta.raw_exif.as_deref(), Some(exif.as_slice()), "{format:?}");
            assert!(image::load_from_memory(&embedded).is_ok());
        }
    }

    #[test]
    fn test_embed_is_noop_for_bmp() {
        let img = create_test_image(3, 3);
        let data = encode(&img, ImageFormat::Bmp, 90).unwrap();
        let icc = create_minimal_icc();
        let out = embed_metadata(
            data.clone(),
            ImageFormat::Bmp,
            &EmbeddedMetadata {
                icc: Some(&icc),
                exif: None,
            },
        )
        .unwrap();
        assert_eq!(out, data);
    }
}
