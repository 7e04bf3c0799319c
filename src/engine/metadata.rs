// src/engine/metadata.rs
//
// Incremental metadata reader.
//
// The loader feeds every chunk it reads into a `MetadataReader` picked by
// magic bytes on the first chunk. JPEG metadata lives in front of the scan
// data, so the reader finishes early and the entity can publish EXIF/XMP/ICC
// long before the decoder is done. PNG finishes at the first IDAT once EXIF
// was seen, at IEND otherwise. TIFF and WebP only finish at end of stream.

use std::collections::BTreeMap;
use std::io::Read;

use flate2::read::ZlibDecoder;

use super::io::validate_icc_profile;

/// Upper bound on bytes buffered while looking for metadata.
const MAX_METADATA_BYTES: usize = 64 * 1024 * 1024;
/// Upper bound on a single inflated PNG metadata payload.
const MAX_INFLATED_BYTES: u64 = 16 * 1024 * 1024;

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";
const JPEG_EXIF_PREFIX: &[u8] = b"Exif\0\0";
const JPEG_XMP_PREFIX: &[u8] = b"http://ns.adobe.com/xap/1.0/\0";
const JPEG_ICC_PREFIX: &[u8] = b"ICC_PROFILE\0";
const PNG_XMP_KEYWORD: &[u8] = b"XML:com.adobe.xmp";

const TAG_ORIENTATION: u16 = 0x0112;
const TIFF_TYPE_SHORT: u16 = 3;

/// Metadata payloads pulled out of an image container.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageMetadata {
    /// TIFF-structured EXIF block (starts with `II*\0` or `MM\0*`).
    pub raw_exif: Option<Vec<u8>>,
    /// XMP packet as stored in the file.
    pub xmp: Option<Vec<u8>>,
    /// Validated ICC color profile.
    pub icc: Option<Vec<u8>>,
}

impl ImageMetadata {
    pub fn is_empty(&self) -> bool {
        self.raw_exif.is_none() && self.xmp.is_none() && self.icc.is_none()
    }

    /// Parse the raw EXIF block.
    #[cfg(feature = "exif")]
    pub fn exif(&self) -> Option<exif::Exif> {
        let raw = self.raw_exif.as_ref()?;
        exif::Reader::new().read_raw(raw.clone()).ok()
    }

    /// EXIF Orientation (1-8). Returns None if missing or invalid.
    pub fn orientation(&self) -> Option<u16> {
        #[cfg(feature = "exif")]
        if let Some(exif) = self.exif() {
            let value = exif
                .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
                .and_then(|field| field.value.get_uint(0))
                .map(|v| v as u16);
            if let Some(orientation) = value.filter(|v| (1..=8).contains(v)) {
                return Some(orientation);
            }
        }
        self.raw_exif.as_deref().and_then(raw_exif_orientation)
    }
}

/// Container formats the reader understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerKind {
    Jpeg,
    Png,
    Tiff,
    WebP,
}

impl ContainerKind {
    /// Recognize a container from the first bytes of a stream.
    pub fn sniff(header: &[u8]) -> Option<ContainerKind> {
        if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ContainerKind::Jpeg)
        } else if header.starts_with(PNG_SIGNATURE) {
            Some(ContainerKind::Png)
        } else if header.starts_with(b"II*\0") || header.starts_with(b"MM\0*") {
            Some(ContainerKind::Tiff)
        } else if header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"WEBP" {
            Some(ContainerKind::WebP)
        } else {
            None
        }
    }
}

pub struct MetadataReader {
    kind: ContainerKind,
    buf: Vec<u8>,
    pos: usize,
    /// Bytes of pixel data still to be discarded.
    skip: usize,
    finished: bool,
    metadata: ImageMetadata,
    icc_chunks: BTreeMap<u8, Vec<u8>>,
}

impl MetadataReader {
    /// Create a reader for the stream starting with `header`, or None if the
    /// container is not one we can extract metadata from.
    pub fn for_header(header: &[u8]) -> Option<Self> {
        ContainerKind::sniff(header).map(Self::new)
    }

    pub fn new(kind: ContainerKind) -> Self {
        let pos = match kind {
            ContainerKind::Jpeg => 2,
            ContainerKind::Png => PNG_SIGNATURE.len(),
            ContainerKind::WebP => 12,
            ContainerKind::Tiff => 0,
        };
        Self {
            kind,
            buf: Vec::new(),
            pos,
            skip: 0,
            finished: false,
            metadata: ImageMetadata::default(),
            icc_chunks: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> ContainerKind {
        self.kind
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn metadata(&self) -> &ImageMetadata {
        &self.metadata
    }

    pub fn into_metadata(self) -> ImageMetadata {
        self.metadata
    }

    /// Feed the next chunk of the stream.
    pub fn consume(&mut self, chunk: &[u8]) {
        if self.finished {
            return;
        }
        self.buf.extend_from_slice(chunk);
        match self.kind {
            ContainerKind::Jpeg => self.parse_jpeg(),
            ContainerKind::Png => self.parse_png(),
            ContainerKind::WebP => self.parse_webp(),
            ContainerKind::Tiff => {}
        }
        if !self.finished && self.buf.len() > MAX_METADATA_BYTES {
            tracing::warn!(kind = ?self.kind, "metadata section too large, giving up");
            self.finish();
        }
    }

    /// Signal end of stream.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        if self.kind == ContainerKind::Tiff && !self.buf.is_empty() {
            self.metadata.raw_exif = Some(std::mem::take(&mut self.buf));
        }
        self.complete();
    }

    fn complete(&mut self) {
        if !self.icc_chunks.is_empty() {
            let icc: Vec<u8> = std::mem::take(&mut self.icc_chunks)
                .into_values()
                .flatten()
                .collect();
            self.set_icc(icc);
        }
        self.finished = true;
        self.buf = Vec::new();
    }

    fn set_icc(&mut self, icc: Vec<u8>) {
        if validate_icc_profile(&icc) {
            self.metadata.icc = Some(icc);
        } else {
            tracing::debug!(len = icc.len(), "ignoring invalid ICC profile");
        }
    }

    fn parse_jpeg(&mut self) {
        loop {
            let pos = self.pos;
            let Some(&[lead, marker]) = self.buf.get(pos..pos + 2) else {
                return;
            };
            if lead != 0xFF {
                tracing::debug!(offset = pos, "JPEG marker expected, stopping metadata scan");
                self.complete();
                return;
            }
            match marker {
                // fill byte
                0xFF => {
                    self.pos += 1;
                    continue;
                }
                // standalone markers carry no length
                0x01 | 0xD0..=0xD7 => {
                    self.pos += 2;
                    continue;
                }
                // start of scan or end of image: no more header segments
                0xDA | 0xD9 => {
                    self.complete();
                    return;
                }
                _ => {}
            }
            let Some(&[hi, lo]) = self.buf.get(pos + 2..pos + 4) else {
                return;
            };
            let len = u16::from_be_bytes([hi, lo]) as usize;
            if len < 2 {
                self.complete();
                return;
            }
            let end = pos + 2 + len;
            if end > self.buf.len() {
                return;
            }
            let segment = self.buf[pos + 4..end].to_vec();
            self.pos = end;
            match marker {
                0xE1 => {
                    if let Some(exif) = segment.strip_prefix(JPEG_EXIF_PREFIX) {
                        if self.metadata.raw_exif.is_none() {
                            self.metadata.raw_exif = Some(exif.to_vec());
                        }
                    } else if let Some(xmp) = segment.strip_prefix(JPEG_XMP_PREFIX) {
                        self.metadata.xmp = Some(xmp.to_vec());
                    }
                }
                0xE2 => {
                    if let Some(rest) = segment.strip_prefix(JPEG_ICC_PREFIX) {
                        if let [seq, _count, data @ ..] = rest {
                            self.icc_chunks.insert(*seq, data.to_vec());
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn parse_png(&mut self) {
        loop {
            if self.skip > 0 {
                let n = self.skip.min(self.buf.len());
                self.buf.drain(..n);
                self.skip -= n;
                if self.skip > 0 {
                    return;
                }
            }
            let pos = self.pos;
            let Some(header) = self.buf.get(pos..pos + 8) else {
                return;
            };
            let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let chunk_type = [header[4], header[5], header[6], header[7]];
            match &chunk_type {
                b"IEND" => {
                    self.complete();
                    return;
                }
                // eXIf may also trail the image data
                b"IDAT" if self.metadata.raw_exif.is_some() => {
                    self.complete();
                    return;
                }
                b"IDAT" => {
                    self.buf.drain(..pos + 8);
                    self.pos = 0;
                    self.skip = len + 4;
                    continue;
                }
                _ => {}
            }
            if len > MAX_METADATA_BYTES {
                self.complete();
                return;
            }
            // length + type + data + crc
            let end = pos + 12 + len;
            if end > self.buf.len() {
                return;
            }
            let data = self.buf[pos + 8..pos + 8 + len].to_vec();
            self.pos = end;
            match &chunk_type {
                b"eXIf" => self.metadata.raw_exif = Some(data),
                b"iCCP" => {
                    if let Some(icc) = parse_png_iccp(&data) {
                        self.set_icc(icc);
                    }
                }
                b"iTXt" => {
                    if let Some(xmp) = parse_png_xmp(&data) {
                        self.metadata.xmp = Some(xmp);
                    }
                }
                _ => {}
            }
        }
    }

    fn parse_webp(&mut self) {
        loop {
            let pos = self.pos;
            let Some(header) = self.buf.get(pos..pos + 8) else {
                return;
            };
            let fourcc = [header[0], header[1], header[2], header[3]];
            let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
            let padded = len + (len & 1);
            let data_end = pos + 8 + len;
            if data_end > self.buf.len() {
                return;
            }
            match &fourcc {
                b"EXIF" => {
                    let data = &self.buf[pos + 8..data_end];
                    let data = data.strip_prefix(JPEG_EXIF_PREFIX).unwrap_or(data);
                    self.metadata.raw_exif = Some(data.to_vec());
                }
                b"XMP " => self.metadata.xmp = Some(self.buf[pos + 8..data_end].to_vec()),
                b"ICCP" => {
                    let icc = self.buf[pos + 8..data_end].to_vec();
                    self.set_icc(icc);
                }
                _ => {}
            }
            self.pos = pos + 8 + padded;
        }
    }
}

fn split_nul(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let at = data.iter().position(|&b| b == 0)?;
    Some((&data[..at], &data[at + 1..]))
}

fn inflate(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .take(MAX_INFLATED_BYTES)
        .read_to_end(&mut out)
        .ok()?;
    Some(out)
}

fn parse_png_iccp(data: &[u8]) -> Option<Vec<u8>> {
    let (_name, rest) = split_nul(data)?;
    let (&method, compressed) = rest.split_first()?;
    if method != 0 {
        return None;
    }
    inflate(compressed)
}

fn parse_png_xmp(data: &[u8]) -> Option<Vec<u8>> {
    let (keyword, rest) = split_nul(data)?;
    if keyword != PNG_XMP_KEYWORD {
        return None;
    }
    let [compressed, _method, rest @ ..] = rest else {
        return None;
    };
    let (_language, rest) = split_nul(rest)?;
    let (_translated, text) = split_nul(rest)?;
    if *compressed == 1 {
        inflate(text)
    } else {
        Some(text.to_vec())
    }
}

// =============================================================================
// RAW TIFF HELPERS
// =============================================================================

fn tiff_little_endian(buf: &[u8]) -> Option<bool> {
    match buf.get(0..4)? {
        [b'I', b'I', 0x2A, 0x00] => Some(true),
        [b'M', b'M', 0x00, 0x2A] => Some(false),
        _ => None,
    }
}

fn read_u16(buf: &[u8], offset: usize, le: bool) -> Option<u16> {
    let b = buf.get(offset..offset.checked_add(2)?)?;
    Some(if le {
        u16::from_le_bytes([b[0], b[1]])
    } else {
        u16::from_be_bytes([b[0], b[1]])
    })
}

fn read_u32(buf: &[u8], offset: usize, le: bool) -> Option<u32> {
    let b = buf.get(offset..offset.checked_add(4)?)?;
    Some(if le {
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    } else {
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    })
}

/// Offset of the Orientation value inside IFD0, plus the byte order.
fn orientation_slot(buf: &[u8]) -> Option<(usize, bool)> {
    let le = tiff_little_endian(buf)?;
    let ifd = read_u32(buf, 4, le)? as usize;
    let count = read_u16(buf, ifd, le)? as usize;
    for i in 0..count {
        let entry = ifd + 2 + i * 12;
        let tag = read_u16(buf, entry, le)?;
        if tag == TAG_ORIENTATION {
            let kind = read_u16(buf, entry + 2, le)?;
            return (kind == TIFF_TYPE_SHORT).then_some((entry + 8, le));
        }
    }
    None
}

/// Read the Orientation tag from a raw TIFF-structured EXIF block.
pub fn raw_exif_orientation(buf: &[u8]) -> Option<u16> {
    let (offset, le) = orientation_slot(buf)?;
    read_u16(buf, offset, le).filter(|v| (1..=8).contains(v))
}

/// Rewrite the Orientation tag to 1 (upright) in place.
/// Returns false when the block has no Orientation tag.
pub fn reset_raw_exif_orientation(buf: &mut [u8]) -> bool {
    let Some((offset, le)) = orientation_slot(buf) else {
        return false;
    };
    let bytes = if le {
        1u16.to_le_bytes()
    } else {
        1u16.to_be_bytes()
    };
    match buf.get_mut(offset..offset + 2) {
        Some(slot) => {
            slot.copy_from_slice(&bytes);
            true
        }
        None => false,
    }
}

/// Minimal big/little-endian TIFF block holding only an Orientation tag.
#[cfg(test)]
pub(crate) fn tiff_with_orientation(orientation: u16, little_endian: bool) -> Vec<u8> {
    let mut out = Vec::new();
    let (u16b, u32b): (fn(u16) -> [u8; 2], fn(u32) -> [u8; 4]) = if little_endian {
        out.extend_from_slice(b"II*\0");
        (u16::to_le_bytes, u32::to_le_bytes)
    } else {
        out.extend_from_slice(b"MM\0*");
        (u16::to_be_bytes, u32::to_be_bytes)
    };
    out.extend_from_slice(&u32b(8));
    out.extend_from_slice(&u16b(1));
    out.extend_from_slice(&u16b(TAG_ORIENTATION));
    out.extend_from_slice(&u16b(TIFF_TYPE_SHORT));
    out.extend_from_slice(&u32b(1));
    out.extend_from_slice(&u16b(orientation));
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&u32b(0));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use img_parts::{Bytes, ImageEXIF, ImageICC};
    use std::io::Cursor;

    fn create_minimal_icc() -> Vec<u8> {
        let mut data = vec![0u8; 128];
        data[3] = 0x80;
        data[4..8].copy_from_slice(b"lcms");
        data[8] = 2;
        data[12..16].copy_from_slice(b"mntr");
        data[16..20].copy_from_slice(b"RGB ");
        data[20..24].copy_from_slice(b"XYZ ");
        data
    }

    fn encode(format: ImageFormat) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 6, Rgb([10, 20, 30])));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), format).unwrap();
        buf
    }

    fn feed(reader: &mut MetadataReader, data: &[u8], chunk: usize) -> usize {
        let mut fed = 0;
        for piece in data.chunks(chunk) {
            if reader.is_finished() {
                break;
            }
            reader.consume(piece);
            fed += piece.len();
        }
        fed
    }

    #[test]
    fn test_sniff_containers() {
        assert_eq!(
            ContainerKind::sniff(&encode(ImageFormat::Jpeg)),
            Some(ContainerKind::Jpeg)
        );
        assert_eq!(
            ContainerKind::sniff(&encode(ImageFormat::Png)),
            Some(ContainerKind::Png)
        );
        assert_eq!(
            ContainerKind::sniff(&encode(ImageFormat::WebP)),
            Some(ContainerKind::WebP)
        );
        assert_eq!(
            ContainerKind::sniff(&tiff_with_orientation(1, false)),
            Some(ContainerKind::Tiff)
        );
        assert_eq!(ContainerKind::sniff(&encode(ImageFormat::Bmp)), None);
        assert_eq!(ContainerKind::sniff(b"not an image"), None);
    }

    #[test]
    fn test_jpeg_exif_is_found_before_end_of_stream() {
        let tiff = tiff_with_orientation(6, true);
        let mut jpeg = img_parts::jpeg::Jpeg::from_bytes(Bytes::from(encode(ImageFormat::Jpeg)))
            .unwrap();
        jpeg.set_exif(Some(Bytes::from(tiff.clone())));
        let mut data = Vec::new();
        jpeg.encoder().write_to(&mut data).unwrap();

        let mut reader = MetadataReader::for_header(&data).unwrap();
        let fed = feed(&mut reader, &data, 7);
        assert!(reader.is_finished());
        assert!(fed < data.len());
        assert_eq!(reader.metadata().raw_exif.as_deref(), Some(tiff.as_slice()));
        assert_eq!(reader.metadata().orientation(), Some(6));
    }

    #[test]
    fn test_jpeg_icc_chunks_are_assembled() {
        let icc = create_minimal_icc();
        let mut jpeg = img_parts::jpeg::Jpeg::from_bytes(Bytes::from(encode(ImageFormat::Jpeg)))
            .unwrap();
        jpeg.set_icc_profile(Some(Bytes::from(icc.clone())));
        let mut data = Vec::new();
        jpeg.encoder().write_to(&mut data).unwrap();

        let mut reader = MetadataReader::for_header(&data).unwrap();
        feed(&mut reader, &data, 64);
        assert!(reader.is_finished());
        assert_eq!(reader.metadata().icc.as_deref(), Some(icc.as_slice()));
    }

    #[test]
    fn test_png_iccp_is_inflated() {
        let icc = create_minimal_icc();
        let mut png =
            img_parts::png::Png::from_bytes(Bytes::from(encode(ImageFormat::Png))).unwrap();
        png.set_icc_profile(Some(Bytes::from(icc.clone())));
        let mut data = Vec::new();
        png.encoder().write_to(&mut data).unwrap();

        let mut reader = MetadataReader::for_header(&data).unwrap();
        feed(&mut reader, &data, 16);
        assert!(reader.is_finished());
        assert_eq!(reader.metadata().icc, Some(icc));
    }

    #[test]
    fn test_png_xmp_itxt() {
        let png = encode(ImageFormat::Png);
        // signature + IHDR (8 + 13 + 4)
        let split = 8 + 25;
        let xmp = b"<x:xmpmeta/>";
        let mut body = Vec::new();
        body.extend_from_slice(PNG_XMP_KEYWORD);
        body.extend_from_slice(&[0, 0, 0, 0, 0]);
        body.extend_from_slice(xmp);
        let mut data = png[..split].to_vec();
        data.extend_from_slice(&(body.len() as u32).to_be_bytes());
        data.extend_from_slice(b"iTXt");
        data.extend_from_slice(&body);
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(&png[split..]);

        let mut reader = MetadataReader::for_header(&data).unwrap();
        feed(&mut reader, &data, 5);
        assert!(reader.is_finished());
        assert_eq!(reader.metadata().xmp.as_deref(), Some(&xmp[..]));
    }

    #[test]
    fn test_png_exif_before_idat_finishes_early() {
        let png = encode(ImageFormat::Png);
        let split = 8 + 25;
        let tiff = tiff_with_orientation(8, true);
        let mut data = png[..split].to_vec();
        data.extend_from_slice(&(tiff.len() as u32).to_be_bytes());
        data.extend_from_slice(b"eXIf");
        data.extend_from_slice(&tiff);
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(&png[split..]);

        let mut reader = MetadataReader::for_header(&data).unwrap();
        let fed = feed(&mut reader, &data, 4);
        assert!(reader.is_finished());
        assert!(fed < data.len());
        assert_eq!(reader.metadata().orientation(), Some(8));
    }

    #[test]
    fn test_png_trailing_exif_is_found() {
        let tiff = tiff_with_orientation(6, false);
        let mut png =
            img_parts::png::Png::from_bytes(Bytes::from(encode(ImageFormat::Png))).unwrap();
        png.set_exif(Some(Bytes::from(tiff.clone())));
        let mut data = Vec::new();
        png.encoder().write_to(&mut data).unwrap();

        let mut reader = MetadataReader::for_header(&data).unwrap();
        feed(&mut reader, &data, 9);
        assert!(reader.is_finished());
        assert_eq!(reader.metadata().raw_exif, Some(tiff));
    }

    #[test]
    fn test_webp_exif_needs_end_of_stream() {
        let tiff = tiff_with_orientation(3, false);
        let mut webp =
            img_parts::webp::WebP::from_bytes(Bytes::from(encode(ImageFormat::WebP))).unwrap();
        webp.set_exif(Some(Bytes::from(tiff.clone())));
        let mut data = Vec::new();
        webp.encoder().write_to(&mut data).unwrap();

        let mut reader = MetadataReader::for_header(&data).unwrap();
        feed(&mut reader, &data, 32);
        assert!(!reader.is_finished());
        reader.finish();
        assert!(reader.is_finished());
        assert_eq!(reader.metadata().orientation(), Some(3));
    }

    #[test]
    fn test_tiff_stream_is_the_exif_block() {
        let tiff = tiff_with_orientation(8, true);
        let mut reader = MetadataReader::for_header(&tiff).unwrap();
        reader.consume(&tiff);
        assert!(!reader.is_finished());
        reader.finish();
        assert_eq!(reader.metadata().raw_exif.as_deref(), Some(tiff.as_slice()));
    }

    #[test]
    fn test_png_without_metadata_finishes_empty() {
        let data = encode(ImageFormat::Png);
        let mut reader = MetadataReader::for_header(&data).unwrap();
        feed(&mut reader, &data, 1024);
        assert!(reader.is_finished());
        assert!(reader.metadata().is_empty());
    }

    #[test]
    fn test_raw_orientation_both_byte_orders() {
        for le in [true, false] {
            for v in 1..=8 {
                assert_eq!(raw_exif_orientation(&tiff_with_orientation(v, le)), Some(v));
            }
            assert_eq!(raw_exif_orientation(&tiff_with_orientation(9, le)), None);
        }
        assert_eq!(raw_exif_orientation(b"II*\0"), None);
        assert_eq!(raw_exif_orientation(&[]), None);
    }

    #[test]
    fn test_reset_raw_orientation() {
        let mut tiff = tiff_with_orientation(6, false);
        assert!(reset_raw_exif_orientation(&mut tiff));
        assert_eq!(raw_exif_orientation(&tiff), Some(1));

        let mut garbage = vec![1, 2, 3];
        assert!(!reset_raw_exif_orientation(&mut garbage));
        assert_eq!(garbage, vec![1, 2, 3]);
    }
}
