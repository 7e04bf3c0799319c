// src/engine/loader.rs
//
// The chunked load loop behind `Image::load`.
//
// One pass over the file feeds two consumers: the metadata reader and the
// pixel decoder. The size is reported as soon as the decoder knows it and
// the EXIF orientation (if autorotating) has been folded in. Cancellation is
// checked before every read.

use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::sync::Arc;

use image::ImageFormat;

use crate::engine::common::EngineResult;
use crate::engine::decoder::{DecodeOutcome, PixelDecoder};
use crate::engine::image::{Image, LoadOutcome, MetadataStatus};
use crate::engine::job::{JobContext, JobKind};
use crate::engine::metadata::MetadataReader;
use crate::engine::notify::Notification;
use crate::error::ViewerError;
use crate::ops::DataMask;

fn report_size(image: &Arc<Image>, ctx: &JobContext<'_>, raw: (u32, u32)) {
    let (width, height) = image.displayed_size(raw);
    image.set_dimensions(width, height);
    ctx.notifier.post(Notification::SizePrepared {
        image: Arc::clone(image),
        width,
        height,
    });
}

fn autorotate_settled(image: &Image, ctx: &JobContext<'_>) -> bool {
    !(ctx.config.autorotate && image.autorotate_pending())
}

pub(crate) fn real_load(
    image: &Arc<Image>,
    mask: DataMask,
    ctx: &JobContext<'_>,
) -> EngineResult<LoadOutcome> {
    let path = image.path();
    let shown = path.display().to_string();

    let info = fs::metadata(&path).map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            ViewerError::file_not_found(shown.clone())
        } else {
            ViewerError::file_query_failed(shown.clone(), e)
        }
    })?;
    let total = info.len();
    image.set_file_info(total);
    let mut file = File::open(&path).map_err(|e| ViewerError::from_open(shown.clone(), e))?;

    let wants_image = mask.contains(DataMask::IMAGE);
    let wants_dims = mask.contains(DataMask::DIMENSION);
    let report_progress = ctx.job_kind() == Some(JobKind::Load);

    let mut buf = vec![0u8; ctx.config.read_chunk_size.max(1)];
    let mut decoder: Option<Box<dyn PixelDecoder>> = None;
    let mut reader: Option<MetadataReader> = None;
    let metadata_known = image.metadata_status() != MetadataStatus::NotRead;
    let mut metadata_done = metadata_known;
    let mut unrecognized_container = false;
    let mut write_error: Option<ViewerError> = None;
    let mut size_reported = false;
    let mut bytes_read = 0u64;

    loop {
        if image.is_cancel_requested() {
            image.discard_loaded_data(wants_image, !metadata_known);
            tracing::debug!(image = %shown, bytes_read, "load cancelled");
            return Ok(LoadOutcome::Cancelled);
        }

        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(ViewerError::file_read_failed(shown, e)),
        };
        let chunk = &buf[..n];

        if bytes_read == 0 {
            let format = image::guess_format(chunk)
                .ok()
                .or_else(|| ImageFormat::from_path(&path).ok());
            if let Some(format) = format {
                image.set_format(format);
            }
            if wants_image || wants_dims {
                decoder = Some(ctx.decoders.create(format));
            }
            if !metadata_done {
                reader = MetadataReader::for_header(chunk);
                if reader.is_none() {
                    unrecognized_container = true;
                    image.mark_metadata_unavailable();
                    metadata_done = true;
                }
            }
        }
        bytes_read += n as u64;

        if let Some(r) = reader.as_mut() {
            r.consume(chunk);
            if r.is_finished() {
                if let Some(r) = reader.take() {
                    image.publish_metadata(r.into_metadata());
                }
                metadata_done = true;
            }
        }

        if let Some(d) = decoder.as_mut() {
            if write_error.is_none() {
                if let Err(e) = d.write(chunk) {
                    tracing::debug!(image = %shown, error = %e, "decoder rejected data");
                    write_error = Some(e);
                }
            }
        }

        if metadata_done && !autorotate_settled(image, ctx) {
            image.resolve_autorotate();
        }

        if !size_reported && autorotate_settled(image, ctx) {
            if let Some(raw) = decoder.as_ref().and_then(|d| d.size()) {
                report_size(image, ctx, raw);
                size_reported = true;
            }
        }

        if report_progress && total > 0 {
            ctx.progress((bytes_read as f64 / total as f64).min(1.0) as f32);
        }

        let dims_satisfied = !wants_dims || size_reported;
        if !wants_image && dims_satisfied && metadata_done {
            break;
        }
        if write_error.is_some() && metadata_done {
            break;
        }
    }

    if let Some(mut r) = reader.take() {
        r.finish();
        image.publish_metadata(r.into_metadata());
    }
    if unrecognized_container && mask.contains(DataMask::EXIF) && !wants_image {
        return Err(ViewerError::not_supported(format!(
            "EXIF metadata in '{shown}'"
        )));
    }
    if !autorotate_settled(image, ctx) {
        image.resolve_autorotate();
    }

    if wants_image {
        let DecodeOutcome {
            image: pixels,
            frames,
            error,
        } = match decoder.take() {
            Some(d) => d.close(),
            None => DecodeOutcome::failed(ViewerError::decode_failed(format!(
                "'{shown}' is empty"
            ))),
        };
        match pixels {
            Some(pixels) => {
                if let Some(e) = error {
                    tracing::warn!(image = %shown, error = %e, "decoder reported an error but produced an image");
                }
                image.publish_pixels(pixels, frames);
                if !size_reported {
                    if let Some((width, height)) = image.dimensions() {
                        ctx.notifier.post(Notification::SizePrepared {
                            image: Arc::clone(image),
                            width,
                            height,
                        });
                    }
                }
            }
            None => {
                return Err(error.or(write_error).unwrap_or_else(|| {
                    ViewerError::decode_failed(format!("could not decode '{shown}'"))
                }));
            }
        }
    } else if wants_dims && !size_reported {
        match decoder.as_ref().and_then(|d| d.size()) {
            Some(raw) => report_size(image, ctx, raw),
            None => {
                return Err(write_error.unwrap_or_else(|| {
                    ViewerError::decode_failed(format!("could not determine the size of '{shown}'"))
                }));
            }
        }
    }

    tracing::debug!(image = %shown, bytes_read, ?mask, "load complete");
    Ok(LoadOutcome::Complete)
}
