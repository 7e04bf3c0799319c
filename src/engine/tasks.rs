// src/engine/tasks.rs
//
// Job bodies, one per kind. Called by `Job::execute` on the worker thread;
// errors bubble up to the job, which stores the first one.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::{DynamicImage, GenericImageView, ImageFormat};
use walkdir::WalkDir;

use crate::engine::common::EngineResult;
use crate::engine::image::{Image, LoadOutcome};
use crate::engine::io::copy_with_progress;
use crate::engine::job::{Job, JobContext, JobPayload, ModelOutput, SaveAsTarget};
use crate::engine::metadata::MetadataReader;
use crate::engine::notify::Notification;
use crate::engine::thumbnail::make_thumbnail;
use crate::error::ViewerError;
use crate::ops::{DataMask, Transform};

fn fraction(done: usize, total: usize) -> f32 {
    if total == 0 {
        1.0
    } else {
        done as f32 / total as f32
    }
}

pub(crate) fn run(job: &Arc<Job>, ctx: &JobContext<'_>) -> EngineResult<()> {
    tracing::debug!(job_id = %job.id(), kind = job.kind().as_str(), "job started");
    match job.payload() {
        JobPayload::Load { image, mask } => run_load(image, *mask, ctx),
        JobPayload::Thumbnail { image } => run_thumbnail(image, ctx),
        JobPayload::Model { paths } => run_model(job, paths, ctx),
        JobPayload::Transform { images, transform } => run_transform(images, *transform, ctx),
        JobPayload::Save { images } => run_save(job, images, ctx),
        JobPayload::SaveAs {
            images,
            target,
            overwrite,
        } => run_save_as(job, images, target, *overwrite, ctx),
        JobPayload::Copy { files, dest_dir } => run_copy(files, dest_dir, ctx),
    }
}

// =============================================================================
// Load / Thumbnail
// =============================================================================

fn run_load(image: &Arc<Image>, mask: DataMask, ctx: &JobContext<'_>) -> EngineResult<()> {
    if image.load(mask, ctx)? == LoadOutcome::Cancelled {
        tracing::debug!(image = %image.path().display(), "load job ended by cancellation");
    }
    Ok(())
}

/// Decode a file just for its thumbnail, without touching the entity's
/// bitmap. Returns the pixels with the display transform applied.
fn decode_for_thumbnail(image: &Image, ctx: &JobContext<'_>) -> EngineResult<DynamicImage> {
    let path = image.path();
    let shown = path.display().to_string();
    let data = fs::read(&path).map_err(|e| ViewerError::from_open(shown.clone(), e))?;

    let format = image::guess_format(&data)
        .ok()
        .or_else(|| ImageFormat::from_path(&path).ok());
    let mut decoder = ctx.decoders.create(format);
    decoder.write(&data)?;
    let outcome = decoder.close();
    let pixels = match (outcome.image, outcome.error) {
        (Some(pixels), error) => {
            if let Some(e) = error {
                tracing::warn!(image = %shown, error = %e, "thumbnail decode reported an error");
            }
            pixels
        }
        (None, Some(e)) => return Err(e),
        (None, None) => {
            return Err(ViewerError::decode_failed(format!("could not decode '{shown}'")))
        }
    };

    let mut transform = image.current_transform();
    if ctx.config.autorotate && image.autorotate_pending() {
        let orientation = MetadataReader::for_header(&data).and_then(|mut reader| {
            reader.consume(&data);
            reader.finish();
            reader.metadata().orientation()
        });
        if let Some(autorotate) = orientation.and_then(Transform::from_exif_orientation) {
            transform = autorotate.compose(transform);
        }
    }
    Ok(transform.apply(&pixels))
}

fn run_thumbnail(image: &Arc<Image>, ctx: &JobContext<'_>) -> EngineResult<()> {
    let source = match image.pixels() {
        Some(pixels) => pixels,
        None => Arc::new(decode_for_thumbnail(image, ctx)?),
    };
    let (width, height) = source.dimensions();
    image.set_dimension_hint(width, height);

    let thumbnail = make_thumbnail(&source, ctx.config.thumbnail_size, ctx.config.thumbnail_frame);
    tracing::debug!(
        image = %image.path().display(),
        width = thumbnail.width(),
        height = thumbnail.height(),
        "thumbnail created"
    );
    image.set_thumbnail(Some(thumbnail));
    ctx.notifier
        .post(Notification::ThumbnailChanged(Arc::clone(image)));
    Ok(())
}

// =============================================================================
// Model
// =============================================================================

/// Bytes read from each candidate file to recognize its format.
const SNIFF_LEN: u64 = 64;

/// Readable, and its leading bytes match a format we can decode. The
/// extension is not trusted.
fn is_supported_image(path: &Path) -> bool {
    let mut header = Vec::with_capacity(SNIFF_LEN as usize);
    let read = File::open(path).and_then(|file| file.take(SNIFF_LEN).read_to_end(&mut header));
    match read {
        Ok(_) => image::guess_format(&header)
            .map(|format| format.reading_enabled())
            .unwrap_or(false),
        Err(_) => false,
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

fn collect_file(path: PathBuf, output: &mut ModelOutput) {
    if is_supported_image(&path) {
        output.images.push(Image::new(path));
    } else {
        tracing::debug!(path = %path.display(), "not a readable image");
        output.errors.push(path);
    }
}

fn run_model(job: &Arc<Job>, paths: &[PathBuf], ctx: &JobContext<'_>) -> EngineResult<()> {
    let mut output = ModelOutput::default();
    for (i, path) in paths.iter().enumerate() {
        if path.is_dir() {
            let entries = WalkDir::new(path)
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|entry| !is_hidden(entry.file_name()));
            for entry in entries {
                match entry {
                    Ok(entry) if entry.file_type().is_file() => {
                        collect_file(entry.into_path(), &mut output)
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(path = %path.display(), error = %e, "directory entry unreadable");
                        if let Some(bad) = e.path() {
                            output.errors.push(bad.to_path_buf());
                        }
                    }
                }
            }
        } else if path.exists() {
            collect_file(path.clone(), &mut output);
        } else {
            tracing::debug!(path = %path.display(), "path does not exist");
            output.errors.push(path.clone());
        }
        ctx.progress(fraction(i + 1, paths.len()));
    }

    tracing::info!(
        job_id = %job.id(),
        images = output.images.len(),
        errors = output.errors.len(),
        "model built"
    );
    job.set_model_output(output);
    Ok(())
}

// =============================================================================
// Transform
// =============================================================================

fn run_transform(
    images: &[Arc<Image>],
    transform: Option<Transform>,
    ctx: &JobContext<'_>,
) -> EngineResult<()> {
    for (i, image) in images.iter().enumerate() {
        let changed = match transform {
            Some(transform) => image.apply_transform(transform),
            None => image.undo(),
        };
        if changed {
            ctx.notifier.post(Notification::ImageChanged(Arc::clone(image)));
        }
        ctx.progress(fraction(i + 1, images.len()));
    }
    Ok(())
}

// =============================================================================
// Save / SaveAs
// =============================================================================

fn run_save(job: &Arc<Job>, images: &[Arc<Image>], ctx: &JobContext<'_>) -> EngineResult<()> {
    for (i, image) in images.iter().enumerate() {
        job.set_save_cursor(i, image);
        if !image.is_modified() && image.file_exists() {
            tracing::debug!(image = %image.path().display(), "unchanged, not saving");
        } else {
            image.save(ctx)?;
        }
        ctx.progress(fraction(i + 1, images.len()));
    }
    Ok(())
}

fn run_save_as(
    job: &Arc<Job>,
    images: &[Arc<Image>],
    target: &SaveAsTarget,
    overwrite: bool,
    ctx: &JobContext<'_>,
) -> EngineResult<()> {
    match target {
        SaveAsTarget::File(_) if images.len() != 1 => {
            return Err(ViewerError::generic(format!(
                "a single destination file cannot hold {} images",
                images.len()
            )));
        }
        SaveAsTarget::Converter(converter) if !converter.check_unique(images) => {
            return Err(ViewerError::generic(
                "naming pattern maps several images to the same file",
            ));
        }
        _ => {}
    }

    for (i, image) in images.iter().enumerate() {
        job.set_save_cursor(i, image);
        let (dest, forced) = match target {
            SaveAsTarget::File(path) => (path.clone(), None),
            SaveAsTarget::Converter(converter) => {
                (converter.destination(&image.path(), i), converter.format())
            }
        };
        let format = forced
            .or_else(|| ImageFormat::from_path(&dest).ok())
            .or_else(|| image.format());
        image.save_as(&dest, format, overwrite, ctx)?;
        ctx.progress(fraction(i + 1, images.len()));
    }
    Ok(())
}

// =============================================================================
// Copy
// =============================================================================

fn run_copy(files: &[PathBuf], dest_dir: &Path, ctx: &JobContext<'_>) -> EngineResult<()> {
    let total = files.len();
    for (i, file) in files.iter().enumerate() {
        let name = file.file_name().ok_or_else(|| {
            ViewerError::generic(format!("'{}' has no file name", file.display()))
        })?;
        let dest = dest_dir.join(name);
        let bytes = copy_with_progress(file, &dest, ctx.config.read_chunk_size, |done| {
            ctx.progress((i as f32 + done) / total as f32)
        })?;
        tracing::debug!(src = %file.display(), dest = %dest.display(), bytes, "file copied");
    }
    Ok(())
}
