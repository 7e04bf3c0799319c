// src/engine/image.rs
//
// The image entity: one picture on disk, shared between the UI thread and
// the worker thread.
//
// Identity (path, caption, collate key) lives behind a RwLock so save-as can
// re-link it. Everything the worker mutates while the UI may be reading
// lives in one `ImageState` behind a per-entity mutex. The mutex is held per
// field update, never across file I/O or codec work.

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::{DynamicImage, Frame, ImageFormat};
use parking_lot::{Mutex, RwLock};

use crate::engine::common::{run_with_panic_policy, EngineResult};
use crate::engine::encoder::{self, EmbeddedMetadata};
use crate::engine::io;
use crate::engine::job::JobContext;
use crate::engine::loader;
use crate::engine::metadata::{reset_raw_exif_orientation, ImageMetadata};
use crate::error::ViewerError;
use crate::ops::{DataMask, Transform};

/// What the worker thread is doing with an image right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageStatus {
    Unknown,
    Loading,
    Loaded,
    Saving,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetadataStatus {
    /// Nobody looked for metadata yet.
    NotRead,
    /// The file was examined and carries none we understand.
    NotAvailable,
    Ready,
}

/// How a load ended when it did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    Complete,
    /// `cancel_load` was honored; decoded data was discarded.
    Cancelled,
}

struct Identity {
    path: PathBuf,
    caption: String,
    collate_key: String,
}

impl Identity {
    fn new(path: PathBuf) -> Self {
        let caption = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let collate_key = caption.to_lowercase();
        Self {
            path,
            caption,
            collate_key,
        }
    }
}

struct ImageState {
    status: ImageStatus,
    metadata_status: MetadataStatus,
    pixels: Option<Arc<DynamicImage>>,
    thumbnail: Option<Arc<DynamicImage>>,
    frames: Option<Arc<Vec<Frame>>>,
    metadata: Option<Arc<ImageMetadata>>,
    color_profile: Option<Arc<Vec<u8>>>,
    /// Displayed size (after transforms); 0 while unknown.
    width: u32,
    height: u32,
    file_size: Option<u64>,
    format: Option<ImageFormat>,
    modified: bool,
    /// Everything applied to the stored pixels, autorotation included.
    transform: Option<Transform>,
    autorotate_transform: Option<Transform>,
    /// Autorotation still to be resolved on the next load.
    autorotate: bool,
    undo: Vec<Transform>,
    data_refs: usize,
}

impl ImageState {
    fn new() -> Self {
        Self {
            status: ImageStatus::Unknown,
            metadata_status: MetadataStatus::NotRead,
            pixels: None,
            thumbnail: None,
            frames: None,
            metadata: None,
            color_profile: None,
            width: 0,
            height: 0,
            file_size: None,
            format: None,
            modified: false,
            transform: None,
            autorotate_transform: None,
            autorotate: true,
            undo: Vec::new(),
            data_refs: 0,
        }
    }

    fn has_data(&self, mask: DataMask) -> bool {
        if mask.contains(DataMask::IMAGE) && self.pixels.is_none() {
            return false;
        }
        if mask.contains(DataMask::DIMENSION) && (self.width == 0 || self.height == 0) {
            return false;
        }
        if mask.intersects(DataMask::EXIF | DataMask::XMP)
            && self.metadata_status == MetadataStatus::NotRead
        {
            return false;
        }
        true
    }

    fn current_transform(&self) -> Transform {
        self.transform.unwrap_or(Transform::Identity)
    }

    fn set_transform(&mut self, transform: Transform) {
        self.transform = (!transform.is_identity()).then_some(transform);
    }

    fn release_heavy(&mut self) {
        self.pixels = None;
        self.thumbnail = None;
        self.frames = None;
        self.metadata = None;
        self.color_profile = None;
        self.metadata_status = MetadataStatus::NotRead;
        // An in-flight job owns the status until it finishes
        if !matches!(self.status, ImageStatus::Loading | ImageStatus::Saving) {
            self.status = ImageStatus::Unknown;
        }
    }
}

pub struct Image {
    identity: RwLock<Identity>,
    state: Mutex<ImageState>,
    cancel_requested: AtomicBool,
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("path", &self.path())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

fn transform_frame(frame: &Frame, transform: Transform) -> Frame {
    let buffer = DynamicImage::ImageRgba8(frame.buffer().clone());
    Frame::from_parts(
        transform.apply(&buffer).to_rgba8(),
        frame.left(),
        frame.top(),
        frame.delay(),
    )
}

impl Image {
    pub fn new(path: impl Into<PathBuf>) -> Arc<Image> {
        Arc::new(Image {
            identity: RwLock::new(Identity::new(path.into())),
            state: Mutex::new(ImageState::new()),
            cancel_requested: AtomicBool::new(false),
        })
    }

    // -------------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------------

    pub fn path(&self) -> PathBuf {
        self.identity.read().path.clone()
    }

    /// Display name (the file name).
    pub fn caption(&self) -> String {
        self.identity.read().caption.clone()
    }

    /// Sort key used by collections.
    pub fn collate_key(&self) -> String {
        self.identity.read().collate_key.clone()
    }

    pub fn file_exists(&self) -> bool {
        self.path().is_file()
    }

    fn display(&self) -> String {
        self.path().display().to_string()
    }

    // -------------------------------------------------------------------------
    // State accessors
    // -------------------------------------------------------------------------

    pub fn status(&self) -> ImageStatus {
        self.state.lock().status
    }

    pub fn metadata_status(&self) -> MetadataStatus {
        self.state.lock().metadata_status
    }

    /// Displayed width and height, once known.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        let st = self.state.lock();
        (st.width > 0 && st.height > 0).then_some((st.width, st.height))
    }

    pub fn pixels(&self) -> Option<Arc<DynamicImage>> {
        self.state.lock().pixels.clone()
    }

    pub fn thumbnail(&self) -> Option<Arc<DynamicImage>> {
        self.state.lock().thumbnail.clone()
    }

    pub fn frames(&self) -> Option<Arc<Vec<Frame>>> {
        self.state.lock().frames.clone()
    }

    pub fn is_animation(&self) -> bool {
        self.state.lock().frames.is_some()
    }

    pub fn metadata(&self) -> Option<Arc<ImageMetadata>> {
        self.state.lock().metadata.clone()
    }

    pub fn color_profile(&self) -> Option<Arc<Vec<u8>>> {
        self.state.lock().color_profile.clone()
    }

    pub fn file_size(&self) -> Option<u64> {
        self.state.lock().file_size
    }

    pub fn format(&self) -> Option<ImageFormat> {
        self.state.lock().format
    }

    pub fn is_modified(&self) -> bool {
        self.state.lock().modified
    }

    pub fn has_data(&self, mask: DataMask) -> bool {
        self.state.lock().has_data(mask)
    }

    pub fn undo_depth(&self) -> usize {
        self.state.lock().undo.len()
    }

    pub fn current_transform(&self) -> Transform {
        self.state.lock().current_transform()
    }

    /// The EXIF-derived transform folded in by autorotation, if any.
    pub fn autorotate_transform(&self) -> Option<Transform> {
        self.state.lock().autorotate_transform
    }

    /// Enable or disable autorotation for the next load.
    pub fn set_autorotate(&self, enabled: bool) {
        self.state.lock().autorotate = enabled;
    }

    pub(crate) fn autorotate_pending(&self) -> bool {
        self.state.lock().autorotate
    }

    // -------------------------------------------------------------------------
    // Data references
    // -------------------------------------------------------------------------

    /// Keep decoded data alive until the returned guard drops. The last
    /// guard to drop releases bitmap, thumbnail, frames and metadata.
    pub fn data_ref(self: &Arc<Self>) -> DataRef {
        self.state.lock().data_refs += 1;
        DataRef {
            image: Arc::clone(self),
        }
    }

    pub fn data_ref_count(&self) -> usize {
        self.state.lock().data_refs
    }

    fn data_unref(&self) {
        let mut st = self.state.lock();
        st.data_refs = st.data_refs.saturating_sub(1);
        if st.data_refs == 0 {
            st.release_heavy();
            drop(st);
            tracing::debug!(image = %self.display(), "decoded data released");
        }
    }

    // -------------------------------------------------------------------------
    // Loading
    // -------------------------------------------------------------------------

    /// Make the data in `mask` available, reading the file if needed.
    ///
    /// Cancellation is not an error: it yields `LoadOutcome::Cancelled` and
    /// leaves the status at `Unknown`.
    pub fn load(self: &Arc<Self>, mask: DataMask, ctx: &JobContext<'_>) -> EngineResult<LoadOutcome> {
        if mask.is_empty() {
            return Ok(LoadOutcome::Complete);
        }
        let previous = {
            let mut st = self.state.lock();
            if st.has_data(mask) {
                return Ok(LoadOutcome::Complete);
            }
            // A cancel aimed at an earlier load must not stop this one
            self.cancel_requested.store(false, Ordering::SeqCst);
            std::mem::replace(&mut st.status, ImageStatus::Loading)
        };
        tracing::debug!(image = %self.display(), ?mask, ?previous, "load started");

        // An injected decoder may panic; the status must still leave Loading
        let result = run_with_panic_policy("load", || loader::real_load(self, mask, ctx));

        let status = match &result {
            Ok(LoadOutcome::Complete) => ImageStatus::Loaded,
            Ok(LoadOutcome::Cancelled) => ImageStatus::Unknown,
            Err(_) => ImageStatus::Failed,
        };
        {
            // Same lock as cancel_load(): no request lands after the clear
            let mut st = self.state.lock();
            self.cancel_requested.store(false, Ordering::SeqCst);
            st.status = status;
        }
        match &result {
            Ok(outcome) => {
                tracing::debug!(image = %self.display(), ?outcome, "load finished")
            }
            Err(e) => tracing::warn!(image = %self.display(), error = %e, "load failed"),
        }
        result
    }

    /// Ask an in-flight load to stop at its next read. No effect unless the
    /// image is currently loading.
    pub fn cancel_load(&self) {
        let st = self.state.lock();
        if st.status == ImageStatus::Loading {
            self.cancel_requested.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn set_file_info(&self, size: u64) {
        self.state.lock().file_size = Some(size);
    }

    pub(crate) fn set_format(&self, format: ImageFormat) {
        self.state.lock().format = Some(format);
    }

    pub(crate) fn publish_metadata(&self, metadata: ImageMetadata) {
        let mut st = self.state.lock();
        st.metadata_status = if metadata.is_empty() {
            MetadataStatus::NotAvailable
        } else {
            MetadataStatus::Ready
        };
        st.color_profile = metadata.icc.clone().map(Arc::new);
        st.metadata = Some(Arc::new(metadata));
    }

    pub(crate) fn mark_metadata_unavailable(&self) {
        let mut st = self.state.lock();
        if st.metadata_status == MetadataStatus::NotRead {
            st.metadata_status = MetadataStatus::NotAvailable;
        }
    }

    /// Fold the EXIF orientation into the transform, once per entity.
    pub(crate) fn resolve_autorotate(&self) -> Option<Transform> {
        let mut st = self.state.lock();
        if !st.autorotate {
            return None;
        }
        st.autorotate = false;
        let transform = st
            .metadata
            .as_ref()
            .and_then(|m| m.orientation())
            .and_then(Transform::from_exif_orientation)
            .filter(|t| !t.is_identity())?;
        st.autorotate_transform = Some(transform);
        let composed = transform.compose(st.current_transform());
        st.set_transform(composed);
        Some(transform)
    }

    /// Size after the current transform, for a raw decoder size.
    pub(crate) fn displayed_size(&self, raw: (u32, u32)) -> (u32, u32) {
        self.current_transform().transformed_size(raw.0, raw.1)
    }

    pub(crate) fn set_dimensions(&self, width: u32, height: u32) {
        let mut st = self.state.lock();
        st.width = width;
        st.height = height;
    }

    /// Record a size learned outside a load, unless one is already known.
    pub(crate) fn set_dimension_hint(&self, width: u32, height: u32) {
        let mut st = self.state.lock();
        if st.width == 0 || st.height == 0 {
            st.width = width;
            st.height = height;
        }
    }

    /// Store freshly decoded pixels with the current transform applied.
    pub(crate) fn publish_pixels(&self, pixels: DynamicImage, frames: Option<Vec<Frame>>) {
        let transform = self.current_transform();
        let (pixels, frames) = if transform.is_identity() {
            (pixels, frames)
        } else {
            let frames = frames.map(|f| f.iter().map(|fr| transform_frame(fr, transform)).collect());
            (transform.apply(&pixels), frames)
        };
        let mut st = self.state.lock();
        st.width = pixels.width();
        st.height = pixels.height();
        st.pixels = Some(Arc::new(pixels));
        st.frames = frames.map(Arc::new);
    }

    /// Drop what a cancelled load produced so far. Data an earlier load
    /// published stays.
    pub(crate) fn discard_loaded_data(&self, pixels: bool, metadata: bool) {
        let mut st = self.state.lock();
        if pixels {
            st.pixels = None;
            st.frames = None;
        }
        if metadata {
            st.metadata = None;
            st.color_profile = None;
            st.metadata_status = MetadataStatus::NotRead;
        }
    }

    pub(crate) fn set_thumbnail(&self, thumbnail: Option<DynamicImage>) {
        self.state.lock().thumbnail = thumbnail.map(Arc::new);
    }

    // -------------------------------------------------------------------------
    // Transforms
    // -------------------------------------------------------------------------

    /// Apply `transform` and push it on the undo stack. Identity is a no-op.
    /// Returns whether the image changed.
    pub fn apply_transform(&self, transform: Transform) -> bool {
        if transform.is_identity() {
            return false;
        }
        self.transform_data(transform, false);
        true
    }

    /// Revert the most recent transform. Returns false when there is
    /// nothing to undo.
    pub fn undo(&self) -> bool {
        let last = self.state.lock().undo.pop();
        match last {
            Some(transform) => {
                self.transform_data(transform.reverse(), true);
                true
            }
            None => false,
        }
    }

    fn transform_data(&self, transform: Transform, is_undo: bool) {
        let (pixels, thumbnail, frames) = {
            let st = self.state.lock();
            (st.pixels.clone(), st.thumbnail.clone(), st.frames.clone())
        };
        let pixels = pixels.map(|p| Arc::new(transform.apply(&p)));
        let thumbnail = thumbnail.map(|t| Arc::new(transform.apply(&t)));
        let frames = frames.map(|f| {
            Arc::new(
                f.iter()
                    .map(|frame| transform_frame(frame, transform))
                    .collect::<Vec<_>>(),
            )
        });

        let mut st = self.state.lock();
        // A release may have happened meanwhile; don't resurrect data
        if st.pixels.is_some() {
            st.pixels = pixels;
        }
        if st.thumbnail.is_some() {
            st.thumbnail = thumbnail;
        }
        if st.frames.is_some() {
            st.frames = frames;
        }
        let (width, height) = transform.transformed_size(st.width, st.height);
        st.width = width;
        st.height = height;
        let composed = st.current_transform().compose(transform);
        st.set_transform(composed);
        if is_undo {
            st.modified = !st.undo.is_empty();
        } else {
            st.undo.push(transform);
            st.modified = true;
        }
    }

    /// Forget the undo history after the pixels reached the file.
    pub fn reset_modifications(&self) {
        let mut st = self.state.lock();
        st.undo.clear();
        st.transform = None;
        st.autorotate_transform = None;
        st.modified = false;
    }

    // -------------------------------------------------------------------------
    // Saving
    // -------------------------------------------------------------------------

    fn ensure_loaded(self: &Arc<Self>, ctx: &JobContext<'_>) -> EngineResult<()> {
        if self.has_data(DataMask::ALL) {
            return Ok(());
        }
        match self.load(DataMask::ALL, ctx)? {
            LoadOutcome::Complete => Ok(()),
            LoadOutcome::Cancelled => Err(ViewerError::generic(format!(
                "loading '{}' for saving was cancelled",
                self.display()
            ))),
        }
    }

    fn write_file(
        &self,
        dest: &Path,
        format: ImageFormat,
        overwrite: bool,
        attributes_from: Option<&Path>,
        ctx: &JobContext<'_>,
    ) -> EngineResult<()> {
        let (pixels, metadata, autorotated, previous) = {
            let mut st = self.state.lock();
            let pixels = st
                .pixels
                .clone()
                .ok_or_else(|| ViewerError::not_loaded(self.display()))?;
            let previous = std::mem::replace(&mut st.status, ImageStatus::Saving);
            (
                pixels,
                st.metadata.clone(),
                st.autorotate_transform.is_some(),
                previous,
            )
        };

        let result = (|| -> EngineResult<usize> {
            let encoded = encoder::encode(&pixels, format, ctx.config.jpeg_quality)?;
            let exif = metadata
                .as_ref()
                .and_then(|m| m.raw_exif.as_deref())
                .map(|raw| {
                    if autorotated {
                        // The orientation is baked into the pixels now
                        let mut owned = raw.to_vec();
                        reset_raw_exif_orientation(&mut owned);
                        Cow::Owned(owned)
                    } else {
                        Cow::Borrowed(raw)
                    }
                });
            let embedded = EmbeddedMetadata {
                icc: metadata.as_ref().and_then(|m| m.icc.as_deref()),
                exif,
            };
            let bytes = encoder::embed_metadata(encoded, format, &embedded)?;
            io::write_atomic(dest, &bytes, overwrite, attributes_from)?;
            Ok(bytes.len())
        })();

        let mut st = self.state.lock();
        st.status = previous;
        let written = result?;
        st.file_size = Some(written as u64);
        if autorotated {
            let updated = st.metadata.as_deref().map(|meta| {
                let mut meta = meta.clone();
                if let Some(raw) = meta.raw_exif.as_mut() {
                    reset_raw_exif_orientation(raw);
                }
                Arc::new(meta)
            });
            if updated.is_some() {
                st.metadata = updated;
            }
        }
        Ok(())
    }

    fn save_format(&self, path: &Path) -> EngineResult<ImageFormat> {
        self.format()
            .or_else(|| ImageFormat::from_path(path).ok())
            .ok_or_else(|| ViewerError::unsupported_format(path.display().to_string()))
    }

    /// Write the image back to its own file.
    pub fn save(self: &Arc<Self>, ctx: &JobContext<'_>) -> EngineResult<()> {
        let path = self.path();
        let _data = self.data_ref();
        self.ensure_loaded(ctx)?;
        let format = self.save_format(&path)?;
        let attributes_from = path.exists().then_some(path.as_path());
        self.write_file(&path, format, true, attributes_from, ctx)?;
        self.reset_modifications();
        tracing::info!(image = %path.display(), ?format, "image saved");
        Ok(())
    }

    /// Write the image to `dest` and re-link the entity to it.
    /// `format` defaults to the destination's extension.
    pub fn save_as(
        self: &Arc<Self>,
        dest: &Path,
        format: Option<ImageFormat>,
        overwrite: bool,
        ctx: &JobContext<'_>,
    ) -> EngineResult<()> {
        if !overwrite && dest.exists() {
            return Err(ViewerError::file_exists(dest.display().to_string()));
        }
        let source = self.path();
        let _data = self.data_ref();
        self.ensure_loaded(ctx)?;
        let format = match format.or_else(|| ImageFormat::from_path(dest).ok()) {
            Some(format) => format,
            None => self.save_format(&source)?,
        };
        let attributes_from = source.exists().then_some(source.as_path());
        self.write_file(dest, format, overwrite, attributes_from, ctx)?;
        self.relink(dest, format);
        self.reset_modifications();
        tracing::info!(
            image = %source.display(),
            dest = %dest.display(),
            ?format,
            "image saved as"
        );
        Ok(())
    }

    fn relink(&self, path: &Path, format: ImageFormat) {
        *self.identity.write() = Identity::new(path.to_path_buf());
        self.state.lock().format = Some(format);
    }

    /// Move the file into the platform trash.
    pub fn trash(&self) -> EngineResult<()> {
        io::move_to_trash(&self.path())
    }
}

/// Keeps an image's decoded data alive. See [`Image::data_ref`].
pub struct DataRef {
    image: Arc<Image>,
}

impl DataRef {
    pub fn image(&self) -> &Arc<Image> {
        &self.image
    }
}

impl std::ops::Deref for DataRef {
    type Target = Image;

    fn deref(&self) -> &Image {
        &self.image
    }
}

impl Drop for DataRef {
    fn drop(&mut self) {
        self.image.data_unref();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::EngineConfig;
    use crate::engine::decoder::{DecodeOutcome, DecoderFactory, PixelDecoder, StandardDecoders};
    use crate::engine::notify::{channel, Notification};
    use crate::error::ErrorCategory;
    use image::{GenericImageView, Rgb, RgbImage};
    use std::fs;

    fn create_test_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 30) as u8, (y * 30) as u8, 77])
        }))
    }

    fn write_png(dir: &Path, name: &str, width: u32, height: u32) -> PathBuf {
        let path = dir.join(name);
        create_test_image(width, height).save(&path).unwrap();
        path
    }

    struct Harness {
        config: EngineConfig,
        decoders: StandardDecoders,
        notifier: crate::engine::notify::Notifier,
        main: crate::engine::notify::MainContext,
    }

    impl Harness {
        fn new() -> Self {
            let config = EngineConfig::default().with_read_chunk_size(64);
            let (notifier, main) = channel(256);
            Self {
                decoders: StandardDecoders::from_config(&config),
                config,
                notifier,
                main,
            }
        }

        fn ctx(&self) -> JobContext<'_> {
            JobContext::new(&self.config, &self.decoders, &self.notifier)
        }
    }

    #[test]
    fn test_identity_fields() {
        let image = Image::new("/photos/Holiday.PNG");
        assert_eq!(image.caption(), "Holiday.PNG");
        assert_eq!(image.collate_key(), "holiday.png");
        assert_eq!(image.status(), ImageStatus::Unknown);
        assert_eq!(image.metadata_status(), MetadataStatus::NotRead);
        assert!(image.dimensions().is_none());
    }

    #[test]
    fn test_load_png_publishes_pixels_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "a.png", 40, 30);
        let h = Harness::new();
        let image = Image::new(&path);

        let outcome = image.load(DataMask::ALL, &h.ctx()).unwrap();
        assert_eq!(outcome, LoadOutcome::Complete);
        assert_eq!(image.status(), ImageStatus::Loaded);
        assert_eq!(image.dimensions(), Some((40, 30)));
        assert_eq!(image.format(), Some(ImageFormat::Png));
        assert!(image.has_data(DataMask::ALL));
        assert_eq!(image.metadata_status(), MetadataStatus::NotAvailable);
        assert_eq!(
            image.file_size(),
            Some(fs::metadata(&path).unwrap().len())
        );

        let mut sizes = Vec::new();
        h.main.dispatch_pending(|n| {
            if let Notification::SizePrepared { width, height, .. } = n {
                sizes.push((width, height));
            }
        });
        assert_eq!(sizes, vec![(40, 30)]);
    }

    #[test]
    fn test_load_with_empty_mask_is_noop() {
        let h = Harness::new();
        let image = Image::new("/does/not/exist.png");
        let outcome = image.load(DataMask::empty(), &h.ctx()).unwrap();
        assert_eq!(outcome, LoadOutcome::Complete);
        assert_eq!(image.status(), ImageStatus::Unknown);
    }

    #[test]
    fn test_load_missing_file_fails_with_vfs() {
        let h = Harness::new();
        let image = Image::new("/does/not/exist.png");
        let err = image.load(DataMask::IMAGE, &h.ctx()).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Vfs);
        assert_eq!(image.status(), ImageStatus::Failed);
    }

    #[test]
    fn test_data_ref_releases_on_last_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "a.png", 8, 8);
        let h = Harness::new();
        let image = Image::new(&path);

        let first = image.data_ref();
        let second = image.data_ref();
        image.load(DataMask::ALL, &h.ctx()).unwrap();
        assert_eq!(image.data_ref_count(), 2);

        drop(first);
        assert!(image.pixels().is_some());
        drop(second);
        assert_eq!(image.data_ref_count(), 0);
        assert!(image.pixels().is_none());
        assert_eq!(image.status(), ImageStatus::Unknown);
        assert_eq!(image.metadata_status(), MetadataStatus::NotRead);
        // identity and size hints survive
        assert_eq!(image.caption(), "a.png");
        assert_eq!(image.dimensions(), Some((8, 8)));
    }

    #[test]
    fn test_transform_before_load_is_applied_on_decode() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "a.png", 6, 4);
        let h = Harness::new();
        let image = Image::new(&path);

        assert!(image.apply_transform(Transform::Rotate90));
        assert!(image.is_modified());
        image.load(DataMask::IMAGE, &h.ctx()).unwrap();

        let expected = Transform::Rotate90.apply(&create_test_image(6, 4));
        let pixels = image.pixels().unwrap();
        assert_eq!(pixels.dimensions(), (4, 6));
        assert_eq!(pixels.to_rgb8(), expected.to_rgb8());
    }

    #[test]
    fn test_undo_restores_pixels_and_modified_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "a.png", 5, 3);
        let h = Harness::new();
        let image = Image::new(&path);
        image.load(DataMask::IMAGE, &h.ctx()).unwrap();
        let original = image.pixels().unwrap().to_rgb8();

        image.apply_transform(Transform::FlipHorizontal);
        image.apply_transform(Transform::Rotate270);
        assert_eq!(image.undo_depth(), 2);
        assert_eq!(image.dimensions(), Some((3, 5)));

        assert!(image.undo());
        assert!(image.is_modified());
        assert!(image.undo());
        assert!(!image.is_modified());
        assert_eq!(image.current_transform(), Transform::Identity);
        assert_eq!(image.pixels().unwrap().to_rgb8(), original);
        assert_eq!(image.dimensions(), Some((5, 3)));
    }

    #[test]
    fn test_undo_on_empty_stack_is_noop() {
        let image = Image::new("/x.png");
        assert!(!image.undo());
        assert!(!image.is_modified());
        assert!(!image.apply_transform(Transform::Identity));
        assert!(!image.is_modified());
    }

    #[test]
    fn test_save_writes_transformed_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "a.png", 6, 2);
        let h = Harness::new();
        let image = Image::new(&path);
        image.apply_transform(Transform::Rotate90);

        image.save(&h.ctx()).unwrap();
        assert!(!image.is_modified());
        assert_eq!(image.undo_depth(), 0);
        assert_eq!(image.data_ref_count(), 0);
        let saved = image::open(&path).unwrap();
        assert_eq!(saved.dimensions(), (2, 6));
        assert_eq!(
            saved.to_rgb8(),
            Transform::Rotate90.apply(&create_test_image(6, 2)).to_rgb8()
        );
    }

    #[test]
    fn test_save_as_relinks_entity() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "a.png", 4, 4);
        let dest = dir.path().join("b.jpg");
        let h = Harness::new();
        let image = Image::new(&path);
        image.apply_transform(Transform::FlipVertical);

        image.save_as(&dest, None, false, &h.ctx()).unwrap();
        assert_eq!(image.path(), dest);
        assert_eq!(image.caption(), "b.jpg");
        assert_eq!(image.format(), Some(ImageFormat::Jpeg));
        assert!(!image.is_modified());
        assert_eq!(
            image::open(&dest).unwrap().dimensions(),
            (4, 4)
        );
        assert!(path.exists());
    }

    #[test]
    fn test_save_as_refuses_existing_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "a.png", 4, 4);
        let dest = write_png(dir.path(), "b.png", 2, 2);
        let h = Harness::new();
        let image = Image::new(&path);
        let err = image.save_as(&dest, None, false, &h.ctx()).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::FileExists);
        assert_eq!(image.path(), path);
        assert_eq!(image::open(&dest).unwrap().dimensions(), (2, 2));
    }

    #[test]
    fn test_trash_of_missing_file_is_vfs_error() {
        let dir = tempfile::tempdir().unwrap();
        let image = Image::new(dir.path().join("gone.png"));
        assert_eq!(image.trash().unwrap_err().category(), ErrorCategory::Vfs);
    }

    fn write_oriented_jpeg(dir: &Path, orientation: u16) -> PathBuf {
        use crate::engine::encoder::{embed_metadata, encode, EmbeddedMetadata};
        use crate::engine::metadata::tiff_with_orientation;

        let path = dir.join(format!("o{orientation}.jpg"));
        let data = encode(&create_test_image(8, 4), ImageFormat::Jpeg, 90).unwrap();
        let data = embed_metadata(
            data,
            ImageFormat::Jpeg,
            &EmbeddedMetadata {
                icc: None,
                exif: Some(std::borrow::Cow::Owned(tiff_with_orientation(orientation, true))),
            },
        )
        .unwrap();
        fs::write(&path, data).unwrap();
        path
    }

    /// Calls `cancel_load` on its image from the first write.
    struct CancellingDecoders {
        image: Arc<Image>,
    }

    struct CancellingDecoder {
        image: Arc<Image>,
    }

    impl DecoderFactory for CancellingDecoders {
        fn create(&self, _format: Option<ImageFormat>) -> Box<dyn PixelDecoder> {
            Box::new(CancellingDecoder {
                image: Arc::clone(&self.image),
            })
        }
    }

    impl PixelDecoder for CancellingDecoder {
        fn write(&mut self, _chunk: &[u8]) -> EngineResult<()> {
            self.image.cancel_load();
            Ok(())
        }

        fn size(&self) -> Option<(u32, u32)> {
            None
        }

        fn close(self: Box<Self>) -> DecodeOutcome {
            DecodeOutcome::default()
        }
    }

    #[test]
    fn test_stale_cancel_request_does_not_stop_next_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "a.png", 4, 4);
        let h = Harness::new();
        let image = Image::new(&path);
        // A request that slipped in after the previous load cleared the flag
        image.cancel_requested.store(true, Ordering::SeqCst);

        let outcome = image.load(DataMask::IMAGE, &h.ctx()).unwrap();
        assert_eq!(outcome, LoadOutcome::Complete);
        assert_eq!(image.status(), ImageStatus::Loaded);
        assert!(image.pixels().is_some());
        assert!(!image.is_cancel_requested());
    }

    #[test]
    fn test_cancelled_pixel_load_keeps_earlier_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_oriented_jpeg(dir.path(), 1);
        let h = Harness::new();
        let image = Image::new(&path);
        image.load(DataMask::EXIF, &h.ctx()).unwrap();
        assert_eq!(image.metadata_status(), MetadataStatus::Ready);

        let cancelling = CancellingDecoders {
            image: Arc::clone(&image),
        };
        let ctx = JobContext::new(&h.config, &cancelling, &h.notifier);
        let outcome = image.load(DataMask::IMAGE, &ctx).unwrap();
        assert_eq!(outcome, LoadOutcome::Cancelled);
        assert_eq!(image.status(), ImageStatus::Unknown);
        assert!(image.pixels().is_none());
        assert_eq!(image.metadata_status(), MetadataStatus::Ready);
        assert_eq!(image.metadata().unwrap().orientation(), Some(1));
    }

    #[test]
    fn test_save_bakes_autorotation_and_resets_orientation() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_oriented_jpeg(dir.path(), 6);
        let h = Harness::new();
        let image = Image::new(&path);
        image.apply_transform(Transform::FlipHorizontal);

        image.save(&h.ctx()).unwrap();
        assert!(!image.is_modified());
        assert_eq!(image.autorotate_transform(), None);

        let fresh = Image::new(&path);
        fresh.load(DataMask::ALL, &h.ctx()).unwrap();
        assert_eq!(fresh.metadata().unwrap().orientation(), Some(1));
        assert_eq!(fresh.autorotate_transform(), None);
        assert_eq!(fresh.dimensions(), Some((4, 8)));
        assert_eq!(fresh.pixels().unwrap().dimensions(), (4, 8));
    }
}
