// src/engine/config.rs
//
// Engine configuration: read buffer size, thumbnail geometry, decode limits
// and notification back-pressure. Every knob has a sane default; a few can
// be overridden from the environment.

use super::{MAX_DIMENSION, MAX_PIXELS};

/// Size of each read() issued by the load loop.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;
/// Edge length of the square thumbnail box.
pub const DEFAULT_THUMBNAIL_SIZE: u32 = 128;
/// Width of the frame drawn around thumbnails.
pub const DEFAULT_THUMBNAIL_FRAME: u32 = 1;
/// Pending notifications before the worker blocks on the UI thread.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 1024;
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

const ENV_READ_CHUNK: &str = "LAZY_VIEWER_READ_CHUNK";
const ENV_THUMBNAIL_SIZE: &str = "LAZY_VIEWER_THUMBNAIL_SIZE";
const ENV_NOTIFY_CAPACITY: &str = "LAZY_VIEWER_NOTIFY_CAPACITY";
const ENV_AUTOROTATE: &str = "LAZY_VIEWER_AUTOROTATE";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub read_chunk_size: usize,
    pub thumbnail_size: u32,
    pub thumbnail_frame: u32,
    pub notification_capacity: usize,
    /// Fold the EXIF orientation into the transform of freshly loaded images.
    pub autorotate: bool,
    pub jpeg_quality: u8,
    pub max_dimension: u32,
    pub max_pixels: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            thumbnail_size: DEFAULT_THUMBNAIL_SIZE,
            thumbnail_frame: DEFAULT_THUMBNAIL_FRAME,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
            autorotate: true,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            max_dimension: MAX_DIMENSION,
            max_pixels: MAX_PIXELS,
        }
    }
}

impl EngineConfig {
    /// Defaults, with overrides taken from `LAZY_VIEWER_*` variables.
    /// Unparseable or zero values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(v) = positive::<usize>(lookup(ENV_READ_CHUNK)) {
            config.read_chunk_size = v;
        }
        if let Some(v) = positive::<u32>(lookup(ENV_THUMBNAIL_SIZE)) {
            config.thumbnail_size = v;
        }
        if let Some(v) = positive::<usize>(lookup(ENV_NOTIFY_CAPACITY)) {
            config.notification_capacity = v;
        }
        match lookup(ENV_AUTOROTATE).as_deref().map(str::trim) {
            Some("0") | Some("false") | Some("no") => config.autorotate = false,
            Some("1") | Some("true") | Some("yes") => config.autorotate = true,
            _ => {}
        }
        config
    }

    pub fn with_read_chunk_size(mut self, bytes: usize) -> Self {
        self.read_chunk_size = bytes.max(1);
        self
    }

    pub fn with_thumbnail_size(mut self, size: u32) -> Self {
        self.thumbnail_size = size.max(1);
        self
    }

    pub fn with_notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity.max(1);
        self
    }

    pub fn with_autorotate(mut self, autorotate: bool) -> Self {
        self.autorotate = autorotate;
        self
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    pub fn with_limits(mut self, max_dimension: u32, max_pixels: u64) -> Self {
        self.max_dimension = max_dimension;
        self.max_pixels = max_pixels;
        self
    }
}

fn positive<T>(raw: Option<String>) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    raw.and_then(|s| s.trim().parse::<T>().ok())
        .filter(|v| *v > T::default())
}
