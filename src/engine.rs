// src/engine.rs
//
// The core of lazy-viewer. A background job engine that:
// 1. Queues open/thumbnail/rotate/save/copy work in six priority lanes
// 2. Drains them one job at a time on a single worker thread
// 3. Posts progress and completion back to the UI thread over a channel
//
// This file is a facade over the modules in engine/

// =============================================================================
// SECURITY LIMITS
// =============================================================================

/// Maximum allowed image dimension (width or height).
/// Images larger than 32768x32768 are rejected to prevent decompression bombs.
pub const MAX_DIMENSION: u32 = 32768;

/// Maximum allowed total pixels (width * height).
/// 100 megapixels = 400MB uncompressed RGBA.
pub const MAX_PIXELS: u64 = 100_000_000;

// =============================================================================
// MODULE DECOMPOSITION
// =============================================================================

mod collection;
mod common;
mod config;
mod converter;
mod decoder;
mod encoder;
mod image;
mod io;
mod job;
mod loader;
mod metadata;
mod notify;
mod queue;
mod tasks;
mod thumbnail;

pub use collection::ImageCollection;
pub use common::{run_with_panic_policy, EngineResult};
pub use config::EngineConfig;
pub use converter::{CaseConversion, UriConverter};
pub use decoder::{
    check_dimensions, DecodeLimits, DecodeOutcome, DecoderFactory, PixelDecoder, StandardDecoders,
};
pub use encoder::{embed_metadata, encode, EmbeddedMetadata};
pub use self::image::{DataRef, Image, ImageStatus, LoadOutcome, MetadataStatus};
pub use io::{copy_with_progress, home_trash, move_to_trash, validate_icc_profile, write_atomic};
pub use job::{
    Job, JobContext, JobId, JobKind, JobState, Lane, ModelOutput, SaveAsTarget, SaveCursor,
};
pub use metadata::{
    raw_exif_orientation, reset_raw_exif_orientation, ContainerKind, ImageMetadata,
    MetadataReader,
};
pub use notify::{channel, MainContext, Notification, Notifier};
pub use queue::JobQueue;
pub use thumbnail::make_thumbnail;
