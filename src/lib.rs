// lib.rs
//
// lazy-viewer: background job engine and image entity state machine for a
// desktop image viewer.
//
// Design goals:
// - The UI thread never blocks on file or codec work
// - One worker thread, so job bodies never race each other
// - Decoded data is loaded lazily and released when nobody needs it
// - Results reach the UI thread only through a notification channel

pub mod engine;
pub mod error;
pub mod ops;

pub use engine::{
    EngineConfig, Image, ImageCollection, ImageStatus, Job, JobKind, JobQueue, MainContext,
    Notification, SaveAsTarget, UriConverter,
};
pub use error::{ErrorCategory, Result, ViewerError};
pub use ops::{DataMask, Transform};
