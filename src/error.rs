// src/error.rs
//
// Unified error handling for lazy-viewer
// Uses thiserror for simple, type-safe error handling
//
// Error Taxonomy:
// - Vfs: opening/reading/writing/querying a file failed
// - NotLoaded: the operation needs decoded data that isn't present
// - FileExists: destination collision without overwrite permission
// - TempFileFailed: no scratch space for an atomic save
// - Generic: decode/transform/encode failure without a more specific cause
// - TrashNotFound: no trash directory backs delete-to-trash
// - NotSupported: metadata requested from a container we cannot read

use std::borrow::Cow;
use thiserror::Error;

/// Error taxonomy used by the UI layer to pick a message and a recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// I/O failure opening/reading/writing/querying a file
    Vfs,
    /// Operation needs decoded data that isn't present
    NotLoaded,
    /// Destination collision without overwrite permission
    FileExists,
    /// No writable scratch space for an atomic save
    TempFileFailed,
    /// Decode/transform/encode failure with no more specific cause
    Generic,
    /// No backing trash implementation for delete-to-trash
    TrashNotFound,
    /// EXIF requested on a container format we do not recognize
    NotSupported,
}

/// lazy-viewer error types
#[derive(Debug, Error)]
pub enum ViewerError {
    // File System Errors
    #[error("File not found: {path}")]
    FileNotFound { path: Cow<'static, str> },

    #[error("Failed to read file '{path}': {source}")]
    FileReadFailed {
        path: Cow<'static, str>,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to query file '{path}': {source}")]
    FileQueryFailed {
        path: Cow<'static, str>,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    FileWriteFailed {
        path: Cow<'static, str>,
        #[source]
        source: std::io::Error,
    },

    // State Errors
    #[error("Image '{path}' has no decoded data")]
    NotLoaded { path: Cow<'static, str> },

    #[error("File '{path}' already exists")]
    FileExists { path: Cow<'static, str> },

    #[error("Could not create a temporary file in '{dir}': {source}")]
    TempFileFailed {
        dir: Cow<'static, str>,
        #[source]
        source: std::io::Error,
    },

    #[error("No trash directory available for '{path}'")]
    TrashNotFound { path: Cow<'static, str> },

    #[error("{what} is not supported for this file format")]
    NotSupported { what: Cow<'static, str> },

    // Codec Errors
    #[error("Unsupported image format: {format}")]
    UnsupportedFormat { format: Cow<'static, str> },

    #[error("Failed to decode image: {message}")]
    DecodeFailed { message: Cow<'static, str> },

    #[error("Failed to encode as {format}: {message}")]
    EncodeFailed {
        format: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    // Size Limit Errors
    #[error("Image dimension {dimension} exceeds maximum {max}")]
    DimensionExceedsLimit { dimension: u32, max: u32 },

    #[error("Image pixel count {pixels} exceeds maximum {max}")]
    PixelCountExceedsLimit { pixels: u64, max: u64 },

    // Internal Errors
    #[error("Internal error: {message}")]
    InternalPanic { message: Cow<'static, str> },

    // Generic Error
    #[error("{message}")]
    Generic { message: Cow<'static, str> },
}

fn clone_io(source: &std::io::Error) -> std::io::Error {
    std::io::Error::new(source.kind(), source.to_string())
}

impl Clone for ViewerError {
    fn clone(&self) -> Self {
        match self {
            Self::FileNotFound { path } => Self::FileNotFound { path: path.clone() },
            Self::FileReadFailed { path, source } => Self::FileReadFailed {
                path: path.clone(),
                source: clone_io(source),
            },
            Self::FileQueryFailed { path, source } => Self::FileQueryFailed {
                path: path.clone(),
                source: clone_io(source),
            },
            Self::FileWriteFailed { path, source } => Self::FileWriteFailed {
                path: path.clone(),
                source: clone_io(source),
            },
            Self::NotLoaded { path } => Self::NotLoaded { path: path.clone() },
            Self::FileExists { path } => Self::FileExists { path: path.clone() },
            Self::TempFileFailed { dir, source } => Self::TempFileFailed {
                dir: dir.clone(),
                source: clone_io(source),
            },
            Self::TrashNotFound { path } => Self::TrashNotFound { path: path.clone() },
            Self::NotSupported { what } => Self::NotSupported { what: what.clone() },
            Self::UnsupportedFormat { format } => Self::UnsupportedFormat {
                format: format.clone(),
            },
            Self::DecodeFailed { message } => Self::DecodeFailed {
                message: message.clone(),
            },
            Self::EncodeFailed { format, message } => Self::EncodeFailed {
                format: format.clone(),
                message: message.clone(),
            },
            Self::DimensionExceedsLimit { dimension, max } => Self::DimensionExceedsLimit {
                dimension: *dimension,
                max: *max,
            },
            Self::PixelCountExceedsLimit { pixels, max } => Self::PixelCountExceedsLimit {
                pixels: *pixels,
                max: *max,
            },
            Self::InternalPanic { message } => Self::InternalPanic {
                message: message.clone(),
            },
            Self::Generic { message } => Self::Generic {
                message: message.clone(),
            },
        }
    }
}

// Constructor Helpers
impl ViewerError {
    /// Map an `open()` failure: a missing file gets its own variant.
    pub fn from_open(path: impl Into<Cow<'static, str>>, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::file_not_found(path)
        } else {
            Self::file_read_failed(path, source)
        }
    }

    pub fn file_not_found(path: impl Into<Cow<'static, str>>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    pub fn file_read_failed(path: impl Into<Cow<'static, str>>, source: std::io::Error) -> Self {
        Self::FileReadFailed {
            path: path.into(),
            source,
        }
    }

    pub fn file_query_failed(path: impl Into<Cow<'static, str>>, source: std::io::Error) -> Self {
        Self::FileQueryFailed {
            path: path.into(),
            source,
        }
    }

    pub fn file_write_failed(path: impl Into<Cow<'static, str>>, source: std::io::Error) -> Self {
        Self::FileWriteFailed {
            path: path.into(),
            source,
        }
    }

    pub fn not_loaded(path: impl Into<Cow<'static, str>>) -> Self {
        Self::NotLoaded { path: path.into() }
    }

    pub fn file_exists(path: impl Into<Cow<'static, str>>) -> Self {
        Self::FileExists { path: path.into() }
    }

    pub fn temp_file_failed(dir: impl Into<Cow<'static, str>>, source: std::io::Error) -> Self {
        Self::TempFileFailed {
            dir: dir.into(),
            source,
        }
    }

    pub fn trash_not_found(path: impl Into<Cow<'static, str>>) -> Self {
        Self::TrashNotFound { path: path.into() }
    }

    pub fn not_supported(what: impl Into<Cow<'static, str>>) -> Self {
        Self::NotSupported { what: what.into() }
    }

    pub fn unsupported_format(format: impl Into<Cow<'static, str>>) -> Self {
        Self::UnsupportedFormat {
            format: format.into(),
        }
    }

    pub fn decode_failed(message: impl Into<Cow<'static, str>>) -> Self {
        Self::DecodeFailed {
            message: message.into(),
        }
    }

    pub fn encode_failed(
        format: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::EncodeFailed {
            format: format.into(),
            message: message.into(),
        }
    }

    pub fn dimension_exceeds_limit(dimension: u32, max: u32) -> Self {
        Self::DimensionExceedsLimit { dimension, max }
    }

    pub fn pixel_count_exceeds_limit(pixels: u64, max: u64) -> Self {
        Self::PixelCountExceedsLimit { pixels, max }
    }

    pub fn internal_panic(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InternalPanic {
            message: message.into(),
        }
    }

    pub fn generic(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Generic {
            message: message.into(),
        }
    }

    /// Check if the user can do something about this error
    /// (fix a path, free disk space, allow overwriting, ...).
    pub fn is_recoverable(&self) -> bool {
        match self.category() {
            ErrorCategory::Vfs
            | ErrorCategory::FileExists
            | ErrorCategory::TempFileFailed
            | ErrorCategory::TrashNotFound => true,
            ErrorCategory::NotLoaded | ErrorCategory::Generic | ErrorCategory::NotSupported => {
                false
            }
        }
    }

    /// Get the error category for this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::FileNotFound { .. }
            | Self::FileReadFailed { .. }
            | Self::FileQueryFailed { .. }
            | Self::FileWriteFailed { .. } => ErrorCategory::Vfs,

            Self::NotLoaded { .. } => ErrorCategory::NotLoaded,
            Self::FileExists { .. } => ErrorCategory::FileExists,
            Self::TempFileFailed { .. } => ErrorCategory::TempFileFailed,
            Self::TrashNotFound { .. } => ErrorCategory::TrashNotFound,
            Self::NotSupported { .. } => ErrorCategory::NotSupported,

            // Size limits surface as decode failures to the viewer.
            Self::UnsupportedFormat { .. }
            | Self::DecodeFailed { .. }
            | Self::EncodeFailed { .. }
            | Self::DimensionExceedsLimit { .. }
            | Self::PixelCountExceedsLimit { .. }
            | Self::InternalPanic { .. }
            | Self::Generic { .. } => ErrorCategory::Generic,
        }
    }
}

impl ErrorCategory {
    /// Get string representation of error category
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Vfs => "Vfs",
            ErrorCategory::NotLoaded => "NotLoaded",
            ErrorCategory::FileExists => "FileExists",
            ErrorCategory::TempFileFailed => "TempFileFailed",
            ErrorCategory::Generic => "Generic",
            ErrorCategory::TrashNotFound => "TrashNotFound",
            ErrorCategory::NotSupported => "NotSupported",
        }
    }
}

// Result type alias
pub type Result<T> = std::result::Result<T, ViewerError>;
