// src/engine/io.rs
//
// File system collaborators: ICC sanity checks, atomic replace,
// attribute preservation, copy with progress and delete-to-trash.

use crate::engine::common::EngineResult;
use crate::error::ViewerError;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Validate ICC profile header
/// ICC profiles must start with a 128-byte header containing specific fields
pub fn validate_icc_profile(icc_data: &[u8]) -> bool {
    // Minimum ICC profile size is 128 bytes (header)
    if icc_data.len() < 128 {
        return false;
    }

    // Profile size field (bytes 0-3, big-endian) must match the data length
    let profile_size =
        u32::from_be_bytes([icc_data[0], icc_data[1], icc_data[2], icc_data[3]]) as usize;
    if profile_size != icc_data.len() {
        return false;
    }

    // Major version should be reasonable (typically 2, 4, or 5)
    if icc_data[8] > 10 {
        return false;
    }

    // CMM type (4-7), profile class (12-15), data color space (16-19) and
    // PCS (20-23) are four-character signatures
    let signature_ok = |range: std::ops::Range<usize>| {
        icc_data[range]
            .iter()
            .all(|&byte| (32..=126).contains(&byte) || byte == 0)
    };
    signature_ok(4..8) && signature_ok(12..16) && signature_ok(16..20) && signature_ok(20..24)
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

/// Directory a temp file for `path` goes into, so rename() stays on one
/// file system.
fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Resolve `path` even when it does not exist yet (through its parent).
fn canonical_target(path: &Path) -> Option<PathBuf> {
    if let Ok(resolved) = fs::canonicalize(path) {
        return Some(resolved);
    }
    let name = path.file_name()?;
    fs::canonicalize(parent_dir(path))
        .ok()
        .map(|dir| dir.join(name))
}

fn is_same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), canonical_target(b)) {
        (Ok(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Copy mode (and owner/group on Unix) from `src` onto `dst`.
pub(crate) fn preserve_attributes(src: &Path, dst: &Path) -> std::io::Result<()> {
    let meta = fs::metadata(src)?;
    fs::set_permissions(dst, meta.permissions())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        std::os::unix::fs::chown(dst, Some(meta.uid()), Some(meta.gid()))?;
    }
    Ok(())
}

/// Write `data` to `dest` atomically.
///
/// The bytes go to a temp file in the destination directory which is then
/// renamed over `dest`. Without `overwrite` an existing destination is left
/// alone and `FileExists` is returned. When `attributes_from` is given, its
/// mode and ownership are copied onto the new file first.
pub fn write_atomic(
    dest: &Path,
    data: &[u8],
    overwrite: bool,
    attributes_from: Option<&Path>,
) -> EngineResult<()> {
    if !overwrite && dest.exists() {
        return Err(ViewerError::file_exists(display(dest)));
    }

    let dir = parent_dir(dest);
    let mut temp_file = NamedTempFile::new_in(dir)
        .map_err(|e| ViewerError::temp_file_failed(display(dir), e))?;
    let temp_path = temp_file.path().to_path_buf();

    temp_file
        .write_all(data)
        .map_err(|e| ViewerError::file_write_failed(display(&temp_path), e))?;
    temp_file
        .as_file_mut()
        .sync_all()
        .map_err(|e| ViewerError::file_write_failed(display(&temp_path), e))?;

    if let Some(src) = attributes_from {
        if let Err(e) = preserve_attributes(src, &temp_path) {
            tracing::warn!(path = %dest.display(), error = %e, "could not preserve file attributes");
        }
    }

    // tempfile removes the temp file if persisting fails
    let persisted = if overwrite {
        temp_file.persist(dest)
    } else {
        temp_file.persist_noclobber(dest)
    };
    persisted.map_err(|e| {
        if e.error.kind() == ErrorKind::AlreadyExists {
            ViewerError::file_exists(display(dest))
        } else {
            ViewerError::file_write_failed(display(dest), e.error)
        }
    })?;
    tracing::debug!(path = %dest.display(), bytes = data.len(), "file written");
    Ok(())
}

/// Byte-copy `src` to `dest` (overwriting), reporting the copied fraction.
/// Returns the number of bytes copied.
///
/// The bytes go through a temp file next to `dest`, so a failed copy leaves
/// an existing destination untouched. Copying a file onto itself is refused.
pub fn copy_with_progress(
    src: &Path,
    dest: &Path,
    chunk_size: usize,
    mut on_progress: impl FnMut(f32),
) -> EngineResult<u64> {
    let mut input = File::open(src).map_err(|e| ViewerError::from_open(display(src), e))?;
    let total = input
        .metadata()
        .map_err(|e| ViewerError::file_query_failed(display(src), e))?
        .len();
    if is_same_file(src, dest) {
        return Err(ViewerError::generic(format!(
            "'{}' cannot be copied onto itself",
            display(src)
        )));
    }

    let dir = parent_dir(dest);
    let mut output = NamedTempFile::new_in(dir)
        .map_err(|e| ViewerError::temp_file_failed(display(dir), e))?;

    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut copied = 0u64;
    loop {
        let n = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(ViewerError::file_read_failed(display(src), e)),
        };
        output
            .write_all(&buf[..n])
            .map_err(|e| ViewerError::file_write_failed(display(dest), e))?;
        copied += n as u64;
        if total > 0 {
            on_progress((copied as f64 / total as f64).min(1.0) as f32);
        }
    }
    output
        .as_file_mut()
        .sync_all()
        .map_err(|e| ViewerError::file_write_failed(display(dest), e))?;
    if let Err(e) = preserve_attributes(src, output.path()) {
        tracing::debug!(path = %dest.display(), error = %e, "copied file keeps default attributes");
    }
    output
        .persist(dest)
        .map_err(|e| ViewerError::file_write_failed(display(dest), e.error))?;
    on_progress(1.0);
    Ok(copied)
}

// =============================================================================
// TRASH
// =============================================================================

/// The user's home trash on freedesktop systems (`$XDG_DATA_HOME/Trash`).
/// Other platforms keep their trash out of reach of the file system API.
pub fn home_trash() -> Option<PathBuf> {
    if cfg!(all(unix, not(target_os = "macos"), not(target_os = "ios"))) {
        dirs::data_dir().map(|dir| dir.join("Trash"))
    } else {
        None
    }
}

/// Move `path` into the platform trash.
///
/// Fails with `TrashNotFound` when the platform refuses to trash the file
/// (no trash for its volume, no trash service).
pub fn move_to_trash(path: &Path) -> EngineResult<()> {
    if !path.exists() {
        return Err(ViewerError::file_not_found(display(path)));
    }
    trash::delete(path).map_err(|e| {
        tracing::warn!(path = %path.display(), error = %e, "trash refused the file");
        ViewerError::trash_not_found(display(path))
    })?;
    tracing::info!(path = %path.display(), trash = ?home_trash(), "moved to trash");
    Ok(())
}
