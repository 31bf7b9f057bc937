// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Atomic file writes.
//!
//! Every file komodoenv generates is first written to a temporary file that
//! lives in the same directory as its final destination. Once fully written,
//! flushed, and given its final permissions, the temporary file is renamed
//! over the destination. Readers only ever see the old file or the new one.

use std::{
    fs::Permissions,
    io::Write,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tracing::{debug, instrument};

/// Permissions of regular generated files.
pub const FILE_MODE: u32 = 0o644;

/// Permissions of generated executables.
pub const EXEC_MODE: u32 = 0o755;

/// Atomically replace file at `path` with `contents`.
///
/// # Errors
///
/// - Return [`FileError`] naming the target path if any step fails. The
///   target is left untouched in that case.
#[instrument(skip(path, contents), level = "debug")]
pub fn write_atomic(path: impl AsRef<Path>, contents: impl AsRef<[u8]>, mode: u32) -> Result<()> {
    let path = path.as_ref();
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let wrap = |source: std::io::Error| FileError {
        source,
        path: path.to_path_buf(),
    };

    debug!("write {:?}", path.display());
    let mut file = NamedTempFile::new_in(parent).map_err(wrap)?;
    file.write_all(contents.as_ref()).map_err(wrap)?;
    file.as_file().sync_all().map_err(wrap)?;
    file.as_file()
        .set_permissions(Permissions::from_mode(mode))
        .map_err(wrap)?;
    file.persist(path).map_err(|err| wrap(err.error))?;

    Ok(())
}

/// Generated file cannot be written.
#[derive(Debug, thiserror::Error)]
#[error("failed to write {:?}", path.display())]
pub struct FileError {
    #[source]
    pub source: std::io::Error,
    pub path: PathBuf,
}

/// Friendly result alias :3
pub type Result<T, E = FileError> = std::result::Result<T, E>;
