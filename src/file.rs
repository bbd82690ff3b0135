// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

// Atomic whole-file rewrite, used for the manifest truncate-and-reemit cycle.
//
// Truncating the manifest in place leaves a window where a crash observes
// an empty or partially-written manifest. We instead write to a sibling
// temp file, fsync it, and rename it over the target - the rename is atomic
// on the platforms this crate targets.

use std::io::Write;
use std::path::Path;

/// Atomically rewrites `path` to contain exactly `content`.
pub fn rewrite_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let folder = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut temp_file = tempfile::NamedTempFile::new_in(folder)?;
    temp_file.write_all(content)?;
    temp_file.flush()?;
    temp_file.as_file_mut().sync_all()?;
    temp_file.persist(path).map_err(|e| e.error)?;

    Ok(())
}
