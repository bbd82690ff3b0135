// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

// File system primitives: path composition and the handful of directory
// operations the engine needs (create, exists, unlink, list).

use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// Composes the path of a fragment file `<number>.<suffix>` inside `dir`,
/// zero-padded to 6 digits (e.g. `000001.tdc`).
#[must_use]
pub fn make_file_name(dir: &Path, number: u64, suffix: &str) -> PathBuf {
    dir.join(format!("{number:06}.{suffix}"))
}

/// Creates `dir` and all missing parents. No-op if it already exists.
pub fn create_dir_all(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    Ok(())
}

/// Returns `true` if `path` exists.
pub fn exists(path: &Path) -> bool {
    path.try_exists().unwrap_or(false)
}

/// Removes a file. No-op (not an error) if it is already gone.
pub fn delete_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Lists the file names directly inside `dir`.
pub fn list_dir(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_owned());
        }
    }

    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn composes_zero_padded_name() {
        let dir = Path::new("/tmp/db");
        assert_eq!(
            make_file_name(dir, 7, "tdc"),
            PathBuf::from("/tmp/db/000007.tdc")
        );
        assert_eq!(
            make_file_name(dir, 123_456, "tdc"),
            PathBuf::from("/tmp/db/123456.tdc")
        );
    }

    #[test]
    fn create_and_list_dir() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let sub = tmp.path().join("nested/child");
        create_dir_all(&sub)?;
        assert!(exists(&sub));

        fs::write(sub.join("a.tdc"), b"hello")?;
        let names = list_dir(&sub)?;
        assert_eq!(names, vec!["a.tdc".to_owned()]);

        delete_file(&sub.join("a.tdc"))?;
        assert!(list_dir(&sub)?.is_empty());

        // deleting again is a no-op
        delete_file(&sub.join("a.tdc"))?;

        Ok(())
    }
}
