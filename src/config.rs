// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::path::{Path, PathBuf};

/// Engine configuration builder.
#[derive(Clone, Debug)]
pub struct Config {
    #[doc(hidden)]
    pub path: PathBuf,

    /// When true, an extraction pass's outputs share two concatenated
    /// files (one for retained fragments, one for extracted ones) instead
    /// of each getting a fresh file.
    pub do_concat: bool,

    /// Minimum overlap fraction, against the base snapshot's size, required
    /// for a candidate's overlap to actually be lifted. Also governs the
    /// per-candidate filter pre-screen and the small-write skip.
    pub extract_thres: f32,
}

impl Config {
    #[must_use]
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().into(),
            do_concat: false,
            extract_thres: 0.0,
        }
    }

    #[must_use]
    pub fn do_concat(mut self, do_concat: bool) -> Self {
        self.do_concat = do_concat;
        self
    }

    /// Negative thresholds have no sensible meaning under the engine's
    /// overlap comparisons, so they're clamped to zero.
    #[must_use]
    pub fn extract_thres(mut self, extract_thres: f32) -> Self {
        self.extract_thres = extract_thres.max(0.0);
        self
    }

    pub fn open(self) -> crate::error::Result<crate::engine::Engine> {
        crate::engine::Engine::open(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn negative_threshold_is_clamped_to_zero() {
        let config = Config::new("/tmp/x").extract_thres(-0.5);
        assert_eq!(config.extract_thres, 0.0);
    }

    #[test]
    fn builder_sets_do_concat() {
        let config = Config::new("/tmp/x").do_concat(true);
        assert!(config.do_concat);
    }
}
