// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

// Thin façade fanning calls out to one engine per embedding table, indexed
// by position in the path list passed to `MultiEngine::open`.

use std::path::Path;

use crate::config::Config;
use crate::engine::{CheckpointFile, Engine};
use crate::error::{Error, Result};

/// Opens and indexes one [`Engine`] per path.
pub struct MultiEngine {
    engines: Vec<Engine>,
}

impl MultiEngine {
    /// Opens one engine per entry in `paths`, all sharing the same
    /// `do_concat`/`extract_thres` configuration.
    pub fn open<P: AsRef<Path>>(paths: &[P], do_concat: bool, extract_thres: f32) -> Result<Self> {
        let engines = paths
            .iter()
            .map(|path| {
                Config::new(path)
                    .do_concat(do_concat)
                    .extract_thres(extract_thres)
                    .open()
            })
            .collect::<Result<Vec<_>>>()?;

        log::debug!("opened {} engines", engines.len());

        Ok(Self { engines })
    }

    fn engine(&self, index: usize) -> Result<&Engine> {
        self.engines
            .get(index)
            .ok_or_else(|| Error::NotFound(format!("engine index {index}")))
    }

    pub fn next_file_number(&self, index: usize) -> Result<u64> {
        Ok(self.engine(index)?.next_file_number())
    }

    pub fn join(&self, index: usize, keys: &[u32], file_number: u64, length: u64) -> Result<()> {
        self.engine(index)?.join(keys, file_number, length)
    }

    pub fn get_checkpoint_files(
        &self,
        index: usize,
        version: u32,
    ) -> Result<Vec<CheckpointFile>> {
        self.engine(index)?.get_checkpoint_files(version)
    }

    pub fn delete_checkpoints_before(&self, index: usize, version: u32) -> Result<()> {
        self.engine(index)?.delete_checkpoints_before(version)
    }

    /// Closes every engine, consuming the façade.
    pub fn release(self) {
        for engine in self.engines {
            engine.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DefaultCodec, PayloadCodec};
    use crate::fs::make_file_name;
    use test_log::test;

    #[test]
    fn dispatches_by_index() -> Result<()> {
        let dir_a = tempfile::tempdir()?;
        let dir_b = tempfile::tempdir()?;

        let multi = MultiEngine::open(&[dir_a.path(), dir_b.path()], false, 0.0)?;

        let map: crate::codec::PayloadMap = [(1u32, vec![1.0])].into_iter().collect();
        let bytes = DefaultCodec::pack(&map);
        std::fs::write(make_file_name(dir_a.path(), 1, "tdc"), &bytes)?;

        multi.join(0, &[1], 1, bytes.len() as u64)?;

        let files = multi.get_checkpoint_files(0, 0)?;
        assert_eq!(files.len(), 1);

        assert!(multi.get_checkpoint_files(1, 0).is_err());

        Ok(())
    }

    #[test]
    fn unknown_index_is_not_found() {
        let multi = MultiEngine { engines: Vec::new() };
        assert!(multi.next_file_number(0).is_err());
    }
}
