// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

// The per-embedding-table engine: manifest recovery on open, the public
// join/read/delete operations, and dispatch of background extraction to a
// dedicated worker thread shared across the engine's lifetime.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::bloom;
use crate::codec::DefaultCodec;
use crate::config::Config;
use crate::descriptor::{Descriptor, Tag};
use crate::error::{Error, Result};
use crate::extraction::{self, ExtractionConfig};
use crate::fs::{create_dir_all, delete_file, exists, make_file_name};
use crate::index::VersionIndex;
use crate::manifest::{self, Manifest};
use crate::worker::Worker;

struct EngineState {
    dir: PathBuf,
    filter_path: PathBuf,
    filter_file: File,
    manifest: Manifest,
    index: VersionIndex,
    merged_refs: HashMap<u64, u64>,
    do_concat: bool,
    extract_thres: f32,
}

impl EngineState {
    fn rewrite_manifest(&mut self) -> Result<()> {
        let descriptors: Vec<Descriptor> = self.index.all_descriptors().cloned().collect();
        self.manifest.rewrite(&descriptors, &self.merged_refs)
    }
}

/// Fragment location returned by [`Engine::get_checkpoint_files`]: a byte
/// range inside some `.tdc` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointFile {
    pub path: PathBuf,
    pub start: u64,
    pub length: u64,
}

/// A single embedding table's checkpoint storage.
pub struct Engine {
    state: Arc<Mutex<EngineState>>,
    worker: Worker,
}

impl Engine {
    pub fn open(config: Config) -> Result<Self> {
        create_dir_all(&config.path)?;

        let filter_path = config.path.join("filter");
        let manifest_path = config.path.join("manifest");

        let filter_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&filter_path)?;

        let (index, merged_refs) = if exists(&manifest_path) {
            let replayed = manifest::replay(&manifest_path)?;
            let descriptor_count = replayed.descriptors.len();
            let index = VersionIndex::rebuild(replayed.descriptors)?;
            log::debug!(
                "opened {:?}: replayed {descriptor_count} descriptors into {} columns",
                config.path,
                index.column_count()
            );
            (index, replayed.merged_refs)
        } else {
            log::debug!("opened {:?}: fresh engine, no manifest found", config.path);
            (VersionIndex::default(), HashMap::new())
        };

        let manifest = Manifest::open(manifest_path)?;

        let state = EngineState {
            dir: config.path.clone(),
            filter_path,
            filter_file,
            manifest,
            index,
            merged_refs,
            do_concat: config.do_concat,
            extract_thres: config.extract_thres,
        };

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            worker: Worker::new(),
        })
    }

    /// Returns a fresh, monotonically-increasing file number for the caller
    /// to pack a payload file into before calling [`Engine::join`].
    pub fn next_file_number(&self) -> u64 {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let mut state = self.state.lock().expect("engine lock is poisoned");
        state.index.next_file_number()
    }

    /// Registers a freshly-written snapshot and runs background extraction
    /// against it. `keys` must be sorted ascending; the caller has already
    /// written `<file_number>.tdc` (`length` bytes) into the engine's
    /// directory.
    pub fn join(&self, keys: &[u32], file_number: u64, length: u64) -> Result<()> {
        if keys.is_empty() {
            return Err(Error::InvariantViolation(
                "join requires at least one key".into(),
            ));
        }

        let base_keys = keys.to_vec();
        let base_column;

        {
            #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
            let mut state = self.state.lock().expect("engine lock is poisoned");

            let filter_bytes = bloom::create_filter(keys);
            let filter_start = state.filter_file.metadata()?.len();
            state.filter_file.write_all(&filter_bytes)?;
            state.filter_file.flush()?;

            #[expect(clippy::cast_possible_truncation)]
            let filter_length = filter_bytes.len() as u64;

            let smallest = keys[0];
            let largest = keys[keys.len() - 1];

            let mut descriptor = Descriptor::new_l0(
                file_number,
                length,
                smallest,
                largest,
                filter_start,
                filter_length,
            );

            base_column = state.index.add_l0_node(descriptor.clone());
            descriptor.column = base_column;

            state.manifest.append(&descriptor)?;

            log::debug!(
                "join: column {base_column} assigned to file {file_number}, {} keys",
                keys.len()
            );
        }

        let state = Arc::clone(&self.state);

        self.worker.submit(Box::new(move || {
            #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
            let mut state = state.lock().expect("engine lock is poisoned");

            let config = ExtractionConfig {
                do_concat: state.do_concat,
                extract_thres: state.extract_thres,
            };

            let filter_path = state.filter_path.clone();
            let dir = state.dir.clone();

            let EngineState {
                index,
                merged_refs,
                filter_file,
                ..
            } = &mut *state;

            let outcome = extraction::run::<DefaultCodec>(
                &dir,
                index,
                merged_refs,
                &filter_path,
                filter_file,
                config,
                base_column,
                &base_keys,
            )?;

            for path in &outcome.files_to_unlink {
                delete_file(path)?;
            }

            if outcome.did_any_work {
                log::debug!("extraction pass on column {base_column} lifted overlap");
                state.rewrite_manifest()?;
            } else {
                log::trace!("extraction pass on column {base_column} found nothing to lift");
            }

            Ok(())
        }))
    }

    /// Returns the `(path, start, length)` triples whose concatenated
    /// contents reconstruct `version`.
    pub fn get_checkpoint_files(&self, version: u32) -> Result<Vec<CheckpointFile>> {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let state = self.state.lock().expect("engine lock is poisoned");

        let descriptors = state.index.get_version(version)?;

        Ok(descriptors
            .into_iter()
            .filter(|d| d.tag != Tag::Flag)
            .map(|d| CheckpointFile {
                path: make_file_name(&state.dir, d.number, "tdc"),
                start: d.start,
                length: d.length,
            })
            .collect())
    }

    /// Discards every snapshot at or before `version`, unlinking standalone
    /// files and decrementing reference counts of concatenated ones.
    pub fn delete_checkpoints_before(&self, version: u32) -> Result<()> {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let mut state = self.state.lock().expect("engine lock is poisoned");

        let discarded = state.index.delete_version(version)?;

        let mut unlinked = 0u32;
        let mut decremented = 0u32;

        for d in discarded {
            match d.tag {
                Tag::New => {
                    delete_file(&make_file_name(&state.dir, d.number, "tdc"))?;
                    unlinked += 1;
                }
                Tag::Merged => {
                    decremented += 1;
                    let refcount = state.merged_refs.entry(d.number).or_insert(0);
                    *refcount = refcount.saturating_sub(1);
                    if *refcount == 0 {
                        state.merged_refs.remove(&d.number);
                        delete_file(&make_file_name(&state.dir, d.number, "tdc"))?;
                    }
                }
                _ => {}
            }
        }

        log::debug!(
            "delete_checkpoints_before({version}): unlinked {unlinked} standalone files, decremented {decremented} merged refs"
        );

        state.rewrite_manifest()
    }

    /// Administrative: concatenates every standalone fragment at the same
    /// depth across columns `[start, end]` into one shared file. Must not
    /// be called while a `join` is outstanding.
    pub fn merge(&self, start: u32, end: u32) -> Result<()> {
        #[expect(clippy::expect_used, reason = "lock is expected to not be poisoned")]
        let mut state = self.state.lock().expect("engine lock is poisoned");

        let groups = state.index.merge_columns(start, end);
        if groups.is_empty() {
            return Ok(());
        }

        for group in groups {
            let first = &group[0];
            let first_path = make_file_name(&state.dir, first.number, "tdc");

            let mut shared = OpenOptions::new().append(true).open(&first_path)?;

            for member in &group[1..] {
                let member_path = make_file_name(&state.dir, member.number, "tdc");
                let mut bytes = Vec::new();
                File::open(&member_path)?.read_to_end(&mut bytes)?;

                let new_start = shared.metadata()?.len();
                shared.write_all(&bytes)?;

                let mut updated = member.clone();
                updated.tag = Tag::Merged;
                updated.number = first.number;
                updated.start = new_start;
                state
                    .index
                    .update_descriptor(member.column, member.level, updated)?;

                delete_file(&member_path)?;
            }

            let mut updated_first = first.clone();
            updated_first.tag = Tag::Merged;
            state
                .index
                .update_descriptor(first.column, first.level, updated_first)?;

            #[expect(clippy::cast_possible_truncation)]
            state
                .merged_refs
                .insert(first.number, group.len() as u64);
        }

        log::debug!("merge({start}, {end}) completed");

        state.rewrite_manifest()
    }

    /// Closes the engine, joining its background thread. `join` already
    /// blocks until its extraction pass completes, so this never waits on
    /// outstanding work - it only exists to give callers an explicit,
    /// discoverable teardown point. Equivalent to dropping the handle.
    pub fn close(self) {}
}
