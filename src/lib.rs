// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An incremental checkpoint storage engine for embedding tables.
//!
//! Training loops periodically snapshot a large integer-keyed embedding
//! table. Naively, every snapshot duplicates whatever fraction of the table
//! didn't change since the last one. This crate stores each snapshot as a
//! versioned column in a small on-disk index and runs a background pass
//! that extracts the key overlap between a new snapshot and older ones, so
//! that reconstructing any past version only requires reading the
//! fragments that are actually unique to it.
//!
//! # Example usage
//!
//! ```
//! use tdchunk::{Config, codec::{DefaultCodec, PayloadCodec}};
//! # let dir = tempfile::tempdir()?;
//!
//! let engine = Config::new(dir.path()).open()?;
//!
//! let map: std::collections::BTreeMap<u32, Vec<f64>> =
//!     [(1u32, vec![1.0]), (2, vec![2.0])].into_iter().collect();
//! let bytes = DefaultCodec::pack(&map);
//! std::fs::write(dir.path().join("000001.tdc"), &bytes)?;
//!
//! engine.join(&[1, 2], 1, bytes.len() as u64)?;
//!
//! let files = engine.get_checkpoint_files(0)?;
//! assert_eq!(files.len(), 1);
//! #
//! # Ok::<(), tdchunk::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]

pub mod bloom;
pub mod codec;
mod config;
mod descriptor;
mod engine;
pub mod error;
mod extraction;
mod file;
pub mod fs;
mod index;
mod manifest;
mod multi;
mod worker;

pub use codec::{DefaultCodec, PayloadCodec, PayloadMap};
pub use config::Config;
pub use descriptor::{Descriptor, Tag};
pub use engine::{CheckpointFile, Engine};
pub use error::{Error, Result};
pub use multi::MultiEngine;
